//! Shared fixtures for integration tests: fake capture devices, a fake host
//! and a dispatcher wired over an in-memory credential store and a temp proof root.
#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use sentinel::clock::ManualClock;
use sentinel::config::derive_token_key;
use sentinel::connection::ConnectionId;
use sentinel::identity::{AuthSessionManager, AuthState, MemoryCredentialStore};
use sentinel::keylog::{KeyLogRegistry, KeySink, KeySource};
use sentinel::media::{CameraDevice, CameraSlot, CameraStream, CaptureError, ProofStore, ScreenCapture, WebcamStreamManager};
use sentinel::server::commands::{Command, Event, StatusKind};
use sentinel::server::dispatcher::{DispatchSettings, Dispatcher, Services};
use sentinel::server::hub::ConnectionHub;
use sentinel::system::{ProcessEntry, SystemControl};

pub const MASTER: &str = "X9";
pub const TOKEN_TTL_SECS: i64 = 3600;
pub const GRANT_TTL_SECS: i64 = 600;
pub const START_TIME: i64 = 1_700_000_000;

pub fn local_peer() -> IpAddr { IpAddr::V4(Ipv4Addr::LOCALHOST) }

pub fn remote_peer() -> IpAddr { IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)) }

/// Encoded frame `n`: a minimal JPEG-shaped payload.
pub fn frame(n: usize) -> Vec<u8> {
    let mut f = vec![0xFF, 0xD8];
    f.extend_from_slice(&(n as u32).to_be_bytes());
    f.extend_from_slice(&[0xFF, 0xD9]);
    f
}

#[derive(Default)]
struct CameraCounters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    live: AtomicUsize,
}

/// Camera that yields a numbered frame on every read.
#[derive(Clone, Default)]
pub struct FakeCamera {
    counters: Arc<CameraCounters>,
    fail: Arc<AtomicBool>,
    open_delay: Option<Duration>,
    /// Frames each stream yields before reporting the end of the device.
    frame_limit: Option<usize>,
}

impl FakeCamera {
    pub fn new() -> Self { Self::default() }

    pub fn failing() -> Self {
        let cam = Self::default();
        cam.fail.store(true, Ordering::SeqCst);
        cam
    }

    pub fn with_open_delay(delay: Duration) -> Self { Self { open_delay: Some(delay), ..Self::default() } }

    /// Opens slowly and then fails.
    pub fn failing_after(delay: Duration) -> Self { Self { open_delay: Some(delay), ..Self::failing() } }

    /// Every stream ends after `frames` frames, like an unplugged device.
    pub fn ending_after(frames: usize) -> Self { Self { frame_limit: Some(frames), ..Self::default() } }

    pub fn opens(&self) -> usize { self.counters.opens.load(Ordering::SeqCst) }
    pub fn closes(&self) -> usize { self.counters.closes.load(Ordering::SeqCst) }
    /// Streams opened and not yet closed.
    pub fn live_streams(&self) -> usize { self.counters.live.load(Ordering::SeqCst) }
}

struct FakeStream {
    counters: Arc<CameraCounters>,
    next: usize,
    limit: Option<usize>,
    closed: bool,
}

#[async_trait]
impl CameraDevice for FakeCamera {
    async fn open(&self, _fps: u32) -> Result<Box<dyn CameraStream>, CaptureError> {
        if let Some(delay) = self.open_delay { tokio::time::sleep(delay).await; }
        if self.fail.load(Ordering::SeqCst) {
            return Err(CaptureError::Unavailable("no camera attached".into()));
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.counters.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeStream { counters: self.counters.clone(), next: 0, limit: self.frame_limit, closed: false }))
    }
}

#[async_trait]
impl CameraStream for FakeStream {
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        if self.limit.is_some_and(|limit| self.next >= limit) { return Ok(None); }
        self.next += 1;
        Ok(Some(frame(self.next)))
    }

    fn close(&mut self) {
        if self.closed { return; }
        self.closed = true;
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct KeyState {
    sink: Mutex<Option<KeySink>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

/// Key source driven by the test through `emit`.
#[derive(Clone, Default)]
pub struct FakeKeySource {
    state: Arc<KeyState>,
}

impl FakeKeySource {
    pub fn starts(&self) -> usize { self.state.starts.load(Ordering::SeqCst) }
    pub fn stops(&self) -> usize { self.state.stops.load(Ordering::SeqCst) }
    pub fn is_running(&self) -> bool { self.state.sink.lock().is_some() }

    /// Feed a captured fragment; returns false when the source is stopped.
    pub fn emit(&self, text: &str) -> bool {
        match self.state.sink.lock().as_ref() {
            Some(sink) => sink.send(text.to_string()).is_ok(),
            None => false,
        }
    }
}

impl KeySource for FakeKeySource {
    fn start(&self, sink: KeySink) -> Result<(), CaptureError> {
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        *self.state.sink.lock() = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        self.state.sink.lock().take();
    }

    fn describe(&self) -> &'static str { "fake key source" }
}

pub struct FakeScreen;

#[async_trait]
impl ScreenCapture for FakeScreen {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError> { Ok(frame(0)) }
}

/// Screen whose capture path panics, for exercising handler containment.
pub struct PanickingScreen;

#[async_trait]
impl ScreenCapture for PanickingScreen {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError> { panic!("capture backend crashed") }
}

/// Host with two fixed processes; records what it was asked to do.
#[derive(Default)]
pub struct FakeSystem {
    pub started: Mutex<Vec<String>>,
    pub killed: Mutex<Vec<u32>>,
    pub power_calls: Mutex<Vec<bool>>,
}

impl SystemControl for FakeSystem {
    fn list_processes(&self, apps_only: bool) -> Vec<ProcessEntry> {
        let all = vec![
            ProcessEntry { id: 1, name: "init".into(), memory_kb: 512, is_app: false },
            ProcessEntry { id: 4242, name: "firefox".into(), memory_kb: 204_800, is_app: true },
        ];
        all.into_iter().filter(|p| !apps_only || p.is_app).collect()
    }

    fn start_process(&self, path: &str) -> bool {
        self.started.lock().push(path.to_string());
        !path.contains("missing")
    }

    fn kill_process(&self, id: u32) -> bool {
        self.killed.lock().push(id);
        id == 4242
    }

    fn power(&self, restart: bool) -> bool {
        self.power_calls.lock().push(restart);
        true
    }
}

pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub clock: Arc<ManualClock>,
    pub camera: FakeCamera,
    pub keys: FakeKeySource,
    pub system: Arc<FakeSystem>,
    pub proofs: Arc<ProofStore>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self { Self::with(FakeCamera::new(), DispatchSettings::default()) }

    pub fn with(camera: FakeCamera, settings: DispatchSettings) -> Self {
        Self::build(camera, settings, Arc::new(FakeScreen))
    }

    pub fn with_screen(screen: Arc<dyn ScreenCapture>) -> Self {
        Self::build(FakeCamera::new(), DispatchSettings::default(), screen)
    }

    fn build(camera: FakeCamera, settings: DispatchSettings, screen: Arc<dyn ScreenCapture>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START_TIME));
        let proofs = Arc::new(ProofStore::open(dir.path().join("proofs")).unwrap());
        let hub = Arc::new(ConnectionHub::new());
        let keys = FakeKeySource::default();
        let system = Arc::new(FakeSystem::default());
        let auth = AuthSessionManager::new(
            Arc::new(MemoryCredentialStore::new()),
            clock.clone(),
            MASTER,
            derive_token_key("X9::auth_token_secret"),
            Duration::from_secs(TOKEN_TTL_SECS as u64),
            Duration::from_secs(GRANT_TTL_SECS as u64),
        );
        let svc = Services {
            auth: Arc::new(auth),
            hub: hub.clone(),
            webcam: Arc::new(WebcamStreamManager::new(CameraSlot::new(Arc::new(camera.clone())), proofs.clone())),
            proofs: proofs.clone(),
            keylog: KeyLogRegistry::new(Box::new(keys.clone()), hub),
            screen,
            system: system.clone(),
        };
        let dispatcher = Arc::new(Dispatcher::new(svc, settings));
        Self { dispatcher, clock, camera, keys, system, proofs, dir }
    }

    /// Open a connection and discard the greeting.
    pub fn connect(&self) -> (ConnectionId, UnboundedReceiver<Event>) {
        let conn = ConnectionId::generate();
        let mut rx = self.dispatcher.on_connect(&conn, None);
        drain(&mut rx);
        (conn, rx)
    }

    pub async fn send(&self, conn: &ConnectionId, cmd: Command) {
        self.dispatcher.dispatch(conn, local_peer(), cmd).await;
    }

    /// Master code, registration and login for `alice_01`; returns the issued token.
    pub async fn login_alice(&self, conn: &ConnectionId, rx: &mut UnboundedReceiver<Event>) -> String {
        self.send(conn, Command::SubmitSetupCode { code: MASTER.into() }).await;
        self.send(conn, Command::RegisterUser { username: "alice_01".into(), password: "longpass1".into() }).await;
        self.send(conn, Command::Login { username: "alice_01".into(), password: "longpass1".into() }).await;
        let token = drain(rx).into_iter().find_map(|e| match e {
            Event::ReceiveAuthToken { token } => Some(token),
            _ => None,
        });
        token.expect("login should issue a token")
    }
}

/// Everything queued on `rx` right now.
pub fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() { out.push(ev); }
    out
}

/// Wait for the next event matching `pred`, skipping others.
pub async fn wait_for<F>(rx: &mut UnboundedReceiver<Event>, mut pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    let fut = async {
        loop {
            match rx.recv().await {
                Some(ev) if pred(&ev) => return ev,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), fut).await.expect("timed out waiting for event")
}

pub fn statuses(events: &[Event]) -> Vec<(StatusKind, bool, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::ReceiveStatus { kind, success, message } => Some((*kind, *success, message.clone())),
            _ => None,
        })
        .collect()
}

pub fn server_states(events: &[Event]) -> Vec<AuthState> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::ReceiveServerStatus { status } => Some(*status),
            _ => None,
        })
        .collect()
}
