//! Command routing: gating of unauthenticated connections, host commands,
//! screenshots and connection teardown.

mod common;

use common::*;
use sentinel::server::commands::{msg, Command, Event, ImageKind, StatusKind};
use sentinel::system::ProcessEntry;

fn gated_commands() -> Vec<Command> {
    vec![
        Command::GetProcessList { apps_only: false },
        Command::StartProcess { path: "/usr/bin/true".into() },
        Command::KillProcess { id: 4242 },
        Command::ShutdownServer { restart: true },
        Command::GetScreenshot,
        Command::StartWebcamLive { fps: Some(5) },
        Command::StopWebcamLive,
        Command::RequestWebcam,
        Command::CloseWebcam,
        Command::GetWebcamProofList,
        Command::PlayWebcamProof { id: "x".into() },
        Command::StartKeyLogger,
        Command::StopKeyLogger,
        Command::Logout,
    ]
}

#[tokio::test]
async fn unauthenticated_gated_commands_are_dropped_silently() {
    let h = Harness::new();
    let (conn, mut rx) = h.connect();
    for cmd in gated_commands() {
        assert!(cmd.requires_auth(), "{} should be gated", cmd.name());
        h.send(&conn, cmd).await;
    }
    assert!(drain(&mut rx).is_empty());
    assert!(h.system.killed.lock().is_empty());
    assert!(h.system.power_calls.lock().is_empty());
    assert_eq!(h.camera.opens(), 0);
    assert_eq!(h.keys.starts(), 0);
}

#[tokio::test]
async fn status_commands_answer_before_login() {
    let h = Harness::new();
    let (conn, mut rx) = h.connect();
    h.send(&conn, Command::GetServerStatus).await;
    let ev = drain(&mut rx);
    assert_eq!(statuses(&ev), vec![(StatusKind::ServerStatus, true, msg::STATUS_LOGIN.to_string())]);

    h.send(&conn, Command::GetServerStatusSilent).await;
    let ev = drain(&mut rx);
    assert_eq!(ev.len(), 1);
    assert!(statuses(&ev).is_empty());
}

#[tokio::test]
async fn process_list_and_control() {
    let h = Harness::new();
    let (conn, mut rx) = h.connect();
    h.login_alice(&conn, &mut rx).await;

    h.send(&conn, Command::GetProcessList { apps_only: true }).await;
    let ev = drain(&mut rx);
    let Some(Event::ReceiveProcessList { json }) = ev.first() else { panic!("expected process list, got {:?}", ev) };
    let list: Vec<ProcessEntry> = serde_json::from_str(json).unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].name, "firefox");

    h.send(&conn, Command::StartProcess { path: "/opt/app".into() }).await;
    h.send(&conn, Command::StartProcess { path: "/opt/missing".into() }).await;
    h.send(&conn, Command::KillProcess { id: 4242 }).await;
    h.send(&conn, Command::KillProcess { id: 1 }).await;
    h.send(&conn, Command::ShutdownServer { restart: true }).await;
    assert_eq!(
        statuses(&drain(&mut rx)),
        vec![
            (StatusKind::Start, true, msg::START_OK.to_string()),
            (StatusKind::Start, false, msg::START_FAILED.to_string()),
            (StatusKind::Kill, true, msg::KILL_OK.to_string()),
            (StatusKind::Kill, false, msg::KILL_FAILED.to_string()),
            (StatusKind::Power, true, msg::POWER.to_string()),
        ]
    );
    assert_eq!(*h.system.started.lock(), vec!["/opt/app".to_string(), "/opt/missing".to_string()]);
    assert_eq!(*h.system.power_calls.lock(), vec![true]);
}

#[tokio::test]
async fn screenshot_is_pushed_as_base64_image() {
    let h = Harness::new();
    let (conn, mut rx) = h.connect();
    h.login_alice(&conn, &mut rx).await;

    h.send(&conn, Command::GetScreenshot).await;
    let ev = drain(&mut rx);
    assert_eq!(ev.len(), 1);
    assert!(matches!(ev[0], Event::ReceiveImage { kind: ImageKind::Screenshot, .. }));
    assert_eq!(ev[0].image_bytes(), Some(frame(0)));
}

#[tokio::test]
async fn captured_keys_only_accepted_from_loopback() {
    assert!(!Command::SubmitCapturedKey { data: String::new() }.requires_auth());
    let h = Harness::new();
    let (conn, mut rx) = h.connect();
    h.login_alice(&conn, &mut rx).await;
    h.send(&conn, Command::StartKeyLogger).await;
    drain(&mut rx);

    h.dispatcher.dispatch(&conn, remote_peer(), Command::SubmitCapturedKey { data: "x".into() }).await;
    assert!(drain(&mut rx).is_empty());

    h.dispatcher.dispatch(&conn, local_peer(), Command::SubmitCapturedKey { data: "hi".into() }).await;
    assert_eq!(drain(&mut rx), vec![Event::key_log("hi")]);
}

#[tokio::test]
async fn disconnect_releases_everything() {
    let h = Harness::new();
    let (conn, mut rx) = h.connect();
    h.login_alice(&conn, &mut rx).await;
    h.send(&conn, Command::StartKeyLogger).await;
    h.send(&conn, Command::StartWebcamLive { fps: Some(10) }).await;
    assert!(h.dispatcher.services().webcam.is_active(&conn));

    let health = h.dispatcher.health();
    assert_eq!((health.connections, health.authenticated, health.keylog_subscribers, health.webcam_sessions), (1, 1, 1, 1));

    h.dispatcher.on_disconnect(&conn).await;
    let health = h.dispatcher.health();
    assert_eq!((health.connections, health.authenticated, health.keylog_subscribers, health.webcam_sessions), (0, 0, 0, 0));
    assert_eq!(h.camera.live_streams(), 0);
    assert!(!h.dispatcher.services().webcam.camera().is_held());
    assert!(!h.keys.is_running());

    // a second teardown is harmless
    h.dispatcher.on_disconnect(&conn).await;
}

#[test]
fn commands_parse_from_wire_json() {
    let cmd: Command = serde_json::from_str(r#"{"command":"GetProcessList","args":{"appsOnly":true}}"#).unwrap();
    assert_eq!(cmd, Command::GetProcessList { apps_only: true });
    let cmd: Command = serde_json::from_str(r#"{"command":"KillProcess","args":{"id":17}}"#).unwrap();
    assert_eq!(cmd, Command::KillProcess { id: 17 });
    let cmd: Command = serde_json::from_str(r#"{"command":"Logout"}"#).unwrap();
    assert_eq!(cmd, Command::Logout);
    assert!(serde_json::from_str::<Command>(r#"{"command":"FormatDisk"}"#).is_err());
}

#[tokio::test]
async fn panicking_handler_reports_failure_and_keeps_the_connection() {
    let h = Harness::with_screen(std::sync::Arc::new(PanickingScreen));
    let (conn, mut rx) = h.connect();
    h.login_alice(&conn, &mut rx).await;

    h.send(&conn, Command::GetScreenshot).await;
    assert_eq!(statuses(&drain(&mut rx)), vec![(StatusKind::Screenshot, false, msg::COMMAND_FAILED.to_string())]);

    h.send(&conn, Command::GetServerStatusSilent).await;
    assert_eq!(server_states(&drain(&mut rx)), vec![sentinel::identity::AuthState::Authenticated]);
    assert!(h.dispatcher.services().auth.is_authenticated(&conn));
}
