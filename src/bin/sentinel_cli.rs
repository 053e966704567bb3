//!
//! sentinel CLI binary
//! -------------------
//! Interactive operator client. Connects to an agent's `/control` WebSocket,
//! sends commands typed at the prompt and prints pushed events. The issued
//! token is kept in `~/.sentinel_token` and reused on the next `connect`.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::mpsc;

use sentinel::cli::{describe_event, parse_input, render_process_list, render_proof_list, ControlSession, Input, HELP};
use sentinel::identity::AuthState;
use sentinel::server::commands::{Command, Event, ImageKind};
use sentinel::system_paths;

const STATUS_POLL: Duration = Duration::from_secs(30);

fn print_usage(program: &str) {
    eprintln!(
        "Usage:\n  {program} [--connect <ws-url>] [--token <token>]\n\nFlags:\n  --connect <url>   Connect on startup (e.g. ws://127.0.0.1:5001)\n  --token <token>   Access token to re-authenticate with (default: stored token)\n  -h, --help        Show this help\n\n{HELP}"
    );
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1).cloned())
}

/// Operator-side state for one REPL run.
struct Operator {
    session: Option<ControlSession>,
    events: Option<mpsc::UnboundedReceiver<Event>>,
    token: Option<String>,
    last_status: Option<AuthState>,
    shot_path: Option<PathBuf>,
    play_dir: Option<PathBuf>,
    play_frames: usize,
    live_frames: usize,
}

impl Operator {
    fn new() -> Self {
        let token = fs::read_to_string(system_paths::cli_token_file())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Self {
            session: None,
            events: None,
            token,
            last_status: None,
            shot_path: None,
            play_dir: None,
            play_frames: 0,
            live_frames: 0,
        }
    }

    async fn connect(&mut self, url: &str, token: Option<String>) {
        self.disconnect().await;
        if token.is_some() { self.token = token; }
        match ControlSession::connect(url, self.token.as_deref()).await {
            Ok((session, events)) => {
                println!("connected to {}", session.ident());
                self.session = Some(session);
                self.events = Some(events);
                self.last_status = None;
            }
            Err(e) => eprintln!("connect failed: {:#}", e),
        }
    }

    async fn disconnect(&mut self) {
        self.events = None;
        if let Some(s) = self.session.take() {
            s.close().await;
            println!("disconnected");
        }
    }

    fn send(&self, cmd: Command) {
        match &self.session {
            Some(s) => { if let Err(e) = s.send(cmd) { eprintln!("error: {}", e); } }
            None => println!("Not connected. Use 'connect <ws-url>' first."),
        }
    }

    fn store_token(&mut self, token: &str) {
        self.token = Some(token.to_string());
        if let Err(e) = fs::write(system_paths::cli_token_file(), token) {
            eprintln!("could not store token: {}", e);
        }
    }

    fn forget_token(&mut self) {
        self.token = None;
        let _ = fs::remove_file(system_paths::cli_token_file());
    }

    fn on_event(&mut self, ev: Event) {
        match &ev {
            Event::ReceiveAuthToken { token } => {
                self.store_token(token);
                println!("{}", describe_event(&ev));
            }
            Event::ReceiveServerStatus { status } => {
                // the periodic poll is silent unless the state changed
                if self.last_status != Some(*status) {
                    if *status == AuthState::LoginRequired && self.last_status == Some(AuthState::Authenticated) {
                        println!("session expired");
                    }
                    println!("{}", describe_event(&ev));
                }
                self.last_status = Some(*status);
            }
            Event::ReceiveImage { kind, .. } => self.on_image(*kind, &ev),
            Event::ReceiveKeyLog { text } => print!("{}", text),
            Event::ReceiveProcessList { json } => match render_process_list(json) {
                Ok(table) => println!("{}", table),
                Err(e) => eprintln!("error: {:#}", e),
            },
            Event::ReceiveWebcamProofList { json } => match render_proof_list(json) {
                Ok(table) => println!("{}", table),
                Err(e) => eprintln!("error: {:#}", e),
            },
            Event::ReceiveStatus { message, .. } => {
                if message == sentinel::server::commands::msg::PLAYBACK_COMPLETED {
                    if let Some(dir) = self.play_dir.take() {
                        println!("{} frames written to {}", self.play_frames, dir.display());
                    }
                }
                if message == sentinel::server::commands::msg::WEBCAM_STOPPING {
                    println!("{} live frames received", self.live_frames);
                    self.live_frames = 0;
                }
                println!("{}", describe_event(&ev));
            }
        }
    }

    fn on_image(&mut self, kind: ImageKind, ev: &Event) {
        let Some(bytes) = ev.image_bytes() else {
            eprintln!("undecodable image payload");
            return;
        };
        match kind {
            ImageKind::Screenshot => {
                let path = self.shot_path.take().unwrap_or_else(|| PathBuf::from("screenshot.jpg"));
                match fs::write(&path, &bytes) {
                    Ok(()) => println!("screenshot saved to {} ({} bytes)", path.display(), bytes.len()),
                    Err(e) => eprintln!("write {}: {}", path.display(), e),
                }
            }
            ImageKind::WebcamLive => {
                self.live_frames += 1;
                let _ = fs::write("webcam-live.jpg", &bytes);
            }
            ImageKind::WebcamProofFrame => {
                let Some(dir) = self.play_dir.clone() else { return };
                self.play_frames += 1;
                let path = dir.join(format!("frame-{:05}.jpg", self.play_frames));
                if let Err(e) = fs::write(&path, &bytes) {
                    eprintln!("write {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Returns false when the REPL should exit.
    async fn on_line(&mut self, line: &str) -> bool {
        let input = match parse_input(line, &whoami::username()) {
            Ok(i) => i,
            Err(msg) => {
                eprintln!("{}", msg);
                return true;
            }
        };
        match input {
            Input::Quit => return false,
            Input::Help => println!("{}", HELP),
            Input::Connect { url, token } => self.connect(&url, token).await,
            Input::Disconnect => self.disconnect().await,
            Input::Shot(path) => {
                self.shot_path = Some(path);
                self.send(Command::GetScreenshot);
            }
            Input::Play { id, dir } => {
                if let Err(e) = fs::create_dir_all(&dir) {
                    eprintln!("create {}: {}", dir.display(), e);
                    return true;
                }
                self.play_dir = Some(dir);
                self.play_frames = 0;
                self.send(Command::PlayWebcamProof { id });
            }
            Input::Remote(cmd) => {
                if cmd == Command::Logout { self.forget_token(); }
                self.send(cmd);
            }
        }
        true
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<Event>>) -> Option<Event> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Line editor runs on its own thread; lines arrive over a channel.
fn spawn_line_reader(prompt: String) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                eprintln!("line editor unavailable: {}", e);
                return;
            }
        };
        loop {
            match rl.readline(&prompt) {
                Ok(line) => {
                    let line = line.trim().to_string();
                    if line.is_empty() { continue; }
                    let _ = rl.add_history_entry(line.as_str());
                    if tx.blocking_send(line).is_err() { break; }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(e) => {
                    eprintln!("read error: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().cloned().unwrap_or_else(|| "sentinel_cli".to_string());
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage(&program);
        return Ok(());
    }

    let mut op = Operator::new();
    println!("sentinel operator console. Type 'help' for commands.");
    if let Some(url) = arg_value(&args, "--connect") {
        op.connect(&url, arg_value(&args, "--token")).await;
    }

    let mut lines = spawn_line_reader(format!("{}@sentinel> ", whoami::username()));
    let mut poll = tokio::time::interval(STATUS_POLL);
    poll.tick().await;

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                if !op.on_line(&line).await { break; }
            }
            ev = next_event(&mut op.events) => match ev {
                Some(ev) => op.on_event(ev),
                None => {
                    println!("connection closed by agent");
                    op.events = None;
                    op.session = None;
                }
            },
            _ = poll.tick() => {
                if op.session.as_ref().is_some_and(|s| s.is_open()) {
                    op.send(Command::GetServerStatusSilent);
                }
            }
        }
    }

    op.disconnect().await;
    Ok(())
}
