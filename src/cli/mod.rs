//! Operator client helpers shared by the `sentinel_cli` binary: the control
//! connection and plain-text rendering of pushed events.

pub mod connectivity;

pub use connectivity::{control_url, ControlSession};

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::media::ProofMeta;
use crate::server::commands::{Command, Event};
use crate::system::ProcessEntry;

const MAX_COL_WIDTH: usize = 60;

/// Render rows as an ASCII table with a `rows: N` footer.
pub fn render_table(cols: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = cols.iter().map(|c| display_len(c).min(MAX_COL_WIDTH)).collect();
    for r in rows {
        for (i, cell) in r.iter().enumerate().take(cols.len()) {
            let w = display_len(cell);
            if w > widths[i] { widths[i] = w.min(MAX_COL_WIDTH); }
        }
    }
    let header: Vec<String> = cols.iter().map(|c| c.to_string()).collect();
    let sep = build_separator(&widths);
    let mut out = String::new();
    out.push_str(&sep);
    out.push('\n');
    out.push_str(&build_row(&header, &widths));
    out.push('\n');
    out.push_str(&sep);
    out.push('\n');
    for r in rows {
        out.push_str(&build_row(r, &widths));
        out.push('\n');
    }
    out.push_str(&sep);
    out.push('\n');
    out.push_str(&format!("rows: {}", rows.len()));
    out
}

/// Decode the `json` payload of a process-list event into a table.
pub fn render_process_list(json: &str) -> Result<String> {
    let list: Vec<ProcessEntry> = serde_json::from_str(json).context("process list payload")?;
    let rows: Vec<Vec<String>> = list
        .iter()
        .map(|p| vec![
            p.id.to_string(),
            p.name.clone(),
            p.memory_kb.to_string(),
            if p.is_app { "app".to_string() } else { String::new() },
        ])
        .collect();
    Ok(render_table(&["pid", "name", "memory_kb", "kind"], &rows))
}

pub fn render_proof_list(json: &str) -> Result<String> {
    let list: Vec<ProofMeta> = serde_json::from_str(json).context("proof list payload")?;
    let rows: Vec<Vec<String>> = list
        .iter()
        .map(|m| vec![
            m.id.clone(),
            m.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            format!("{:.1}", m.duration_seconds),
            m.frame_count.to_string(),
        ])
        .collect();
    Ok(render_table(&["id", "created_at (UTC)", "seconds", "frames"], &rows))
}

/// One-line description of an event for the REPL. Image and list payloads
/// are handled by the caller; this covers them with a summary only.
pub fn describe_event(ev: &Event) -> String {
    match ev {
        Event::ReceiveServerStatus { status } => format!("[server] {}", status.code()),
        Event::ReceiveStatus { kind, success, message } => {
            format!("[{:?}] {} {}", kind, if *success { "ok" } else { "failed" }, message)
        }
        Event::ReceiveImage { kind, data } => format!("[{:?}] image ({} base64 chars)", kind, data.len()),
        Event::ReceiveKeyLog { text } => text.clone(),
        Event::ReceiveProcessList { json } => format!("[processes] {} bytes", json.len()),
        Event::ReceiveWebcamProofList { json } => format!("[proofs] {} bytes", json.len()),
        Event::ReceiveAuthToken { .. } => "[token] received".to_string(),
    }
}

/// A parsed REPL line.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Connect { url: String, token: Option<String> },
    Disconnect,
    Help,
    Quit,
    /// Request a screenshot and write it to the given file.
    Shot(PathBuf),
    /// Replay a proof clip, writing its frames under `dir`.
    Play { id: String, dir: PathBuf },
    Remote(Command),
}

pub const HELP: &str = "\
Interactive commands:
  connect <ws-url> [token]    open the control channel (stored token is reused)
  disconnect                  close the control channel
  code <master>               submit the master code
  register <user> <password>  create the account after the master code
  login [user] <password>     log in (user defaults to the local login name)
  logout                      end the session
  status                      show the server auth state
  ps [apps]                   list processes
  start <path>                launch a program or open a file
  kill <pid>                  terminate a process
  shot [file]                 save a screenshot (default screenshot.jpg)
  cam on [fps] | cam off      start/stop the live webcam
  proofs                      list saved proof clips
  play <id> [dir]             replay a proof clip into dir (default ./<id>)
  keys on|off                 subscribe/unsubscribe the key log
  power off|restart           shut down or restart the agent host
  help                        show this help
  quit | exit                 leave";

/// Parse one REPL line. Errors carry a usage hint.
pub fn parse_input(line: &str, local_user: &str) -> std::result::Result<Input, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(head) = parts.first() else { return Err("empty input".to_string()) };
    let arg = |i: usize| parts.get(i).map(|s| s.to_string());
    let rest = |i: usize| parts.get(i..).map(|p| p.join(" ")).unwrap_or_default();
    let input = match head.to_ascii_lowercase().as_str() {
        "quit" | "exit" => Input::Quit,
        "help" | "?" => Input::Help,
        "connect" => Input::Connect {
            url: arg(1).ok_or("usage: connect <ws-url> [token]")?,
            token: arg(2),
        },
        "disconnect" => Input::Disconnect,
        "code" => Input::Remote(Command::SubmitSetupCode { code: arg(1).ok_or("usage: code <master>")? }),
        "register" => match (arg(1), arg(2)) {
            (Some(username), Some(password)) => Input::Remote(Command::RegisterUser { username, password }),
            _ => return Err("usage: register <user> <password>".to_string()),
        },
        "login" => match (arg(1), arg(2)) {
            (Some(username), Some(password)) => Input::Remote(Command::Login { username, password }),
            (Some(password), None) => Input::Remote(Command::Login { username: local_user.to_string(), password }),
            _ => return Err("usage: login [user] <password>".to_string()),
        },
        "logout" => Input::Remote(Command::Logout),
        "status" => Input::Remote(Command::GetServerStatus),
        "ps" => Input::Remote(Command::GetProcessList { apps_only: arg(1).as_deref() == Some("apps") }),
        "start" => {
            let path = rest(1);
            if path.is_empty() { return Err("usage: start <path>".to_string()); }
            Input::Remote(Command::StartProcess { path })
        }
        "kill" => {
            let id = arg(1).and_then(|s| s.parse::<u32>().ok()).ok_or("usage: kill <pid>")?;
            Input::Remote(Command::KillProcess { id })
        }
        "shot" => Input::Shot(PathBuf::from(arg(1).unwrap_or_else(|| "screenshot.jpg".to_string()))),
        "cam" => match arg(1).as_deref() {
            Some("on") => {
                let fps = match arg(2) {
                    Some(v) => Some(v.parse::<u32>().map_err(|_| "usage: cam on [fps]")?),
                    None => None,
                };
                Input::Remote(Command::StartWebcamLive { fps })
            }
            Some("off") => Input::Remote(Command::StopWebcamLive),
            _ => return Err("usage: cam on [fps] | cam off".to_string()),
        },
        "proofs" => Input::Remote(Command::GetWebcamProofList),
        "play" => {
            let id = arg(1).ok_or("usage: play <id> [dir]")?;
            let dir = PathBuf::from(arg(2).unwrap_or_else(|| id.clone()));
            Input::Play { id, dir }
        }
        "keys" => match arg(1).as_deref() {
            Some("on") => Input::Remote(Command::StartKeyLogger),
            Some("off") => Input::Remote(Command::StopKeyLogger),
            _ => return Err("usage: keys on|off".to_string()),
        },
        "power" => match arg(1).as_deref() {
            Some("off") => Input::Remote(Command::ShutdownServer { restart: false }),
            Some("restart") => Input::Remote(Command::ShutdownServer { restart: true }),
            _ => return Err("usage: power off|restart".to_string()),
        },
        other => return Err(format!("unknown command: {} (try 'help')", other)),
    };
    Ok(input)
}

fn display_len(s: &str) -> usize { s.chars().count() }

fn build_separator(widths: &[usize]) -> String {
    let mut s = String::new();
    s.push('+');
    for w in widths {
        s.push_str(&"-".repeat(*w + 2));
        s.push('+');
    }
    s
}

fn build_row(cells: &[String], widths: &[usize]) -> String {
    let mut s = String::new();
    s.push('|');
    for (i, w) in widths.iter().enumerate() {
        let cell = cells.get(i).cloned().unwrap_or_default();
        let text = truncate(&cell, *w);
        let pad = w.saturating_sub(display_len(&text));
        s.push(' ');
        if is_numeric_like(&cell) {
            s.push_str(&" ".repeat(pad));
            s.push_str(&text);
        } else {
            s.push_str(&text);
            s.push_str(&" ".repeat(pad));
        }
        s.push_str(" |");
    }
    s
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max { return s.to_string(); }
    if max <= 1 { return "…".to_string(); }
    s.chars().take(max - 1).collect::<String>() + "…"
}

fn is_numeric_like(s: &str) -> bool {
    let st = s.trim();
    !st.is_empty() && st.chars().any(|c| c.is_ascii_digit()) && st.chars().all(|c| c.is_ascii_digit() || c == '.')
}
