//! Host process and power control.

use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub id: u32,
    pub name: String,
    pub memory_kb: u64,
    pub is_app: bool,
}

pub trait SystemControl: Send + Sync {
    fn list_processes(&self, apps_only: bool) -> Vec<ProcessEntry>;
    fn start_process(&self, path: &str) -> bool;
    fn kill_process(&self, id: u32) -> bool;
    fn power(&self, restart: bool) -> bool;
}

const SYSTEM_DIRS: &[&str] = &[
    "/sbin", "/usr/sbin", "/lib", "/usr/lib", "/usr/libexec", "/System/", "/Library/Apple/",
    "C:\\Windows\\",
];

/// Best-effort split between user applications and background/system processes.
fn looks_like_app(exe: Option<&Path>, memory_kb: u64) -> bool {
    let Some(exe) = exe else { return false; };
    let exe = exe.to_string_lossy();
    memory_kb > 0 && !exe.is_empty() && !SYSTEM_DIRS.iter().any(|d| exe.starts_with(d))
}

/// `SystemControl` for the machine the agent runs on.
pub struct HostSystem {
    sys: Mutex<System>,
}

impl HostSystem {
    pub fn new() -> Self { Self { sys: Mutex::new(System::new()) } }
}

impl Default for HostSystem {
    fn default() -> Self { Self::new() }
}

/// Spawn `program` with no stdio and hand the child to a reaper thread so it never lingers as a zombie.
fn spawn_reaped(program: &str, args: &[&str]) -> std::io::Result<thread::JoinHandle<Option<ExitStatus>>> {
    let mut child = Command::new(program).args(args).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null()).spawn()?;
    let name = program.to_string();
    thread::Builder::new().name("sentinel-reaper".into()).spawn(move || match child.wait() {
        Ok(status) => {
            debug!(target: "dispatch", program = %name, %status, "child exited");
            Some(status)
        }
        Err(e) => {
            warn!(target: "dispatch", program = %name, "wait failed: {}", e);
            None
        }
    })
}

fn spawn_detached(program: &str, args: &[&str]) -> bool {
    match spawn_reaped(program, args) {
        Ok(_) => true,
        Err(e) => {
            warn!(target: "dispatch", program, "spawn failed: {}", e);
            false
        }
    }
}

impl SystemControl for HostSystem {
    fn list_processes(&self, apps_only: bool) -> Vec<ProcessEntry> {
        let mut sys = self.sys.lock();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let mut out: Vec<ProcessEntry> = sys
            .processes()
            .iter()
            .map(|(pid, p)| {
                let memory_kb = p.memory() / 1024;
                ProcessEntry {
                    id: pid.as_u32(),
                    name: p.name().to_string_lossy().to_string(),
                    memory_kb,
                    is_app: looks_like_app(p.exe(), memory_kb),
                }
            })
            .filter(|e| !apps_only || e.is_app)
            .collect();
        out.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()).then(a.id.cmp(&b.id)));
        out
    }

    fn start_process(&self, path: &str) -> bool {
        let path = path.trim();
        if path.is_empty() { return false; }
        info!(target: "dispatch", path, "start process");
        if cfg!(target_os = "macos") {
            spawn_detached("open", &[path])
        } else if cfg!(target_os = "windows") {
            spawn_detached("cmd", &["/C", "start", "", path])
        } else {
            spawn_detached(path, &[]) || spawn_detached("xdg-open", &[path])
        }
    }

    fn kill_process(&self, id: u32) -> bool {
        let mut sys = self.sys.lock();
        let pid = Pid::from_u32(id);
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let killed = sys.process(pid).map(|p| p.kill()).unwrap_or(false);
        info!(target: "dispatch", pid = id, killed, "kill process");
        killed
    }

    fn power(&self, restart: bool) -> bool {
        info!(target: "dispatch", restart, "power command");
        if cfg!(target_os = "windows") {
            spawn_detached("shutdown", &[if restart { "/r" } else { "/s" }, "/t", "0"])
        } else {
            spawn_detached("shutdown", &[if restart { "-r" } else { "-h" }, "now"])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_heuristic() {
        assert!(looks_like_app(Some(Path::new("/opt/firefox/firefox")), 1024));
        assert!(!looks_like_app(Some(Path::new("/usr/lib/systemd/systemd")), 1024));
        assert!(!looks_like_app(Some(Path::new("/opt/tool")), 0));
        assert!(!looks_like_app(None, 1024));
    }

    #[test]
    fn lists_the_current_process() {
        let host = HostSystem::new();
        let me = std::process::id();
        assert!(host.list_processes(false).iter().any(|p| p.id == me));
    }

    #[cfg(unix)]
    #[test]
    fn spawned_children_are_waited_on() {
        let reaper = spawn_reaped("true", &[]).unwrap();
        let status = reaper.join().unwrap().expect("exit status collected");
        assert!(status.success());

        assert!(spawn_reaped("/nonexistent/sentinel-binary", &[]).is_err());
        assert!(!spawn_detached("/nonexistent/sentinel-binary", &[]));
    }
}
