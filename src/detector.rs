//! Liveness detectors: is a given (name, pid) pair still the process the
//! engine started? A closed, engine-level set (spec §9) rather than a
//! plugin surface.

use std::path::PathBuf;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

pub use crate::spec::Detector;

impl Detector {
    /// Evaluate this single detector against a PID. `true` means this
    /// detector confirms the process is alive and is the one we expect.
    fn check(&self, pid: i32) -> bool {
        match self {
            Detector::PidFile(path) => pidfile_matches(path, pid),
            Detector::Command(needle) => command_matches(pid, needle),
        }
    }
}

/// Evaluate an ordered list of detectors against a PID, first-positive-wins
/// (spec §4.1 edge policy). An empty list falls back to a plain
/// "is this PID alive" probe (signal 0).
pub fn is_alive(detectors: &[Detector], pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if detectors.is_empty() {
        return signal_zero(pid);
    }
    detectors.iter().any(|d| d.check(pid))
}

/// `kill(pid, 0)` without actually signaling: the default liveness probe
/// when no detector is configured.
fn signal_zero(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

/// Confirms identity by reading a PID file and comparing its numeric
/// contents to `pid`.
fn pidfile_matches(path: &PathBuf, pid: i32) -> bool {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return false;
    };
    contents
        .trim()
        .parse::<i32>()
        .map(|recorded| recorded == pid)
        .unwrap_or(false)
}

/// Confirms identity by matching `needle` as a substring of the process's
/// command line. Linux reads `/proc/<pid>/cmdline`; other platforms fall
/// back to a `ps`-based lookup.
fn command_matches(pid: i32, needle: &str) -> bool {
    if pid <= 0 {
        return false;
    }
    #[cfg(target_os = "linux")]
    {
        let path = format!("/proc/{pid}/cmdline");
        if let Ok(raw) = std::fs::read(&path) {
            let cmdline: String = raw
                .split(|b| *b == 0)
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            return cmdline.contains(needle);
        }
        return false;
    }
    #[cfg(not(target_os = "linux"))]
    {
        ps_cmdline(pid)
            .map(|cmdline| cmdline.contains(needle))
            .unwrap_or(false)
    }
}

#[cfg(not(target_os = "linux"))]
fn ps_cmdline(pid: i32) -> Option<String> {
    let output = std::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "command="])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
