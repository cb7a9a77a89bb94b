//! Daemon control: start, stop, and status keyed by the pid lock file

use crate::output::{self, color_status};
use anyhow::{bail, Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Default pid lock file, shared with the daemon's own configuration
fn default_pid_file() -> PathBuf {
    std::env::temp_dir().join("epmtd.pid")
}

fn pid_file_path(pid_file: Option<PathBuf>) -> PathBuf {
    pid_file.unwrap_or_else(default_pid_file)
}

/// Read the daemon pid from the lock file, if present
fn read_pid(path: &PathBuf) -> Result<Option<i32>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read pid file {}", path.display()))?;
    let pid = raw
        .trim()
        .parse::<i32>()
        .with_context(|| format!("Malformed pid file {}", path.display()))?;
    Ok(Some(pid))
}

/// Probe a pid without sending a signal
fn is_alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

/// Launch the daemon binary detached
pub fn start(bin: &str, pid_file: Option<PathBuf>) -> Result<()> {
    let path = pid_file_path(pid_file);
    if let Some(pid) = read_pid(&path)? {
        if is_alive(pid) {
            bail!("daemon already running with pid {}", pid);
        }
        output::print_warning(&format!(
            "Removing stale pid file {} (pid {} is gone)",
            path.display(),
            pid
        ));
        let _ = fs::remove_file(&path);
    }

    let child = Command::new(bin)
        .env("EPMT_PID_FILE", &path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to launch daemon binary {:?}", bin))?;

    output::print_success(&format!("Daemon started with pid {}", child.id()));
    Ok(())
}

/// Send the running daemon a graceful termination signal
pub fn stop(pid_file: Option<PathBuf>) -> Result<()> {
    let path = pid_file_path(pid_file);
    let Some(pid) = read_pid(&path)? else {
        bail!("no pid file at {}; daemon not running?", path.display());
    };
    if !is_alive(pid) {
        output::print_warning(&format!("Pid {} is not running; removing stale pid file", pid));
        let _ = fs::remove_file(&path);
        return Ok(());
    }

    signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("Failed to signal pid {}", pid))?;
    output::print_success(&format!(
        "Sent SIGTERM to pid {}; the current iteration will finish first",
        pid
    ));
    Ok(())
}

/// Report whether the daemon is running and under which pid
pub fn status(pid_file: Option<PathBuf>) -> Result<()> {
    let path = pid_file_path(pid_file);
    match read_pid(&path)? {
        None => {
            output::print_info(&format!("Daemon {}", color_status("not_running")));
        }
        Some(pid) if is_alive(pid) => {
            output::print_info(&format!(
                "Daemon {} with pid {}",
                color_status("running"),
                pid
            ));
        }
        Some(pid) => {
            output::print_warning(&format!(
                "Daemon {}: pid file names {} but it is gone",
                color_status("stale"),
                pid
            ));
        }
    }
    Ok(())
}
