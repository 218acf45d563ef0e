//! Process management utilities.
//!
//! Hypervisor processes are spawned detached from the agent's process group
//! with their output appended to a per-VM log file. Their pid is written to a
//! pid file so a restarted agent can still find and stop them. The pid file
//! also records the process fingerprint, so a recycled pid is never mistaken
//! for the VM.

use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use crate::error::{Error, Result};

/// Time allowed for SIGKILL to take effect.
pub const SIGKILL_WAIT: Duration = Duration::from_millis(500);

/// Interval between liveness checks while stopping.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No such process. It had already exited.
    NotRunning,
    /// Exited after SIGTERM.
    Terminated,
    /// Exited after SIGKILL.
    Killed,
}

/// Check if a process is alive.
///
/// Non-positive pids are never considered alive: `kill(0)` and `kill(-1)`
/// address process groups, not a single process.
pub fn is_alive(pid: libc::pid_t) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        // A zombie child still answers signal 0; reap it if it is ours.
        return try_wait(pid).is_none();
    }
    // EPERM means the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Reap a child without blocking.
///
/// Returns `Some(exit_code)` if the process has exited or is not our child,
/// `None` if it is still running.
pub fn try_wait(pid: libc::pid_t) -> Option<i32> {
    let mut status: libc::c_int = 0;
    let result = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };

    if result == pid {
        let exit_code = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            -1
        };
        Some(exit_code)
    } else if result < 0 {
        // Not our child (or already reaped). Liveness is decided by kill(0).
        if unsafe { libc::kill(pid, 0) } == 0 {
            None
        } else {
            Some(-1)
        }
    } else {
        None
    }
}

/// Signal the process group led by `pid`, or `pid` alone if it leads none.
fn signal_group(pid: libc::pid_t, signal: libc::c_int) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(-pid, signal) } == 0 {
        return true;
    }
    unsafe { libc::kill(pid, signal) == 0 }
}

/// Send SIGTERM to a process and its group.
pub fn terminate(pid: libc::pid_t) -> bool {
    signal_group(pid, libc::SIGTERM)
}

/// Send SIGKILL to a process and its group.
pub fn kill(pid: libc::pid_t) -> bool {
    signal_group(pid, libc::SIGKILL)
}

/// Stop a process and the helpers in its group: SIGTERM, wait up to
/// `grace`, then SIGKILL.
///
/// A process that is already gone is reported as [`StopOutcome::NotRunning`],
/// not as an error.
pub async fn stop_process(pid: libc::pid_t, grace: Duration) -> Result<StopOutcome> {
    if !is_alive(pid) {
        return Ok(StopOutcome::NotRunning);
    }

    if !terminate(pid) {
        return if is_alive(pid) {
            Err(Error::driver(
                "stop",
                format!("failed to signal pid {}: {}", pid, std::io::Error::last_os_error()),
            ))
        } else {
            Ok(StopOutcome::NotRunning)
        };
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            // Helpers that ignored SIGTERM must not outlive the leader. The
            // group id cannot be reused while any member is alive.
            unsafe { libc::kill(-pid, libc::SIGKILL) };
            return Ok(StopOutcome::Terminated);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    tracing::debug!(pid = pid, "SIGTERM timeout, sending SIGKILL");
    kill(pid);
    tokio::time::sleep(SIGKILL_WAIT).await;

    if is_alive(pid) {
        Err(Error::driver(
            "stop",
            format!("pid {} still alive after SIGKILL", pid),
        ))
    } else {
        Ok(StopOutcome::Killed)
    }
}

/// Spawn a long-running process detached from the agent.
///
/// The child gets its own process group, stdin from `/dev/null`, and stdout
/// and stderr appended to `log_path`. The child is not awaited; tokio reaps
/// it in the background once it exits.
pub fn spawn_detached(mut command: std::process::Command, log_path: &Path) -> Result<libc::pid_t> {
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| Error::storage("open log file", format!("{}: {}", log_path.display(), e)))?;
    let log_err = log
        .try_clone()
        .map_err(|e| Error::storage("clone log handle", e.to_string()))?;

    command
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(log_err)
        .process_group(0);

    let program = command.get_program().to_string_lossy().to_string();
    let mut command = tokio::process::Command::from(command);
    command.kill_on_drop(false);

    let child = command
        .spawn()
        .map_err(|e| Error::driver("spawn", format!("{}: {}", program, e)))?;
    let pid = child
        .id()
        .ok_or_else(|| Error::driver("spawn", format!("{} exited before reporting a pid", program)))?;

    libc::pid_t::try_from(pid)
        .map_err(|_| Error::driver("spawn", format!("pid {} out of range", pid)))
}

/// Start time and command line of a running process, as `ps` reports them.
///
/// Returns `None` when the process is gone or `ps` is unavailable.
pub fn fingerprint(pid: libc::pid_t) -> Option<String> {
    let output = std::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "lstart=,args="])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    let s = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Contents of a pid file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    /// Process id.
    pub pid: libc::pid_t,
    /// Fingerprint taken when the file was written.
    pub fingerprint: Option<String>,
}

impl PidFile {
    /// Whether `pid` still names the process that was recorded.
    ///
    /// Without a recorded fingerprint the process must at least lead its own
    /// group, as every hypervisor spawned by [`spawn_detached`] does.
    pub fn is_same_process(&self) -> bool {
        match &self.fingerprint {
            Some(expected) => fingerprint(self.pid).as_deref() == Some(expected.as_str()),
            None => (unsafe { libc::getpgid(self.pid) }) == self.pid,
        }
    }
}

/// Persist a pid together with its fingerprint.
pub fn write_pid_file(path: &Path, pid: libc::pid_t) -> Result<()> {
    let contents = match fingerprint(pid) {
        Some(fp) => format!("{}\n{}\n", pid, fp),
        None => {
            tracing::debug!(pid, "no fingerprint for pid file");
            format!("{}\n", pid)
        }
    };
    crate::util::write_atomic(path, contents.as_bytes())
}

/// Read a pid file. A missing file is `Ok(None)`.
pub fn read_pid_file(path: &Path) -> Result<Option<PidFile>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::storage(
                "read pid file",
                format!("{}: {}", path.display(), e),
            ))
        }
    };

    let mut lines = raw.lines();
    let first = lines.next().unwrap_or_default().trim();
    let pid: libc::pid_t = first.parse().map_err(|_| {
        Error::storage(
            "parse pid file",
            format!("{}: not a pid: {:?}", path.display(), first),
        )
    })?;
    if pid <= 0 {
        return Err(Error::storage(
            "parse pid file",
            format!("{}: invalid pid {}", path.display(), pid),
        ));
    }
    let fingerprint = lines
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string);
    Ok(Some(PidFile { pid, fingerprint }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_alive_self() {
        let pid = unsafe { libc::getpid() };
        assert!(is_alive(pid));
    }

    #[test]
    fn test_is_alive_nonexistent() {
        assert!(!is_alive(99999999));
    }

    #[test]
    fn test_group_pids_are_never_alive() {
        assert!(!is_alive(0));
        assert!(!is_alive(-1));
        assert!(!terminate(0));
        assert!(!kill(-1));
    }

    #[test]
    fn test_pid_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.pid");

        assert_eq!(read_pid_file(&path).unwrap(), None);
        write_pid_file(&path, 99999999).unwrap();
        assert_eq!(
            read_pid_file(&path).unwrap(),
            Some(PidFile {
                pid: 99999999,
                fingerprint: None
            })
        );

        std::fs::write(&path, "garbage").unwrap();
        assert!(read_pid_file(&path).is_err());

        std::fs::write(&path, "0").unwrap();
        assert!(read_pid_file(&path).is_err());
    }

    #[tokio::test]
    async fn test_spawn_detached_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("vm.log");

        let mut command = std::process::Command::new("sh");
        command.args(["-c", "echo booting; exec sleep 30"]);
        let pid = spawn_detached(command, &log).unwrap();
        assert!(is_alive(pid));

        let outcome = stop_process(pid, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Terminated);
        assert!(!is_alive(pid));

        let again = stop_process(pid, Duration::from_secs(1)).await.unwrap();
        assert_eq!(again, StopOutcome::NotRunning);

        let output = std::fs::read_to_string(&log).unwrap();
        assert!(output.contains("booting"));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("vm.log");

        let mut command = std::process::Command::new("sh");
        command.args(["-c", "trap '' TERM; while true; do sleep 1; done"]);
        let pid = spawn_detached(command, &log).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = stop_process(pid, Duration::from_millis(300)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Killed);
    }

    /// Dead, or a zombie nobody has reaped yet.
    fn gone(pid: libc::pid_t) -> bool {
        !is_alive(pid)
            || std::fs::read_to_string(format!("/proc/{}/stat", pid))
                .map(|stat| stat.contains(") Z "))
                .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_stop_reaches_helpers_in_group() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("vm.log");
        let helper_pid = dir.path().join("helper.pid");

        let mut command = std::process::Command::new("sh");
        command.args([
            "-c",
            &format!("sleep 300 & echo $! > {}; wait", helper_pid.display()),
        ]);
        let pid = spawn_detached(command, &log).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        let helper = loop {
            if let Ok(Some(file)) = read_pid_file(&helper_pid) {
                break file.pid;
            }
            assert!(tokio::time::Instant::now() < deadline, "helper never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert!(is_alive(helper));

        stop_process(pid, Duration::from_secs(2)).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !gone(helper) {
            assert!(tokio::time::Instant::now() < deadline, "helper outlived the VM");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_pid_file_detects_recycled_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.pid");

        let mut command = std::process::Command::new("sleep");
        command.arg("300");
        let pid = spawn_detached(command, &dir.path().join("vm.log")).unwrap();
        write_pid_file(&path, pid).unwrap();

        let recorded = read_pid_file(&path).unwrap().unwrap();
        assert_eq!(recorded.pid, pid);
        assert!(recorded.fingerprint.is_some());
        assert!(recorded.is_same_process());

        // Same pid, different process.
        let recycled = PidFile {
            pid,
            fingerprint: Some("Thu Jan  1 00:00:00 1970 /usr/bin/something-else".into()),
        };
        assert!(!recycled.is_same_process());

        // Without a fingerprint only a group leader is trusted.
        let own = PidFile {
            pid: unsafe { libc::getpid() },
            fingerprint: None,
        };
        assert_eq!(own.is_same_process(), unsafe { libc::getpgrp() == libc::getpid() });

        stop_process(pid, Duration::from_secs(2)).await.unwrap();
    }
}
