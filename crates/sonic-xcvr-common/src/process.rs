//! Pollable, killable long-running operations.
//!
//! Firmware downloads run for minutes and must be observable (liveness,
//! incremental output) and forcibly terminable while in flight. A download
//! started through a shell ends up as a grandchild of the spawned process, so
//! killing the spawned pid alone leaves the download running. Every command
//! is therefore placed in its own process group and [`ProcessControl::terminate`]
//! signals the whole group.
//!
//! [`ProcessControl::is_running`] reports `true` while *any* member of the
//! group is alive, so a caller that terminates and then asserts
//! `!is_running()` also proves no descendant survived.

use std::collections::HashMap;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{XcvrError, XcvrResult};

/// Default time between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);

/// Opaque handle to a spawned long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle(u64);

impl ProcessHandle {
    /// Creates a handle from a raw identifier.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    pub const fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Capability to run one long operation at a time per handle.
///
/// `terminate` is contractually required to reap all descendants of the
/// spawned command, not only the direct child.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Starts `command` and returns a handle to it.
    async fn spawn(&self, command: &str) -> XcvrResult<ProcessHandle>;

    /// Non-blocking liveness check.
    async fn is_running(&self, handle: ProcessHandle) -> XcvrResult<bool>;

    /// Exit code of the spawned command once it has finished.
    async fn exit_code(&self, handle: ProcessHandle) -> XcvrResult<Option<i32>>;

    /// Returns output lines produced since the previous call.
    async fn read_output(&self, handle: ProcessHandle) -> XcvrResult<Vec<String>>;

    /// Forcibly terminates the operation and all of its descendants.
    async fn terminate(&self, handle: ProcessHandle) -> XcvrResult<()>;

    /// Forgets the handle, terminating the operation if it is still running.
    async fn release(&self, handle: ProcessHandle) -> XcvrResult<()>;
}

struct Tracked {
    command: String,
    child: Child,
    pgid: Pid,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
    status: Option<ExitStatus>,
}

impl Tracked {
    /// Reaps the group leader if it has exited.
    fn reap(&mut self) -> XcvrResult<()> {
        if self.status.is_none() {
            self.status = self
                .child
                .try_wait()
                .map_err(|e| XcvrError::process(&self.command, e.to_string()))?;
        }
        Ok(())
    }

    fn group_alive(&self) -> bool {
        match killpg(self.pgid, None) {
            Err(Errno::ESRCH) => false,
            // Zombies still answer signal 0; only live members count.
            _ => group_has_live_member(self.pgid),
        }
    }

    fn running(&mut self) -> XcvrResult<bool> {
        self.reap()?;
        Ok(self.status.is_none() || self.group_alive())
    }

    fn signal(&self, signal: Signal) -> XcvrResult<()> {
        match killpg(self.pgid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(XcvrError::process(
                &self.command,
                format!("killpg({}, {:?}) failed: {}", self.pgid, signal, e),
            )),
        }
    }
}

/// Drains whatever complete lines are ready without waiting for more.
async fn drain<R>(lines: &mut Option<Lines<R>>, out: &mut Vec<String>)
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let Some(reader) = lines.as_mut() else {
        return;
    };
    // Let the IO driver observe pipe readiness before the zero-timeout polls.
    tokio::task::yield_now().await;
    loop {
        match tokio::time::timeout(Duration::ZERO, reader.next_line()).await {
            Ok(Ok(Some(line))) => out.push(line),
            Ok(Ok(None)) | Ok(Err(_)) => {
                *lines = None;
                return;
            }
            Err(_) => return,
        }
    }
}

/// [`ProcessControl`] backed by OS process groups.
pub struct GroupProcessControl {
    next_id: AtomicU64,
    kill_grace: Duration,
    procs: Mutex<HashMap<u64, Tracked>>,
}

impl GroupProcessControl {
    /// Creates a controller with the default kill grace period.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            kill_grace: DEFAULT_KILL_GRACE,
            procs: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the time to wait after SIGTERM before escalating to SIGKILL.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Number of handles currently tracked.
    pub async fn tracked_count(&self) -> usize {
        self.procs.lock().await.len()
    }
}

impl Default for GroupProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessControl for GroupProcessControl {
    async fn spawn(&self, command: &str) -> XcvrResult<ProcessHandle> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(format!("exec {}", command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd.spawn().map_err(|e| XcvrError::ShellExec {
            command: command.to_string(),
            source: e,
        })?;
        let pid = child
            .id()
            .ok_or_else(|| XcvrError::process(command, "process exited before pid was known"))?;
        let pgid = Pid::from_raw(pid as i32);

        let stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        let handle = ProcessHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(command = %command, pid = pid, handle = %handle, "Spawned long-running operation");

        self.procs.lock().await.insert(
            handle.id(),
            Tracked {
                command: command.to_string(),
                child,
                pgid,
                stdout,
                stderr,
                status: None,
            },
        );
        Ok(handle)
    }

    async fn is_running(&self, handle: ProcessHandle) -> XcvrResult<bool> {
        let mut procs = self.procs.lock().await;
        let tracked = procs
            .get_mut(&handle.id())
            .ok_or(XcvrError::UnknownHandle(handle.id()))?;
        tracked.running()
    }

    async fn exit_code(&self, handle: ProcessHandle) -> XcvrResult<Option<i32>> {
        let mut procs = self.procs.lock().await;
        let tracked = procs
            .get_mut(&handle.id())
            .ok_or(XcvrError::UnknownHandle(handle.id()))?;
        tracked.reap()?;
        Ok(tracked.status.and_then(|s| s.code()))
    }

    async fn read_output(&self, handle: ProcessHandle) -> XcvrResult<Vec<String>> {
        let mut procs = self.procs.lock().await;
        let tracked = procs
            .get_mut(&handle.id())
            .ok_or(XcvrError::UnknownHandle(handle.id()))?;
        let mut out = Vec::new();
        drain(&mut tracked.stdout, &mut out).await;
        drain(&mut tracked.stderr, &mut out).await;
        Ok(out)
    }

    async fn terminate(&self, handle: ProcessHandle) -> XcvrResult<()> {
        let mut procs = self.procs.lock().await;
        let tracked = procs
            .get_mut(&handle.id())
            .ok_or(XcvrError::UnknownHandle(handle.id()))?;

        debug!(handle = %handle, pgid = %tracked.pgid, "Sending SIGTERM to process group");
        tracked.signal(Signal::SIGTERM)?;

        let deadline = tokio::time::Instant::now() + self.kill_grace;
        while tracked.running()? {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    handle = %handle,
                    command = %tracked.command,
                    "Process group survived SIGTERM, sending SIGKILL"
                );
                tracked.signal(Signal::SIGKILL)?;
                // Give the kernel a moment to tear the group down.
                tokio::time::sleep(Duration::from_millis(50)).await;
                tracked.reap()?;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    async fn release(&self, handle: ProcessHandle) -> XcvrResult<()> {
        let running = {
            let mut procs = self.procs.lock().await;
            match procs.get_mut(&handle.id()) {
                Some(tracked) => tracked.running()?,
                None => return Ok(()),
            }
        };
        if running {
            self.terminate(handle).await?;
        }
        self.procs.lock().await.remove(&handle.id());
        Ok(())
    }
}

/// Scans procfs for a non-zombie process whose process group is `pgid`.
#[cfg(target_os = "linux")]
fn group_has_live_member(pgid: Pid) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return true;
    };
    entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|e| std::fs::read_to_string(e.path().join("stat")).ok())
        .filter_map(|stat| parse_stat_state_pgrp(&stat))
        .any(|(state, pgrp)| pgrp == pgid.as_raw() && state != 'Z' && state != 'X')
}

#[cfg(not(target_os = "linux"))]
fn group_has_live_member(_pgid: Pid) -> bool {
    true
}

/// Extracts `(state, pgrp)` from a `/proc/<pid>/stat` line.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
fn parse_stat_state_pgrp(stat: &str) -> Option<(char, i32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_exit(ctl: &GroupProcessControl, handle: ProcessHandle) {
        for _ in 0..200 {
            if !ctl.is_running(handle).await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process did not exit");
    }

    #[test]
    fn test_parse_stat() {
        let stat = "4242 (sfp (util) x) S 1 4240 4240 0 -1 4194560";
        assert_eq!(parse_stat_state_pgrp(stat), Some(('S', 4240)));
        assert_eq!(parse_stat_state_pgrp("1 (init) Z 0 1"), Some(('Z', 1)));
        assert_eq!(parse_stat_state_pgrp("garbage"), None);
    }

    #[tokio::test]
    async fn test_spawn_and_read_output() {
        let ctl = GroupProcessControl::new();
        let handle = ctl.spawn("echo hello").await.unwrap();
        wait_exit(&ctl, handle).await;

        let out = ctl.read_output(handle).await.unwrap();
        assert_eq!(out, vec!["hello".to_string()]);
        assert_eq!(ctl.exit_code(handle).await.unwrap(), Some(0));
        // Output is only returned once.
        assert!(ctl.read_output(handle).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exit_code_non_zero() {
        let ctl = GroupProcessControl::new();
        let handle = ctl.spawn("sh -c 'exit 4'").await.unwrap();
        wait_exit(&ctl, handle).await;
        assert_eq!(ctl.exit_code(handle).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_terminate_kills_descendants() {
        let ctl = GroupProcessControl::new();
        // The background sleep is a grandchild that outlives a plain kill.
        let handle = ctl.spawn("sh -c 'sleep 30 & sleep 30'").await.unwrap();
        assert!(ctl.is_running(handle).await.unwrap());

        ctl.terminate(handle).await.unwrap();
        assert!(!ctl.is_running(handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let ctl = GroupProcessControl::new().with_kill_grace(Duration::from_millis(100));
        let handle = ctl
            .spawn("sh -c 'trap \"\" TERM; sleep 30'")
            .await
            .unwrap();
        ctl.terminate(handle).await.unwrap();
        assert!(!ctl.is_running(handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_forgets_handle() {
        let ctl = GroupProcessControl::new();
        let handle = ctl.spawn("sleep 30").await.unwrap();
        ctl.release(handle).await.unwrap();
        assert_eq!(ctl.tracked_count().await, 0);
        assert!(matches!(
            ctl.is_running(handle).await,
            Err(XcvrError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_as_exit() {
        let ctl = GroupProcessControl::new();
        let handle = ctl.spawn("/nonexistent/sfputil").await.unwrap();
        wait_exit(&ctl, handle).await;
        assert_ne!(ctl.exit_code(handle).await.unwrap(), Some(0));
    }
}
