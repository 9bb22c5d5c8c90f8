//! Background process registry.
//!
//! Detached children (dev servers, watchers) are tracked process-wide, keyed
//! by OS pid, with a rolling tail of their combined output. Exit monitors
//! update entries from their own tasks, so every mutation goes through the
//! registry lock. Children are deliberately allowed to outlive foreground
//! tool executions; [`ProcessRegistry::kill_all`] drains them on shutdown,
//! best effort.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::RwLock;

use crate::tools::truncation::tail_bytes;

/// Rolling tail cap for combined stdout/stderr.
pub const TAIL_CAP_BYTES: usize = 10 * 1024;

const KILL_GRACE: Duration = Duration::from_secs(2);

/// Bounded tail of a child's output.
#[derive(Debug)]
pub struct TailBuffer {
    data: String,
    cap: usize,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: String::new(),
            cap,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.data.push_str(line);
        self.data.push('\n');
        if self.data.len() > self.cap {
            self.data = tail_bytes(&self.data, self.cap).to_string();
        }
    }

    pub fn contents(&self) -> String {
        self.data.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state")]
pub enum ProcessStatus {
    Running,
    Exited { code: i32 },
    Killed,
}

/// Snapshot of a tracked child.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub status: ProcessStatus,
}

impl ProcessInfo {
    pub fn is_running(&self) -> bool {
        matches!(self.status, ProcessStatus::Running)
    }
}

struct ProcessEntry {
    info: ProcessInfo,
    tail: Arc<parking_lot::Mutex<TailBuffer>>,
    /// Keeps the exit monitor alive for the child's lifetime.
    _monitor: tokio::task::JoinHandle<()>,
}

/// Handle returned by [`ProcessRegistry::spawn`]; the tail is shared with the
/// registry entry so startup output can be observed immediately.
pub struct SpawnedProcess {
    pub pid: u32,
    pub tail: Arc<parking_lot::Mutex<TailBuffer>>,
}

/// Process-wide registry of background children, keyed by pid.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    processes: Arc<RwLock<HashMap<u32, ProcessEntry>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a detached shell command, piping stdout/stderr into a rolling
    /// tail, and track it. The child gets its own process group so the whole
    /// tree can be signalled.
    pub async fn spawn(&self, command: &str, working_dir: &Path) -> anyhow::Result<SpawnedProcess> {
        let mut cmd = shell_command(command);
        cmd.current_dir(working_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("spawned child has no pid"))?;

        let tail = Arc::new(parking_lot::Mutex::new(TailBuffer::new(TAIL_CAP_BYTES)));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::spawn(pipe_into_tail(stdout, Arc::clone(&tail)));
        tokio::spawn(pipe_into_tail(stderr, Arc::clone(&tail)));

        let registry = self.clone();
        let monitor = tokio::spawn(async move {
            let status = child.wait().await;
            let code = status.as_ref().ok().and_then(|s| s.code()).unwrap_or(-1);
            registry.mark_exited(pid, code).await;
        });

        let info = ProcessInfo {
            pid,
            command: command.to_string(),
            started_at: Utc::now(),
            status: ProcessStatus::Running,
        };
        tracing::info!(pid, command, "background process spawned");

        self.processes.write().await.insert(
            pid,
            ProcessEntry {
                info,
                tail: Arc::clone(&tail),
                _monitor: monitor,
            },
        );

        Ok(SpawnedProcess { pid, tail })
    }

    async fn mark_exited(&self, pid: u32, code: i32) {
        let mut processes = self.processes.write().await;
        if let Some(entry) = processes.get_mut(&pid) {
            if entry.info.is_running() {
                tracing::info!(pid, code, "background process exited");
                entry.info.status = ProcessStatus::Exited { code };
            }
        }
    }

    pub async fn get(&self, pid: u32) -> Option<ProcessInfo> {
        self.processes.read().await.get(&pid).map(|e| e.info.clone())
    }

    pub async fn list(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self
            .processes
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect();
        infos.sort_by_key(|i| i.started_at);
        infos
    }

    /// Current rolling tail for a child.
    pub async fn tail(&self, pid: u32) -> Option<String> {
        self.processes
            .read()
            .await
            .get(&pid)
            .map(|e| e.tail.lock().contents())
    }

    /// SIGTERM the child's process group, escalating to SIGKILL after the
    /// grace period.
    pub async fn kill(&self, pid: u32) -> anyhow::Result<()> {
        let running = {
            let processes = self.processes.read().await;
            let entry = processes
                .get(&pid)
                .ok_or_else(|| anyhow::anyhow!("no tracked process with pid {}", pid))?;
            entry.info.is_running()
        };
        if !running {
            anyhow::bail!("process {} is not running", pid);
        }

        terminate_tree(pid).await;

        let mut processes = self.processes.write().await;
        if let Some(entry) = processes.get_mut(&pid) {
            entry.info.status = ProcessStatus::Killed;
        }
        tracing::info!(pid, "background process killed");
        Ok(())
    }

    pub async fn remove(&self, pid: u32) {
        self.processes.write().await.remove(&pid);
    }

    /// Kill every running child. Called on process exit; children that
    /// refuse the signal are left behind by design.
    pub async fn kill_all(&self) {
        let running: Vec<u32> = self
            .processes
            .read()
            .await
            .values()
            .filter(|e| e.info.is_running())
            .map(|e| e.info.pid)
            .collect();

        for pid in running {
            terminate_tree(pid).await;
            self.mark_exited(pid, -1).await;
        }
    }
}

fn shell_command(command: &str) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        #[cfg(unix)]
        {
            c.process_group(0);
        }
        c
    };
    cmd.env("NO_COLOR", "1");
    cmd
}

async fn pipe_into_tail<R>(pipe: Option<R>, tail: Arc<parking_lot::Mutex<TailBuffer>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else { return };
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tail.lock().push_line(&line);
    }
}

/// Zero-signal liveness probe.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // kill(pid, 0) succeeds (or fails with EPERM) iff the pid exists.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

/// Terminate a process tree: TERM the group, wait out the grace period,
/// then KILL anything still standing.
pub async fn terminate_tree(pid: u32) {
    #[cfg(unix)]
    {
        let pgid = format!("-{}", pid);
        let group_ok = std::process::Command::new("kill")
            .arg("-TERM")
            .arg(&pgid)
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !group_ok {
            let _ = std::process::Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status();
        }

        tokio::time::sleep(KILL_GRACE).await;

        if pid_alive(pid) {
            let _ = std::process::Command::new("kill").arg("-KILL").arg(&pgid).status();
            let _ = std::process::Command::new("kill")
                .arg("-KILL")
                .arg(pid.to_string())
                .status();
        }
    }

    #[cfg(windows)]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output();
        tokio::time::sleep(KILL_GRACE).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_buffer_keeps_recent_output() {
        let mut tail = TailBuffer::new(32);
        for i in 0..100 {
            tail.push_line(&format!("line {}", i));
        }
        let contents = tail.contents();
        assert!(contents.len() <= 32);
        assert!(contents.contains("line 99"));
        assert!(!contents.contains("line 1\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_tracks_and_observes_exit() {
        let registry = ProcessRegistry::new();
        let spawned = registry
            .spawn("echo started; sleep 0.1", Path::new("."))
            .await
            .unwrap();

        let info = registry.get(spawned.pid).await.unwrap();
        assert!(info.is_running());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let info = registry.get(spawned.pid).await.unwrap();
        assert_eq!(info.status, ProcessStatus::Exited { code: 0 });

        let tail = registry.tail(spawned.pid).await.unwrap();
        assert!(tail.contains("started"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_stops_a_running_child() {
        let registry = ProcessRegistry::new();
        let spawned = registry.spawn("sleep 30", Path::new(".")).await.unwrap();

        registry.kill(spawned.pid).await.unwrap();
        let info = registry.get(spawned.pid).await.unwrap();
        assert_eq!(info.status, ProcessStatus::Killed);
        assert!(!pid_alive(spawned.pid) || info.status == ProcessStatus::Killed);
    }

    #[cfg(unix)]
    #[test]
    fn pid_alive_distinguishes_live_and_dead() {
        assert!(pid_alive(std::process::id()));
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!pid_alive(pid));
    }
}
