//! Async command sessions - named long-running shell processes
//!
//! `start-async-cmd` launches a named session and returns after a short
//! observation window with whatever output appeared; the command keeps
//! running. `query-async-cmd` returns the accumulated stdout+stderr so
//! far; `abort-async-cmd` terminates the session's process group. The pool
//! is process-global and mutex-guarded; sessions survive executor
//! termination and die only on explicit abort or manager shutdown.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;

use super::shell::{
    build_shell_command, collect_pipe, configure_process_group, BoundedLineBuffer,
};
use super::{ToolOutput, MAX_RESULT_BYTES, MAX_RESULT_LINES};
use crate::tools::truncation;

/// How long `start` watches a fresh session before returning.
const OBSERVATION_WINDOW: Duration = Duration::from_secs(2);

const SESSION_CAPTURE_MAX_LINES: usize = 20_000;
const SESSION_CAPTURE_MAX_BYTES: usize = 4_000_000;

struct AsyncSession {
    command: String,
    pid: Option<u32>,
    buffer: Arc<AsyncMutex<BoundedLineBuffer>>,
    exited: Arc<AtomicBool>,
}

impl AsyncSession {
    fn is_running(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }
}

/// Global pool of named async command sessions.
#[derive(Default)]
pub struct SessionPool {
    sessions: AsyncMutex<HashMap<String, AsyncSession>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch a named session. Returns after the observation window with
    /// the output seen so far; the command continues in the background.
    pub async fn start(&self, name: &str, command: &str, workdir: &Path) -> ToolOutput {
        if name.trim().is_empty() {
            return ToolOutput::error("async session needs a non-empty name");
        }

        {
            let sessions = self.sessions.lock().await;
            if sessions.get(name).is_some_and(AsyncSession::is_running) {
                return ToolOutput::error(format!("session '{name}' is already running"));
            }
        }

        let mut cmd: Command = build_shell_command(command, workdir);
        configure_process_group(&mut cmd);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolOutput::error(format!("failed to start session: {e}")),
        };
        let pid = child.id();

        let buffer = Arc::new(AsyncMutex::new(BoundedLineBuffer::new(
            SESSION_CAPTURE_MAX_LINES,
            SESSION_CAPTURE_MAX_BYTES,
        )));
        let exited = Arc::new(AtomicBool::new(false));

        tokio::spawn(collect_pipe(child.stdout.take(), Arc::clone(&buffer)));
        tokio::spawn(collect_pipe(child.stderr.take(), Arc::clone(&buffer)));

        let watcher_exited = Arc::clone(&exited);
        let watcher_name = name.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;
            watcher_exited.store(true, Ordering::SeqCst);
            tracing::info!(session = %watcher_name, status = ?status, "async session exited");
        });

        tracing::info!(session = %name, pid = ?pid, command = %command, "async session started");

        self.sessions.lock().await.insert(
            name.to_string(),
            AsyncSession {
                command: command.to_string(),
                pid,
                buffer: Arc::clone(&buffer),
                exited,
            },
        );

        tokio::time::sleep(OBSERVATION_WINDOW).await;

        let early = buffer.lock().await.snapshot();
        ToolOutput::success(format!(
            "session '{name}' started\n{}",
            truncation::bounded(&early, MAX_RESULT_LINES, MAX_RESULT_BYTES)
        ))
    }

    /// Accumulated output of a session.
    pub async fn query(&self, name: &str) -> ToolOutput {
        let sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(name) else {
            return ToolOutput::error(format!("no async session named '{name}'"));
        };

        let output = session.buffer.lock().await.snapshot();
        let status = if session.is_running() { "running" } else { "exited" };
        ToolOutput::success(format!(
            "session '{name}' ({status})\n{}",
            truncation::bounded(&output, MAX_RESULT_LINES, MAX_RESULT_BYTES)
        ))
    }

    /// Terminate a session's process group.
    pub async fn abort(&self, name: &str) -> ToolOutput {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.remove(name) else {
            return ToolOutput::error(format!("no async session named '{name}'"));
        };

        if !session.is_running() {
            return ToolOutput::success(format!("session '{name}' had already exited"));
        }

        let Some(pid) = session.pid else {
            return ToolOutput::error(format!("session '{name}' has no live pid"));
        };

        #[cfg(unix)]
        {
            super::shell::signal_process_group(pid, "-TERM");
            tracing::info!(session = %name, pid, "async session aborted");
            ToolOutput::success(format!("session '{name}' terminated"))
        }

        #[cfg(windows)]
        {
            let _ = pid;
            ToolOutput::error("aborting a session's process group is not supported on this platform")
        }
    }

    /// Names and statuses of the live pool.
    pub async fn list(&self) -> Vec<(String, String, bool)> {
        let sessions = self.sessions.lock().await;
        let mut out: Vec<(String, String, bool)> = sessions
            .iter()
            .map(|(name, s)| (name.clone(), s.command.clone(), s.is_running()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Kill every running session (manager teardown).
    pub async fn kill_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (name, session) in sessions.drain() {
            if session.is_running() {
                if let Some(pid) = session.pid {
                    #[cfg(unix)]
                    super::shell::signal_process_group(pid, "-TERM");
                    #[cfg(windows)]
                    {
                        let _ = std::process::Command::new("taskkill")
                            .args(["/PID", &pid.to_string(), "/T", "/F"])
                            .output();
                    }
                    tracing::info!(session = %name, pid, "killed session on shutdown");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workdir() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    #[tokio::test]
    async fn start_returns_early_output_and_keeps_running() {
        let dir = workdir();
        let pool = SessionPool::new();

        let out = pool
            .start("ticker", "echo first; sleep 30", dir.path())
            .await;
        assert!(!out.is_error, "{}", out.text);
        assert!(out.text.contains("first"));

        let query = pool.query("ticker").await;
        assert!(query.text.contains("running"));

        let abort = pool.abort("ticker").await;
        assert!(!abort.is_error, "{}", abort.text);
    }

    #[tokio::test]
    async fn query_unknown_session_is_an_error() {
        let pool = SessionPool::new();
        let out = pool.query("ghost").await;
        assert!(out.is_error);
        assert!(out.text.contains("ghost"));
    }

    #[tokio::test]
    async fn abort_unknown_session_is_an_error() {
        let pool = SessionPool::new();
        let out = pool.abort("ghost").await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn query_accumulates_output_across_calls() {
        let dir = workdir();
        let pool = SessionPool::new();
        pool.start("acc", "echo a; sleep 0.1; echo b", dir.path())
            .await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        let query = pool.query("acc").await;
        assert!(query.text.contains('a'));
        assert!(query.text.contains('b'));
    }
}
