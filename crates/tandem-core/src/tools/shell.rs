//! Shell tool - bounded foreground command execution
//!
//! Commands run through the platform shell inside the task workdir. On
//! non-Windows platforms the child gets its own process group so a timeout
//! kills the whole tree. When a sandbox profile is configured the command
//! line is passed through the sandbox wrapper first; the wrapper is a
//! pluggable transform, not part of the dispatch contract.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{ToolOutput, MAX_RESULT_BYTES, MAX_RESULT_LINES};
use crate::tools::truncation;

const RAW_CAPTURE_MAX_LINES: usize = 8_000;
const RAW_CAPTURE_MAX_BYTES: usize = 2_000_000;
const KILL_GRACE: Duration = Duration::from_millis(800);

static ANSI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[a-zA-Z]|\x1b\][^\x07]*\x07").expect("valid ansi regex")
});

/// Wrap a command line in the configured sandbox profile.
///
/// The transform is deliberately dumb: platforms with a profile-file
/// sandbox runner get the runner invocation, everything else runs plainly.
pub fn sandbox_wrap(command: &str, profile: Option<&str>) -> String {
    let Some(profile) = profile.filter(|p| !p.trim().is_empty()) else {
        return command.to_string();
    };

    if cfg!(target_os = "macos") {
        format!("sandbox-exec -f {profile} sh -c '{}'", command.replace('\'', "'\\''"))
    } else {
        // No sandbox runner on this platform; run plainly.
        let _ = profile;
        command.to_string()
    }
}

pub(crate) fn build_shell_command(command: &str, workdir: &std::path::Path) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    };

    cmd.env("NO_COLOR", "1");
    cmd.current_dir(workdir);
    cmd
}

pub(crate) fn configure_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
}

pub(crate) struct BoundedLineBuffer {
    lines: VecDeque<String>,
    total_bytes: usize,
    dropped_lines: usize,
    max_lines: usize,
    max_bytes: usize,
}

impl BoundedLineBuffer {
    pub(crate) fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            total_bytes: 0,
            dropped_lines: 0,
            max_lines,
            max_bytes,
        }
    }

    pub(crate) fn push_line(&mut self, line: &str) {
        self.total_bytes = self.total_bytes.saturating_add(line.len());
        self.lines.push_back(line.to_string());

        while self.lines.len() > self.max_lines || self.total_bytes > self.max_bytes {
            match self.lines.pop_front() {
                Some(removed) => {
                    self.total_bytes = self.total_bytes.saturating_sub(removed.len());
                    self.dropped_lines += 1;
                }
                None => break,
            }
        }
    }

    pub(crate) fn snapshot(&self) -> String {
        let mut out = self
            .lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        if self.dropped_lines > 0 {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!(
                "[... omitted {} earlier line(s) due to buffer limits ...]",
                self.dropped_lines
            ));
        }
        out
    }
}

pub(crate) async fn collect_pipe<R>(pipe: Option<R>, buffer: Arc<Mutex<BoundedLineBuffer>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else {
        return;
    };
    let mut reader = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        buffer.lock().await.push_line(&line);
    }
}

#[cfg(unix)]
pub(crate) fn signal_process_group(pid: u32, signal: &str) -> bool {
    let pgid = format!("-{pid}");
    let group_ok = std::process::Command::new("kill")
        .arg(signal)
        .arg(&pgid)
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !group_ok {
        return std::process::Command::new("kill")
            .arg(signal)
            .arg(pid.to_string())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
    }
    true
}

pub(crate) async fn terminate_process_tree(child: &mut Child) {
    let Some(pid) = child.id() else {
        let _ = child.kill().await;
        return;
    };

    #[cfg(unix)]
    {
        signal_process_group(pid, "-TERM");
        tokio::time::sleep(Duration::from_millis(200)).await;
        signal_process_group(pid, "-KILL");
    }

    #[cfg(windows)]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output();
    }

    if timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// `execute-command` - run one foreground command with a bounded timeout
/// and return the captured stdout+stderr.
pub async fn execute_command(
    command: &str,
    workdir: &std::path::Path,
    timeout_duration: Duration,
    sandbox_profile: Option<&str>,
) -> ToolOutput {
    let effective = sandbox_wrap(command, sandbox_profile);
    tracing::info!(command = %effective, workdir = %workdir.display(), "executing command");

    let mut cmd = build_shell_command(&effective, workdir);
    configure_process_group(&mut cmd);
    cmd.kill_on_drop(true);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return ToolOutput::error(format!("failed to spawn command: {e}")),
    };

    let buffer = Arc::new(Mutex::new(BoundedLineBuffer::new(
        RAW_CAPTURE_MAX_LINES,
        RAW_CAPTURE_MAX_BYTES,
    )));
    let stdout_handle = tokio::spawn(collect_pipe(child.stdout.take(), Arc::clone(&buffer)));
    let stderr_handle = tokio::spawn(collect_pipe(child.stderr.take(), Arc::clone(&buffer)));

    let (exit_code, timed_out) = match timeout(timeout_duration, child.wait()).await {
        Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
        Ok(Err(e)) => {
            tracing::error!("process wait error: {e}");
            (-1, false)
        }
        Err(_) => {
            terminate_process_tree(&mut child).await;
            (-1, true)
        }
    };

    let _ = stdout_handle.await;
    let _ = stderr_handle.await;

    let captured = buffer.lock().await.snapshot();
    let output = truncation::bounded(&strip_ansi(&captured), MAX_RESULT_LINES, MAX_RESULT_BYTES);

    if timed_out {
        ToolOutput::error(format!(
            "command timed out after {} ms\n{output}",
            timeout_duration.as_millis()
        ))
    } else if exit_code == 0 {
        ToolOutput::success(output)
    } else {
        ToolOutput::error(format!("command exited with code {exit_code}\n{output}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workdir() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let dir = workdir();
        let out = execute_command(
            "echo out && echo err 1>&2",
            dir.path(),
            Duration::from_secs(10),
            None,
        )
        .await;
        assert!(!out.is_error, "{}", out.text);
        assert!(out.text.contains("out"));
        assert!(out.text.contains("err"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_tool_error_with_output() {
        let dir = workdir();
        let out = execute_command(
            "echo boom && exit 3",
            dir.path(),
            Duration::from_secs(10),
            None,
        )
        .await;
        assert!(out.is_error);
        assert!(out.text.contains("code 3"));
        assert!(out.text.contains("boom"));
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let dir = workdir();
        let started = std::time::Instant::now();
        let out = execute_command("sleep 30", dir.path(), Duration::from_millis(300), None).await;
        assert!(out.is_error);
        assert!(out.text.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn runs_in_the_workdir() {
        let dir = workdir();
        let out = execute_command("pwd", dir.path(), Duration::from_secs(10), None).await;
        let expected = dir.path().canonicalize().expect("canonical");
        assert!(out.text.contains(&expected.display().to_string()));
    }

    #[test]
    fn sandbox_wrap_without_profile_is_identity() {
        assert_eq!(sandbox_wrap("echo hi", None), "echo hi");
        assert_eq!(sandbox_wrap("echo hi", Some("  ")), "echo hi");
    }

    #[test]
    fn bounded_buffer_drops_oldest_lines() {
        let mut buffer = BoundedLineBuffer::new(2, 1024);
        buffer.push_line("one");
        buffer.push_line("two");
        buffer.push_line("three");
        let text = buffer.snapshot();
        assert!(!text.contains("one"));
        assert!(text.contains("three"));
        assert!(text.contains("omitted 1 earlier"));
    }
}
