//! Centralized command execution with consistent error handling.
//!
//! This module provides a unified API for running external commands,
//! ensuring all commands capture stderr and provide useful error messages.
//! Long-running commands go through [`Cmd::run_streamed`], which relays
//! output line-by-line and enforces the idle watchdog.

use anyhow::{bail, Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel;
use crate::errors::BuildErrorKind;

/// Default idle threshold for streamed commands.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Process-wide idle threshold, overridable from the build configuration.
static IDLE_TIMEOUT_SECS: std::sync::atomic::AtomicU64 =
    std::sync::atomic::AtomicU64::new(15 * 60);

/// Set the watchdog threshold every subsequent command inherits.
pub fn set_default_idle_timeout(timeout: Duration) {
    IDLE_TIMEOUT_SECS.store(timeout.as_secs().max(1), std::sync::atomic::Ordering::SeqCst);
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(IDLE_TIMEOUT_SECS.load(std::sync::atomic::Ordering::SeqCst))
}

/// Grace period between SIGTERM and SIGKILL when tearing a subprocess down.
const TERM_GRACE: Duration = Duration::from_secs(10);

/// How many trailing stderr lines an error report carries.
pub const STDERR_TAIL_LINES: usize = 40;

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }

    /// Last lines of stderr for error reports.
    pub fn stderr_tail(&self) -> String {
        tail_lines(&self.stderr, STDERR_TAIL_LINES)
    }
}

/// Keep the last `n` lines of a block of text.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    current_dir: Option<std::path::PathBuf>,
    stdin_data: Option<Vec<u8>>,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    /// Custom error message prefix.
    error_prefix: Option<String>,
    idle_timeout: Duration,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            stdin_data: None,
            allow_fail: false,
            error_prefix: None,
            idle_timeout: default_idle_timeout(),
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.envs
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    /// Set the working directory.
    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Feed bytes to the child's stdin.
    pub fn stdin_bytes(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin_data = Some(data.into());
        self
    }

    /// Allow non-zero exit codes without failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Override the idle watchdog threshold for streamed runs.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn failure(&self, result: &CommandResult) -> anyhow::Error {
        let prefix = self
            .error_prefix
            .clone()
            .unwrap_or_else(|| format!("'{}' failed", self.program));
        let stderr = result.stderr_tail();
        if stderr.is_empty() {
            anyhow::anyhow!("{} (exit code {})", prefix, result.code())
        } else {
            anyhow::anyhow!("{} (exit code {}):\n{}", prefix, result.code(), stderr)
        }
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        let mut cmd = self.build();
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().with_context(|| {
            format!("Failed to execute '{}'. Is it installed?", self.program)
        })?;

        if let Some(data) = &self.stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(data)
                    .with_context(|| format!("writing stdin to '{}'", self.program))?;
            }
        } else {
            drop(child.stdin.take());
        }

        let output = child.wait_with_output().with_context(|| {
            format!("Failed to collect output from '{}'", self.program)
        })?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !self.allow_fail && !result.success() {
            return Err(self.failure(&result));
        }

        Ok(result)
    }

    /// Run the command while relaying output line-by-line to the log.
    ///
    /// Enforces the idle watchdog: if neither stream produces output for the
    /// configured threshold, the child is terminated (SIGTERM, then SIGKILL
    /// after a grace period) and the call fails with `Stalled`. Cancellation
    /// requests terminate the child the same way and fail with `Cancelled`.
    pub fn run_streamed(self) -> Result<CommandResult> {
        let mut cmd = self.build();
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().with_context(|| {
            format!("Failed to execute '{}'. Is it installed?", self.program)
        })?;
        let pid = child.id();

        enum Line {
            Out(String),
            Err(String),
        }

        let (tx, rx) = mpsc::channel::<Line>();
        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");

        let tx_out = tx.clone();
        let out_reader = thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                if tx_out.send(Line::Out(line)).is_err() {
                    break;
                }
            }
        });
        let err_reader = thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                if tx.send(Line::Err(line)).is_err() {
                    break;
                }
            }
        });

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        let mut last_output = Instant::now();
        let mut abort: Option<BuildErrorKind> = None;

        loop {
            match rx.recv_timeout(Duration::from_millis(500)) {
                Ok(Line::Out(line)) => {
                    log::info!("  {}", line);
                    stdout_buf.push_str(&line);
                    stdout_buf.push('\n');
                    last_output = Instant::now();
                }
                Ok(Line::Err(line)) => {
                    log::info!("  {}", line);
                    stderr_buf.push_str(&line);
                    stderr_buf.push('\n');
                    last_output = Instant::now();
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if cancel::is_cancelled() {
                        abort = Some(BuildErrorKind::Cancelled);
                        break;
                    }
                    if last_output.elapsed() > self.idle_timeout {
                        abort = Some(BuildErrorKind::Stalled);
                        break;
                    }
                    // Readers may still hold the channel open briefly after exit.
                    if let Ok(Some(_)) = child.try_wait() {
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        if abort.is_some() {
            terminate(pid, &mut child);
        }

        let status = child
            .wait()
            .with_context(|| format!("waiting for '{}'", self.program))?;
        let _ = out_reader.join();
        let _ = err_reader.join();

        // Drain lines that raced with the exit.
        while let Ok(line) = rx.try_recv() {
            match line {
                Line::Out(l) => {
                    stdout_buf.push_str(&l);
                    stdout_buf.push('\n');
                }
                Line::Err(l) => {
                    stderr_buf.push_str(&l);
                    stderr_buf.push('\n');
                }
            }
        }

        match abort {
            Some(BuildErrorKind::Stalled) => {
                return Err(anyhow::anyhow!(
                    "'{}' produced no output for {}s",
                    self.program,
                    self.idle_timeout.as_secs()
                )
                .context(BuildErrorKind::Stalled));
            }
            Some(kind) => {
                return Err(
                    anyhow::anyhow!("'{}' terminated on request", self.program).context(kind)
                );
            }
            None => {}
        }

        let result = CommandResult {
            status,
            stdout: stdout_buf,
            stderr: stderr_buf,
        };

        if !self.allow_fail && !result.success() {
            return Err(self.failure(&result));
        }

        Ok(result)
    }
}

/// Terminate a child politely, then forcefully.
fn terminate(pid: u32, child: &mut std::process::Child) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

// =============================================================================
// Convenience functions
// =============================================================================

/// Run a command with arguments. Fails with stderr on error.
pub fn run<I, S>(program: &str, args: I) -> Result<CommandResult>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut cmd = Cmd::new(program);
    for arg in args {
        cmd = cmd.arg(arg);
    }
    cmd.run()
}

/// Check if a program exists in PATH.
///
/// Returns the full path if found, None otherwise.
pub fn which(program: &str) -> Option<String> {
    let result = Cmd::new("which").arg(program).allow_fail().run().ok()?;

    if result.success() {
        let path = result.stdout_trimmed();
        if !path.is_empty() {
            return Some(path.to_string());
        }
    }
    None
}

/// Check if a program exists in PATH (bool version).
pub fn exists(program: &str) -> bool {
    which(program).is_some()
}

// =============================================================================
// Retry
// =============================================================================

/// Attempts for network-dependent operations.
pub const NETWORK_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Run `op` up to `attempts` times, sleeping with exponential backoff
/// between failures. The final error carries the `Network` kind.
pub fn retry_network<T>(
    what: &str,
    attempts: u32,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut last_err = None;
    for attempt in 1..=attempts {
        if cancel::is_cancelled() {
            bail!("cancelled while retrying {what}");
        }
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < attempts {
                    let delay = backoff_delay(attempt);
                    log::warn!(
                        "{} failed (attempt {}/{}), retrying in {}s: {:#}",
                        what,
                        attempt,
                        attempts,
                        delay.as_secs(),
                        e
                    );
                    thread::sleep(delay);
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("{what} failed"))
        .context(BuildErrorKind::Network)
        .context(format!("{what} failed after {attempts} attempts")))
}

/// Delay before the next attempt: base * 2^(attempt-1), capped.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
    BACKOFF_CAP.min(BACKOFF_BASE.saturating_mul(factor as u32))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::kind_of;

    #[test]
    fn test_run_success() {
        let result = run("echo", ["hello"]).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[test]
    fn test_run_captures_stderr() {
        // `ls` on a non-existent file writes to stderr
        let result = Cmd::new("ls")
            .arg("/nonexistent_path_12345")
            .allow_fail()
            .run()
            .unwrap();

        assert!(!result.success());
        assert!(!result.stderr.is_empty());
    }

    #[test]
    fn test_run_failure_includes_stderr() {
        let err = run("ls", ["/nonexistent_path_12345"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("No such file") || msg.contains("cannot access"));
    }

    #[test]
    fn test_custom_error_message() {
        let err = Cmd::new("false")
            .error_msg("Custom build step failed")
            .run()
            .unwrap_err();

        assert!(err.to_string().contains("Custom build step failed"));
    }

    #[test]
    fn test_allow_fail() {
        let result = Cmd::new("false").allow_fail().run().unwrap();

        assert!(!result.success());
        assert_eq!(result.code(), 1);
    }

    #[test]
    fn test_stdin_bytes() {
        let result = Cmd::new("cat").stdin_bytes("piped input").run().unwrap();
        assert_eq!(result.stdout_trimmed(), "piped input");
    }

    #[test]
    fn test_env_passthrough() {
        let result = Cmd::new("sh")
            .args(["-c", "echo $ZFORGE_TEST_VAR"])
            .env("ZFORGE_TEST_VAR", "42")
            .run()
            .unwrap();
        assert_eq!(result.stdout_trimmed(), "42");
    }

    #[test]
    fn test_which_exists() {
        assert!(which("sh").is_some());
    }

    #[test]
    fn test_which_not_exists() {
        assert!(which("nonexistent_program_12345").is_none());
    }

    #[test]
    fn test_streamed_captures_output() {
        let result = Cmd::new("sh")
            .args(["-c", "echo one; echo two >&2"])
            .run_streamed()
            .unwrap();
        assert!(result.stdout.contains("one"));
        assert!(result.stderr.contains("two"));
    }

    #[test]
    fn test_streamed_watchdog_kills_silent_child() {
        let err = Cmd::new("sleep")
            .arg("60")
            .idle_timeout(Duration::from_millis(600))
            .run_streamed()
            .unwrap_err();
        assert_eq!(kind_of(&err), Some(BuildErrorKind::Stalled));
    }

    #[test]
    fn test_tail_lines() {
        let text = "a\nb\nc\nd";
        assert_eq!(tail_lines(text, 2), "c\nd");
        assert_eq!(tail_lines(text, 10), text);
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_network_eventually_succeeds() {
        let mut calls = 0;
        let result = retry_network("test op", 3, || {
            calls += 1;
            if calls < 2 {
                anyhow::bail!("transient");
            }
            Ok(calls)
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_retry_network_exhaustion_carries_kind() {
        let err = retry_network("test op", 2, || -> Result<()> {
            anyhow::bail!("always down")
        })
        .unwrap_err();
        assert_eq!(kind_of(&err), Some(BuildErrorKind::Network));
    }
}
