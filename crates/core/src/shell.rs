//! Local Shell Execution
//!
//! Runs shell passthrough commands behind a denylist and a hard timeout.

use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Patterns blocked when no denylist is configured.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "mkfs",
    "format c:",
    "dd if=",
    "fdisk",
    "parted",
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    "init 0",
    "init 6",
];

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const COMPLETED_MESSAGE: &str = "Command completed successfully";

/// Time a timed-out command gets between SIGTERM and SIGKILL.
const GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("No command provided")]
    Empty,
    #[error("Command blocked for safety: matches denied pattern '{pattern}'")]
    Blocked { pattern: String },
    #[error("Failed to start command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Command timed out after {}s and was terminated", .0.as_secs_f32())]
    Timeout(Duration),
    #[error("{message}")]
    Failed { code: Option<i32>, message: String },
}

/// Case-insensitive substring denylist.
///
/// A command containing any pattern anywhere is rejected, including inside
/// quotes or arguments of an otherwise harmless command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyPolicy {
    patterns: Vec<String>,
}

impl SafetyPolicy {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    /// Parses a denylist file: one pattern per line, `#` starts a comment line.
    pub fn from_lines(text: &str) -> Self {
        Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.starts_with('#')),
        )
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// The first denied pattern contained in `command`, if any.
    pub fn violation(&self, command: &str) -> Option<&str> {
        let lowered = command.to_lowercase();
        self.patterns
            .iter()
            .find(|p| lowered.contains(p.as_str()))
            .map(String::as_str)
    }
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DENYLIST)
    }
}

/// Spawns commands through the platform shell.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    policy: SafetyPolicy,
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new(policy: SafetyPolicy, timeout: Duration) -> Self {
        Self { policy, timeout }
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `command`, returning its stdout on a zero exit status.
    pub async fn run(&self, command: &str) -> Result<String, ShellError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ShellError::Empty);
        }
        if let Some(pattern) = self.policy.violation(command) {
            warn!(%command, %pattern, "Blocked shell command");
            return Err(ShellError::Blocked {
                pattern: pattern.to_string(),
            });
        }

        info!(%command, "Running shell command");
        let mut cmd = shell_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout reaches everything the shell forked.
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd.spawn()?;
        let group = child.id();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collect = async {
            let (status, stdout, stderr) =
                tokio::try_join!(child.wait(), read_pipe(stdout), read_pipe(stderr))?;
            Ok::<_, std::io::Error>((status, stdout, stderr))
        };

        let (status, stdout, stderr) = match tokio::time::timeout(self.timeout, collect).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(%command, timeout = ?self.timeout, "Shell command timed out");
                terminate_process_group(&mut child, group, GRACE_PERIOD).await;
                return Err(ShellError::Timeout(self.timeout));
            }
        };
        if status.success() {
            let stdout = String::from_utf8_lossy(&stdout).trim_end().to_string();
            if stdout.is_empty() {
                Ok(COMPLETED_MESSAGE.to_string())
            } else {
                Ok(stdout)
            }
        } else {
            let code = status.code();
            let stderr = String::from_utf8_lossy(&stderr).trim_end().to_string();
            let message = if !stderr.is_empty() {
                stderr
            } else if let Some(code) = code {
                format!("Command exited with code {}", code)
            } else {
                "Command was terminated by a signal".to_string()
            };
            Err(ShellError::Failed { code, message })
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(SafetyPolicy::default(), DEFAULT_TIMEOUT)
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Stops the shell and every process it started.
///
/// SIGTERM goes to the whole group first. Once the shell exits or the grace
/// period runs out, SIGKILL reaches whatever is left, then the shell is reaped.
#[cfg(unix)]
async fn terminate_process_group(child: &mut Child, group: Option<u32>, grace: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pgid) = group.map(|id| Pid::from_raw(id as i32)) else {
        return;
    };

    if let Err(e) = killpg(pgid, Signal::SIGTERM)
        && e != Errno::ESRCH
    {
        warn!(pgid = pgid.as_raw(), error = ?e, "SIGTERM to process group failed");
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if child.try_wait().ok().flatten().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Descendants may outlive the shell or ignore SIGTERM.
    if let Err(e) = killpg(pgid, Signal::SIGKILL)
        && e != Errno::ESRCH
    {
        warn!(pgid = pgid.as_raw(), error = ?e, "SIGKILL to process group failed");
    }
    let _ = child.wait().await;
    debug!(pgid = pgid.as_raw(), "Process group terminated");
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut Child, _group: Option<u32>, _grace: Duration) {
    let _ = child.kill().await;
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denylist_is_substring_and_case_insensitive() {
        let policy = SafetyPolicy::default();
        assert_eq!(policy.violation("rm -rf /tmp/build"), Some("rm -rf"));
        assert_eq!(policy.violation("echo rm -rf (not really)"), Some("rm -rf"));
        assert_eq!(policy.violation("sudo SHUTDOWN -h now"), Some("shutdown"));
        assert_eq!(policy.violation("ls -la"), None);
    }

    #[test]
    fn test_policy_from_lines() {
        let policy = SafetyPolicy::from_lines("# destructive\nRM -RF\n\n  git push --force  \n");
        assert_eq!(policy.patterns(), ["rm -rf", "git push --force"]);
        assert!(policy.violation("git push --force origin main").is_some());
        assert!(policy.violation("reboot").is_none());
    }

    #[tokio::test]
    async fn test_blocked_command_is_never_run() {
        let executor = ShellExecutor::default();
        let err = executor.run("echo hi && rm -rf ./target").await.unwrap_err();
        assert!(matches!(err, ShellError::Blocked { ref pattern } if pattern == "rm -rf"));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let err = ShellExecutor::default().run("   ").await.unwrap_err();
        assert!(matches!(err, ShellError::Empty));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_command_output() {
        let executor = ShellExecutor::default();
        assert_eq!(executor.run("echo hello").await.unwrap(), "hello");
        assert_eq!(executor.run("true").await.unwrap(), COMPLETED_MESSAGE);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_command_reports_stderr_or_exit_code() {
        let executor = ShellExecutor::default();
        match executor.run("echo oops >&2; exit 3").await.unwrap_err() {
            ShellError::Failed { code, message } => {
                assert_eq!(code, Some(3));
                assert_eq!(message, "oops");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        match executor.run("exit 4").await.unwrap_err() {
            ShellError::Failed { message, .. } => assert_eq!(message, "Command exited with code 4"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_terminates_command() {
        let executor = ShellExecutor::new(SafetyPolicy::default(), Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = executor.run("sleep 5").await.unwrap_err();
        assert!(matches!(err, ShellError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_terminates_forked_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("still-running");
        let executor = ShellExecutor::new(SafetyPolicy::default(), Duration::from_millis(300));

        let command = format!("(sleep 1 && touch {}) & wait; echo done", marker.display());
        let err = executor.run(&command).await.unwrap_err();
        assert!(matches!(err, ShellError::Timeout(_)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "a descendant of the timed-out shell kept running");
    }
}
