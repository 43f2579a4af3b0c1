//! Child-process execution with captured output and bounded waits.
//!
//! Arguments are handed to the OS as an argv vector, never through a shell,
//! so each one arrives intact no matter what it contains. [`shell_quote`]
//! renders the same argv as a copy-pasteable command line for logs.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

/// A fully described child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Complete environment for the child. `None` inherits the parent's.
    pub env: Option<Vec<(String, String)>>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shell-quoted command line, suitable for logs and error messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Output of a process that exited with status zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("{program} exited with {}: {}", exit_label(.code), .stderr.trim())]
    Failed {
        program: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The runner killed the child because the timeout elapsed.
    #[error("{program} killed after {}s timeout", .after.as_secs_f64())]
    TimedOut { program: String, after: Duration },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {c}"),
        None => "a signal".to_string(),
    }
}

#[allow(async_fn_in_trait)] // only used with concrete runners
pub trait ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<Captured, RunError>;
}

impl<T: ProcessRunner> ProcessRunner for std::sync::Arc<T> {
    async fn run(&self, invocation: &Invocation) -> Result<Captured, RunError> {
        (**self).run(invocation).await
    }
}

/// Runs invocations as real child processes via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<Captured, RunError> {
        let mut cmd = tokio::process::Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(env) = &invocation.env {
            cmd.env_clear();
            cmd.envs(env.iter().map(|(k, v)| (k, v)));
        }
        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd.spawn().map_err(|e| RunError::Spawn {
            program: invocation.program.clone(),
            message: e.to_string(),
        })?;

        // Dropping the wait future on timeout drops the child, and
        // kill_on_drop terminates it.
        let output = match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        program = %invocation.program,
                        timeout_s = limit.as_secs_f64(),
                        "process timed out, killed"
                    );
                    return Err(RunError::TimedOut {
                        program: invocation.program.clone(),
                        after: limit,
                    });
                }
            },
            None => child.wait_with_output().await,
        }
        .map_err(|e| RunError::Spawn {
            program: invocation.program.clone(),
            message: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            Ok(Captured { stdout, stderr })
        } else {
            Err(RunError::Failed {
                program: invocation.program.clone(),
                code: output.status.code(),
                stdout,
                stderr,
            })
        }
    }
}

/// Quote a single word for a POSIX shell. Words made only of safe
/// characters are returned unchanged.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%{}".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_leaves_plain_words_alone() {
        assert_eq!(shell_quote("startvm"), "startvm");
        assert_eq!(shell_quote("--type"), "--type");
        assert_eq!(shell_quote("/tmp/disk.vdi"), "/tmp/disk.vdi");
    }

    #[test]
    fn quote_wraps_spaces_and_specials() {
        assert_eq!(shell_quote("SATA Controller"), "'SATA Controller'");
        assert_eq!(shell_quote("a;rm -rf"), "'a;rm -rf'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn command_line_quotes_each_argument() {
        let inv = Invocation::new("VBoxManage")
            .arg("startvm")
            .arg("my vm")
            .args(["--type", "headless"]);
        assert_eq!(inv.command_line(), "VBoxManage startvm 'my vm' --type headless");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_captures_stdout() {
        let inv = Invocation::new("sh").args(["-c", "echo hello; echo oops >&2"]);
        let out = SystemRunner.run(&inv).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_reports_nonzero_exit() {
        let inv = Invocation::new("sh").args(["-c", "echo bad >&2; exit 3"]);
        match SystemRunner.run(&inv).await {
            Err(RunError::Failed { code, stderr, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr.trim(), "bad");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_times_out() {
        let inv = Invocation::new("sleep")
            .arg("5")
            .timeout(Some(Duration::from_millis(100)));
        assert!(matches!(
            SystemRunner.run(&inv).await,
            Err(RunError::TimedOut { .. })
        ));
    }

    #[tokio::test]
    async fn system_runner_reports_missing_program() {
        let inv = Invocation::new("definitely-not-a-real-program-vboxctl");
        assert!(matches!(
            SystemRunner.run(&inv).await,
            Err(RunError::Spawn { .. })
        ));
    }
}
