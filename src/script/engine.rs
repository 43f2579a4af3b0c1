use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::BestEffort;
use crate::model::{ExecutionStatus, Script, VirtualMachine};
use crate::runner::{ProcessRunner, RunError};

use super::env::{self, EnvSource, LayeredEnv};
use super::interpreter;

/// Normalized outcome of one script run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub cleanup: BestEffort,
}

/// Runs scripts as host processes through a [`ProcessRunner`].
pub struct ScriptEngine<'a, R> {
    runner: &'a R,
    temp_dir: &'a Path,
}

impl<'a, R: ProcessRunner> ScriptEngine<'a, R> {
    pub fn new(runner: &'a R, temp_dir: &'a Path) -> Self {
        Self { runner, temp_dir }
    }

    /// Materialize, run and clean up. Never fails: every outcome, including
    /// a temp file that could not be written, is an [`ExecutionResult`].
    pub async fn execute(
        &self,
        script: &Script,
        target: Option<&VirtualMachine>,
        overlay: &[(String, String)],
    ) -> ExecutionResult {
        let started = Instant::now();

        let path = match self.materialize(script) {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(script = %script.name, error = %e, "could not write script file");
                return ExecutionResult {
                    status: ExecutionStatus::Error,
                    output: String::new(),
                    error: Some(format!("could not write script file: {e}")),
                    duration_ms: elapsed_ms(started),
                    cleanup: BestEffort::Done,
                };
            }
        };

        let environment = LayeredEnv::new()
            .layer(EnvSource::Process, process_vars())
            .layer(EnvSource::Script, script.environment.clone())
            .layer(EnvSource::Caller, overlay.iter().cloned())
            .layer(EnvSource::TargetVm, target.map(env::vm_vars).unwrap_or_default());

        let mut invocation = interpreter::invocation(script.kind, &path, script.run_as_admin)
            .timeout(Some(Duration::from_secs(u64::from(script.timeout_s))));
        invocation.env = Some(environment.merged().into_iter().collect());
        invocation.cwd = script.working_dir.as_deref().map(PathBuf::from);

        tracing::info!(
            script = %script.name,
            kind = %script.kind,
            vm = target.map(|vm| vm.name.as_str()).unwrap_or("-"),
            elevated = script.run_as_admin,
            command = %invocation.command_line(),
            "running script"
        );

        let result = self.runner.run(&invocation).await;
        let duration_ms = elapsed_ms(started);

        let cleanup = BestEffort::from_result(path.close());
        if let BestEffort::Skipped { reason } = &cleanup {
            tracing::warn!(script = %script.name, reason = %reason, "could not remove script file");
        }

        let (status, output, error) = classify(result);
        tracing::info!(script = %script.name, %status, duration_ms, "script finished");
        ExecutionResult {
            status,
            output,
            error,
            duration_ms,
            cleanup,
        }
    }

    fn materialize(&self, script: &Script) -> std::io::Result<tempfile::TempPath> {
        std::fs::create_dir_all(self.temp_dir)?;
        let mut file = tempfile::Builder::new()
            .prefix("script_")
            .suffix(script.file_extension())
            .tempfile_in(self.temp_dir)?;
        file.write_all(script.body.as_bytes())?;
        file.flush()?;
        // Close the handle so interpreters that lock open files can read it.
        Ok(file.into_temp_path())
    }
}

fn classify(
    result: Result<crate::runner::Captured, RunError>,
) -> (ExecutionStatus, String, Option<String>) {
    match result {
        Ok(out) => {
            let stderr = out.stderr.trim();
            let error = (!stderr.is_empty()).then(|| stderr.to_string());
            (ExecutionStatus::Success, out.stdout.trim().to_string(), error)
        }
        Err(RunError::TimedOut { after, .. }) => (
            ExecutionStatus::Timeout,
            String::new(),
            Some(format!(
                "script timed out after {}s and was terminated",
                after.as_secs()
            )),
        ),
        Err(RunError::Failed {
            code,
            stdout,
            stderr,
            ..
        }) => {
            let stderr = stderr.trim();
            let error = if stderr.is_empty() {
                match code {
                    Some(c) => format!("script exited with status {c}"),
                    None => "script was terminated".to_string(),
                }
            } else {
                stderr.to_string()
            };
            (ExecutionStatus::Error, stdout.trim().to_string(), Some(error))
        }
        Err(RunError::Spawn { program, message }) => (
            ExecutionStatus::Error,
            String::new(),
            Some(format!("could not start {program}: {message}")),
        ),
    }
}

/// Host environment, skipping entries that are not valid UTF-8.
fn process_vars() -> Vec<(String, String)> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
