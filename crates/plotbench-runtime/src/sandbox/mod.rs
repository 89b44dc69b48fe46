//! Sandboxed executor for generated plotting scripts.
//!
//! Each script runs in a separate interpreter process inside a fresh
//! temporary directory, with a cleared environment and a hard wall-clock
//! limit. A small embedded harness binds the dataset as `df`, executes the
//! script in an otherwise empty namespace, looks only at the `fig` binding
//! afterwards, and reports back through a JSON status file.
//!
//! Nothing the script does can surface as an error to the caller: every
//! outcome is an [`ExecutionResult`].

use crate::config::SandboxConfig;
use async_trait::async_trait;
use plotbench_core::{Dataset, ExecutionResult};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Failure reason when a script ran cleanly but left no figure in `fig`.
pub const MISSING_FIGURE: &str = "missing figure output";

const HARNESS_SOURCE: &str = include_str!("harness.py");

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runs a generated script against a dataset.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Run `script` with `dataset` bound as `df`.
    ///
    /// On success the figure is at a path derived from `index` alone.
    async fn execute(&self, script: &str, dataset: &Dataset, index: usize) -> ExecutionResult;
}

/// Problems on the executor's own side, as opposed to the script's.
#[derive(Error, Debug)]
enum SandboxError {
    #[error("failed to prepare sandbox: {0}")]
    Setup(#[source] std::io::Error),

    #[error("failed to serialise dataset: {0}")]
    Dataset(#[from] serde_json::Error),

    #[error("failed to launch interpreter '{interpreter}': {source}")]
    Launch {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to store figure at {path}: {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum HarnessStatus {
    Ok,
    Error,
    MissingFigure,
    HarnessError,
}

#[derive(Debug, Deserialize)]
struct HarnessReport {
    status: HarnessStatus,
    #[serde(default)]
    message: Option<String>,
}

/// File names inside one unit's work directory.
struct WorkFiles {
    harness: PathBuf,
    script: PathBuf,
    data: PathBuf,
    figure: PathBuf,
    result: PathBuf,
}

impl WorkFiles {
    fn in_dir(dir: &Path) -> Self {
        Self {
            harness: dir.join("harness.py"),
            script: dir.join("script.py"),
            data: dir.join("data.json"),
            figure: dir.join("figure.png"),
            result: dir.join("result.json"),
        }
    }
}

/// Out-of-process Python executor.
#[derive(Debug, Clone)]
pub struct PythonSandbox {
    config: SandboxConfig,
    plot_dir: PathBuf,
}

impl PythonSandbox {
    pub fn new(config: SandboxConfig, plot_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            plot_dir: plot_dir.into(),
        }
    }

    pub fn plot_dir(&self) -> &Path {
        &self.plot_dir
    }

    /// Where the artifact for `index` lands.
    pub fn artifact_path(&self, index: usize) -> PathBuf {
        self.plot_dir.join(format!("{}.png", index))
    }

    async fn run(
        &self,
        script: &str,
        dataset: &Dataset,
        index: usize,
    ) -> Result<ExecutionResult, SandboxError> {
        let work_dir = tempfile::Builder::new()
            .prefix("plotbench-unit-")
            .tempdir()
            .map_err(SandboxError::Setup)?;
        let files = WorkFiles::in_dir(work_dir.path());

        tokio::fs::write(&files.harness, HARNESS_SOURCE)
            .await
            .map_err(SandboxError::Setup)?;
        tokio::fs::write(&files.script, script)
            .await
            .map_err(SandboxError::Setup)?;
        tokio::fs::write(&files.data, serde_json::to_vec(dataset)?)
            .await
            .map_err(SandboxError::Setup)?;

        let path = std::env::var_os("PATH").unwrap_or_else(|| OsString::from(FALLBACK_PATH));
        let mut command = Command::new(&self.config.interpreter);
        command
            .args(&self.config.args)
            .arg(&files.harness)
            .arg(&files.script)
            .arg(&files.data)
            .arg(&files.figure)
            .arg(&files.result)
            .arg(self.config.dpi.to_string())
            .current_dir(work_dir.path())
            .env_clear()
            .env("PATH", path)
            .env("HOME", work_dir.path())
            .env("MPLCONFIGDIR", work_dir.path())
            .env("MPLBACKEND", "Agg")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| SandboxError::Launch {
            interpreter: self.config.interpreter.clone(),
            source,
        })?;

        let max_stderr = self.config.max_stderr_bytes;
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(read_tail(pipe, max_stderr)));

        let status = match tokio::time::timeout(self.config.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                abort(stderr_task);
                return Ok(ExecutionResult::failure(format!(
                    "failed to wait for interpreter: {}",
                    e
                )));
            }
            Err(_) => {
                let _ = child.kill().await;
                abort(stderr_task);
                return Ok(ExecutionResult::failure(format!(
                    "execution timed out after {}",
                    humantime::format_duration(self.config.timeout)
                )));
            }
        };

        // A leftover grandchild may hold stderr open after the interpreter exits
        let stderr = match stderr_task {
            Some(mut task) => match tokio::time::timeout(Duration::from_secs(1), &mut task).await {
                Ok(joined) => joined.unwrap_or_default(),
                Err(_) => {
                    task.abort();
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        tracing::debug!(
            unit = index,
            elapsed_ms = started.elapsed().as_millis() as u64,
            exit = ?status.code(),
            "Script process finished"
        );

        let report = match tokio::fs::read(&files.result).await {
            Ok(bytes) => serde_json::from_slice::<HarnessReport>(&bytes).ok(),
            Err(_) => None,
        };

        let Some(report) = report else {
            let mut reason = format!("interpreter exited with {} without a report", status);
            let stderr = stderr_tail(&stderr, max_stderr);
            if !stderr.is_empty() {
                reason.push_str(": ");
                reason.push_str(&stderr);
            }
            return Ok(ExecutionResult::failure(reason));
        };

        match report.status {
            HarnessStatus::Ok => {
                if !tokio::fs::try_exists(&files.figure).await.unwrap_or(false) {
                    return Ok(ExecutionResult::failure(MISSING_FIGURE));
                }
                let artifact = self.publish(&files.figure, index).await?;
                Ok(ExecutionResult::success(artifact))
            }
            HarnessStatus::MissingFigure => Ok(ExecutionResult::failure(MISSING_FIGURE)),
            HarnessStatus::Error => Ok(ExecutionResult::failure(
                report
                    .message
                    .unwrap_or_else(|| "script raised an error".to_string()),
            )),
            HarnessStatus::HarnessError => Ok(ExecutionResult::failure(format!(
                "sandbox environment unusable: {}",
                report.message.unwrap_or_default()
            ))),
        }
    }

    /// Move a staged figure to its final path without exposing a partial file.
    async fn publish(&self, staged: &Path, index: usize) -> Result<PathBuf, SandboxError> {
        let target = self.artifact_path(index);
        let partial = self.plot_dir.join(format!(".{}.png.partial", index));
        let publish_err = |source| SandboxError::Publish {
            path: target.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.plot_dir)
            .await
            .map_err(publish_err)?;

        // The work dir may be on another filesystem, so copy then rename
        if let Err(e) = tokio::fs::copy(staged, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(publish_err(e));
        }
        if let Err(e) = tokio::fs::rename(&partial, &target).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(publish_err(e));
        }

        Ok(target)
    }
}

#[async_trait]
impl ScriptExecutor for PythonSandbox {
    async fn execute(&self, script: &str, dataset: &Dataset, index: usize) -> ExecutionResult {
        let result = match self.run(script, dataset, index).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(unit = index, error = %e, "Sandbox failure");
                ExecutionResult::failure(e.to_string())
            }
        };

        // A figure left by an earlier run of this index must not outlive a failure
        if !result.is_success() {
            let stale = self.artifact_path(index);
            match tokio::fs::remove_file(&stale).await {
                Ok(()) => tracing::debug!(unit = index, path = %stale.display(), "Removed stale figure"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(unit = index, error = %e, "Could not remove stale figure"),
            }
        }
        result
    }
}

fn abort(task: Option<tokio::task::JoinHandle<Vec<u8>>>) {
    if let Some(task) = task {
        task.abort();
    }
}

/// Drain `reader` to EOF, keeping at most the last `max_bytes`.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, max_bytes: usize) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > max_bytes.saturating_mul(2).max(chunk.len()) {
                    let excess = tail.len() - max_bytes;
                    tail.drain(..excess);
                }
            }
        }
    }

    if tail.len() > max_bytes {
        let excess = tail.len() - max_bytes;
        tail.drain(..excess);
    }
    tail
}

/// Last `max_bytes` of stderr, trimmed, as lossy UTF-8.
fn stderr_tail(stderr: &[u8], max_bytes: usize) -> String {
    let start = stderr.len().saturating_sub(max_bytes);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}
