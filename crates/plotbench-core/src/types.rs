//! Core types for one evaluation unit.

use crate::dataset::Dataset;
use crate::extract::extract_code;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// What the target model is asked to do. Immutable once built.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    dataset: Arc<Dataset>,
    instruction: String,
    model: String,
}

impl GenerationRequest {
    pub fn new(dataset: Arc<Dataset>, instruction: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            dataset,
            instruction: instruction.into(),
            model: model.into(),
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Shared handle to the dataset, for handing to the executor.
    pub fn dataset_arc(&self) -> Arc<Dataset> {
        Arc::clone(&self.dataset)
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Tokens per second over the generation call.
///
/// Zero when `elapsed_secs` is not positive.
pub fn generate_rate(total_tokens: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs.is_nan() || elapsed_secs <= 0.0 {
        return 0.0;
    }
    total_tokens as f64 / elapsed_secs
}

/// Timing and token counts for one generation call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    #[serde(with = "duration_secs_f64")]
    pub latency: Duration,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,

    /// `total_tokens / latency`, zero for a zero latency
    pub generate_rate: f64,
}

impl GenerationMetrics {
    pub fn new(latency: Duration, prompt_tokens: u32, completion_tokens: u32) -> Self {
        let total_tokens = prompt_tokens.saturating_add(completion_tokens);
        Self {
            latency,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            generate_rate: generate_rate(u64::from(total_tokens), latency.as_secs_f64()),
        }
    }
}

mod duration_secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// A generated script plus the metrics of the call that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    source: String,
    raw_response: String,
    fenced: bool,
    metrics: GenerationMetrics,
}

impl GeneratedArtifact {
    /// Extract the script from a raw reply.
    pub fn from_response(raw_response: impl Into<String>, metrics: GenerationMetrics) -> Self {
        let raw_response = raw_response.into();
        let extracted = extract_code(&raw_response);
        Self {
            source: extracted.source,
            raw_response,
            fenced: extracted.fenced,
            metrics,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn raw_response(&self) -> &str {
        &self.raw_response
    }

    pub fn fenced(&self) -> bool {
        self.fenced
    }

    pub fn metrics(&self) -> &GenerationMetrics {
        &self.metrics
    }
}

/// Outcome of running a script in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success { artifact_path: PathBuf },
    Failure { reason: String },
}

impl ExecutionResult {
    pub fn success(artifact_path: impl Into<PathBuf>) -> Self {
        ExecutionResult::Success {
            artifact_path: artifact_path.into(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        ExecutionResult::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    pub fn artifact_path(&self) -> Option<&Path> {
        match self {
            ExecutionResult::Success { artifact_path } => Some(artifact_path),
            ExecutionResult::Failure { .. } => None,
        }
    }
}

/// Where a unit stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Bad row or unreadable dataset; no generation request was made
    Validation,
    /// Endpoint unreachable or unusable reply
    Generation,
    /// The generated script failed or produced no figure
    Execution,
    /// The unit's task died before producing a record
    Internal,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Validation => "validation",
            FailureStage::Generation => "generation",
            FailureStage::Execution => "execution",
            FailureStage::Internal => "internal",
        }
    }

    /// Whether running the unit again could plausibly end differently.
    ///
    /// Endpoint outages and dead unit tasks are retried on resume; bad rows
    /// and failing scripts are kept.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureStage::Generation | FailureStage::Internal)
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
