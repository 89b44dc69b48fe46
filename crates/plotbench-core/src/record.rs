//! Evaluation records and batches.
//!
//! A record is built once, through [`EvaluationRecord::success`] or
//! [`EvaluationRecord::failure`], and never edited after it is written out.
//! Judge verdicts are present iff execution succeeded.

use crate::types::{FailureStage, GenerationMetrics};
use crate::verdict::JudgeVerdict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const FALLBACK_REASON: &str = "unspecified failure";

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Outcome of one evaluation unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    index: usize,
    success: bool,

    /// 100 for a runnable script, 0 otherwise
    runnable_score: u8,

    stage: Option<FailureStage>,
    reason: Option<String>,
    artifact_path: Option<PathBuf>,

    /// Tokens per second, two decimals
    generate_rate: f64,

    /// `None` when the unit never reached the generation endpoint
    total_tokens: Option<u32>,
    generation_seconds: Option<f64>,

    correctness: Option<JudgeVerdict>,
    aesthetic_quality: Option<JudgeVerdict>,

    #[serde(default)]
    warnings: Vec<String>,
}

impl EvaluationRecord {
    /// Record for a unit whose script ran and produced an artifact.
    pub fn success(
        index: usize,
        artifact_path: impl Into<PathBuf>,
        metrics: &GenerationMetrics,
        correctness: JudgeVerdict,
        aesthetic_quality: JudgeVerdict,
    ) -> Self {
        Self {
            index,
            success: true,
            runnable_score: 100,
            stage: None,
            reason: None,
            artifact_path: Some(artifact_path.into()),
            generate_rate: round_to(metrics.generate_rate, 2),
            total_tokens: Some(metrics.total_tokens),
            generation_seconds: Some(round_to(metrics.latency.as_secs_f64(), 3)),
            correctness: Some(correctness),
            aesthetic_quality: Some(aesthetic_quality),
            warnings: Vec::new(),
        }
    }

    /// Record for a unit that stopped at `stage`.
    ///
    /// `metrics` is the generation call's, when the unit got that far.
    pub fn failure(
        index: usize,
        stage: FailureStage,
        reason: impl Into<String>,
        metrics: Option<&GenerationMetrics>,
    ) -> Self {
        let mut reason = reason.into();
        if reason.trim().is_empty() {
            reason = FALLBACK_REASON.to_string();
        }

        Self {
            index,
            success: false,
            runnable_score: 0,
            stage: Some(stage),
            reason: Some(reason),
            artifact_path: None,
            generate_rate: metrics.map_or(0.0, |m| round_to(m.generate_rate, 2)),
            total_tokens: metrics.map(|m| m.total_tokens),
            generation_seconds: metrics.map(|m| round_to(m.latency.as_secs_f64(), 3)),
            correctness: None,
            aesthetic_quality: None,
            warnings: Vec::new(),
        }
    }

    /// Attach a non-fatal note, while the record is still being built.
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_warnings(mut self, warnings: impl IntoIterator<Item = String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn runnable_score(&self) -> u8 {
        self.runnable_score
    }

    pub fn stage(&self) -> Option<FailureStage> {
        self.stage
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn artifact_path(&self) -> Option<&Path> {
        self.artifact_path.as_deref()
    }

    pub fn generate_rate(&self) -> f64 {
        self.generate_rate
    }

    pub fn total_tokens(&self) -> Option<u32> {
        self.total_tokens
    }

    pub fn generation_seconds(&self) -> Option<f64> {
        self.generation_seconds
    }

    pub fn correctness(&self) -> Option<JudgeVerdict> {
        self.correctness
    }

    pub fn aesthetic_quality(&self) -> Option<JudgeVerdict> {
        self.aesthetic_quality
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Whether the record's fields agree with each other.
    ///
    /// Always true for records built here; used to vet records read back
    /// from disk.
    pub fn is_consistent(&self) -> bool {
        let rate_ok = self.generate_rate.is_finite() && self.generate_rate >= 0.0;

        if self.success {
            rate_ok
                && self.runnable_score == 100
                && self.stage.is_none()
                && self.reason.is_none()
                && self.artifact_path.is_some()
                && self.correctness.is_some()
                && self.aesthetic_quality.is_some()
        } else {
            rate_ok
                && self.runnable_score == 0
                && self.stage.is_some()
                && self.reason.as_deref().is_some_and(|r| !r.trim().is_empty())
                && self.artifact_path.is_none()
                && self.correctness.is_none()
                && self.aesthetic_quality.is_none()
        }
    }
}

/// Identifies a batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub model: String,
    pub scenario: String,
    pub release: String,
    pub started_at: DateTime<Utc>,
}

impl BatchHeader {
    pub fn new(
        model: impl Into<String>,
        scenario: impl Into<String>,
        release: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            scenario: scenario.into(),
            release: release.into(),
            started_at: Utc::now(),
        }
    }
}

/// Every record of one run, in input row order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(flatten)]
    pub header: BatchHeader,
    pub finished_at: DateTime<Utc>,
    pub records: Vec<EvaluationRecord>,
}

impl Batch {
    /// Order `results` by index into exactly `expected_len` slots.
    ///
    /// A slot with no result gets an `Internal` failure. Results whose index
    /// is out of range or already taken are dropped with a warning.
    pub fn assemble(
        header: BatchHeader,
        expected_len: usize,
        results: impl IntoIterator<Item = EvaluationRecord>,
    ) -> Self {
        let mut slots: Vec<Option<EvaluationRecord>> = vec![None; expected_len];

        for record in results {
            match slots.get_mut(record.index) {
                Some(slot) if slot.is_none() => *slot = Some(record),
                Some(_) => {
                    tracing::warn!(unit = record.index, "Duplicate result for unit dropped");
                }
                None => {
                    tracing::warn!(
                        unit = record.index,
                        expected_len,
                        "Result index out of range dropped"
                    );
                }
            }
        }

        let records = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    EvaluationRecord::failure(
                        index,
                        FailureStage::Internal,
                        "no result was recorded for this row",
                        None,
                    )
                })
            })
            .collect();

        Self {
            header,
            finished_at: Utc::now(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.records.iter().filter(|r| r.is_success()).count()
    }
}
