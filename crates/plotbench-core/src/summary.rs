//! Batch-wide evaluation summary.
//!
//! Pure aggregation over a finished [`Batch`]; nothing here changes a record.

use crate::record::Batch;
use crate::verdict::JudgeVerdict;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Count of each verdict label on one axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictDistribution {
    #[serde(rename = "Excellent")]
    pub excellent: usize,
    #[serde(rename = "Very Good")]
    pub very_good: usize,
    #[serde(rename = "Average")]
    pub average: usize,
    #[serde(rename = "Poor")]
    pub poor: usize,
    #[serde(rename = "Very Poor")]
    pub very_poor: usize,
    #[serde(rename = "Unknown")]
    pub unknown: usize,
}

impl VerdictDistribution {
    pub fn record(&mut self, verdict: JudgeVerdict) {
        match verdict {
            JudgeVerdict::Excellent => self.excellent += 1,
            JudgeVerdict::VeryGood => self.very_good += 1,
            JudgeVerdict::Average => self.average += 1,
            JudgeVerdict::Poor => self.poor += 1,
            JudgeVerdict::VeryPoor => self.very_poor += 1,
            JudgeVerdict::Unknown => self.unknown += 1,
        }
    }

    pub fn count(&self, verdict: JudgeVerdict) -> usize {
        match verdict {
            JudgeVerdict::Excellent => self.excellent,
            JudgeVerdict::VeryGood => self.very_good,
            JudgeVerdict::Average => self.average,
            JudgeVerdict::Poor => self.poor,
            JudgeVerdict::VeryPoor => self.very_poor,
            JudgeVerdict::Unknown => self.unknown,
        }
    }

    /// Verdicts other than `Unknown`.
    pub fn known(&self) -> usize {
        JudgeVerdict::SCALE.iter().map(|v| self.count(*v)).sum()
    }

    /// Mean ordinal score over known verdicts.
    pub fn mean_score(&self) -> Option<f64> {
        let known = self.known();
        if known == 0 {
            return None;
        }
        let total: usize = JudgeVerdict::SCALE
            .iter()
            .map(|v| self.count(*v) * usize::from(v.score().unwrap_or(0)))
            .sum();
        Some(round2(total as f64 / known as f64))
    }
}

/// Token and call totals for a run, split by role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub generation_calls: u64,
    pub generation_tokens: u64,
    pub judge_calls: u64,
    pub judge_tokens: u64,
}

/// Aggregate view of one batch, persisted as the `*_eval_all.json` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub model: String,
    pub scenario: String,
    pub release: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,

    /// Fraction of units whose script ran, 0.0 to 1.0
    pub success_rate: f64,

    /// Mean `runnable_score` over all units, 0 to 100
    pub runnable_score: f64,

    /// Mean over units that reached the generation endpoint
    pub mean_generate_rate: Option<f64>,

    pub correctness: VerdictDistribution,
    pub aesthetic_quality: VerdictDistribution,
    pub mean_correctness_score: Option<f64>,
    pub mean_aesthetic_score: Option<f64>,
    pub failures_by_stage: BTreeMap<String, usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageTotals>,
}

impl BatchSummary {
    pub fn with_usage(mut self, usage: UsageTotals) -> Self {
        self.usage = Some(usage);
        self
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Summarise a finished batch.
pub fn summarize(batch: &Batch) -> BatchSummary {
    let total = batch.records.len();
    let mut succeeded = 0usize;
    let mut correctness = VerdictDistribution::default();
    let mut aesthetic_quality = VerdictDistribution::default();
    let mut failures_by_stage: BTreeMap<String, usize> = BTreeMap::new();
    let mut rate_sum = 0.0;
    let mut rate_count = 0usize;

    for record in &batch.records {
        if record.total_tokens().is_some() {
            rate_sum += record.generate_rate();
            rate_count += 1;
        }

        if record.is_success() {
            succeeded += 1;
        } else if let Some(stage) = record.stage() {
            *failures_by_stage.entry(stage.as_str().to_string()).or_default() += 1;
        }

        if let Some(v) = record.correctness() {
            correctness.record(v);
        }
        if let Some(v) = record.aesthetic_quality() {
            aesthetic_quality.record(v);
        }
    }

    let (success_rate, runnable_score) = if total == 0 {
        (0.0, 0.0)
    } else {
        let rate = succeeded as f64 / total as f64;
        ((rate * 10_000.0).round() / 10_000.0, round2(rate * 100.0))
    };

    BatchSummary {
        model: batch.header.model.clone(),
        scenario: batch.header.scenario.clone(),
        release: batch.header.release.clone(),
        total,
        succeeded,
        failed: total - succeeded,
        success_rate,
        runnable_score,
        mean_generate_rate: (rate_count > 0).then(|| round2(rate_sum / rate_count as f64)),
        mean_correctness_score: correctness.mean_score(),
        mean_aesthetic_score: aesthetic_quality.mean_score(),
        correctness,
        aesthetic_quality,
        failures_by_stage,
        usage: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BatchHeader, EvaluationRecord};
    use crate::types::{FailureStage, GenerationMetrics};
    use std::time::Duration;

    fn batch() -> Batch {
        let m = GenerationMetrics::new(Duration::from_secs(2), 100, 100);
        let records = vec![
            EvaluationRecord::success(0, "0.png", &m, JudgeVerdict::Excellent, JudgeVerdict::Average),
            EvaluationRecord::success(1, "1.png", &m, JudgeVerdict::Unknown, JudgeVerdict::VeryGood),
            EvaluationRecord::failure(2, FailureStage::Execution, "NameError: x", Some(&m)),
            EvaluationRecord::failure(3, FailureStage::Validation, "data file not found", None),
        ];
        let header = BatchHeader::new("deepseek-v3", "plot-generation", "release_v2");
        Batch::assemble(header, 4, records)
    }

    #[test]
    fn test_summary_counts() {
        let s = summarize(&batch());
        assert_eq!(s.total, 4);
        assert_eq!(s.succeeded, 2);
        assert_eq!(s.failed, 2);
        assert_eq!(s.success_rate, 0.5);
        assert_eq!(s.runnable_score, 50.0);
        assert_eq!(s.failures_by_stage.get("execution"), Some(&1));
        assert_eq!(s.failures_by_stage.get("validation"), Some(&1));
    }

    #[test]
    fn test_generate_rate_mean_skips_unreached_units() {
        let s = summarize(&batch());
        // three units reached generation at 100 tokens/s each
        assert_eq!(s.mean_generate_rate, Some(100.0));
    }

    #[test]
    fn test_verdict_distributions() {
        let s = summarize(&batch());
        assert_eq!(s.correctness.excellent, 1);
        assert_eq!(s.correctness.unknown, 1);
        assert_eq!(s.correctness.known(), 1);
        assert_eq!(s.mean_correctness_score, Some(5.0));
        assert_eq!(s.mean_aesthetic_score, Some(3.5));
    }

    #[test]
    fn test_empty_batch() {
        let empty = Batch::assemble(BatchHeader::new("m", "s", "r"), 0, vec![]);
        let s = summarize(&empty);
        assert_eq!(s.total, 0);
        assert_eq!(s.success_rate, 0.0);
        assert_eq!(s.mean_generate_rate, None);
        assert_eq!(s.mean_correctness_score, None);
    }

    #[test]
    fn test_distribution_serialises_with_labels() {
        let s = summarize(&batch()).with_usage(UsageTotals {
            generation_calls: 3,
            generation_tokens: 600,
            judge_calls: 4,
            judge_tokens: 900,
        });
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["correctness"]["Excellent"], 1);
        assert_eq!(json["aesthetic_quality"]["Very Good"], 1);
        assert_eq!(json["usage"]["judge_calls"], 4);
    }
}
