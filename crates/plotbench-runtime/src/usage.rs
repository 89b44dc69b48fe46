//! Token accounting across a batch.

use crate::providers::TokenUsage;
use parking_lot::Mutex;
use plotbench_core::UsageTotals;

/// Accumulates generation and judge usage separately.
///
/// Shared by every unit of a batch; cloning the `Arc` that holds it is the
/// intended way to hand it out.
#[derive(Debug, Default)]
pub struct UsageTracker {
    totals: Mutex<UsageTotals>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_generation(&self, usage: &TokenUsage) {
        let mut totals = self.totals.lock();
        totals.generation_calls += 1;
        totals.generation_tokens += u64::from(usage.total());
    }

    pub fn record_judge(&self, usage: &TokenUsage) {
        let mut totals = self.totals.lock();
        totals.judge_calls += 1;
        totals.judge_tokens += u64::from(usage.total());
    }

    pub fn snapshot(&self) -> UsageTotals {
        *self.totals.lock()
    }

    /// Emit the current totals at info level.
    pub fn log_snapshot(&self) {
        let totals = self.snapshot();
        tracing::info!(
            generation_calls = totals.generation_calls,
            generation_tokens = totals.generation_tokens,
            judge_calls = totals.judge_calls,
            judge_tokens = totals.judge_tokens,
            "Token usage"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn usage(prompt: u32, completion: u32) -> TokenUsage {
        TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
        }
    }

    #[test]
    fn test_generation_and_judge_kept_apart() {
        let tracker = UsageTracker::new();
        tracker.record_generation(&usage(100, 50));
        tracker.record_judge(&usage(800, 2));
        tracker.record_judge(&usage(800, 3));

        let totals = tracker.snapshot();
        assert_eq!(totals.generation_calls, 1);
        assert_eq!(totals.generation_tokens, 150);
        assert_eq!(totals.judge_calls, 2);
        assert_eq!(totals.judge_tokens, 1605);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_recording() {
        let tracker = Arc::new(UsageTracker::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    tracker.record_generation(&usage(1, 1));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let totals = tracker.snapshot();
        assert_eq!(totals.generation_calls, 160);
        assert_eq!(totals.generation_tokens, 320);
    }
}
