//! Batch coordinator.
//!
//! Fans rows out to the evaluator, sequentially or with bounded parallelism,
//! and assembles the results in input order. Order comes from each row's
//! pre-assigned index, never from completion order.

pub mod store;

use async_trait::async_trait;
use futures::future::join_all;
use plotbench_core::{Batch, BatchHeader, EvaluationRecord, FailureStage, TestCaseRow};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::config::{BatchConfig, BatchModeKind};
use crate::orchestrator::{EvaluateError, Evaluator};
use crate::usage::UsageTracker;

pub use store::{FsUnitStore, StoreError, UnitStore};

/// Anything that can turn one row into a record.
#[async_trait]
pub trait UnitEvaluator: Send + Sync {
    async fn evaluate(&self, row: &TestCaseRow) -> Result<EvaluationRecord, EvaluateError>;
}

#[async_trait]
impl UnitEvaluator for Evaluator {
    async fn evaluate(&self, row: &TestCaseRow) -> Result<EvaluationRecord, EvaluateError> {
        Evaluator::evaluate(self, row).await
    }
}

/// How units are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// One unit at a time, in row order
    Sequential,
    /// Up to `max_in_flight` units at once
    Concurrent { max_in_flight: usize },
}

impl From<&BatchConfig> for BatchMode {
    fn from(config: &BatchConfig) -> Self {
        match config.mode {
            BatchModeKind::Sequential => BatchMode::Sequential,
            BatchModeKind::Concurrent => BatchMode::Concurrent {
                max_in_flight: config.max_in_flight.max(1),
            },
        }
    }
}

/// Runs a whole test set.
pub struct BatchRunner {
    evaluator: Arc<dyn UnitEvaluator>,
    mode: BatchMode,
    store: Option<Arc<dyn UnitStore>>,
    resume: bool,
    usage: Option<Arc<UsageTracker>>,
}

impl BatchRunner {
    pub fn new(evaluator: Arc<dyn UnitEvaluator>, mode: BatchMode) -> Self {
        Self {
            evaluator,
            mode,
            store: None,
            resume: false,
            usage: None,
        }
    }

    /// Persist every finished unit to `store`; with `resume`, reuse the
    /// units it already holds.
    pub fn with_store(mut self, store: Arc<dyn UnitStore>, resume: bool) -> Self {
        self.store = Some(store);
        self.resume = resume;
        self
    }

    /// Log these totals when the batch ends.
    pub fn with_usage(mut self, usage: Arc<UsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Evaluate every row. Always yields exactly one record per row.
    pub async fn run(&self, header: BatchHeader, rows: Vec<TestCaseRow>) -> Batch {
        let expected_len = rows.len();
        let mut done = self.completed_units().await;
        done.retain(|index, _| *index < expected_len);

        let pending: Vec<TestCaseRow> = rows
            .into_iter()
            .filter(|row| !done.contains_key(&row.index))
            .collect();

        tracing::info!(
            model = %header.model,
            total = expected_len,
            reused = done.len(),
            pending = pending.len(),
            mode = ?self.mode,
            "Starting batch"
        );

        let fresh = match self.mode {
            BatchMode::Sequential => self.run_sequential(pending).await,
            BatchMode::Concurrent { max_in_flight } => {
                self.run_concurrent(pending, max_in_flight).await
            }
        };

        let batch = Batch::assemble(header, expected_len, done.into_values().chain(fresh));

        tracing::info!(
            total = batch.len(),
            succeeded = batch.succeeded(),
            "Batch complete"
        );
        if let Some(usage) = &self.usage {
            usage.log_snapshot();
        }
        batch
    }

    async fn completed_units(&self) -> BTreeMap<usize, EvaluationRecord> {
        let store = match (&self.store, self.resume) {
            (Some(store), true) => store,
            _ => return BTreeMap::new(),
        };

        let mut records = match store.load().await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read stored units, starting fresh");
                return BTreeMap::new();
            }
        };

        records.retain(|index, record| match record.stage() {
            Some(stage) if stage.is_retryable() => {
                tracing::debug!(unit = *index, stage = %stage, "Retrying stored failure");
                false
            }
            _ => true,
        });
        records
    }

    async fn run_sequential(&self, rows: Vec<TestCaseRow>) -> Vec<EvaluationRecord> {
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = settle(row.index, self.evaluator.evaluate(&row).await);
            persist(self.store.as_deref(), &record).await;
            records.push(record);
        }
        records
    }

    async fn run_concurrent(
        &self,
        rows: Vec<TestCaseRow>,
        max_in_flight: usize,
    ) -> Vec<EvaluationRecord> {
        let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));

        let units: Vec<(usize, _)> = rows
            .into_iter()
            .map(|row| {
                let index = row.index;
                let evaluator = self.evaluator.clone();
                let store = self.store.clone();
                let permits = permits.clone();

                let handle = tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await.ok();
                    let record = settle(row.index, evaluator.evaluate(&row).await);
                    persist(store.as_deref(), &record).await;
                    record
                });
                (index, handle)
            })
            .collect();

        let (indices, handles): (Vec<usize>, Vec<_>) = units.into_iter().unzip();
        join_all(handles)
            .await
            .into_iter()
            .zip(indices)
            .map(|(joined, index)| match joined {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!(unit = index, error = %e, "Unit task did not finish");
                    EvaluationRecord::failure(
                        index,
                        FailureStage::Internal,
                        format!("unit task did not finish: {}", e),
                        None,
                    )
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunner")
            .field("mode", &self.mode)
            .field("store", &self.store.is_some())
            .field("resume", &self.resume)
            .finish()
    }
}

/// Turn an evaluator error into a failure record at the row's slot.
fn settle(index: usize, result: Result<EvaluationRecord, EvaluateError>) -> EvaluationRecord {
    match result {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(unit = index, error = %e, "Row rejected");
            EvaluationRecord::failure(index, FailureStage::Validation, e.to_string(), None)
        }
    }
}

async fn persist(store: Option<&dyn UnitStore>, record: &EvaluationRecord) {
    if let Some(store) = store {
        if let Err(e) = store.save(record).await {
            tracing::warn!(unit = record.index(), error = %e, "Could not persist unit");
        }
    }
}
