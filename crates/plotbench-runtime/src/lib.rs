//! # plotbench-runtime
//!
//! Everything in plotbench that talks to a model or runs generated code.
//!
//! A unit of work is one test-case row. For each row the [`Evaluator`]:
//! - asks the generation endpoint for a plotting script
//! - runs it in the [`PythonSandbox`] with the row's dataset bound as `df`
//! - sends the rendered figure (or the script) to the judge endpoint
//!
//! and returns an [`EvaluationRecord`](plotbench_core::EvaluationRecord).
//! The [`BatchRunner`] fans rows out, persists each finished unit and
//! assembles the ordered batch.
//!
//! ## Failure containment
//!
//! Endpoint errors, script failures and judge outages end up as record
//! fields. A batch always has one record per input row.
//!
//! ## Example
//!
//! ```rust,ignore
//! use plotbench_runtime::{BatchMode, BatchRunner, EvaluatorBuilder, PythonSandbox};
//! use plotbench_runtime::{ProviderRegistry, RuntimeConfig};
//!
//! let config = RuntimeConfig::default();
//! let registry = ProviderRegistry::with_defaults();
//! let evaluator = EvaluatorBuilder::from_config(&config, &registry, "deepseek-v3")?
//!     .executor(Arc::new(PythonSandbox::new(config.sandbox.clone(), "plots")))
//!     .data_root("testset")
//!     .build()?;
//!
//! let runner = BatchRunner::new(Arc::new(evaluator), BatchMode::from(&config.batch));
//! let batch = runner.run(header, rows).await;
//! ```

pub mod batch;
pub mod config;
pub mod encoder;
pub mod judge;
pub mod orchestrator;
pub mod prompts;
pub mod providers;
pub mod retry;
pub mod sandbox;
pub mod usage;

pub use batch::{BatchMode, BatchRunner, FsUnitStore, StoreError, UnitEvaluator, UnitStore};
pub use config::{
    BatchConfig, BatchModeKind, ConfigError, EndpointProfile, GenerationConfig, JudgeConfig, JudgeMode,
    JudgeModality, RuntimeConfig, SandboxConfig,
};
pub use encoder::{encode, EncodedImage, EncodingError};
pub use judge::{JudgeClient, JudgeContent, JudgeError, JudgeKind};
pub use orchestrator::{EvaluateError, Evaluator, EvaluatorBuilder};
pub use providers::{
    ApiCredential, ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError,
    ProviderFactory, ProviderRegistry, TokenUsage,
};
pub use retry::RetryPolicy;
pub use sandbox::{PythonSandbox, ScriptExecutor};
pub use usage::UsageTracker;
