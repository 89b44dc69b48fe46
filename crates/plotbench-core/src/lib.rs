//! # plotbench-core
//!
//! Deterministic data model for the plotbench code-generation benchmark.
//!
//! This crate never touches the network or runs generated code. It owns:
//! - datasets and test-case rows read from tabular files
//! - extraction of script source from raw model replies
//! - parsing of categorical judge verdicts
//! - prompt templates keyed by symbolic name
//! - evaluation records, batches and batch summaries
//!
//! ## Key Guarantees
//!
//! 1. **Total parsing**: code extraction and verdict parsing never fail
//! 2. **Consistent records**: judge verdicts exist iff execution succeeded
//! 3. **Stable batches**: a batch has one record per input row, in row order
//!
//! ## Example
//!
//! ```rust,ignore
//! use plotbench_core::{extract_code, JudgeVerdict};
//!
//! let code = extract_code("```python\nfig = df.plot().figure\n```");
//! assert!(code.fenced);
//!
//! assert_eq!(JudgeVerdict::parse("Very Good."), JudgeVerdict::VeryGood);
//! ```

pub mod dataset;
pub mod extract;
pub mod record;
pub mod summary;
pub mod templates;
pub mod types;
pub mod verdict;

// Re-export main types at crate root
pub use dataset::{
    load_test_cases, parse_test_cases, Cell, Dataset, DatasetError, DatasetFormat, RowContent,
    TestCaseRow, DATA_PATH_COLUMN, DEFAULT_PREVIEW_ROWS, PROMPT_COLUMN,
};
pub use extract::{extract_code, extract_fenced, ExtractedCode};
pub use record::{Batch, BatchHeader, EvaluationRecord};
pub use summary::{summarize, BatchSummary, UsageTotals, VerdictDistribution};
pub use templates::{
    PromptTemplates, PromptTemplatesBuilder, Template, TemplateError, TemplateName, TemplateParams,
};
pub use types::{
    generate_rate, ExecutionResult, FailureStage, GeneratedArtifact, GenerationMetrics,
    GenerationRequest,
};
pub use verdict::{CombinedVerdict, JudgeVerdict};
