//! Evaluation orchestrator.
//!
//! Drives one unit end-to-end:
//! 1. Validate the row and load its dataset (no endpoint call on failure)
//! 2. Generate a script, timing only the successful generation attempt
//! 3. Extract the code (fenced block, else the raw reply)
//! 4. Execute it in the sandbox under the unit's index
//! 5. On success, encode the figure and run the judges
//! 6. On failure, skip judging entirely
//! 7. Assemble the record
//!
//! Model and data problems always end up as record fields. Only a row that
//! lacks a required column altogether is reported as an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use plotbench_core::{
    CombinedVerdict, Dataset, EvaluationRecord, ExecutionResult, FailureStage, GeneratedArtifact,
    GenerationMetrics, GenerationRequest, JudgeVerdict, PromptTemplates, RowContent, TemplateError,
    TemplateName, TemplateParams, TestCaseRow, DATA_PATH_COLUMN, DEFAULT_PREVIEW_ROWS, PROMPT_COLUMN,
};

use crate::config::{JudgeMode, JudgeModality, RuntimeConfig, DEFAULT_JUDGE_MODEL};
use crate::encoder;
use crate::judge::{JudgeClient, JudgeContent, JudgeError, JudgeKind};
use crate::providers::{ChatMessage, CompletionConfig, LlmProvider, ProviderError, ProviderRegistry};
use crate::retry::RetryPolicy;
use crate::sandbox::ScriptExecutor;
use crate::usage::UsageTracker;

/// Errors the orchestrator reports to its caller instead of recording.
#[derive(Error, Debug)]
pub enum EvaluateError {
    #[error("Row {index} is malformed: {reason}")]
    MalformedRow { index: usize, reason: String },

    #[error("Evaluator not configured: {0}")]
    NotConfigured(String),

    #[error("Provider setup failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Prompt templates invalid: {0}")]
    Template(#[from] TemplateError),
}

/// Runs single evaluation units.
pub struct Evaluator {
    model: String,
    generator: Arc<dyn LlmProvider>,
    generation: CompletionConfig,
    generation_timeout: Duration,
    retry: RetryPolicy,
    executor: Arc<dyn ScriptExecutor>,
    judge: JudgeClient,
    judge_mode: JudgeMode,
    judge_modality: JudgeModality,
    templates: Arc<PromptTemplates>,
    data_root: PathBuf,
    preview_rows: usize,
    usage: Arc<UsageTracker>,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("model", &self.model)
            .field("generator", &self.generator.name())
            .field("judge", &self.judge)
            .field("judge_mode", &self.judge_mode)
            .field("judge_modality", &self.judge_modality)
            .field("data_root", &self.data_root)
            .finish()
    }
}

/// A row that passed validation.
struct ValidRow {
    instruction: String,
    data_path: PathBuf,
}

impl Evaluator {
    pub fn builder() -> EvaluatorBuilder {
        EvaluatorBuilder::new()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    /// Evaluate one row.
    pub async fn evaluate(&self, row: &TestCaseRow) -> Result<EvaluationRecord, EvaluateError> {
        let index = row.index;

        // 1. Validate
        let valid = match self.validate(row)? {
            Ok(valid) => valid,
            Err(reason) => {
                tracing::warn!(unit = index, reason = %reason, "Row failed validation");
                return Ok(EvaluationRecord::failure(index, FailureStage::Validation, reason, None));
            }
        };

        let dataset = match load_dataset(valid.data_path.clone()).await {
            Ok(dataset) => Arc::new(dataset),
            Err(reason) => {
                tracing::warn!(unit = index, reason = %reason, "Dataset not loadable");
                return Ok(EvaluationRecord::failure(index, FailureStage::Validation, reason, None));
            }
        };

        let request = GenerationRequest::new(dataset, valid.instruction, self.model.clone());

        // 2-3. Generate and extract
        let artifact = match self.generate(index, &request).await {
            Ok(artifact) => artifact,
            Err(record) => return Ok(record),
        };
        let metrics = *artifact.metrics();

        // 4. Execute
        let artifact_path = match self
            .executor
            .execute(artifact.source(), request.dataset(), index)
            .await
        {
            ExecutionResult::Success { artifact_path } => artifact_path,
            ExecutionResult::Failure { reason } => {
                // 6. No judging for failed scripts
                tracing::info!(unit = index, reason = %reason, "Script failed");
                return Ok(EvaluationRecord::failure(
                    index,
                    FailureStage::Execution,
                    reason,
                    Some(&metrics),
                ));
            }
        };

        // 5. Judge
        let mut warnings = Vec::new();
        let verdict = self
            .judge_artifact(index, &artifact_path, &artifact, request.instruction(), &mut warnings)
            .await;

        tracing::info!(
            unit = index,
            generate_rate = metrics.generate_rate,
            correctness = %verdict.correctness.label(),
            aesthetics = %verdict.aesthetics.label(),
            "Unit complete"
        );

        // 7. Assemble
        Ok(EvaluationRecord::success(
            index,
            artifact_path,
            &metrics,
            verdict.correctness,
            verdict.aesthetics,
        )
        .with_warnings(warnings))
    }

    /// Outer `Err` for a structurally malformed row, inner `Err` for a
    /// recordable validation failure.
    fn validate(&self, row: &TestCaseRow) -> Result<Result<ValidRow, String>, EvaluateError> {
        let fields = match &row.content {
            RowContent::Fields(fields) => fields,
            RowContent::Unreadable(reason) => return Ok(Err(format!("unreadable row: {}", reason))),
        };

        let column = |name: &str| {
            fields.get(name).ok_or_else(|| EvaluateError::MalformedRow {
                index: row.index,
                reason: format!("missing required column '{}'", name),
            })
        };
        let prompt = column(PROMPT_COLUMN)?;
        let data_path = column(DATA_PATH_COLUMN)?;

        let instruction = match prompt.as_text().map(str::trim) {
            Some(text) if !text.is_empty() => text.to_string(),
            None if !prompt.is_empty() => {
                return Ok(Err(format!("instruction is not text: {}", prompt)))
            }
            _ => return Ok(Err("instruction is empty".to_string())),
        };

        let relative = match data_path.as_text().map(str::trim) {
            Some(path) if !path.is_empty() => path,
            _ => return Ok(Err("dataset path is empty".to_string())),
        };

        Ok(Ok(ValidRow {
            instruction,
            data_path: self.data_root.join(relative),
        }))
    }

    /// Steps 2 and 3. A failure comes back as a finished record.
    async fn generate(
        &self,
        index: usize,
        request: &GenerationRequest,
    ) -> Result<GeneratedArtifact, EvaluationRecord> {
        let messages = self.generation_messages(request).map_err(|e| {
            EvaluationRecord::failure(
                index,
                FailureStage::Internal,
                format!("generation prompt could not be rendered: {}", e),
                None,
            )
        })?;

        let call = self
            .retry
            .complete(self.generator.as_ref(), &messages, &self.generation);

        let timed = match tokio::time::timeout(self.generation_timeout, call).await {
            Ok(Ok(timed)) => timed,
            Ok(Err(e)) => {
                tracing::warn!(unit = index, model = %self.model, error = %e, "Generation failed");
                return Err(EvaluationRecord::failure(
                    index,
                    FailureStage::Generation,
                    format!("generation request failed: {}", e),
                    None,
                ));
            }
            Err(_) => {
                tracing::warn!(unit = index, model = %self.model, timeout = ?self.generation_timeout, "Generation timed out");
                return Err(EvaluationRecord::failure(
                    index,
                    FailureStage::Generation,
                    format!(
                        "generation timed out after {}",
                        humantime::format_duration(self.generation_timeout)
                    ),
                    None,
                ));
            }
        };

        let usage = timed.response.usage;
        self.usage.record_generation(&usage);
        let metrics =
            GenerationMetrics::new(timed.latency, usage.prompt_tokens, usage.completion_tokens);

        tracing::debug!(
            unit = index,
            model = %self.model,
            latency_ms = timed.latency.as_millis() as u64,
            total_tokens = metrics.total_tokens,
            attempts = timed.attempts,
            "Generation complete"
        );

        if timed.response.content.trim().is_empty() {
            return Err(EvaluationRecord::failure(
                index,
                FailureStage::Generation,
                "model returned an empty response",
                Some(&metrics),
            ));
        }

        let artifact = GeneratedArtifact::from_response(timed.response.content, metrics);
        if !artifact.fenced() {
            tracing::debug!(unit = index, "No fenced block in reply, using raw text");
        }
        Ok(artifact)
    }

    fn generation_messages(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<ChatMessage>, TemplateError> {
        let dataset = request.dataset();
        let params = TemplateParams::new()
            .with("instruction", request.instruction())
            .with("data_preview", dataset.preview(self.preview_rows))
            .with("columns", dataset.columns().join(", "));

        Ok(vec![
            ChatMessage::system(
                self.templates
                    .render(TemplateName::GenerationSystem, &params)?,
            ),
            ChatMessage::user(self.templates.render(TemplateName::GenerationUser, &params)?),
        ])
    }

    /// Step 5. Never fails; problems become `Unknown` plus a warning.
    async fn judge_artifact(
        &self,
        index: usize,
        artifact_path: &Path,
        artifact: &GeneratedArtifact,
        instruction: &str,
        warnings: &mut Vec<String>,
    ) -> CombinedVerdict {
        let content = match self.judge_modality {
            JudgeModality::Image => match encoder::encode(artifact_path).await {
                Ok(image) => JudgeContent::Image {
                    image,
                    instruction: instruction.to_string(),
                },
                Err(e) => {
                    tracing::warn!(unit = index, error = %e, "Artifact encoding failed, skipping judges");
                    warnings.push(format!("artifact encoding failed: {}", e));
                    return CombinedVerdict::unknown();
                }
            },
            JudgeModality::Source => JudgeContent::Source {
                source: artifact.source().to_string(),
                instruction: instruction.to_string(),
            },
        };

        match self.judge_mode {
            JudgeMode::Separate => {
                let (aesthetics, correctness) = tokio::join!(
                    self.judge.judge(JudgeKind::Aesthetics, &content),
                    self.judge.judge(JudgeKind::Correctness, &content),
                );

                let mut settle = |kind: JudgeKind, result: Result<JudgeVerdict, JudgeError>| match result {
                    Ok(verdict) => verdict,
                    Err(e) => {
                        tracing::warn!(unit = index, judge = %kind, error = %e, "Judge call failed");
                        warnings.push(format!("{} judge failed: {}", kind, e));
                        JudgeVerdict::Unknown
                    }
                };

                CombinedVerdict {
                    aesthetics: settle(JudgeKind::Aesthetics, aesthetics),
                    correctness: settle(JudgeKind::Correctness, correctness),
                }
            }
            JudgeMode::Combined => match self.judge.judge_combined(&content).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    tracing::warn!(unit = index, error = %e, "Combined judge call failed");
                    warnings.push(format!("combined judge failed: {}", e));
                    CombinedVerdict::unknown()
                }
            },
        }
    }
}

/// Read the unit's dataset off the async threads.
async fn load_dataset(path: PathBuf) -> Result<Dataset, String> {
    let display = path.display().to_string();
    match tokio::task::spawn_blocking(move || Dataset::load(&path)).await {
        Ok(Ok(dataset)) => Ok(dataset),
        Ok(Err(e)) => Err(format!("dataset {} could not be read: {}", display, e)),
        Err(e) => Err(format!("dataset {} could not be read: {}", display, e)),
    }
}

/// Builder for [`Evaluator`].
pub struct EvaluatorBuilder {
    model: Option<String>,
    generator: Option<Arc<dyn LlmProvider>>,
    generation: CompletionConfig,
    generation_timeout: Duration,
    retry: RetryPolicy,
    executor: Option<Arc<dyn ScriptExecutor>>,
    judge: Option<JudgeClient>,
    judge_mode: JudgeMode,
    judge_modality: JudgeModality,
    templates: Option<Arc<PromptTemplates>>,
    data_root: PathBuf,
    preview_rows: usize,
    usage: Option<Arc<UsageTracker>>,
}

impl std::fmt::Debug for EvaluatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluatorBuilder")
            .field("model", &self.model)
            .field("generator", &self.generator.as_ref().map(|g| g.name()))
            .field("executor", &self.executor.is_some())
            .field("judge", &self.judge)
            .field("judge_mode", &self.judge_mode)
            .field("judge_modality", &self.judge_modality)
            .field("data_root", &self.data_root)
            .finish()
    }
}

impl EvaluatorBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            model: None,
            generator: None,
            generation: CompletionConfig::default(),
            generation_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            executor: None,
            judge: None,
            judge_mode: JudgeMode::default(),
            judge_modality: JudgeModality::default(),
            templates: None,
            data_root: PathBuf::from("."),
            preview_rows: DEFAULT_PREVIEW_ROWS,
            usage: None,
        }
    }

    /// Everything except the executor and data root, taken from `config`.
    ///
    /// Providers are created through `registry`. Fails when an endpoint
    /// cannot be set up or the judge cannot see the content it is meant to
    /// judge.
    pub fn from_config(
        config: &RuntimeConfig,
        registry: &ProviderRegistry,
        model: &str,
    ) -> Result<Self, EvaluateError> {
        let templates = Arc::new(config.templates()?);
        let usage = Arc::new(UsageTracker::new());

        let profile = config.profile_for_model(model);
        let generator = registry.create_for(&profile)?;
        tracing::info!(
            model,
            remote_model = profile.remote_model(model),
            base_url = %profile.base_url,
            provider = generator.name(),
            "Generation endpoint resolved"
        );

        let judge_profile = &config.judge.endpoint;
        let judge_provider = registry.create_for(judge_profile)?;
        if config.judge.modality == JudgeModality::Image && !judge_provider.supports_images() {
            return Err(EvaluateError::NotConfigured(format!(
                "judge endpoint {} cannot accept images; enable vision or use source modality",
                judge_profile.base_url
            )));
        }
        let judge_model = judge_profile.remote_model(DEFAULT_JUDGE_MODEL);
        let judge = JudgeClient::new(
            judge_provider,
            judge_profile.completion_config(judge_model),
            templates.clone(),
        )
        .with_retry(config.retry.clone())
        .with_usage(usage.clone());

        Ok(Self::new()
            .model(model)
            .generator(generator, profile.completion_config(model))
            .generation_timeout(config.generation.timeout)
            .retry(config.retry.clone())
            .judge(judge)
            .judge_mode(config.judge.mode)
            .judge_modality(config.judge.modality)
            .templates(templates)
            .preview_rows(config.generation.preview_rows)
            .usage(usage))
    }

    /// Model name as given by the user; recorded in requests and logs.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the generation provider and its request settings.
    pub fn generator(mut self, provider: Arc<dyn LlmProvider>, config: CompletionConfig) -> Self {
        self.generator = Some(provider);
        self.generation = config;
        self
    }

    /// Bound on the whole generation step, retries included.
    pub fn generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn ScriptExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn judge(mut self, judge: JudgeClient) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn judge_mode(mut self, mode: JudgeMode) -> Self {
        self.judge_mode = mode;
        self
    }

    pub fn judge_modality(mut self, modality: JudgeModality) -> Self {
        self.judge_modality = modality;
        self
    }

    pub fn templates(mut self, templates: Arc<PromptTemplates>) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Directory that row dataset paths are relative to.
    pub fn data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = root.into();
        self
    }

    pub fn preview_rows(mut self, rows: usize) -> Self {
        self.preview_rows = rows;
        self
    }

    pub fn usage(mut self, usage: Arc<UsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Build the evaluator.
    pub fn build(self) -> Result<Evaluator, EvaluateError> {
        let missing = |what: &str| EvaluateError::NotConfigured(format!("No {} set", what));

        let generator = self.generator.ok_or_else(|| missing("generation provider"))?;
        let model = self
            .model
            .unwrap_or_else(|| self.generation.model.clone());
        let executor = self.executor.ok_or_else(|| missing("script executor"))?;
        let judge = self.judge.ok_or_else(|| missing("judge client"))?;
        let templates = self.templates.ok_or_else(|| missing("prompt templates"))?;

        Ok(Evaluator {
            model,
            generator,
            generation: self.generation,
            generation_timeout: self.generation_timeout,
            retry: self.retry,
            executor,
            judge,
            judge_mode: self.judge_mode,
            judge_modality: self.judge_modality,
            templates,
            data_root: self.data_root,
            preview_rows: self.preview_rows,
            usage: self.usage.unwrap_or_default(),
        })
    }
}

impl Default for EvaluatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::tests::png_bytes;
    use crate::prompts::builtin_templates;
    use crate::providers::testing::ScriptedProvider;
    use crate::providers::ProviderError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use plotbench_core::Cell;
    use std::collections::BTreeMap;

    /// Writes a PNG for scripts containing `fig`, fails otherwise.
    struct FakeExecutor {
        dir: PathBuf,
        scripts: Mutex<Vec<String>>,
        write_image: bool,
    }

    impl FakeExecutor {
        fn new(dir: &Path) -> Self {
            Self {
                dir: dir.to_path_buf(),
                scripts: Mutex::new(Vec::new()),
                write_image: true,
            }
        }
    }

    #[async_trait]
    impl ScriptExecutor for FakeExecutor {
        async fn execute(&self, script: &str, dataset: &Dataset, index: usize) -> ExecutionResult {
            self.scripts.lock().push(script.to_string());
            assert!(!dataset.is_empty());
            if !script.contains("fig") {
                return ExecutionResult::failure("NameError: name 'plt' is not defined");
            }
            let path = self.dir.join(format!("{}.png", index));
            let bytes = if self.write_image {
                png_bytes()
            } else {
                b"not a png".to_vec()
            };
            std::fs::write(&path, bytes).unwrap();
            ExecutionResult::success(path)
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        generator: Arc<ScriptedProvider>,
        judge: Arc<ScriptedProvider>,
        executor: Arc<FakeExecutor>,
    }

    impl Fixture {
        fn new(generator: ScriptedProvider, judge: ScriptedProvider) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("data.csv"), "group,value\nA,1.5\nB,2.5\n").unwrap();
            let executor = Arc::new(FakeExecutor::new(dir.path()));
            Self {
                dir,
                generator: Arc::new(generator),
                judge: Arc::new(judge),
                executor,
            }
        }

        fn evaluator(&self) -> EvaluatorBuilder {
            let templates = Arc::new(builtin_templates().unwrap());
            let judge_config = CompletionConfig {
                model: "qwen2.5-vl-72b-instruct".to_string(),
                timeout: Duration::from_secs(5),
                ..CompletionConfig::default()
            };
            let judge = JudgeClient::new(self.judge.clone(), judge_config, templates.clone())
                .with_retry(RetryPolicy::none());

            Evaluator::builder()
                .model("deepseek-v3")
                .generator(
                    self.generator.clone(),
                    CompletionConfig {
                        model: "deepseek-chat".to_string(),
                        timeout: Duration::from_secs(5),
                        ..CompletionConfig::default()
                    },
                )
                .retry(RetryPolicy::none())
                .executor(self.executor.clone())
                .judge(judge)
                .templates(templates)
                .data_root(self.dir.path())
        }
    }

    const GOOD_REPLY: &str = "Here you go:\n```python\nfig = ax.get_figure()\n```";

    #[tokio::test]
    async fn test_success_path() {
        let f = Fixture::new(ScriptedProvider::new(GOOD_REPLY), ScriptedProvider::new("Very Good"));
        let evaluator = f.evaluator().build().unwrap();

        let record = evaluator
            .evaluate(&TestCaseRow::new(0, "bar plot", "data.csv"))
            .await
            .unwrap();

        assert!(record.is_success());
        assert_eq!(record.correctness(), Some(JudgeVerdict::VeryGood));
        assert_eq!(record.aesthetic_quality(), Some(JudgeVerdict::VeryGood));
        assert_eq!(record.total_tokens(), Some(100));
        assert!(record.warnings().is_empty());
        assert_eq!(f.executor.scripts.lock()[0], "fig = ax.get_figure()");
        assert_eq!(f.judge.calls(), 2);

        let seen = f.generator.seen.lock();
        assert!(seen[0][1].content.contains("group value"));
        assert!(seen[0][1].content.contains("User request: bar plot"));
    }

    #[tokio::test]
    async fn test_unfenced_reply_used_verbatim() {
        let f = Fixture::new(
            ScriptedProvider::new("fig = df.plot().get_figure()"),
            ScriptedProvider::new("Average"),
        );
        let record = f
            .evaluator()
            .build()
            .unwrap()
            .evaluate(&TestCaseRow::new(1, "line plot", "data.csv"))
            .await
            .unwrap();

        assert!(record.is_success());
        assert_eq!(f.executor.scripts.lock()[0], "fig = df.plot().get_figure()");
    }

    #[tokio::test]
    async fn test_execution_failure_skips_judges() {
        let f = Fixture::new(
            ScriptedProvider::new("```python\nplt.bar([1], [2])\n```"),
            ScriptedProvider::new("Excellent"),
        );
        let record = f
            .evaluator()
            .build()
            .unwrap()
            .evaluate(&TestCaseRow::new(2, "bar plot", "data.csv"))
            .await
            .unwrap();

        assert!(!record.is_success());
        assert_eq!(record.stage(), Some(FailureStage::Execution));
        assert!(record.reason().unwrap().contains("NameError"));
        assert_eq!(record.correctness(), None);
        assert_eq!(record.total_tokens(), Some(100));
        assert_eq!(f.judge.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_dataset_makes_no_generation_call() {
        let f = Fixture::new(ScriptedProvider::new(GOOD_REPLY), ScriptedProvider::new("Excellent"));
        let record = f
            .evaluator()
            .build()
            .unwrap()
            .evaluate(&TestCaseRow::new(3, "bar plot", "missing.csv"))
            .await
            .unwrap();

        assert_eq!(record.stage(), Some(FailureStage::Validation));
        assert!(record.reason().unwrap().contains("missing.csv"));
        assert_eq!(f.generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_instruction_is_validation_failure() {
        let f = Fixture::new(ScriptedProvider::new(GOOD_REPLY), ScriptedProvider::new("Excellent"));
        let evaluator = f.evaluator().build().unwrap();

        let record = evaluator
            .evaluate(&TestCaseRow::new(4, "   ", "data.csv"))
            .await
            .unwrap();
        assert_eq!(record.stage(), Some(FailureStage::Validation));

        let unreadable = TestCaseRow::unreadable(5, "expected 2 fields, found 3");
        let record = evaluator.evaluate(&unreadable).await.unwrap();
        assert_eq!(record.stage(), Some(FailureStage::Validation));
        assert!(record.reason().unwrap().contains("expected 2 fields"));
        assert_eq!(f.generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_column_is_an_error() {
        let f = Fixture::new(ScriptedProvider::new(GOOD_REPLY), ScriptedProvider::new("Excellent"));
        let mut fields = BTreeMap::new();
        fields.insert(PROMPT_COLUMN.to_string(), Cell::Text("bar plot".into()));
        let row = TestCaseRow::fields(6, fields);

        let err = f.evaluator().build().unwrap().evaluate(&row).await.unwrap_err();
        assert!(matches!(err, EvaluateError::MalformedRow { index: 6, .. }));
    }

    #[tokio::test]
    async fn test_generation_error_is_recorded() {
        let f = Fixture::new(
            ScriptedProvider::new(GOOD_REPLY).then(Err(ProviderError::AuthError)),
            ScriptedProvider::new("Excellent"),
        );
        let record = f
            .evaluator()
            .build()
            .unwrap()
            .evaluate(&TestCaseRow::new(7, "bar plot", "data.csv"))
            .await
            .unwrap();

        assert_eq!(record.stage(), Some(FailureStage::Generation));
        assert!(record.reason().unwrap().contains("Authentication failed"));
        assert_eq!(record.generate_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_one_judge_failing_does_not_block_the_other() {
        let f = Fixture::new(
            ScriptedProvider::new(GOOD_REPLY),
            ScriptedProvider::new("Excellent")
                .then(Err(ProviderError::Timeout(Duration::from_secs(5)))),
        );
        let record = f
            .evaluator()
            .build()
            .unwrap()
            .evaluate(&TestCaseRow::new(8, "bar plot", "data.csv"))
            .await
            .unwrap();

        assert!(record.is_success());
        let verdicts = [record.correctness().unwrap(), record.aesthetic_quality().unwrap()];
        assert!(verdicts.contains(&JudgeVerdict::Unknown));
        assert!(verdicts.contains(&JudgeVerdict::Excellent));
        assert_eq!(record.warnings().len(), 1);
        assert!(record.is_consistent());
    }

    #[tokio::test]
    async fn test_encoding_failure_keeps_success() {
        let mut f = Fixture::new(ScriptedProvider::new(GOOD_REPLY), ScriptedProvider::new("Excellent"));
        let mut executor = FakeExecutor::new(f.dir.path());
        executor.write_image = false;
        f.executor = Arc::new(executor);

        let record = f
            .evaluator()
            .build()
            .unwrap()
            .evaluate(&TestCaseRow::new(9, "bar plot", "data.csv"))
            .await
            .unwrap();

        assert!(record.is_success());
        assert_eq!(record.correctness(), Some(JudgeVerdict::Unknown));
        assert_eq!(record.aesthetic_quality(), Some(JudgeVerdict::Unknown));
        assert!(record.warnings()[0].contains("encoding"));
        assert_eq!(f.judge.calls(), 0);
    }

    #[tokio::test]
    async fn test_combined_source_judging() {
        let f = Fixture::new(
            ScriptedProvider::new(GOOD_REPLY),
            ScriptedProvider::new("{\"accuracy\": \"Poor\", \"aesthetics\": \"Very Poor\"}").text_only(),
        );
        let record = f
            .evaluator()
            .judge_mode(JudgeMode::Combined)
            .judge_modality(JudgeModality::Source)
            .build()
            .unwrap()
            .evaluate(&TestCaseRow::new(10, "bar plot", "data.csv"))
            .await
            .unwrap();

        assert_eq!(record.correctness(), Some(JudgeVerdict::Poor));
        assert_eq!(record.aesthetic_quality(), Some(JudgeVerdict::VeryPoor));
        assert_eq!(f.judge.calls(), 1);
    }

    #[cfg(feature = "openai")]
    #[test]
    fn test_from_config_resolves_endpoints() {
        let mut config = RuntimeConfig::default();
        for profile in config.generation.profiles.values_mut() {
            profile.api_key = Some("sk-test".to_string());
        }
        config.judge.endpoint.api_key = Some("sk-judge".to_string());
        let registry = ProviderRegistry::with_defaults();

        let dir = tempfile::tempdir().unwrap();
        let evaluator = EvaluatorBuilder::from_config(&config, &registry, "deepseek-r1")
            .unwrap()
            .executor(Arc::new(FakeExecutor::new(dir.path())))
            .build()
            .unwrap();
        assert_eq!(evaluator.model(), "deepseek-r1");
        assert_eq!(evaluator.generation.model, "deepseek-reasoner");

        config.judge.endpoint.vision = false;
        let err = EvaluatorBuilder::from_config(&config, &registry, "deepseek-r1").unwrap_err();
        assert!(matches!(err, EvaluateError::NotConfigured(_)));

        config.judge.modality = JudgeModality::Source;
        assert!(EvaluatorBuilder::from_config(&config, &registry, "deepseek-r1").is_ok());
    }

    #[test]
    fn test_builder_requires_generator() {
        let err = Evaluator::builder().build().unwrap_err();
        assert!(matches!(err, EvaluateError::NotConfigured(_)));
    }

    #[test]
    fn test_builder_debug_names_parts() {
        let rendered = format!("{:?}", Evaluator::builder().model("deepseek-v3"));
        assert!(rendered.contains("EvaluatorBuilder"));
        assert!(rendered.contains("deepseek-v3"));
        assert!(rendered.contains("executor: false"));
    }
}
