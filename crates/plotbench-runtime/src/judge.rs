//! Judge client.
//!
//! Sends one scoring request per call to a judge model and turns the reply
//! into a categorical verdict. Unparseable replies are `Unknown`; only
//! failures to get a reply at all are errors.

use crate::encoder::EncodedImage;
use crate::providers::{ChatMessage, CompletionConfig, LlmProvider, ProviderError};
use crate::retry::RetryPolicy;
use crate::usage::UsageTracker;
use plotbench_core::{CombinedVerdict, JudgeVerdict, PromptTemplates, TemplateError, TemplateName, TemplateParams};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Longest reply excerpt logged for an unparseable verdict.
const LOGGED_REPLY_CHARS: usize = 200;

/// Errors from a judge call.
#[derive(Error, Debug)]
pub enum JudgeError {
    #[error("Judge unavailable: {0}")]
    Unavailable(#[from] ProviderError),

    #[error("Judge provider '{0}' does not accept image content")]
    Unsupported(String),

    #[error("Judge prompt could not be rendered: {0}")]
    Template(#[from] TemplateError),
}

/// Which axis a single-label judge call scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JudgeKind {
    Aesthetics,
    Correctness,
}

impl JudgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JudgeKind::Aesthetics => "aesthetics",
            JudgeKind::Correctness => "correctness",
        }
    }

    fn system_template(&self) -> TemplateName {
        match self {
            JudgeKind::Aesthetics => TemplateName::AestheticSystem,
            JudgeKind::Correctness => TemplateName::CorrectnessSystem,
        }
    }

    fn image_user_template(&self) -> TemplateName {
        match self {
            JudgeKind::Aesthetics => TemplateName::AestheticUser,
            JudgeKind::Correctness => TemplateName::CorrectnessUser,
        }
    }
}

impl fmt::Display for JudgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the judge is shown.
#[derive(Debug, Clone)]
pub enum JudgeContent {
    /// The rendered figure plus the original request
    Image {
        image: EncodedImage,
        instruction: String,
    },
    /// The script text plus the original request
    Source { source: String, instruction: String },
}

impl JudgeContent {
    pub fn has_image(&self) -> bool {
        matches!(self, JudgeContent::Image { .. })
    }

    fn instruction(&self) -> &str {
        match self {
            JudgeContent::Image { instruction, .. } | JudgeContent::Source { instruction, .. } => {
                instruction
            }
        }
    }
}

/// Client for the judge endpoint.
#[derive(Clone)]
pub struct JudgeClient {
    provider: Arc<dyn LlmProvider>,
    config: CompletionConfig,
    templates: Arc<PromptTemplates>,
    retry: RetryPolicy,
    usage: Option<Arc<UsageTracker>>,
}

impl fmt::Debug for JudgeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JudgeClient")
            .field("provider", &self.provider.name())
            .field("model", &self.config.model)
            .field("retry", &self.retry)
            .finish()
    }
}

impl JudgeClient {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        config: CompletionConfig,
        templates: Arc<PromptTemplates>,
    ) -> Self {
        Self {
            provider,
            config,
            templates,
            retry: RetryPolicy::default(),
            usage: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_usage(mut self, usage: Arc<UsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Score one axis.
    pub async fn judge(
        &self,
        kind: JudgeKind,
        content: &JudgeContent,
    ) -> Result<JudgeVerdict, JudgeError> {
        let user_template = match content {
            JudgeContent::Image { .. } => kind.image_user_template(),
            JudgeContent::Source { .. } => TemplateName::SourceJudgeUser,
        };
        let messages = self.messages(kind.system_template(), user_template, content)?;
        let reply = self.send(messages).await?;

        let verdict = JudgeVerdict::parse(&reply);
        if !verdict.is_known() {
            tracing::debug!(
                judge = %kind,
                reply = %excerpt(&reply),
                "Judge reply has no recognisable label"
            );
        }
        Ok(verdict)
    }

    /// Score both axes in a single call.
    pub async fn judge_combined(
        &self,
        content: &JudgeContent,
    ) -> Result<CombinedVerdict, JudgeError> {
        let user_template = match content {
            JudgeContent::Image { .. } => TemplateName::CombinedUser,
            JudgeContent::Source { .. } => TemplateName::SourceJudgeUser,
        };
        let messages = self.messages(TemplateName::CombinedSystem, user_template, content)?;
        let reply = self.send(messages).await?;

        let verdict = CombinedVerdict::parse(&reply);
        if !verdict.correctness.is_known() || !verdict.aesthetics.is_known() {
            tracing::debug!(reply = %excerpt(&reply), "Combined judge reply only partly parsed");
        }
        Ok(verdict)
    }

    fn messages(
        &self,
        system: TemplateName,
        user: TemplateName,
        content: &JudgeContent,
    ) -> Result<Vec<ChatMessage>, JudgeError> {
        if content.has_image() && !self.provider.supports_images() {
            return Err(JudgeError::Unsupported(self.provider.name().to_string()));
        }

        let mut params = TemplateParams::new().with("instruction", content.instruction());
        if let JudgeContent::Source { source, .. } = content {
            params.insert("source", source.as_str());
        }

        let system = ChatMessage::system(self.templates.render(system, &params)?);
        let mut user_msg = ChatMessage::user(self.templates.render(user, &params)?);
        if let JudgeContent::Image { image, .. } = content {
            user_msg = user_msg.with_image(image.clone());
        }

        Ok(vec![system, user_msg])
    }

    async fn send(&self, messages: Vec<ChatMessage>) -> Result<String, JudgeError> {
        let timed = self
            .retry
            .complete(self.provider.as_ref(), &messages, &self.config)
            .await?;

        if let Some(usage) = &self.usage {
            usage.record_judge(&timed.response.usage);
        }
        tracing::debug!(
            model = %self.config.model,
            latency_ms = timed.latency.as_millis() as u64,
            attempts = timed.attempts,
            "Judge replied"
        );
        Ok(timed.response.content)
    }
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(LOGGED_REPLY_CHARS) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}
