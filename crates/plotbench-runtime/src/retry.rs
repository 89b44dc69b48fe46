//! Retry with backoff for provider calls.
//!
//! Only transient failures (transport errors, timeouts, 429, 5xx) are
//! retried. Each attempt is timed on its own; callers get the latency of the
//! attempt that succeeded, so backoff sleeps never inflate the rate metric.

use crate::config::duration_str;
use crate::providers::{
    ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError,
};
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

fn default_max_attempts() -> u32 {
    3
}

fn default_min_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

/// How often and how patiently to retry a provider call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_min_delay", with = "duration_str")]
    pub min_delay: Duration,

    #[serde(default = "default_max_delay", with = "duration_str")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_delay: default_min_delay(),
            max_delay: default_max_delay(),
        }
    }
}

/// A completion plus how it was obtained.
#[derive(Debug, Clone)]
pub struct TimedResponse {
    pub response: CompletionResponse,

    /// Wall-clock time of the successful attempt only
    pub latency: Duration,

    pub attempts: u32,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .with_jitter()
    }

    /// Run a completion under this policy.
    ///
    /// Every attempt is bounded by `config.timeout`.
    pub async fn complete(
        &self,
        provider: &dyn LlmProvider,
        messages: &[ChatMessage],
        config: &CompletionConfig,
    ) -> Result<TimedResponse, ProviderError> {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let attempt = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let started = Instant::now();
            let response =
                tokio::time::timeout(config.timeout, provider.complete(messages.to_vec(), config))
                    .await
                    .map_err(|_| ProviderError::Timeout(config.timeout))??;
            Ok::<_, ProviderError>((response, started.elapsed()))
        };

        let (response, latency) = attempt
            .retry(self.backoff())
            .when(ProviderError::is_transient)
            .notify(|err: &ProviderError, delay: Duration| {
                tracing::warn!(
                    provider = provider.name(),
                    model = %config.model,
                    error = %err,
                    retry_in = ?delay,
                    "Transient provider error, retrying"
                );
            })
            .await?;

        Ok(TimedResponse {
            response,
            latency,
            attempts: attempts.load(Ordering::SeqCst),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::ScriptedProvider;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn config() -> CompletionConfig {
        CompletionConfig {
            model: "deepseek-chat".to_string(),
            timeout: Duration::from_secs(5),
            ..CompletionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let provider = ScriptedProvider::new("ok")
            .then(Err(ProviderError::HttpError("connection reset".into())))
            .then(Err(ProviderError::RateLimited { retry_after: None }));

        let timed = fast_policy(3)
            .complete(&provider, &[ChatMessage::user("hi")], &config())
            .await
            .unwrap();

        assert_eq!(timed.response.content, "ok");
        assert_eq!(timed.attempts, 3);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let provider = ScriptedProvider::new("ok").then(Err(ProviderError::AuthError));

        let err = fast_policy(5)
            .complete(&provider, &[ChatMessage::user("hi")], &config())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::AuthError));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let provider = ScriptedProvider::new("ok")
            .then(Err(ProviderError::Timeout(Duration::from_secs(1))))
            .then(Err(ProviderError::Timeout(Duration::from_secs(1))));

        let result = fast_policy(2)
            .complete(&provider, &[ChatMessage::user("hi")], &config())
            .await;

        assert!(matches!(result, Err(ProviderError::Timeout(_))));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_no_retry_policy() {
        let provider = ScriptedProvider::new("ok")
            .then(Err(ProviderError::HttpError("reset".into())));

        let result = RetryPolicy::none()
            .complete(&provider, &[ChatMessage::user("hi")], &config())
            .await;
        assert!(result.is_err());
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn test_policy_from_yaml() {
        let policy: RetryPolicy =
            serde_yaml::from_str("max_attempts: 4\nmin_delay: 500ms\n").unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.min_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }
}
