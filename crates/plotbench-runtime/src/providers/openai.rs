//! OpenAI-compatible chat completions provider.
//!
//! Covers every endpoint that speaks the `/chat/completions` dialect:
//! OpenAI itself, DeepSeek, DashScope compatible mode, SiliconFlow and
//! local servers such as vLLM. Images travel as `image_url` parts holding a
//! base64 data URL.
//!
//! ## Security
//!
//! The key is held in an [`ApiCredential`] and only exposed when the
//! `Authorization` header is built.

use super::{
    factory::{validate_base_url, ProviderFactory},
    secrets::ApiCredential,
    ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError, TokenUsage,
};
use crate::config::EndpointProfile;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Longest error body kept in an `ApiError` message.
const MAX_ERROR_BODY: usize = 512;

/// Provider for OpenAI-style chat endpoints.
pub struct OpenAiCompatibleProvider {
    credential: ApiCredential,
    base_url: String,
    vision: bool,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiCompatibleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleProvider")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .field("vision", &self.vision)
            .finish()
    }
}

impl OpenAiCompatibleProvider {
    /// Create a provider for `base_url`.
    ///
    /// A trailing slash on the URL is ignored.
    pub fn new(base_url: impl Into<String>, credential: ApiCredential) -> Result<Self, ProviderError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        validate_base_url(&base_url)?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))?;

        Ok(Self {
            credential,
            base_url,
            vision: false,
            client,
        })
    }

    /// Build from an endpoint profile, loading its credential.
    pub fn from_profile(profile: &EndpointProfile) -> Result<Self, ProviderError> {
        let credential = profile.credential(format!("API key for {}", profile.base_url))?;
        Ok(Self::new(&profile.base_url, credential)?.with_vision(profile.vision))
    }

    pub fn with_vision(mut self, vision: bool) -> Self {
        self.vision = vision;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: WireContent<'a>,
}

/// Plain text when there are no images, content parts otherwise.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(msg: &'a ChatMessage) -> Self {
        let content = if msg.images.is_empty() {
            WireContent::Text(&msg.content)
        } else {
            let mut parts: Vec<ContentPart<'a>> = msg
                .images
                .iter()
                .map(|image| ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image.data_url(),
                    },
                })
                .collect();
            parts.push(ContentPart::Text { text: &msg.content });
            WireContent::Parts(parts)
        };

        Self {
            role: &msg.role,
            content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Pull a readable message out of an error body.
fn error_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return parsed.error.message;
    }
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_ERROR_BODY) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        if !self.vision && messages.iter().any(ChatMessage::has_images) {
            return Err(ProviderError::NotConfigured(format!(
                "endpoint {} is not marked as accepting images",
                self.base_url
            )));
        }

        let request = ChatRequest {
            model: &config.model,
            messages: messages.iter().map(WireMessage::from).collect(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        };

        // SECURITY: Only expose the credential here, at the point of use
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.credential.expose())
            .timeout(config.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(config.timeout)
                } else {
                    ProviderError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthError);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ParseError("response has no choices".to_string()))?;

        let usage = body
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            usage,
            model: body.model.unwrap_or_else(|| config.model.clone()),
            stop_reason: choice.finish_reason,
        })
    }

    async fn health_check(&self) -> bool {
        !self.credential.is_empty()
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn supports_images(&self) -> bool {
        self.vision
    }
}

/// Factory for OpenAI-compatible endpoints.
pub struct OpenAiCompatibleFactory;

impl ProviderFactory for OpenAiCompatibleFactory {
    fn provider_type(&self) -> &'static str {
        "openai-compatible"
    }

    fn create(&self, profile: &EndpointProfile) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        Ok(Arc::new(OpenAiCompatibleProvider::from_profile(profile)?))
    }

    fn description(&self) -> &'static str {
        "OpenAI-compatible /chat/completions endpoint (OpenAI, DeepSeek, DashScope, vLLM)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncodedImage;
    use crate::providers::CredentialSource;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> OpenAiCompatibleProvider {
        let credential = ApiCredential::new("sk-test", CredentialSource::Programmatic, "Test key");
        OpenAiCompatibleProvider::new(format!("{}/", server.uri()), credential).unwrap()
    }

    fn config() -> CompletionConfig {
        CompletionConfig {
            model: "deepseek-chat".to_string(),
            max_tokens: 256,
            temperature: None,
            timeout: Duration::from_secs(5),
        }
    }

    fn ok_body(content: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "model": "deepseek-chat",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 120, "completion_tokens": 80, "total_tokens": 200}
        })
    }

    #[tokio::test]
    async fn test_complete_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "deepseek-chat",
                "max_tokens": 256,
                "messages": [
                    {"role": "system", "content": "You write matplotlib code."},
                    {"role": "user", "content": "Plot a bar chart"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("```python\nplt.bar([1],[2])\n```")))
            .expect(1)
            .mount(&server)
            .await;

        let response = provider(&server)
            .complete(
                vec![
                    ChatMessage::system("You write matplotlib code."),
                    ChatMessage::user("Plot a bar chart"),
                ],
                &config(),
            )
            .await
            .unwrap();

        assert!(response.content.contains("plt.bar"));
        assert_eq!(response.usage.total(), 200);
        assert_eq!(response.stop_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_image_sent_as_data_url_part() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "image_url", "image_url": {"url": "data:image/png;base64,iVBORw0KGgo="}},
                        {"type": "text", "text": "Rate this figure"}
                    ]
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("Good")))
            .expect(1)
            .mount(&server)
            .await;

        let message = ChatMessage::user("Rate this figure")
            .with_image(EncodedImage::new("image/png", "iVBORw0KGgo="));
        let response = provider(&server)
            .with_vision(true)
            .complete(vec![message], &config())
            .await
            .unwrap();
        assert_eq!(response.content, "Good");
    }

    #[tokio::test]
    async fn test_images_refused_without_vision() {
        let server = MockServer::start().await;
        let message = ChatMessage::user("Rate").with_image(EncodedImage::new("image/png", "AA=="));
        let err = provider(&server)
            .complete(vec![message], &config())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .complete(vec![ChatMessage::user("hi")], &config())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(7)
        ));
    }

    #[tokio::test]
    async fn test_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .complete(vec![ChatMessage::user("hi")], &config())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::AuthError));
    }

    #[tokio::test]
    async fn test_api_error_message_extracted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                "error": {"message": "Server overloaded"}
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .complete(vec![ChatMessage::user("hi")], &config())
            .await
            .unwrap_err();
        match err {
            ProviderError::ApiError { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "Server overloaded");
            }
            other => panic!("Expected ApiError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_choices_is_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let err = provider(&server)
            .complete(vec![ChatMessage::user("hi")], &config())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ParseError(_)));
    }

    #[test]
    fn test_error_message_falls_back_to_text() {
        assert_eq!(error_message("upstream timeout"), "upstream timeout");
        assert_eq!(error_message(&"x".repeat(600)).len(), MAX_ERROR_BODY + 3);
    }

    #[test]
    fn test_rejects_bad_base_url() {
        let credential = ApiCredential::new("k", CredentialSource::Programmatic, "Test key");
        assert!(OpenAiCompatibleProvider::new("api.deepseek.com", credential).is_err());
    }

    #[test]
    fn test_api_key_not_in_debug_output() {
        let secret = "sk-live-super-secret";
        let credential = ApiCredential::new(secret, CredentialSource::Config, "Test key");
        let provider = OpenAiCompatibleProvider::new("https://api.deepseek.com", credential).unwrap();
        let debug = format!("{:?}", provider);
        assert!(!debug.contains(secret));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_factory_create_from_profile() {
        let mut profile = EndpointProfile::openai_compatible("https://api.deepseek.com", "UNUSED");
        profile.api_key = Some("inline".to_string());
        profile.vision = true;

        let provider = OpenAiCompatibleFactory.create(&profile).unwrap();
        assert_eq!(provider.name(), "openai-compatible");
        assert!(provider.supports_images());
    }
}
