//! Runtime configuration.
//!
//! Loaded from YAML, checked against an embedded JSON Schema, then
//! deserialised into typed sections. Every section has defaults, and
//! [`RuntimeConfig::default`] reproduces the reference deployment:
//! DeepSeek and DashScope endpoints for the models they host, OpenAI for
//! everything else, and a Qwen vision model on DashScope as judge.

use crate::providers::{ApiCredential, CompletionConfig, ProviderError};
use crate::retry::RetryPolicy;
use plotbench_core::{PromptTemplates, TemplateError, TemplateName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Embedded config schema (loaded at compile time).
const CONFIG_SCHEMA_JSON: &str = include_str!("../schema/config.schema.json");

/// Compiled JSON Schema validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DASHSCOPE_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_JUDGE_MODEL: &str = "qwen2.5-vl-72b-instruct";

/// Provider type used when a profile names none.
pub const DEFAULT_PROVIDER: &str = "openai-compatible";

/// Errors from loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to convert config: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config does not match schema: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("Failed to load config schema: {0}")]
    SchemaLoad(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
}

/// `humantime` strings such as `"30s"` or `"1m 30s"`.
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom)
    }
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(100)
}

/// How to reach one chat endpoint.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointProfile {
    /// Provider factory name, e.g. `openai-compatible` or `anthropic`
    #[serde(default = "default_provider")]
    pub provider: String,

    pub base_url: String,

    /// Remote model identifier; the requested model name when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Inline key. Prefer `api_key_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Per-request timeout
    #[serde(default = "default_request_timeout", with = "duration_str")]
    pub timeout: Duration,

    /// Accepts image attachments
    #[serde(default)]
    pub vision: bool,
}

impl EndpointProfile {
    /// An OpenAI-compatible endpoint keyed from `api_key_env`.
    pub fn openai_compatible(base_url: impl Into<String>, api_key_env: impl Into<String>) -> Self {
        Self {
            provider: default_provider(),
            base_url: base_url.into(),
            model: None,
            api_key: None,
            api_key_env: Some(api_key_env.into()),
            max_tokens: default_max_tokens(),
            temperature: None,
            timeout: default_request_timeout(),
            vision: false,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_vision(mut self, vision: bool) -> Self {
        self.vision = vision;
        self
    }

    /// Remote model name for a request made as `requested`.
    pub fn remote_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.model.as_deref().unwrap_or(requested)
    }

    /// Completion settings for a request made as `requested`.
    pub fn completion_config(&self, requested: &str) -> CompletionConfig {
        CompletionConfig {
            model: self.remote_model(requested).to_string(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            timeout: self.timeout,
        }
    }

    /// Load this profile's API key.
    pub fn credential(&self, name: impl Into<String>) -> Result<ApiCredential, ProviderError> {
        ApiCredential::resolve(self.api_key.as_deref(), self.api_key_env.as_deref(), name)
    }
}

impl fmt::Debug for EndpointProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointProfile")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_key_env", &self.api_key_env)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .field("vision", &self.vision)
            .finish()
    }
}

fn default_preview_rows() -> usize {
    plotbench_core::DEFAULT_PREVIEW_ROWS
}

fn default_generation_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_generation_endpoint() -> EndpointProfile {
    EndpointProfile::openai_compatible(OPENAI_BASE_URL, "OPENAI_API_KEY")
}

fn default_profiles() -> BTreeMap<String, EndpointProfile> {
    let deepseek = EndpointProfile::openai_compatible(DEEPSEEK_BASE_URL, "DEEPSEEK_API_KEY");
    let dashscope = EndpointProfile::openai_compatible(DASHSCOPE_BASE_URL, "ALIYUN_API_KEY");

    BTreeMap::from([
        ("deepseek-v3".to_string(), deepseek.clone().with_model("deepseek-chat")),
        ("deepseek-r1".to_string(), deepseek.with_model("deepseek-reasoner")),
        ("qwen*".to_string(), dashscope.clone()),
        ("qwq*".to_string(), dashscope),
    ])
}

/// Generation endpoint routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Dataset rows shown in the user prompt
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,

    /// Bound on the whole generation step, retries included
    #[serde(default = "default_generation_timeout", with = "duration_str")]
    pub timeout: Duration,

    /// Endpoint for models no profile matches
    #[serde(default = "default_generation_endpoint")]
    pub default: EndpointProfile,

    /// Profiles keyed by model name; a trailing `*` matches by prefix
    #[serde(default = "default_profiles")]
    pub profiles: BTreeMap<String, EndpointProfile>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            preview_rows: default_preview_rows(),
            timeout: default_generation_timeout(),
            default: default_generation_endpoint(),
            profiles: default_profiles(),
        }
    }
}

/// One call per axis, or one call for both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeMode {
    #[default]
    Separate,
    Combined,
}

/// What the judge is shown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeModality {
    /// The rendered figure
    #[default]
    Image,
    /// The script source, text only
    Source,
}

fn default_judge_endpoint() -> EndpointProfile {
    let mut endpoint = EndpointProfile::openai_compatible(DASHSCOPE_BASE_URL, "DASHSCOPE_API_KEY")
        .with_model(DEFAULT_JUDGE_MODEL)
        .with_vision(true);
    endpoint.max_tokens = 512;
    endpoint.temperature = Some(0.0);
    endpoint
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(default)]
    pub mode: JudgeMode,

    #[serde(default)]
    pub modality: JudgeModality,

    #[serde(default = "default_judge_endpoint")]
    pub endpoint: EndpointProfile,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            mode: JudgeMode::default(),
            modality: JudgeModality::default(),
            endpoint: default_judge_endpoint(),
        }
    }
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_sandbox_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_dpi() -> u32 {
    300
}

fn default_max_stderr_bytes() -> usize {
    4096
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Extra interpreter arguments, placed before the harness path
    #[serde(default)]
    pub args: Vec<String>,

    /// Hard wall-clock limit per script
    #[serde(default = "default_sandbox_timeout", with = "duration_str")]
    pub timeout: Duration,

    #[serde(default = "default_dpi")]
    pub dpi: u32,

    /// Tail of stderr kept in failure reasons
    #[serde(default = "default_max_stderr_bytes")]
    pub max_stderr_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            args: Vec::new(),
            timeout: default_sandbox_timeout(),
            dpi: default_dpi(),
            max_stderr_bytes: default_max_stderr_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchModeKind {
    Sequential,
    #[default]
    Concurrent,
}

fn default_max_in_flight() -> usize {
    12
}

fn default_resume() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub mode: BatchModeKind,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Reuse unit files from an earlier run
    #[serde(default = "default_resume")]
    pub resume: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            mode: BatchModeKind::default(),
            max_in_flight: default_max_in_flight(),
            resume: default_resume(),
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub judge: JudgeConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Overrides for built-in prompt templates
    #[serde(default)]
    pub templates: BTreeMap<TemplateName, String>,
}

impl RuntimeConfig {
    /// Parse and validate YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        if value.is_null() {
            value = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        }

        let json = serde_json::to_value(&value)?;
        validate_schema(&json)?;

        let config: RuntimeConfig = serde_json::from_value(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Checks the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.min_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid(
                "retry.min_delay must not exceed retry.max_delay".to_string(),
            ));
        }

        if self.sandbox.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "sandbox.timeout must be positive".to_string(),
            ));
        }

        if let Some(key) = self
            .generation
            .profiles
            .keys()
            .find(|k| k.trim_end_matches('*').is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "generation profile key '{}' matches every model; set generation.default instead",
                key
            )));
        }

        self.templates()?;
        Ok(())
    }

    /// Endpoint for `model`, with its remote model name filled in.
    ///
    /// An exact profile key wins, then the longest matching `prefix*` key,
    /// then the default endpoint.
    pub fn profile_for_model(&self, model: &str) -> EndpointProfile {
        let profiles = &self.generation.profiles;

        let matched = profiles.get(model).or_else(|| {
            profiles
                .iter()
                .filter_map(|(key, profile)| {
                    let prefix = key.strip_suffix('*')?;
                    model.starts_with(prefix).then_some((prefix.len(), profile))
                })
                .max_by_key(|(len, _)| *len)
                .map(|(_, profile)| profile)
        });

        let mut profile = matched.unwrap_or(&self.generation.default).clone();
        let remote = profile.remote_model(model).to_string();
        profile.model = Some(remote);
        profile
    }

    /// Built-in templates with this config's overrides applied.
    pub fn templates(&self) -> Result<PromptTemplates, TemplateError> {
        let mut builder = crate::prompts::builtin_templates()?.to_builder();
        for (name, text) in &self.templates {
            builder = builder.set(*name, text)?;
        }
        builder.build()
    }
}

fn get_validator() -> Result<&'static jsonschema::Validator, ConfigError> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = serde_json::from_str(CONFIG_SCHEMA_JSON)
            .map_err(|e| format!("Invalid schema JSON: {}", e))?;

        jsonschema::options()
            .build(&schema_value)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });

    result
        .as_ref()
        .map_err(|e| ConfigError::SchemaLoad(e.clone()))
}

fn validate_schema(value: &serde_json::Value) -> Result<(), ConfigError> {
    let validator = get_validator()?;

    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Schema(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let config = RuntimeConfig::from_yaml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.batch.max_in_flight, 12);
        assert_eq!(config.sandbox.dpi, 300);
        assert_eq!(config.judge.endpoint.model.as_deref(), Some(DEFAULT_JUDGE_MODEL));
    }

    #[test]
    fn test_model_routing() {
        let config = RuntimeConfig::default();

        let v3 = config.profile_for_model("deepseek-v3");
        assert_eq!(v3.base_url, DEEPSEEK_BASE_URL);
        assert_eq!(v3.model.as_deref(), Some("deepseek-chat"));
        assert_eq!(v3.api_key_env.as_deref(), Some("DEEPSEEK_API_KEY"));

        let r1 = config.profile_for_model("deepseek-r1");
        assert_eq!(r1.model.as_deref(), Some("deepseek-reasoner"));

        let qwen = config.profile_for_model("qwen-plus");
        assert_eq!(qwen.base_url, DASHSCOPE_BASE_URL);
        assert_eq!(qwen.model.as_deref(), Some("qwen-plus"));

        let other = config.profile_for_model("gpt-4o");
        assert_eq!(other.base_url, OPENAI_BASE_URL);
        assert_eq!(other.model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let yaml = r#"
generation:
  profiles:
    "qwen*":
      base_url: https://a.example/v1
    "qwen2.5*":
      base_url: https://b.example/v1
"#;
        let config = RuntimeConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.profile_for_model("qwen2.5-coder").base_url, "https://b.example/v1");
        assert_eq!(config.profile_for_model("qwen-max").base_url, "https://a.example/v1");
        assert_eq!(config.profile_for_model("deepseek-v3").base_url, OPENAI_BASE_URL);
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
generation:
  preview_rows: 3
  timeout: 2m
  default:
    base_url: http://localhost:8000/v1
    api_key: local-key
    max_tokens: 2048
judge:
  mode: combined
  modality: source
  endpoint:
    provider: anthropic
    base_url: https://api.anthropic.com/v1
    model: claude-sonnet-4-5
    api_key_env: ANTHROPIC_API_KEY
    timeout: 45s
sandbox:
  interpreter: /usr/bin/python3
  args: ["-I"]
  timeout: 90s
batch:
  mode: sequential
  resume: false
retry:
  max_attempts: 5
  min_delay: 250ms
  max_delay: 10s
templates:
  aesthetic_user: "Rate the chart for: $instruction"
"#;
        let config = RuntimeConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.generation.preview_rows, 3);
        assert_eq!(config.generation.timeout, Duration::from_secs(120));
        assert_eq!(config.judge.mode, JudgeMode::Combined);
        assert_eq!(config.judge.modality, JudgeModality::Source);
        assert_eq!(config.judge.endpoint.timeout, Duration::from_secs(45));
        assert_eq!(config.sandbox.args, vec!["-I".to_string()]);
        assert_eq!(config.batch.mode, BatchModeKind::Sequential);
        assert!(!config.batch.resume);
        assert_eq!(config.retry.min_delay, Duration::from_millis(250));

        let templates = config.templates().unwrap();
        let params = plotbench_core::TemplateParams::new().with("instruction", "bar chart");
        assert_eq!(
            templates.render(TemplateName::AestheticUser, &params).unwrap(),
            "Rate the chart for: bar chart"
        );
    }

    #[test]
    fn test_example_config_parses() {
        let yaml = include_str!("../../../plotbench.example.yaml");
        let config = RuntimeConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.judge, RuntimeConfig::default().judge);
        assert_eq!(config.batch, BatchConfig::default());
        assert_eq!(
            config.profile_for_model("deepseek-r1").model.as_deref(),
            Some("deepseek-reasoner")
        );
        assert_eq!(
            config.profile_for_model("qwen-max").base_url,
            DASHSCOPE_BASE_URL
        );
        assert_eq!(config.profile_for_model("claude-sonnet-4-5").provider, "anthropic");
    }

    #[test]
    fn test_schema_rejects_unknown_keys() {
        let err = RuntimeConfig::from_yaml_str("batch:\n  max_inflight: 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Schema(_)));

        let err = RuntimeConfig::from_yaml_str("batch:\n  max_in_flight: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Schema(_)));
    }

    #[test]
    fn test_schema_rejects_bad_duration_and_url() {
        assert!(matches!(
            RuntimeConfig::from_yaml_str("sandbox:\n  timeout: soon\n"),
            Err(ConfigError::Schema(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_yaml_str("judge:\n  endpoint:\n    base_url: ftp://x\n"),
            Err(ConfigError::Schema(_))
        ));
    }

    #[test]
    fn test_template_override_with_bad_placeholder() {
        let err = RuntimeConfig::from_yaml_str("templates:\n  aesthetic_user: \"$source\"\n")
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Template(TemplateError::UnknownPlaceholder { .. })
        ));
    }

    #[test]
    fn test_semantic_validation() {
        let err = RuntimeConfig::from_yaml_str("retry:\n  min_delay: 1m\n  max_delay: 1s\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_profile_debug_redacts_key() {
        let mut profile = EndpointProfile::openai_compatible(OPENAI_BASE_URL, "OPENAI_API_KEY");
        profile.api_key = Some("sk-very-secret".to_string());
        let debug = format!("{:?}", profile);
        assert!(!debug.contains("sk-very-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_completion_config_uses_remote_model() {
        let profile = EndpointProfile::openai_compatible(DEEPSEEK_BASE_URL, "DEEPSEEK_API_KEY")
            .with_model("deepseek-chat");
        let cc = profile.completion_config("deepseek-v3");
        assert_eq!(cc.model, "deepseek-chat");
        assert_eq!(cc.max_tokens, 4096);
        assert_eq!(cc.timeout, Duration::from_secs(100));
    }
}
