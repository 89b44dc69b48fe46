//! Provider factory pattern for dynamic LLM provider registration.
//!
//! Endpoint profiles name a provider type; the registry maps that name to a
//! factory which builds the provider from the profile.
//!
//! ## Usage
//!
//! ```ignore
//! let registry = ProviderRegistry::with_defaults();
//! let profile = config.profile_for_model("deepseek-v3");
//! let provider = registry.create_for(&profile)?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{LlmProvider, ProviderError};
use crate::config::EndpointProfile;

/// Factory for creating LLM providers from an endpoint profile.
///
/// Implement this trait to add a new provider type. Each factory is
/// responsible for:
/// 1. Validating the profile
/// 2. Creating provider instances
/// 3. Providing a unique type identifier
pub trait ProviderFactory: Send + Sync {
    /// Unique identifier for this provider type.
    ///
    /// Examples: "openai-compatible", "anthropic"
    fn provider_type(&self) -> &'static str;

    /// Create a provider instance for `profile`.
    fn create(&self, profile: &EndpointProfile) -> Result<Arc<dyn LlmProvider>, ProviderError>;

    /// Validate a profile without creating a provider.
    ///
    /// Use this for fast config validation during startup.
    fn validate(&self, profile: &EndpointProfile) -> Result<(), ProviderError> {
        validate_base_url(&profile.base_url)?;
        if !super::ApiCredential::is_available(
            profile.api_key.as_deref(),
            profile.api_key_env.as_deref(),
        ) {
            return Err(ProviderError::NotConfigured(format!(
                "{} endpoint {} has no API key: set 'api_key' or export {}",
                self.provider_type(),
                profile.base_url,
                profile.api_key_env.as_deref().unwrap_or("an 'api_key_env' variable")
            )));
        }
        Ok(())
    }

    /// Human-readable description of this provider.
    fn description(&self) -> &'static str {
        "LLM Provider"
    }
}

/// Reject base URLs that are not HTTP(S).
pub(crate) fn validate_base_url(url: &str) -> Result<(), ProviderError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ProviderError::NotConfigured(format!(
            "base_url must start with http:// or https://, got '{}'",
            url
        )))
    }
}

/// Registry of available provider factories.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider factory.
    ///
    /// If a factory with the same type already exists, it will be replaced.
    pub fn register(&mut self, factory: Arc<dyn ProviderFactory>) {
        self.factories
            .insert(factory.provider_type().to_string(), factory);
    }

    fn factory(&self, provider_type: &str) -> Result<&Arc<dyn ProviderFactory>, ProviderError> {
        self.factories.get(provider_type).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "Unknown provider type: '{}'. Available: {:?}",
                provider_type,
                self.available_types()
            ))
        })
    }

    /// Create a provider from type name and profile.
    pub fn create(
        &self,
        provider_type: &str,
        profile: &EndpointProfile,
    ) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        self.factory(provider_type)?.create(profile)
    }

    /// Create the provider a profile names.
    pub fn create_for(
        &self,
        profile: &EndpointProfile,
    ) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        self.create(&profile.provider, profile)
    }

    /// Validate a profile against the factory it names.
    pub fn validate(&self, profile: &EndpointProfile) -> Result<(), ProviderError> {
        self.factory(&profile.provider)?.validate(profile)
    }

    /// List available provider types.
    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    /// Check if a provider type is registered.
    pub fn has_provider(&self, provider_type: &str) -> bool {
        self.factories.contains_key(provider_type)
    }

    /// Get the factory for a provider type.
    pub fn get_factory(&self, provider_type: &str) -> Option<&Arc<dyn ProviderFactory>> {
        self.factories.get(provider_type)
    }

    /// Create a registry with every provider compiled into this build.
    #[allow(unused_mut)]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        #[cfg(feature = "openai")]
        registry.register(Arc::new(super::OpenAiCompatibleFactory));
        #[cfg(feature = "anthropic")]
        registry.register(Arc::new(super::AnthropicProviderFactory));
        registry
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.available_types())
            .finish()
    }
}
