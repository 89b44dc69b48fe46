//! Credential handling for LLM providers.
//!
//! API keys are wrapped in [`ApiCredential`] the moment they are read, so
//! they cannot end up in `Debug`/`Display` output or tracing fields.
//!
//! ## Usage
//!
//! ```ignore
//! use plotbench_runtime::providers::ApiCredential;
//!
//! // Inline key from config, falling back to the profile's env var
//! let cred = ApiCredential::resolve(profile.api_key.as_deref(), profile.api_key_env.as_deref(), "DeepSeek API key")?;
//!
//! // Explicit exposure at the point of use
//! request.bearer_auth(cred.expose());
//! ```

use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use super::ProviderError;

/// Where a credential was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Inline `api_key` in the runtime config
    Config,
    /// Environment variable named by the profile
    Environment,
    /// Provided programmatically
    Programmatic,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Config => write!(f, "config"),
            CredentialSource::Environment => write!(f, "environment"),
            CredentialSource::Programmatic => write!(f, "programmatic"),
        }
    }
}

/// A securely-stored API credential.
///
/// `Debug` and `Display` show `[REDACTED]`; the value is only reachable
/// through [`ApiCredential::expose`].
pub struct ApiCredential {
    value: SecretString,
    source: CredentialSource,
    name: String,
}

impl ApiCredential {
    /// Create a new credential from a string value.
    pub fn new(value: impl Into<String>, source: CredentialSource, name: impl Into<String>) -> Self {
        Self {
            value: SecretString::from(value.into()),
            source,
            name: name.into(),
        }
    }

    /// Load credential from an environment variable.
    pub fn from_env(env_var: &str, name: impl Into<String>) -> Result<Self, ProviderError> {
        let name = name.into();
        match std::env::var(env_var) {
            Ok(value) => Ok(Self::new(value, CredentialSource::Environment, name)),
            Err(_) => Err(ProviderError::NotConfigured(format!(
                "{} not set: configure '{}' environment variable",
                name, env_var
            ))),
        }
    }

    /// Use the inline key if given, else read `env_var`.
    ///
    /// Fails if neither yields a value.
    pub fn resolve(
        inline: Option<&str>,
        env_var: Option<&str>,
        name: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let name = name.into();

        if let Some(value) = inline {
            return Ok(Self::new(value, CredentialSource::Config, name));
        }

        match env_var {
            Some(var) => Self::from_env(var, name),
            None => Err(ProviderError::NotConfigured(format!(
                "{} required: set 'api_key' or 'api_key_env' in the endpoint profile",
                name
            ))),
        }
    }

    /// Check if a credential is available without loading it.
    pub fn is_available(inline: Option<&str>, env_var: Option<&str>) -> bool {
        inline.is_some() || env_var.is_some_and(|var| std::env::var(var).is_ok())
    }

    /// Expose the credential value for use in an API call.
    ///
    /// Call this where the value is needed (e.g. setting an HTTP header) and
    /// never store the result.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.value.expose_secret().is_empty()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("value", &"[REDACTED]")
            .field("source", &self.source)
            .field("name", &self.name)
            .finish()
    }
}

impl fmt::Display for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} [REDACTED]", self.name, self.source)
    }
}
