//! Picks the API key for a request.
//!
//! Sources are consulted in a fixed order and the first non-blank value wins:
//! the provider's static key table (by model id), the key embedded in the
//! model's catalog entry, the caller-supplied key, then the process default
//! (provider default first, gateway default second).

use crate::config::{GatewayConfig, ModelEntry, ProviderConfig};
use crate::error::GatewayError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    KeyTable,
    ModelConfig,
    Caller,
    ProcessDefault,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeyTable => "key_table",
            Self::ModelConfig => "model_config",
            Self::Caller => "caller",
            Self::ProcessDefault => "process_default",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    secret: String,
    source: CredentialSource,
}

impl Credential {
    pub fn new(secret: impl Into<String>, source: CredentialSource) -> Self {
        Self {
            secret: secret.into(),
            source,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn resolve(
    config: &GatewayConfig,
    provider: &ProviderConfig,
    model: &ModelEntry,
    caller_key: Option<&str>,
) -> Result<Credential, GatewayError> {
    let candidates = [
        (
            CredentialSource::KeyTable,
            non_blank(provider.keys.get(&model.id).map(String::as_str)),
        ),
        (CredentialSource::ModelConfig, non_blank(model.key.as_deref())),
        (CredentialSource::Caller, non_blank(caller_key)),
        (
            CredentialSource::ProcessDefault,
            non_blank(provider.default_key.as_deref())
                .or_else(|| non_blank(config.default_key.as_deref())),
        ),
    ];
    candidates
        .into_iter()
        .find_map(|(source, value)| value.map(|secret| Credential::new(secret, source)))
        .ok_or_else(|| GatewayError::NoCredential {
            model: model.id.clone(),
        })
}
