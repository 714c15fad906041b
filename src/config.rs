use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "deepseek")]
    DeepSeek,
    #[serde(rename = "claude", alias = "anthropic")]
    Claude,
    #[serde(rename = "dify")]
    Dify,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [Self::OpenAi, Self::DeepSeek, Self::Claude, Self::Dify];

    /// Exact tag lookup. Tags are never guessed from partial matches.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "deepseek" => Some(Self::DeepSeek),
            "claude" | "anthropic" => Some(Self::Claude),
            "dify" => Some(Self::Dify),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::DeepSeek => "deepseek",
            Self::Claude => "claude",
            Self::Dify => "dify",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com",
            Self::DeepSeek => "https://api.deepseek.com",
            Self::Claude => "https://api.anthropic.com",
            Self::Dify => "https://api.dify.ai",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Static key table indexed by model or app identifier.
    #[serde(default)]
    pub keys: HashMap<String, String>,
    #[serde(default)]
    pub default_key: Option<String>,
    /// Environment variable read once at load time into `default_key`.
    #[serde(default)]
    pub default_key_env: Option<String>,
}

impl ProviderConfig {
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.kind.default_base_url())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelEntry {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub upstream_model: Option<String>,
    /// Key embedded in the model's own catalog entry.
    #[serde(default)]
    pub key: Option<String>,
}

impl ModelEntry {
    pub fn upstream_model(&self) -> &str {
        self.upstream_model
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RelayPolicy {
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    #[serde(default = "default_max_batch_delay_ms")]
    pub max_batch_delay_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            max_batch_bytes: default_max_batch_bytes(),
            max_batch_delay_ms: default_max_batch_delay_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl RelayPolicy {
    pub fn max_batch_delay(&self) -> Duration {
        Duration::from_millis(self.max_batch_delay_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

fn default_max_batch_bytes() -> usize {
    2048
}

fn default_max_batch_delay_ms() -> u64 {
    50
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_channel_capacity() -> usize {
    64
}

/// Provider and model catalog. Frozen once built; changes go through [`ConfigStore::replace`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    #[serde(default)]
    pub default_key: Option<String>,
    #[serde(default)]
    pub relay: Option<RelayPolicy>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse gateway config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid gateway config: {0}")]
    Invalid(String),
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text, |name| std::env::var(name).ok())
    }

    /// Parse a config document, resolving `default_key_env` entries through `env`.
    pub fn from_json_str(
        text: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config: GatewayConfig = serde_json::from_str(text)?;
        for provider in &mut config.providers {
            if provider.default_key.is_none() {
                if let Some(var) = provider.default_key_env.as_deref() {
                    provider.default_key = env(var).filter(|v| !v.trim().is_empty());
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut provider_ids = HashSet::new();
        for provider in &self.providers {
            if !provider_ids.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider id `{}`",
                    provider.id
                )));
            }
        }
        let mut model_ids = HashSet::new();
        for model in &self.models {
            if !model_ids.insert(model.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate model id `{}`",
                    model.id
                )));
            }
            if !provider_ids.contains(model.provider.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "model `{}` references unknown provider `{}`",
                    model.id, model.provider
                )));
            }
        }
        Ok(())
    }

    pub fn model(&self, model_id: &str) -> Option<&ModelEntry> {
        self.models.iter().find(|m| m.id == model_id)
    }

    pub fn provider(&self, provider_id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == provider_id)
    }
}

/// Holds the live configuration snapshot. Readers clone the `Arc`; writers swap it whole.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<Arc<GatewayConfig>>>,
}

impl ConfigStore {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub async fn snapshot(&self) -> Arc<GatewayConfig> {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, config: GatewayConfig) -> Arc<GatewayConfig> {
        let next = Arc::new(config);
        let mut guard = self.inner.write().await;
        std::mem::replace(&mut *guard, next)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, ConfigStore, GatewayConfig, ProviderKind, RelayPolicy};

    const SAMPLE: &str = r#"{
        "providers": [
            {"id": "dify-main", "kind": "dify", "keys": {"assistant-1": "app-key-1"}, "default_key_env": "DIFY_KEY"},
            {"id": "claude", "kind": "anthropic", "base_url": "http://localhost:9000"}
        ],
        "models": [
            {"id": "assistant-1", "provider": "dify-main"},
            {"id": "sonnet", "provider": "claude", "upstream_model": "claude-sonnet-4-20250514", "key": "sk-ant-embedded"}
        ],
        "relay": {"idle_timeout_ms": 5000}
    }"#;

    #[test]
    fn parses_catalog_and_resolves_env_defaults() {
        let config = GatewayConfig::from_json_str(SAMPLE, |name| {
            (name == "DIFY_KEY").then(|| "env-dify-key".to_string())
        })
        .unwrap();
        let dify = config.provider("dify-main").unwrap();
        assert_eq!(dify.kind, ProviderKind::Dify);
        assert_eq!(dify.default_key.as_deref(), Some("env-dify-key"));
        assert_eq!(dify.base_url(), "https://api.dify.ai");
        let claude = config.provider("claude").unwrap();
        assert_eq!(claude.kind, ProviderKind::Claude);
        assert_eq!(claude.base_url(), "http://localhost:9000");
        assert_eq!(
            config.model("sonnet").unwrap().upstream_model(),
            "claude-sonnet-4-20250514"
        );
        assert_eq!(config.model("assistant-1").unwrap().upstream_model(), "assistant-1");
        let relay = config.relay.unwrap();
        assert_eq!(relay.idle_timeout_ms, 5000);
        assert_eq!(relay.max_batch_bytes, RelayPolicy::default().max_batch_bytes);
    }

    #[test]
    fn rejects_models_pointing_at_missing_providers() {
        let err = GatewayConfig::from_json_str(
            r#"{"providers": [], "models": [{"id": "m", "provider": "nope"}]}"#,
            |_| None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_unknown_provider_kinds_and_fields() {
        assert!(GatewayConfig::from_json_str(
            r#"{"providers": [{"id": "x", "kind": "gpt"}]}"#,
            |_| None
        )
        .is_err());
        assert!(GatewayConfig::from_json_str(r#"{"provders": []}"#, |_| None).is_err());
    }

    #[test]
    fn provider_tags_match_exactly() {
        assert_eq!(ProviderKind::from_tag("Anthropic"), Some(ProviderKind::Claude));
        assert_eq!(ProviderKind::from_tag(" openai "), Some(ProviderKind::OpenAi));
        assert_eq!(ProviderKind::from_tag("openai-compatible"), None);
        assert_eq!(ProviderKind::from_tag("gpt-4o"), None);
    }

    #[tokio::test]
    async fn replace_swaps_whole_snapshot() {
        let store = ConfigStore::new(GatewayConfig::default());
        let before = store.snapshot().await;
        let next = GatewayConfig::from_json_str(SAMPLE, |_| None).unwrap();
        let previous = store.replace(next).await;
        assert!(std::sync::Arc::ptr_eq(&before, &previous));
        assert!(before.models.is_empty());
        assert_eq!(store.snapshot().await.models.len(), 2);
    }
}
