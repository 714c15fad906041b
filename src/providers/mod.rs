pub mod claude;
pub mod deepseek;
pub mod dify;
pub mod openai;

use crate::chat::{ChatRequest, Message, RelayChunk};
use crate::config::{ProviderConfig, ProviderKind};
use crate::credentials::Credential;
use crate::error::GatewayError;
use crate::sse::UpstreamEvent;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

/// What a single upstream frame means for the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum Interpretation {
    Chunk(RelayChunk),
    /// Well-formed but carries nothing worth relaying (pings, bookkeeping events).
    Skip,
    /// Provider signalled the end of the answer.
    Done,
    /// Provider reported an error inside the stream.
    Fail(String),
    /// The `data:` payload could not be parsed.
    Malformed(String),
}

/// Provider-specific request construction and stream decoding.
pub trait ProviderAdapter: Send + Sync + 'static {
    fn kind(&self) -> ProviderKind;
    fn endpoint(&self, provider: &ProviderConfig) -> String;
    fn auth_headers(&self, credential: &Credential) -> Result<HeaderMap, GatewayError>;
    fn build_payload(&self, req: &ChatRequest, upstream_model: &str) -> Value;
    fn interpret(&self, event: &UpstreamEvent) -> Interpretation;
}

pub fn adapter_for(kind: ProviderKind) -> &'static dyn ProviderAdapter {
    match kind {
        ProviderKind::OpenAi => &openai::OpenAiAdapter,
        ProviderKind::DeepSeek => &deepseek::DeepSeekAdapter,
        ProviderKind::Claude => &claude::ClaudeAdapter,
        ProviderKind::Dify => &dify::DifyAdapter,
    }
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn header_value(raw: &str) -> Result<HeaderValue, GatewayError> {
    let mut value = HeaderValue::from_str(raw).map_err(|_| {
        GatewayError::InvalidCredential(
            "credential contains characters not allowed in headers".into(),
        )
    })?;
    value.set_sensitive(true);
    Ok(value)
}

pub(crate) fn bearer_headers(credential: &Credential) -> Result<HeaderMap, GatewayError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        header_value(&format!("Bearer {}", credential.secret()))?,
    );
    Ok(headers)
}

pub(crate) fn key_header(
    credential: &Credential,
    name: &'static str,
) -> Result<HeaderMap, GatewayError> {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static(name), header_value(credential.secret())?);
    Ok(headers)
}

pub(crate) fn parse_data(event: &UpstreamEvent) -> Result<Value, Interpretation> {
    serde_json::from_str(&event.data).map_err(|err| Interpretation::Malformed(err.to_string()))
}

pub(crate) fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Flattens a role-tagged history into one prompt for providers that take a single query.
pub fn collapse_history(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::{adapter_for, collapse_history, join_url};
    use crate::chat::{Message, Role};
    use crate::config::ProviderKind;
    use crate::credentials::{Credential, CredentialSource};
    use crate::error::GatewayError;

    #[test]
    fn registry_covers_every_kind() {
        for kind in ProviderKind::ALL {
            assert_eq!(adapter_for(kind).kind(), kind);
        }
    }

    #[test]
    fn join_url_avoids_double_version_prefix() {
        assert_eq!(
            join_url("https://api.openai.com/v1/", "/v1/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            join_url("http://127.0.0.1:9000", "v1/chat-messages"),
            "http://127.0.0.1:9000/v1/chat-messages"
        );
    }

    #[test]
    fn collapse_history_tags_each_turn() {
        let messages = vec![
            Message {
                role: Role::System,
                content: "be brief".to_string(),
            },
            Message {
                role: Role::Assistant,
                content: "  ".to_string(),
            },
            Message {
                role: Role::User,
                content: "hello".to_string(),
            },
        ];
        assert_eq!(collapse_history(&messages), "system: be brief\nuser: hello");
    }

    #[test]
    fn credentials_unfit_for_headers_are_rejected() {
        let credential = Credential::new("sk-bad\nkey", CredentialSource::Caller);
        for kind in ProviderKind::ALL {
            assert!(matches!(
                adapter_for(kind).auth_headers(&credential),
                Err(GatewayError::InvalidCredential(_))
            ));
        }
    }
}
