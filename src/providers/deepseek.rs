use crate::chat::ChatRequest;
use crate::config::{ProviderConfig, ProviderKind};
use crate::credentials::Credential;
use crate::error::GatewayError;
use crate::providers::openai::{chat_completion_payload, interpret_chat_completion};
use crate::providers::{Interpretation, ProviderAdapter, bearer_headers, join_url};
use crate::sse::UpstreamEvent;
use reqwest::header::HeaderMap;
use serde_json::Value;

/// OpenAI-compatible wire format; reasoning models also stream `reasoning_content`.
pub struct DeepSeekAdapter;

impl ProviderAdapter for DeepSeekAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::DeepSeek
    }

    fn endpoint(&self, provider: &ProviderConfig) -> String {
        join_url(provider.base_url(), "/chat/completions")
    }

    fn auth_headers(&self, credential: &Credential) -> Result<HeaderMap, GatewayError> {
        bearer_headers(credential)
    }

    fn build_payload(&self, req: &ChatRequest, upstream_model: &str) -> Value {
        chat_completion_payload(req, upstream_model)
    }

    fn interpret(&self, event: &UpstreamEvent) -> Interpretation {
        interpret_chat_completion(event, true)
    }
}

#[cfg(test)]
mod tests {
    use super::DeepSeekAdapter;
    use crate::config::{ProviderConfig, ProviderKind};
    use crate::providers::{Interpretation, ProviderAdapter};
    use crate::sse::UpstreamEvent;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn endpoint_has_no_version_segment() {
        let provider = ProviderConfig {
            id: "ds".to_string(),
            kind: ProviderKind::DeepSeek,
            base_url: None,
            keys: HashMap::new(),
            default_key: None,
            default_key_env: None,
        };
        assert_eq!(
            DeepSeekAdapter.endpoint(&provider),
            "https://api.deepseek.com/chat/completions"
        );
    }

    #[test]
    fn keeps_reasoning_content() {
        let event = UpstreamEvent::message(
            json!({"choices": [{"delta": {"content": null, "reasoning_content": "thinking"}}]})
                .to_string(),
        );
        let Interpretation::Chunk(chunk) = DeepSeekAdapter.interpret(&event) else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.answer, None);
        assert_eq!(chunk.fields["reasoning"], "thinking");
    }
}
