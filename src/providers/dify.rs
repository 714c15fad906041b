use crate::chat::{ChatRequest, RelayChunk};
use crate::config::{ProviderConfig, ProviderKind};
use crate::credentials::Credential;
use crate::error::GatewayError;
use crate::providers::{
    Interpretation, ProviderAdapter, bearer_headers, collapse_history, join_url, parse_data,
    str_field,
};
use crate::sse::UpstreamEvent;
use reqwest::header::HeaderMap;
use serde_json::{Value, json};

/// Dify chat apps. The app is selected by the key, so the upstream model name is unused.
pub struct DifyAdapter;

impl ProviderAdapter for DifyAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Dify
    }

    fn endpoint(&self, provider: &ProviderConfig) -> String {
        join_url(provider.base_url(), "/v1/chat-messages")
    }

    fn auth_headers(&self, credential: &Credential) -> Result<HeaderMap, GatewayError> {
        bearer_headers(credential)
    }

    fn build_payload(&self, req: &ChatRequest, _upstream_model: &str) -> Value {
        // A new conversation has no server-side history yet, so send it inline.
        let query = match req.conversation_id() {
            Some(_) => req.last_user_message().to_string(),
            None if req.messages.len() > 1 => collapse_history(&req.messages),
            None => req.last_user_message().to_string(),
        };
        json!({
            "inputs": {},
            "query": query,
            "response_mode": "streaming",
            "conversation_id": req.conversation_id().unwrap_or(""),
            "user": req.user,
        })
    }

    fn interpret(&self, event: &UpstreamEvent) -> Interpretation {
        let value = match parse_data(event) {
            Ok(v) => v,
            Err(malformed) => return malformed,
        };
        let name = value
            .get("event")
            .and_then(|e| e.as_str())
            .unwrap_or("message");
        let mut chunk = RelayChunk::default().with_raw(event.data.clone());
        chunk.conversation_id = str_field(&value, "conversation_id");
        chunk.message_id = str_field(&value, "message_id").or_else(|| str_field(&value, "id"));
        match name {
            "message" | "agent_message" => {
                chunk.answer = str_field(&value, "answer");
                if chunk.answer.is_none() && chunk.conversation_id.is_none() {
                    return Interpretation::Skip;
                }
            }
            "message_replace" => {
                chunk.answer = str_field(&value, "answer");
                chunk.fields.insert("replace".to_string(), json!(true));
            }
            "message_end" => {
                if let Some(usage) = value.get("metadata").and_then(|m| m.get("usage")) {
                    chunk.fields.insert("usage".to_string(), usage.clone());
                }
            }
            "error" => {
                let message = str_field(&value, "message")
                    .unwrap_or_else(|| "upstream reported an error".to_string());
                return Interpretation::Fail(message);
            }
            _ => return Interpretation::Skip,
        }
        Interpretation::Chunk(chunk)
    }
}
