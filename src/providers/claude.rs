use crate::chat::{ChatRequest, RelayChunk, Role};
use crate::config::{ProviderConfig, ProviderKind};
use crate::credentials::Credential;
use crate::error::GatewayError;
use crate::providers::{Interpretation, ProviderAdapter, join_url, key_header, parse_data};
use crate::sse::UpstreamEvent;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct ClaudeAdapter;

impl ProviderAdapter for ClaudeAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn endpoint(&self, provider: &ProviderConfig) -> String {
        join_url(provider.base_url(), "/v1/messages")
    }

    fn auth_headers(&self, credential: &Credential) -> Result<HeaderMap, GatewayError> {
        let mut headers = key_header(credential, "x-api-key")?;
        headers.insert(
            HeaderName::from_static("anthropic-version"),
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        Ok(headers)
    }

    fn build_payload(&self, req: &ChatRequest, upstream_model: &str) -> Value {
        let system = req
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        // Messages API only knows user/assistant; everything else is sent as user text.
        let mut turns: Vec<(&'static str, String)> = Vec::new();
        for m in req.messages.iter().filter(|m| m.role != Role::System) {
            let role = if m.role == Role::Assistant {
                "assistant"
            } else {
                "user"
            };
            match turns.last_mut() {
                Some((last_role, text)) if *last_role == role => {
                    text.push_str("\n\n");
                    text.push_str(&m.content);
                }
                _ => turns.push((role, m.content.clone())),
            }
        }
        let messages: Vec<Value> = turns
            .into_iter()
            .map(|(role, content)| json!({ "role": role, "content": content }))
            .collect();

        let mut body = json!({
            "model": upstream_model,
            "max_tokens": MAX_TOKENS,
            "messages": messages,
            "stream": true,
            "metadata": { "user_id": req.user },
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if let Some(temperature) = req.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }

    fn interpret(&self, event: &UpstreamEvent) -> Interpretation {
        let value = match parse_data(event) {
            Ok(v) => v,
            Err(malformed) => return malformed,
        };
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or(event.event.as_str());
        let mut chunk = RelayChunk::default().with_raw(event.data.clone());
        match kind {
            "message_start" => {
                let message = value.get("message");
                chunk.message_id = message
                    .and_then(|m| m.get("id"))
                    .and_then(|id| id.as_str())
                    .map(|id| id.to_string());
                if let Some(usage) = message.and_then(|m| m.get("usage")) {
                    chunk.fields.insert("usage".to_string(), usage.clone());
                }
            }
            "content_block_delta" => {
                let delta = value.get("delta");
                match delta.and_then(|d| d.get("type")).and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        chunk.answer = delta
                            .and_then(|d| d.get("text"))
                            .and_then(|t| t.as_str())
                            .filter(|t| !t.is_empty())
                            .map(|t| t.to_string());
                    }
                    Some("thinking_delta") => {
                        if let Some(thinking) = delta.and_then(|d| d.get("thinking")) {
                            chunk
                                .fields
                                .insert("reasoning".to_string(), thinking.clone());
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = value
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .filter(|r| !r.is_null())
                {
                    chunk
                        .fields
                        .insert("finish_reason".to_string(), reason.clone());
                }
                if let Some(usage) = value.get("usage") {
                    chunk.fields.insert("usage".to_string(), usage.clone());
                }
            }
            "message_stop" => return Interpretation::Done,
            "error" => {
                let message = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("upstream reported an error")
                    .to_string();
                return Interpretation::Fail(message);
            }
            _ => return Interpretation::Skip,
        }
        if chunk.is_empty() {
            Interpretation::Skip
        } else {
            Interpretation::Chunk(chunk)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ClaudeAdapter;
    use crate::chat::ChatRequest;
    use crate::credentials::{Credential, CredentialSource};
    use crate::providers::{Interpretation, ProviderAdapter};
    use crate::sse::UpstreamEvent;
    use serde_json::json;

    fn event(name: &str, data: serde_json::Value) -> UpstreamEvent {
        UpstreamEvent {
            event: name.to_string(),
            ..UpstreamEvent::message(data.to_string())
        }
    }

    #[test]
    fn payload_lifts_system_and_merges_roles() {
        let req = ChatRequest::from_value(json!({
            "model": "sonnet",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "system", "content": "no lists"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "tool", "content": "42"},
                {"role": "user", "content": "and?"}
            ]
        }))
        .unwrap();
        let body = ClaudeAdapter.build_payload(&req, "claude-sonnet");
        assert_eq!(body["system"], "be brief\n\nno lists");
        assert_eq!(body["max_tokens"], 4096);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"], "42\n\nand?");
    }

    #[test]
    fn auth_uses_api_key_header() {
        let headers = ClaudeAdapter
            .auth_headers(&Credential::new("sk-ant", CredentialSource::ModelConfig))
            .unwrap();
        assert_eq!(headers["x-api-key"], "sk-ant");
        assert_eq!(headers["anthropic-version"], "2023-06-01");
        assert!(headers.get("authorization").is_none());
    }

    #[test]
    fn interprets_message_lifecycle() {
        let start = event(
            "message_start",
            json!({"type": "message_start", "message": {"id": "msg_1", "usage": {"input_tokens": 3}}}),
        );
        let Interpretation::Chunk(chunk) = ClaudeAdapter.interpret(&start) else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.message_id.as_deref(), Some("msg_1"));

        let delta = event(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}}),
        );
        let Interpretation::Chunk(chunk) = ClaudeAdapter.interpret(&delta) else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.answer.as_deref(), Some("Hi"));

        let ping = event("ping", json!({"type": "ping"}));
        assert_eq!(ClaudeAdapter.interpret(&ping), Interpretation::Skip);

        let stop = event("message_stop", json!({"type": "message_stop"}));
        assert_eq!(ClaudeAdapter.interpret(&stop), Interpretation::Done);

        let failed = event(
            "error",
            json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
        );
        assert_eq!(
            ClaudeAdapter.interpret(&failed),
            Interpretation::Fail("Overloaded".to_string())
        );
    }
}
