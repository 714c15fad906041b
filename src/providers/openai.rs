use crate::chat::{ChatRequest, RelayChunk};
use crate::config::{ProviderConfig, ProviderKind};
use crate::credentials::Credential;
use crate::error::GatewayError;
use crate::providers::{Interpretation, ProviderAdapter, bearer_headers, join_url, parse_data};
use crate::sse::UpstreamEvent;
use reqwest::header::HeaderMap;
use serde_json::{Value, json};

pub struct OpenAiAdapter;

impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn endpoint(&self, provider: &ProviderConfig) -> String {
        join_url(provider.base_url(), "/v1/chat/completions")
    }

    fn auth_headers(&self, credential: &Credential) -> Result<HeaderMap, GatewayError> {
        bearer_headers(credential)
    }

    fn build_payload(&self, req: &ChatRequest, upstream_model: &str) -> Value {
        chat_completion_payload(req, upstream_model)
    }

    fn interpret(&self, event: &UpstreamEvent) -> Interpretation {
        interpret_chat_completion(event, false)
    }
}

/// Structured `messages` body shared by the OpenAI-compatible providers.
pub(crate) fn chat_completion_payload(req: &ChatRequest, upstream_model: &str) -> Value {
    let messages: Vec<Value> = req
        .messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect();
    let mut body = json!({
        "model": upstream_model,
        "messages": messages,
        "stream": true,
        "stream_options": { "include_usage": true },
        "user": req.user,
    });
    if let Some(temperature) = req.temperature {
        body["temperature"] = json!(temperature);
    }
    body
}

pub(crate) fn interpret_chat_completion(
    event: &UpstreamEvent,
    with_reasoning: bool,
) -> Interpretation {
    if event.data.trim() == "[DONE]" {
        return Interpretation::Done;
    }
    let value = match parse_data(event) {
        Ok(v) => v,
        Err(malformed) => return malformed,
    };
    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string())
            .unwrap_or_else(|| err.to_string());
        return Interpretation::Fail(message);
    }

    let mut chunk = RelayChunk::default().with_raw(event.data.clone());
    let choice = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());
    let delta = choice.and_then(|c| c.get("delta"));
    chunk.answer = delta
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(|c| c.to_string());
    if with_reasoning {
        if let Some(reasoning) = delta
            .and_then(|d| d.get("reasoning_content"))
            .and_then(|r| r.as_str())
            .filter(|r| !r.is_empty())
        {
            chunk
                .fields
                .insert("reasoning".to_string(), json!(reasoning));
        }
    }
    if let Some(reason) = choice
        .and_then(|c| c.get("finish_reason"))
        .filter(|r| !r.is_null())
    {
        chunk
            .fields
            .insert("finish_reason".to_string(), reason.clone());
    }
    if let Some(usage) = value.get("usage").filter(|u| u.is_object()) {
        chunk.fields.insert("usage".to_string(), usage.clone());
    }
    if chunk.is_empty() {
        return Interpretation::Skip;
    }
    chunk.message_id = value
        .get("id")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());
    Interpretation::Chunk(chunk)
}

#[cfg(test)]
mod tests {
    use super::OpenAiAdapter;
    use crate::chat::ChatRequest;
    use crate::config::{ProviderConfig, ProviderKind};
    use crate::credentials::{Credential, CredentialSource};
    use crate::providers::{Interpretation, ProviderAdapter};
    use crate::sse::UpstreamEvent;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn builds_structured_payload() {
        let req = ChatRequest::from_value(json!({
            "model": "gpt",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"}
            ],
            "user": "u1",
            "temperature": 0.2
        }))
        .unwrap();
        let body = OpenAiAdapter.build_payload(&req, "gpt-4o-mini");
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["user"], "u1");
        assert_eq!(body["temperature"], 0.2);
    }

    #[test]
    fn endpoint_and_auth() {
        let provider = ProviderConfig {
            id: "oa".to_string(),
            kind: ProviderKind::OpenAi,
            base_url: Some("https://gateway.example/v1".to_string()),
            keys: HashMap::new(),
            default_key: None,
            default_key_env: None,
        };
        assert_eq!(
            OpenAiAdapter.endpoint(&provider),
            "https://gateway.example/v1/chat/completions"
        );
        let headers = OpenAiAdapter
            .auth_headers(&Credential::new("sk-1", CredentialSource::Caller))
            .unwrap();
        assert_eq!(headers["authorization"], "Bearer sk-1");
    }

    #[test]
    fn interprets_deltas_and_terminator() {
        let delta = UpstreamEvent::message(
            json!({"id": "chatcmpl-1", "choices": [{"delta": {"content": "hi"}, "finish_reason": null}]})
                .to_string(),
        );
        let Interpretation::Chunk(chunk) = OpenAiAdapter.interpret(&delta) else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.answer.as_deref(), Some("hi"));
        assert_eq!(chunk.message_id.as_deref(), Some("chatcmpl-1"));
        assert!(chunk.fields.is_empty());

        let role_only = UpstreamEvent::message(
            json!({"choices": [{"delta": {"role": "assistant", "content": ""}}]}).to_string(),
        );
        assert_eq!(OpenAiAdapter.interpret(&role_only), Interpretation::Skip);

        let done = UpstreamEvent::message("[DONE]");
        assert_eq!(OpenAiAdapter.interpret(&done), Interpretation::Done);

        let broken = UpstreamEvent::message("{\"choices\": [");
        assert!(matches!(
            OpenAiAdapter.interpret(&broken),
            Interpretation::Malformed(_)
        ));

        let failed = UpstreamEvent::message(json!({"error": {"message": "quota"}}).to_string());
        assert_eq!(
            OpenAiAdapter.interpret(&failed),
            Interpretation::Fail("quota".to_string())
        );
    }
}
