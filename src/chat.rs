use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
    Function,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
            Self::Function => "function",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Inbound chat request as posted by the UI.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default, rename = "conversationID", alias = "conversation_id")]
    pub conversation_id: Option<String>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub temperature: Option<f64>,
}

fn default_user() -> String {
    "anonymous".to_string()
}

impl ChatRequest {
    /// Parse and validate a raw JSON body.
    pub fn from_value(body: Value) -> Result<Self, GatewayError> {
        let req: ChatRequest = serde_json::from_value(body)
            .map_err(|err| GatewayError::Validation(format!("invalid request body: {err}")))?;
        req.validate()?;
        Ok(req)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.model.trim().is_empty() {
            return Err(GatewayError::Validation("model must not be empty".to_string()));
        }
        let Some(last) = self.messages.last() else {
            return Err(GatewayError::Validation(
                "messages must not be empty".to_string(),
            ));
        };
        if last.role != Role::User {
            return Err(GatewayError::Validation(format!(
                "last message must have role `user`, got `{}`",
                last.role.as_str()
            )));
        }
        Ok(())
    }

    pub fn last_user_message(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// Normalized unit of output handed from the relay to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelayChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    /// Upstream `data:` payload as received; forwarded verbatim by passthrough routes.
    #[serde(skip)]
    pub raw: String,
}

impl RelayChunk {
    pub fn answer(text: impl Into<String>) -> Self {
        Self {
            answer: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = raw.into();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conversation_id.is_none()
            && self.message_id.is_none()
            && self.answer.is_none()
            && self.fields.is_empty()
    }
}
