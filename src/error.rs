use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    /// Body of the error envelope, shared by JSON responses and terminal stream events.
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::to_value(ErrorEnvelope {
            error: ErrorBody {
                message: self.message.clone(),
                error_type: self.error_type.clone(),
                param: self.param.clone(),
                code: self.code.clone(),
            },
        })
        .unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = self.envelope();
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures of the streaming pipeline, from request validation to the relay.
///
/// Idle timeouts and caller disconnects are not errors; they end a session
/// through `relay::CloseReason`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),
    #[error("no credential available for model `{model}`")]
    NoCredential { model: String },
    #[error("{0}")]
    InvalidCredential(String),
    #[error("unsupported model `{0}`")]
    UnsupportedModel(String),
    #[error("{message}")]
    Upstream {
        status: Option<StatusCode>,
        message: String,
    },
    /// A frame that was skipped; logged, never sent to the caller.
    #[error("malformed upstream frame: {0}")]
    Parse(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request",
            Self::NoCredential { .. } => "no_credential",
            Self::InvalidCredential(_) => "invalid_credential",
            Self::UnsupportedModel(_) => "unsupported_model",
            Self::Upstream { .. } => "upstream_error",
            Self::Parse(_) => "parse_error",
        }
    }

    /// Provider statuses are kept for logs only; every upstream failure is a 500.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_)
            | Self::NoCredential { .. }
            | Self::InvalidCredential(_)
            | Self::UnsupportedModel(_) => StatusCode::BAD_REQUEST,
            Self::Upstream { .. } | Self::Parse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let app = AppError::new(err.status(), err.code(), err.to_string());
        match err {
            GatewayError::Validation(_) => app.with_param("messages"),
            GatewayError::NoCredential { .. } | GatewayError::InvalidCredential(_) => {
                app.with_param("key")
            }
            GatewayError::UnsupportedModel(_) => app.with_param("model"),
            GatewayError::Upstream { .. } | GatewayError::Parse(_) => {
                app.with_type("upstream_error")
            }
        }
    }
}
