use crate::config::ProviderConfig;
use crate::error::GatewayError;
use crate::providers::ProviderAdapter;
use crate::relay::deadline_after;
use axum::http::StatusCode;
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

impl From<UpstreamCallError> for GatewayError {
    fn from(err: UpstreamCallError) -> Self {
        let status = match err.kind {
            UpstreamErrorKind::Http => err.status,
            UpstreamErrorKind::Network => None,
        };
        GatewayError::Upstream {
            status,
            message: err.message,
        }
    }
}

/// Opens the provider's streaming endpoint. Resolves once response headers
/// arrive; non-2xx answers are read in full and returned as errors. One
/// `timeout` budget covers the response headers and any error body.
pub async fn open_stream(
    client: &reqwest::Client,
    adapter: &dyn ProviderAdapter,
    provider: &ProviderConfig,
    headers: HeaderMap,
    body: &Value,
    timeout: Duration,
) -> Result<reqwest::Response, UpstreamCallError> {
    let url = adapter.endpoint(provider);
    let req = client
        .post(&url)
        .headers(headers)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .json(body);

    tracing::debug!(
        provider = %provider.id,
        kind = adapter.kind().as_str(),
        url = %url,
        "opening upstream stream"
    );
    let deadline = deadline_after(Instant::now(), timeout);
    let resp = match tokio::time::timeout_at(deadline, req.send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(err)) => {
            return Err(UpstreamCallError::new(
                UpstreamErrorKind::Network,
                None,
                err.to_string(),
            ));
        }
        Err(_) => {
            return Err(UpstreamCallError::new(
                UpstreamErrorKind::Network,
                None,
                format!("upstream did not respond within {} ms", timeout.as_millis()),
            ));
        }
    };
    let status = resp.status();
    if !status.is_success() {
        let text = match tokio::time::timeout_at(deadline, resp.text()).await {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "failed to read upstream error body");
                String::new()
            }
            Err(_) => {
                tracing::warn!(%status, "upstream error body stalled; giving up");
                String::new()
            }
        };
        let code = extract_error_code(&text);
        let detail = extract_error_message(&text).unwrap_or(text);
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {}: {}", status, detail),
        )
        .with_code(code));
    }
    Ok(resp)
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let code = value
        .get("error")
        .and_then(|v| v.get("code").or_else(|| v.get("type")))
        .or_else(|| value.get("code"))?;
    match code {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_error_message(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .or_else(|| value.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
