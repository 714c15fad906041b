use crate::app::AppState;
use crate::chat::{ChatRequest, RelayChunk};
use crate::config::{GatewayConfig, ModelEntry, ProviderConfig, ProviderKind};
use crate::credentials;
use crate::error::{AppError, AppResult, GatewayError};
use crate::providers::{ProviderAdapter, adapter_for};
use crate::relay::{DownstreamFormat, Relay};
use crate::sse::{UpstreamEvent, sse_events};
use crate::upstream;
use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use std::sync::Arc;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn list_models(State(state): State<AppState>) -> AppResult<Response> {
    let config = state.config.snapshot().await;
    let data: Vec<Value> = config
        .models
        .iter()
        .map(|model| {
            json!({
                "id": model.id,
                "object": "model",
                "owned_by": model.provider,
                "provider_kind": config.provider(&model.provider).map(|p| p.kind.as_str()),
            })
        })
        .collect();

    Ok(Json(json!({ "object": "list", "data": data })).into_response())
}

/// `POST /v1/chat`: provider from the model catalog, NDJSON batches.
pub async fn chat_ndjson(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    relay_chat(state, &headers, &body, None, DownstreamFormat::NdJson).await
}

/// `POST /v1/chat/{provider}`: provider pinned by the path, SSE framing.
pub async fn chat_provider_sse(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    relay_chat(
        state,
        &headers,
        &body,
        Some(provider.as_str()),
        DownstreamFormat::EventStream,
    )
    .await
}

/// `POST /v1/proxy`: forwards upstream `data:` payloads untouched.
pub async fn proxy_passthrough(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    relay_chat(state, &headers, &body, None, DownstreamFormat::Passthrough).await
}

pub async fn admin_reload(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    let Some(expected) = state.runtime.admin_token.as_deref() else {
        return Err(AppError::new(StatusCode::NOT_FOUND, "not_found", "not found"));
    };
    if extract_bearer(&headers) != Some(expected) {
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid admin token",
        ));
    }
    if state.runtime.config_path.is_none() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "config_path_unset",
            "CHATRELAY_CONFIG is not set; nothing to reload",
        ));
    }

    let config = state.runtime.load_gateway_config()?;
    let providers = config.providers.len();
    let models = config.models.len();
    let previous = state.config.replace(config).await;
    tracing::info!(
        providers,
        models,
        previous_models = previous.models.len(),
        "gateway config reloaded"
    );

    Ok(Json(json!({ "reloaded": true, "providers": providers, "models": models })).into_response())
}

async fn relay_chat(
    state: AppState,
    headers: &HeaderMap,
    body: &[u8],
    provider_tag: Option<&str>,
    format: DownstreamFormat,
) -> AppResult<Response> {
    let request_id = extract_request_id(headers);
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| GatewayError::Validation(format!("invalid request body: {err}")))?;
    let req = ChatRequest::from_value(value)?;

    let config = state.config.snapshot().await;
    let (adapter, provider, model) = select_route(&config, &req.model, provider_tag)?;
    let credential = credentials::resolve(&config, provider, model, req.key.as_deref())?;
    let auth = adapter.auth_headers(&credential)?;
    let payload = adapter.build_payload(&req, model.upstream_model());

    let resp = upstream::open_stream(
        &state.http,
        adapter,
        provider,
        auth,
        &payload,
        state.runtime.upstream_timeout(),
    )
    .await
    .map_err(|err| {
        metrics::counter!("chatrelay_upstream_errors_total", "stage" => "connect").increment(1);
        tracing::warn!(
            request_id = request_id.as_deref().unwrap_or(""),
            provider = %provider.id,
            model = %model.id,
            status = ?err.status,
            code = err.code.as_deref().unwrap_or(""),
            error = %err.message,
            "upstream call failed before streaming"
        );
        GatewayError::from(err)
    })?;

    let policy = config.relay.unwrap_or(state.runtime.relay);
    let mut relay = Relay::new(adapter, format, policy);
    if format == DownstreamFormat::Passthrough {
        relay = relay.with_extractor(Arc::new(passthrough_chunk));
    }
    let (stream, _session) = relay.spawn(sse_events(resp.bytes_stream()));
    tracing::info!(
        session_id = %stream.session_id(),
        request_id = request_id.as_deref().unwrap_or(""),
        model = %model.id,
        provider = %provider.id,
        credential_source = credential.source().as_str(),
        "relay session opened"
    );

    let mut response = Response::new(Body::from_stream(stream));
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if format != DownstreamFormat::NdJson {
        response_headers.insert(
            header::HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        );
    }
    Ok(response)
}

/// Maps a model id (and optional path tag) to its adapter and catalog entries.
/// Unknown models and mismatched tags are rejected, never guessed.
fn select_route<'a>(
    config: &'a GatewayConfig,
    model_id: &str,
    provider_tag: Option<&str>,
) -> Result<(&'static dyn ProviderAdapter, &'a ProviderConfig, &'a ModelEntry), GatewayError> {
    let Some(model) = config.model(model_id) else {
        tracing::warn!(model = model_id, "model not in catalog; refusing to route");
        return Err(GatewayError::UnsupportedModel(model_id.to_string()));
    };
    let Some(provider) = config.provider(&model.provider) else {
        tracing::warn!(model = model_id, provider = %model.provider, "catalog provider missing");
        return Err(GatewayError::UnsupportedModel(model_id.to_string()));
    };
    if let Some(tag) = provider_tag {
        match ProviderKind::from_tag(tag) {
            Some(kind) if kind == provider.kind => {}
            Some(kind) => {
                tracing::warn!(
                    model = model_id,
                    requested = kind.as_str(),
                    configured = provider.kind.as_str(),
                    "provider tag does not match catalog"
                );
                return Err(GatewayError::UnsupportedModel(format!(
                    "{model_id} via {}",
                    kind.as_str()
                )));
            }
            None => {
                tracing::warn!(model = model_id, tag, "unknown provider tag");
                return Err(GatewayError::UnsupportedModel(format!("{model_id} via {tag}")));
            }
        }
    }
    Ok((adapter_for(provider.kind), provider, model))
}

fn passthrough_chunk(event: &UpstreamEvent) -> Option<RelayChunk> {
    Some(RelayChunk::default().with_raw(event.data.clone()))
}

fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::select_route;
    use crate::config::{GatewayConfig, ProviderKind};
    use crate::error::GatewayError;

    fn catalog() -> GatewayConfig {
        GatewayConfig::from_json_str(
            r#"{
                "providers": [{"id": "dify-main", "kind": "dify"}],
                "models": [{"id": "assistant-1", "provider": "dify-main"}]
            }"#,
            |_| None,
        )
        .unwrap()
    }

    #[test]
    fn routes_by_catalog_and_checks_path_tag() {
        let config = catalog();
        let (adapter, provider, model) = select_route(&config, "assistant-1", None).unwrap();
        assert_eq!(adapter.kind(), ProviderKind::Dify);
        assert_eq!(provider.id, "dify-main");
        assert_eq!(model.id, "assistant-1");

        assert!(select_route(&config, "assistant-1", Some("Dify")).is_ok());
        assert!(matches!(
            select_route(&config, "assistant-1", Some("openai")),
            Err(GatewayError::UnsupportedModel(_))
        ));
        assert!(matches!(
            select_route(&config, "assistant-1", Some("difyish")),
            Err(GatewayError::UnsupportedModel(_))
        ));
    }

    #[test]
    fn unknown_models_fail_closed() {
        let config = catalog();
        assert!(matches!(
            select_route(&config, "gpt-4o", None),
            Err(GatewayError::UnsupportedModel(_))
        ));
    }
}
