//! The safe proxy relay: validates a caller-specified target, chases
//! redirects through the safety predicate, forwards the sanitized
//! request, and normalizes the upstream response.

use std::{collections::HashMap, sync::Arc, time::Duration, time::Instant};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use reqwest::{
    header::{LOCATION, USER_AGENT},
    redirect, Client, Method,
};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    config::Config,
    error::{classify_fetch_error, ApiError},
    gate::client_identity,
    models::{HealthResponse, ProxyRequest, ProxyResponse},
    safety::{sanitize_url_for_logging, validate_target},
    store::{GateStore, MemoryStore, RelayLimiter},
};

/// Methods the relay will forward
const ALLOWED_METHODS: &[Method] = &[
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::HEAD,
    Method::OPTIONS,
];

/// Caller headers that are never forwarded
const STRIPPED_HEADERS: &[&str] = &[
    "host",
    "origin",
    "referer",
    "cookie",
    "authorization",
    "content-length",
    "transfer-encoding",
];

/// Stands in for a body that exceeded the response cap
const TRUNCATED_PLACEHOLDER: &str = "[response body exceeds size limit]";

const DEFAULT_USER_AGENT: &str = concat!("relaygate/", env!("CARGO_PKG_VERSION"));

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn GateStore>,
    pub relay_limiter: Arc<RelayLimiter>,
    semaphore: Arc<Semaphore>,
    /// Forwarding client: follows redirects, 15s deadline
    fetch_client: Client,
    /// Probe client: manual redirects, short deadline
    probe_client: Client,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let fetch_client = Client::builder()
            .redirect(redirect::Policy::limited(config.max_redirects))
            .timeout(Duration::from_secs(config.fetch_timeout))
            .build()?;
        let probe_client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(Duration::from_secs(config.probe_timeout))
            .build()?;
        let store = Arc::new(MemoryStore::from_config(&config));
        let relay_limiter = Arc::new(RelayLimiter::new(
            config.relay_rate_limit,
            Duration::from_secs(60),
        ));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Ok(Self {
            config: Arc::new(config),
            store,
            relay_limiter,
            semaphore,
            fetch_client,
            probe_client,
        })
    }
}

/// GET /health - Health check endpoint
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::new())
}

/// POST /api/proxy - Forward a request to a vetted third-party origin
pub async fn relay_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ProxyRequest>, JsonRejection>,
) -> Result<Json<ProxyResponse>, ApiError> {
    // The relay is higher-risk than ordinary API routes, so it keeps its
    // own per-identity cap on top of the gate's tiering
    let identity = client_identity(&headers);
    if !state.relay_limiter.check(&identity) {
        warn!(identity = %identity, "Relay rate cap exceeded");
        return Err(ApiError::rate_limited());
    }

    // Extractor rejections must come back in the JSON error envelope too
    let Json(req) = payload.map_err(reject_payload)?;

    let _permit = state
        .semaphore
        .acquire()
        .await
        .map_err(|_| ApiError::unknown("Service unavailable"))?;

    let method = parse_method(&req.method)?;
    check_body_rules(&method, &req, state.config.max_request_body_size)?;

    let safe_url = sanitize_url_for_logging(&req.url);
    debug!(url = %safe_url, method = %method, "Processing relay request");

    let validated = validate_target(&req.url, &state.config).await?;
    let target = resolve_redirects(&state, validated).await?;

    let mut builder = state.fetch_client.request(method.clone(), target.clone());
    let mut has_user_agent = false;
    for (name, value) in sanitize_headers(&req.headers) {
        if name.eq_ignore_ascii_case(USER_AGENT.as_str()) {
            has_user_agent = true;
        }
        builder = builder.header(name, value);
    }
    if !has_user_agent {
        builder = builder.header(USER_AGENT, DEFAULT_USER_AGENT);
    }
    builder = builder.header("X-Forwarded-By", "relaygate");
    if !matches!(method, Method::GET | Method::HEAD) {
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }
    }

    let start = Instant::now();
    let response = builder.send().await.map_err(|e| {
        error!(url = %safe_url, error = %e, "Relay fetch failed");
        classify_fetch_error(&e)
    })?;
    let envelope = normalize_response(response, start, state.config.max_response_body_size).await?;

    info!(
        url = %safe_url,
        status = envelope.status,
        elapsed_ms = envelope.time,
        size = envelope.size,
        "Relay request completed"
    );
    Ok(Json(envelope))
}

/// Map body-extraction failures (bad JSON, over-limit body) into the
/// standard error envelope instead of axum's plain-text rejection
fn reject_payload(rejection: JsonRejection) -> ApiError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::payload_too_large("Request body too large")
    } else {
        ApiError::invalid_request(format!("Invalid request body: {}", rejection.body_text()))
    }
}

fn parse_method(raw: &str) -> Result<Method, ApiError> {
    let method = Method::from_bytes(raw.to_uppercase().as_bytes())
        .map_err(|_| ApiError::invalid_request(format!("Invalid HTTP method: {raw}")))?;
    if !ALLOWED_METHODS.contains(&method) {
        return Err(ApiError::invalid_request(format!(
            "Method {method} is not allowed"
        )));
    }
    Ok(method)
}

fn check_body_rules(method: &Method, req: &ProxyRequest, max_size: usize) -> Result<(), ApiError> {
    let Some(body) = &req.body else {
        return Ok(());
    };
    if matches!(*method, Method::GET | Method::HEAD) && !body.is_empty() {
        return Err(ApiError::invalid_request(
            "Request body is not allowed for GET/HEAD",
        ));
    }
    if body.len() > max_size {
        return Err(ApiError::payload_too_large(format!(
            "Request body too large: {} bytes (max: {} bytes)",
            body.len(),
            max_size
        )));
    }
    Ok(())
}

/// Drop headers the caller must not control
fn sanitize_headers(headers: &HashMap<String, String>) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            !STRIPPED_HEADERS
                .iter()
                .any(|stripped| name.eq_ignore_ascii_case(stripped))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Chase the target's redirect chain with manual HEAD probes, re-running
/// the safety predicate on every hop. Bounded loop; a probe failure or
/// an unsafe hop rejects the whole request (fail closed). A non-3xx
/// probe response means the target is final and safe to fetch.
async fn resolve_redirects(state: &AppState, url: Url) -> Result<Url, ApiError> {
    let mut current = url;
    for _ in 0..=state.config.max_redirects {
        let response = state
            .probe_client
            .head(current.clone())
            .send()
            .await
            .map_err(|e| {
                warn!(url = %sanitize_url_for_logging(current.as_str()), error = %e, "Redirect probe failed");
                ApiError::unsafe_url()
            })?;
        if !response.status().is_redirection() {
            return Ok(current);
        }
        let Some(location) = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
        else {
            return Ok(current);
        };
        let next = current
            .join(location)
            .map_err(|_| ApiError::unsafe_url())?;
        debug!(from = %sanitize_url_for_logging(current.as_str()), to = %sanitize_url_for_logging(next.as_str()), "Following redirect");
        current = validate_target(next.as_str(), &state.config).await?;
    }
    warn!("Redirect chain exceeded maximum depth");
    Err(ApiError::unsafe_url())
}

/// Flatten the upstream response into the envelope, capping the body.
/// A declared Content-Length over the cap short-circuits before any
/// body bytes are pulled.
async fn normalize_response(
    response: reqwest::Response,
    start: Instant,
    max_size: usize,
) -> Result<ProxyResponse, ApiError> {
    let status = response.status();
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        headers.insert(
            name.to_string(),
            value.to_str().unwrap_or_default().to_string(),
        );
    }
    let content_type = headers.get("content-type").cloned();

    if let Some(declared) = response.content_length() {
        if declared as usize > max_size {
            return Ok(ProxyResponse {
                status: status.as_u16(),
                status_text: status_text(status),
                headers,
                data: Value::String(TRUNCATED_PLACEHOLDER.to_string()),
                time: start.elapsed().as_millis() as u64,
                size: declared as usize,
            });
        }
    }

    let (bytes, truncated) = read_body_capped(response, max_size).await?;
    let size = bytes.len();
    let data = if truncated {
        Value::String(TRUNCATED_PLACEHOLDER.to_string())
    } else {
        parse_body(content_type.as_deref(), &bytes)
    };

    Ok(ProxyResponse {
        status: status.as_u16(),
        status_text: status_text(status),
        headers,
        data,
        time: start.elapsed().as_millis() as u64,
        size,
    })
}

fn status_text(status: reqwest::StatusCode) -> String {
    status.canonical_reason().unwrap_or_default().to_string()
}

/// Stream body chunks, stopping as soon as the cap is crossed
async fn read_body_capped(
    mut response: reqwest::Response,
    max_size: usize,
) -> Result<(Vec<u8>, bool), ApiError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| {
        error!(error = %e, "Failed to read upstream body");
        classify_fetch_error(&e)
    })? {
        if bytes.len() + chunk.len() > max_size {
            bytes.extend_from_slice(&chunk[..max_size - bytes.len()]);
            return Ok((bytes, true));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok((bytes, false))
}

/// Parse as JSON when the target said so, fall back to text either way
fn parse_body(content_type: Option<&str>, bytes: &[u8]) -> Value {
    let is_json = content_type
        .map(|ct| ct.to_lowercase().contains("json"))
        .unwrap_or(false);
    if is_json {
        if let Ok(value) = serde_json::from_slice(bytes) {
            return value;
        }
    }
    Value::String(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_method_allow_list() {
        assert_eq!(parse_method("get").unwrap(), Method::GET);
        assert_eq!(parse_method("POST").unwrap(), Method::POST);
        assert_eq!(parse_method("options").unwrap(), Method::OPTIONS);

        let err = parse_method("TRACE").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(parse_method("CONNECT").is_err());
        assert!(parse_method("not a method").is_err());
    }

    #[test]
    fn test_body_rules() {
        let mut req: ProxyRequest =
            serde_json::from_str(r#"{"url":"https://example.com","body":"x"}"#).unwrap();
        let err = check_body_rules(&Method::GET, &req, 1024).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        assert!(check_body_rules(&Method::POST, &req, 1024).is_ok());

        req.body = Some("x".repeat(2048));
        let err = check_body_rules(&Method::POST, &req, 1024).unwrap_err();
        assert_eq!(err.status, StatusCode::PAYLOAD_TOO_LARGE);

        req.body = None;
        assert!(check_body_rules(&Method::GET, &req, 1024).is_ok());
    }

    #[test]
    fn test_sensitive_headers_stripped() {
        let mut headers = HashMap::new();
        headers.insert("Cookie".to_string(), "session=abc".to_string());
        headers.insert("authorization".to_string(), "Bearer x".to_string());
        headers.insert("Host".to_string(), "internal".to_string());
        headers.insert("Origin".to_string(), "https://evil.example".to_string());
        headers.insert("Referer".to_string(), "https://evil.example".to_string());
        headers.insert("Accept".to_string(), "application/json".to_string());
        headers.insert("X-Custom".to_string(), "kept".to_string());

        let sanitized = sanitize_headers(&headers);
        let names: Vec<&str> = sanitized.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(sanitized.len(), 2);
        assert!(names.contains(&"Accept"));
        assert!(names.contains(&"X-Custom"));
    }

    #[test]
    fn test_parse_body_json_and_text() {
        let json = parse_body(Some("application/json; charset=utf-8"), br#"{"a":1}"#);
        assert_eq!(json["a"], 1);

        // Declared JSON that fails to parse falls back to text
        let fallback = parse_body(Some("application/json"), b"not json");
        assert_eq!(fallback, Value::String("not json".to_string()));

        let text = parse_body(Some("text/html"), b"<p>hi</p>");
        assert_eq!(text, Value::String("<p>hi</p>".to_string()));

        let untyped = parse_body(None, b"plain");
        assert_eq!(untyped, Value::String("plain".to_string()));
    }
}
