//! Request and Response models for the relay API

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Incoming relay request from the client
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    /// Target URL to request (absolute http/https)
    pub url: String,

    /// HTTP method (GET, POST, PUT, DELETE, PATCH, HEAD, OPTIONS)
    #[serde(default = "default_method")]
    pub method: String,

    /// Custom HTTP headers to forward (sensitive ones are stripped)
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body; must be absent for GET/HEAD
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Normalized upstream response envelope
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    /// HTTP status code from the target
    pub status: u16,

    /// Canonical reason phrase for the status
    pub status_text: String,

    /// Flattened response headers (last value wins for repeats)
    pub headers: HashMap<String, String>,

    /// Parsed JSON when the target declared it, raw text otherwise,
    /// or the truncation placeholder when the body exceeded the cap
    pub data: Value,

    /// Request duration in milliseconds
    pub time: u64,

    /// Body size in bytes (declared size when truncated before download)
    pub size: usize,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: &'static str,

    /// Service version
    pub version: &'static str,
}

impl HealthResponse {
    pub fn new() -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_request_defaults() {
        let req: ProxyRequest = serde_json::from_str(r#"{"url":"https://example.com"}"#).unwrap();
        assert_eq!(req.method, "GET");
        assert!(req.headers.is_empty());
        assert!(req.body.is_none());
    }

    #[test]
    fn test_proxy_response_wire_shape() {
        let resp = ProxyResponse {
            status: 200,
            status_text: "OK".into(),
            headers: HashMap::new(),
            data: serde_json::json!({"ok": true}),
            time: 42,
            size: 11,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["statusText"], "OK");
        assert_eq!(json["size"], 11);
        assert_eq!(json["data"]["ok"], true);
    }
}
