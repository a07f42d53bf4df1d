//! Admission gate: cross-cutting checks run before any API handler.
//!
//! Order matters and each check short-circuits the rest: blacklist,
//! rate limit, signature plausibility, bot heuristics, required static
//! headers, client token. Failed checks feed the identity's suspicion
//! score; crossing the threshold blacklists it.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use rand::Rng;
use tracing::{debug, warn};

use crate::{error::ApiError, relay::AppState, store::RateTier};

/// Automation signatures matched against User-Agent and X-Client-Type.
/// A match is a suspicion signal only; it never rejects on its own, so
/// legitimate integrations are not locked out outright.
const BOT_SIGNATURES: &[&str] = &[
    "headlesschrome",
    "phantomjs",
    "selenium",
    "puppeteer",
    "playwright",
    "python-requests",
    "python-urllib",
    "aiohttp",
    "go-http-client",
    "okhttp",
    "java/",
    "libwww-perl",
    "curl/",
    "wget/",
    "scrapy",
    "httpclient",
    "bot",
    "crawler",
    "spider",
];

/// Best-effort client identity from forwarding headers. Not
/// authenticated; used only to bucket rate/suspicion/blacklist state.
pub fn client_identity(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Admission middleware applied to the whole app; paths outside the API
/// prefix pass through untouched.
pub async fn admission(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let path = req.uri().path();
    if !path.starts_with(&state.config.api_prefix) {
        return next.run(req).await;
    }

    // Opportunistic sweep on ~1% of gated requests keeps the maps bounded
    // without a dedicated timer
    if rand::thread_rng().gen_ratio(1, 100) {
        state.store.sweep();
        state.relay_limiter.cleanup();
    }

    let identity = client_identity(req.headers());
    match check_admission(&state, &identity, req.headers(), path) {
        Ok(()) => next.run(req).await,
        Err(err) => err.into_response(),
    }
}

fn check_admission(
    state: &AppState,
    identity: &str,
    headers: &HeaderMap,
    path: &str,
) -> Result<(), ApiError> {
    let config = &state.config;
    let store = &state.store;

    // 1. Blacklist: unconditional rejection, reason never disclosed
    if store.is_blacklisted(identity) {
        return Err(ApiError::forbidden());
    }

    // 2. Tiered rate limit
    let (tier, cap) = select_tier(path, config);
    if !store.record_hit(identity, tier, cap) {
        warn!(identity, path, ?tier, "Rate cap exceeded");
        store.record_suspicion(identity, "rate limit exceeded");
        return Err(ApiError::rate_limited());
    }

    // 3. Advisory signature plausibility. The shared secret lives in
    // client-reachable code, so this authenticates nothing; a malformed
    // attempt is still a hard reject, absence only raises suspicion.
    match check_signature(headers, config.signature_max_skew.as_secs() as i64) {
        SignatureCheck::Plausible => {}
        SignatureCheck::Absent => {
            store.record_suspicion(identity, "missing signature headers");
        }
        SignatureCheck::Malformed => {
            warn!(identity, "Malformed request signature");
            store.record_suspicion(identity, "malformed signature");
            return Err(ApiError::bad_signature());
        }
    }

    // 4. Bot heuristics: suspicion only, never a rejection by itself
    if let Some(signature) = bot_signature(headers) {
        debug!(identity, signature, "Automation signature detected");
        store.record_suspicion(identity, "bot signature");
    }

    // 5. Operator-configured static headers
    for (name, expected) in &config.required_headers {
        let matches = headers
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|v| v == expected)
            .unwrap_or(false);
        if !matches {
            warn!(identity, header = %name, "Required header missing or wrong");
            store.record_suspicion(identity, "missing required header");
            return Err(ApiError::forbidden());
        }
    }

    // 6. Token bootstrap handshake: the first request always fails with
    // 401 but carries a usable token; invalid tokens get a silent
    // replacement the same way
    let token = headers.get("x-client-token").and_then(|v| v.to_str().ok());
    match token {
        Some(token) if store.is_token_valid(token) => Ok(()),
        _ => Err(ApiError::token_required(store.issue_token())),
    }
}

/// Pick the rate tier by path prefix
fn select_tier(path: &str, config: &crate::config::Config) -> (RateTier, u32) {
    if config.upload_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
        (RateTier::Upload, config.rate_limit_upload)
    } else if config
        .high_volume_prefixes
        .iter()
        .any(|p| path.starts_with(p.as_str()))
    {
        (
            RateTier::HighVolume,
            config.rate_limit_default * config.high_volume_multiplier,
        )
    } else {
        (RateTier::Default, config.rate_limit_default)
    }
}

enum SignatureCheck {
    Plausible,
    Absent,
    Malformed,
}

/// Validate the X-Timestamp/X-Nonce/X-Signature trio: timestamp within
/// the allowed skew, signature shaped like a hex digest. A partial trio
/// is malformed.
fn check_signature(headers: &HeaderMap, max_skew: i64) -> SignatureCheck {
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let (timestamp, nonce, signature) = (get("x-timestamp"), get("x-nonce"), get("x-signature"));

    match (timestamp, nonce, signature) {
        (None, None, None) => SignatureCheck::Absent,
        (Some(timestamp), Some(nonce), Some(signature)) => {
            let Ok(timestamp) = timestamp.parse::<i64>() else {
                return SignatureCheck::Malformed;
            };
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            if (now - timestamp).abs() > max_skew {
                return SignatureCheck::Malformed;
            }
            if nonce.is_empty() {
                return SignatureCheck::Malformed;
            }
            let hex_shaped = (32..=128).contains(&signature.len())
                && signature.chars().all(|c| c.is_ascii_hexdigit());
            if hex_shaped {
                SignatureCheck::Plausible
            } else {
                SignatureCheck::Malformed
            }
        }
        _ => SignatureCheck::Malformed,
    }
}

/// Match the declared client type and User-Agent against the automation
/// signature list; returns the matched signature
fn bot_signature(headers: &HeaderMap) -> Option<&'static str> {
    let client_type = headers
        .get("x-client-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_lowercase();
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_lowercase();

    BOT_SIGNATURES
        .iter()
        .find(|sig| client_type.contains(*sig) || user_agent.contains(*sig))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::http::HeaderValue;

    fn headers_of(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                axum::http::HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    fn now_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[test]
    fn test_client_identity_prefers_forwarded_for() {
        let headers = headers_of(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(client_identity(&headers), "203.0.113.7");

        let headers = headers_of(&[("x-real-ip", "198.51.100.2")]);
        assert_eq!(client_identity(&headers), "198.51.100.2");

        assert_eq!(client_identity(&HeaderMap::new()), "unknown");
    }

    #[test]
    fn test_tier_selection() {
        let config = Config::from_env();
        let (tier, cap) = select_tier("/api/upload/image", &config);
        assert_eq!(tier, RateTier::Upload);
        assert_eq!(cap, config.rate_limit_upload);

        let (tier, cap) = select_tier("/api/lookup/dns", &config);
        assert_eq!(tier, RateTier::HighVolume);
        assert_eq!(cap, config.rate_limit_default * config.high_volume_multiplier);

        let (tier, cap) = select_tier("/api/proxy", &config);
        assert_eq!(tier, RateTier::Default);
        assert_eq!(cap, config.rate_limit_default);
    }

    #[test]
    fn test_signature_absent_vs_malformed() {
        assert!(matches!(
            check_signature(&HeaderMap::new(), 300),
            SignatureCheck::Absent
        ));

        // Partial trio is malformed
        let headers = headers_of(&[("x-timestamp", &now_secs().to_string())]);
        assert!(matches!(
            check_signature(&headers, 300),
            SignatureCheck::Malformed
        ));

        let headers = headers_of(&[
            ("x-timestamp", &now_secs().to_string()),
            ("x-nonce", "abc123"),
            ("x-signature", &"a1b2c3d4".repeat(8)),
        ]);
        assert!(matches!(
            check_signature(&headers, 300),
            SignatureCheck::Plausible
        ));
    }

    #[test]
    fn test_signature_skew_and_shape() {
        let stale = (now_secs() - 1000).to_string();
        let headers = headers_of(&[
            ("x-timestamp", &stale),
            ("x-nonce", "abc123"),
            ("x-signature", &"a1b2c3d4".repeat(8)),
        ]);
        assert!(matches!(
            check_signature(&headers, 300),
            SignatureCheck::Malformed
        ));

        // Non-hex signature
        let headers = headers_of(&[
            ("x-timestamp", &now_secs().to_string()),
            ("x-nonce", "abc123"),
            ("x-signature", &"zzzzzzzz".repeat(8)),
        ]);
        assert!(matches!(
            check_signature(&headers, 300),
            SignatureCheck::Malformed
        ));

        // Too short to be a digest
        let headers = headers_of(&[
            ("x-timestamp", &now_secs().to_string()),
            ("x-nonce", "abc123"),
            ("x-signature", "abcd"),
        ]);
        assert!(matches!(
            check_signature(&headers, 300),
            SignatureCheck::Malformed
        ));
    }

    #[test]
    fn test_bot_signature_detection() {
        let headers = headers_of(&[("user-agent", "python-requests/2.31.0")]);
        assert_eq!(bot_signature(&headers), Some("python-requests"));

        let headers = headers_of(&[
            ("user-agent", "Mozilla/5.0 (X11; Linux x86_64) HeadlessChrome/120.0"),
        ]);
        assert_eq!(bot_signature(&headers), Some("headlesschrome"));

        let headers = headers_of(&[("x-client-type", "selenium-webdriver")]);
        assert_eq!(bot_signature(&headers), Some("selenium"));

        let headers = headers_of(&[(
            "user-agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
        )]);
        assert_eq!(bot_signature(&headers), None);
    }
}
