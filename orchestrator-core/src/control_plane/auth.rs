//! Bearer-token extraction and constant-time comparison.
//!
//! Three carriers are accepted for the WebSocket route — an `Authorization`
//! header, a `Sec-WebSocket-Protocol: ralph.bearer.<t>` subprotocol (browser
//! `WebSocket` clients can't set arbitrary headers during the handshake),
//! or an `?access_token=` query parameter — while the plain REST routes only
//! ever look at the header. Token comparison is constant-time throughout, a
//! pattern new to this crate (`sipag-core` never compares secrets) but
//! standard practice for bearer-token checks; `subtle` is the same crate
//! `eshanized-AeroDB`'s `auth::crypto` module reaches for in its own
//! constant-time comparison.

use axum::http::{header, HeaderMap};
use subtle::ConstantTimeEq;

const SUBPROTOCOL_PREFIX: &str = "ralph.bearer.";

/// Extract a bearer token from the `Authorization` header only.
pub fn bearer_from_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Extract a bearer token from a `Sec-WebSocket-Protocol` header value,
/// which may carry a comma-separated list of candidate subprotocols.
pub fn bearer_from_subprotocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.split(',')
                .map(str::trim)
                .find_map(|p| p.strip_prefix(SUBPROTOCOL_PREFIX))
        })
        .map(|s| s.to_string())
}

/// Resolve the token for the `/v1/events` upgrade, trying the header, then
/// the subprotocol, then the query parameter, in that order.
pub fn resolve_websocket_token(headers: &HeaderMap, query_access_token: Option<&str>) -> Option<String> {
    bearer_from_header(headers)
        .or_else(|| bearer_from_subprotocol(headers))
        .or_else(|| query_access_token.map(str::to_string))
}

/// Constant-time token comparison. Length is compared up front in ordinary
/// time — token length is not itself a secret the comparison needs to
/// protect, and `subtle`'s slice `ct_eq` requires equal-length operands.
pub fn tokens_match(expected: &str, provided: &str) -> bool {
    if expected.is_empty() || expected.len() != provided.len() {
        return false;
    }
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(name: header::HeaderName, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn extracts_bearer_from_authorization_header() {
        let headers = headers_with(header::AUTHORIZATION, "Bearer abc123");
        assert_eq!(bearer_from_header(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn extracts_bearer_from_subprotocol_list() {
        let headers = headers_with(header::SEC_WEBSOCKET_PROTOCOL, "json, ralph.bearer.xyz, other");
        assert_eq!(bearer_from_subprotocol(&headers).as_deref(), Some("xyz"));
    }

    #[test]
    fn websocket_token_resolution_prefers_header_then_subprotocol_then_query() {
        let mut headers = HeaderMap::new();
        assert_eq!(resolve_websocket_token(&headers, Some("q")).as_deref(), Some("q"));

        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("ralph.bearer.proto"));
        assert_eq!(resolve_websocket_token(&headers, Some("q")).as_deref(), Some("proto"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer header"));
        assert_eq!(resolve_websocket_token(&headers, Some("q")).as_deref(), Some("header"));
    }

    #[test]
    fn matching_tokens_compare_equal() {
        assert!(tokens_match("secret-token", "secret-token"));
    }

    #[test]
    fn mismatched_length_or_content_never_matches() {
        assert!(!tokens_match("secret-token", "nope"));
        assert!(!tokens_match("secret-token", "secret-tokeX"));
        assert!(!tokens_match("", ""));
    }
}
