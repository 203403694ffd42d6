//! Bearer token helpers. Access tokens are treated as opaque except for
//! the JWT payload segment, which is decoded (without signature
//! verification) to recover the user email when the caller omits it.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde_json::Value;

/// Strip a `Bearer ` prefix from an Authorization header value.
/// Returns `None` when the scheme is missing or the token is empty.
pub fn strip_bearer(header: &str) -> Option<&str> {
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Extract the `email` (or `user_email`) claim from a JWT payload.
pub fn email_from_jwt(token: &str) -> Option<String> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    if parts.next().is_none() {
        return None;
    }

    let decoded = decode_segment(payload)?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;

    claims
        .get("email")
        .or_else(|| claims.get("user_email"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn decode_segment(segment: &str) -> Option<Vec<u8>> {
    let padded = pad_base64(segment);
    URL_SAFE
        .decode(padded.as_bytes())
        .or_else(|_| STANDARD.decode(padded.as_bytes()))
        .ok()
}

fn pad_base64(segment: &str) -> String {
    let mut padded = segment.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    padded
}

/// Redacted preview of a sensitive token for logging.
pub fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return "<none>".to_string();
    }
    if token.len() <= 8 {
        return "***".to_string();
    }
    format!("{}...{}", &token[..4], &token[token.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn make_jwt(claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{}.{}.signature", header, payload)
    }

    #[test]
    fn test_strip_bearer() {
        assert_eq!(strip_bearer("Bearer abc"), Some("abc"));
        assert_eq!(strip_bearer("bearer abc"), Some("abc"));
        assert_eq!(strip_bearer("Bearer "), None);
        assert_eq!(strip_bearer("Basic abc"), None);
    }

    #[test]
    fn test_email_claim() {
        let token = make_jwt(&serde_json::json!({"email": "user@example.com"}));
        assert_eq!(email_from_jwt(&token), Some("user@example.com".to_string()));
    }

    #[test]
    fn test_user_email_fallback_claim() {
        let token = make_jwt(&serde_json::json!({"user_email": "alt@example.com"}));
        assert_eq!(email_from_jwt(&token), Some("alt@example.com".to_string()));
    }

    #[test]
    fn test_payload_needing_padding() {
        // A one-byte claim difference shifts the segment length off a
        // 4-byte boundary; decoding must restore padding.
        let token = make_jwt(&serde_json::json!({"email": "a@b.co", "iat": 1}));
        assert_eq!(email_from_jwt(&token), Some("a@b.co".to_string()));
    }

    #[test]
    fn test_malformed_tokens() {
        assert_eq!(email_from_jwt("not-a-jwt"), None);
        assert_eq!(email_from_jwt("a.b"), None);
        assert_eq!(email_from_jwt("a.!!!.c"), None);
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token(""), "<none>");
        assert_eq!(mask_token("short"), "***");
        assert_eq!(mask_token("abcdefghijkl"), "abcd...ijkl");
    }
}
