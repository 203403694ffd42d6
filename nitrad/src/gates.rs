//! Bearer extraction and the subscription / device access gates applied
//! before premium installs.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use serde_json::Value;
use tracing::debug;

use nitra_upstream::token::{email_from_jwt, strip_bearer};

use crate::device;
use crate::error::ApiError;
use crate::state::AppState;

/// Pull the bearer token out of the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(strip_bearer)
        .map(str::to_string)
        .ok_or_else(|| ApiError::unauthorized("Missing or invalid authorization header"))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|value| !value.is_empty())
}

pub fn user_email_header(headers: &HeaderMap) -> Option<String> {
    header_value(headers, "X-User-Email")
}

pub fn user_id_header(headers: &HeaderMap) -> Option<String> {
    header_value(headers, "X-User-Id")
}

/// Resolve the user email from an explicit value or the JWT payload.
pub fn resolve_user_email(token: &str, explicit: Option<String>) -> Result<String, ApiError> {
    if let Some(email) = explicit.filter(|email| !email.is_empty()) {
        return Ok(email);
    }
    email_from_jwt(token).ok_or_else(|| ApiError::unauthorized("Invalid token format"))
}

/// Verify the user holds a paid subscription.
pub async fn verify_subscription(
    state: &AppState,
    token: &str,
    user_id: Option<&str>,
) -> Result<(), ApiError> {
    let user_id = user_id.filter(|id| !id.is_empty()).ok_or_else(|| {
        ApiError::SubscriptionRequired(
            "User ID is required to verify subscription status.".to_string(),
        )
    })?;

    let identity = state.identity(token, None, Some(user_id.to_string()));
    let reply = state
        .upstream()
        .subscription_check(&identity, user_id)
        .await
        .map_err(ApiError::internal)?;

    if !reply.is_success() {
        return Err(ApiError::SubscriptionRequired(
            "Unable to verify subscription status with Nitra servers.".to_string(),
        ));
    }
    let paid = reply
        .body
        .get("has_paid_subscription")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !paid {
        return Err(ApiError::SubscriptionRequired(
            "An active subscription is required to install premium assets.".to_string(),
        ));
    }
    Ok(())
}

/// Verify this machine is registered for the user's account. Requires a
/// stored device token and fingerprint, then matches the stored or
/// freshly computed fingerprint against the account's registered
/// devices.
pub async fn verify_device(
    state: &AppState,
    token: &str,
    user_id: Option<String>,
    user_email: Option<String>,
) -> Result<(), ApiError> {
    let (device_token, stored_fingerprint) = state.device().context();
    if device_token.is_none() {
        return Err(ApiError::DeviceRequired(
            "Register this machine before installing workflows or models.".to_string(),
        ));
    }
    let stored_fingerprint = stored_fingerprint.ok_or_else(|| {
        ApiError::DeviceRequired(
            "Machine fingerprint missing. Restart the Nitra service or re-register this device."
                .to_string(),
        )
    })?;

    let identity = state.identity(token, user_email.clone(), user_id);
    let mut reply = state
        .upstream()
        .device_slots(&identity)
        .await
        .map_err(ApiError::internal)?;

    if reply.status.as_u16() == 401 {
        // The stored user context may be stale; retry with just the
        // bearer token and email before declaring the session expired.
        debug!("device check got 401, retrying with refreshed headers");
        let refreshed = state.identity(token, user_email, None);
        reply = state
            .upstream()
            .device_slots(&refreshed)
            .await
            .map_err(ApiError::internal)?;
        if reply.status.as_u16() == 401 {
            return Err(ApiError::DeviceRequired(
                "Authentication expired. Please sign in again.".to_string(),
            ));
        }
    }
    if reply.status.as_u16() >= 400 {
        return Err(ApiError::DeviceRequired(
            "Unable to verify device registration with Nitra servers.".to_string(),
        ));
    }

    let fresh_fingerprint = device::collect_identity().fingerprint_hash;
    if stored_fingerprint != fresh_fingerprint {
        debug!(
            stored = %&stored_fingerprint[..16.min(stored_fingerprint.len())],
            fresh = %&fresh_fingerprint[..16],
            "stored fingerprint differs from current hardware state"
        );
    }

    let devices = reply
        .body
        .get("devices")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let registered = devices.iter().any(|device| {
        device
            .get("fingerprintHash")
            .and_then(Value::as_str)
            .map(|hash| hash == stored_fingerprint || hash == fresh_fingerprint)
            .unwrap_or(false)
    });
    if !registered {
        return Err(ApiError::DeviceRequired(
            "This machine is not registered. Register it in the Nitra device settings.".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers).unwrap(), "abc123");

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc123"));
        assert!(bearer_token(&headers).is_err());

        headers.remove(AUTHORIZATION);
        assert!(bearer_token(&headers).is_err());
    }

    #[test]
    fn test_resolve_user_email_prefers_explicit() {
        assert_eq!(
            resolve_user_email("not-a-jwt", Some("a@b.co".into())).unwrap(),
            "a@b.co"
        );
        assert!(resolve_user_email("not-a-jwt", None).is_err());
        assert!(resolve_user_email("not-a-jwt", Some(String::new())).is_err());
    }
}
