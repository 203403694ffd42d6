//! Device registration and identity routes.

use axum::extract::Extension;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::device::{collect_identity, DeviceState};
use crate::error::ApiError;
use crate::gates;
use crate::routes::proxy::passthrough;
use crate::state::AppState;

pub async fn identity(Extension(state): Extension<AppState>) -> Result<Json<Value>, ApiError> {
    let identity = collect_identity();
    let mut body = serde_json::to_value(&identity).map_err(ApiError::internal)?;

    let stored = state.device().state().map_err(ApiError::internal)?;
    body["has_stored_token"] = json!(state.device().token().is_some());
    body["stored_device"] = match stored {
        Some(stored) => json!({
            "device_id": stored.device_id,
            "device_label": stored.device_label,
            "registered_at": stored.registered_at,
            "fingerprint_hash": stored.fingerprint_hash,
        }),
        None => Value::Null,
    };
    Ok(Json(body))
}

pub async fn registrations(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = gates::bearer_token(&headers)?;
    let identity = state.identity(
        &token,
        gates::user_email_header(&headers),
        gates::user_id_header(&headers),
    );
    let reply = state.upstream().device_slots(&identity).await?;
    Ok(passthrough(reply))
}

/// Local registration state next to the upstream device slots, for
/// support troubleshooting.
pub async fn debug_status(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let token = gates::bearer_token(&headers)?;
    let user_email = gates::user_email_header(&headers);
    let user_id = gates::user_id_header(&headers);

    let stored = state.device().state().map_err(ApiError::internal)?.unwrap_or_default();
    let fresh = collect_identity();
    let (device_token, _) = state.device().context();

    let identity = state.identity(&token, user_email.clone(), user_id.clone());
    let upstream = match state.upstream().device_slots(&identity).await {
        Ok(reply) => json!({
            "status": reply.status.as_u16(),
            "body": reply.body,
        }),
        Err(err) => json!({
            "status": "error",
            "error": err.to_string(),
        }),
    };

    Ok(Json(json!({
        "local_state": {
            "has_device_token": device_token.is_some(),
            "stored_fingerprint": stored.fingerprint_hash,
            "identity_fingerprint": fresh.fingerprint_hash,
            "device_label": stored.device_label,
            "device_id": stored.device_id,
            "user_id": user_id,
            "user_email": user_email,
        },
        "upstream": upstream,
    })))
}

/// Register (or replace) this machine upstream and persist the returned
/// token and state. The device token is stripped from the response
/// before it reaches the frontend.
pub async fn register(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Response, ApiError> {
    let token = gates::bearer_token(&headers)?;
    let user_email = gates::user_email_header(&headers);
    let payload = body.map(|Json(v)| v).unwrap_or_default();

    let identity = collect_identity();
    let stored = state.device().state().map_err(ApiError::internal)?.unwrap_or_default();

    let device_label = payload
        .get("device_label")
        .and_then(Value::as_str)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| identity.machine_name.clone());

    let mut upstream_payload = json!({
        "mode": payload.get("mode").and_then(Value::as_str).unwrap_or("manual"),
        "deviceLabel": device_label,
        "replaceDeviceId": payload.get("replace_device_id"),
        "clientTimestamp": payload.get("client_timestamp"),
        "source": payload.get("source").and_then(Value::as_str).unwrap_or("comfyui-nitra"),
        "identity": serde_json::to_value(&identity).map_err(ApiError::internal)?,
    });
    if let Some(existing) = state.device().token() {
        upstream_payload["existingDeviceToken"] = json!(existing);
    }
    if let Some(device_id) = &stored.device_id {
        upstream_payload["storedDeviceId"] = json!(device_id);
    }
    if let Some(fingerprint) = &stored.fingerprint_hash {
        upstream_payload["storedFingerprintHash"] = json!(fingerprint);
    }

    let request_identity = state
        .identity(&token, user_email, None)
        .with_device(Some(identity.fingerprint_hash.clone()), None);
    let mut reply = state
        .upstream()
        .device_register(&request_identity, &upstream_payload)
        .await?;

    // Never forward the raw token to the browser.
    let device_token = reply
        .body
        .as_object_mut()
        .and_then(|obj| obj.remove("deviceToken"))
        .and_then(|value| value.as_str().map(str::to_string));

    if reply.is_success() {
        let device_id = reply
            .body
            .get("deviceId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let unregistered =
            reply.body.get("status").and_then(Value::as_str) == Some("device-unregistered");
        if let (Some(device_token), Some(device_id)) = (device_token, device_id) {
            let entry_id = device_id.clone();
            state
                .device()
                .store_token(&entry_id, &device_token)
                .map_err(ApiError::internal)?;
            let registered_at = reply
                .body
                .get("registeredAt")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Utc::now().to_rfc3339());
            let label = reply
                .body
                .get("deviceLabel")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    upstream_payload
                        .get("deviceLabel")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
            state
                .device()
                .write_state(&DeviceState {
                    device_id: Some(device_id.clone()),
                    device_label: label,
                    registered_at: Some(registered_at),
                    fingerprint_hash: Some(identity.fingerprint_hash.clone()),
                    machine_name: Some(identity.machine_name.clone()),
                    secure_entry_id: Some(entry_id),
                    device_token: None,
                })
                .map_err(ApiError::internal)?;
            info!(device_id = %device_id, "device registered");
        } else if unregistered {
            info!("device unregistered, clearing local state");
            state.device().clear().map_err(ApiError::internal)?;
        } else {
            warn!("registration reply carried no usable token and device id; not persisting");
        }
    }

    Ok(passthrough(reply))
}

pub async fn telemetry_login(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Response, ApiError> {
    let token = gates::bearer_token(&headers)?;
    let user_email = gates::user_email_header(&headers);
    let body = body.map(|Json(v)| v).unwrap_or_default();

    let identity = collect_identity();
    let stored = state.device().state().map_err(ApiError::internal)?;
    let device_state = stored.as_ref().map(|stored| {
        json!({
            "deviceId": stored.device_id,
            "deviceLabel": stored.device_label,
            "fingerprintHash": stored.fingerprint_hash,
        })
    });

    let payload = json!({
        "identity": serde_json::to_value(&identity).map_err(ApiError::internal)?,
        "deviceState": device_state,
        "clientTimestamp": body.get("client_timestamp"),
        "source": body.get("source").and_then(Value::as_str).unwrap_or("comfyui-nitra"),
        "context": body.get("context").cloned().unwrap_or_else(|| json!({})),
    });

    let request_identity = state
        .identity(&token, user_email, None)
        .with_device(Some(identity.fingerprint_hash.clone()), None);
    let reply = state
        .upstream()
        .telemetry_login(&request_identity, &payload)
        .await?;
    Ok(passthrough(reply))
}
