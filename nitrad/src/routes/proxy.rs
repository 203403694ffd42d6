//! Thin proxy routes: validate the bearer token, assemble identity
//! headers, forward upstream, and pass the reply through unchanged.

use std::collections::HashMap;

use axum::extract::{Extension, Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::warn;

use nitra_upstream::UpstreamReply;

use crate::error::ApiError;
use crate::gates;
use crate::state::AppState;

pub(crate) fn passthrough(reply: UpstreamReply) -> Response {
    let status =
        StatusCode::from_u16(reply.status.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply.body)).into_response()
}

fn query_email(query: &HashMap<String, String>) -> Option<String> {
    query.get("userEmail").cloned().filter(|e| !e.is_empty())
}

pub async fn config(Extension(state): Extension<AppState>) -> Json<Value> {
    Json(json!({ "websiteBaseUrl": state.config().base_url }))
}

pub async fn test() -> Json<Value> {
    Json(json!({ "status": "ok", "message": "Nitra API is reachable" }))
}

/// Subscription summary for the frontend dashboard. Upstream failures
/// degrade to a free-tier summary instead of an error so the UI always
/// has something to render.
pub async fn subscription_check(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    let token = gates::bearer_token(&headers)?;
    let body = body.map(|Json(v)| v).unwrap_or_default();
    let user_id = body
        .get("userId")
        .and_then(Value::as_str)
        .or_else(|| body.get("user_id").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();

    let identity = state.identity(&token, gates::user_email_header(&headers), None);
    match state.upstream().subscription_check(&identity, &user_id).await {
        Ok(reply) if reply.is_success() => Ok(Json(subscription_summary(&reply.body))),
        Ok(reply) => {
            warn!("subscription check returned {}", reply.status);
            Ok(Json(free_subscription_summary()))
        }
        Err(err) => {
            warn!("subscription check failed: {}", err);
            Ok(Json(free_subscription_summary()))
        }
    }
}

fn subscription_summary(body: &Value) -> Value {
    let field = |key: &str| body.get(key).cloned().unwrap_or(Value::Null);
    json!({
        "has_paid_subscription": body.get("has_paid_subscription").and_then(Value::as_bool).unwrap_or(false),
        "subscription_type": body.get("subscription_type").and_then(Value::as_str).unwrap_or("none"),
        "status": body.get("status").and_then(Value::as_str).unwrap_or("none"),
        "max_updates": field("max_updates"),
        "updates_used": body.get("updates_used").and_then(Value::as_u64).unwrap_or(0),
        "subscription_id": field("subscription_id"),
        "product_id": field("product_id"),
        "price_id": field("price_id"),
        "start_date": field("start_date"),
        "end_date": field("end_date"),
        "access_until": field("access_until"),
        "next_billing_date": field("next_billing_date"),
        "cancel_at_period_end": body.get("cancel_at_period_end").and_then(Value::as_bool).unwrap_or(false),
        "canceled_at": field("canceled_at"),
        "invoice_paid_date": field("invoice_paid_date"),
        "last_updated": field("last_updated"),
    })
}

fn free_subscription_summary() -> Value {
    json!({
        "has_paid_subscription": false,
        "subscription_type": "free",
        "status": "none",
        "max_updates": null,
        "updates_used": 0,
        "subscription_id": null,
    })
}

macro_rules! simple_proxy {
    ($name:ident, $method:ident) => {
        pub async fn $name(
            Extension(state): Extension<AppState>,
            headers: HeaderMap,
            Query(query): Query<HashMap<String, String>>,
        ) -> Result<Response, ApiError> {
            let token = gates::bearer_token(&headers)?;
            let email = gates::resolve_user_email(&token, query_email(&query))?;
            let identity = state.identity(&token, Some(email), None);
            let reply = state.upstream().$method(&identity).await?;
            Ok(passthrough(reply))
        }
    };
}

simple_proxy!(workflows, workflows);
simple_proxy!(models, models);
simple_proxy!(custom_nodes, custom_nodes);
simple_proxy!(workflows_metadata, workflows_metadata);
simple_proxy!(models_metadata, models_metadata);

pub async fn workflow_detail(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Path(workflow_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let token = gates::bearer_token(&headers)?;
    let email = gates::resolve_user_email(&token, query_email(&query))?;
    let identity = state.identity(&token, Some(email), None);
    let reply = state
        .upstream()
        .workflow_detail(&identity, &workflow_id)
        .await?;
    Ok(passthrough(reply))
}

pub async fn contact(
    Extension(state): Extension<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let required = ["name", "email", "message"];
    let missing = required.iter().any(|key| {
        body.get(*key)
            .and_then(Value::as_str)
            .map(str::is_empty)
            .unwrap_or(true)
    });
    if missing {
        return Err(ApiError::bad_request("Missing required fields"));
    }

    let payload = json!({
        "name": body.get("name"),
        "email": body.get("email"),
        "phone": body.get("phone").and_then(Value::as_str).unwrap_or(""),
        "countryCode": body.get("countryCode").and_then(Value::as_str).unwrap_or(""),
        "message": body.get("message"),
        "subscribeToNewsletter": body.get("subscribeToNewsletter").and_then(Value::as_bool).unwrap_or(false),
    });
    let reply = state.upstream().contact(&payload).await?;
    Ok(passthrough(reply))
}

/// Status polling endpoint; the email comes from the query string or
/// the JWT payload.
pub async fn status_update(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let token = gates::bearer_token(&headers)?;
    let email = gates::resolve_user_email(&token, query_email(&query))?;

    match state.status().get(&email) {
        Some(record) => Ok(Json(serde_json::to_value(record).map_err(ApiError::internal)?)),
        None => Ok(Json(json!({
            "status": "none",
            "message": "No active update found",
        }))),
    }
}

/// Serve ComfyUI-Manager's extension-node-map.json when the sibling
/// custom node is installed; an empty map otherwise.
pub async fn node_mappings(Extension(state): Extension<AppState>) -> Json<Value> {
    let path = state
        .config()
        .custom_nodes_dir()
        .join("ComfyUI-Manager")
        .join("extension-node-map.json");
    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(value) => Json(value),
            Err(err) => {
                warn!("failed to parse {}: {}", path.display(), err);
                Json(json!({}))
            }
        },
        Err(_) => {
            warn!("extension-node-map.json not found at {}", path.display());
            Json(json!({}))
        }
    }
}
