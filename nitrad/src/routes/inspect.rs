//! Local inspection routes: toolchain versions, installed models, and
//! installed custom nodes.

use axum::extract::Extension;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use tracing::warn;

use crate::assets;
use crate::error::ApiError;
use crate::gates;
use crate::state::AppState;
use crate::userconfig::UserConfig;
use crate::versions;

pub async fn check_versions(Extension(state): Extension<AppState>) -> Json<Value> {
    Json(versions::collect(state.config()).await)
}

pub async fn check_existing_models(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    gates::bearer_token(&headers)?;

    let mut scan = assets::scan_models(&state.config().models_dir());

    // The configured extra model path participates in the scan too.
    match UserConfig::load(&state.config().user_config_path()) {
        Ok(config) => {
            if let Some(extra) = config.extra_model_paths.first() {
                let extra_scan = assets::scan_models(std::path::Path::new(extra));
                scan.names.extend(extra_scan.names);
                scan.files.extend(extra_scan.files);
            }
        }
        Err(err) => warn!("failed to load user config: {}", err),
    }

    let count = scan.names.len();
    Ok(Json(json!({
        "existingModels": scan.names,
        "existingFiles": scan.files,
        "count": count,
    })))
}

pub async fn check_installed_custom_nodes(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    gates::bearer_token(&headers)?;

    let nodes = assets::installed_custom_nodes(&state.config().custom_nodes_dir());
    let count = nodes.len();
    Ok(Json(json!({
        "installedNodes": nodes,
        "count": count,
    })))
}
