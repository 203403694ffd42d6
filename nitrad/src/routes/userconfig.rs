//! User configuration endpoints. Saving regenerates ComfyUI's
//! `extra_model_paths.yaml` from the first configured path.

use axum::extract::Extension;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::gates;
use crate::state::AppState;
use crate::userconfig::{clean_path, update_yaml, UserConfig};

pub async fn get_config(Extension(state): Extension<AppState>) -> Result<Json<Value>, ApiError> {
    let config = UserConfig::load(&state.config().user_config_path()).map_err(ApiError::internal)?;
    Ok(Json(json!({
        "extra_model_paths": config.extra_model_paths,
        "huggingface_token": config.huggingface_token,
    })))
}

pub async fn save_config(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let paths = match body.get("extra_model_paths") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            let mut cleaned = Vec::new();
            for item in items {
                let Some(raw) = item.as_str() else {
                    return Err(ApiError::bad_request("All extra_model_paths must be strings"));
                };
                let path = clean_path(raw);
                if !path.is_empty() {
                    cleaned.push(path);
                }
            }
            cleaned
        }
        Some(_) => return Err(ApiError::bad_request("extra_model_paths must be a list")),
    };

    let huggingface_token = body
        .get("huggingface_token")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    let config = UserConfig {
        extra_model_paths: paths,
        huggingface_token,
    };
    config
        .save(&state.config().user_config_path())
        .map_err(ApiError::internal)?;
    info!(
        paths = config.extra_model_paths.len(),
        "user config saved"
    );

    // Folder names from the user's model catalog feed the dynamic
    // section of the YAML. Missing auth just means no dynamic entries.
    let detected = match gates::bearer_token(&headers) {
        Ok(token) => {
            let identity = state.identity(
                &token,
                gates::user_email_header(&headers),
                gates::user_id_header(&headers),
            );
            state.upstream().install_folder_names(&identity).await
        }
        Err(_) => Vec::new(),
    };

    let base_path = config
        .extra_model_paths
        .first()
        .map(String::as_str)
        .unwrap_or("");
    if let Err(err) = update_yaml(
        &state.config().extra_model_paths_yaml(),
        base_path,
        &detected,
    ) {
        warn!("failed to update extra_model_paths.yaml: {}", err);
    }

    Ok(Json(json!({ "success": true })))
}
