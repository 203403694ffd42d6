//! Install and execution routes: the endpoints that enqueue installer
//! scripts, cancel them, and run the synchronous package installer.

use std::process::Stdio;

use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::gates;
use crate::queue::{EnqueueError, TaskSpec};
use crate::scripts;
use crate::state::AppState;

/// Environment handed to installer subprocesses.
fn task_env(
    state: &AppState,
    token: &str,
    user_id: &str,
    user_email: &str,
    options: &Value,
) -> Vec<(String, String)> {
    let config = state.config();
    let mut env = vec![
        ("NITRA_USER_ID".to_string(), user_id.to_string()),
        ("NITRA_USER_EMAIL".to_string(), user_email.to_string()),
        ("NITRA_ACCESS_TOKEN".to_string(), token.to_string()),
        ("NITRA_UPDATE_OPTIONS".to_string(), options.to_string()),
        ("NITRA_CONFIGS_URL".to_string(), state.upstream().configs_url()),
        ("NITRA_WEBSITE_URL".to_string(), state.upstream().base_url().to_string()),
        (
            "COMFY_DIR".to_string(),
            config.comfy_root.to_string_lossy().into_owned(),
        ),
        (
            "VENV_DIR".to_string(),
            config.venv_dir().to_string_lossy().into_owned(),
        ),
    ];
    let (device_token, fingerprint) = state.device().context();
    if let Some(device_token) = device_token {
        env.push(("NITRA_DEVICE_TOKEN".to_string(), device_token));
    }
    if let Some(fingerprint) = fingerprint {
        env.push(("NITRA_DEVICE_FINGERPRINT".to_string(), fingerprint));
    }
    env
}

fn enqueue_reply(state: &AppState, spec: TaskSpec, started: Value) -> Response {
    match state.queue().enqueue(spec) {
        Ok(()) => (StatusCode::OK, Json(started)).into_response(),
        Err(EnqueueError::AlreadyActive(id)) => (
            StatusCode::CONFLICT,
            Json(json!({
                "status": "already_in_progress",
                "message": format!("Task {} is already queued or running", id),
            })),
        )
            .into_response(),
        Err(EnqueueError::Closed) => {
            ApiError::internal(anyhow::anyhow!("task queue is shut down")).into_response()
        }
    }
}

fn string_field(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

pub async fn install_workflow(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let token = gates::bearer_token(&headers)?;

    let workflow_ids = body
        .get("workflow_ids")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if workflow_ids.is_empty() {
        return Err(ApiError::bad_request("Workflow IDs required"));
    }
    let user_id = string_field(&body, "user_id")
        .ok_or_else(|| ApiError::bad_request("User information required"))?;
    let user_email = string_field(&body, "user_email")
        .ok_or_else(|| ApiError::bad_request("User information required"))?;

    gates::verify_device(&state, &token, Some(user_id.clone()), Some(user_email.clone())).await?;

    let hf_token = string_field(&body, "hf_token").unwrap_or_default();
    let options = json!({
        "workflow_ids": workflow_ids.clone(),
        "install_workflows": true,
        "install_models": true,
        "install_custom_nodes": true,
        "hf_token": hf_token.clone(),
    });

    let mut args = vec![Value::Array(workflow_ids.clone()).to_string()];
    if !hf_token.is_empty() {
        args.push(hf_token);
    }

    let spec = TaskSpec {
        id: format!("workflow_{}", user_id),
        kind: "workflow",
        script: "workflow_downloader".to_string(),
        args,
        env: task_env(&state, &token, &user_id, &user_email, &options),
        access_token: token,
        user_email: Some(user_email.clone()),
        // workflow_downloader imports the model download helper.
        helper_scripts: vec!["model_downloads".to_string()],
    };

    state.status().mark_running(&user_email, Some(options));
    let started = json!({
        "status": "started",
        "message": format!("Workflow installation started for {} workflows", workflow_ids.len()),
        "workflow_ids": workflow_ids,
    });
    Ok(enqueue_reply(&state, spec, started))
}

pub async fn install_models(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let token = gates::bearer_token(&headers)?;

    let model_ids = body
        .get("model_ids")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if model_ids.is_empty() {
        return Err(ApiError::bad_request("Model IDs required"));
    }
    let user_id = string_field(&body, "user_id")
        .ok_or_else(|| ApiError::bad_request("User information required"))?;
    let user_email = string_field(&body, "user_email")
        .ok_or_else(|| ApiError::bad_request("User information required"))?;

    gates::verify_device(&state, &token, Some(user_id.clone()), Some(user_email.clone())).await?;

    let hf_token = string_field(&body, "hf_token").unwrap_or_default();
    let options = json!({
        "model_ids": model_ids.clone(),
        "install_models": true,
        "install_custom_nodes": false,
        "hf_token": hf_token.clone(),
    });

    let mut args = vec![Value::Array(model_ids.clone()).to_string()];
    if !hf_token.is_empty() {
        args.push(hf_token);
    }

    let spec = TaskSpec {
        id: format!("models_{}", user_id),
        kind: "model",
        script: "model_downloads".to_string(),
        args,
        env: task_env(&state, &token, &user_id, &user_email, &options),
        access_token: token,
        user_email: Some(user_email.clone()),
        helper_scripts: Vec::new(),
    };

    state.status().mark_running(&user_email, Some(options));
    let started = json!({
        "status": "started",
        "message": format!("Model installation started for {} models", model_ids.len()),
        "model_ids": model_ids,
    });
    Ok(enqueue_reply(&state, spec, started))
}

/// Map execution options to a script name and its arguments.
fn select_script(options: &Value, fallback: &str) -> Result<(String, Vec<String>), ApiError> {
    let truthy = |key: &str| options.get(key).and_then(Value::as_bool).unwrap_or(false);

    if truthy("install_torch") {
        let torch_version = string_field(options, "torch_version");
        let cuda_version = string_field(options, "cuda_version");
        match (torch_version, cuda_version) {
            (Some(torch), Some(cuda)) => {
                return Ok(("torch_updater".to_string(), vec![torch, cuda]))
            }
            _ => {
                return Err(ApiError::bad_request(
                    "Missing torch_version or cuda_version for torch installation",
                ))
            }
        }
    }
    if truthy("install_windows_triton") {
        return Ok(("windows_triton".to_string(), Vec::new()));
    }
    if truthy("install_sageattention") {
        return Ok(("sageattention".to_string(), Vec::new()));
    }
    if truthy("install_onnx") {
        return Ok(("onnx_installer".to_string(), Vec::new()));
    }
    if let Some(model_ids) = options.get("model_ids").and_then(Value::as_array) {
        if !model_ids.is_empty() {
            return Ok((
                "model_downloads".to_string(),
                vec![Value::Array(model_ids.clone()).to_string()],
            ));
        }
    }
    if options.get("workflow_ids").is_some() {
        // The downloader receives the full options payload, even with
        // an empty id list.
        return Ok(("workflow_downloader".to_string(), vec![options.to_string()]));
    }

    let name = fallback.trim_end_matches(".py");
    let name = if name.is_empty() { "windows_triton" } else { name };
    Ok((name.to_string(), Vec::new()))
}

pub async fn execute_script(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let token = gates::bearer_token(&headers)?;

    let user_id = string_field(&body, "user_id");
    let user_email = string_field(&body, "user_email");
    let options = body.get("options").cloned().unwrap_or_else(|| json!({}));
    let fallback = string_field(&body, "script_filename")
        .unwrap_or_else(|| "windows_triton.py".to_string());

    let user_id = user_id.ok_or_else(|| {
        ApiError::bad_request("User ID is required to execute installer scripts.")
    })?;

    gates::verify_subscription(&state, &token, Some(&user_id)).await?;
    gates::verify_device(&state, &token, Some(user_id.clone()), user_email.clone()).await?;

    let Some(user_email) = user_email else {
        // The gates passed but we cannot record progress without an
        // email; treat it like the license pre-check failure.
        return Ok(Json(json!({
            "status": "failed",
            "message": "License validation failed",
            "error": "You do not have a valid license. Please purchase a license to receive updates.",
        }))
        .into_response());
    };

    let (script, mut args) = select_script(&options, &fallback)?;
    if let Some(hf_token) = string_field(&options, "hf_token") {
        args.push(hf_token);
    }
    debug!(script = %script, user = %user_email, "script execution requested");

    let helper_scripts = if script == "workflow_downloader" {
        vec!["model_downloads".to_string()]
    } else {
        Vec::new()
    };

    let task_id = format!("script_{}_{}", script, chrono::Utc::now().timestamp());
    let spec = TaskSpec {
        id: task_id.clone(),
        kind: "script",
        script: script.clone(),
        args,
        env: task_env(&state, &token, &user_id, &user_email, &options),
        access_token: token,
        user_email: Some(user_email.clone()),
        helper_scripts,
    };

    state.status().mark_running(&user_email, Some(options));
    let started = json!({
        "status": "started",
        "message": format!("{} execution started", script),
        "task_id": task_id,
    });
    Ok(enqueue_reply(&state, spec, started))
}

/// Cancel everything: invalidate pending queue entries, terminate
/// tracked subprocesses, and mark the affected status records.
pub async fn execute_cancel(
    Extension(state): Extension<AppState>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    let body = body.map(|Json(v)| v).unwrap_or_default();
    let user_email = string_field(&body, "user_email");

    let cleared_queue = state.queue().snapshot().queue_size;
    state.queue().reset();
    let cancelled = state.tracker().cancel_all().await;
    state.status().cancel(user_email.as_deref());

    info!(cancelled, cleared_queue, "execution cancelled");
    Ok(Json(json!({
        "success": true,
        "message": format!("Cancelled {} running process(es)", cancelled),
        "cancelled_count": cancelled,
        "cleared_queue": cleared_queue,
    })))
}

/// Synchronous package install. The installer streams human-readable
/// progress on stdout and emits its result document as the last JSON
/// line on stderr.
pub async fn install_package(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let token = gates::bearer_token(&headers)?;

    let category = string_field(&body, "category")
        .ok_or_else(|| ApiError::bad_request("Missing category in request body"))?;
    let config = body.get("config").cloned().unwrap_or_else(|| json!({}));
    let user_id = string_field(&body, "user_id")
        .ok_or_else(|| ApiError::bad_request("Missing user_id in request body"))?;
    let user_email = string_field(&body, "user_email")
        .ok_or_else(|| ApiError::bad_request("Missing user_email in request body"))?;

    gates::verify_device(&state, &token, Some(user_id.clone()), Some(user_email.clone())).await?;
    debug!(category = %category, user = %user_id, "package install requested");

    let tmp = tempfile::Builder::new()
        .prefix("nitra_package_")
        .tempdir()
        .map_err(ApiError::internal)?;
    let identity = nitra_upstream::IdentityHeaders::bearer(&token);
    let installer = scripts::fetch_script(state.upstream(), &identity, "package_installer", tmp.path())
        .await
        .map_err(ApiError::internal)?;

    let mut env = task_env(&state, &token, &user_id, &user_email, &json!({}));
    env.push(("NITRA_REQUIRE_SUBSCRIPTION".to_string(), "false".to_string()));

    let mut command = tokio::process::Command::new(state.config().python_command());
    command
        .arg(&installer)
        .arg(&category)
        .arg(config.to_string())
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env("PYTHONUNBUFFERED", "1")
        .env("PYTHONPATH", tmp.path())
        .current_dir(&state.config().comfy_root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(ApiError::internal)?;
    let pid = child
        .id()
        .ok_or_else(|| ApiError::internal(anyhow::anyhow!("installer exited before tracking")))?;
    let task_id = format!("package_install_{}_{}", user_id, uuid::Uuid::new_v4());
    state.tracker().register(&task_id, pid, "package");

    // Stream stdout to the log, collect stderr for the result document.
    let stdout_task = child.stdout.take().map(|out| {
        let task = task_id.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncBufReadExt;
            let mut lines = tokio::io::BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(task = %task, "{}", line);
            }
        })
    });
    let mut stderr_output = String::new();
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_string(&mut stderr_output).await;
    }

    let wait_result = child.wait().await;
    state.tracker().remove(&task_id);
    if let Some(handle) = stdout_task {
        let _ = handle.await;
    }
    drop(tmp);
    let _ = wait_result.map_err(ApiError::internal)?;

    let result = last_json_line(&stderr_output);
    let Some(result) = result else {
        warn!(task = %task_id, "no JSON result found in installer output");
        return Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "failed",
                "message": "No result from installer",
            })),
        )
            .into_response());
    };

    if result.get("success").and_then(Value::as_bool).unwrap_or(false) {
        Ok(Json(json!({
            "status": "success",
            "message": result.get("message").and_then(Value::as_str).unwrap_or("Installation completed"),
            "details": result,
        }))
        .into_response())
    } else {
        Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "failed",
                "message": result.get("error").and_then(Value::as_str).unwrap_or("Installation failed"),
                "details": result,
            })),
        )
            .into_response())
    }
}

/// Last line of output that parses as a JSON object.
fn last_json_line(output: &str) -> Option<Value> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_json_line_picks_final_document() {
        let output = "pip progress...\n{\"step\": 1}\nnoise\n{\"success\": true, \"message\": \"ok\"}\n";
        let result = last_json_line(output).expect("json");
        assert_eq!(result.get("success"), Some(&json!(true)));
    }

    #[test]
    fn test_last_json_line_ignores_invalid() {
        assert!(last_json_line("{not json\nplain text").is_none());
        assert!(last_json_line("").is_none());
    }

    #[test]
    fn test_select_script_precedence() {
        let options = json!({
            "install_torch": true,
            "torch_version": "2.4.1",
            "cuda_version": "12.4",
            "install_onnx": true,
        });
        let (script, args) = select_script(&options, "windows_triton.py").unwrap();
        assert_eq!(script, "torch_updater");
        assert_eq!(args, vec!["2.4.1", "12.4"]);

        assert!(select_script(&json!({"install_torch": true}), "x").is_err());

        let (script, args) = select_script(&json!({"model_ids": ["m1", "m2"]}), "x").unwrap();
        assert_eq!(script, "model_downloads");
        assert_eq!(args, vec!["[\"m1\",\"m2\"]"]);

        let (script, _) = select_script(&json!({"workflow_ids": []}), "x").unwrap();
        assert_eq!(script, "workflow_downloader");

        let (script, args) = select_script(&json!({}), "sageattention.py").unwrap();
        assert_eq!(script, "sageattention");
        assert!(args.is_empty());
    }
}
