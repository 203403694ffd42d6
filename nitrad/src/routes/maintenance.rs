//! Self-maintenance routes: git update checks, updates, restart, and
//! queue administration.

use std::path::Path;
use std::time::Duration;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config;
use crate::error::ApiError;
use crate::state::AppState;

const GIT_PULL_TIMEOUT: Duration = Duration::from_secs(120);
const PIP_INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

struct CommandResult {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn run_command(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> anyhow::Result<CommandResult> {
    let output = tokio::time::timeout(
        timeout,
        Command::new(program).args(args).current_dir(cwd).output(),
    )
    .await
    .map_err(|_| {
        anyhow::anyhow!(
            "{} {} timed out after {}s",
            program,
            args.join(" "),
            timeout.as_secs()
        )
    })??;

    Ok(CommandResult {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn update_check_error(branch: &str, error: String) -> Value {
    json!({
        "updatesAvailable": false,
        "error": error,
        "branch": branch,
    })
}

/// Compare HEAD with the tracked upstream ref and report ahead/behind
/// counts. Git failures are reported in-band at 200 so the frontend can
/// show "no updates" instead of an error toast.
pub async fn check_nitra_updates(
    Extension(state): Extension<AppState>,
) -> Result<Json<Value>, ApiError> {
    let dir = state.config().install_dir.clone();
    let branch = config::current_branch(&dir).unwrap_or_else(|| "main".to_string());

    let upstream_ref = match run_command(
        "git",
        &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"],
        &dir,
        Duration::from_secs(5),
    )
    .await
    {
        Ok(result) if result.success => {
            let upstream = result.stdout.trim().to_string();
            if upstream.is_empty() || upstream == "@{u}" {
                format!("origin/{}", branch)
            } else {
                upstream
            }
        }
        _ => format!("origin/{}", branch),
    };

    // Refresh remote refs; stale data is still usable if this fails.
    match run_command("git", &["fetch", "origin"], &dir, Duration::from_secs(60)).await {
        Ok(result) if !result.success => {
            warn!("git fetch failed during update check: {}", result.stderr.trim());
        }
        Err(err) => warn!("git fetch errored during update check: {:#}", err),
        _ => {}
    }

    let range = format!("HEAD...{}", upstream_ref);
    let rev_list = match run_command(
        "git",
        &["rev-list", "--left-right", "--count", &range],
        &dir,
        Duration::from_secs(10),
    )
    .await
    {
        Ok(result) => result,
        Err(err) => {
            warn!("git rev-list errored during update check: {:#}", err);
            return Ok(Json(update_check_error(&branch, err.to_string())));
        }
    };

    if !rev_list.success {
        let error = {
            let trimmed = rev_list.stderr.trim();
            if trimmed.is_empty() {
                "Unknown git error".to_string()
            } else {
                trimmed.to_string()
            }
        };
        warn!("failed to compare commits for update check: {}", error);
        return Ok(Json(update_check_error(&branch, error)));
    }

    let counts: Vec<u64> = rev_list
        .stdout
        .split_whitespace()
        .filter_map(|part| part.parse().ok())
        .collect();
    if counts.len() < 2 {
        warn!("unexpected git rev-list output while checking updates");
        return Ok(Json(update_check_error(
            &branch,
            "Unexpected git output".to_string(),
        )));
    }

    Ok(Json(json!({
        "updatesAvailable": counts[1] > 0,
        "ahead": counts[0],
        "behind": counts[1],
        "branch": branch,
        "upstream": upstream_ref,
    })))
}

pub async fn update_nitra(Extension(state): Extension<AppState>) -> Result<Response, ApiError> {
    let dir = state.config().install_dir.clone();
    let result = run_command("git", &["pull"], &dir, GIT_PULL_TIMEOUT).await?;

    if !result.success {
        warn!("git pull failed: {}", result.stderr.trim());
        return Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "error": format!("Git pull failed: {}", result.stderr),
            })),
        )
            .into_response());
    }

    info!("self-update pulled successfully");
    Ok(Json(json!({
        "success": true,
        "message": "Nitra updated successfully",
        "output": result.stdout,
    }))
    .into_response())
}

/// Pull ComfyUI itself, then reinstall its requirements when a
/// requirements file is present.
pub async fn update_comfyui(Extension(state): Extension<AppState>) -> Result<Response, ApiError> {
    let comfy_root = state.config().comfy_root.clone();
    let pull = run_command("git", &["pull"], &comfy_root, GIT_PULL_TIMEOUT).await?;
    if !pull.success {
        warn!("ComfyUI git pull failed: {}", pull.stderr.trim());
        return Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "error": format!("Git pull failed: {}", pull.stderr),
            })),
        )
            .into_response());
    }

    let requirements = comfy_root.join("requirements.txt");
    let mut pip_output = String::new();
    if requirements.exists() {
        let python = state.config().python_command();
        let pip = run_command(
            &python.to_string_lossy(),
            &["-m", "pip", "install", "-r", "requirements.txt"],
            &comfy_root,
            PIP_INSTALL_TIMEOUT,
        )
        .await?;
        pip_output = format!("{}{}", pip.stdout, pip.stderr);
        append_setup_log(&state.config().setup_log_path(), &pip_output);
        if !pip.success {
            return Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": "pip install -r requirements.txt failed",
                    "output": pip_output,
                })),
            )
                .into_response());
        }
    }

    Ok(Json(json!({
        "success": true,
        "message": "ComfyUI updated successfully",
        "output": format!("{}{}", pull.stdout, pip_output),
    }))
    .into_response())
}

fn append_setup_log(path: &Path, content: &str) {
    use std::io::Write;
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{}", content));
    if let Err(err) = result {
        warn!("failed to append setup log {}: {}", path.display(), err);
    }
}

/// Schedule a delayed clean exit so the supervisor restarts the daemon,
/// replying before the process goes down.
pub async fn restart(Extension(state): Extension<AppState>) -> Json<Value> {
    info!("restart requested, scheduling exit");
    let state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        state.queue().reset();
        let cancelled = state.tracker().cancel_all().await;
        info!(cancelled, "exiting for restart");
        std::process::exit(0);
    });
    Json(json!({ "success": true, "message": "Restart command accepted" }))
}

pub async fn queue_reset(Extension(state): Extension<AppState>) -> StatusCode {
    state.queue().reset();
    let cancelled = state.tracker().cancel_all().await;
    info!(cancelled, "queue reset");
    StatusCode::OK
}

pub async fn queue_status(Extension(state): Extension<AppState>) -> Json<Value> {
    let snapshot = state.queue().snapshot();
    Json(json!({
        "queue_size": snapshot.queue_size,
        "in_progress_count": snapshot.in_progress_count,
        "is_processing": snapshot.is_processing,
        "running_count": state.tracker().running_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_missing_binary_is_err() {
        let result = run_command(
            "nitra-no-such-binary",
            &["--version"],
            Path::new("."),
            Duration::from_secs(1),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_update_check_failure_reports_in_band() {
        let body = update_check_error("main", "git rev-list timed out after 10s".to_string());
        assert_eq!(body["updatesAvailable"], json!(false));
        assert_eq!(body["error"], json!("git rev-list timed out after 10s"));
        assert_eq!(body["branch"], json!("main"));
    }
}
