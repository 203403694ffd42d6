use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use nitra_upstream::{IdentityHeaders, UpstreamClient};

use crate::config::Config;
use crate::queue::TaskSpec;
use crate::tracker::ProcessTracker;

/// Everything the queue worker needs to execute a task.
#[derive(Clone)]
pub struct ScriptContext {
    pub config: Arc<Config>,
    pub upstream: Arc<UpstreamClient>,
    pub tracker: Arc<ProcessTracker>,
}

/// Fetch a task's scripts into a fresh temp dir, run the main script
/// with the host Python, and stream its output into the log. The temp
/// dir is removed on every exit path, including cancellation, because
/// it is owned by this frame.
pub async fn run_task(ctx: ScriptContext, spec: TaskSpec) -> Result<String> {
    let tmp = tempfile::Builder::new()
        .prefix(&format!("nitra_script_{}_", spec.script))
        .tempdir()
        .context("failed to create script temp dir")?;

    let identity = IdentityHeaders::bearer(&spec.access_token);
    let script_path = fetch_script(&ctx.upstream, &identity, &spec.script, tmp.path()).await?;
    for helper in &spec.helper_scripts {
        fetch_script(&ctx.upstream, &identity, helper, tmp.path()).await?;
    }

    let mut command = Command::new(ctx.config.python_command());
    command
        .arg(&script_path)
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env("PYTHONUNBUFFERED", "1")
        .env("PYTHONPATH", tmp.path())
        .current_dir(&ctx.config.comfy_root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", spec.script))?;
    let pid = child
        .id()
        .ok_or_else(|| anyhow!("child for {} exited before it could be tracked", spec.id))?;
    ctx.tracker.register(&spec.id, pid, spec.kind);

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_reader = stdout.map(|out| spawn_line_reader(spec.id.clone(), out, false));
    let err_reader = stderr.map(|err| spawn_line_reader(spec.id.clone(), err, true));

    let status = child.wait().await;
    ctx.tracker.remove(&spec.id);

    if let Some(handle) = out_reader {
        let _ = handle.await;
    }
    if let Some(handle) = err_reader {
        let _ = handle.await;
    }

    let status = status.with_context(|| format!("failed waiting for {}", spec.script))?;
    if status.success() {
        Ok("Installation completed successfully".to_string())
    } else {
        Err(anyhow!(
            "script {} exited with {}",
            spec.script,
            status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string())
        ))
    }
}

/// Resolve the presigned URL for a named script and stream it into the
/// temp dir, marking it executable.
pub(crate) async fn fetch_script(
    upstream: &UpstreamClient,
    identity: &IdentityHeaders,
    name: &str,
    dir: &Path,
) -> Result<std::path::PathBuf> {
    // Script names originate from request bodies.
    nitra_common::paths::validate_relative_fragment(name)
        .with_context(|| format!("invalid script name {:?}", name))?;
    let url = upstream
        .script_download_url(identity, name)
        .await
        .with_context(|| format!("failed to resolve download URL for {}", name))?;

    let dest = dir.join(format!("{}.py", name));
    let written = upstream
        .download_to(&url, &dest)
        .await
        .with_context(|| format!("failed to download {}", name))?;
    debug!(script = name, bytes = written, "script downloaded");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(&dest, perms)
            .with_context(|| format!("failed to mark {} executable", dest.display()))?;
    }

    Ok(dest)
}

fn spawn_line_reader<R>(
    task_id: String,
    stream: R,
    is_stderr: bool,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                warn!(task = %task_id, "{}", line);
            } else {
                info!(task = %task_id, "{}", line);
            }
        }
    })
}
