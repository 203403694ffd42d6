//! Local toolchain inspection for `GET /nitra/check-versions`.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::config::Config;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a command and return its stdout (merged with stderr, some tools
/// report versions there) when it exits cleanly.
async fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(program).args(args).output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if text.trim().is_empty() {
        text = String::from_utf8_lossy(&output.stderr).into_owned();
    }
    let text = text.trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Extract the `Version:` line from `pip show` output.
pub fn parse_pip_show_version(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("Version:"))
        .map(|version| version.trim().to_string())
        .filter(|version| !version.is_empty())
}

/// Extract the toolkit release from `nvcc --version` output.
pub fn parse_nvcc_release(output: &str) -> Option<String> {
    let re = Regex::new(r"release (\d+\.\d+)").ok()?;
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn package_entry(version: Option<String>) -> Value {
    json!({
        "installed": version.is_some(),
        "version": version,
    })
}

async fn pip_package_version(config: &Config, package: &str) -> Option<String> {
    let python = config.python_command();
    let output = command_output(
        &python.to_string_lossy(),
        &["-m", "pip", "show", package],
    )
    .await?;
    parse_pip_show_version(&output)
}

/// Locate nvcc: CUDA_PATH, the conventional /usr/local/cuda install,
/// then PATH.
fn nvcc_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(cuda_path) = std::env::var_os("CUDA_PATH") {
        let base = PathBuf::from(cuda_path).join("bin");
        if cfg!(windows) {
            candidates.push(base.join("nvcc.exe"));
        } else {
            candidates.push(base.join("nvcc"));
        }
    }
    if !cfg!(windows) {
        candidates.push(PathBuf::from("/usr/local/cuda/bin/nvcc"));
    }
    candidates.push(PathBuf::from("nvcc"));
    candidates
}

async fn cuda_driver_entry() -> Value {
    for candidate in nvcc_candidates() {
        let path = candidate.to_string_lossy().into_owned();
        if let Some(raw) = command_output(&path, &["--version"]).await {
            if let Some(release) = parse_nvcc_release(&raw) {
                return json!({
                    "version": release,
                    "path": path,
                    "raw": raw,
                });
            }
        }
    }
    json!({ "version": null, "path": null, "raw": null })
}

#[cfg(windows)]
async fn vs_build_tools_entry() -> Value {
    let output = command_output("winget", &["list", "--id", "Microsoft.VisualStudio.2022.BuildTools"]).await;
    match output {
        Some(text) if text.contains("BuildTools") => {
            let version = text
                .lines()
                .find(|line| line.contains("BuildTools"))
                .and_then(|line| line.split_whitespace().last())
                .map(str::to_string);
            json!({ "installed": true, "version": version })
        }
        _ => json!({ "installed": false, "version": null }),
    }
}

#[cfg(not(windows))]
async fn vs_build_tools_entry() -> Value {
    json!({ "installed": false, "version": null })
}

fn os_name() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "Darwin",
        "windows" => "Windows",
        other => other,
    }
}

/// Gather the full version report.
pub async fn collect(config: &Config) -> Value {
    let python = config.python_command();
    let python_version = command_output(&python.to_string_lossy(), &["--version"])
        .await
        .map(|out| out.trim_start_matches("Python").trim().to_string());
    debug!(?python_version, "python probe finished");

    let torch = pip_package_version(config, "torch").await;
    let triton = pip_package_version(config, "triton").await;
    let windows_triton = pip_package_version(config, "triton-windows").await;
    let sageattention = pip_package_version(config, "sageattention").await;
    let onnx = pip_package_version(config, "onnx").await;
    let onnxruntime = pip_package_version(config, "onnxruntime").await;
    let onnxruntime_gpu = pip_package_version(config, "onnxruntime-gpu").await;

    json!({
        "os": os_name(),
        "vs_build_tools": vs_build_tools_entry().await,
        "python": { "version": python_version },
        "torch": package_entry(torch),
        "cudaDriver": cuda_driver_entry().await,
        "triton": package_entry(triton),
        "windows_triton": package_entry(windows_triton),
        "sageattention": package_entry(sageattention),
        "onnx": package_entry(onnx),
        "onnxruntime": package_entry(onnxruntime),
        "onnxruntime_gpu": package_entry(onnxruntime_gpu),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pip_show_version() {
        let output = "Name: torch\nVersion: 2.4.1+cu124\nSummary: Tensors and more\n";
        assert_eq!(
            parse_pip_show_version(output),
            Some("2.4.1+cu124".to_string())
        );
        assert_eq!(parse_pip_show_version("Name: torch\n"), None);
        assert_eq!(parse_pip_show_version("Version:\n"), None);
    }

    #[test]
    fn test_parse_nvcc_release() {
        let output = "nvcc: NVIDIA (R) Cuda compiler driver\n\
                      Cuda compilation tools, release 12.4, V12.4.131\n";
        assert_eq!(parse_nvcc_release(output), Some("12.4".to_string()));
        assert_eq!(parse_nvcc_release("no cuda here"), None);
    }
}
