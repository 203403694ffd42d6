use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

const PRODUCTION_URL: &str = "https://app.nitralabs.ai";
const STAGING_URL: &str = "https://appstaging.nitralabs.ai";
const LOCAL_URL: &str = "http://localhost:3000";

/// Resolved daemon configuration. Built once at startup; shared
/// read-only behind the application state.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    /// Base URL of the Nitra website / API.
    pub base_url: String,
    /// ComfyUI installation root (the directory holding `main.py`).
    pub comfy_root: PathBuf,
    /// Directory holding this daemon's own git checkout, used for
    /// self-update checks.
    pub install_dir: PathBuf,
    /// Per-user data directory shared across ComfyUI installs.
    pub data_dir: PathBuf,
}

impl Config {
    pub fn resolve(
        listen: SocketAddr,
        base_url: Option<String>,
        comfy_root: Option<PathBuf>,
    ) -> Result<Self> {
        let install_dir = std::env::current_dir().context("failed to resolve working directory")?;

        let comfy_root = match comfy_root {
            Some(root) => root,
            None => find_comfy_root(&install_dir)
                .ok_or_else(|| anyhow!("could not locate a ComfyUI root (main.py not found); pass --comfy-root"))?,
        };

        let base_url = base_url
            .or_else(|| std::env::var("NITRA_WEBSITE_URL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| base_url_for_branch(&install_dir));

        let data_dir = common_data_dir()?;

        info!(
            base_url = %base_url,
            comfy_root = %comfy_root.display(),
            data_dir = %data_dir.display(),
            "configuration resolved"
        );

        Ok(Self {
            listen,
            base_url,
            comfy_root,
            install_dir,
            data_dir,
        })
    }

    pub fn models_dir(&self) -> PathBuf {
        self.comfy_root.join("models")
    }

    pub fn custom_nodes_dir(&self) -> PathBuf {
        self.comfy_root.join("custom_nodes")
    }

    pub fn user_config_path(&self) -> PathBuf {
        self.comfy_root
            .join("user")
            .join("default")
            .join("nitra")
            .join("config.toml")
    }

    pub fn extra_model_paths_yaml(&self) -> PathBuf {
        self.comfy_root.join("extra_model_paths.yaml")
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.comfy_root.join("venv")
    }

    /// Python interpreter used for installer subprocesses: the venv
    /// interpreter when one exists, otherwise whatever is on PATH.
    pub fn python_command(&self) -> PathBuf {
        let venv_python = if cfg!(windows) {
            self.venv_dir().join("Scripts").join("python.exe")
        } else {
            self.venv_dir().join("bin").join("python")
        };
        if venv_python.exists() {
            venv_python
        } else if cfg!(windows) {
            PathBuf::from("python")
        } else {
            PathBuf::from("python3")
        }
    }

    pub fn setup_log_path(&self) -> PathBuf {
        self.comfy_root.join("nitra_setup.log")
    }
}

/// Walk up from `start` looking for a directory containing `main.py`,
/// bounded to a few levels so a stray launch directory cannot send the
/// search to the filesystem root.
pub fn find_comfy_root(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    for _ in 0..6 {
        if dir.join("main.py").exists() {
            return Some(dir);
        }
        if !dir.pop() {
            break;
        }
    }
    None
}

/// Pick the website URL from the checked-out git branch: `main` tracks
/// production, `stg` tracks staging, anything else targets a local dev
/// server.
fn base_url_for_branch(install_dir: &Path) -> String {
    match current_branch(install_dir).as_deref() {
        Some("main") => PRODUCTION_URL.to_string(),
        Some("stg") => STAGING_URL.to_string(),
        Some(branch) => {
            if branch != "dev" {
                warn!("unrecognised branch {:?}, targeting local dev server", branch);
            }
            LOCAL_URL.to_string()
        }
        None => {
            warn!("not a git checkout, targeting production");
            PRODUCTION_URL.to_string()
        }
    }
}

pub fn current_branch(dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if branch.is_empty() {
        None
    } else {
        Some(branch)
    }
}

/// Per-user data directory shared by every install on the machine.
fn common_data_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("could not determine home directory"))?;

    let dir = if cfg!(target_os = "macos") {
        home.join("Library").join("Application Support").join("Nitra")
    } else if cfg!(windows) {
        home.join(".nitra")
    } else {
        match std::env::var_os("XDG_DATA_HOME").map(PathBuf::from) {
            Some(xdg) if xdg.is_absolute() => xdg.join("nitra"),
            _ => home.join(".local").join("share").join("nitra"),
        }
    };
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_comfy_root_walks_up() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("ComfyUI");
        let nested = root.join("custom_nodes").join("nitra");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(root.join("main.py"), "").expect("write");

        assert_eq!(find_comfy_root(&nested), Some(root.clone()));
        assert_eq!(find_comfy_root(&root), Some(root));
    }

    #[test]
    fn test_find_comfy_root_missing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert_eq!(find_comfy_root(tmp.path()), None);
    }
}
