use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use nitra_common::statefile;

/// Hardware identity collected from the local machine. Components feed
/// the fingerprint in insertion order; fields that cannot be read are
/// simply absent.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceIdentity {
    pub hostname: String,
    pub machine_name: String,
    pub platform: String,
    pub platform_release: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board_serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_uuid: Option<String>,
    pub fingerprint_hash: String,
    pub fingerprint_components: Vec<String>,
    pub fingerprint_source: String,
    pub collected_at: DateTime<Utc>,
    pub default_label: String,
}

/// Collect identity components and derive the fingerprint:
/// sha256 over `name:value` pairs joined with `||`, falling back to the
/// machine name when no hardware component is readable.
pub fn collect_identity() -> DeviceIdentity {
    let hostname = read_hostname().unwrap_or_default();
    let machine_name = hostname.clone();
    let platform = platform_name().to_string();
    let platform_release = read_os_release().unwrap_or_default();
    let architecture = std::env::consts::ARCH.to_string();

    let mut components: Vec<String> = Vec::new();
    let mut push = |name: &str, value: &Option<String>| {
        if let Some(value) = value {
            components.push(format!("{}:{}", name, value));
        }
    };

    let mac_address = read_mac_address();
    push("mac_address", &mac_address);
    let machine_id = read_trimmed("/etc/machine-id");
    push("machine_id", &machine_id);
    let board_serial = if cfg!(target_os = "linux") {
        read_trimmed("/sys/class/dmi/id/board_serial")
    } else {
        None
    };
    push("board_serial", &board_serial);
    let product_uuid = if cfg!(target_os = "linux") {
        read_trimmed("/sys/class/dmi/id/product_uuid")
    } else {
        None
    };
    push("product_uuid", &product_uuid);

    let fingerprint_source = if components.is_empty() {
        if machine_name.is_empty() {
            "unknown-device".to_string()
        } else {
            machine_name.clone()
        }
    } else {
        components.join("||")
    };
    let fingerprint_hash = hex::encode(Sha256::digest(fingerprint_source.as_bytes()));

    DeviceIdentity {
        default_label: machine_name.clone(),
        hostname,
        machine_name,
        platform,
        platform_release,
        architecture,
        mac_address,
        machine_id,
        board_serial,
        product_uuid,
        fingerprint_hash,
        fingerprint_components: components,
        fingerprint_source,
        collected_at: Utc::now(),
    }
}

fn platform_name() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "Darwin",
        "windows" => "Windows",
        other => other,
    }
}

#[cfg(target_family = "unix")]
fn read_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
}

#[cfg(not(target_family = "unix"))]
fn read_hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok().filter(|n| !n.is_empty())
}

fn read_os_release() -> Option<String> {
    read_trimmed("/proc/sys/kernel/osrelease")
}

fn read_trimmed(path: &str) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// First MAC address of a non-loopback interface.
#[cfg(target_os = "linux")]
fn read_mac_address() -> Option<String> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    names.sort();
    for name in names {
        if let Some(addr) = read_trimmed(&format!("/sys/class/net/{}/address", name)) {
            if addr != "00:00:00:00:00:00" {
                return Some(addr.replace(':', "").to_lowercase());
            }
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_mac_address() -> Option<String> {
    None
}

/// Durable registration record. The device token itself never lives in
/// this file; it sits in a separate owner-only token file referenced by
/// `secure_entry_id`. Older installs stored the token inline, so loads
/// migrate any `device_token` field out and scrub it from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure_entry_id: Option<String>,
    /// Only ever populated when reading a legacy state file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
}

#[derive(Debug)]
pub struct DeviceStore {
    data_dir: PathBuf,
    token_cache: Mutex<Option<String>>,
}

impl DeviceStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            token_cache: Mutex::new(None),
        }
    }

    fn state_path(&self) -> PathBuf {
        self.data_dir.join("device_state.json")
    }

    fn token_path(&self, entry_id: &str) -> PathBuf {
        let sanitized: String = entry_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        self.data_dir.join("tokens").join(sanitized)
    }

    /// Load the device state, migrating legacy inline tokens into the
    /// token store.
    pub fn state(&self) -> io::Result<Option<DeviceState>> {
        let mut state: DeviceState = match statefile::load_json(&self.state_path())? {
            Some(state) => state,
            None => return Ok(None),
        };

        if let Some(token) = state.device_token.take() {
            info!("migrating legacy device token into the token store");
            let entry_id = state
                .secure_entry_id
                .clone()
                .or_else(|| state.device_id.clone())
                .unwrap_or_else(|| "nitra-device".to_string());
            self.store_token(&entry_id, &token)?;
            state.secure_entry_id = Some(entry_id);
            statefile::store_json(&self.state_path(), &state)?;
        }

        Ok(Some(state))
    }

    pub fn write_state(&self, state: &DeviceState) -> io::Result<()> {
        debug_assert!(state.device_token.is_none());
        statefile::store_json(&self.state_path(), state)
    }

    /// Drop the registration record and any stored token.
    pub fn clear(&self) -> io::Result<()> {
        if let Ok(Some(state)) = self.state() {
            if let Some(entry_id) = &state.secure_entry_id {
                let _ = std::fs::remove_file(self.token_path(entry_id));
            }
        }
        *self.token_cache.lock().unwrap() = None;
        match std::fs::remove_file(self.state_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn store_token(&self, entry_id: &str, token: &str) -> io::Result<()> {
        debug!(
            entry_id,
            token = %nitra_upstream::token::mask_token(token),
            "storing device token"
        );
        statefile::write_atomic(&self.token_path(entry_id), token.as_bytes())?;
        *self.token_cache.lock().unwrap() = Some(token.to_string());
        Ok(())
    }

    pub fn token(&self) -> Option<String> {
        if let Some(token) = self.token_cache.lock().unwrap().clone() {
            return Some(token);
        }
        let state = match self.state() {
            Ok(Some(state)) => state,
            Ok(None) => return None,
            Err(err) => {
                warn!("failed to read device state: {}", err);
                return None;
            }
        };
        let entry_id = state.secure_entry_id.or(state.device_id)?;
        let token = read_token_file(&self.token_path(&entry_id))?;
        *self.token_cache.lock().unwrap() = Some(token.clone());
        Some(token)
    }

    /// `(device_token, fingerprint_hash)` attached to upstream calls
    /// and installer subprocess environments.
    pub fn context(&self) -> (Option<String>, Option<String>) {
        let fingerprint = self
            .state()
            .ok()
            .flatten()
            .and_then(|state| state.fingerprint_hash);
        (self.token(), fingerprint)
    }
}

fn read_token_file(path: &Path) -> Option<String> {
    let token = std::fs::read_to_string(path).ok()?;
    let token = token.trim().to_string();
    if token.is_empty() {
        debug!("token file {} is empty", path.display());
        None
    } else {
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = collect_identity();
        let b = collect_identity();
        assert_eq!(a.fingerprint_hash, b.fingerprint_hash);
        assert_eq!(a.fingerprint_hash.len(), 64);
    }

    #[test]
    fn test_fingerprint_source_matches_components() {
        let identity = collect_identity();
        if identity.fingerprint_components.is_empty() {
            assert!(!identity.fingerprint_source.is_empty());
        } else {
            assert_eq!(
                identity.fingerprint_source,
                identity.fingerprint_components.join("||")
            );
        }
        assert_eq!(
            identity.fingerprint_hash,
            hex::encode(Sha256::digest(identity.fingerprint_source.as_bytes()))
        );
    }

    #[test]
    fn test_store_roundtrip_and_clear() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = DeviceStore::new(tmp.path());

        assert!(store.state().expect("load").is_none());
        assert!(store.token().is_none());

        store
            .write_state(&DeviceState {
                device_id: Some("dev-1".into()),
                device_label: Some("workstation".into()),
                secure_entry_id: Some("dev-1".into()),
                ..DeviceState::default()
            })
            .expect("write state");
        store.store_token("dev-1", "secret-token").expect("store token");

        let state = store.state().expect("load").expect("state");
        assert_eq!(state.device_id.as_deref(), Some("dev-1"));
        assert!(state.device_token.is_none());
        assert_eq!(store.token().as_deref(), Some("secret-token"));

        store.clear().expect("clear");
        assert!(store.state().expect("load").is_none());
        assert!(store.token().is_none());
    }

    #[test]
    fn test_legacy_token_is_migrated_out_of_state_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = DeviceStore::new(tmp.path());

        // Simulate an old state file that still carries the token.
        let legacy = serde_json::json!({
            "device_id": "dev-9",
            "fingerprint_hash": "abc",
            "device_token": "legacy-secret"
        });
        statefile::store_json(&store.state_path(), &legacy).expect("seed");

        let state = store.state().expect("load").expect("state");
        assert!(state.device_token.is_none());
        assert_eq!(state.secure_entry_id.as_deref(), Some("dev-9"));
        assert_eq!(store.token().as_deref(), Some("legacy-secret"));

        // The rewritten file must not contain the token anymore.
        let raw = std::fs::read_to_string(store.state_path()).expect("read");
        assert!(!raw.contains("legacy-secret"));
    }
}
