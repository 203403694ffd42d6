//! Client for the Nitra SaaS API. Every call carries whatever identity
//! material is available (access token, user headers, device
//! fingerprint/token); most routes are proxied verbatim, so responses
//! are returned as `(status, json)` pairs rather than typed structs.

pub mod error;
pub mod token;

use std::path::Path;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub use error::UpstreamError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(45);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Identity material attached to upstream requests.
#[derive(Debug, Clone, Default)]
pub struct IdentityHeaders {
    pub access_token: Option<String>,
    pub user_email: Option<String>,
    pub user_id: Option<String>,
    pub device_fingerprint: Option<String>,
    pub device_token: Option<String>,
}

impl IdentityHeaders {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, email: Option<String>, id: Option<String>) -> Self {
        self.user_email = email.filter(|s| !s.is_empty());
        self.user_id = id.filter(|s| !s.is_empty());
        self
    }

    pub fn with_device(mut self, fingerprint: Option<String>, token: Option<String>) -> Self {
        self.device_fingerprint = fingerprint.filter(|s| !s.is_empty());
        self.device_token = token.filter(|s| !s.is_empty());
        self
    }

    fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.access_token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        let optional = [
            ("X-User-Email", &self.user_email),
            ("X-User-Id", &self.user_id),
            ("X-Device-Fingerprint", &self.device_fingerprint),
            ("X-Device-Token", &self.device_token),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.insert(name, value);
                }
            }
        }
        headers
    }
}

/// A raw upstream reply: the status code and whatever JSON (or text
/// wrapped as `{"message": ...}`) the server produced.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub body: Value,
}

impl UpstreamReply {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, UpstreamError> {
        let http = Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .gzip(true)
            .brotli(true)
            .build()?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Base URL for script/config endpoints, exported to child processes.
    pub fn configs_url(&self) -> String {
        format!("{}/api", self.base_url)
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    async fn read_reply(response: reqwest::Response) -> UpstreamReply {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body = match serde_json::from_str::<Value>(&text) {
            Ok(value) => value,
            Err(_) if text.is_empty() => json!({}),
            Err(_) => json!({ "message": text }),
        };
        UpstreamReply { status, body }
    }

    async fn get(&self, path: &str, identity: &IdentityHeaders) -> Result<UpstreamReply, UpstreamError> {
        let response = self
            .http
            .get(self.api_url(path))
            .headers(identity.to_header_map())
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await?;
        Ok(Self::read_reply(response).await)
    }

    async fn post(
        &self,
        path: &str,
        identity: &IdentityHeaders,
        body: &Value,
        timeout: Duration,
    ) -> Result<UpstreamReply, UpstreamError> {
        let response = self
            .http
            .post(self.api_url(path))
            .headers(identity.to_header_map())
            .json(body)
            .timeout(timeout)
            .send()
            .await?;
        Ok(Self::read_reply(response).await)
    }

    /// POST /api/subscription-check with `{"userId": ...}`.
    pub async fn subscription_check(
        &self,
        identity: &IdentityHeaders,
        user_id: &str,
    ) -> Result<UpstreamReply, UpstreamError> {
        self.post(
            "/subscription-check",
            identity,
            &json!({ "userId": user_id }),
            DEFAULT_TIMEOUT,
        )
        .await
    }

    pub async fn workflows(&self, identity: &IdentityHeaders) -> Result<UpstreamReply, UpstreamError> {
        self.get("/workflows", identity).await
    }

    pub async fn workflow_detail(
        &self,
        identity: &IdentityHeaders,
        workflow_id: &str,
    ) -> Result<UpstreamReply, UpstreamError> {
        self.get(&format!("/workflows/{}", workflow_id), identity).await
    }

    pub async fn models(&self, identity: &IdentityHeaders) -> Result<UpstreamReply, UpstreamError> {
        self.get("/models", identity).await
    }

    pub async fn custom_nodes(&self, identity: &IdentityHeaders) -> Result<UpstreamReply, UpstreamError> {
        self.get("/custom-nodes", identity).await
    }

    pub async fn workflows_metadata(
        &self,
        identity: &IdentityHeaders,
    ) -> Result<UpstreamReply, UpstreamError> {
        self.get("/workflows-metadata", identity).await
    }

    pub async fn models_metadata(
        &self,
        identity: &IdentityHeaders,
    ) -> Result<UpstreamReply, UpstreamError> {
        self.get("/models-metadata", identity).await
    }

    /// Deduplicated `installFolder` names discovered from models metadata.
    /// Failures degrade to an empty list; folder discovery is advisory.
    pub async fn install_folder_names(&self, identity: &IdentityHeaders) -> Vec<String> {
        let reply = match self.models_metadata(identity).await {
            Ok(reply) if reply.is_success() => reply,
            Ok(reply) => {
                warn!("models metadata request failed ({})", reply.status);
                return Vec::new();
            }
            Err(err) => {
                warn!("models metadata request error: {}", err);
                return Vec::new();
            }
        };
        extract_install_folders(&reply.body)
    }

    pub async fn device_slots(&self, identity: &IdentityHeaders) -> Result<UpstreamReply, UpstreamError> {
        self.get("/device/slots", identity).await
    }

    pub async fn device_register(
        &self,
        identity: &IdentityHeaders,
        payload: &Value,
    ) -> Result<UpstreamReply, UpstreamError> {
        self.post("/device/register", identity, payload, REGISTER_TIMEOUT).await
    }

    pub async fn telemetry_login(
        &self,
        identity: &IdentityHeaders,
        payload: &Value,
    ) -> Result<UpstreamReply, UpstreamError> {
        self.post("/telemetry/login", identity, payload, DEFAULT_TIMEOUT).await
    }

    pub async fn contact(&self, payload: &Value) -> Result<UpstreamReply, UpstreamError> {
        self.post("/contact", &IdentityHeaders::default(), payload, DEFAULT_TIMEOUT)
            .await
    }

    /// GET /api/scripts/{name}/download and return the presigned URL.
    pub async fn script_download_url(
        &self,
        identity: &IdentityHeaders,
        script_name: &str,
    ) -> Result<String, UpstreamError> {
        let reply = self
            .get(&format!("/scripts/{}/download", script_name), identity)
            .await?;
        if !reply.is_success() {
            return Err(UpstreamError::status(reply.status, reply.body));
        }
        reply
            .body
            .get("downloadUrl")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                UpstreamError::Decode(format!("no download URL for script {}", script_name))
            })
    }

    /// Stream a (presigned) URL to a local file, returning bytes written.
    pub async fn download_to(&self, url: &str, dest: &Path) -> Result<u64, UpstreamError> {
        let mut response = self
            .http
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!("downloaded {} bytes to {}", written, dest.display());
        Ok(written)
    }
}

/// Pull `installFolder` values out of a metadata payload. The endpoint
/// has returned `{"models": [...]}`, `{"items": [...]}`, `{"data":
/// [...]}` and a bare array across versions.
pub fn extract_install_folders(body: &Value) -> Vec<String> {
    let models = if let Some(list) = body.as_array() {
        list.as_slice()
    } else {
        ["models", "items", "data"]
            .iter()
            .find_map(|key| body.get(*key).and_then(Value::as_array))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    };

    let mut seen = std::collections::HashSet::new();
    let mut folders = Vec::new();
    for model in models {
        let Some(folder) = model.get("installFolder").and_then(Value::as_str) else {
            continue;
        };
        let normalized = folder.replace('\\', "/").trim().to_string();
        if normalized.is_empty() {
            continue;
        }
        if seen.insert(normalized.to_lowercase()) {
            folders.push(normalized);
        }
    }
    folders
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_header_assembly() {
        let identity = IdentityHeaders::bearer("tok")
            .with_user(Some("a@b.co".into()), Some("u1".into()))
            .with_device(Some("fp".into()), None);
        let map = identity.to_header_map();
        assert_eq!(map.get(AUTHORIZATION).unwrap(), "Bearer tok");
        assert_eq!(map.get("X-User-Email").unwrap(), "a@b.co");
        assert_eq!(map.get("X-User-Id").unwrap(), "u1");
        assert_eq!(map.get("X-Device-Fingerprint").unwrap(), "fp");
        assert!(map.get("X-Device-Token").is_none());
    }

    #[test]
    fn test_empty_identity_fields_are_omitted() {
        let identity = IdentityHeaders::default().with_user(Some(String::new()), None);
        let map = identity.to_header_map();
        assert!(map.get(AUTHORIZATION).is_none());
        assert!(map.get("X-User-Email").is_none());
    }

    #[test]
    fn test_extract_install_folders_shapes() {
        let wrapped = json!({"models": [
            {"installFolder": "checkpoints"},
            {"installFolder": "Checkpoints"},
            {"installFolder": "video\\models"},
            {"name": "no folder"},
        ]});
        assert_eq!(
            extract_install_folders(&wrapped),
            vec!["checkpoints".to_string(), "video/models".to_string()]
        );

        let bare = json!([{"installFolder": "loras"}]);
        assert_eq!(extract_install_folders(&bare), vec!["loras".to_string()]);

        assert!(extract_install_folders(&json!({"unrelated": true})).is_empty());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = UpstreamClient::new("https://app.example.com///").expect("client");
        assert_eq!(client.base_url(), "https://app.example.com");
        assert_eq!(client.configs_url(), "https://app.example.com/api");
    }
}
