use std::sync::Arc;

use nitra_upstream::{IdentityHeaders, UpstreamClient};

use crate::config::Config;
use crate::device::DeviceStore;
use crate::queue::TaskQueue;
use crate::status::StatusRegistry;
use crate::tracker::ProcessTracker;

/// Shared application state handed to every handler via `Extension`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Arc<Config>,
    upstream: Arc<UpstreamClient>,
    queue: TaskQueue,
    tracker: Arc<ProcessTracker>,
    status: Arc<StatusRegistry>,
    device: Arc<DeviceStore>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        upstream: Arc<UpstreamClient>,
        queue: TaskQueue,
        tracker: Arc<ProcessTracker>,
        status: Arc<StatusRegistry>,
        device: Arc<DeviceStore>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                upstream,
                queue,
                tracker,
                status,
                device,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.inner.upstream
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn tracker(&self) -> &ProcessTracker {
        &self.inner.tracker
    }

    pub fn status(&self) -> &StatusRegistry {
        &self.inner.status
    }

    pub fn device(&self) -> &DeviceStore {
        &self.inner.device
    }

    /// Identity headers for an upstream call: bearer token, user
    /// headers, and whatever device context is stored locally.
    pub fn identity(
        &self,
        token: &str,
        user_email: Option<String>,
        user_id: Option<String>,
    ) -> IdentityHeaders {
        let (device_token, fingerprint) = self.device().context();
        IdentityHeaders::bearer(token)
            .with_user(user_email, user_id)
            .with_device(fingerprint, device_token)
    }
}
