use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Per-user install status, polled by the frontend via
/// `GET /nitra/status/update`.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateRecord {
    pub status: UpdateState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl UpdateState {
    fn is_active(self) -> bool {
        matches!(self, UpdateState::Running)
    }
}

#[derive(Debug, Default)]
pub struct StatusRegistry {
    records: Mutex<HashMap<String, UpdateRecord>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, email: &str) -> Option<UpdateRecord> {
        self.records.lock().unwrap().get(email).cloned()
    }

    pub fn mark_running(&self, email: &str, options: Option<Value>) {
        self.insert(
            email,
            UpdateRecord {
                status: UpdateState::Running,
                message: None,
                error: None,
                error_type: None,
                options,
                start_time: Some(Utc::now()),
            },
        );
    }

    pub fn mark_completed(&self, email: &str, message: impl Into<String>) {
        self.insert(
            email,
            UpdateRecord {
                status: UpdateState::Completed,
                message: Some(message.into()),
                error: None,
                error_type: None,
                options: None,
                start_time: None,
            },
        );
    }

    pub fn mark_failed(&self, email: &str, error: impl Into<String>, error_type: Option<&str>) {
        self.insert(
            email,
            UpdateRecord {
                status: UpdateState::Failed,
                message: None,
                error: Some(error.into()),
                error_type: error_type.map(str::to_string),
                options: None,
                start_time: None,
            },
        );
    }

    pub fn mark_cancelled(&self, email: &str) {
        self.insert(
            email,
            UpdateRecord {
                status: UpdateState::Cancelled,
                message: Some("Installation cancelled by user".to_string()),
                error: None,
                error_type: None,
                options: None,
                start_time: None,
            },
        );
    }

    /// Cancel the record for one user, or every active record when no
    /// user is given.
    pub fn cancel(&self, email: Option<&str>) {
        match email {
            Some(email) => {
                let records = self.records.lock().unwrap();
                if records.contains_key(email) {
                    drop(records);
                    self.mark_cancelled(email);
                }
            }
            None => {
                let active: Vec<String> = {
                    let records = self.records.lock().unwrap();
                    records
                        .iter()
                        .filter(|(_, r)| r.status.is_active())
                        .map(|(email, _)| email.clone())
                        .collect()
                };
                for email in active {
                    self.mark_cancelled(&email);
                }
            }
        }
    }

    fn insert(&self, email: &str, record: UpdateRecord) {
        self.records.lock().unwrap().insert(email.to_string(), record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_user_has_no_record() {
        let registry = StatusRegistry::new();
        assert!(registry.get("a@b.co").is_none());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let registry = StatusRegistry::new();
        registry.mark_running("a@b.co", None);
        assert_eq!(registry.get("a@b.co").unwrap().status, UpdateState::Running);

        registry.mark_completed("a@b.co", "done");
        let record = registry.get("a@b.co").unwrap();
        assert_eq!(record.status, UpdateState::Completed);
        assert_eq!(record.message.as_deref(), Some("done"));

        registry.mark_failed("a@b.co", "boom", Some("license"));
        let record = registry.get("a@b.co").unwrap();
        assert_eq!(record.status, UpdateState::Failed);
        assert_eq!(record.error_type.as_deref(), Some("license"));
    }

    #[test]
    fn test_cancel_all_only_touches_active() {
        let registry = StatusRegistry::new();
        registry.mark_running("active@b.co", None);
        registry.mark_completed("done@b.co", "done");

        registry.cancel(None);

        assert_eq!(
            registry.get("active@b.co").unwrap().status,
            UpdateState::Cancelled
        );
        assert_eq!(
            registry.get("done@b.co").unwrap().status,
            UpdateState::Completed
        );
    }

    #[test]
    fn test_cancel_single_user_requires_record() {
        let registry = StatusRegistry::new();
        registry.cancel(Some("ghost@b.co"));
        assert!(registry.get("ghost@b.co").is_none());

        registry.mark_running("a@b.co", None);
        registry.cancel(Some("a@b.co"));
        assert_eq!(
            registry.get("a@b.co").unwrap().status,
            UpdateState::Cancelled
        );
    }
}
