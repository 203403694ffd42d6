use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

#[cfg(target_family = "unix")]
use nitra_common::process::{process_group_alive, signal_process_group};

const KILL_GRACE: Duration = Duration::from_secs(5);
const KILL_POLL: Duration = Duration::from_millis(100);

/// A spawned subprocess registered for cancellation. Children are
/// started in their own process group so a whole pip/git subtree can
/// be signalled at once.
#[derive(Debug, Clone)]
pub struct TrackedProcess {
    pub pid: u32,
    pub pgid: u32,
    pub kind: &'static str,
    pub started_at: DateTime<Utc>,
}

/// Registry of live task subprocesses, keyed by task id. Entries are
/// added when a child spawns and removed when it is reaped; terminate
/// paths check liveness before signalling so a racing cleanup never
/// signals a recycled pid.
#[derive(Debug, Default)]
pub struct ProcessTracker {
    processes: Mutex<HashMap<String, TrackedProcess>>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_id: &str, pid: u32, kind: &'static str) {
        let entry = TrackedProcess {
            pid,
            pgid: pid,
            kind,
            started_at: Utc::now(),
        };
        debug!(task_id, pid, kind, "tracking subprocess");
        self.processes
            .lock()
            .unwrap()
            .insert(task_id.to_string(), entry);
    }

    pub fn remove(&self, task_id: &str) -> Option<TrackedProcess> {
        self.processes.lock().unwrap().remove(task_id)
    }

    pub fn running_count(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    /// Terminate every tracked process: SIGTERM the group, give it a
    /// grace period, then SIGKILL whatever survived. Returns the number
    /// of processes that were still alive when signalled.
    pub async fn cancel_all(&self) -> usize {
        let entries: Vec<(String, TrackedProcess)> = {
            let mut processes = self.processes.lock().unwrap();
            processes.drain().collect()
        };

        let mut cancelled = 0;
        for (task_id, entry) in entries {
            if terminate_group(&task_id, &entry).await {
                cancelled += 1;
            }
        }
        cancelled
    }

}

#[cfg(target_family = "unix")]
async fn terminate_group(task_id: &str, entry: &TrackedProcess) -> bool {
    use nix::sys::signal::Signal;

    if !process_group_alive(entry.pgid) {
        debug!(task_id, pid = entry.pid, "process already exited");
        return false;
    }

    info!(task_id, pid = entry.pid, kind = entry.kind, "terminating subprocess group");
    if let Err(err) = signal_process_group(entry.pgid, Signal::SIGTERM) {
        warn!(task_id, "SIGTERM failed: {}", err);
    }

    let deadline = tokio::time::Instant::now() + KILL_GRACE;
    while tokio::time::Instant::now() < deadline {
        if !process_group_alive(entry.pgid) {
            return true;
        }
        tokio::time::sleep(KILL_POLL).await;
    }

    warn!(task_id, pid = entry.pid, "grace period expired, sending SIGKILL");
    if let Err(err) = signal_process_group(entry.pgid, Signal::SIGKILL) {
        warn!(task_id, "SIGKILL failed: {}", err);
    }
    true
}

#[cfg(not(target_family = "unix"))]
async fn terminate_group(task_id: &str, entry: &TrackedProcess) -> bool {
    warn!(
        task_id,
        pid = entry.pid,
        "process group termination is not implemented on this platform"
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_remove() {
        let tracker = ProcessTracker::new();
        tracker.register("task-1", 4242, "script");
        assert_eq!(tracker.running_count(), 1);

        let entry = tracker.remove("task-1").expect("entry");
        assert_eq!(entry.pid, 4242);
        assert_eq!(entry.pgid, 4242);
        assert_eq!(tracker.running_count(), 0);
        assert!(tracker.remove("task-1").is_none());
    }

    #[tokio::test]
    async fn test_cancel_all_with_nothing_tracked() {
        let tracker = ProcessTracker::new();
        assert_eq!(tracker.cancel_all().await, 0);
    }

    #[cfg(target_family = "unix")]
    #[tokio::test]
    async fn test_cancel_terminates_live_child_group() {
        let mut command = tokio::process::Command::new("sleep");
        command.arg("30").kill_on_drop(true);
        command.process_group(0);
        let mut child = command.spawn().expect("spawn sleep");
        let pid = child.id().expect("pid");

        let tracker = ProcessTracker::new();
        tracker.register("long-sleep", pid, "script");
        assert_eq!(tracker.cancel_all().await, 1);

        let status = child.wait().await.expect("wait");
        assert!(!status.success());
        assert_eq!(tracker.running_count(), 0);
    }

    #[cfg(target_family = "unix")]
    #[tokio::test]
    async fn test_cancel_reaped_pid_not_counted() {
        // A pid far outside the live range: liveness check must fail
        // before any signal is attempted.
        let tracker = ProcessTracker::new();
        tracker.register("stale", 9_999_999, "script");
        assert_eq!(tracker.cancel_all().await, 0);
        assert_eq!(tracker.running_count(), 0);
    }
}
