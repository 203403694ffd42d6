use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::status::StatusRegistry;

/// A queued installer job. All three kinds resolve to a remote script
/// executed by the worker; the id is fixed per user and kind so the
/// frontend can detect a duplicate submission.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: String,
    pub kind: &'static str,
    /// Script name without the `.py` suffix.
    pub script: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub access_token: String,
    pub user_email: Option<String>,
    /// Extra scripts fetched into the same temp dir (imports of the
    /// main script).
    pub helper_scripts: Vec<String>,
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("task {0} is already in progress")]
    AlreadyActive(String),
    #[error("task queue is shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSnapshot {
    pub queue_size: usize,
    pub in_progress_count: usize,
    pub is_processing: bool,
}

struct QueuedTask {
    spec: TaskSpec,
    generation: u64,
}

/// Ids currently occupying the queue. Pending ids carry the generation
/// they were enqueued under so a reset can release them without
/// touching an id that was re-enqueued afterwards.
#[derive(Default)]
struct ActiveIds {
    pending: HashMap<String, u64>,
    running: Option<String>,
}

#[derive(Default)]
struct QueueShared {
    active: Mutex<ActiveIds>,
    generation: AtomicU64,
    queue_size: AtomicUsize,
    in_progress: AtomicUsize,
    processing: AtomicBool,
}

/// Single-worker FIFO task queue. One dedicated worker drains the
/// channel, so jobs run strictly in submission order and never
/// concurrently. Reset bumps a generation counter and clears the
/// pending id set; stale channel entries are discarded at dequeue time.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<QueuedTask>,
    shared: Arc<QueueShared>,
}

impl TaskQueue {
    /// Spawn the worker. `runner` executes one task and resolves to a
    /// completion message or an error.
    pub fn start<F, Fut>(status: Arc<StatusRegistry>, runner: F) -> Self
    where
        F: Fn(TaskSpec) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(QueueShared::default());
        tokio::spawn(worker_loop(rx, Arc::clone(&shared), status, runner));
        Self { tx, shared }
    }

    pub fn enqueue(&self, spec: TaskSpec) -> Result<(), EnqueueError> {
        let generation = self.shared.generation.load(Ordering::SeqCst);
        {
            let mut active = self.shared.active.lock().unwrap();
            if active.pending.contains_key(&spec.id)
                || active.running.as_deref() == Some(spec.id.as_str())
            {
                return Err(EnqueueError::AlreadyActive(spec.id));
            }
            active.pending.insert(spec.id.clone(), generation);
        }
        let task = QueuedTask { generation, spec };
        self.shared.queue_size.fetch_add(1, Ordering::SeqCst);
        debug!(task_id = %task.spec.id, kind = task.spec.kind, "task enqueued");
        self.tx.send(task).map_err(|err| {
            let task = err.0;
            self.shared.queue_size.fetch_sub(1, Ordering::SeqCst);
            self.shared.active.lock().unwrap().pending.remove(&task.spec.id);
            EnqueueError::Closed
        })
    }

    /// Invalidate every pending task and release its id immediately, so
    /// a cancelled job can be re-enqueued without waiting for the worker
    /// to drain the stale entries. A task already handed to the worker
    /// is not interrupted here; callers that also want running jobs
    /// stopped terminate them through the process tracker.
    pub fn reset(&self) {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cleared = {
            let mut active = self.shared.active.lock().unwrap();
            let cleared = active.pending.len();
            active.pending.clear();
            cleared
        };
        info!(generation, cleared, "task queue reset");
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queue_size: self.shared.queue_size.load(Ordering::SeqCst),
            in_progress_count: self.shared.in_progress.load(Ordering::SeqCst),
            is_processing: self.shared.processing.load(Ordering::SeqCst),
        }
    }
}

async fn worker_loop<F, Fut>(
    mut rx: mpsc::UnboundedReceiver<QueuedTask>,
    shared: Arc<QueueShared>,
    status: Arc<StatusRegistry>,
    runner: F,
) where
    F: Fn(TaskSpec) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    while let Some(task) = rx.recv().await {
        shared.queue_size.fetch_sub(1, Ordering::SeqCst);

        let current = shared.generation.load(Ordering::SeqCst);
        if task.generation != current {
            debug!(task_id = %task.spec.id, "dropping task from a reset queue");
            {
                // The reset normally cleared this entry already; only
                // remove it if the id was not re-enqueued since.
                let mut active = shared.active.lock().unwrap();
                if active.pending.get(&task.spec.id) == Some(&task.generation) {
                    active.pending.remove(&task.spec.id);
                }
            }
            if let Some(email) = &task.spec.user_email {
                status.mark_cancelled(email);
            }
            continue;
        }

        {
            let mut active = shared.active.lock().unwrap();
            active.pending.remove(&task.spec.id);
            active.running = Some(task.spec.id.clone());
        }
        shared.in_progress.fetch_add(1, Ordering::SeqCst);
        shared.processing.store(true, Ordering::SeqCst);
        info!(task_id = %task.spec.id, kind = task.spec.kind, "task starting");

        let result = runner(task.spec.clone()).await;

        // A reset while the task ran means it was cancelled; its status
        // record was already written by the cancelling caller.
        let cancelled_meanwhile = shared.generation.load(Ordering::SeqCst) != current;
        if let Some(email) = &task.spec.user_email {
            match &result {
                _ if cancelled_meanwhile => {}
                Ok(message) => status.mark_completed(email, message.clone()),
                Err(err) => status.mark_failed(email, err.to_string(), None),
            }
        }
        match result {
            Ok(message) => info!(task_id = %task.spec.id, "task finished: {}", message),
            Err(err) => warn!(task_id = %task.spec.id, "task failed: {:#}", err),
        }

        shared.active.lock().unwrap().running = None;
        shared.in_progress.fetch_sub(1, Ordering::SeqCst);
        shared.processing.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(id: &str) -> TaskSpec {
        TaskSpec {
            id: id.to_string(),
            kind: "script",
            script: "noop".to_string(),
            args: Vec::new(),
            env: Vec::new(),
            access_token: "tok".to_string(),
            user_email: Some(format!("{}@example.com", id)),
            helper_scripts: Vec::new(),
        }
    }

    async fn drain(queue: &TaskQueue) {
        for _ in 0..200 {
            let snapshot = queue.snapshot();
            if snapshot.queue_size == 0 && snapshot.in_progress_count == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue did not drain");
    }

    #[tokio::test]
    async fn test_fifo_order_single_worker() {
        let status = Arc::new(StatusRegistry::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let queue = TaskQueue::start(status, move |task| {
            let seen = Arc::clone(&seen);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                seen.lock().unwrap().push(task.id);
                Ok("done".to_string())
            }
        });

        for id in ["a", "b", "c"] {
            queue.enqueue(spec(id)).expect("enqueue");
        }
        drain(&queue).await;

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_until_finished() {
        let status = Arc::new(StatusRegistry::new());
        let queue = TaskQueue::start(Arc::clone(&status), |_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok("done".to_string())
        });

        queue.enqueue(spec("workflow_u1")).expect("first enqueue");
        assert!(matches!(
            queue.enqueue(spec("workflow_u1")),
            Err(EnqueueError::AlreadyActive(_))
        ));

        drain(&queue).await;
        queue.enqueue(spec("workflow_u1")).expect("re-enqueue after drain");
        drain(&queue).await;
    }

    #[tokio::test]
    async fn test_reset_drops_all_pending() {
        let status = Arc::new(StatusRegistry::new());
        let ran = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&ran);
        let queue = TaskQueue::start(Arc::clone(&status), move |task| {
            let seen = Arc::clone(&seen);
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                seen.lock().unwrap().push(task.id);
                Ok("done".to_string())
            }
        });

        queue.enqueue(spec("a")).expect("enqueue");
        queue.enqueue(spec("b")).expect("enqueue");
        queue.enqueue(spec("c")).expect("enqueue");
        // Let the worker pick up "a", then invalidate the rest.
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.reset();
        drain(&queue).await;

        let ran = ran.lock().unwrap().clone();
        assert!(ran.len() <= 1, "pending tasks survived reset: {:?}", ran);
        // Dropped tasks report cancelled to their users.
        let cancelled = status.get("c@example.com").expect("status for c");
        assert_eq!(
            serde_json::to_value(&cancelled.status).unwrap(),
            serde_json::json!("cancelled")
        );
    }

    #[tokio::test]
    async fn test_reset_releases_pending_ids_immediately() {
        let status = Arc::new(StatusRegistry::new());
        let queue = TaskQueue::start(Arc::clone(&status), |_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok("done".to_string())
        });

        queue.enqueue(spec("blocker")).expect("enqueue blocker");
        // Let the worker pick up "blocker" so the next task stays pending.
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(spec("workflow_u1")).expect("enqueue pending");

        queue.reset();
        // The invalidated id must be free right away, not only after the
        // worker drains the stale channel entry.
        queue
            .enqueue(spec("workflow_u1"))
            .expect("re-enqueue after reset");
        drain(&queue).await;
    }

    #[tokio::test]
    async fn test_failure_marks_user_failed() {
        let status = Arc::new(StatusRegistry::new());
        let queue = TaskQueue::start(Arc::clone(&status), |_| async {
            Err(anyhow::anyhow!("download failed"))
        });

        queue.enqueue(spec("m")).expect("enqueue");
        drain(&queue).await;

        let record = status.get("m@example.com").expect("record");
        assert_eq!(record.error.as_deref(), Some("download failed"));
    }
}
