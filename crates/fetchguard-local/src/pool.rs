//! C6 — Transform Worker Pool: N long-lived OS threads converting HTML to
//! Markdown off the async event loop, with bounded queueing, per-task
//! timeout and cancellation, and respawn on crash.
//!
//! Grounded on the worker-pool architecture in `radicle-node/src/worker.rs`
//! (a shared `crossbeam_channel::Receiver` pulled by a fixed set of OS
//! threads) re-pointed at HTML→Markdown conversion via `html2text` instead
//! of git fetches. Per-task panics are caught in place (see `run_task`) so a
//! bad document fails only its own task; a supervisor thread additionally
//! respawns a worker if its thread nonetheless exits, covering the
//! worker-crash-mid-transform case for a process-based pool.
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use fetchguard_core::{ErrorKind, FetchError, Stage, TransformResult};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const WATCHDOG_POLL: Duration = Duration::from_millis(200);

pub struct TransformTask {
    id: u64,
    html: String,
    url: String,
    include_metadata: bool,
    reply: oneshot::Sender<Result<TransformResult, FetchError>>,
}

pub struct PoolConfig {
    pub workers: usize,
    pub queue_max: usize,
    pub task_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism().map(|n| n.get().saturating_sub(1)).unwrap_or(2).clamp(2, 16);
        Self { workers, queue_max: workers * 2, task_timeout: Duration::from_secs(30) }
    }
}

/// Per-worker-slot state shared with that slot's supervisor, so a timed-out
/// task can be traced back to the thread running it.
struct WorkerSlot {
    current_task: AtomicU64,
    abandon: AtomicBool,
}

impl WorkerSlot {
    fn new() -> Self {
        Self { current_task: AtomicU64::new(0), abandon: AtomicBool::new(false) }
    }
}

pub struct TransformPool {
    sender: Sender<TransformTask>,
    next_id: AtomicU64,
    closed: AtomicBool,
    task_timeout: Duration,
    slots: Vec<Arc<WorkerSlot>>,
}

impl TransformPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let (sender, receiver) = crossbeam_channel::bounded(config.queue_max.max(1));
        let slots: Vec<Arc<WorkerSlot>> = (0..config.workers).map(|_| Arc::new(WorkerSlot::new())).collect();
        for (worker_id, slot) in slots.iter().enumerate() {
            spawn_supervised_worker(worker_id, receiver.clone(), slot.clone());
        }
        Arc::new(Self {
            sender,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            task_timeout: config.task_timeout,
            slots,
        })
    }

    /// Submits one HTML→Markdown task. Rejects synchronously if the queue is
    /// full or the pool is closed. Races the worker's reply against the
    /// per-task timeout and the caller's cancellation token.
    pub async fn transform(
        &self,
        html: String,
        url: String,
        include_metadata: bool,
        cancel: &CancellationToken,
    ) -> Result<TransformResult, FetchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FetchError::new(ErrorKind::InternalError, "transform pool is closed").with_stage(Stage::TransformDispatch).with_url(&url));
        }
        if cancel.is_cancelled() {
            return Err(FetchError::aborted().with_stage(Stage::TransformDispatch).with_url(&url));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let task = TransformTask { id, html, url: url.clone(), include_metadata, reply: tx };

        match self.sender.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(FetchError::new(ErrorKind::ServerBusy, "transform queue is full").with_stage(Stage::TransformDispatch).with_url(&url));
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(FetchError::new(ErrorKind::InternalError, "transform pool is closed").with_stage(Stage::TransformDispatch).with_url(&url));
            }
        }

        tokio::select! {
            result = rx => result.unwrap_or_else(|_| {
                Err(FetchError::new(ErrorKind::InternalError, "worker dropped the task without a reply")
                    .with_stage(Stage::TransformDispatch)
                    .with_url(&url))
            }),
            _ = tokio::time::sleep(self.task_timeout) => {
                tracing::warn!(task_id = id, url, "transform task timed out");
                self.cancel_task_best_effort(id);
                Err(FetchError::timeout(Stage::TransformWorkerTimeout).with_url(&url).with_status(504))
            }
            _ = cancel.cancelled() => {
                self.cancel_task_best_effort(id);
                Err(FetchError::aborted().with_stage(Stage::TransformDispatch).with_url(&url))
            }
        }
    }

    /// Best-effort `cancel(id)`: if a worker slot is still reporting this
    /// task as current, flag it for abandonment. `html2text` gives us no
    /// hook to interrupt a conversion mid-flight, and Rust has no safe way
    /// to kill an OS thread outright, so the flag tells that slot's
    /// supervisor to stop waiting on the stuck thread and spin up a
    /// replacement in its place instead.
    fn cancel_task_best_effort(&self, id: u64) {
        for slot in &self.slots {
            if slot.current_task.load(Ordering::SeqCst) == id {
                slot.abandon.store(true, Ordering::SeqCst);
                break;
            }
        }
    }

    /// Terminates all workers, rejects in-flight tasks, and empties the
    /// queue. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        while let Ok(task) = self.sender.try_recv() {
            let _ = task.reply.send(Err(FetchError::new(ErrorKind::InternalError, "pool closed").with_stage(Stage::TransformDispatch).with_url(&task.url)));
        }
    }
}

fn spawn_supervised_worker(worker_id: usize, receiver: Receiver<TransformTask>, slot: Arc<WorkerSlot>) {
    thread::spawn(move || loop {
        slot.abandon.store(false, Ordering::SeqCst);
        slot.current_task.store(0, Ordering::SeqCst);

        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let worker_receiver = receiver.clone();
        let worker_slot = slot.clone();
        let handle = thread::Builder::new().name(format!("transform-worker-{worker_id}")).spawn(move || {
            worker_loop(worker_receiver, worker_slot);
            let _ = done_tx.send(());
        });
        let Ok(handle) = handle else {
            tracing::error!(worker_id, "failed to spawn transform worker thread");
            return;
        };

        loop {
            match done_rx.recv_timeout(WATCHDOG_POLL) {
                Ok(()) => {
                    drop(handle);
                    if slot.abandon.load(Ordering::SeqCst) {
                        break; // retired after an abandon; respawn below
                    }
                    return; // channel disconnected: pool is shutting down
                }
                Err(RecvTimeoutError::Timeout) => {
                    if slot.abandon.load(Ordering::SeqCst) {
                        tracing::warn!(worker_id, "transform worker stuck past its task deadline, abandoning and respawning");
                        // The stuck thread is left running detached; it will
                        // exit on its own whenever the conversion returns.
                        drop(handle);
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!(worker_id, "transform worker thread crashed, respawning");
                    break;
                }
            }
        }
    });
}

fn worker_loop(receiver: Receiver<TransformTask>, slot: Arc<WorkerSlot>) {
    while let Ok(task) = receiver.recv() {
        let id = task.id;
        let reply = task.reply;
        slot.current_task.store(id, Ordering::SeqCst);
        let result = catch_unwind(AssertUnwindSafe(|| transform_html(&task.html, &task.url, task.include_metadata)));
        slot.current_task.store(0, Ordering::SeqCst);
        let result = result.unwrap_or_else(|_| {
            Err(FetchError::new(ErrorKind::InternalError, "transform worker panicked").with_stage(Stage::TransformDispatch))
        });
        if reply.send(result).is_err() {
            tracing::debug!(task_id = id, "caller went away before the transform result was ready");
        }
        if slot.abandon.load(Ordering::SeqCst) {
            // The deadline fired right as this task finished; retire rather
            // than race the supervisor's replacement for the next `recv()`.
            return;
        }
    }
}

fn transform_html(html: &str, url: &str, include_metadata: bool) -> Result<TransformResult, FetchError> {
    let width = 100;
    let markdown = html2text::from_read(html.as_bytes(), width)
        .map_err(|e| FetchError::new(ErrorKind::InternalError, format!("markdown conversion failed: {e}")).with_url(url))?;

    let title = include_metadata.then(|| extract_title(html)).flatten();
    Ok(TransformResult { markdown, title, truncated: false })
}

fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let start = lower.find("<title")?;
    let open_end = lower[start..].find('>')? + start + 1;
    let close = lower[open_end..].find("</title>")? + open_end;
    Some(html[open_end..close].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transforms_simple_html() {
        let pool = TransformPool::new(PoolConfig { workers: 2, queue_max: 4, task_timeout: Duration::from_secs(5) });
        let cancel = CancellationToken::new();
        let result = pool.transform("<h1>T</h1><p>hi</p>".to_string(), "https://x".to_string(), true, &cancel).await.unwrap();
        assert!(result.markdown.contains("hi"));
    }

    #[tokio::test]
    async fn extracts_title_when_requested() {
        let pool = TransformPool::new(PoolConfig { workers: 1, queue_max: 4, task_timeout: Duration::from_secs(5) });
        let cancel = CancellationToken::new();
        let result = pool
            .transform("<html><head><title>Hello</title></head><body>x</body></html>".to_string(), "https://x".to_string(), true, &cancel)
            .await
            .unwrap();
        assert_eq!(result.title.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn queue_full_is_rejected_synchronously() {
        let pool = TransformPool::new(PoolConfig { workers: 0, queue_max: 1, task_timeout: Duration::from_secs(5) });
        let cancel = CancellationToken::new();
        // No workers are draining the queue, so the first submission fills
        // it and the second must be rejected rather than blocking.
        let _ = pool.sender.try_send(TransformTask {
            id: 999,
            html: String::new(),
            url: "https://x".to_string(),
            include_metadata: false,
            reply: oneshot::channel().0,
        });
        let err = pool.transform("<p>a</p>".to_string(), "https://y".to_string(), false, &cancel).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServerBusy);
    }

    #[tokio::test]
    async fn closed_pool_rejects_in_flight_and_new_tasks() {
        let pool = TransformPool::new(PoolConfig { workers: 1, queue_max: 4, task_timeout: Duration::from_secs(5) });
        pool.close();
        let cancel = CancellationToken::new();
        let err = pool.transform("<p>a</p>".to_string(), "https://y".to_string(), false, &cancel).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalError);
    }
}
