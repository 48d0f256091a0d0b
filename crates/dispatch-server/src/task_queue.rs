//! Durable, at-least-once, in-process task executor.
//!
//! Generalizes the coalescing mpsc + periodic-tick shape of the telemetry
//! persistence loop into "run an arbitrary named task, retrying on
//! transient failure". A task that keeps failing past `retry_count` is
//! handed to an `on_exhausted` callback instead of silently dropped — the
//! dispatch pipeline's error sink is wired in as that callback.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct TaskError {
    pub message: String,
    pub retriable: bool,
}

pub type TaskOutcome = Result<(), TaskError>;

pub type Executor = Arc<dyn Fn(Task, CancellationToken) -> BoxFuture<TaskOutcome> + Send + Sync>;
pub type ExhaustedHandler = Arc<dyn Fn(Task, TaskError) -> BoxFuture<()> + Send + Sync>;

struct DelayedTask {
    ready_at: Instant,
    task: Task,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at
    }
}
impl Eq for DelayedTask {}
impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; the earliest deadline must pop first.
        other.ready_at.cmp(&self.ready_at)
    }
}
impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Cloneable enqueue handle. Safe to stash in `AppState` and share across
/// handlers; the actual worker pool is spawned once from `TaskQueue::run`.
#[derive(Clone)]
pub struct TaskQueueHandle {
    ready_tx: mpsc::Sender<Task>,
    delayed: Arc<Mutex<BinaryHeap<DelayedTask>>>,
    retry_count: u32,
    retry_delay: Duration,
    queued_count: Arc<AtomicU64>,
}

impl TaskQueueHandle {
    pub async fn enqueue(&self, kind: impl Into<String>, payload: serde_json::Value) -> Task {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload,
            attempts: 0,
        };
        self.queued_count.fetch_add(1, Ordering::Relaxed);
        if self.ready_tx.send(task.clone()).await.is_err() {
            tracing::error!(task_id = %task.id, "task queue worker pool is gone, task dropped");
        }
        task
    }

    /// Non-blocking enqueue attempt; returns `false` if the channel is full
    /// or closed so the caller (telemetry ingest) can fall back to inline
    /// processing without ever blocking on the HTTP path.
    pub fn try_enqueue(&self, kind: impl Into<String>, payload: serde_json::Value) -> bool {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload,
            attempts: 0,
        };
        self.queued_count.fetch_add(1, Ordering::Relaxed);
        self.ready_tx.try_send(task).is_ok()
    }

    async fn requeue_after_delay(&self, mut task: Task, delay: Duration) {
        task.attempts += 1;
        let mut delayed = self.delayed.lock().await;
        delayed.push(DelayedTask { ready_at: Instant::now() + delay, task });
    }

    pub fn queued_count(&self) -> u64 {
        self.queued_count.load(Ordering::Relaxed)
    }
}

pub struct TaskQueue {
    handle: TaskQueueHandle,
    cancellation: CancellationToken,
}

impl TaskQueue {
    /// `worker_concurrency` bounds the number of tasks executing at once;
    /// `retry_count`/`retry_delay` match `Config`'s env-driven values.
    pub fn new(worker_concurrency: usize, retry_count: u32, retry_delay: Duration) -> (TaskQueue, TaskQueueHandle, mpsc::Receiver<Task>) {
        let (ready_tx, ready_rx) = mpsc::channel(worker_concurrency.max(1) * 16);
        let handle = TaskQueueHandle {
            ready_tx,
            delayed: Arc::new(Mutex::new(BinaryHeap::new())),
            retry_count,
            retry_delay,
            queued_count: Arc::new(AtomicU64::new(0)),
        };
        let queue = TaskQueue {
            handle: handle.clone(),
            cancellation: CancellationToken::new(),
        };
        (queue, handle, ready_rx)
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Drives the worker pool and the delayed-task scheduler until
    /// cancelled. `concurrency` bounds in-flight task executions.
    pub async fn run(
        self,
        mut ready_rx: mpsc::Receiver<Task>,
        concurrency: usize,
        executor: Executor,
        on_exhausted: ExhaustedHandler,
    ) {
        let handle = self.handle.clone();
        let scheduler_cancel = self.cancellation.clone();
        let scheduler_handle = handle.clone();
        let scheduler = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(250));
            loop {
                tokio::select! {
                    _ = scheduler_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut due = Vec::new();
                        {
                            let mut delayed = scheduler_handle.delayed.lock().await;
                            while let Some(top) = delayed.peek() {
                                if top.ready_at <= Instant::now() {
                                    due.push(delayed.pop().expect("peeked").task);
                                } else {
                                    break;
                                }
                            }
                        }
                        for task in due {
                            if scheduler_handle.ready_tx.send(task).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => break,
                received = ready_rx.recv() => {
                    let Some(task) = received else { break };
                    let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
                    let executor = executor.clone();
                    let on_exhausted = on_exhausted.clone();
                    let handle = handle.clone();
                    let cancel_token = self.cancellation.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let outcome = executor(task.clone(), cancel_token).await;
                        if let Err(err) = outcome {
                            if err.retriable && task.attempts < handle.retry_count {
                                tracing::warn!(task_id = %task.id, kind = %task.kind, attempts = task.attempts, "task failed, requeueing");
                                handle.requeue_after_delay(task, handle.retry_delay).await;
                            } else {
                                tracing::error!(task_id = %task.id, kind = %task.kind, "task exhausted retries");
                                on_exhausted(task, err).await;
                            }
                        }
                    });
                }
            }
        }
        scheduler.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn succeeding_task_runs_once() {
        let (queue, handle, rx) = TaskQueue::new(2, 3, Duration::from_millis(10));
        let cancel = queue.cancellation();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let executor: Executor = Arc::new(move |_task, _cancel| {
            let runs = runs_clone.clone();
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let on_exhausted: ExhaustedHandler = Arc::new(|_task, _err| Box::pin(async {}));

        let run_handle = tokio::spawn(queue.run(rx, 2, executor, on_exhausted));
        handle.enqueue("noop", serde_json::json!({})).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let _ = run_handle.await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_task_retries_then_exhausts() {
        let (queue, handle, rx) = TaskQueue::new(1, 1, Duration::from_millis(5));
        let cancel = queue.cancellation();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let executor: Executor = Arc::new(move |_task, _cancel| {
            let attempts = attempts_clone.clone();
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(TaskError { message: "boom".into(), retriable: true })
            })
        });
        let exhausted = Arc::new(AtomicUsize::new(0));
        let exhausted_clone = exhausted.clone();
        let on_exhausted: ExhaustedHandler = Arc::new(move |_task, _err| {
            let exhausted = exhausted_clone.clone();
            Box::pin(async move {
                exhausted.fetch_add(1, Ordering::SeqCst);
            })
        });

        let run_handle = tokio::spawn(queue.run(rx, 1, executor, on_exhausted));
        handle.enqueue("always_fails", serde_json::json!({})).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let _ = run_handle.await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
    }
}
