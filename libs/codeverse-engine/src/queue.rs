/// Job Queue - Single-Worker Orchestration
///
/// **Responsibility:**
/// Turn concurrent submissions into one-at-a-time executions and persist
/// every status transition through the run store.
///
/// **Guarantees:**
/// - At most one job executes at any moment
/// - Jobs run in submission (FIFO) order
/// - A failed or panicking job never blocks the ones behind it
/// - `abort` leaves no run in `queued` or `running`
///
/// The queue knows nothing about how code runs (the `Runner`'s job) or how
/// records are stored (the `RunStore`'s job).

use crate::error::EngineError;
use crate::runner::Runner;
use chrono::{DateTime, Utc};
use codeverse_common::store::{RunStore, StoreError};
use codeverse_common::types::{ExecutionRequest, Language, RunId, RunRecord, RunUpdate};
use futures_util::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// A submission waiting for, or owned by, the worker
#[derive(Debug, Clone)]
pub struct Job {
    pub run_id: RunId,
    pub request: ExecutionRequest,
    pub enqueued_at: DateTime<Utc>,
}

/// Handle to a running queue and its worker task
pub struct JobQueue {
    sender: mpsc::UnboundedSender<Job>,
    store: Arc<dyn RunStore>,
    outstanding: Outstanding,
    worker: JoinHandle<()>,
}

/// Runs submitted but not yet finished
type Outstanding = Arc<Mutex<HashSet<RunId>>>;

const CANCELLED: &str = "cancelled: job queue shut down before the run finished";

impl JobQueue {
    /// Spawn the worker on the current runtime
    pub fn start(runner: Arc<dyn Runner>, store: Arc<dyn RunStore>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let outstanding = Outstanding::default();
        let worker = tokio::spawn(worker_loop(receiver, runner, store.clone(), outstanding.clone()));
        Self {
            sender,
            store,
            outstanding,
            worker,
        }
    }

    /// Record the run as queued, enqueue it, and return immediately
    pub async fn submit(
        &self,
        owner_id: &str,
        language: &str,
        source_code: &str,
        stdin: &str,
    ) -> Result<RunId, EngineError> {
        let language = Language::resolve(language);
        let run_id = self.store.create(owner_id, language, stdin).await?;

        let job = Job {
            run_id,
            request: ExecutionRequest::new(language, source_code, stdin),
            enqueued_at: Utc::now(),
        };

        track(&self.outstanding, run_id, true);
        if self.sender.send(job).is_err() {
            track(&self.outstanding, run_id, false);
            // never leave a record stuck in `queued`
            persist(self.store.as_ref(), run_id, RunUpdate::failed(EngineError::QueueClosed.to_string())).await;
            return Err(EngineError::QueueClosed);
        }

        info!(run_id = %run_id, owner_id = owner_id, language = %language, "Job queued");
        Ok(run_id)
    }

    /// Snapshot of a run; no side effects
    pub async fn status(&self, run_id: RunId) -> Result<Option<RunRecord>, EngineError> {
        Ok(self.store.get(run_id).await?)
    }

    /// Poll until the run reaches `done` or `error`
    pub async fn wait(&self, run_id: RunId, poll_interval: Duration) -> Result<RunRecord, EngineError> {
        loop {
            match self.store.get(run_id).await? {
                Some(record) if record.status.is_terminal() => return Ok(record),
                Some(_) => tokio::time::sleep(poll_interval).await,
                None => return Err(StoreError::NotFound(run_id).into()),
            }
        }
    }

    /// Stop accepting jobs, let the worker drain what is queued, and join it
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.worker.await {
            error!(error = %e, "Job worker terminated abnormally");
        }
    }

    /// Stop now: cancel the running job, drop the queued ones, and mark all of
    /// them failed. Returns the ids of the runs that were cut short.
    pub async fn abort(self) -> Vec<RunId> {
        drop(self.sender);
        self.worker.abort();
        // dropping the in-flight execution kills its processes or container
        if let Err(e) = self.worker.await {
            if !e.is_cancelled() {
                error!(error = %e, "Job worker terminated abnormally");
            }
        }

        let outstanding: Vec<RunId> = match self.outstanding.lock() {
            Ok(mut outstanding) => outstanding.drain().collect(),
            Err(poisoned) => poisoned.into_inner().drain().collect(),
        };
        let mut abandoned = Vec::with_capacity(outstanding.len());
        for run_id in outstanding {
            // the worker may have recorded the outcome just before it was stopped
            if let Ok(Some(record)) = self.store.get(run_id).await {
                if record.status.is_terminal() {
                    continue;
                }
            }
            persist(self.store.as_ref(), run_id, RunUpdate::failed(CANCELLED.to_string())).await;
            abandoned.push(run_id);
        }
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "Job queue aborted with unfinished runs");
        }
        abandoned
    }
}

fn track(outstanding: &Outstanding, run_id: RunId, pending: bool) {
    let mut set = match outstanding.lock() {
        Ok(set) => set,
        Err(poisoned) => poisoned.into_inner(),
    };
    if pending {
        set.insert(run_id);
    } else {
        set.remove(&run_id);
    }
}

async fn worker_loop(
    mut receiver: mpsc::UnboundedReceiver<Job>,
    runner: Arc<dyn Runner>,
    store: Arc<dyn RunStore>,
    outstanding: Outstanding,
) {
    info!(backend = runner.name(), "Job worker started");
    while let Some(job) = receiver.recv().await {
        let run_id = job.run_id;
        process_job(job, runner.as_ref(), store.as_ref()).await;
        track(&outstanding, run_id, false);
    }
    info!("Job worker stopped");
}

#[instrument(skip_all, fields(run_id = %job.run_id, language = %job.request.language))]
async fn process_job(job: Job, runner: &dyn Runner, store: &dyn RunStore) {
    let waited_ms = (Utc::now() - job.enqueued_at).num_milliseconds();
    info!(waited_ms, "Job started");
    persist(store, job.run_id, RunUpdate::running()).await;

    // A panic inside a backend becomes an error record instead of killing the worker
    let execution = AssertUnwindSafe(runner.execute(&job.request)).catch_unwind().await;

    let update = match execution {
        Ok(Ok(result)) => {
            info!(
                status = ?result.status,
                failure = ?result.failure,
                duration_ms = result.duration_ms,
                "Job completed"
            );
            RunUpdate::finished(&result)
        }
        Ok(Err(e)) => {
            error!(error = %e, "Execution could not start");
            RunUpdate::failed(e.to_string())
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "Execution panicked");
            RunUpdate::failed(format!("internal error: {}", message))
        }
    };

    persist(store, job.run_id, update).await;
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "backend panicked"
    }
}

/// Persistence failures are logged; the worker keeps going
async fn persist(store: &dyn RunStore, run_id: RunId, update: RunUpdate) {
    let status = update.status;
    if let Err(e) = store.update(run_id, update).await {
        warn!(run_id = %run_id, status = ?status, error = %e, "Failed to persist run transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use codeverse_common::store::InMemoryRunStore;
    use codeverse_common::types::{ExecutionResult, RunStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted backend: the source code says what to do
    /// `sleep:<ms>`, `fail`, `panic`, or anything else to echo it back
    #[derive(Default)]
    struct FakeRunner {
        active: AtomicUsize,
        max_active: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Runner for FakeRunner {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, EngineError> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            self.order.lock().unwrap().push(request.source_code.clone());

            let code = request.source_code.as_str();
            let outcome = if let Some(ms) = code.strip_prefix("sleep:") {
                tokio::time::sleep(Duration::from_millis(ms.parse().unwrap())).await;
                Ok(ExecutionResult::done(format!("slept {}", ms), String::new(), Some(0)))
            } else if code == "fail" {
                Err(EngineError::spawn(
                    "python3",
                    std::io::Error::new(std::io::ErrorKind::NotFound, "not installed"),
                ))
            } else if code == "panic" {
                self.active.fetch_sub(1, Ordering::SeqCst);
                panic!("backend exploded");
            } else {
                Ok(ExecutionResult::done(format!("{}|{}", code, request.stdin), String::new(), Some(0)))
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn start() -> (JobQueue, Arc<FakeRunner>, Arc<InMemoryRunStore>) {
        let runner = Arc::new(FakeRunner::default());
        let store = Arc::new(InMemoryRunStore::new());
        let queue = JobQueue::start(runner.clone(), store.clone());
        (queue, runner, store)
    }

    async fn wait(queue: &JobQueue, run_id: RunId) -> RunRecord {
        tokio::time::timeout(Duration::from_secs(5), queue.wait(run_id, Duration::from_millis(5)))
            .await
            .expect("job should finish")
            .expect("record should exist")
    }

    #[tokio::test]
    async fn test_submit_returns_queued_run() {
        let (queue, _runner, store) = start();
        let run_id = queue.submit("owner-1", "python", "sleep:50", "").await.unwrap();

        let record = store.get(run_id).await.unwrap().unwrap();
        assert!(matches!(record.status, RunStatus::Queued | RunStatus::Running));
        assert_eq!(record.owner_id, "owner-1");

        let done = wait(&queue, run_id).await;
        assert_eq!(done.status, RunStatus::Done);
        assert_eq!(done.stdout.as_deref(), Some("slept 50"));
    }

    #[tokio::test]
    async fn test_jobs_are_serialized() {
        let (queue, runner, _store) = start();
        let first = queue.submit("u", "c", "sleep:80", "").await.unwrap();
        let second = queue.submit("u", "c", "sleep:80", "").await.unwrap();
        let third = queue.submit("u", "c", "sleep:10", "").await.unwrap();

        let first = wait(&queue, first).await;
        let second = wait(&queue, second).await;
        let third = wait(&queue, third).await;

        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
        assert!(second.started_at.unwrap() >= first.completed_at.unwrap());
        assert!(third.started_at.unwrap() >= second.completed_at.unwrap());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (queue, runner, _store) = start();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(queue.submit("u", "python", &format!("job-{}", i), "").await.unwrap());
        }
        for id in &ids {
            wait(&queue, *id).await;
        }
        let order = runner.order.lock().unwrap().clone();
        assert_eq!(order, vec!["job-0", "job-1", "job-2", "job-3", "job-4"]);
    }

    #[tokio::test]
    async fn test_failed_job_does_not_block_queue() {
        let (queue, _runner, _store) = start();
        let failing = queue.submit("u", "python", "fail", "").await.unwrap();
        let next = queue.submit("u", "python", "hello", "Alice").await.unwrap();

        let failing = wait(&queue, failing).await;
        assert_eq!(failing.status, RunStatus::Error);
        assert!(failing.stderr.unwrap().contains("failed to spawn python3"));

        let next = wait(&queue, next).await;
        assert_eq!(next.status, RunStatus::Done);
        assert_eq!(next.stdout.as_deref(), Some("hello|Alice"));
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let (queue, _runner, _store) = start();
        let bad = queue.submit("u", "python", "panic", "").await.unwrap();
        let good = queue.submit("u", "python", "after", "").await.unwrap();

        assert_eq!(wait(&queue, bad).await.status, RunStatus::Error);
        assert_eq!(wait(&queue, good).await.status, RunStatus::Done);
    }

    #[tokio::test]
    async fn test_unknown_language_runs_as_python() {
        let (queue, _runner, _store) = start();
        let run_id = queue.submit("u", "fortran", "x", "").await.unwrap();
        let record = wait(&queue, run_id).await;
        assert_eq!(record.language, Language::Python);
    }

    #[tokio::test]
    async fn test_panic_message_is_recorded() {
        let (queue, _runner, _store) = start();
        let bad = queue.submit("u", "python", "panic", "").await.unwrap();
        let record = wait(&queue, bad).await;
        assert_eq!(record.stderr.as_deref(), Some("internal error: backend exploded"));
    }

    #[tokio::test]
    async fn test_abort_fails_running_and_queued_runs() {
        let (queue, runner, store) = start();
        let running = queue.submit("u", "python", "sleep:5000", "").await.unwrap();
        let queued = queue.submit("u", "python", "never", "").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while runner.active.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first job should start");

        let started = std::time::Instant::now();
        let mut abandoned = queue.abort().await;
        assert!(started.elapsed() < Duration::from_secs(2));

        abandoned.sort();
        let mut expected = vec![running, queued];
        expected.sort();
        assert_eq!(abandoned, expected);

        for id in [running, queued] {
            let record = store.get(id).await.unwrap().unwrap();
            assert_eq!(record.status, RunStatus::Error);
            assert_eq!(record.stderr.as_deref(), Some(CANCELLED));
        }
        assert_eq!(*runner.order.lock().unwrap(), vec!["sleep:5000"]);
    }

    #[tokio::test]
    async fn test_abort_after_completion_reports_nothing() {
        let (queue, _runner, _store) = start();
        let run_id = queue.submit("u", "python", "quick", "").await.unwrap();
        wait(&queue, run_id).await;
        assert!(queue.abort().await.is_empty());
    }

    #[tokio::test]
    async fn test_status_of_unknown_run() {
        let (queue, _runner, _store) = start();
        assert!(queue.status(uuid::Uuid::new_v4()).await.unwrap().is_none());
        let err = queue.wait(uuid::Uuid::new_v4(), Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_jobs() {
        let (queue, _runner, store) = start();
        let a = queue.submit("u", "python", "sleep:30", "").await.unwrap();
        let b = queue.submit("u", "python", "sleep:30", "").await.unwrap();
        queue.shutdown().await;

        for id in [a, b] {
            let record = store.get(id).await.unwrap().unwrap();
            assert_eq!(record.status, RunStatus::Done);
        }
    }
}
