//! Daemon message loop, dispatcher and collaborator handle.
//!
//! The [`Daemon`] owns the queue state and processes one message at a time:
//! queue mutations from [`DaemonHandle`]s and output/exit events from the
//! running encoder. Every mutation is persisted before it is acknowledged,
//! then the dispatcher decides whether to start the next job. At most one
//! encoder runs at a time.

use crate::config::Config;
use crate::jobs::{status, validate_source_path, Job, JobError, JobFactory};
use crate::progress::ProgressTracker;
use crate::queue::{QueueError, QueueState, Removal};
use crate::scan::find_all_media_files;
use crate::startup::{run_startup_checks, StartupError};
use crate::store::{PersistError, StateStore};
use crate::supervisor::{self, remove_source, settle_exit, ExitOutcome, ProcessEvent, ProcessHandle};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const REQUEST_CHANNEL_CAPACITY: usize = 100;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Failed to save queue state: {0}")]
    Persist(#[from] PersistError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Invalid completion marker: {0}")]
    CompletionMarker(#[from] regex::Error),

    #[error("No suitable files found")]
    NoMediaFiles,

    #[error("Queue daemon is not running")]
    Unavailable,
}

/// Result envelope returned to the UI layer for every operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpResult {
    pub success: bool,
    pub msg: String,
    #[serde(rename = "jobID", default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl OpResult {
    pub fn ok(msg: impl Into<String>) -> Self {
        Self {
            success: true,
            msg: msg.into(),
            job_id: None,
        }
    }

    pub fn err(error: &DaemonError) -> Self {
        Self {
            success: false,
            msg: error.to_string(),
            job_id: None,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Read-only view of the queue for the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Pending jobs in dispatch order.
    pub queued_jobs: Vec<Job>,
    /// Terminal jobs in completion order.
    pub completed_jobs: Vec<Job>,
    /// The job currently owning the encoder.
    #[serde(rename = "currentJob")]
    pub current_job: Option<Job>,
}

impl QueueSnapshot {
    fn of(state: &QueueState) -> Self {
        Self {
            queued_jobs: state.pending_jobs(),
            completed_jobs: state.done_jobs(),
            current_job: state
                .current_job_id
                .as_deref()
                .and_then(|id| state.job(id))
                .cloned(),
        }
    }

    /// Look up a job in any of the three views.
    pub fn find(&self, job_id: &str) -> Option<&Job> {
        self.current_job
            .iter()
            .chain(self.queued_jobs.iter())
            .chain(self.completed_jobs.iter())
            .find(|job| job.id == job_id)
    }
}

type Reply<T> = oneshot::Sender<Result<T, DaemonError>>;

enum Request {
    Enqueue { job: Job, reply: Reply<String> },
    Remove { job_id: String, reply: Reply<Removal> },
    Requeue { job_id: String, reply: Reply<()> },
    Move { job_id: String, index: i64, reply: Reply<usize> },
    ClearCompleted { reply: Reply<usize> },
    Snapshot { reply: Reply<QueueSnapshot> },
}

/// Dispatcher states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// No encoder running.
    Idle,
    /// A job was popped and its encoder is being started.
    Dispatching,
    /// The encoder is running.
    Active,
}

/// Queue owner and encoder supervisor.
pub struct Daemon {
    config: Arc<Config>,
    store: StateStore,
    state: QueueState,
    dispatch_state: DispatchState,
    process: Option<ProcessHandle>,
    tracker: ProgressTracker,
    terminate_requested: bool,
    requests: mpsc::Receiver<Request>,
    events_tx: mpsc::Sender<ProcessEvent>,
    events_rx: mpsc::Receiver<ProcessEvent>,
}

impl Daemon {
    /// Run startup checks, then load the queue state.
    pub async fn new(config: Config) -> Result<(Self, DaemonHandle), DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config).await
    }

    /// Load the queue state without checking for the encoder.
    ///
    /// A job left active by a previous run is put back at the head of the
    /// pending queue.
    pub async fn new_without_checks(config: Config) -> Result<(Self, DaemonHandle), DaemonError> {
        let tracker = ProgressTracker::from_pattern(&config.main.completion_marker)?;
        let store = StateStore::new(config.main.state_file.clone());
        let mut state = store.load().await?;
        if let Some(job_id) = state.recover_interrupted() {
            tracing::info!(%job_id, "Requeued job interrupted by previous shutdown");
            store.save(&state).await?;
        }

        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = DaemonHandle {
            requests: request_tx,
            factory: Arc::new(JobFactory::from_config(&config)),
        };

        let daemon = Self {
            config: Arc::new(config),
            store,
            state,
            dispatch_state: DispatchState::Idle,
            process: None,
            tracker,
            terminate_requested: false,
            requests: request_rx,
            events_tx,
            events_rx,
        };
        Ok((daemon, handle))
    }

    /// Run the loop on a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process messages until every handle is dropped.
    pub async fn run(mut self) {
        self.dispatch().await;

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
            }
        }

        if let Some(job_id) = &self.state.current_job_id {
            tracing::info!(%job_id, "Daemon stopping with a job still encoding");
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Enqueue { job, reply } => {
                let job_id = self.state.enqueue(job);
                let result = self.persist().await.map(|()| job_id);
                let _ = reply.send(result);
            }
            Request::Remove { job_id, reply } => {
                let result = match self.state.remove(&job_id) {
                    Ok(Removal::Active) => {
                        self.terminate_active();
                        self.persist().await.map(|()| Removal::Active)
                    }
                    Ok(removal) => self.persist().await.map(|()| removal),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            Request::Requeue { job_id, reply } => {
                let result = match self.state.requeue(&job_id) {
                    Ok(()) => self.persist().await,
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            Request::Move {
                job_id,
                index,
                reply,
            } => {
                let result = match self.state.move_job(&job_id, index) {
                    Ok(landed) => self.persist().await.map(|()| landed),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            Request::ClearCompleted { reply } => {
                let deleted = self.state.clear_completed();
                let result = self.persist().await.map(|()| deleted);
                let _ = reply.send(result);
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(Ok(QueueSnapshot::of(&self.state)));
                return;
            }
        }

        self.dispatch().await;
    }

    async fn handle_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Output { job_id, chunk } => {
                if !self.state.is_current(&job_id) {
                    tracing::debug!(%job_id, "Ignoring output from a finished job");
                    return;
                }
                let update = self.tracker.observe(&chunk);
                if let Some(job) = self.state.current_job_mut() {
                    update.apply(job);
                }
            }
            ProcessEvent::Exited { job_id, code } => self.on_exit(&job_id, code).await,
        }
    }

    fn terminate_active(&mut self) {
        self.terminate_requested = true;
        let grace = Duration::from_secs(self.config.main.terminate_grace_secs);
        if let Some(process) = self.process.as_mut() {
            tracing::info!(pid = ?process.pid(), ?grace, "Interrupting encoder");
            process.terminate(grace);
        }
    }

    async fn on_exit(&mut self, job_id: &str, code: Option<i32>) {
        if !self.state.is_current(job_id) {
            tracing::debug!(%job_id, "Ignoring exit of a job that is not active");
            return;
        }
        tracing::info!(%job_id, ?code, "Job complete");

        self.process = None;
        self.dispatch_state = DispatchState::Idle;
        let terminated = std::mem::take(&mut self.terminate_requested);

        let outcome = self
            .state
            .current_job_mut()
            .map(|job| (settle_exit(job, code, terminated), job.source_path.clone()));
        if let Some((ExitOutcome::Completed { delete_source: true }, source)) = outcome {
            remove_source(&source).await;
        }

        self.state.finish_current();
        self.persist_logged().await;
        self.dispatch().await;
    }

    /// Start the next pending job if the encoder is free.
    async fn dispatch(&mut self) {
        loop {
            tracing::debug!(
                queue_len = self.state.pending_len(),
                current = ?self.state.current_job_id,
                state = ?self.dispatch_state,
                "Checking jobs"
            );
            if self.process.is_some() || self.dispatch_state != DispatchState::Idle {
                tracing::debug!("Encoder busy, start request dropped");
                return;
            }
            let Some(job_id) = self.state.activate_next() else {
                return;
            };

            self.dispatch_state = DispatchState::Dispatching;
            self.tracker.reset();
            self.terminate_requested = false;

            let Some(job) = self.state.current_job_mut() else {
                tracing::warn!(%job_id, "Pending id has no job record, dropping it");
                self.state.current_job_id = None;
                self.dispatch_state = DispatchState::Idle;
                continue;
            };
            job.status = status::STARTING.to_string();
            let job = job.clone();

            match supervisor::start(&self.config.main.encoder, &job, self.events_tx.clone()).await {
                Ok(process) => {
                    self.process = Some(process);
                    self.dispatch_state = DispatchState::Active;
                    self.persist_logged().await;
                    return;
                }
                Err(e) => {
                    tracing::error!(%job_id, error = %e, "Failed to start job");
                    if let Some(job) = self.state.current_job_mut() {
                        job.status = format!("Failed to start encoder: {}", e);
                    }
                    self.state.finish_current();
                    self.dispatch_state = DispatchState::Idle;
                    self.persist_logged().await;
                }
            }
        }
    }

    async fn persist(&self) -> Result<(), DaemonError> {
        self.store.save(&self.state).await.map_err(|e| {
            tracing::error!(error = %e, "Error saving queue state");
            DaemonError::Persist(e)
        })
    }

    async fn persist_logged(&self) {
        let _ = self.persist().await;
    }
}

/// Cloneable entry point for the UI layer.
#[derive(Clone)]
pub struct DaemonHandle {
    requests: mpsc::Sender<Request>,
    factory: Arc<JobFactory>,
}

impl DaemonHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, DaemonError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| DaemonError::Unavailable)?;
        response.await.map_err(|_| DaemonError::Unavailable)?
    }

    /// Validate, build and enqueue a job for one file.
    pub async fn try_add_job(
        &self,
        path: &Path,
        profile: &str,
        delete_source: bool,
    ) -> Result<String, DaemonError> {
        validate_source_path(path).await?;
        let job = self.factory.build(path, profile, delete_source)?;
        self.request(|reply| Request::Enqueue { job, reply }).await
    }

    pub async fn add_job(&self, path: &Path, profile: &str, delete_source: bool) -> OpResult {
        match self.try_add_job(path, profile, delete_source).await {
            Ok(job_id) => OpResult::ok("Job Added").with_job_id(job_id),
            Err(e) => OpResult::err(&e),
        }
    }

    /// Enqueue every media file below `path`, in lexicographic order.
    pub async fn add_folder(&self, path: &Path, profile: &str, delete_source: bool) -> Vec<OpResult> {
        if let Err(e) = validate_source_path(path).await {
            return vec![OpResult::err(&e.into())];
        }
        if !self.factory.has_profile(profile) {
            return vec![OpResult::err(&JobError::UnknownProfile(profile.to_string()).into())];
        }

        let root = path.to_path_buf();
        let mut files = match tokio::task::spawn_blocking(move || find_all_media_files(&root)).await
        {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(error = %e, "Folder scan task failed");
                Vec::new()
            }
        };
        if files.is_empty() {
            return vec![OpResult::err(&DaemonError::NoMediaFiles)];
        }
        files.sort();
        tracing::info!(count = files.len(), folder = %path.display(), "Found media files");

        let mut results = Vec::with_capacity(files.len());
        for file in files {
            tracing::debug!(file = %file.display(), "Pushing job");
            results.push(self.add_job(&file, profile, delete_source).await);
        }
        results
    }

    /// Remove a pending job, or stop the active one.
    pub async fn try_remove(&self, job_id: &str) -> Result<Removal, DaemonError> {
        let job_id = job_id.to_string();
        self.request(|reply| Request::Remove { job_id, reply }).await
    }

    pub async fn remove(&self, job_id: &str) -> OpResult {
        match self.try_remove(job_id).await {
            Ok(Removal::Active) => OpResult::ok("Killed job"),
            Ok(Removal::Canceled) => OpResult::ok("Removed job"),
            Err(e) => OpResult::err(&e),
        }
    }

    pub async fn requeue(&self, job_id: &str) -> OpResult {
        let job_id = job_id.to_string();
        match self.request(|reply| Request::Requeue { job_id, reply }).await {
            Ok(()) => OpResult::ok("Job readded"),
            Err(e) => OpResult::err(&e),
        }
    }

    /// Move a pending job; the target is clamped to `[1, len - 1]`.
    pub async fn move_job(&self, job_id: &str, index: i64) -> OpResult {
        let job_id = job_id.to_string();
        match self
            .request(|reply| Request::Move {
                job_id,
                index,
                reply,
            })
            .await
        {
            Ok(landed) => OpResult::ok(format!("Job moved to position {}.", landed + 1)),
            Err(e) => OpResult::err(&e),
        }
    }

    pub async fn clear_completed(&self) -> OpResult {
        match self.request(|reply| Request::ClearCompleted { reply }).await {
            Ok(deleted) => OpResult::ok(format!("{} completed jobs cleared", deleted)),
            Err(e) => OpResult::err(&e),
        }
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, DaemonError> {
        self.request(|reply| Request::Snapshot { reply }).await
    }
}
