//! Scheduler/Runner: the per-job loop that advances ready tasks
//!
//! One dedicated runner per job drives the task state machine in wavefronts:
//! every ready task (queued, eligible, all dependencies succeeded) executes
//! concurrently under two semaphores (the process-wide provider-call cap,
//! then the per-job scene pool), and the runner re-evaluates once the wave
//! drains. Cancellation is sourced from the store, not the request: a watcher
//! polls `cancel_requested` alongside every provider call and trips the
//! call's cancel token, so cancel intent survives the API call that set it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use storyreel_common::{Error, Result};
use storyreel_provider::{ErrorCategory, ExecuteInput, Provider, ProviderError};

use crate::domain::entities::{
    Asset, Job, JobEventRecord, JobEventType, JobStatus, JobTask, NewJobEvent, TaskStatus,
};
use crate::domain::state::StateError;
use crate::engine::graph::build_tasks;
use crate::hub::EventHub;
use crate::store::MemoryStore;

/// Poll interval for cancel watchers and cancelable sleeps
const CANCEL_POLL: Duration = Duration::from_millis(100);
/// Runner idle wait when no task is ready
const IDLE_WAIT: Duration = Duration::from_millis(120);

/// Engine concurrency caps
#[derive(Debug, Clone, Copy)]
pub struct EngineLimits {
    /// Process-wide cap on concurrent provider calls
    pub max_concurrent_tasks: usize,
    /// Per-user cap on simultaneously running jobs
    pub max_user_jobs: usize,
    /// Per-job cap on concurrent scene (image/tts) workers
    pub max_scene_workers: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: storyreel_common::config::DEFAULT_MAX_CONCURRENT_TASKS,
            max_user_jobs: storyreel_common::config::DEFAULT_MAX_USER_JOBS,
            max_scene_workers: storyreel_common::config::DEFAULT_MAX_SCENE_WORKERS,
        }
    }
}

impl EngineLimits {
    /// A zero cap would wedge the engine; coerce to defaults
    fn sanitized(self) -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_tasks: if self.max_concurrent_tasks >= 1 {
                self.max_concurrent_tasks
            } else {
                defaults.max_concurrent_tasks
            },
            max_user_jobs: if self.max_user_jobs >= 1 {
                self.max_user_jobs
            } else {
                defaults.max_user_jobs
            },
            max_scene_workers: if self.max_scene_workers >= 1 {
                self.max_scene_workers
            } else {
                defaults.max_scene_workers
            },
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    running_by_user: HashMap<Uuid, usize>,
    active_runners: HashSet<Uuid>,
}

/// The job scheduler: public surface consumed by the HTTP layer
pub struct Scheduler {
    store: Arc<MemoryStore>,
    hub: Arc<EventHub>,
    provider: Arc<dyn Provider>,
    limits: EngineLimits,
    global_sem: Arc<Semaphore>,
    state: Mutex<SchedulerState>,
    handle: Weak<Scheduler>,
}

impl Scheduler {
    pub fn new(
        store: Arc<MemoryStore>,
        hub: Arc<EventHub>,
        provider: Arc<dyn Provider>,
        limits: EngineLimits,
    ) -> Arc<Self> {
        let limits = limits.sanitized();
        Arc::new_cyclic(|handle| Scheduler {
            store,
            hub,
            provider,
            global_sem: Arc::new(Semaphore::new(limits.max_concurrent_tasks)),
            limits,
            state: Mutex::new(SchedulerState::default()),
            handle: handle.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Public surface
    // ------------------------------------------------------------------

    /// Admit and launch a new job for `project_id`.
    ///
    /// A non-empty idempotency key collapses repeated calls to the first job:
    /// the existing job is returned unchanged, with no second runner and no
    /// re-admission.
    pub fn start_job(
        &self,
        user_id: Uuid,
        project_id: Uuid,
        trace_id: String,
        idempotency_key: Option<String>,
    ) -> Result<Job> {
        if let Some(key) = idempotency_key.as_deref().filter(|k| !k.is_empty()) {
            if let Some(existing) = self.store.get_job_by_idempotency(user_id, key) {
                return Ok(existing);
            }
        }

        let mut project = self.store.get_project(project_id)?;
        if project.user_id != user_id {
            return Err(Error::Authorization("no access to project".to_string()));
        }

        if self.running_jobs_for(user_id) >= self.limits.max_user_jobs {
            return Err(Error::TooManyRunningJobs(format!(
                "user has {} running jobs (max {})",
                self.running_jobs_for(user_id),
                self.limits.max_user_jobs
            )));
        }

        let job = Job::new(user_id, project_id, trace_id, idempotency_key.clone());
        let tasks = build_tasks(&project, &job);
        let task_count = tasks.len();
        let created = self.store.create_job(job.clone(), tasks, idempotency_key.as_deref())?;
        if created.id != job.id {
            // Lost a concurrent create on the same key; the winner owns the runner.
            return Ok(created);
        }

        project.current_job_id = Some(created.id);
        project.status = "running".to_string();
        project.updated_at = Utc::now();
        if let Err(e) = self.store.update_project(project) {
            tracing::warn!(job_id = %created.id, error = %e, "project status update failed");
        }

        self.publish_event(
            &created,
            JobEventType::JobCreated,
            json!({ "status": created.status, "tasks": task_count }),
        );

        tracing::info!(
            job_id = %created.id,
            user_id = %user_id,
            project_id = %project_id,
            tasks = task_count,
            "job started"
        );
        self.start_runner_if_needed(&created);
        Ok(created)
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<Job> {
        self.store.get_job(job_id)
    }

    pub fn get_job_tasks(&self, job_id: Uuid) -> Result<Vec<JobTask>> {
        self.store.get_job_tasks(job_id)
    }

    pub fn list_events_from(&self, job_id: Uuid, from_seq: i64) -> Result<Vec<JobEventRecord>> {
        self.store.list_job_events_from_seq(job_id, from_seq)
    }

    /// Request cancellation. A no-op on already-terminal jobs; otherwise only
    /// flips `cancel_requested` and lets the runner and watchers do the rest.
    pub fn cancel_job(&self, user_id: Uuid, job_id: Uuid) -> Result<Job> {
        let mut job = self.store.get_job(job_id)?;
        if job.user_id != user_id {
            return Err(Error::Authorization("no access to job".to_string()));
        }
        if job.is_terminal() {
            return Ok(job);
        }
        job.cancel_requested = true;
        self.store.update_job(job.clone())?;
        self.publish_event(
            &job,
            JobEventType::JobProgress,
            json!({
                "status": job.status,
                "cancel_requested": true,
                "progress": job.progress,
            }),
        );
        tracing::info!(job_id = %job.id, "cancel requested");
        Ok(job)
    }

    /// Reset a terminal failed/canceled job back to queued and relaunch it.
    /// Only non-succeeded tasks are reset; their attempt counters carry over.
    pub fn retry_job(&self, user_id: Uuid, job_id: Uuid, trace_id: String) -> Result<Job> {
        let mut job = self.store.get_job(job_id)?;
        if job.user_id != user_id {
            return Err(Error::Authorization("no access to job".to_string()));
        }
        if !matches!(job.status, JobStatus::Failed | JobStatus::Canceled) {
            return Err(Error::InvalidJobState(format!(
                "only failed or canceled jobs can retry (job is {})",
                job.status
            )));
        }

        if self.running_jobs_for(user_id) >= self.limits.max_user_jobs {
            return Err(Error::TooManyRunningJobs(format!(
                "user has {} running jobs (max {})",
                self.running_jobs_for(user_id),
                self.limits.max_user_jobs
            )));
        }

        let mut tasks = self.store.get_job_tasks(job_id)?;
        for task in tasks.iter_mut() {
            if matches!(task.status, TaskStatus::Failed | TaskStatus::Canceled) {
                task.requeue()
                    .map_err(|e| Error::Internal(format!("task requeue rejected: {e}")))?;
            }
        }
        self.store.replace_job_tasks(job_id, tasks.clone())?;

        job.requeue(trace_id)
            .map_err(|e| Error::Internal(format!("job requeue rejected: {e}")))?;
        job.progress = calc_progress(&tasks);
        self.store.update_job(job.clone())?;

        self.publish_event(&job, JobEventType::JobCreated, json!({ "status": "retry_queued" }));
        tracing::info!(job_id = %job.id, "job requeued for retry");
        self.start_runner_if_needed(&job);
        Ok(job)
    }

    // ------------------------------------------------------------------
    // Runner lifecycle
    // ------------------------------------------------------------------

    fn running_jobs_for(&self, user_id: Uuid) -> usize {
        self.state
            .lock()
            .unwrap()
            .running_by_user
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }

    fn start_runner_if_needed(&self, job: &Job) {
        let Some(scheduler) = self.handle.upgrade() else {
            return;
        };
        {
            let mut state = self.state.lock().unwrap();
            if !state.active_runners.insert(job.id) {
                return;
            }
            *state.running_by_user.entry(job.user_id).or_insert(0) += 1;
        }
        let job_id = job.id;
        tokio::spawn(async move {
            scheduler.run_job(job_id).await;
        });
    }

    fn finish_runner(&self, job: &Job) {
        let mut state = self.state.lock().unwrap();
        state.active_runners.remove(&job.id);
        if let Some(count) = state.running_by_user.get_mut(&job.user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.running_by_user.remove(&job.user_id);
            }
        }
    }

    /// The per-job loop. Exits once the job is terminal or vanishes.
    async fn run_job(self: Arc<Self>, job_id: Uuid) {
        let scene_sem = Arc::new(Semaphore::new(self.limits.max_scene_workers));

        loop {
            let Ok(mut job) = self.store.get_job(job_id) else {
                tracing::error!(job_id = %job_id, "job vanished, runner exiting");
                break;
            };
            if job.is_terminal() {
                break;
            }

            if job.started_at.is_none() {
                if let Err(e) = job.start() {
                    tracing::error!(job_id = %job_id, error = %e, "job start rejected");
                    break;
                }
                if self.store.update_job(job.clone()).is_ok() {
                    self.publish_event(
                        &job,
                        JobEventType::JobProgress,
                        json!({ "status": job.status, "progress": job.progress }),
                    );
                }
            }

            if job.cancel_requested {
                self.cancel_queued_tasks(&job);
            }

            let Ok(tasks) = self.store.get_job_tasks(job_id) else {
                break;
            };
            if tasks.iter().all(JobTask::is_terminal) {
                self.finalize_job(job, &tasks);
                break;
            }

            let ready = ready_tasks(&tasks);
            if ready.is_empty() {
                tokio::time::sleep(IDLE_WAIT).await;
                continue;
            }

            let mut wave = JoinSet::new();
            for task in ready {
                wave.spawn(Arc::clone(&self).execute_task(
                    job.clone(),
                    task,
                    Arc::clone(&scene_sem),
                ));
            }
            while wave.join_next().await.is_some() {}
        }

        if let Ok(job) = self.store.get_job(job_id) {
            self.finish_runner(&job);
        }
    }

    /// Transition every still-queued task to canceled in one atomic replace
    fn cancel_queued_tasks(&self, job: &Job) {
        let Ok(mut tasks) = self.store.get_job_tasks(job.id) else {
            return;
        };
        let mut changed = false;
        for task in tasks.iter_mut() {
            if task.status == TaskStatus::Queued && task.cancel("Canceled before execution").is_ok()
            {
                changed = true;
            }
        }
        if !changed {
            return;
        }
        if let Err(e) = self.store.replace_job_tasks(job.id, tasks) {
            tracing::error!(job_id = %job.id, error = %e, "bulk task cancel failed");
            return;
        }
        self.update_progress(job.id);
    }

    // ------------------------------------------------------------------
    // Task execution
    // ------------------------------------------------------------------

    async fn execute_task(self: Arc<Self>, job: Job, task: JobTask, scene_sem: Arc<Semaphore>) {
        // Global cap first, then the private scene pool; both release on exit
        // in reverse order.
        let Ok(_global) = Arc::clone(&self.global_sem).acquire_owned().await else {
            return;
        };
        let _scene = if task.task_type.is_scene_scoped() {
            match Arc::clone(&scene_sem).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            }
        } else {
            None
        };

        let worker_id = format!("worker-{}", &Uuid::new_v4().to_string()[..8]);
        self.apply_task(job.id, task.id, |t| t.begin(worker_id));

        let Ok(tasks) = self.store.get_job_tasks(job.id) else {
            return;
        };
        let Some(current) = tasks.into_iter().find(|t| t.id == task.id) else {
            return;
        };

        self.publish_event(
            &job,
            JobEventType::TaskStarted,
            json!({
                "task_id": current.id,
                "task_key": current.task_key,
                "task_type": current.task_type,
                "attempt": current.attempt,
                "display_name": current.display_name,
            }),
        );

        let max_attempt = current.max_attempt;
        let mut attempt = current.attempt.max(1);
        let mut last_error: Option<ProviderError> = None;

        loop {
            if self.is_job_canceled(job.id) {
                self.cancel_task(&job, &task, "Canceled during execution");
                return;
            }

            let cancel = CancellationToken::new();
            let watcher = tokio::spawn(Self::watch_cancel(
                Arc::clone(&self.store),
                job.id,
                cancel.clone(),
            ));

            let result = self
                .provider
                .execute(
                    cancel.clone(),
                    ExecuteInput {
                        user_id: job.user_id,
                        project_id: job.project_id,
                        job_id: job.id,
                        task_id: task.id,
                        task_type: task.task_type,
                        scene_index: task.scene_index,
                        trace_id: job.trace_id.clone(),
                        payload: task.input.clone(),
                    },
                )
                .await;

            // Stop the watcher and join it before acting on the result.
            cancel.cancel();
            let _ = watcher.await;

            match result {
                Ok(out) => {
                    self.apply_task(job.id, task.id, |t| t.succeed(out.output.clone()));
                    if let Some(generated) = out.asset {
                        let asset = Asset::from_generated(job.user_id, job.project_id, generated);
                        match self.store.create_asset(asset) {
                            Ok(asset) => self.publish_event(
                                &job,
                                JobEventType::AssetReady,
                                json!({ "asset_id": asset.id, "asset_type": asset.asset_type }),
                            ),
                            Err(e) => {
                                tracing::error!(job_id = %job.id, task_id = %task.id, error = %e, "asset persist failed");
                            }
                        }
                    }
                    self.publish_event(
                        &job,
                        JobEventType::TaskSucceeded,
                        json!({
                            "task_id": task.id,
                            "task_key": task.task_key,
                            "task_type": task.task_type,
                        }),
                    );
                    self.update_progress(job.id);
                    return;
                }
                Err(err) if err.is_canceled() => {
                    // Cancellation is a distinguished terminal state, not a failure.
                    self.cancel_task(&job, &task, "Canceled during execution");
                    return;
                }
                Err(err) => {
                    let retryable = err.retryable;
                    last_error = Some(err);
                    if !retryable || attempt >= max_attempt {
                        break;
                    }
                    if !self.sleep_with_cancel(job.id, retry_backoff(attempt)).await {
                        self.cancel_task(&job, &task, "Canceled during backoff");
                        return;
                    }
                    attempt += 1;
                    self.apply_task(job.id, task.id, |t| {
                        t.attempt += 1;
                        Ok(())
                    });
                }
            }
        }

        let err = last_error.unwrap_or_else(|| ProviderError {
            category: ErrorCategory::Unknown,
            code: "UNKNOWN".to_string(),
            retryable: false,
            user_message: "Unknown failure".to_string(),
            internal_message: "provider returned no error".to_string(),
        });
        self.apply_task(job.id, task.id, |t| {
            t.fail(err.code.clone(), err.internal_message.clone(), err.retryable)
        });
        self.publish_event(
            &job,
            JobEventType::TaskFailed,
            json!({
                "task_id": task.id,
                "task_key": task.task_key,
                "task_type": task.task_type,
                "error_code": err.code,
                "retryable": err.retryable,
                "user_message": err.user_message,
            }),
        );
        tracing::warn!(
            job_id = %job.id,
            task_key = %task.task_key,
            error_code = %err.code,
            retryable = err.retryable,
            "task failed"
        );
        self.update_progress(job.id);
    }

    /// Poll `cancel_requested` alongside a provider call and trip the call's
    /// cancel token once it flips. Exits when the token is canceled, either
    /// by this watcher or by the caller after the provider returns.
    async fn watch_cancel(store: Arc<MemoryStore>, job_id: Uuid, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(CANCEL_POLL) => {
                    let requested = store
                        .get_job(job_id)
                        .map(|j| j.cancel_requested)
                        .unwrap_or(true);
                    if requested {
                        cancel.cancel();
                        return;
                    }
                }
            }
        }
    }

    /// Sleep for `duration`, checking cancellation every poll interval.
    /// Returns false if the job was canceled before the sleep completed.
    async fn sleep_with_cancel(&self, job_id: Uuid, duration: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if self.is_job_canceled(job_id) {
                return false;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep(CANCEL_POLL.min(deadline - now)).await;
        }
    }

    fn is_job_canceled(&self, job_id: Uuid) -> bool {
        self.store
            .get_job(job_id)
            .map(|j| j.cancel_requested)
            .unwrap_or(true)
    }

    fn cancel_task(&self, job: &Job, task: &JobTask, message: &str) {
        let message = message.to_string();
        self.apply_task(job.id, task.id, |t| t.cancel(message));
        self.update_progress(job.id);
    }

    /// Read-modify-replace of a single task under the store lock. Correct
    /// because exactly one runner (and its spawned workers, serialized
    /// through this helper) mutates a given job's tasks.
    fn apply_task(
        &self,
        job_id: Uuid,
        task_id: Uuid,
        f: impl FnOnce(&mut JobTask) -> std::result::Result<(), StateError>,
    ) {
        let result = (|| -> Result<()> {
            let mut tasks = self.store.get_job_tasks(job_id)?;
            let task = tasks
                .iter_mut()
                .find(|t| t.id == task_id)
                .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
            f(task).map_err(|e| Error::Internal(format!("task transition rejected: {e}")))?;
            self.store.replace_job_tasks(job_id, tasks)
        })();
        if let Err(e) = result {
            tracing::error!(job_id = %job_id, task_id = %task_id, error = %e, "task update failed");
        }
    }

    // ------------------------------------------------------------------
    // Finalization & progress
    // ------------------------------------------------------------------

    fn finalize_job(&self, mut job: Job, tasks: &[JobTask]) {
        let has_failed = tasks.iter().any(|t| t.status == TaskStatus::Failed);
        let has_canceled = tasks.iter().any(|t| t.status == TaskStatus::Canceled);

        let transition = if has_failed {
            job.fail("TASK_FAILED", "One or more tasks failed", true)
        } else if job.cancel_requested || has_canceled {
            job.cancel()
        } else {
            job.succeed()
        };
        if let Err(e) = transition {
            tracing::error!(job_id = %job.id, error = %e, "job finalization rejected");
            return;
        }

        job.progress = calc_progress(tasks);
        if let Err(e) = self.store.update_job(job.clone()) {
            tracing::error!(job_id = %job.id, error = %e, "job finalization persist failed");
            return;
        }

        match self.store.get_project(job.project_id) {
            Ok(mut project) => {
                project.status = job.status.to_string();
                project.updated_at = Utc::now();
                if let Err(e) = self.store.update_project(project) {
                    tracing::warn!(job_id = %job.id, error = %e, "project status update failed");
                }
            }
            Err(e) => tracing::warn!(job_id = %job.id, error = %e, "project lookup failed"),
        }

        let (event_type, payload) = match job.status {
            JobStatus::Succeeded => (
                JobEventType::JobSucceeded,
                json!({ "status": job.status, "progress": job.progress }),
            ),
            JobStatus::Canceled => (
                JobEventType::JobCanceled,
                json!({ "status": job.status, "progress": job.progress }),
            ),
            _ => (
                JobEventType::JobFailed,
                json!({
                    "status": job.status,
                    "progress": job.progress,
                    "error_code": job.error_code,
                    "error_message": job.error_message,
                }),
            ),
        };
        self.publish_event(&job, event_type, payload);
        tracing::info!(job_id = %job.id, status = %job.status, "job finalized");
    }

    /// Recompute and persist progress, then publish `job_progress`
    fn update_progress(&self, job_id: Uuid) {
        let Ok(mut job) = self.store.get_job(job_id) else {
            return;
        };
        let Ok(tasks) = self.store.get_job_tasks(job_id) else {
            return;
        };
        job.progress = calc_progress(&tasks);
        if let Err(e) = self.store.update_job(job.clone()) {
            tracing::error!(job_id = %job_id, error = %e, "progress persist failed");
            return;
        }
        self.publish_event(
            &job,
            JobEventType::JobProgress,
            json!({ "status": job.status, "progress": job.progress }),
        );
    }

    fn publish_event(&self, job: &Job, event_type: JobEventType, payload: serde_json::Value) {
        match self.store.append_job_event(
            job.id,
            NewJobEvent {
                trace_id: job.trace_id.clone(),
                project_id: job.project_id,
                event_type,
                payload,
            },
        ) {
            Ok(record) => self.hub.publish(job.id, &record),
            Err(e) => {
                tracing::error!(job_id = %job.id, event_type = %event_type, error = %e, "append event failed");
            }
        }
    }
}

/// Ready = queued, past `next_run_at`, and every dependency succeeded
fn ready_tasks(tasks: &[JobTask]) -> Vec<JobTask> {
    let succeeded: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Succeeded)
        .map(|t| t.task_key.as_str())
        .collect();
    let now = Utc::now();
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Queued)
        .filter(|t| t.next_run_at.map_or(true, |at| at <= now))
        .filter(|t| t.depends_on.iter().all(|dep| succeeded.contains(dep.as_str())))
        .cloned()
        .collect()
}

/// progress = terminal tasks / total tasks
fn calc_progress(tasks: &[JobTask]) -> f64 {
    if tasks.is_empty() {
        return 0.0;
    }
    let done = tasks.iter().filter(|t| t.is_terminal()).count();
    done as f64 / tasks.len() as f64
}

/// `1s * 2^(attempt-1)` plus a uniform jitter in `[0, backoff/5)`, where
/// `attempt` is the attempt that just failed (starting at 1): ~1s, ~2s, ~4s.
fn retry_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = Duration::from_secs(1) * 2u32.pow(exponent);
    let jitter_ms = (base / 5).as_millis() as u64;
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms.max(1)));
    base + jitter
}
