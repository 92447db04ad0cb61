//! Job domain entities for Storyreel
//!
//! The engine-facing data model: jobs, their task DAG, the append-only event
//! log, produced assets, and the engine-facing slice of projects. Status
//! mutations go through the state machines in [`crate::domain::state`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use storyreel_provider::{AssetType, GeneratedAsset, TaskType};

use crate::domain::state::{
    JobState, JobStateMachine, JobTransition, StateError, TaskState, TaskStateMachine,
    TaskTransition,
};

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Check if status is terminal (job has finished)
    pub fn is_terminal(&self) -> bool {
        self.to_state().is_terminal()
    }

    /// Convert to state machine state
    pub fn to_state(&self) -> JobState {
        match self {
            JobStatus::Queued => JobState::Queued,
            JobStatus::Running => JobState::Running,
            JobStatus::Succeeded => JobState::Succeeded,
            JobStatus::Failed => JobState::Failed,
            JobStatus::Canceled => JobState::Canceled,
        }
    }

    /// Create from state machine state
    pub fn from_state(state: JobState) -> Self {
        match state {
            JobState::Queued => JobStatus::Queued,
            JobState::Running => JobStatus::Running,
            JobState::Succeeded => JobStatus::Succeeded,
            JobState::Failed => JobStatus::Failed,
            JobState::Canceled => JobStatus::Canceled,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_state())
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        self.to_state().is_terminal()
    }

    pub fn to_state(&self) -> TaskState {
        match self {
            TaskStatus::Queued => TaskState::Queued,
            TaskStatus::Running => TaskState::Running,
            TaskStatus::Succeeded => TaskState::Succeeded,
            TaskStatus::Failed => TaskState::Failed,
            TaskStatus::Canceled => TaskState::Canceled,
        }
    }

    pub fn from_state(state: TaskState) -> Self {
        match state {
            TaskState::Queued => TaskStatus::Queued,
            TaskState::Running => TaskStatus::Running,
            TaskState::Succeeded => TaskStatus::Succeeded,
            TaskState::Failed => TaskStatus::Failed,
            TaskState::Canceled => TaskStatus::Canceled,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_state())
    }
}

/// Job entity: a unit of user-visible work spanning the task DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub status: JobStatus,
    /// terminal_task_count / total_task_count, recomputed at every terminal
    /// task transition and at finalization
    pub progress: f64,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retryable: bool,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new queued job
    pub fn new(
        user_id: Uuid,
        project_id: Uuid,
        trace_id: String,
        idempotency_key: Option<String>,
    ) -> Self {
        Job {
            id: Uuid::new_v4(),
            user_id,
            project_id,
            status: JobStatus::default(),
            progress: 0.0,
            cancel_requested: false,
            error_code: None,
            error_message: None,
            retryable: false,
            trace_id,
            idempotency_key,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// First runner iteration: queued -> running
    pub fn start(&mut self) -> Result<(), StateError> {
        self.status = self.apply(JobTransition::Start)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Finalize successfully
    pub fn succeed(&mut self) -> Result<(), StateError> {
        self.status = self.apply(JobTransition::Succeed)?;
        self.error_code = None;
        self.error_message = None;
        self.retryable = false;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Finalize as failed
    pub fn fail(
        &mut self,
        code: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Result<(), StateError> {
        self.status = self.apply(JobTransition::Fail)?;
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self.retryable = retryable;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Finalize as canceled
    pub fn cancel(&mut self) -> Result<(), StateError> {
        self.status = self.apply(JobTransition::Cancel)?;
        self.error_code = Some("CANCELED".to_string());
        self.error_message = Some("Canceled by user".to_string());
        self.retryable = false;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Retry: reset a terminal failed/canceled job back to queued with a
    /// fresh trace
    pub fn requeue(&mut self, trace_id: String) -> Result<(), StateError> {
        self.status = self.apply(JobTransition::Requeue)?;
        self.cancel_requested = false;
        self.error_code = None;
        self.error_message = None;
        self.retryable = false;
        self.trace_id = trace_id;
        self.started_at = None;
        self.ended_at = None;
        Ok(())
    }

    fn apply(&self, event: JobTransition) -> Result<JobStatus, StateError> {
        JobStateMachine::transition(self.status.to_state(), event).map(JobStatus::from_state)
    }
}

/// Task entity: a node in the job's dependency graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTask {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Stable logical name, unique within the job, referenced by `depends_on`
    pub task_key: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub attempt: u32,
    pub max_attempt: u32,
    pub depends_on: Vec<String>,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retryable: bool,
    /// Earliest eligibility; `None` means eligible now
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub project_id: Uuid,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_index: Option<u32>,
    pub display_name: String,
}

impl JobTask {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// A worker begins an attempt: queued -> running, attempt incremented
    pub fn begin(&mut self, worker_id: String) -> Result<(), StateError> {
        self.status = self.apply(TaskTransition::Start)?;
        self.attempt += 1;
        self.started_at = Some(Utc::now());
        self.worker_id = Some(worker_id);
        Ok(())
    }

    pub fn succeed(&mut self, output: serde_json::Value) -> Result<(), StateError> {
        self.status = self.apply(TaskTransition::Succeed)?;
        self.output = output;
        self.error_code = None;
        self.error_message = None;
        self.retryable = false;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(
        &mut self,
        code: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Result<(), StateError> {
        self.status = self.apply(TaskTransition::Fail)?;
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self.retryable = retryable;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn cancel(&mut self, message: impl Into<String>) -> Result<(), StateError> {
        self.status = self.apply(TaskTransition::Cancel)?;
        self.error_code = Some("CANCELED".to_string());
        self.error_message = Some(message.into());
        self.retryable = false;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Retry: reset back to queued. `attempt` deliberately carries over.
    pub fn requeue(&mut self) -> Result<(), StateError> {
        self.status = self.apply(TaskTransition::Requeue)?;
        self.error_code = None;
        self.error_message = None;
        self.retryable = false;
        self.next_run_at = None;
        self.started_at = None;
        self.ended_at = None;
        self.worker_id = None;
        Ok(())
    }

    fn apply(&self, event: TaskTransition) -> Result<TaskStatus, StateError> {
        TaskStateMachine::transition(self.status.to_state(), event).map(TaskStatus::from_state)
    }
}

/// Event types emitted on the per-job log and the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    JobCreated,
    JobProgress,
    TaskStarted,
    TaskSucceeded,
    TaskFailed,
    JobSucceeded,
    JobCanceled,
    JobFailed,
    AssetReady,
}

impl JobEventType {
    /// Terminal job events close live streams
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEventType::JobSucceeded | JobEventType::JobCanceled | JobEventType::JobFailed
        )
    }
}

impl std::fmt::Display for JobEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobEventType::JobCreated => write!(f, "job_created"),
            JobEventType::JobProgress => write!(f, "job_progress"),
            JobEventType::TaskStarted => write!(f, "task_started"),
            JobEventType::TaskSucceeded => write!(f, "task_succeeded"),
            JobEventType::TaskFailed => write!(f, "task_failed"),
            JobEventType::JobSucceeded => write!(f, "job_succeeded"),
            JobEventType::JobCanceled => write!(f, "job_canceled"),
            JobEventType::JobFailed => write!(f, "job_failed"),
            JobEventType::AssetReady => write!(f, "asset_ready"),
        }
    }
}

/// An event to append; the store assigns `event_id` and `seq`
#[derive(Debug, Clone)]
pub struct NewJobEvent {
    pub trace_id: String,
    pub project_id: Uuid,
    pub event_type: JobEventType,
    pub payload: serde_json::Value,
}

/// An immutable record on a job's append-only event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEventRecord {
    pub event_id: Uuid,
    /// Strictly increasing 1,2,... within the job, gap-free
    pub seq: i64,
    pub trace_id: String,
    pub job_id: Uuid,
    pub project_id: Uuid,
    pub event_type: JobEventType,
    pub ts: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// A produced artifact referenced by a task's success
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub user_id: Uuid,
    pub project_id: Uuid,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    pub storage_key: String,
    pub mime_type: String,
    pub size_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub metadata: serde_json::Value,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Asset {
    /// Promote a provider-generated artifact into an owned asset record
    pub fn from_generated(user_id: Uuid, project_id: Uuid, generated: GeneratedAsset) -> Self {
        Asset {
            id: Uuid::new_v4(),
            user_id,
            project_id,
            asset_type: generated.asset_type,
            storage_key: generated.storage_key,
            mime_type: generated.mime_type,
            size_bytes: generated.size_bytes,
            duration_ms: generated.duration_ms,
            metadata: generated.metadata,
            expires_at: generated.expires_at,
            created_at: Utc::now(),
        }
    }
}

/// Engine-facing slice of a project: enough to build the task graph and to
/// reflect job status back onto the project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub story_text: String,
    pub style: String,
    pub scene_count: u32,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
