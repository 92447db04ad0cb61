//! State machines for Jobs domain entities
//!
//! Jobs and tasks share the same rule: status progresses monotonically from
//! `queued` through `running` into exactly one terminal state, and the only
//! back-edge is an explicit requeue issued by a retry.

use thiserror::Error;

/// Errors that can occur during state transitions
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StateError {
    #[error("Invalid transition: cannot apply '{event}' from '{from}'")]
    InvalidTransition { from: String, event: String },

    #[error("Terminal state: {0} cannot transition except via requeue")]
    TerminalState(String),
}

// ============================================================================
// Job State Machine
// ============================================================================

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// Events that trigger job state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTransition {
    /// The runner picks the job up for its first iteration
    Start,
    /// All tasks terminal, none failed or canceled
    Succeed,
    /// At least one task failed
    Fail,
    /// Cancellation observed at finalization
    Cancel,
    /// Retry resets a terminal failed/canceled job
    Requeue,
}

impl std::fmt::Display for JobTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Succeed => write!(f, "succeed"),
            Self::Fail => write!(f, "fail"),
            Self::Cancel => write!(f, "cancel"),
            Self::Requeue => write!(f, "requeue"),
        }
    }
}

/// Job state machine
pub struct JobStateMachine;

impl JobStateMachine {
    /// Attempt a state transition.
    ///
    /// Returns the new state if the transition is valid, or an error otherwise.
    pub fn transition(current: JobState, event: JobTransition) -> Result<JobState, StateError> {
        let next = match (current, event) {
            (JobState::Queued, JobTransition::Start) => JobState::Running,
            (JobState::Queued, JobTransition::Cancel) => JobState::Canceled,

            (JobState::Running, JobTransition::Succeed) => JobState::Succeeded,
            (JobState::Running, JobTransition::Fail) => JobState::Failed,
            (JobState::Running, JobTransition::Cancel) => JobState::Canceled,

            (JobState::Failed, JobTransition::Requeue) => JobState::Queued,
            (JobState::Canceled, JobTransition::Requeue) => JobState::Queued,

            (from, _) if from.is_terminal() => {
                return Err(StateError::TerminalState(from.to_string()));
            }
            (from, event) => {
                return Err(StateError::InvalidTransition {
                    from: from.to_string(),
                    event: event.to_string(),
                });
            }
        };

        Ok(next)
    }
}

// ============================================================================
// Task State Machine
// ============================================================================

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskState {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// Events that trigger task state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTransition {
    /// A worker begins an attempt
    Start,
    /// Provider call returned output
    Succeed,
    /// Attempts exhausted or non-retryable provider error
    Fail,
    /// Cancellation observed before or during execution
    Cancel,
    /// Retry resets a terminal failed/canceled task
    Requeue,
}

impl std::fmt::Display for TaskTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Succeed => write!(f, "succeed"),
            Self::Fail => write!(f, "fail"),
            Self::Cancel => write!(f, "cancel"),
            Self::Requeue => write!(f, "requeue"),
        }
    }
}

/// Task state machine
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Attempt a state transition.
    pub fn transition(current: TaskState, event: TaskTransition) -> Result<TaskState, StateError> {
        let next = match (current, event) {
            (TaskState::Queued, TaskTransition::Start) => TaskState::Running,
            (TaskState::Queued, TaskTransition::Cancel) => TaskState::Canceled,

            (TaskState::Running, TaskTransition::Succeed) => TaskState::Succeeded,
            (TaskState::Running, TaskTransition::Fail) => TaskState::Failed,
            (TaskState::Running, TaskTransition::Cancel) => TaskState::Canceled,

            (TaskState::Failed, TaskTransition::Requeue) => TaskState::Queued,
            (TaskState::Canceled, TaskTransition::Requeue) => TaskState::Queued,

            (from, _) if from.is_terminal() => {
                return Err(StateError::TerminalState(from.to_string()));
            }
            (from, event) => {
                return Err(StateError::InvalidTransition {
                    from: from.to_string(),
                    event: event.to_string(),
                });
            }
        };

        Ok(next)
    }
}

// ============================================================================
// Tests
// ============================================================================
