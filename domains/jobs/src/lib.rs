//! Jobs domain: the Storyreel job execution engine
//!
//! Turns a story project into a rendered video by driving a dependency graph
//! of generative tasks. The pieces:
//!
//! - [`domain`]: entities and the job/task state machines
//! - [`store`]: transactional in-memory persistence with a gap-free per-job
//!   event log and a user-scoped idempotency index
//! - [`hub`]: non-blocking in-process fan-out of job events to subscribers
//! - [`engine`]: the task graph builder and the scheduler/runner
//! - [`api`]: the jobs HTTP surface, including the resumable SSE event feed

pub mod api;
pub mod domain;
pub mod engine;
pub mod hub;
pub mod store;

pub use api::middleware::{AuthConfig, Claims, CurrentUser, JobsState};
pub use api::routes::routes;
pub use domain::entities::*;
pub use domain::state::{JobStateMachine, StateError, TaskStateMachine};
pub use engine::scheduler::{EngineLimits, Scheduler};
pub use hub::{EventHub, Subscription};
pub use store::MemoryStore;
