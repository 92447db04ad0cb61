//! Storyreel Provider Port
//!
//! The abstract capability invoked once per task attempt by the job engine:
//! - Contract types shared with the jobs domain (task and asset kinds)
//! - Classified provider errors driving the engine's retry decisions
//! - `Provider` trait implemented by generative backends
//! - Mock backend for testing and development

pub mod mock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Task kinds the engine can schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    StoryboardGenerate,
    ImageGenerate,
    TtsGenerate,
    ComposeVideo,
}

impl TaskType {
    /// Scene-level tasks are additionally bounded by the per-job scene pool
    pub fn is_scene_scoped(&self) -> bool {
        matches!(self, TaskType::ImageGenerate | TaskType::TtsGenerate)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::StoryboardGenerate => write!(f, "storyboard_generate"),
            TaskType::ImageGenerate => write!(f, "image_generate"),
            TaskType::TtsGenerate => write!(f, "tts_generate"),
            TaskType::ComposeVideo => write!(f, "compose_video"),
        }
    }
}

/// Artifact kinds a provider call can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    StoryboardJson,
    Image,
    Audio,
    VideoClip,
    FinalVideo,
    Thumbnail,
}

impl std::fmt::Display for AssetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetType::StoryboardJson => write!(f, "storyboard_json"),
            AssetType::Image => write!(f, "image"),
            AssetType::Audio => write!(f, "audio"),
            AssetType::VideoClip => write!(f, "video_clip"),
            AssetType::FinalVideo => write!(f, "final_video"),
            AssetType::Thumbnail => write!(f, "thumbnail"),
        }
    }
}

/// Coarse classification of a provider failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Provider,
    Validation,
    Canceled,
    Unknown,
}

/// Classified provider error
///
/// `retryable` drives the engine's backoff loop; `user_message` is safe to
/// surface in events, `internal_message` is for logs only.
#[derive(Debug, Clone, Error)]
#[error("{category:?}/{code}: {internal_message}")]
pub struct ProviderError {
    pub category: ErrorCategory,
    pub code: String,
    pub retryable: bool,
    pub user_message: String,
    pub internal_message: String,
}

impl ProviderError {
    /// Build the canonical cancellation error returned when the cancel token
    /// fires mid-call.
    pub fn canceled(internal_message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Canceled,
            code: "CANCELED".to_string(),
            retryable: false,
            user_message: "Task canceled".to_string(),
            internal_message: internal_message.into(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.category == ErrorCategory::Canceled
    }
}

/// Input for a single provider invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteInput {
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub scene_index: Option<u32>,
    pub trace_id: String,
    pub payload: serde_json::Value,
}

/// An artifact produced by a successful provider call.
///
/// The engine assigns identity and ownership when persisting; the provider
/// only describes what it stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedAsset {
    pub asset_type: AssetType,
    pub storage_key: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub duration_ms: Option<i64>,
    pub metadata: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

/// Result of a successful provider invocation
#[derive(Debug, Clone, Default)]
pub struct ExecuteOutput {
    pub output: serde_json::Value,
    pub asset: Option<GeneratedAsset>,
}

/// Generative backend invoked per task attempt.
///
/// Implementations must honor the cancel token (returning a `canceled`
/// classified error once cancellation is observed) and must be safe for
/// concurrent calls.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    async fn execute(
        &self,
        cancel: CancellationToken,
        input: ExecuteInput,
    ) -> Result<ExecuteOutput, ProviderError>;
}

/// Errors raised while constructing a provider backend
#[derive(Debug, Error)]
pub enum ProviderConfigError {
    #[error("Unknown provider: {0}. Supported providers: mock")]
    UnknownProvider(String),
}

/// Factory for creating Provider implementations
pub struct ProviderFactory;

impl ProviderFactory {
    pub fn create(name: &str) -> Result<Box<dyn Provider>, ProviderConfigError> {
        match name {
            "mock" => {
                tracing::info!("Creating mock generative provider");
                Ok(Box::new(mock::MockProvider::new()))
            }
            other => Err(ProviderConfigError::UnknownProvider(other.to_string())),
        }
    }
}
