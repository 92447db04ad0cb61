//! Shared fixtures for jobs engine integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use storyreel_jobs::{
    EngineLimits, EventHub, Job, JobEventRecord, MemoryStore, Project, Scheduler,
};
use storyreel_provider::{
    AssetType, ErrorCategory, ExecuteInput, ExecuteOutput, GeneratedAsset, Provider, ProviderError,
    TaskType,
};

pub struct Engine {
    pub store: Arc<MemoryStore>,
    pub hub: Arc<EventHub>,
    pub scheduler: Arc<Scheduler>,
}

pub fn test_limits() -> EngineLimits {
    EngineLimits {
        max_concurrent_tasks: 20,
        max_user_jobs: 2,
        max_scene_workers: 6,
    }
}

pub fn build_engine(provider: Arc<dyn Provider>, limits: EngineLimits) -> Engine {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(EventHub::new());
    let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&hub), provider, limits);
    Engine { store, hub, scheduler }
}

pub fn seed_project(store: &MemoryStore, user_id: Uuid, scene_count: u32) -> Project {
    let now = Utc::now();
    store
        .create_project(Project {
            id: Uuid::new_v4(),
            user_id,
            name: "test".to_string(),
            story_text: "story".to_string(),
            style: "cinematic".to_string(),
            scene_count,
            status: "draft".to_string(),
            current_job_id: None,
            created_at: now,
            updated_at: now,
        })
        .unwrap()
}

/// Poll the store until the job satisfies `pred`, panicking past `deadline`
pub async fn wait_for(
    store: &MemoryStore,
    job_id: Uuid,
    deadline: Duration,
    pred: impl Fn(&Job) -> bool,
) -> Job {
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if let Ok(job) = store.get_job(job_id) {
            if pred(&job) {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < end,
                "job {job_id} did not reach expected state before timeout (status {})",
                job.status
            );
        } else {
            assert!(tokio::time::Instant::now() < end, "job {job_id} not found before timeout");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub fn events_of(store: &MemoryStore, job_id: Uuid) -> Vec<JobEventRecord> {
    store.list_job_events_from_seq(job_id, 0).unwrap()
}

/// Assert the event log's seq is exactly 1..=n
pub fn assert_contiguous_seq(events: &[JobEventRecord]) {
    let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
    let expected: Vec<i64> = (1..=events.len() as i64).collect();
    assert_eq!(seqs, expected, "event seq must be gap-free from 1");
}

/// A successful provider result with an asset matching the task type
pub fn success_output(input: &ExecuteInput) -> ExecuteOutput {
    let (asset_type, mime_type, size_bytes) = match input.task_type {
        TaskType::StoryboardGenerate => (AssetType::StoryboardJson, "application/json", 512),
        TaskType::ImageGenerate => (AssetType::Image, "image/png", 2048),
        TaskType::TtsGenerate => (AssetType::Audio, "audio/mpeg", 1024),
        TaskType::ComposeVideo => (AssetType::FinalVideo, "video/mp4", 8192),
    };
    ExecuteOutput {
        output: serde_json::json!({ "ok": true }),
        asset: Some(GeneratedAsset {
            asset_type,
            storage_key: format!("test/{}/{}", input.job_id, Uuid::new_v4()),
            mime_type: mime_type.to_string(),
            size_bytes,
            duration_ms: None,
            metadata: serde_json::json!({}),
            expires_at: Utc::now() + chrono::Duration::days(7),
        }),
    }
}

fn retryable_timeout() -> ProviderError {
    ProviderError {
        category: ErrorCategory::Network,
        code: "UPSTREAM_TIMEOUT".to_string(),
        retryable: true,
        user_message: "Upstream timeout".to_string(),
        internal_message: "scripted transient failure".to_string(),
    }
}

/// Succeeds immediately unless the cancel token already fired
pub struct InstantProvider;

#[async_trait::async_trait]
impl Provider for InstantProvider {
    async fn execute(
        &self,
        cancel: CancellationToken,
        input: ExecuteInput,
    ) -> Result<ExecuteOutput, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::canceled("token fired before work"));
        }
        Ok(success_output(&input))
    }
}

/// Returns only once its cancel token triggers (10s success fallback)
pub struct BlockingProvider;

#[async_trait::async_trait]
impl Provider for BlockingProvider {
    async fn execute(
        &self,
        cancel: CancellationToken,
        input: ExecuteInput,
    ) -> Result<ExecuteOutput, ProviderError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::canceled("cancel token fired")),
            _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(success_output(&input)),
        }
    }
}

/// Fails the first `image_generate_0` attempt with a retryable error and
/// records every invocation instant for that task
#[derive(Default)]
pub struct FlakyImageProvider {
    failed_once: AtomicBool,
    pub image_calls: Mutex<Vec<Instant>>,
}

#[async_trait::async_trait]
impl Provider for FlakyImageProvider {
    async fn execute(
        &self,
        _cancel: CancellationToken,
        input: ExecuteInput,
    ) -> Result<ExecuteOutput, ProviderError> {
        if input.task_type == TaskType::ImageGenerate && input.scene_index == Some(0) {
            self.image_calls.lock().unwrap().push(Instant::now());
            if !self.failed_once.swap(true, Ordering::SeqCst) {
                return Err(retryable_timeout());
            }
        }
        Ok(success_output(&input))
    }
}

/// Fails `compose_video` with a non-retryable provider error
pub struct FailingComposeProvider;

#[async_trait::async_trait]
impl Provider for FailingComposeProvider {
    async fn execute(
        &self,
        _cancel: CancellationToken,
        input: ExecuteInput,
    ) -> Result<ExecuteOutput, ProviderError> {
        if input.task_type == TaskType::ComposeVideo {
            return Err(ProviderError {
                category: ErrorCategory::Provider,
                code: "RENDER_REJECTED".to_string(),
                retryable: false,
                user_message: "Render rejected".to_string(),
                internal_message: "scripted non-retryable failure".to_string(),
            });
        }
        Ok(success_output(&input))
    }
}

/// Tracks peak provider-call concurrency, overall and for scene tasks
#[derive(Default)]
pub struct CountingProvider {
    in_flight: AtomicUsize,
    scene_in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub max_scene_in_flight: AtomicUsize,
}

#[async_trait::async_trait]
impl Provider for CountingProvider {
    async fn execute(
        &self,
        _cancel: CancellationToken,
        input: ExecuteInput,
    ) -> Result<ExecuteOutput, ProviderError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let scene = input.task_type.is_scene_scoped();
        if scene {
            let now = self.scene_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_scene_in_flight.fetch_max(now, Ordering::SeqCst);
        }

        tokio::time::sleep(Duration::from_millis(200)).await;

        if scene {
            self.scene_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(success_output(&input))
    }
}
