//! Mock generative backend
//!
//! Simulates the latency profile and artifact shapes of the real pipeline
//! without touching GPU compute or object storage. Supports a
//! `simulate_error` flag in the task payload for deterministic failure
//! injection, plus a small random transient-failure rate.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    AssetType, ErrorCategory, ExecuteInput, ExecuteOutput, GeneratedAsset, Provider, ProviderError,
    TaskType,
};

/// Fraction of calls that fail with a retryable upstream error
const TRANSIENT_FAILURE_RATE: f64 = 0.03;

/// Mock provider for testing and development
#[derive(Debug, Clone, Default)]
pub struct MockProvider;

impl MockProvider {
    pub fn new() -> Self {
        Self
    }

    fn work_duration(task_type: TaskType) -> Duration {
        match task_type {
            TaskType::StoryboardGenerate => Duration::from_millis(700),
            TaskType::ImageGenerate => Duration::from_millis(1200),
            TaskType::TtsGenerate => Duration::from_millis(800),
            TaskType::ComposeVideo => Duration::from_millis(1600),
        }
    }
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    async fn execute(
        &self,
        cancel: CancellationToken,
        input: ExecuteInput,
    ) -> Result<ExecuteOutput, ProviderError> {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ProviderError::canceled("cancel token fired during mock work"));
            }
            _ = tokio::time::sleep(Self::work_duration(input.task_type)) => {}
        }

        if input
            .payload
            .get("simulate_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return Err(ProviderError {
                category: ErrorCategory::Network,
                code: "UPSTREAM_TIMEOUT".to_string(),
                retryable: true,
                user_message: "Upstream timeout".to_string(),
                internal_message: "mock simulate_error=true".to_string(),
            });
        }

        if rand::thread_rng().gen_bool(TRANSIENT_FAILURE_RATE) {
            return Err(ProviderError {
                category: ErrorCategory::Network,
                code: "UPSTREAM_5XX".to_string(),
                retryable: true,
                user_message: "Service temporarily unavailable".to_string(),
                internal_message: "mock random failure".to_string(),
            });
        }

        let now = Utc::now();
        let expires_at = now + chrono::Duration::days(30);
        let key_prefix = format!("users/{}/projects/{}", input.user_id, input.project_id);

        let asset = match input.task_type {
            TaskType::StoryboardGenerate => GeneratedAsset {
                asset_type: AssetType::StoryboardJson,
                storage_key: format!("{key_prefix}/storyboard_json/{}.json", Uuid::new_v4()),
                mime_type: "application/json".to_string(),
                size_bytes: 1024,
                duration_ms: None,
                metadata: serde_json::json!({ "scene_count_hint": 4 }),
                expires_at,
            },
            TaskType::ImageGenerate => GeneratedAsset {
                asset_type: AssetType::Image,
                storage_key: format!("{key_prefix}/image/{}.png", Uuid::new_v4()),
                mime_type: "image/png".to_string(),
                size_bytes: 220_000,
                duration_ms: None,
                metadata: serde_json::json!({ "scene_index": input.scene_index }),
                expires_at,
            },
            TaskType::TtsGenerate => GeneratedAsset {
                asset_type: AssetType::Audio,
                storage_key: format!("{key_prefix}/audio/{}.mp3", Uuid::new_v4()),
                mime_type: "audio/mpeg".to_string(),
                size_bytes: 120_000,
                duration_ms: Some(4000),
                metadata: serde_json::json!({ "scene_index": input.scene_index }),
                expires_at,
            },
            TaskType::ComposeVideo => GeneratedAsset {
                asset_type: AssetType::FinalVideo,
                storage_key: format!("{key_prefix}/final_video/{}.mp4", Uuid::new_v4()),
                mime_type: "video/mp4".to_string(),
                size_bytes: 2_000_000,
                duration_ms: Some(12_000),
                metadata: serde_json::json!({ "codec": "h264" }),
                expires_at,
            },
        };

        Ok(ExecuteOutput {
            output: serde_json::json!({
                "provider": "mock",
                "task_type": input.task_type,
            }),
            asset: Some(asset),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(task_type: TaskType, payload: serde_json::Value) -> ExecuteInput {
        ExecuteInput {
            user_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            task_type,
            scene_index: Some(0),
            trace_id: "trace-mock".to_string(),
            payload,
        }
    }

    #[tokio::test]
    async fn test_simulate_error_is_retryable_timeout() {
        let provider = MockProvider::new();
        let err = provider
            .execute(
                CancellationToken::new(),
                input(TaskType::StoryboardGenerate, serde_json::json!({"simulate_error": true})),
            )
            .await
            .expect_err("simulate_error must fail");
        assert_eq!(err.code, "UPSTREAM_TIMEOUT");
        assert!(err.retryable);
        assert_eq!(err.category, ErrorCategory::Network);
    }

    #[tokio::test]
    async fn test_pre_canceled_token_yields_canceled_error() {
        let provider = MockProvider::new();
        let token = CancellationToken::new();
        token.cancel();
        let err = provider
            .execute(token, input(TaskType::ComposeVideo, serde_json::json!({})))
            .await
            .expect_err("canceled token must fail");
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn test_each_task_type_produces_expected_asset() {
        let provider = MockProvider::new();
        let cases = [
            (TaskType::StoryboardGenerate, AssetType::StoryboardJson, "application/json"),
            (TaskType::ImageGenerate, AssetType::Image, "image/png"),
            (TaskType::TtsGenerate, AssetType::Audio, "audio/mpeg"),
            (TaskType::ComposeVideo, AssetType::FinalVideo, "video/mp4"),
        ];
        for (task_type, asset_type, mime) in cases {
            // Retry through the random transient failures.
            let out = loop {
                match provider
                    .execute(CancellationToken::new(), input(task_type, serde_json::json!({})))
                    .await
                {
                    Ok(out) => break out,
                    Err(e) => assert!(e.retryable, "unexpected non-retryable error: {e}"),
                }
            };
            let asset = out.asset.expect("mock always produces an asset");
            assert_eq!(asset.asset_type, asset_type);
            assert_eq!(asset.mime_type, mime);
            assert!(asset.size_bytes > 0);
        }
    }
}
