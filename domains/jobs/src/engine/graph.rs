//! Task graph builder
//!
//! A project with N scenes becomes exactly `2 + 2N` tasks: one storyboard
//! root, an image and a narration task per scene (both depending on the
//! storyboard), and one compose sink depending on every scene task.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use storyreel_provider::TaskType;

use crate::domain::entities::{Job, JobTask, Project, TaskStatus};

/// Root of every job graph
pub const STORYBOARD_KEY: &str = "storyboard_generate";
/// Single sink of every job graph
pub const COMPOSE_KEY: &str = "compose_video";

/// Tasks get three attempts by default
const DEFAULT_MAX_ATTEMPT: u32 = 3;

fn task(
    job: &Job,
    task_key: String,
    task_type: TaskType,
    depends_on: Vec<String>,
    input: serde_json::Value,
    scene_index: Option<u32>,
    display_name: String,
) -> JobTask {
    JobTask {
        id: Uuid::new_v4(),
        job_id: job.id,
        task_key,
        task_type,
        status: TaskStatus::Queued,
        attempt: 0,
        max_attempt: DEFAULT_MAX_ATTEMPT,
        depends_on,
        input,
        output: json!({}),
        error_code: None,
        error_message: None,
        retryable: false,
        next_run_at: Some(Utc::now()),
        started_at: None,
        ended_at: None,
        worker_id: None,
        project_id: job.project_id,
        trace_id: job.trace_id.clone(),
        scene_index,
        display_name,
    }
}

/// Build the immutable dependency graph for a new job
pub fn build_tasks(project: &Project, job: &Job) -> Vec<JobTask> {
    let scene_count = project.scene_count as usize;
    let mut tasks = Vec::with_capacity(2 + scene_count * 2);

    tasks.push(task(
        job,
        STORYBOARD_KEY.to_string(),
        TaskType::StoryboardGenerate,
        Vec::new(),
        json!({ "style": project.style }),
        None,
        "Storyboard".to_string(),
    ));

    let mut scene_keys = Vec::with_capacity(scene_count * 2);
    for i in 0..project.scene_count {
        let image_key = format!("image_generate_{i}");
        scene_keys.push(image_key.clone());
        tasks.push(task(
            job,
            image_key,
            TaskType::ImageGenerate,
            vec![STORYBOARD_KEY.to_string()],
            json!({ "scene_index": i }),
            Some(i),
            format!("Image-{i}"),
        ));

        let tts_key = format!("tts_generate_{i}");
        scene_keys.push(tts_key.clone());
        tasks.push(task(
            job,
            tts_key,
            TaskType::TtsGenerate,
            vec![STORYBOARD_KEY.to_string()],
            json!({ "scene_index": i }),
            Some(i),
            format!("TTS-{i}"),
        ));
    }

    tasks.push(task(
        job,
        COMPOSE_KEY.to_string(),
        TaskType::ComposeVideo,
        scene_keys,
        json!({}),
        None,
        "Compose".to_string(),
    ));

    tasks
}
