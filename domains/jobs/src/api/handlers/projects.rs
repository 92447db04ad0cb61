//! Engine-facing project handlers
//!
//! Just enough project surface for jobs to have a target: create and fetch.
//! Storyboard editing and the rest of project management live elsewhere.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use storyreel_common::{Error, Result};

use crate::api::middleware::{CurrentUser, JobsState};
use crate::domain::entities::Project;

const MAX_SCENE_COUNT: u32 = 20;

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub story_text: String,
    pub style: String,
    pub scene_count: u32,
}

pub async fn create_project(
    CurrentUser { user_id, .. }: CurrentUser,
    State(state): State<JobsState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>)> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::Validation("name is required".to_string()));
    }
    if req.story_text.trim().is_empty() {
        return Err(Error::Validation("story_text is required".to_string()));
    }
    if req.style.trim().is_empty() {
        return Err(Error::Validation("style is required".to_string()));
    }
    if req.scene_count < 1 || req.scene_count > MAX_SCENE_COUNT {
        return Err(Error::Validation(format!(
            "scene_count must be between 1 and {MAX_SCENE_COUNT}"
        )));
    }

    let now = Utc::now();
    let project = Project {
        id: Uuid::new_v4(),
        user_id,
        name,
        story_text: req.story_text,
        style: req.style,
        scene_count: req.scene_count,
        status: "draft".to_string(),
        current_job_id: None,
        created_at: now,
        updated_at: now,
    };
    let created = state.store.create_project(project)?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_project(
    CurrentUser { user_id, .. }: CurrentUser,
    State(state): State<JobsState>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Project>> {
    let project = state.store.get_project(project_id)?;
    if project.user_id != user_id {
        return Err(Error::Authorization("no access to project".to_string()));
    }
    Ok(Json(project))
}
