//! Owner-scoped asset read handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use storyreel_common::{Error, Result};
use storyreel_provider::AssetType;

use crate::api::middleware::{CurrentUser, JobsState};
use crate::domain::entities::Asset;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ListAssetsParams {
    pub project_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub asset_type: Option<AssetType>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct AssetListResponse {
    pub items: Vec<Asset>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

pub async fn list_assets(
    CurrentUser { user_id, .. }: CurrentUser,
    State(state): State<JobsState>,
    Query(params): Query<ListAssetsParams>,
) -> Result<Json<AssetListResponse>> {
    let page = params.page.unwrap_or(1).max(1);
    let page_size = params
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let (items, total) =
        state
            .store
            .list_assets(user_id, params.project_id, params.asset_type, page, page_size);
    Ok(Json(AssetListResponse { items, total, page, page_size }))
}

pub async fn get_asset(
    CurrentUser { user_id, .. }: CurrentUser,
    State(state): State<JobsState>,
    Path(asset_id): Path<Uuid>,
) -> Result<Json<Asset>> {
    let asset = state.store.get_asset(asset_id)?;
    if asset.user_id != user_id {
        return Err(Error::Authorization("no access to asset".to_string()));
    }
    Ok(Json(asset))
}
