use crate::{model_service::ModelService, server::SharedState};
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
pub struct HealthStatus {
    pub status: String,
    pub patch_size: u32,
    pub overlap: u32,
}

pub async fn healthcheck<M: ModelService>(State(state): State<SharedState<M>>) -> impl IntoResponse {
    let params = state.segmentation_service.params();
    Json(HealthStatus {
        status: "Available".into(),
        patch_size: params.patch_size(),
        overlap: params.overlap(),
    })
}
