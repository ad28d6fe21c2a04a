pub mod health;
pub mod predict;

use crate::{model_service::ModelService, server::SharedState};
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes<M: ModelService>() -> Router<SharedState<M>> {
    Router::new()
        .route("/health", get(health::healthcheck::<M>))
        .route("/predict/", post(predict::predict_mask::<M>))
        .route("/predict", post(predict::predict_mask::<M>))
}
