mod server;

pub mod config;
pub mod encoding;
pub mod model_service;
pub mod ort_service;
pub mod routes;
pub mod segmentation_service;
pub mod tiling;
pub mod weights;

pub use server::{build_router, start_server, HttpServer, SharedState};
