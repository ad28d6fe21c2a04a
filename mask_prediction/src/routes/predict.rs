use crate::{
    model_service::ModelService,
    segmentation_service::{SegmentationError, Threshold},
    server::SharedState,
};
use axum::{
    body::Body,
    extract::{multipart::MultipartError, Multipart, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

const FILE_FIELD: &str = "file";

#[derive(Debug, Deserialize)]
pub struct PredictParams {
    #[serde(default)]
    pub threshold: Threshold,
}

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("Missing multipart field `file`")]
    MissingFile,
    #[error("Invalid multipart upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Segmentation failed: {0}")]
    Segmentation(#[from] SegmentationError),
    #[error("HTTP builder failed: {0}")]
    HttpBuilder(String),
}

impl IntoResponse for PredictError {
    fn into_response(self) -> Response {
        let status = match &self {
            PredictError::MissingFile => StatusCode::UNPROCESSABLE_ENTITY,
            PredictError::Multipart(e) => e.status(),
            PredictError::Segmentation(_) | PredictError::HttpBuilder(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!("Prediction failed: {}", self);
        } else {
            tracing::warn!("Rejected prediction request: {}", self);
        }
        (status, format!("Something went wrong: {}", self)).into_response()
    }
}

#[instrument(skip(state, multipart))]
pub async fn predict_mask<M: ModelService>(
    State(state): State<SharedState<M>>,
    Query(params): Query<PredictParams>,
    mut multipart: Multipart,
) -> Result<Response, PredictError> {
    let mut image_data = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(FILE_FIELD) {
            image_data = Some(field.bytes().await?);
            break;
        }
    }
    let image_data = image_data.ok_or(PredictError::MissingFile)?;

    let png = state
        .segmentation_service
        .segment(image_data, params.threshold)
        .await?;

    let response = Response::builder()
        .header(header::CONTENT_TYPE, "image/png")
        .body(Body::from(png))
        .map_err(|e| PredictError::HttpBuilder(e.to_string()))?;

    Ok(response)
}

#[cfg(test)]
mod tests {
    use crate::{
        config::ServerConfig,
        segmentation_service::{
            tests::{encode_png, FailingModel, RedChannelModel},
            SegmentationService,
        },
        server::build_router,
        tiling::TilingParams,
    };
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        Router,
    };
    use image::{GenericImageView, Rgb, RgbImage};
    use tower::ServiceExt;

    const BOUNDARY: &str = "mask-boundary";

    fn server_config(max_upload_bytes: usize) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_upload_bytes,
        }
    }

    fn router() -> Router {
        let service =
            SegmentationService::new(RedChannelModel::default(), TilingParams::new(32, 8).unwrap());
        build_router(service, &server_config(1024 * 1024))
    }

    fn multipart_body(field: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"upload.png\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn predict_request(query: &str, field: &str, payload: &[u8]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/predict/{}", query))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(field, payload)))
            .unwrap()
    }

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        encode_png(&RgbImage::from_fn(width, height, |x, _| {
            Rgb([(x * 7 % 256) as u8, 0, 0])
        }))
    }

    #[tokio::test]
    async fn test_predict_returns_png_of_same_size() {
        let response = router()
            .oneshot(predict_request("", "file", &sample_png(45, 70)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mask = image::load_from_memory(&body).unwrap();
        assert_eq!(mask.dimensions(), (45, 70));
        assert_eq!(mask.color(), image::ColorType::L8);
    }

    #[tokio::test]
    async fn test_threshold_bounds() {
        let png = sample_png(8, 8);
        for (query, expected) in [
            ("", StatusCode::OK),
            ("?threshold=0.3", StatusCode::OK),
            ("?threshold=0.6", StatusCode::OK),
            ("?threshold=0.9", StatusCode::OK),
            ("?threshold=0.2", StatusCode::BAD_REQUEST),
            ("?threshold=0.95", StatusCode::BAD_REQUEST),
            ("?threshold=high", StatusCode::BAD_REQUEST),
        ] {
            let response = router()
                .oneshot(predict_request(query, "file", &png))
                .await
                .unwrap();
            assert_eq!(response.status(), expected, "query {:?}", query);
        }
    }

    #[tokio::test]
    async fn test_identical_requests_give_identical_masks() {
        let app = router();
        let png = sample_png(100, 40);

        let first = app
            .clone()
            .oneshot(predict_request("", "file", &png))
            .await
            .unwrap();
        let second = app
            .oneshot(predict_request("?threshold=0.6", "file", &png))
            .await
            .unwrap();

        let first = to_bytes(first.into_body(), usize::MAX).await.unwrap();
        let second = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_non_image_upload_is_a_server_error() {
        let app = router();

        let response = app
            .clone()
            .oneshot(predict_request("", "file", b"just some text"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = app
            .oneshot(predict_request("", "file", &sample_png(3, 3)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_file_field() {
        let response = router()
            .oneshot(predict_request("", "image", &sample_png(3, 3)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_model_failure_is_a_server_error() {
        let app = build_router(
            SegmentationService::new(FailingModel, TilingParams::default()),
            &server_config(1024 * 1024),
        );

        let response = app
            .oneshot(predict_request("", "file", &sample_png(3, 3)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_oversized_upload_is_rejected() {
        let app = build_router(
            SegmentationService::new(RedChannelModel::default(), TilingParams::default()),
            &server_config(512),
        );

        let response = app
            .oneshot(predict_request("", "file", &vec![7u8; 4096]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let response = router()
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/predict/")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_success());
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }

    #[tokio::test]
    async fn test_healthcheck_reports_tiling() {
        let response = router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status["status"], "Available");
        assert_eq!(status["patch_size"], 32);
        assert_eq!(status["overlap"], 8);
    }
}
