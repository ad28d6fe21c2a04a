use crate::{
    config::{Config, ServerConfig},
    model_service::ModelService,
    ort_service::OrtModelService,
    routes::api_routes,
    segmentation_service::SegmentationService,
    tiling::TilingParams,
    weights::ensure_weights,
};
use axum::{extract::DefaultBodyLimit, Router};
use std::{error::Error, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tower_http::cors::{Any, CorsLayer};

pub struct SharedState<M: ModelService> {
    pub segmentation_service: Arc<SegmentationService<M>>,
}

impl<M: ModelService> Clone for SharedState<M> {
    fn clone(&self) -> Self {
        Self {
            segmentation_service: self.segmentation_service.clone(),
        }
    }
}

pub fn build_router<M: ModelService>(
    segmentation_service: SegmentationService<M>,
    config: &ServerConfig,
) -> Router {
    let app_state = SharedState {
        segmentation_service: Arc::new(segmentation_service),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api_routes())
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(cors)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(router: Router, config: &ServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.get_address()).await?;
        Ok(Self { router, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> std::io::Result<()> {
        tracing::info!("Segmentation service listening on {}", self.local_addr()?);

        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

pub async fn start_server(config: Config) -> Result<(), Box<dyn Error>> {
    let params = TilingParams::try_from(&config.tiling)?;

    let weights = ensure_weights(&config.model).await?;
    let model_config = config.model.clone();
    let ort_model_service =
        tokio::task::spawn_blocking(move || OrtModelService::new(&model_config)).await??;
    tracing::info!(
        patch_size = params.patch_size(),
        overlap = params.overlap(),
        "Loaded model weights from {}",
        weights.display()
    );

    let router = build_router(
        SegmentationService::new(ort_model_service, params),
        &config.server,
    );
    let server = HttpServer::new(router, &config.server).await?;
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
