use crate::config::ModelConfig;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Error, Debug)]
pub enum WeightsError {
    #[error("no local weights at {0:?} and no download url configured")]
    NoSource(PathBuf),
    #[error("download request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP error {status} for {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> WeightsError + '_ {
    move |source| WeightsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Returns the local weights path, downloading the file first if it is absent.
pub async fn ensure_weights(model_config: &ModelConfig) -> Result<PathBuf, WeightsError> {
    let path = model_config.get_path();
    if tokio::fs::try_exists(&path).await.map_err(io_error(&path))? {
        tracing::info!("Using cached model weights at {}", path.display());
        return Ok(path);
    }
    if model_config.url.trim().is_empty() {
        return Err(WeightsError::NoSource(path));
    }

    tracing::info!("Downloading model weights from {}", model_config.url);
    let client = reqwest::Client::new();
    let downloaded = download_file(&client, &model_config.url, &path).await?;
    tracing::info!("Model downloaded: {} bytes to {}", downloaded, path.display());

    Ok(path)
}

/// Streams `url` into `<path>.part` and renames it to `path` once complete.
pub async fn download_file(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
) -> Result<u64, WeightsError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_error(parent))?;
    }

    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(WeightsError::Status {
            status: response.status(),
            url: url.to_string(),
        });
    }

    let partial = path.with_extension("part");
    let result = write_stream(response, &partial).await;
    match result {
        Ok(written) => {
            tokio::fs::rename(&partial, path)
                .await
                .map_err(io_error(path))?;
            Ok(written)
        }
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                tracing::warn!("Failed to remove partial download: {}", cleanup);
            }
            Err(e)
        }
    }
}

async fn write_stream(response: reqwest::Response, partial: &Path) -> Result<u64, WeightsError> {
    let mut file = tokio::fs::File::create(partial)
        .await
        .map_err(io_error(partial))?;

    let mut written = 0u64;
    let mut stream = std::pin::pin!(response.bytes_stream());
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await.map_err(io_error(partial))?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(io_error(partial))?;

    Ok(written)
}
