use crate::{
    encoding::mask_to_png,
    model_service::{ModelError, ModelService},
    tiling::{split_into_patches, MaskAccumulator, TilingParams},
};
use bytes::Bytes;
use image::{ImageError, RgbImage};
use ndarray::Array2;
use serde::{Deserialize, Deserializer};
use std::{io::Cursor, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::instrument;

pub const MIN_THRESHOLD: f32 = 0.3;
pub const MAX_THRESHOLD: f32 = 0.9;
pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// Binarisation threshold requested by the client, within
/// [`MIN_THRESHOLD`, `MAX_THRESHOLD`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold(f32);

impl Threshold {
    pub fn value(&self) -> f32 {
        self.0
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(DEFAULT_THRESHOLD)
    }
}

impl TryFrom<f32> for Threshold {
    type Error = String;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        if (MIN_THRESHOLD..=MAX_THRESHOLD).contains(&value) {
            Ok(Self(value))
        } else {
            Err(format!(
                "threshold must be between {} and {}, got {}",
                MIN_THRESHOLD, MAX_THRESHOLD, value
            ))
        }
    }
}

impl<'de> Deserialize<'de> for Threshold {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = f32::deserialize(deserializer)?;
        value.try_into().map_err(serde::de::Error::custom)
    }
}

#[derive(Error, Debug)]
pub enum SegmentationError {
    #[error("Error decoding image: {0}")]
    Decode(ImageError),
    #[error("Model inference failed: {0}")]
    Model(#[from] ModelError),
    #[error("Error encoding mask: {0}")]
    Encode(ImageError),
    #[error("Segmentation worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

pub fn decode_image(image_data: &[u8]) -> Result<RgbImage, ImageError> {
    let image = image::ImageReader::new(Cursor::new(image_data))
        .with_guessed_format()?
        .decode()?;
    Ok(image.to_rgb8())
}

/// Tiles `image`, runs `model` on every patch and blends the outputs into a
/// probability mask with the image's height and width.
pub fn predict_mask<M: ModelService + ?Sized>(
    model: &M,
    image: &RgbImage,
    params: TilingParams,
) -> Result<Array2<f32>, ModelError> {
    let grid = split_into_patches(image, params);
    let (height, width) = grid.full_shape();
    tracing::debug!(height, width, patches = grid.len(), "Tiling image");

    let mut accumulator = MaskAccumulator::new(height, width);
    for patch in grid {
        let mask = model.predict_patch(&patch)?;
        accumulator.add(patch.y as usize, patch.x as usize, &mask);
    }

    Ok(accumulator.finish())
}

pub fn segment_image<M: ModelService + ?Sized>(
    model: &M,
    image_data: &[u8],
    params: TilingParams,
) -> Result<Vec<u8>, SegmentationError> {
    let image = decode_image(image_data).map_err(SegmentationError::Decode)?;
    let mask = predict_mask(model, &image, params)?;
    mask_to_png(&mask).map_err(SegmentationError::Encode)
}

pub struct SegmentationService<M: ModelService> {
    model_service: Arc<M>,
    params: TilingParams,
}

impl<M: ModelService> SegmentationService<M> {
    pub fn new(model_service: M, params: TilingParams) -> Self {
        Self {
            model_service: Arc::new(model_service),
            params,
        }
    }

    pub fn params(&self) -> TilingParams {
        self.params
    }

    /// Produces the PNG probability mask for an uploaded image. The threshold
    /// is accepted for API compatibility; clients binarise the mask themselves.
    #[instrument(skip(self, image_data, threshold), fields(bytes = image_data.len(), threshold = threshold.value()))]
    pub async fn segment(
        &self,
        image_data: Bytes,
        threshold: Threshold,
    ) -> Result<Vec<u8>, SegmentationError> {
        let model_service = self.model_service.clone();
        let params = self.params;

        let started = Instant::now();
        let png = tokio::task::spawn_blocking(move || {
            segment_image(model_service.as_ref(), &image_data, params)
        })
        .await??;

        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            png_bytes = png.len(),
            "Mask ready"
        );
        Ok(png)
    }
}
