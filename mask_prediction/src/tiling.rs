//! Splitting images into overlapping fixed-size patches and blending the
//! per-patch predictions back into one full-resolution mask.

use crate::config::{TilingConfig, Validatable};
use image::{imageops, GenericImageView, RgbImage};
use ndarray::{s, Array2};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilingParams {
    patch_size: u32,
    overlap: u32,
}

impl TilingParams {
    pub fn new(patch_size: u32, overlap: u32) -> Result<Self, String> {
        TilingConfig {
            patch_size,
            overlap,
        }
        .validate()?;
        Ok(Self {
            patch_size,
            overlap,
        })
    }

    pub fn patch_size(&self) -> u32 {
        self.patch_size
    }

    pub fn overlap(&self) -> u32 {
        self.overlap
    }

    /// Distance between successive patch origins. Always at least 1.
    pub fn stride(&self) -> u32 {
        self.patch_size - self.overlap
    }
}

impl Default for TilingParams {
    fn default() -> Self {
        let tiling = TilingConfig::default();
        Self {
            patch_size: tiling.patch_size,
            overlap: tiling.overlap,
        }
    }
}

impl TryFrom<&TilingConfig> for TilingParams {
    type Error = String;

    fn try_from(config: &TilingConfig) -> Result<Self, Self::Error> {
        Self::new(config.patch_size, config.overlap)
    }
}

/// A `patch_size` x `patch_size` crop of the source image whose top-left
/// corner sits at row `y`, column `x`. Pixels past the image edge are black.
#[derive(Debug, Clone)]
pub struct Patch {
    pub y: u32,
    pub x: u32,
    pub pixels: RgbImage,
}

/// Lazy, row-major walk over the patch grid of one image.
pub struct PatchGrid<'a> {
    image: &'a RgbImage,
    params: TilingParams,
    next_y: u32,
    next_x: u32,
}

pub fn split_into_patches(image: &RgbImage, params: TilingParams) -> PatchGrid<'_> {
    PatchGrid {
        image,
        params,
        next_y: 0,
        next_x: 0,
    }
}

impl PatchGrid<'_> {
    /// (height, width) of the image being tiled.
    pub fn full_shape(&self) -> (usize, usize) {
        (self.image.height() as usize, self.image.width() as usize)
    }

    pub fn params(&self) -> TilingParams {
        self.params
    }

    fn crop(&self, y: u32, x: u32) -> RgbImage {
        let size = self.params.patch_size;
        let w = size.min(self.image.width() - x);
        let h = size.min(self.image.height() - y);

        let mut pixels = RgbImage::new(size, size);
        imageops::replace(&mut pixels, &*self.image.view(x, y, w, h), 0, 0);
        pixels
    }
}

fn steps(length: u32, stride: u32) -> usize {
    length.div_ceil(stride) as usize
}

impl Iterator for PatchGrid<'_> {
    type Item = Patch;

    fn next(&mut self) -> Option<Patch> {
        let (width, height) = self.image.dimensions();
        if width == 0 || self.next_y >= height {
            return None;
        }

        let (y, x) = (self.next_y, self.next_x);
        let patch = Patch {
            y,
            x,
            pixels: self.crop(y, x),
        };

        let stride = self.params.stride();
        self.next_x = x.saturating_add(stride);
        if self.next_x >= width {
            self.next_x = 0;
            self.next_y = y.saturating_add(stride);
        }

        Some(patch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (width, height) = self.image.dimensions();
        if width == 0 || self.next_y >= height {
            return (0, Some(0));
        }
        let stride = self.params.stride();
        let per_row = steps(width, stride);
        let rows_left = steps(height - self.next_y, stride);
        let remaining = rows_left * per_row - (self.next_x / stride) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PatchGrid<'_> {}

/// Running sum of patch predictions plus how many patches covered each pixel.
#[derive(Debug, Clone)]
pub struct MaskAccumulator {
    sum: Array2<f32>,
    weight: Array2<f32>,
}

impl MaskAccumulator {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            sum: Array2::zeros((height, width)),
            weight: Array2::zeros((height, width)),
        }
    }

    /// Adds the part of `mask` that lies inside the image. The padded margin
    /// of edge patches is dropped.
    pub fn add(&mut self, y: usize, x: usize, mask: &Array2<f32>) {
        let (height, width) = self.sum.dim();
        if y >= height || x >= width {
            return;
        }
        let h = mask.nrows().min(height - y);
        let w = mask.ncols().min(width - x);

        let mut sum = self.sum.slice_mut(s![y..y + h, x..x + w]);
        sum += &mask.slice(s![..h, ..w]);
        self.weight
            .slice_mut(s![y..y + h, x..x + w])
            .mapv_inplace(|c| c + 1.0);
    }

    pub fn coverage(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn finish(self) -> Array2<f32> {
        let Self { mut sum, weight } = self;
        sum.zip_mut_with(&weight, |value, &count| {
            let count = if count == 0.0 { 1.0 } else { count };
            *value /= count;
        });
        sum
    }
}

pub fn reconstruct_mask<I>(masks: I, full_shape: (usize, usize)) -> Array2<f32>
where
    I: IntoIterator<Item = (Array2<f32>, (u32, u32))>,
{
    let (height, width) = full_shape;
    let mut accumulator = MaskAccumulator::new(height, width);
    for (mask, (y, x)) in masks {
        accumulator.add(y as usize, x as usize, &mask);
    }
    accumulator.finish()
}
