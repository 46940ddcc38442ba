//! Resize transform shared by every image of an encoder batch
//!
//! Images are scaled so that their longest side matches the encoder input
//! size. After this step every image fits into the same padded square, which
//! is what makes batching images of different sizes possible.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array3;

use crate::error::{EmbeddingError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeLongestSide {
    target_length: usize,
}

impl ResizeLongestSide {
    pub fn new(target_length: usize) -> Self {
        Self { target_length }
    }

    pub fn target_length(&self) -> usize {
        self.target_length
    }

    /// Output `(height, width)` for an input of `(height, width)`
    pub fn preprocess_shape(height: usize, width: usize, long_side: usize) -> (usize, usize) {
        let scale = long_side as f64 / height.max(width) as f64;
        let new_h = (height as f64 * scale + 0.5) as usize;
        let new_w = (width as f64 * scale + 0.5) as usize;
        (new_h, new_w)
    }

    /// Resize an `(H, W, 3)` image with bilinear interpolation
    pub fn apply_image(&self, image: &Array3<u8>) -> Result<Array3<u8>> {
        let (height, width, channels) = image.dim();
        if height == 0 || width == 0 || channels != 3 {
            return Err(EmbeddingError::invalid_input(format!(
                "Cannot resize image of shape {:?}",
                image.shape()
            )));
        }

        let (new_h, new_w) = Self::preprocess_shape(height, width, self.target_length);
        if (new_h, new_w) == (height, width) {
            return Ok(image.clone());
        }

        let raw: Vec<u8> = image.iter().copied().collect();
        let rgb = RgbImage::from_raw(width as u32, height as u32, raw)
            .ok_or_else(|| EmbeddingError::invalid_input("Image buffer does not match its shape"))?;
        let resized = imageops::resize(&rgb, new_w as u32, new_h as u32, FilterType::Triangle);

        Array3::from_shape_vec((new_h, new_w, 3), resized.into_raw())
            .map_err(|e| EmbeddingError::invalid_input(e.to_string()))
    }
}
