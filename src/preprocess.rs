//! Upload decoding and the fixed-size resize step.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};

use crate::error::ApiError;

/// Longer-side limit applied before segmentation.
pub const MAX_IMAGE_SIDE: u32 = 256;

/// Row-major `f32` pixel array with interleaved channels.
///
/// Grayscale sources carry one channel, colour sources three; alpha is
/// dropped on conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageArray {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<f32>,
}

impl ImageArray {
    pub fn new(width: usize, height: usize, channels: usize, data: Vec<f32>) -> Option<Self> {
        if channels == 0 || data.len() != width * height * channels {
            return None;
        }
        Some(Self {
            width,
            height,
            channels,
            data,
        })
    }

    pub fn from_image(image: &DynamicImage) -> Self {
        let (width, height) = image.dimensions();
        let (channels, data) = if image.color().has_color() {
            (3, image.to_rgb32f().into_raw())
        } else {
            (1, image.to_luma32f().into_raw())
        };
        Self {
            width: width as usize,
            height: height as usize,
            channels,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Value of channel `c` at (x, y).
    pub fn get(&self, x: usize, y: usize, c: usize) -> f32 {
        self.data[(y * self.width + x) * self.channels + c]
    }
}

/// Decode uploaded bytes, guessing the format from the content.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ApiError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ApiError::Decode(e.to_string()))?;
    reader.decode().map_err(|e| ApiError::Decode(e.to_string()))
}

/// Dimensions after bounding the longer side by `max_side`.
///
/// The scale factor is computed once and applied to both axes; scaled sides
/// are truncated and never drop below one pixel.
pub fn target_dimensions(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_side {
        return (width, height);
    }
    let scale = f64::from(max_side) / f64::from(longest);
    let w = ((f64::from(width) * scale) as u32).max(1);
    let h = ((f64::from(height) * scale) as u32).max(1);
    (w, h)
}

/// Downsample so no side exceeds `max_side`, then convert to a pixel array.
pub fn resize_image(image: &DynamicImage, max_side: u32) -> ImageArray {
    let (width, height) = image.dimensions();
    let (w, h) = target_dimensions(width, height, max_side);
    if (w, h) == (width, height) {
        return ImageArray::from_image(image);
    }
    let resized = image.resize_exact(w, h, FilterType::Lanczos3);
    ImageArray::from_image(&resized)
}
