//! Cell segmentation models.
//!
//! A model takes a batch of pixel arrays and returns, per image, an instance
//! mask plus the auxiliary outputs (flows, style vector, diameter). Two CPU
//! back ends exist:
//!
//! - [`ThresholdModel`]: classical smoothing + Otsu + connected components.
//! - [`CellNetModel`]: a candle convolutional network predicting flow fields,
//!   turned into masks by [`dynamics::compute_masks`].

pub mod cellnet;
pub mod dynamics;
pub mod mask;
pub mod threshold;
pub mod transforms;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::preprocess::ImageArray;

pub use cellnet::{CellNet, CellNetConfig, CellNetModel};
pub use mask::LabelMask;
pub(crate) use mask::bounding_boxes;
pub use threshold::ThresholdModel;
pub use transforms::Plane;

/// Mean cell diameter (pixels) the models are calibrated for.
pub const DIAM_MEAN: f32 = 30.0;

#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("{0}")]
    Unsupported(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("weights error: {0}")]
    Weights(String),
}

pub type Result<T> = std::result::Result<T, SegmentationError>;

/// Which back end serves requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Threshold,
    Cellnet,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Threshold => "threshold",
            ModelKind::Cellnet => "cellnet",
        }
    }
}

/// Parameters of one evaluation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalParams {
    /// Number of network tiles evaluated together.
    pub batch_size: usize,
    /// Cell diameter in pixels; `None` estimates it from the image.
    pub diameter: Option<f32>,
    /// `[cytoplasm, nucleus]`: 0 = gray, 1 = red, 2 = green, 3 = blue.
    /// A nucleus channel of 0 means none.
    pub channels: [u8; 2],
    /// Max mean squared flow error before a mask is discarded; <= 0 disables.
    pub flow_threshold: f32,
    pub cellprob_threshold: f32,
    pub do_3d: bool,
    /// Masks with fewer pixels are removed.
    pub min_size: usize,
    /// Euler steps when following flows.
    pub niter: usize,
}

impl Default for EvalParams {
    fn default() -> Self {
        Self {
            batch_size: 16,
            diameter: None,
            channels: [0, 0],
            flow_threshold: 0.4,
            cellprob_threshold: 0.0,
            do_3d: false,
            min_size: 15,
            niter: 200,
        }
    }
}

impl EvalParams {
    pub fn validate(&self) -> Result<()> {
        if self.do_3d {
            return Err(SegmentationError::Unsupported(
                "3D evaluation is not supported".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(SegmentationError::InvalidInput(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if let Some(c) = self.channels.iter().find(|&&c| c > 3) {
            return Err(SegmentationError::InvalidInput(format!(
                "channel index {c} out of range 0..=3"
            )));
        }
        if let Some(d) = self.diameter {
            if !d.is_finite() || d <= 0.0 {
                return Err(SegmentationError::InvalidInput(format!(
                    "diameter must be positive, got {d}"
                )));
            }
        }
        Ok(())
    }
}

/// Per-pixel model outputs: flow components and cell-probability logit.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    pub dy: Plane,
    pub dx: Plane,
    pub cellprob: Plane,
}

#[derive(Debug, Clone)]
pub struct SegmentationResult {
    pub masks: LabelMask,
    pub flows: FlowField,
    pub styles: Vec<f32>,
    pub diameter: f32,
}

/// A loaded segmentation model. Shared read-only across requests.
pub trait SegmentationModel: Send + Sync {
    fn name(&self) -> &str;

    /// Evaluate a batch of images; one result per image, in input order.
    fn eval(&self, imgs: &[ImageArray], params: &EvalParams) -> Result<Vec<SegmentationResult>>;
}

pub(crate) fn ensure_non_empty(img: &ImageArray) -> Result<()> {
    if img.is_empty() {
        return Err(SegmentationError::InvalidInput(format!(
            "image has no pixels ({}x{})",
            img.width(),
            img.height()
        )));
    }
    Ok(())
}
