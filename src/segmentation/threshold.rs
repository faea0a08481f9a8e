use candle_core::Device;

use super::dynamics::masks_to_flows;
use super::mask::{
    diameters, fill_holes, label_components, remove_large_masks, remove_small_masks, LabelMask,
};
use super::transforms::{gaussian_blur, normalize99, otsu_threshold, select_channels, Plane};
use super::{ensure_non_empty, EvalParams, FlowField, Result, SegmentationModel, SegmentationResult};
use crate::preprocess::ImageArray;

/// Masks larger than this share of the image are background, not cells.
const MAX_MASK_FRACTION: f32 = 0.4;

/// Classical segmentation: smooth, threshold, split into connected regions.
///
/// Needs no weights. Touching cells merge into one instance. Cells are the
/// smaller Otsu class, so both bright-on-dark and dark-on-bright images work.
///
/// Only `channels`, `diameter` and `min_size` apply here; `flow_threshold`,
/// `cellprob_threshold`, `niter` and `batch_size` are ignored. Flows in the
/// result are derived from the final masks.
pub struct ThresholdModel {
    device: Device,
}

impl ThresholdModel {
    pub fn new() -> Self {
        Self {
            device: Device::Cpu,
        }
    }

    fn eval_one(&self, img: &ImageArray, params: &EvalParams) -> Result<SegmentationResult> {
        ensure_non_empty(img)?;
        let (w, h) = (img.width(), img.height());
        let [cyto, _] = select_channels(img, params.channels);
        let norm = normalize99(&cyto);

        let sigma = params.diameter.map_or(1.0, |d| (d / 15.0).max(1.0));
        let smooth = gaussian_blur(&norm, sigma, &self.device)?;

        // sign = +1: cells brighter than background, -1: darker
        let (masks, threshold, sign) = match otsu_threshold(&smooth) {
            Some(t) => {
                let bright = smooth.data.iter().filter(|&&v| v >= t).count();
                let sign = if 2 * bright > smooth.data.len() { -1.0 } else { 1.0 };
                let fg: Vec<bool> = smooth
                    .data
                    .iter()
                    .map(|&v| (v >= t) == (sign > 0.0))
                    .collect();
                let mut masks = label_components(&fg, w, h);
                remove_small_masks(&mut masks, params.min_size);
                remove_large_masks(&mut masks, MAX_MASK_FRACTION);
                fill_holes(&mut masks);
                (masks, t, sign)
            }
            None => (LabelMask::new(w, h), f32::INFINITY, 1.0),
        };

        let (dy, dx) = masks_to_flows(&masks);
        let cellprob = Plane {
            width: w,
            height: h,
            data: smooth
                .data
                .iter()
                .map(|&v| if threshold.is_finite() { sign * (v - threshold) } else { -1.0 })
                .collect(),
        };
        let (mean, std) = smooth.mean_std();
        let styles = vec![mean, std, if threshold.is_finite() { threshold } else { 0.0 }];
        let diameter = params.diameter.unwrap_or_else(|| diameters(&masks));

        log::debug!(
            "threshold model: {}x{} -> {} masks (diameter {:.1})",
            w,
            h,
            masks.max_label(),
            diameter
        );

        Ok(SegmentationResult {
            masks,
            flows: FlowField { dy, dx, cellprob },
            styles,
            diameter,
        })
    }
}

impl Default for ThresholdModel {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentationModel for ThresholdModel {
    fn name(&self) -> &str {
        "threshold"
    }

    fn eval(&self, imgs: &[ImageArray], params: &EvalParams) -> Result<Vec<SegmentationResult>> {
        params.validate()?;
        imgs.iter().map(|img| self.eval_one(img, params)).collect()
    }
}
