//! Outline polygons from instance masks.

use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use serde::Serialize;

use crate::segmentation::{bounding_boxes, LabelMask};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outline {
    pub label: u32,
    /// Boundary pixels `(x, y)` in tracing order.
    pub points: Vec<(u32, u32)>,
}

/// One outline per distinct non-zero label, in label order.
///
/// A label split into several pieces is outlined by the outer border of the
/// piece reached first in raster order.
pub fn outlines_list(mask: &LabelMask) -> Vec<Outline> {
    bounding_boxes(mask)
        .into_iter()
        .enumerate()
        .skip(1)
        .filter_map(|(label, bbox)| {
            let b = bbox?;
            let label = label as u32;
            // label crop with a one-pixel empty frame
            let (cw, ch) = (b.x1 - b.x0 + 3, b.y1 - b.y0 + 3);
            let crop = GrayImage::from_fn(cw as u32, ch as u32, |x, y| {
                let (x, y) = (x as usize, y as usize);
                let on = x > 0
                    && y > 0
                    && x < cw - 1
                    && y < ch - 1
                    && mask.get(b.x0 + x - 1, b.y0 + y - 1) == label;
                Luma([if on { 255 } else { 0 }])
            });
            let points = find_contours::<i32>(&crop)
                .into_iter()
                .find(|c| matches!(c.border_type, BorderType::Outer))
                .map(|c| {
                    c.points
                        .iter()
                        .map(|p| ((b.x0 as i32 + p.x - 1) as u32, (b.y0 as i32 + p.y - 1) as u32))
                        .collect()
                })
                .unwrap_or_default();
            Some(Outline { label, points })
        })
        .collect()
}
