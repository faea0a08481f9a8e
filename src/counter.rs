use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;

use crate::error::ApiError;
use crate::outlines::outlines_list;
use crate::preprocess::{decode_image, resize_image};
use crate::segmentation::{EvalParams, SegmentationModel};

/// Decode -> resize -> evaluate -> count outlines.
#[derive(Clone)]
pub struct CellCounter {
    model: Arc<dyn SegmentationModel>,
    params: EvalParams,
    max_side: u32,
}

impl CellCounter {
    pub fn new(model: Arc<dyn SegmentationModel>, params: EvalParams, max_side: u32) -> Self {
        Self {
            model,
            params,
            max_side,
        }
    }

    /// Count cells in an uploaded file. Evaluation runs on the blocking pool.
    pub async fn count(&self, bytes: Vec<u8>) -> Result<usize, ApiError> {
        let image = decode_image(&bytes)?;
        log::debug!("decoded {}x{} {:?}", image.width(), image.height(), image.color());

        // 推理是 CPU 密集的，放到 blocking 线程池
        let counter = self.clone();
        tokio::task::spawn_blocking(move || {
            count_cells(counter.model.as_ref(), &image, &counter.params, counter.max_side)
        })
        .await
        .map_err(|e| ApiError::Inference(e.to_string()))?
    }
}

/// Count cell outlines in one image.
pub fn count_cells(
    model: &dyn SegmentationModel,
    image: &DynamicImage,
    params: &EvalParams,
    max_side: u32,
) -> Result<usize, ApiError> {
    let start = Instant::now();
    let resized = resize_image(image, max_side);
    let imgs = [resized];
    let results = model
        .eval(&imgs, params)
        .map_err(|e| ApiError::Inference(e.to_string()))?;
    let first = results
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::Inference("model returned no result".to_string()))?;
    let count = outlines_list(&first.masks).len();
    log::info!(
        "{}: {}x{} -> {} cell(s), diameter {:.1}, {:.0} ms",
        model.name(),
        imgs[0].width(),
        imgs[0].height(),
        count,
        first.diameter,
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(count)
}
