use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use super::dynamics::compute_masks;
use super::mask::diameters;
use super::transforms::{normalize99, select_channels, Plane};
use super::{
    ensure_non_empty, EvalParams, FlowField, Result, SegmentationError, SegmentationModel,
    SegmentationResult, DIAM_MEAN,
};
use crate::preprocess::ImageArray;

/// Network input: cytoplasm + nucleus planes.
const IN_CHANNELS: usize = 2;
/// dY, dX, cell-probability logit.
const OUT_CHANNELS: usize = 3;
const TILE: usize = 224;
const TILE_OVERLAP: f32 = 0.1;
const MIN_RESCALE: f32 = 0.25;
const MAX_RESCALE: f32 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellNetConfig {
    pub hidden: usize,
    pub depth: usize,
}

impl Default for CellNetConfig {
    fn default() -> Self {
        Self {
            hidden: 32,
            depth: 3,
        }
    }
}

/// Stack of 3x3 convolutions with a 1x1 flow/probability head.
///
/// Weight names: `layers.{i}.weight|bias`, `head.weight|bias`.
pub struct CellNet {
    layers: Vec<Conv2d>,
    head: Conv2d,
}

impl CellNet {
    pub fn new(cfg: CellNetConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let mut layers = Vec::with_capacity(cfg.depth);
        let mut in_c = IN_CHANNELS;
        for i in 0..cfg.depth {
            layers.push(conv2d(in_c, cfg.hidden, 3, same, vb.pp(format!("layers.{i}")))?);
            in_c = cfg.hidden;
        }
        let head = conv2d(in_c, OUT_CHANNELS, 1, Default::default(), vb.pp("head"))?;
        Ok(Self { layers, head })
    }

    /// `(B, 2, H, W)` -> (`(B, 3, H, W)` predictions, `(B, C)` unit style vectors).
    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let mut h = xs.clone();
        for layer in &self.layers {
            h = layer.forward(&h)?.relu()?;
        }
        let style = h.flatten_from(2)?.mean(2)?;
        let norm = style.sqr()?.sum_keepdim(1)?.sqrt()?.affine(1.0, 1e-6)?;
        let style = style.broadcast_div(&norm)?;
        let out = self.head.forward(&h)?;
        Ok((out, style))
    }
}

/// Tile origins covering `len` with tiles of `tile` and ~10% overlap.
fn tile_starts(len: usize, tile: usize) -> Vec<usize> {
    if len <= tile {
        return vec![0];
    }
    let step = (tile as f32 * (1.0 - TILE_OVERLAP)).max(1.0);
    let n = ((len - tile) as f32 / step).ceil() as usize + 1;
    let span = (len - tile) as f32;
    (0..n)
        .map(|i| (span * i as f32 / (n - 1) as f32).round() as usize)
        .collect()
}

/// Flow-predicting network evaluated on the CPU.
///
/// 设备先固定用 CPU
pub struct CellNetModel {
    net: CellNet,
    device: Device,
}

impl CellNetModel {
    pub fn load(weights: &Path, cfg: CellNetConfig) -> anyhow::Result<Self> {
        let device = Device::Cpu;
        let start = Instant::now();
        let tensors: HashMap<String, Tensor> = candle_core::safetensors::load(weights, &device)
            .map_err(|e| {
                SegmentationError::Weights(format!("failed to read {}: {e}", weights.display()))
            })?;
        let count = tensors.len();
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let net = CellNet::new(cfg, vb)?;
        log::info!(
            "loaded cellnet ({} tensors, hidden={}, depth={}) from {} in {:.2}s",
            count,
            cfg.hidden,
            cfg.depth,
            weights.display(),
            start.elapsed().as_secs_f32()
        );
        Ok(Self { net, device })
    }

    pub fn from_var_builder(cfg: CellNetConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let device = vb.device().clone();
        Ok(Self {
            net: CellNet::new(cfg, vb)?,
            device,
        })
    }

    /// Run the network tile by tile, averaging overlaps.
    fn run_net(&self, planes: &[Plane; 2], batch_size: usize) -> Result<(FlowField, Vec<f32>)> {
        let (w, h) = (planes[0].width, planes[0].height);
        let (tw, th) = (w.min(TILE), h.min(TILE));
        let tiles: Vec<(usize, usize)> = tile_starts(h, th)
            .into_iter()
            .flat_map(|y0| tile_starts(w, tw).into_iter().map(move |x0| (y0, x0)))
            .collect();
        log::debug!(
            "cellnet: {}x{} image, {} tile(s) of {}x{}, batch {}",
            w,
            h,
            tiles.len(),
            tw,
            th,
            batch_size
        );

        let mut sums = vec![vec![0f32; w * h]; OUT_CHANNELS];
        let mut hits = vec![0u32; w * h];
        let mut style_sum: Vec<f32> = Vec::new();

        for chunk in tiles.chunks(batch_size.max(1)) {
            let mut buf = Vec::with_capacity(chunk.len() * IN_CHANNELS * th * tw);
            for &(y0, x0) in chunk {
                for plane in planes {
                    for y in 0..th {
                        for x in 0..tw {
                            buf.push(plane.get(x0 + x, y0 + y));
                        }
                    }
                }
            }
            let input = Tensor::from_vec(buf, (chunk.len(), IN_CHANNELS, th, tw), &self.device)?;
            let (out, style) = self.net.forward(&input)?;
            let out = out.flatten_all()?.to_vec1::<f32>()?;
            for row in style.to_vec2::<f32>()? {
                if style_sum.is_empty() {
                    style_sum = vec![0.0; row.len()];
                }
                for (acc, v) in style_sum.iter_mut().zip(row) {
                    *acc += v;
                }
            }

            for (b, &(y0, x0)) in chunk.iter().enumerate() {
                for y in 0..th {
                    for x in 0..tw {
                        let i = (y0 + y) * w + x0 + x;
                        hits[i] += 1;
                        for (c, sum) in sums.iter_mut().enumerate() {
                            sum[i] += out[((b * OUT_CHANNELS + c) * th + y) * tw + x];
                        }
                    }
                }
            }
        }

        let mut planes_out = sums.into_iter().map(|sum| Plane {
            width: w,
            height: h,
            data: sum
                .iter()
                .zip(&hits)
                .map(|(&s, &n)| if n == 0 { 0.0 } else { s / n as f32 })
                .collect(),
        });
        let mut next = || planes_out.next().unwrap_or_else(|| Plane::zeros(w, h));
        let flows = FlowField {
            dy: next(),
            dx: next(),
            cellprob: next(),
        };
        let n = tiles.len().max(1) as f32;
        let styles = style_sum.into_iter().map(|v| v / n).collect();
        Ok((flows, styles))
    }

    /// Evaluate at `rescale` and bring predictions back to the input size.
    fn predict(
        &self,
        planes: &[Plane; 2],
        rescale: f32,
        batch_size: usize,
    ) -> Result<(FlowField, Vec<f32>)> {
        let rescale = rescale.clamp(MIN_RESCALE, MAX_RESCALE);
        if (rescale - 1.0).abs() < 1e-3 {
            return self.run_net(planes, batch_size);
        }
        let (w, h) = (planes[0].width, planes[0].height);
        let nw = ((w as f32 * rescale).round() as usize).max(1);
        let nh = ((h as f32 * rescale).round() as usize).max(1);
        let scaled = [planes[0].resize(nw, nh), planes[1].resize(nw, nh)];
        let (flows, styles) = self.run_net(&scaled, batch_size)?;
        Ok((
            FlowField {
                dy: flows.dy.resize(w, h),
                dx: flows.dx.resize(w, h),
                cellprob: flows.cellprob.resize(w, h),
            },
            styles,
        ))
    }

    fn eval_one(&self, img: &ImageArray, params: &EvalParams) -> Result<SegmentationResult> {
        ensure_non_empty(img)?;
        let [cyto, nucleus] = select_channels(img, params.channels);
        let planes = [normalize99(&cyto), normalize99(&nucleus)];

        let (flows, styles, diameter) = match params.diameter {
            Some(d) => {
                let (flows, styles) = self.predict(&planes, DIAM_MEAN / d, params.batch_size)?;
                (flows, styles, d)
            }
            None => {
                let (flows, styles) = self.predict(&planes, 1.0, params.batch_size)?;
                let estimate = diameters(&compute_masks(&flows, params));
                if estimate > 0.0 {
                    log::debug!("cellnet: estimated diameter {:.1}", estimate);
                    let (flows, styles) =
                        self.predict(&planes, DIAM_MEAN / estimate, params.batch_size)?;
                    (flows, styles, estimate)
                } else {
                    (flows, styles, DIAM_MEAN)
                }
            }
        };

        let masks = compute_masks(&flows, params);
        Ok(SegmentationResult {
            masks,
            flows,
            styles,
            diameter,
        })
    }
}

impl SegmentationModel for CellNetModel {
    fn name(&self) -> &str {
        "cellnet"
    }

    fn eval(&self, imgs: &[ImageArray], params: &EvalParams) -> Result<Vec<SegmentationResult>> {
        params.validate()?;
        imgs.iter().map(|img| self.eval_one(img, params)).collect()
    }
}
