//! Single-channel float planes and the image transforms applied before a model runs.

use candle_core::{Device, Tensor};
use image::{GrayImage, Luma};
use imageproc::contrast::otsu_level;

use super::Result;
use crate::preprocess::ImageArray;

/// Row-major single-channel `f32` buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl Plane {
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, v: f32) {
        self.data[y * self.width + x] = v;
    }

    /// Bilinear sample at fractional (y, x), clamped to the plane.
    pub fn sample(&self, y: f32, x: f32) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let y = y.clamp(0.0, (self.height - 1) as f32);
        let x = x.clamp(0.0, (self.width - 1) as f32);
        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let y1 = (y0 + 1).min(self.height - 1);
        let x1 = (x0 + 1).min(self.width - 1);
        let fy = y - y0 as f32;
        let fx = x - x0 as f32;
        let top = self.get(x0, y0) * (1.0 - fx) + self.get(x1, y0) * fx;
        let bottom = self.get(x0, y1) * (1.0 - fx) + self.get(x1, y1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Bilinear resize to `width` x `height` (pixel-centre aligned).
    pub fn resize(&self, width: usize, height: usize) -> Plane {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let sy = self.height as f32 / height as f32;
        let sx = self.width as f32 / width as f32;
        Plane::from_fn(width, height, |x, y| {
            self.sample((y as f32 + 0.5) * sy - 0.5, (x as f32 + 0.5) * sx - 0.5)
        })
    }

    /// Copy with `radius` pixels of edge-replicated border.
    pub fn pad_replicate(&self, radius: usize) -> Plane {
        let w = self.width as isize;
        let h = self.height as isize;
        let r = radius as isize;
        Plane::from_fn(self.width + 2 * radius, self.height + 2 * radius, |x, y| {
            let sx = (x as isize - r).clamp(0, w - 1) as usize;
            let sy = (y as isize - r).clamp(0, h - 1) as usize;
            self.get(sx, sy)
        })
    }

    pub fn mean_std(&self) -> (f32, f32) {
        if self.data.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.data.len() as f64;
        let mean = self.data.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
        let var = self
            .data
            .iter()
            .map(|&v| (f64::from(v) - mean).powi(2))
            .sum::<f64>()
            / n;
        (mean as f32, var.sqrt() as f32)
    }
}

fn channel_plane(img: &ImageArray, chan: u8) -> Plane {
    let c = img.channels();
    match chan {
        0 => Plane::from_fn(img.width(), img.height(), |x, y| {
            (0..c).map(|k| img.get(x, y, k)).sum::<f32>() / c as f32
        }),
        n => {
            let k = (n as usize - 1).min(c - 1);
            Plane::from_fn(img.width(), img.height(), |x, y| img.get(x, y, k))
        }
    }
}

/// Split an image into the `[cytoplasm, nucleus]` planes a model consumes.
pub fn select_channels(img: &ImageArray, channels: [u8; 2]) -> [Plane; 2] {
    let cyto = channel_plane(img, channels[0]);
    let nucleus = match channels[1] {
        0 => Plane::zeros(img.width(), img.height()),
        n => channel_plane(img, n),
    };
    [cyto, nucleus]
}

fn percentile(sorted: &[f32], p: f32) -> f32 {
    let pos = p / 100.0 * (sorted.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let t = pos - lo as f32;
    sorted[lo] * (1.0 - t) + sorted[hi] * t
}

/// Map the 1st percentile to 0 and the 99th to 1. Flat planes become zeros.
pub fn normalize99(plane: &Plane) -> Plane {
    if plane.data.is_empty() {
        return plane.clone();
    }
    let mut sorted = plane.data.clone();
    sorted.sort_by(f32::total_cmp);
    let lo = percentile(&sorted, 1.0);
    let hi = percentile(&sorted, 99.0);
    let range = hi - lo;
    if range <= 1e-6 {
        return Plane::zeros(plane.width, plane.height);
    }
    Plane {
        width: plane.width,
        height: plane.height,
        data: plane.data.iter().map(|&v| (v - lo) / range).collect(),
    }
}

fn gaussian_kernel(sigma: f32) -> (usize, Vec<f32>) {
    let radius = (3.0 * sigma).ceil().max(1.0) as usize;
    let size = 2 * radius + 1;
    let k1: Vec<f32> = (0..size)
        .map(|i| {
            let d = i as f32 - radius as f32;
            (-d * d / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = k1.iter().sum();
    let k1: Vec<f32> = k1.iter().map(|v| v / sum).collect();
    let mut k2 = Vec::with_capacity(size * size);
    for a in &k1 {
        for b in &k1 {
            k2.push(a * b);
        }
    }
    (radius, k2)
}

/// Gaussian smoothing as a single 2-D convolution on `device`.
pub fn gaussian_blur(plane: &Plane, sigma: f32, device: &Device) -> Result<Plane> {
    if plane.data.is_empty() || sigma <= 0.0 {
        return Ok(plane.clone());
    }
    let (radius, kernel) = gaussian_kernel(sigma);
    let size = 2 * radius + 1;
    let padded = plane.pad_replicate(radius);
    let input = Tensor::from_vec(padded.data, (1, 1, padded.height, padded.width), device)?;
    let kernel = Tensor::from_vec(kernel, (1, 1, size, size), device)?;
    let out = input.conv2d(&kernel, 0, 1, 1, 1)?;
    let data = out.flatten_all()?.to_vec1::<f32>()?;
    Ok(Plane {
        width: plane.width,
        height: plane.height,
        data,
    })
}

/// Otsu's threshold, or `None` for flat planes.
///
/// The plane is quantised to 8 bits over its own range; foreground is
/// `value >= threshold`.
pub fn otsu_threshold(plane: &Plane) -> Option<f32> {
    let (min, max) = plane
        .data
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if !range.is_finite() || range <= 1e-6 {
        return None;
    }
    let gray = GrayImage::from_fn(plane.width as u32, plane.height as u32, |x, y| {
        let v = plane.get(x as usize, y as usize);
        Luma([((v - min) / range * 255.0).round().clamp(0.0, 255.0) as u8])
    });
    // otsu_level splits into `<= level` and `> level`
    let level = otsu_level(&gray);
    Some(min + (level as f32 + 0.5) * range / 255.0)
}
