//! Flow-field dynamics: masks to flows, flows to masks.
//!
//! Every cell pixel carries a unit vector pointing along the heat-diffusion
//! gradient towards the cell centre. Following the field makes pixels of one
//! cell converge on the same spot; clustering the end points recovers the
//! instances.

use std::collections::VecDeque;

use super::mask::{bounding_boxes, fill_holes, remove_large_masks, remove_small_masks, LabelMask};
use super::transforms::Plane;
use super::{EvalParams, FlowField};

/// Predicted flows are five times the unit flows they are compared against.
const FLOW_SCALE: f32 = 5.0;
/// Histogram bins need more hits than this to seed a mask.
const SEED_MIN_HITS: u32 = 10;
/// Bins need more hits than this to join a growing mask.
const EXPAND_MIN_HITS: u32 = 2;
const EXPAND_ITERS: usize = 5;
const MAX_MASK_FRACTION: f32 = 0.4;

/// Heat-diffusion flows for every mask: `(dy, dx)`, unit length inside masks.
pub fn masks_to_flows(mask: &LabelMask) -> (Plane, Plane) {
    let (w, h) = (mask.width(), mask.height());
    let mut dy = Plane::zeros(w, h);
    let mut dx = Plane::zeros(w, h);

    let boxes = bounding_boxes(mask);
    let mut pixels: Vec<Vec<(usize, usize)>> = vec![Vec::new(); boxes.len()];
    for y in 0..h {
        for x in 0..w {
            let l = mask.get(x, y) as usize;
            if l != 0 {
                pixels[l].push((y, x));
            }
        }
    }

    for (label, bbox) in boxes.iter().enumerate().skip(1) {
        let Some(b) = bbox else { continue };
        let pix = &pixels[label];
        // local frame with a one-pixel border of zeros
        let ly = b.y1 - b.y0 + 3;
        let lx = b.x1 - b.x0 + 3;
        let local: Vec<(usize, usize)> = pix
            .iter()
            .map(|&(y, x)| (y - b.y0 + 1, x - b.x0 + 1))
            .collect();

        let mut ys: Vec<usize> = local.iter().map(|p| p.0).collect();
        let mut xs: Vec<usize> = local.iter().map(|p| p.1).collect();
        ys.sort_unstable();
        xs.sort_unstable();
        let (ym, xm) = (ys[ys.len() / 2] as f64, xs[xs.len() / 2] as f64);
        let center = local
            .iter()
            .copied()
            .min_by(|a, b| {
                let da = (a.0 as f64 - ym).powi(2) + (a.1 as f64 - xm).powi(2);
                let db = (b.0 as f64 - ym).powi(2) + (b.1 as f64 - xm).powi(2);
                da.total_cmp(&db)
            })
            .unwrap_or(local[0]);

        let mut t = vec![0f64; ly * lx];
        let mut next = vec![0f64; local.len()];
        let niter = 2 * (ly + lx);
        for _ in 0..niter {
            t[center.0 * lx + center.1] += 1.0;
            for (k, &(y, x)) in local.iter().enumerate() {
                let mut s = 0.0;
                for yy in y - 1..=y + 1 {
                    for xx in x - 1..=x + 1 {
                        s += t[yy * lx + xx];
                    }
                }
                next[k] = s / 9.0;
            }
            for (k, &(y, x)) in local.iter().enumerate() {
                t[y * lx + x] = next[k];
            }
        }
        for v in t.iter_mut() {
            *v = v.ln_1p();
        }

        for (&(gy, gx), &(y, x)) in pix.iter().zip(local.iter()) {
            let fy = t[(y + 1) * lx + x] - t[(y - 1) * lx + x];
            let fx = t[y * lx + x + 1] - t[y * lx + x - 1];
            let norm = (fy * fy + fx * fx).sqrt() + 1e-20;
            dy.set(gx, gy, (fy / norm) as f32);
            dx.set(gx, gy, (fx / norm) as f32);
        }
    }
    (dy, dx)
}

/// Integrate the flow field from every active pixel.
///
/// Returns one `(y, x)` end point per entry of `active` (row-major indices).
pub fn follow_flows(dy: &Plane, dx: &Plane, active: &[usize], niter: usize) -> Vec<(f32, f32)> {
    let w = dy.width;
    let max_y = dy.height.saturating_sub(1) as f32;
    let max_x = w.saturating_sub(1) as f32;
    active
        .iter()
        .map(|&i| {
            let mut p = ((i / w) as f32, (i % w) as f32);
            for _ in 0..niter {
                let fy = dy.sample(p.0, p.1);
                let fx = dx.sample(p.0, p.1);
                p.0 = (p.0 + fy).clamp(0.0, max_y);
                p.1 = (p.1 + fx).clamp(0.0, max_x);
            }
            p
        })
        .collect()
}

/// Cluster flow end points into masks.
pub fn get_masks(
    active: &[usize],
    endpoints: &[(f32, f32)],
    width: usize,
    height: usize,
) -> LabelMask {
    let mut mask = LabelMask::new(width, height);
    if active.is_empty() || width == 0 || height == 0 {
        return mask;
    }
    let bin = |p: &(f32, f32)| -> usize {
        let y = (p.0.round() as usize).min(height - 1);
        let x = (p.1.round() as usize).min(width - 1);
        y * width + x
    };
    let mut hist = vec![0u32; width * height];
    for p in endpoints {
        hist[bin(p)] += 1;
    }

    let mut seeds: Vec<(u32, usize)> = Vec::new();
    for y in 0..height {
        for x in 0..width {
            let n = hist[y * width + x];
            if n <= SEED_MIN_HITS {
                continue;
            }
            let mut is_max = true;
            'window: for yy in y.saturating_sub(2)..=(y + 2).min(height - 1) {
                for xx in x.saturating_sub(2)..=(x + 2).min(width - 1) {
                    if hist[yy * width + xx] > n {
                        is_max = false;
                        break 'window;
                    }
                }
            }
            if is_max {
                seeds.push((n, y * width + x));
            }
        }
    }
    seeds.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let mut owner = vec![0u32; width * height];
    for (k, &(_, seed)) in seeds.iter().enumerate() {
        if owner[seed] != 0 {
            continue;
        }
        let label = k as u32 + 1;
        owner[seed] = label;
        let mut frontier = VecDeque::from([seed]);
        for _ in 0..EXPAND_ITERS {
            let mut grown = VecDeque::new();
            while let Some(i) = frontier.pop_front() {
                let (x, y) = (i % width, i / width);
                for yy in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                    for xx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                        let j = yy * width + xx;
                        if owner[j] == 0 && hist[j] > EXPAND_MIN_HITS {
                            owner[j] = label;
                            grown.push_back(j);
                        }
                    }
                }
            }
            frontier = grown;
        }
    }

    let mut labels = vec![0u32; width * height];
    for (&i, p) in active.iter().zip(endpoints) {
        labels[i] = owner[bin(p)];
    }
    if let Some(m) = LabelMask::from_vec(width, height, labels) {
        mask = m;
    }
    remove_large_masks(&mut mask, MAX_MASK_FRACTION);
    mask
}

/// Mean squared difference between scaled predicted flows and mask flows,
/// per label (index 0 unused).
pub fn flow_errors(mask: &LabelMask, dy: &Plane, dx: &Plane) -> Vec<f32> {
    let (my, mx) = masks_to_flows(mask);
    let n = mask.max_label() as usize + 1;
    let mut sum = vec![0f64; n];
    let mut count = vec![0usize; n];
    for (i, &l) in mask.labels().iter().enumerate() {
        if l == 0 {
            continue;
        }
        let ey = my.data[i] - dy.data[i] / FLOW_SCALE;
        let ex = mx.data[i] - dx.data[i] / FLOW_SCALE;
        sum[l as usize] += f64::from(ey * ey + ex * ex);
        count[l as usize] += 1;
    }
    sum.iter()
        .zip(&count)
        .map(|(&s, &c)| if c == 0 { 0.0 } else { (s / c as f64) as f32 })
        .collect()
}

/// Remove masks whose flows disagree with the prediction by more than `threshold`.
pub fn remove_bad_flow_masks(mask: &mut LabelMask, dy: &Plane, dx: &Plane, threshold: f32) {
    let errors = flow_errors(mask, dy, dx);
    let bad: Vec<bool> = errors.iter().map(|&e| e > threshold).collect();
    if !bad.iter().any(|&b| b) {
        return;
    }
    let (w, h) = (mask.width(), mask.height());
    for y in 0..h {
        for x in 0..w {
            let l = mask.get(x, y);
            if l != 0 && bad[l as usize] {
                mask.set(x, y, 0);
            }
        }
    }
    mask.renumber();
}

/// Turn predicted flows and cell probability into an instance mask.
pub fn compute_masks(flows: &FlowField, params: &EvalParams) -> LabelMask {
    let (w, h) = (flows.cellprob.width, flows.cellprob.height);
    let active: Vec<usize> = flows
        .cellprob
        .data
        .iter()
        .enumerate()
        .filter(|(_, p)| **p > params.cellprob_threshold)
        .map(|(i, _)| i)
        .collect();
    if active.is_empty() {
        return LabelMask::new(w, h);
    }

    let mut step_y = Plane::zeros(w, h);
    let mut step_x = Plane::zeros(w, h);
    for &i in &active {
        step_y.data[i] = flows.dy.data[i] / FLOW_SCALE;
        step_x.data[i] = flows.dx.data[i] / FLOW_SCALE;
    }
    let endpoints = follow_flows(&step_y, &step_x, &active, params.niter);
    let mut mask = get_masks(&active, &endpoints, w, h);

    if params.flow_threshold > 0.0 && mask.max_label() > 0 {
        remove_bad_flow_masks(&mut mask, &flows.dy, &flows.dx, params.flow_threshold);
    }
    remove_small_masks(&mut mask, params.min_size);
    fill_holes(&mut mask);
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_mask(w: usize, h: usize, disks: &[(f32, f32, f32)]) -> LabelMask {
        let mut labels = vec![0u32; w * h];
        for (k, &(cx, cy, r)) in disks.iter().enumerate() {
            for y in 0..h {
                for x in 0..w {
                    let d = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
                    if d <= r {
                        labels[y * w + x] = k as u32 + 1;
                    }
                }
            }
        }
        LabelMask::from_vec(w, h, labels).unwrap()
    }

    fn flows_from_mask(mask: &LabelMask) -> FlowField {
        let (dy, dx) = masks_to_flows(mask);
        let scale = |p: Plane| Plane {
            data: p.data.iter().map(|v| v * FLOW_SCALE).collect(),
            ..p
        };
        let cellprob = Plane {
            width: mask.width(),
            height: mask.height(),
            data: mask
                .labels()
                .iter()
                .map(|&l| if l == 0 { -5.0 } else { 5.0 })
                .collect(),
        };
        FlowField {
            dy: scale(dy),
            dx: scale(dx),
            cellprob,
        }
    }

    #[test]
    fn flows_point_towards_the_centre() {
        let mask = disk_mask(21, 21, &[(10.0, 10.0, 6.0)]);
        let (dy, dx) = masks_to_flows(&mask);
        // left of centre flows right, above centre flows down
        assert!(dx.get(5, 10) > 0.5);
        assert!(dx.get(15, 10) < -0.5);
        assert!(dy.get(10, 5) > 0.5);
        assert!(dy.get(10, 15) < -0.5);
        assert_eq!(dx.get(0, 0), 0.0);
        let norm = (dy.get(6, 8).powi(2) + dx.get(6, 8).powi(2)).sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }

    #[test]
    fn mask_flows_reconstruct_the_masks() {
        let mask = disk_mask(64, 48, &[(15.0, 15.0, 7.0), (45.0, 20.0, 8.0), (25.0, 36.0, 6.0)]);
        let flows = flows_from_mask(&mask);
        let recovered = compute_masks(&flows, &EvalParams::default());
        assert_eq!(recovered.num_instances(), 3);
        assert_eq!(recovered.max_label(), 3);
    }

    #[test]
    fn empty_probability_gives_empty_mask() {
        let flows = FlowField {
            dy: Plane::zeros(8, 8),
            dx: Plane::zeros(8, 8),
            cellprob: Plane::from_fn(8, 8, |_, _| -1.0),
        };
        let mask = compute_masks(&flows, &EvalParams::default());
        assert_eq!(mask.max_label(), 0);
    }

    #[test]
    fn consistent_flows_have_no_error() {
        let mask = disk_mask(32, 32, &[(16.0, 16.0, 8.0)]);
        let flows = flows_from_mask(&mask);
        let errors = flow_errors(&mask, &flows.dy, &flows.dx);
        assert!(errors[1] < 1e-6);
    }

    #[test]
    fn inverted_flows_are_rejected() {
        let mut mask = disk_mask(32, 32, &[(16.0, 16.0, 8.0)]);
        let flows = flows_from_mask(&mask);
        let neg = |p: &Plane| Plane {
            data: p.data.iter().map(|v| -v).collect(),
            ..p.clone()
        };
        remove_bad_flow_masks(&mut mask, &neg(&flows.dy), &neg(&flows.dx), 0.4);
        assert_eq!(mask.max_label(), 0);
    }

    #[test]
    fn converging_points_form_one_cluster() {
        let active: Vec<usize> = (0..30).collect();
        let endpoints = vec![(3.0, 3.0); 30];
        let mask = get_masks(&active, &endpoints, 10, 10);
        assert_eq!(mask.num_instances(), 1);
        // sparse end points never seed
        let endpoints: Vec<(f32, f32)> = (0..30)
            .map(|i| ((i / 10) as f32 * 3.0, (i % 10) as f32))
            .collect();
        let mask = get_masks(&active, &endpoints, 10, 10);
        assert_eq!(mask.max_label(), 0);
    }
}
