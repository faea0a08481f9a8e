use std::collections::VecDeque;

use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};

/// Per-pixel instance labels: 0 is background, 1..=N are cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMask {
    width: usize,
    height: usize,
    labels: Vec<u32>,
}

impl LabelMask {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            labels: vec![0; width * height],
        }
    }

    pub fn from_vec(width: usize, height: usize, labels: Vec<u32>) -> Option<Self> {
        if labels.len() != width * height {
            return None;
        }
        Some(Self {
            width,
            height,
            labels,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u32 {
        self.labels[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, label: u32) {
        self.labels[y * self.width + x] = label;
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    pub fn max_label(&self) -> u32 {
        self.labels.iter().copied().max().unwrap_or(0)
    }

    /// Number of distinct non-zero labels.
    pub fn num_instances(&self) -> usize {
        let mut seen = vec![false; self.max_label() as usize + 1];
        let mut n = 0;
        for &l in &self.labels {
            if l != 0 && !seen[l as usize] {
                seen[l as usize] = true;
                n += 1;
            }
        }
        n
    }

    /// Pixel count per label, indexed by label (index 0 is background).
    pub fn areas(&self) -> Vec<usize> {
        let mut areas = vec![0usize; self.max_label() as usize + 1];
        for &l in &self.labels {
            areas[l as usize] += 1;
        }
        areas
    }

    /// Relabel to 1..=N in order of first appearance (raster scan).
    pub fn renumber(&mut self) {
        let mut map = vec![0u32; self.max_label() as usize + 1];
        let mut next = 0u32;
        for l in self.labels.iter_mut() {
            if *l == 0 {
                continue;
            }
            let slot = &mut map[*l as usize];
            if *slot == 0 {
                next += 1;
                *slot = next;
            }
            *l = *slot;
        }
    }
}

/// Label 4-connected regions of `foreground` (row-major, `width` x `height`).
///
/// Labels follow raster order of each region's first pixel.
pub fn label_components(foreground: &[bool], width: usize, height: usize) -> LabelMask {
    if width == 0 || height == 0 {
        return LabelMask::new(width, height);
    }
    let binary = GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let on = foreground
            .get(y as usize * width + x as usize)
            .copied()
            .unwrap_or(false);
        Luma([if on { 255 } else { 0 }])
    });
    let labels = connected_components(&binary, Connectivity::Four, Luma([0u8]));
    let mut mask = LabelMask {
        width,
        height,
        labels: labels.into_raw(),
    };
    mask.renumber();
    mask
}

/// Drop masks with fewer than `min_size` pixels and renumber.
pub fn remove_small_masks(mask: &mut LabelMask, min_size: usize) {
    let areas = mask.areas();
    for l in mask.labels.iter_mut() {
        if *l != 0 && areas[*l as usize] < min_size {
            *l = 0;
        }
    }
    mask.renumber();
}

/// Drop masks covering more than `fraction` of the image and renumber.
pub fn remove_large_masks(mask: &mut LabelMask, fraction: f32) {
    let limit = (mask.labels.len() as f32 * fraction) as usize;
    let areas = mask.areas();
    for l in mask.labels.iter_mut() {
        if *l != 0 && areas[*l as usize] > limit {
            *l = 0;
        }
    }
    mask.renumber();
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BBox {
    pub x0: usize,
    pub y0: usize,
    pub x1: usize,
    pub y1: usize,
}

/// Bounding box per label (index 0 unused).
pub(crate) fn bounding_boxes(mask: &LabelMask) -> Vec<Option<BBox>> {
    let mut boxes: Vec<Option<BBox>> = vec![None; mask.max_label() as usize + 1];
    for y in 0..mask.height {
        for x in 0..mask.width {
            let l = mask.get(x, y) as usize;
            if l == 0 {
                continue;
            }
            boxes[l] = Some(match boxes[l] {
                None => BBox {
                    x0: x,
                    y0: y,
                    x1: x,
                    y1: y,
                },
                Some(b) => BBox {
                    x0: b.x0.min(x),
                    y0: b.y0.min(y),
                    x1: b.x1.max(x),
                    y1: b.y1.max(y),
                },
            });
        }
    }
    boxes
}

/// Fill background pixels fully enclosed by a single mask.
pub fn fill_holes(mask: &mut LabelMask) {
    let boxes = bounding_boxes(mask);
    for (label, bbox) in boxes.iter().enumerate().skip(1) {
        let Some(b) = bbox else { continue };
        let label = label as u32;
        // bbox plus a one-pixel frame that is always outside the mask
        let bw = b.x1 - b.x0 + 3;
        let bh = b.y1 - b.y0 + 3;
        let inside = |gx: usize, gy: usize| -> bool {
            if gx == 0 || gy == 0 || gx == bw - 1 || gy == bh - 1 {
                return false;
            }
            mask.get(b.x0 + gx - 1, b.y0 + gy - 1) == label
        };
        let mut outside = vec![false; bw * bh];
        let mut queue = VecDeque::from([0usize]);
        outside[0] = true;
        while let Some(i) = queue.pop_front() {
            let (gx, gy) = (i % bw, i / bw);
            let neighbours = [
                (gx.wrapping_sub(1), gy),
                (gx + 1, gy),
                (gx, gy.wrapping_sub(1)),
                (gx, gy + 1),
            ];
            for (nx, ny) in neighbours {
                if nx >= bw || ny >= bh {
                    continue;
                }
                let j = ny * bw + nx;
                if !outside[j] && !inside(nx, ny) {
                    outside[j] = true;
                    queue.push_back(j);
                }
            }
        }
        for gy in 1..bh - 1 {
            for gx in 1..bw - 1 {
                let (x, y) = (b.x0 + gx - 1, b.y0 + gy - 1);
                if !outside[gy * bw + gx] && mask.get(x, y) == 0 {
                    mask.set(x, y, label);
                }
            }
        }
    }
}

/// Median cell diameter: the diameter of a disk with the median mask area.
/// Zero when there are no masks.
pub fn diameters(mask: &LabelMask) -> f32 {
    let mut roots: Vec<f32> = mask
        .areas()
        .into_iter()
        .skip(1)
        .filter(|&a| a > 0)
        .map(|a| (a as f32).sqrt())
        .collect();
    if roots.is_empty() {
        return 0.0;
    }
    roots.sort_by(f32::total_cmp);
    let n = roots.len();
    let median = if n % 2 == 1 {
        roots[n / 2]
    } else {
        0.5 * (roots[n / 2 - 1] + roots[n / 2])
    };
    median / (std::f32::consts::PI.sqrt() / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: &[&str]) -> (Vec<bool>, usize, usize) {
        let h = rows.len();
        let w = rows[0].len();
        let fg = rows
            .iter()
            .flat_map(|r| r.chars().map(|c| c == '#'))
            .collect();
        (fg, w, h)
    }

    #[test]
    fn components_are_four_connected() {
        let (fg, w, h) = grid(&["##..#", "##..#", "....#", "#.#.."]);
        let mask = label_components(&fg, w, h);
        assert_eq!(mask.num_instances(), 4);
        assert_eq!(mask.max_label(), 4);
        // diagonal contact does not join
        let (fg, w, h) = grid(&["#.", ".#"]);
        assert_eq!(label_components(&fg, w, h).num_instances(), 2);
    }

    #[test]
    fn small_masks_are_removed_and_labels_stay_contiguous() {
        let (fg, w, h) = grid(&["###..#", "###...", "......", "..####"]);
        let mut mask = label_components(&fg, w, h);
        remove_small_masks(&mut mask, 4);
        assert_eq!(mask.num_instances(), 2);
        assert_eq!(mask.max_label(), 2);
    }

    #[test]
    fn large_masks_are_removed() {
        let (fg, w, h) = grid(&["####", "####", "#...", "...#"]);
        let mut mask = label_components(&fg, w, h);
        remove_large_masks(&mut mask, 0.4);
        assert_eq!(mask.num_instances(), 1);
    }

    #[test]
    fn enclosed_holes_are_filled() {
        let (fg, w, h) = grid(&["#####", "#...#", "#...#", "#####", "....."]);
        let mut mask = label_components(&fg, w, h);
        fill_holes(&mut mask);
        assert_eq!(mask.areas()[1], 20);
        // open ring is left alone
        let (fg, w, h) = grid(&["#####", "#...#", "#....", "#####"]);
        let mut mask = label_components(&fg, w, h);
        fill_holes(&mut mask);
        assert_eq!(mask.areas()[1], 13);
    }

    #[test]
    fn renumber_follows_raster_order() {
        let mut mask = LabelMask::from_vec(3, 1, vec![7, 0, 3]).unwrap();
        mask.renumber();
        assert_eq!(mask.labels(), &[1, 0, 2]);
    }

    #[test]
    fn diameter_of_square_masks() {
        let mask = LabelMask::from_vec(2, 2, vec![1, 1, 1, 1]).unwrap();
        let d = diameters(&mask);
        assert!((d - 2.0 / (std::f32::consts::PI.sqrt() / 2.0)).abs() < 1e-5);
        assert_eq!(diameters(&LabelMask::new(3, 3)), 0.0);
    }
}
