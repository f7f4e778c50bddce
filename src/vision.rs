//! Gap-region proposal and template quality classification.
//!
//! Both models sit behind trait seams and are owned by a [`VisionModels`]
//! handle that is acquired when a solve starts and dropped with the
//! attempt, so nothing model-related outlives the account being processed.

use image::GrayImage;
use log::debug;

const SOBEL_GX: [[i32; 3]; 3] = [[-1, 0, 1], [-2, 0, 2], [-1, 0, 1]];
const SOBEL_GY: [[i32; 3]; 3] = [[-1, -2, -1], [0, 0, 0], [1, 2, 1]];

/// Proposals kept after suppression. Keeps the matching loop bounded.
const MAX_PROPOSALS: usize = 8;
/// Border band (px) whose edge energy scores a window.
const PERIMETER_BAND: u32 = 3;
/// A window must beat the global mean edge energy by this factor.
const SCORE_FACTOR: f64 = 1.2;

const GATE_MIN_STDDEV: f64 = 18.0;
const GATE_MIN_EDGE_MEAN: f64 = 6.0;

/// Candidate gap bounding box in background-image pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl Region {
    pub fn center(&self) -> (u32, u32) {
        ((self.x1 + self.x2) / 2, (self.y1 + self.y2) / 2)
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    fn intersects(&self, other: &Region) -> bool {
        self.x1 < other.x2 && other.x1 < self.x2 && self.y1 < other.y2 && other.y1 < self.y2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateLabel {
    Legible,
    Degenerate,
}

pub trait GapDetector {
    /// Locate candidate gap regions. An empty list is a valid answer and
    /// means "no candidates found".
    fn detect(&self, background: &GrayImage) -> Vec<Region>;
}

pub trait TemplateGate {
    fn classify(&self, patch: &GrayImage) -> TemplateLabel;
}

/// Detection and classification resources for one attempt.
pub struct VisionModels {
    detector: EdgeGapDetector,
    gate: ContrastGate,
}

impl VisionModels {
    pub fn acquire() -> Self {
        Self {
            detector: EdgeGapDetector,
            gate: ContrastGate,
        }
    }

    pub fn detector(&self) -> &dyn GapDetector {
        &self.detector
    }

    pub fn gate(&self) -> &dyn TemplateGate {
        &self.gate
    }
}

/// Proposes gap regions by scoring the edge energy of window perimeters.
///
/// A punched-out jigsaw gap shows up as a closed high-gradient outline, so
/// windows whose border band carries much more energy than the image at
/// large are strong candidates.
pub struct EdgeGapDetector;

impl GapDetector for EdgeGapDetector {
    fn detect(&self, background: &GrayImage) -> Vec<Region> {
        let (w, h) = background.dimensions();
        if w < 24 || h < 24 {
            return Vec::new();
        }

        let energy = sobel_magnitude(background);
        let integral = integral_image(&energy, w, h);
        let total: u64 = *integral.last().unwrap_or(&0);
        let global_mean = total as f64 / (w as f64 * h as f64);

        let mut scored: Vec<(f64, Region)> = Vec::new();
        for size in [h / 5, h / 4, h / 3] {
            if size <= 2 * PERIMETER_BAND || size > w {
                continue;
            }
            let stride = (size / 4).max(2);
            let mut y = 0;
            while y + size <= h {
                let mut x = 0;
                while x + size <= w {
                    let outer = box_sum(&integral, w, x, y, x + size, y + size);
                    let inner = box_sum(
                        &integral,
                        w,
                        x + PERIMETER_BAND,
                        y + PERIMETER_BAND,
                        x + size - PERIMETER_BAND,
                        y + size - PERIMETER_BAND,
                    );
                    let band_area = (size * size - (size - 2 * PERIMETER_BAND).pow(2)) as f64;
                    let score = (outer - inner) as f64 / band_area;
                    if score > SCORE_FACTOR * global_mean && score > 0.0 {
                        scored.push((
                            score,
                            Region {
                                x1: x,
                                y1: y,
                                x2: x + size,
                                y2: y + size,
                            },
                        ));
                    }
                    x += stride;
                }
                y += stride;
            }
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let mut kept: Vec<Region> = Vec::new();
        for (_, region) in scored {
            if kept.iter().any(|k| k.intersects(&region)) {
                continue;
            }
            kept.push(region);
            if kept.len() == MAX_PROPOSALS {
                debug!("gap detector hit the {} proposal cap", MAX_PROPOSALS);
                break;
            }
        }
        kept
    }
}

/// Rejects template patches without enough contrast or edge content to be
/// worth matching. A degenerate third means the whole set gets refreshed.
pub struct ContrastGate;

impl TemplateGate for ContrastGate {
    fn classify(&self, patch: &GrayImage) -> TemplateLabel {
        let (w, h) = patch.dimensions();
        if w < 8 || h < 8 {
            return TemplateLabel::Degenerate;
        }
        let n = (w * h) as f64;
        let sum: f64 = patch.pixels().map(|p| p[0] as f64).sum();
        let mean = sum / n;
        let var: f64 = patch.pixels().map(|p| (p[0] as f64 - mean).powi(2)).sum::<f64>() / n;

        let energy = sobel_magnitude(patch);
        let edge_mean = energy.iter().map(|&e| e as f64).sum::<f64>() / n;

        if var.sqrt() < GATE_MIN_STDDEV || edge_mean < GATE_MIN_EDGE_MEAN {
            TemplateLabel::Degenerate
        } else {
            TemplateLabel::Legible
        }
    }
}

fn sobel_magnitude(img: &GrayImage) -> Vec<u32> {
    let (w, h) = img.dimensions();
    let mut out = vec![0u32; (w * h) as usize];
    if w < 3 || h < 3 {
        return out;
    }
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut gx = 0i32;
            let mut gy = 0i32;
            for ky in 0..3 {
                for kx in 0..3 {
                    let p = img.get_pixel(x + kx - 1, y + ky - 1)[0] as i32;
                    gx += SOBEL_GX[ky as usize][kx as usize] * p;
                    gy += SOBEL_GY[ky as usize][kx as usize] * p;
                }
            }
            let mag = ((gx * gx + gy * gy) as f64).sqrt().min(255.0) as u32;
            out[(y * w + x) as usize] = mag;
        }
    }
    out
}

/// Summed-area table with a one-cell top/left border of zeros.
fn integral_image(values: &[u32], w: u32, h: u32) -> Vec<u64> {
    let iw = (w + 1) as usize;
    let mut out = vec![0u64; iw * (h + 1) as usize];
    for y in 0..h as usize {
        let mut row = 0u64;
        for x in 0..w as usize {
            row += values[y * w as usize + x] as u64;
            out[(y + 1) * iw + x + 1] = out[y * iw + x + 1] + row;
        }
    }
    out
}

fn box_sum(integral: &[u64], w: u32, x1: u32, y1: u32, x2: u32, y2: u32) -> u64 {
    let iw = (w + 1) as usize;
    let (x1, y1, x2, y2) = (x1 as usize, y1 as usize, x2 as usize, y2 as usize);
    integral[y2 * iw + x2] + integral[y1 * iw + x1]
        - integral[y1 * iw + x2]
        - integral[y2 * iw + x1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn flat(w: u32, h: u32, v: u8) -> GrayImage {
        GrayImage::from_pixel(w, h, Luma([v]))
    }

    /// Dark square outline on a mid-gray background, like a punched gap.
    fn background_with_gap(x0: u32, y0: u32, size: u32) -> GrayImage {
        let mut img = flat(240, 140, 120);
        for t in 0..3 {
            for x in x0..x0 + size {
                img.put_pixel(x, y0 + t, Luma([15]));
                img.put_pixel(x, y0 + size - 1 - t, Luma([15]));
            }
            for y in y0..y0 + size {
                img.put_pixel(x0 + t, y, Luma([15]));
                img.put_pixel(x0 + size - 1 - t, y, Luma([15]));
            }
        }
        img
    }

    #[test]
    fn detector_finds_gap_outline() {
        let gap = Region {
            x1: 150,
            y1: 40,
            x2: 190,
            y2: 80,
        };
        let img = background_with_gap(150, 40, 40);
        let regions = EdgeGapDetector.detect(&img);
        assert!(!regions.is_empty());
        assert!(
            regions.iter().any(|r| r.intersects(&gap)),
            "no proposal overlaps the drawn gap: {:?}",
            regions
        );
    }

    #[test]
    fn detector_returns_empty_on_blank_background() {
        let img = flat(240, 140, 120);
        assert!(EdgeGapDetector.detect(&img).is_empty());
    }

    #[test]
    fn detector_caps_proposals() {
        // Many outlines scattered over a big background.
        let mut img = flat(480, 280, 120);
        for i in 0..6u32 {
            for j in 0..3u32 {
                let x0 = 10 + i * 78;
                let y0 = 10 + j * 90;
                for x in x0..x0 + 50 {
                    img.put_pixel(x, y0, Luma([10]));
                    img.put_pixel(x, y0 + 49, Luma([10]));
                }
                for y in y0..y0 + 50 {
                    img.put_pixel(x0, y, Luma([10]));
                    img.put_pixel(x0 + 49, y, Luma([10]));
                }
            }
        }
        assert!(EdgeGapDetector.detect(&img).len() <= MAX_PROPOSALS);
    }

    #[test]
    fn gate_rejects_flat_patch() {
        assert_eq!(
            ContrastGate.classify(&flat(64, 64, 200)),
            TemplateLabel::Degenerate
        );
    }

    #[test]
    fn gate_accepts_textured_patch() {
        let mut img = flat(64, 64, 40);
        for y in 0..64 {
            for x in 0..64 {
                if (x / 8 + y / 8) % 2 == 0 {
                    img.put_pixel(x, y, Luma([220]));
                }
            }
        }
        assert_eq!(ContrastGate.classify(&img), TemplateLabel::Legible);
    }

    #[test]
    fn region_geometry() {
        let r = Region {
            x1: 10,
            y1: 20,
            x2: 50,
            y2: 60,
        };
        assert_eq!(r.center(), (30, 40));
        assert_eq!(r.width(), 40);
        assert_eq!(r.height(), 40);
    }
}
