//! Patch similarity via local feature descriptors.
//!
//! Pipeline: corner keypoints on a radius-3 circle test, orientation from
//! the intensity centroid, 256-bit binary descriptors sampled over a fixed
//! seeded pattern, Hamming 2-NN matching filtered by the ratio test.

use image::GrayImage;
use lazy_static::lazy_static;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Nearest/second-nearest ratio for accepting a descriptor match.
/// Fixed design constant, not tunable at runtime.
const RATIO_TEST: f64 = 0.8;

const FAST_THRESHOLD: i16 = 20;
const FAST_ARC: usize = 9;
const MAX_KEYPOINTS: usize = 250;
const PATCH_MARGIN: u32 = 22;
const CENTROID_RADIUS: i32 = 7;
const DESCRIPTOR_BITS: usize = 256;
const PATTERN_SEED: u64 = 0x5144_4f43;
const PATTERN_RADIUS: i32 = 13;

/// Radius-3 circle used by the segment test, clockwise from 12 o'clock.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

lazy_static! {
    /// Sampling pattern shared by every descriptor. Seeded so the same
    /// binary layout is produced on every run.
    static ref PATTERN: Vec<((i32, i32), (i32, i32))> = {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        (0..DESCRIPTOR_BITS)
            .map(|_| {
                let p = (
                    rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                    rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                );
                let q = (
                    rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                    rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                );
                (p, q)
            })
            .collect()
    };
}

#[derive(Debug, Clone, Copy)]
struct Keypoint {
    x: u32,
    y: u32,
    score: u32,
}

#[derive(Clone)]
struct Descriptor {
    bits: [u8; DESCRIPTOR_BITS / 8],
}

impl Descriptor {
    fn hamming(&self, other: &Descriptor) -> u32 {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Similarity between a reference template patch and a candidate patch.
///
/// Returns `(similarity, match_count)` where similarity is the accepted
/// fraction of template descriptors. Zero descriptors on either side is a
/// legitimate "no similarity" result, never an error.
pub fn similarity(template: &GrayImage, candidate: &GrayImage) -> (f64, usize) {
    let tpl = describe(template);
    let cand = describe(candidate);
    // The 2-NN ratio test needs at least two candidate descriptors.
    if tpl.is_empty() || cand.len() < 2 {
        return (0.0, 0);
    }

    let mut good = 0usize;
    for d in &tpl {
        let mut best = u32::MAX;
        let mut second = u32::MAX;
        for c in &cand {
            let dist = d.hamming(c);
            if dist < best {
                second = best;
                best = dist;
            } else if dist < second {
                second = dist;
            }
        }
        if (best as f64) < RATIO_TEST * (second as f64) {
            good += 1;
        }
    }

    if good == 0 {
        return (0.0, 0);
    }
    (good as f64 / tpl.len() as f64, good)
}

fn describe(img: &GrayImage) -> Vec<Descriptor> {
    keypoints(img)
        .into_iter()
        .filter_map(|kp| descriptor_at(img, kp))
        .collect()
}

fn keypoints(img: &GrayImage) -> Vec<Keypoint> {
    let (w, h) = img.dimensions();
    if w <= 2 * PATCH_MARGIN || h <= 2 * PATCH_MARGIN {
        return Vec::new();
    }

    let mut scores = vec![0u32; (w * h) as usize];
    let mut found = Vec::new();
    for y in PATCH_MARGIN..h - PATCH_MARGIN {
        for x in PATCH_MARGIN..w - PATCH_MARGIN {
            if let Some(score) = corner_score(img, x, y) {
                scores[(y * w + x) as usize] = score;
                found.push(Keypoint { x, y, score });
            }
        }
    }

    // 3x3 non-maximum suppression, then cap by score.
    let mut kept: Vec<Keypoint> = found
        .into_iter()
        .filter(|kp| {
            let mut max_neighbor = 0u32;
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = (kp.x as i32 + dx) as u32;
                    let ny = (kp.y as i32 + dy) as u32;
                    max_neighbor = max_neighbor.max(scores[(ny * w + nx) as usize]);
                }
            }
            kp.score >= max_neighbor
        })
        .collect();
    kept.sort_by(|a, b| b.score.cmp(&a.score));
    kept.truncate(MAX_KEYPOINTS);
    kept
}

/// Segment test: at least `FAST_ARC` contiguous circle pixels all brighter
/// or all darker than the center by the threshold.
fn corner_score(img: &GrayImage, x: u32, y: u32) -> Option<u32> {
    let center = img.get_pixel(x, y)[0] as i16;
    let mut brighter = [false; 16];
    let mut darker = [false; 16];
    let mut score = 0u32;
    for (i, (dx, dy)) in CIRCLE.iter().enumerate() {
        let p = img.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)[0] as i16;
        let diff = p - center;
        brighter[i] = diff > FAST_THRESHOLD;
        darker[i] = diff < -FAST_THRESHOLD;
        score += diff.unsigned_abs() as u32;
    }
    if has_arc(&brighter) || has_arc(&darker) {
        Some(score)
    } else {
        None
    }
}

fn has_arc(flags: &[bool; 16]) -> bool {
    for start in 0..16 {
        let mut run = 0;
        while run < FAST_ARC && flags[(start + run) % 16] {
            run += 1;
        }
        if run >= FAST_ARC {
            return true;
        }
    }
    false
}

/// Orientation from the patch intensity centroid.
fn orientation(img: &GrayImage, kp: Keypoint) -> f32 {
    let mut m10 = 0i64;
    let mut m01 = 0i64;
    for dy in -CENTROID_RADIUS..=CENTROID_RADIUS {
        for dx in -CENTROID_RADIUS..=CENTROID_RADIUS {
            if dx * dx + dy * dy > CENTROID_RADIUS * CENTROID_RADIUS {
                continue;
            }
            let p = img.get_pixel((kp.x as i32 + dx) as u32, (kp.y as i32 + dy) as u32)[0] as i64;
            m10 += dx as i64 * p;
            m01 += dy as i64 * p;
        }
    }
    (m01 as f32).atan2(m10 as f32)
}

fn descriptor_at(img: &GrayImage, kp: Keypoint) -> Option<Descriptor> {
    let (w, h) = img.dimensions();
    let theta = orientation(img, kp);
    let (sin, cos) = theta.sin_cos();

    let mut bits = [0u8; DESCRIPTOR_BITS / 8];
    for (i, (p, q)) in PATTERN.iter().enumerate() {
        let a = rotated_sample(img, w, h, kp, *p, sin, cos)?;
        let b = rotated_sample(img, w, h, kp, *q, sin, cos)?;
        if a > b {
            bits[i / 8] |= 1 << (i % 8);
        }
    }
    Some(Descriptor { bits })
}

fn rotated_sample(
    img: &GrayImage,
    w: u32,
    h: u32,
    kp: Keypoint,
    (px, py): (i32, i32),
    sin: f32,
    cos: f32,
) -> Option<u16> {
    let rx = (px as f32 * cos - py as f32 * sin).round() as i32;
    let ry = (px as f32 * sin + py as f32 * cos).round() as i32;
    let x = kp.x as i32 + rx;
    let y = kp.y as i32 + ry;
    if x < 1 || y < 1 || x as u32 >= w - 1 || y as u32 >= h - 1 {
        return None;
    }
    // 3x3 box mean dampens single-pixel noise before the comparison.
    let mut sum = 0u16;
    for dy in -1i32..=1 {
        for dx in -1i32..=1 {
            sum += img.get_pixel((x + dx) as u32, (y + dy) as u32)[0] as u16;
        }
    }
    Some(sum / 9)
}
