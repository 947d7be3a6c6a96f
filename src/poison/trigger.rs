//! Trigger assets and the pixel-space operations built on them.

use crate::models::{PoisonsetError, Result};
use crate::store::load_tensor;
use ndarray::{Array2, Array3, Axis, Ix2, Ix3, Zip};
use rand::seq::index;
use rand::Rng;
use std::path::Path;
use tracing::debug;

/// Overlay image plus its blend mask.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerMark {
    name: String,
    mark: Array3<f32>,
    mask: Array2<f32>,
}

impl TriggerMark {
    /// Build a trigger; without an explicit mask every pixel that is
    /// non-zero in any channel is masked in.
    pub fn new(name: impl Into<String>, mark: Array3<f32>, mask: Option<Array2<f32>>) -> Result<Self> {
        let (_, h, w) = mark.dim();
        let mask = match mask {
            Some(mask) => {
                if mask.dim() != (h, w) {
                    return Err(PoisonsetError::InvalidParameter(format!(
                        "trigger mask is {:?}, mark is {h}x{w}",
                        mask.dim()
                    )));
                }
                mask
            }
            None => mark.map_axis(Axis(0), |px| {
                if px.iter().any(|&v| v > 0.0) {
                    1.0
                } else {
                    0.0
                }
            }),
        };
        Ok(Self {
            name: name.into(),
            mark,
            mask,
        })
    }

    /// Load `<dir>/<name>` and, if present, `<dir>/mask_<name>`.
    ///
    /// The mark must match `shape` (C, H, W). A mask file may be H×W or
    /// C×H×W; only its first channel is used.
    pub fn load(dir: &Path, name: &str, shape: (usize, usize, usize)) -> Result<Self> {
        let path = dir.join(name);
        if !path.exists() {
            return Err(PoisonsetError::missing(
                format!("trigger '{name}'"),
                &path,
                format!("place the trigger under {} or pass another trigger name", dir.display()),
            ));
        }
        debug!(trigger = %path.display(), "Loading trigger");

        let mark = load_tensor(&path)?
            .into_dimensionality::<Ix3>()
            .map_err(|_| PoisonsetError::InvalidParameter(format!("trigger '{name}' is not C×H×W")))?;
        if mark.dim() != shape {
            return Err(PoisonsetError::InvalidParameter(format!(
                "trigger '{name}' is {:?}, images are {shape:?}",
                mark.dim()
            )));
        }

        let mask_path = dir.join(format!("mask_{name}"));
        let mask = if mask_path.exists() {
            let raw = load_tensor(&mask_path)?;
            let mask = match raw.ndim() {
                2 => raw.into_dimensionality::<Ix2>().ok(),
                3 => raw
                    .into_dimensionality::<Ix3>()
                    .ok()
                    .map(|m| m.index_axis(Axis(0), 0).to_owned()),
                _ => None,
            };
            Some(mask.ok_or_else(|| {
                PoisonsetError::InvalidParameter(format!("mask for trigger '{name}' has bad rank"))
            })?)
        } else {
            None
        };

        Self::new(name, mark, mask)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mask(&self) -> &Array2<f32> {
        &self.mask
    }

    /// `x ← x·(1 − α·m) + mark·α·m`
    pub fn stamp(&self, image: &mut Array3<f32>, alpha: f32) {
        self.blend_where(image, alpha, &self.mask);
    }

    /// `x ← (1 − α)·x + α·mark` over the whole image.
    pub fn blend(&self, image: &mut Array3<f32>, alpha: f32) {
        for (mut channel, mark) in image.outer_iter_mut().zip(self.mark.outer_iter()) {
            Zip::from(&mut channel).and(&mark).for_each(|x, &t| {
                *x = (1.0 - alpha) * *x + alpha * t;
            });
        }
    }

    /// Blend only where `region` is set.
    pub fn blend_where(&self, image: &mut Array3<f32>, alpha: f32, region: &Array2<f32>) {
        for (mut channel, mark) in image.outer_iter_mut().zip(self.mark.outer_iter()) {
            Zip::from(&mut channel)
                .and(&mark)
                .and(region)
                .for_each(|x, &t, &m| {
                    let a = alpha * m;
                    *x = *x * (1.0 - a) + t * a;
                });
        }
    }
}

/// Add a horizontal sinusoid: `x[.., j] += δ·sin(2π·j·f / W)`.
pub fn add_sinusoid(image: &mut Array3<f32>, delta: f32, frequency: f32) {
    let (_, _, width) = image.dim();
    for ((_, _, j), x) in image.indexed_iter_mut() {
        let phase = 2.0 * std::f32::consts::PI * j as f32 * frequency / width as f32;
        *x += delta * phase.sin();
    }
}

/// `k` checkerboard patches (at most 4), one per image corner in the order
/// top-left, bottom-right, top-right, bottom-left. Each patch is opaque over
/// its whole square, dark cells included.
pub fn corner_patches(shape: (usize, usize, usize), k: usize) -> Result<Vec<TriggerMark>> {
    let (c, h, w) = shape;
    if !(1..=4).contains(&k) {
        return Err(PoisonsetError::InvalidParameter(format!(
            "corner patches come in 1 to 4 ways, got {k}"
        )));
    }
    let side = (h.min(w) / 8).max(3);
    if side + 1 > h.min(w) / 2 {
        return Err(PoisonsetError::InvalidParameter(format!(
            "{h}x{w} images are too small for corner patches"
        )));
    }

    let (far_i, far_j) = (h - 1 - side, w - 1 - side);
    let origins = [(1, 1), (far_i, far_j), (1, far_j), (far_i, 1)];
    origins
        .into_iter()
        .take(k)
        .enumerate()
        .map(|(way, (oi, oj))| {
            let mut mark = Array3::<f32>::zeros((c, h, w));
            let mut mask = Array2::<f32>::zeros((h, w));
            for i in 0..side {
                for j in 0..side {
                    mask[[oi + i, oj + j]] = 1.0;
                    if (i + j) % 2 == 0 {
                        for ch in 0..c {
                            mark[[ch, oi + i, oj + j]] = 1.0;
                        }
                    }
                }
            }
            TriggerMark::new(format!("corner_{way}"), mark, Some(mask))
        })
        .collect()
}

/// Split an `h×w` plane into `pieces` equal tiles (a square grid) and set a
/// random `mask_rate` share of them to one.
pub fn piece_mask<R: Rng + ?Sized>(
    h: usize,
    w: usize,
    pieces: usize,
    mask_rate: f64,
    rng: &mut R,
) -> Array2<f32> {
    let side = (pieces as f64).sqrt().round().max(1.0) as usize;
    let tile_h = h.div_ceil(side);
    let tile_w = w.div_ceil(side);
    let tiles = side * side;
    let chosen = ((tiles as f64) * mask_rate).round() as usize;

    let mut mask = Array2::<f32>::zeros((h, w));
    for tile in index::sample(rng, tiles, chosen.min(tiles)) {
        let (ti, tj) = (tile / side, tile % side);
        let rows = (ti * tile_h)..((ti + 1) * tile_h).min(h);
        let cols = (tj * tile_w)..((tj + 1) * tile_w).min(w);
        for i in rows {
            for j in cols.clone() {
                mask[[i, j]] = 1.0;
            }
        }
    }
    mask
}
