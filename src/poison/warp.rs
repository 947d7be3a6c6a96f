//! Smooth random warping fields.
//!
//! Grids are `[1, H, W, 2]` tensors of normalized sampling coordinates in
//! [-1, 1], last axis `(x, y)`, with corner pixels at exactly ±1.

use ndarray::{s, Array2, Array3, Array4, ArrayView2, Axis};
use rand::Rng;

/// Identity grid plus the fixed random displacement of one warping attack.
#[derive(Debug, Clone, PartialEq)]
pub struct WarpGrids {
    identity: Array4<f32>,
    noise: Array4<f32>,
}

impl WarpGrids {
    /// Draw a `k×k` control grid in [-1, 1], normalize it by its mean
    /// magnitude and upsample it to `size×size`.
    pub fn random<R: Rng + ?Sized>(size: usize, k: usize, rng: &mut R) -> Self {
        let k = k.max(1);
        let mut control = Array3::<f32>::zeros((2, k, k));
        control.mapv_inplace(|_| rng.gen::<f32>() * 2.0 - 1.0);
        let mean_abs = control.mapv(f32::abs).mean().unwrap_or(1.0);
        if mean_abs > 0.0 {
            control.mapv_inplace(|v| v / mean_abs);
        }

        let mut noise = Array4::<f32>::zeros((1, size, size, 2));
        for (axis, plane) in control.outer_iter().enumerate() {
            noise
                .slice_mut(s![0, .., .., axis])
                .assign(&upsample_bilinear(&plane, size));
        }

        Self {
            identity: identity_grid(size),
            noise,
        }
    }

    pub fn identity(&self) -> &Array4<f32> {
        &self.identity
    }

    pub fn noise(&self) -> &Array4<f32> {
        &self.noise
    }

    pub fn size(&self) -> usize {
        self.identity.len_of(Axis(1))
    }

    /// `clamp((identity + s·noise / H) · rescale, -1, 1)` as an `[H, W, 2]` field.
    pub fn field(&self, strength: f32, rescale: f32) -> Array3<f32> {
        let height = self.size().max(1) as f32;
        let identity = self.identity.index_axis(Axis(0), 0);
        let noise = self.noise.index_axis(Axis(0), 0);
        let mut field = &identity + &(&noise * (strength / height));
        field.mapv_inplace(|v| (v * rescale).clamp(-1.0, 1.0));
        field
    }
}

/// Sampling coordinates that reproduce the input unchanged.
pub fn identity_grid(size: usize) -> Array4<f32> {
    let span = size.saturating_sub(1).max(1) as f32;
    Array4::from_shape_fn((1, size, size, 2), |(_, i, j, c)| {
        let idx = if c == 0 { j } else { i };
        if size > 1 {
            -1.0 + 2.0 * idx as f32 / span
        } else {
            0.0
        }
    })
}

/// Resample a square plane to `size×size` with corners aligned.
fn upsample_bilinear(plane: &ArrayView2<'_, f32>, size: usize) -> Array2<f32> {
    let (h, w) = plane.dim();
    let scale = |n: usize| {
        if size > 1 && n > 1 {
            (n - 1) as f32 / (size - 1) as f32
        } else {
            0.0
        }
    };
    let (sy, sx) = (scale(h), scale(w));
    Array2::from_shape_fn((size, size), |(i, j)| {
        sample_view(plane, j as f32 * sx, i as f32 * sy)
    })
}

/// Resample a C×H×W image through an `[H, W, 2]` coordinate field.
pub fn grid_sample(image: &Array3<f32>, field: &Array3<f32>) -> Array3<f32> {
    let (channels, h, w) = image.dim();
    let to_pixel = |v: f32, n: usize| (v + 1.0) / 2.0 * (n.max(1) - 1) as f32;

    let mut out = Array3::<f32>::zeros((channels, h, w));
    for i in 0..h {
        for j in 0..w {
            let x = to_pixel(field[[i, j, 0]], w);
            let y = to_pixel(field[[i, j, 1]], h);
            for c in 0..channels {
                let plane = image.index_axis(Axis(0), c);
                out[[c, i, j]] = sample_view(&plane, x, y);
            }
        }
    }
    out
}

/// Bilinear lookup at pixel coordinates; zero outside the plane.
fn sample_view(plane: &ArrayView2<'_, f32>, x: f32, y: f32) -> f32 {
    let (h, w) = plane.dim();
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let mut acc = 0.0;
    for (dy, wy) in [(0.0, 1.0 - fy), (1.0, fy)] {
        for (dx, wx) in [(0.0, 1.0 - fx), (1.0, fx)] {
            let (px, py) = (x0 + dx, y0 + dy);
            if wx * wy == 0.0 || px < 0.0 || py < 0.0 || px >= w as f32 || py >= h as f32 {
                continue;
            }
            acc += wx * wy * plane[[py as usize, px as usize]];
        }
    }
    acc
}
