//! Vector helpers on `[f32; 3]`
//!
//! Mesh data is stored as flat float arrays, so the hot query paths work on
//! plain arrays. [`to_vec3`] and [`from_vec3`] bridge to `glam` for callers
//! that prefer it.

use glam::Vec3;

/// Threshold below which two points are considered equal in [`vequal`]
pub const VEQUAL_THRESHOLD: f32 = 1.0 / 16384.0;

#[inline]
pub fn vadd(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn vsub(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vscale(v: &[f32; 3], s: f32) -> [f32; 3] {
    [v[0] * s, v[1] * s, v[2] * s]
}

/// Returns `a + b * s`.
#[inline]
pub fn vmad(a: &[f32; 3], b: &[f32; 3], s: f32) -> [f32; 3] {
    [a[0] + b[0] * s, a[1] + b[1] * s, a[2] + b[2] * s]
}

/// Linear interpolation between `a` and `b`.
#[inline]
pub fn vlerp(a: &[f32; 3], b: &[f32; 3], t: f32) -> [f32; 3] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
    ]
}

#[inline]
pub fn vmin(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0].min(b[0]), a[1].min(b[1]), a[2].min(b[2])]
}

#[inline]
pub fn vmax(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0].max(b[0]), a[1].max(b[1]), a[2].max(b[2])]
}

#[inline]
pub fn vdist_sqr(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let d = vsub(b, a);
    d[0] * d[0] + d[1] * d[1] + d[2] * d[2]
}

#[inline]
pub fn vdist(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    vdist_sqr(a, b).sqrt()
}

/// Checks whether two points are equal within [`VEQUAL_THRESHOLD`].
#[inline]
pub fn vequal(a: &[f32; 3], b: &[f32; 3]) -> bool {
    vdist_sqr(a, b) < VEQUAL_THRESHOLD * VEQUAL_THRESHOLD
}

/// Checks that every component is finite.
#[inline]
pub fn vis_finite(v: &[f32; 3]) -> bool {
    v.iter().all(|c| c.is_finite())
}

/// Normalizes `v` on the XZ plane, leaving Y at zero.
///
/// Returns a zero vector for degenerate input.
pub fn vnormalize_2d(v: &[f32; 3]) -> [f32; 3] {
    let len = (v[0] * v[0] + v[2] * v[2]).sqrt();
    if len > f32::EPSILON {
        [v[0] / len, 0.0, v[2] / len]
    } else {
        [0.0; 3]
    }
}

#[inline]
pub fn to_vec3(v: &[f32; 3]) -> Vec3 {
    Vec3::from_array(*v)
}

#[inline]
pub fn from_vec3(v: Vec3) -> [f32; 3] {
    v.to_array()
}
