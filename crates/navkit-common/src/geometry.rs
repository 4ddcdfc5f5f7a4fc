//! 2D geometry operations on the XZ plane
//!
//! Navigation queries project everything onto the XZ plane (Y-up coordinate
//! system) and only use the Y component for height sampling. Polygons are
//! expected in the winding produced by the tile builders, for which
//! [`tri_area_2d`] of three consecutive vertices is positive.

/// Twice the signed area of the triangle `abc` on the XZ plane.
#[inline]
pub fn tri_area_2d(a: &[f32; 3], b: &[f32; 3], c: &[f32; 3]) -> f32 {
    let abx = b[0] - a[0];
    let abz = b[2] - a[2];
    let acx = c[0] - a[0];
    let acz = c[2] - a[2];
    acx * abz - abx * acz
}

/// 2D perp-dot product of `u` and `v` on the XZ plane.
#[inline]
pub fn perp_2d(u: &[f32; 3], v: &[f32; 3]) -> f32 {
    u[2] * v[0] - u[0] * v[2]
}

/// Check if two axis-aligned bounding boxes overlap.
#[inline]
pub fn overlap_bounds(amin: &[f32; 3], amax: &[f32; 3], bmin: &[f32; 3], bmax: &[f32; 3]) -> bool {
    amin[0] <= bmax[0]
        && amax[0] >= bmin[0]
        && amin[1] <= bmax[1]
        && amax[1] >= bmin[1]
        && amin[2] <= bmax[2]
        && amax[2] >= bmin[2]
}

/// Check if two quantized bounding boxes overlap.
#[inline]
pub fn overlap_quant_bounds(
    amin: &[u16; 3],
    amax: &[u16; 3],
    bmin: &[u16; 3],
    bmax: &[u16; 3],
) -> bool {
    amin[0] <= bmax[0]
        && amax[0] >= bmin[0]
        && amin[1] <= bmax[1]
        && amax[1] >= bmin[1]
        && amin[2] <= bmax[2]
        && amax[2] >= bmin[2]
}

/// Squared distance between two points on the XZ plane.
#[inline]
pub fn dist_sqr_2d(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let dx = b[0] - a[0];
    let dz = b[2] - a[2];
    dx * dx + dz * dz
}

/// Distance between two points on the XZ plane.
#[inline]
pub fn dist_2d(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    dist_sqr_2d(a, b).sqrt()
}

/// Squared distance from `pt` to the segment `p..q` on the XZ plane.
///
/// Returns the squared distance and the parameter of the closest point along
/// the segment, clamped to `[0, 1]`.
pub fn dist_point_segment_sqr_2d(pt: &[f32; 3], p: &[f32; 3], q: &[f32; 3]) -> (f32, f32) {
    let pqx = q[0] - p[0];
    let pqz = q[2] - p[2];
    let dx = pt[0] - p[0];
    let dz = pt[2] - p[2];
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);
    let dx = p[0] + t * pqx - pt[0];
    let dz = p[2] + t * pqz - pt[2];
    (dx * dx + dz * dz, t)
}

/// Point-in-polygon test on the XZ plane using the crossing rule.
///
/// Points exactly on an edge may be reported either way.
pub fn point_in_polygon_2d(pt: &[f32; 3], verts: &[[f32; 3]]) -> bool {
    let n = verts.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let vi = &verts[i];
        let vj = &verts[j];
        if ((vi[2] > pt[2]) != (vj[2] > pt[2]))
            && (pt[0] < (vj[0] - vi[0]) * (pt[2] - vi[2]) / (vj[2] - vi[2]) + vi[0])
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Squared distances from `pt` to every polygon edge.
///
/// Edge `j` runs from `verts[j]` to `verts[j + 1]` with wrap-around. `ed` and
/// `et` receive the
/// squared distance and segment parameter per edge. Returns whether the point
/// lies inside the polygon.
pub fn distance_pt_poly_edges_sqr(
    pt: &[f32; 3],
    verts: &[[f32; 3]],
    ed: &mut [f32],
    et: &mut [f32],
) -> bool {
    let n = verts.len();
    let mut inside = false;
    if n == 0 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let vi = &verts[i];
        let vj = &verts[j];
        if ((vi[2] > pt[2]) != (vj[2] > pt[2]))
            && (pt[0] < (vj[0] - vi[0]) * (pt[2] - vi[2]) / (vj[2] - vi[2]) + vi[0])
        {
            inside = !inside;
        }
        let (d, t) = dist_point_segment_sqr_2d(pt, vj, vi);
        ed[j] = d;
        et[j] = t;
        j = i;
    }
    inside
}

/// Result of clipping a segment against a convex polygon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPolyIntersection {
    /// Parametric entry point along the segment
    pub tmin: f32,
    /// Parametric exit point along the segment
    pub tmax: f32,
    /// Edge the segment enters through, if it starts outside
    pub seg_min: Option<usize>,
    /// Edge the segment leaves through, if it ends outside
    pub seg_max: Option<usize>,
}

/// Clips the segment `p0..p1` against a convex polygon on the XZ plane.
///
/// Edges are numbered by their first vertex: edge `j` runs from `verts[j]`
/// to `verts[j + 1]`. Returns `None` when the segment misses the polygon.
pub fn intersect_segment_poly_2d(
    p0: &[f32; 3],
    p1: &[f32; 3],
    verts: &[[f32; 3]],
) -> Option<SegmentPolyIntersection> {
    const EPS: f32 = 0.000_000_01;

    let n = verts.len();
    if n < 3 {
        return None;
    }

    let mut hit = SegmentPolyIntersection {
        tmin: 0.0,
        tmax: 1.0,
        seg_min: None,
        seg_max: None,
    };
    let dir = [p1[0] - p0[0], p1[1] - p0[1], p1[2] - p0[2]];

    let mut j = n - 1;
    for i in 0..n {
        let edge = [
            verts[i][0] - verts[j][0],
            verts[i][1] - verts[j][1],
            verts[i][2] - verts[j][2],
        ];
        let diff = [
            p0[0] - verts[j][0],
            p0[1] - verts[j][1],
            p0[2] - verts[j][2],
        ];
        let num = perp_2d(&edge, &diff);
        let den = perp_2d(&dir, &edge);
        if den.abs() < EPS {
            // Parallel to this edge: outside means no intersection at all
            if num < 0.0 {
                return None;
            }
            j = i;
            continue;
        }
        let t = num / den;
        if den < 0.0 {
            // Entering across this edge
            if t > hit.tmin {
                hit.tmin = t;
                hit.seg_min = Some(j);
                if hit.tmin > hit.tmax {
                    return None;
                }
            }
        } else if t < hit.tmax {
            hit.tmax = t;
            hit.seg_max = Some(j);
            if hit.tmax < hit.tmin {
                return None;
            }
        }
        j = i;
    }

    Some(hit)
}

/// Intersects segments `ap..aq` and `bp..bq` on the XZ plane.
///
/// Returns the parameters `(s, t)` along the first and second segment, or
/// `None` if they are parallel.
pub fn intersect_segments_2d(
    ap: &[f32; 3],
    aq: &[f32; 3],
    bp: &[f32; 3],
    bq: &[f32; 3],
) -> Option<(f32, f32)> {
    let u = [aq[0] - ap[0], 0.0, aq[2] - ap[2]];
    let v = [bq[0] - bp[0], 0.0, bq[2] - bp[2]];
    let w = [ap[0] - bp[0], 0.0, ap[2] - bp[2]];
    let d = perp_2d(&u, &v);
    if d.abs() < 1e-6 {
        return None;
    }
    Some((perp_2d(&v, &w) / d, perp_2d(&u, &w) / d))
}

/// Height of the triangle `abc` at the XZ location of `p`.
///
/// Returns `None` if `p` projects outside the triangle. Points on an edge
/// count as inside.
pub fn closest_height_point_triangle(
    p: &[f32; 3],
    a: &[f32; 3],
    b: &[f32; 3],
    c: &[f32; 3],
) -> Option<f32> {
    const EPS: f32 = 1e-6;

    let v0 = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    let v1 = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let v2 = [p[0] - a[0], p[1] - a[1], p[2] - a[2]];

    // Barycentric coordinates scaled by the triangle area
    let mut denom = v0[0] * v1[2] - v0[2] * v1[0];
    if denom.abs() < EPS {
        return None;
    }
    let mut u = v1[2] * v2[0] - v1[0] * v2[2];
    let mut v = v0[0] * v2[2] - v0[2] * v2[0];
    if denom < 0.0 {
        denom = -denom;
        u = -u;
        v = -v;
    }

    if u >= 0.0 && v >= 0.0 && (u + v) <= denom {
        Some(a[1] + (v0[1] * u + v1[1] * v) / denom)
    } else {
        None
    }
}

/// Centroid of a polygon's vertices.
pub fn calc_poly_center(verts: &[[f32; 3]]) -> [f32; 3] {
    let mut center = [0.0f32; 3];
    if verts.is_empty() {
        return center;
    }
    for v in verts {
        center[0] += v[0];
        center[1] += v[1];
        center[2] += v[2];
    }
    let s = 1.0 / verts.len() as f32;
    [center[0] * s, center[1] * s, center[2] * s]
}

/// Uniformly samples a point inside a convex polygon.
///
/// `s` selects the fan triangle weighted by area and `t` the point inside
/// it; both are expected in `[0, 1)`.
pub fn random_point_in_convex_poly(verts: &[[f32; 3]], s: f32, t: f32) -> [f32; 3] {
    let n = verts.len();
    if n < 3 {
        return verts.first().copied().unwrap_or([0.0; 3]);
    }

    let mut areas = [0.0f32; 16];
    let mut area_sum = 0.0;
    for i in 2..n.min(areas.len() + 2) {
        areas[i - 2] = tri_area_2d(&verts[0], &verts[i - 1], &verts[i]);
        area_sum += areas[i - 2].max(0.001);
    }

    let thr = s * area_sum;
    let mut acc = 0.0;
    let mut u = 1.0;
    let mut tri = n - 1;
    for i in 2..n.min(areas.len() + 2) {
        let da = areas[i - 2].max(0.001);
        if thr >= acc && thr < acc + da {
            u = (thr - acc) / da;
            tri = i;
            break;
        }
        acc += da;
    }

    let v = t.sqrt();
    let a = 1.0 - v;
    let b = (1.0 - u) * v;
    let c = u * v;
    let pa = &verts[0];
    let pb = &verts[tri - 1];
    let pc = &verts[tri];

    [
        a * pa[0] + b * pb[0] + c * pc[0],
        a * pa[1] + b * pb[1] + c * pc[1],
        a * pa[2] + b * pb[2] + c * pc[2],
    ]
}
