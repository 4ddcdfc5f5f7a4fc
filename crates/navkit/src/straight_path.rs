//! Corridor string pulling
//!
//! Reduces a polygon corridor to the shortest sequence of straight segments
//! that stays inside it, using the funnel algorithm over the corridor's
//! portals. Off-mesh connections collapse their portal to a single point so
//! their endpoints always show up as waypoints.

use navkit_common::{dist_point_segment_sqr_2d, tri_area_2d, vequal, Result};

use super::{NavMesh, PolyRef, PolyType, Status};

bitflags::bitflags! {
    /// Role of a straight path waypoint
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StraightPathFlags: u8 {
        /// The path start
        const START = 0x01;
        /// The path end
        const END = 0x02;
        /// The start of an off-mesh connection
        const OFFMESH_CONNECTION = 0x04;
    }
}

/// One waypoint of a straight path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StraightPathPoint {
    pub pos: [f32; 3],
    pub flags: StraightPathFlags,
    /// Polygon entered at this point, invalid for the end point
    pub poly: PolyRef,
}

/// Waypoints produced by [`find_straight_path`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StraightPath {
    pub points: Vec<StraightPathPoint>,
    /// Output was cut at the requested maximum
    pub truncated: bool,
}

impl StraightPath {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn positions(&self) -> Vec<[f32; 3]> {
        self.points.iter().map(|p| p.pos).collect()
    }

    /// Appends a waypoint, merging it into the last one when they coincide
    ///
    /// Returns false once no more points should be added.
    fn append(&mut self, pos: [f32; 3], flags: StraightPathFlags, poly: PolyRef, max: usize) -> bool {
        if let Some(last) = self.points.last_mut() {
            if vequal(&last.pos, &pos) {
                last.flags = flags;
                last.poly = poly;
                return !flags.contains(StraightPathFlags::END);
            }
        }
        if let [.., prev, last] = self.points.as_slice() {
            if last.flags.is_empty() && lies_between(&prev.pos, &last.pos, &pos) {
                self.points.pop();
            }
        }
        if self.points.len() >= max {
            self.truncated = true;
            return false;
        }
        self.points.push(StraightPathPoint { pos, flags, poly });
        if flags.contains(StraightPathFlags::END) {
            return false;
        }
        if self.points.len() >= max {
            self.truncated = true;
            return false;
        }
        true
    }
}

/// Whether `p` sits on the segment `a`-`b`, so a corner there adds no turn
fn lies_between(a: &[f32; 3], p: &[f32; 3], b: &[f32; 3]) -> bool {
    const EPS: f32 = 1e-4;
    let (abx, abz) = (b[0] - a[0], b[2] - a[2]);
    let len_sqr = abx * abx + abz * abz;
    if len_sqr < EPS * EPS || tri_area_2d(a, p, b).abs() > EPS * len_sqr.sqrt() {
        return false;
    }
    let t = ((p[0] - a[0]) * abx + (p[2] - a[2]) * abz) / len_sqr;
    if !(0.0..=1.0).contains(&t) {
        return false;
    }
    (a[1] + (b[1] - a[1]) * t - p[1]).abs() < 0.01
}

/// Finds the straight path from `start_pos` to `end_pos` along a corridor
///
/// Both points are clamped onto the first and last corridor polygon. The
/// result is truncated, never failed, when `max_points` is reached.
pub fn find_straight_path(
    mesh: &NavMesh,
    start_pos: &[f32; 3],
    end_pos: &[f32; 3],
    path: &[PolyRef],
    max_points: usize,
) -> Result<StraightPath> {
    let (Some(&first), Some(&last)) = (path.first(), path.last()) else {
        return Err(Status::InvalidParam.into());
    };
    if max_points == 0 {
        return Err(Status::InvalidParam.into());
    }

    let closest_start = mesh.closest_point_on_poly_boundary(first, start_pos)?;
    let mut closest_end = mesh.closest_point_on_poly_boundary(last, end_pos)?;

    let mut out = StraightPath::default();
    if !out.append(closest_start, StraightPathFlags::START, first, max_points) {
        return Ok(out);
    }

    if path.len() > 1 {
        let mut portal_apex = closest_start;
        let mut portal_left = portal_apex;
        let mut portal_right = portal_apex;
        let mut apex_index;
        let mut left_index = 0;
        let mut right_index = 0;
        let mut left_poly_type = PolyType::Ground;
        let mut right_poly_type = PolyType::Ground;
        let mut left_poly_ref = first;
        let mut right_poly_ref = first;

        let mut i = 0;
        while i < path.len() {
            let (left, right, to_type) = if i + 1 < path.len() {
                match mesh.get_portal_points(path[i], path[i + 1]) {
                    Ok((l, r, _, to_type)) => (l, r, to_type),
                    Err(_) => {
                        // Broken corridor: stop at the last reachable polygon
                        closest_end = mesh.closest_point_on_poly_boundary(path[i], end_pos)?;
                        out.append(
                            closest_end,
                            StraightPathFlags::END,
                            PolyRef::default(),
                            max_points,
                        );
                        return Ok(out);
                    }
                }
            } else {
                (closest_end, closest_end, PolyType::Ground)
            };

            if i == 0 {
                // Start sits on the first portal
                let (d, _) = dist_point_segment_sqr_2d(&portal_apex, &left, &right);
                if d < 0.001 * 0.001 {
                    i += 1;
                    continue;
                }
            }

            let next_ref = path.get(i + 1).copied().unwrap_or_default();

            // Right side of the funnel
            if tri_area_2d(&portal_apex, &portal_right, &right) <= 0.0 {
                if vequal(&portal_apex, &portal_right)
                    || tri_area_2d(&portal_apex, &portal_left, &right) > 0.0
                {
                    portal_right = right;
                    right_poly_ref = next_ref;
                    right_poly_type = to_type;
                    right_index = i;
                } else {
                    portal_apex = portal_left;
                    apex_index = left_index;
                    let flags = if left_poly_type == PolyType::OffMeshConnection {
                        StraightPathFlags::OFFMESH_CONNECTION
                    } else {
                        StraightPathFlags::empty()
                    };
                    if !out.append(portal_apex, flags, left_poly_ref, max_points) {
                        return Ok(out);
                    }
                    portal_left = portal_apex;
                    portal_right = portal_apex;
                    left_index = apex_index;
                    right_index = apex_index;
                    i = apex_index + 1;
                    continue;
                }
            }

            // Left side of the funnel
            if tri_area_2d(&portal_apex, &portal_left, &left) >= 0.0 {
                if vequal(&portal_apex, &portal_left)
                    || tri_area_2d(&portal_apex, &portal_right, &left) < 0.0
                {
                    portal_left = left;
                    left_poly_ref = next_ref;
                    left_poly_type = to_type;
                    left_index = i;
                } else {
                    portal_apex = portal_right;
                    apex_index = right_index;
                    let flags = if right_poly_type == PolyType::OffMeshConnection {
                        StraightPathFlags::OFFMESH_CONNECTION
                    } else {
                        StraightPathFlags::empty()
                    };
                    if !out.append(portal_apex, flags, right_poly_ref, max_points) {
                        return Ok(out);
                    }
                    portal_left = portal_apex;
                    portal_right = portal_apex;
                    left_index = apex_index;
                    right_index = apex_index;
                    i = apex_index + 1;
                    continue;
                }
            }

            i += 1;
        }
    }

    out.append(
        closest_end,
        StraightPathFlags::END,
        PolyRef::default(),
        max_points,
    );
    Ok(out)
}
