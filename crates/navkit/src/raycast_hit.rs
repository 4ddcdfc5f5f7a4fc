//! Raycast along the navigation mesh surface
//!
//! The ray is walked polygon by polygon on the XZ plane, crossing links whose
//! edge it exits through, until it either ends inside a polygon or leaves
//! through an edge with no passable neighbor.

use navkit_common::{intersect_segment_poly_2d, vlerp, vnormalize_2d, vis_finite, Result};

use super::{NavMesh, PolyRef, PolyType, QueryFilter, Status, LINK_INTERNAL};

/// Provides information about a raycast hit
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    /// Hit parameter along the segment, `f32::MAX` when the ray reached its end
    pub t: f32,
    /// Normal of the wall that was hit
    pub hit_normal: [f32; 3],
    /// Edge of the last polygon the ray left through
    pub hit_edge_index: Option<usize>,
    /// Polygons visited, in order
    pub path: Vec<PolyRef>,
    /// Cost of the visited part of the segment
    pub path_cost: f32,
}

impl RaycastHit {
    fn new() -> Self {
        Self {
            t: 0.0,
            hit_normal: [0.0; 3],
            hit_edge_index: None,
            path: Vec::new(),
            path_cost: 0.0,
        }
    }

    /// Checks if the ray was stopped by a wall
    pub fn hit_wall(&self) -> bool {
        self.t < f32::MAX
    }

    /// Hit fraction in `[0, 1]`, or `None` when the ray reached its end
    pub fn hit_fraction(&self) -> Option<f32> {
        self.hit_wall().then_some(self.t)
    }

    /// Point where the ray stopped
    pub fn hit_point(&self, start: &[f32; 3], end: &[f32; 3]) -> [f32; 3] {
        match self.hit_fraction() {
            Some(t) => vlerp(start, end, t),
            None => *end,
        }
    }
}

/// Casts a ray from `start_pos` in polygon `start_ref` toward `end_pos`
///
/// Off-mesh connections are never followed. At most `max_path` visited
/// polygons are recorded.
pub fn raycast(
    mesh: &NavMesh,
    start_ref: PolyRef,
    start_pos: &[f32; 3],
    end_pos: &[f32; 3],
    filter: &QueryFilter,
    max_path: usize,
) -> Result<RaycastHit> {
    if !mesh.is_valid_poly_ref(start_ref) {
        return Err(Status::InvalidStart.into());
    }
    if !vis_finite(start_pos) || !vis_finite(end_pos) {
        return Err(Status::InvalidParam.into());
    }

    let mut hit = RaycastHit::new();
    let mut cur_ref = start_ref;
    let mut cur_pos = *start_pos;

    loop {
        let (tile, poly) = mesh.get_tile_and_poly_by_ref(cur_ref)?;
        let (verts, n) = tile.poly_vertices(poly);

        let Some(ix) = intersect_segment_poly_2d(start_pos, end_pos, &verts[..n]) else {
            // Could not hit the polygon, keep the old t and report a hit
            return Ok(hit);
        };
        hit.hit_edge_index = ix.seg_max;
        if ix.tmax > hit.t {
            hit.t = ix.tmax;
        }
        if hit.path.len() < max_path {
            hit.path.push(cur_ref);
        }

        let last_pos = cur_pos;
        let Some(seg_max) = ix.seg_max else {
            // Ray ends inside the polygon
            hit.path_cost += filter.get_cost(&last_pos, end_pos, poly.area);
            hit.t = f32::MAX;
            return Ok(hit);
        };
        cur_pos = vlerp(start_pos, end_pos, hit.t);
        hit.path_cost += filter.get_cost(&last_pos, &cur_pos, poly.area);

        let mut next_ref = None;
        for link in tile.poly_links(poly) {
            if link.edge as usize != seg_max {
                continue;
            }
            let Ok((_, next_poly)) = mesh.get_tile_and_poly_by_ref(link.reference) else {
                continue;
            };
            if next_poly.poly_type == PolyType::OffMeshConnection
                || !filter.pass_filter(next_poly)
            {
                continue;
            }

            if link.side == LINK_INTERNAL || !link.is_partial() {
                next_ref = Some(link.reference);
                break;
            }

            // Partial portal: the crossing must fall inside the shared part
            let v0 = verts[link.edge as usize];
            let v1 = verts[(link.edge as usize + 1) % n];
            let axis = match link.side {
                0 | 4 => 2,
                2 | 6 => 0,
                _ => continue,
            };
            let s = 1.0 / 255.0;
            let mut lmin = v0[axis] + (v1[axis] - v0[axis]) * (link.bmin as f32 * s);
            let mut lmax = v0[axis] + (v1[axis] - v0[axis]) * (link.bmax as f32 * s);
            if lmin > lmax {
                std::mem::swap(&mut lmin, &mut lmax);
            }
            let c = start_pos[axis] + (end_pos[axis] - start_pos[axis]) * ix.tmax;
            if c >= lmin && c <= lmax {
                next_ref = Some(link.reference);
                break;
            }
        }

        match next_ref {
            Some(r) => cur_ref = r,
            None => {
                // Wall hit: normal of the exit edge
                let a = verts[seg_max];
                let b = verts[(seg_max + 1) % n];
                let dx = b[0] - a[0];
                let dz = b[2] - a[2];
                hit.hit_normal = vnormalize_2d(&[dz, 0.0, -dx]);
                return Ok(hit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::*;
    use navkit_common::Error;

    #[test]
    fn test_ray_inside_mesh() -> Result<()> {
        let mesh = build_grid_mesh(1, 1, &GridLayout::default())?;
        let start = [0.5, 0.0, 0.5];
        let end = [3.5, 0.0, 0.5];
        let hit = raycast(&mesh, poly_at(&mesh, &start)?, &start, &end, &QueryFilter::default(), 32)?;
        assert!(!hit.hit_wall());
        assert_eq!(hit.hit_fraction(), None);
        assert_eq!(hit.path.len(), 4);
        assert!((hit.path_cost - 3.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_ray_hits_wall() -> Result<()> {
        let layout = GridLayout {
            blocked: vec![(2, 0)],
            ..GridLayout::default()
        };
        let mesh = build_grid_mesh(1, 1, &layout)?;
        let start = [0.5, 0.0, 0.5];
        let end = [3.5, 0.0, 0.5];
        let hit = raycast(&mesh, poly_at(&mesh, &start)?, &start, &end, &QueryFilter::default(), 32)?;
        assert!(hit.hit_wall());
        // Wall at x = 2 along a 3 unit ray from x = 0.5
        let t = hit.hit_fraction().expect("hit");
        assert!((t - 0.5).abs() < 1e-4);
        assert!((hit.hit_normal[0] + 1.0).abs() < 1e-4);
        assert_eq!(hit.path.len(), 2);
        let p = hit.hit_point(&start, &end);
        assert!((p[0] - 2.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_ray_leaving_mesh_edge() -> Result<()> {
        let mesh = build_grid_mesh(1, 1, &GridLayout::default())?;
        let start = [3.5, 0.0, 0.5];
        let end = [6.0, 0.0, 0.5];
        let hit = raycast(&mesh, poly_at(&mesh, &start)?, &start, &end, &QueryFilter::default(), 32)?;
        assert!(hit.hit_wall());
        assert!((hit.t - 0.2).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_ray_crosses_tiles() -> Result<()> {
        let mesh = build_grid_mesh(2, 1, &GridLayout::default())?;
        let start = [0.5, 0.0, 0.5];
        let end = [7.5, 0.0, 0.5];
        let hit = raycast(&mesh, poly_at(&mesh, &start)?, &start, &end, &QueryFilter::default(), 32)?;
        assert!(!hit.hit_wall());
        assert_eq!(hit.path.len(), 8);
        Ok(())
    }

    #[test]
    fn test_ray_invalid_start() -> Result<()> {
        let mesh = build_grid_mesh(1, 1, &GridLayout::default())?;
        let err = raycast(&mesh, PolyRef::new(0), &[0.0; 3], &[1.0; 3], &QueryFilter::default(), 8);
        assert!(matches!(err, Err(Error::InvalidReference(_))));
        Ok(())
    }
}
