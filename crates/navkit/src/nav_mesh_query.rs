//! Navigation mesh query implementation
//!
//! This module contains the [`NavMeshQuery`] structure, which is used to
//! perform pathfinding and other queries on the navigation mesh.

use navkit_common::{random_point_in_convex_poly, tri_area_2d, Result};

use super::raycast_hit::{raycast, RaycastHit};
use super::sliced_pathfinding::{PathCorridor, SlicedFindPath, SlicedPathState};
use super::straight_path::{find_straight_path, StraightPath};
use super::{NavMesh, PolyRef, PolyType, QueryFilter, Status, TileRef};

/// Query interface over a navigation mesh
///
/// Holds the node budget for path searches and at most one in-flight sliced
/// search started through [`NavMeshQuery::init_sliced_find_path`].
#[derive(Debug)]
pub struct NavMeshQuery<'a> {
    nav_mesh: &'a NavMesh,
    max_nodes: usize,
    sliced: Option<SlicedFindPath>,
}

impl<'a> NavMeshQuery<'a> {
    /// Creates a query whose searches may allocate up to `max_nodes` nodes
    pub fn new(nav_mesh: &'a NavMesh, max_nodes: usize) -> Self {
        Self {
            nav_mesh,
            max_nodes: max_nodes.max(1),
            sliced: None,
        }
    }

    pub fn nav_mesh(&self) -> &NavMesh {
        self.nav_mesh
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    /// Finds the polygon nearest to `center` within the query box
    pub fn find_nearest_poly(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &QueryFilter,
    ) -> Result<Option<(PolyRef, [f32; 3])>> {
        self.nav_mesh.find_nearest_poly(center, half_extents, filter)
    }

    /// Polygons overlapping the query box
    pub fn query_polygons(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &QueryFilter,
    ) -> Result<Vec<PolyRef>> {
        self.nav_mesh.query_polygons(center, half_extents, filter)
    }

    pub fn closest_point_on_poly(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Result<([f32; 3], bool)> {
        self.nav_mesh.closest_point_on_poly(poly_ref, pos)
    }

    pub fn closest_point_on_poly_boundary(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Result<[f32; 3]> {
        self.nav_mesh.closest_point_on_poly_boundary(poly_ref, pos)
    }

    pub fn get_poly_height(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Result<f32> {
        self.nav_mesh.get_poly_height(poly_ref, pos)
    }

    pub fn get_portal_points(
        &self,
        from: PolyRef,
        to: PolyRef,
    ) -> Result<([f32; 3], [f32; 3], PolyType, PolyType)> {
        self.nav_mesh.get_portal_points(from, to)
    }

    /// Checks that a reference is live and passes the filter
    pub fn is_valid_poly_ref(&self, poly_ref: PolyRef, filter: &QueryFilter) -> bool {
        self.nav_mesh
            .get_poly(poly_ref)
            .is_ok_and(|poly| filter.pass_filter(poly))
    }

    /// Finds a polygon corridor from the start to the end polygon
    ///
    /// Equivalent to running a sliced search with an unlimited budget. Fails
    /// with `NoPath` when the end is not reachable.
    pub fn find_path(
        &self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
    ) -> Result<Vec<PolyRef>> {
        let mut search = SlicedFindPath::init(
            self.nav_mesh,
            start_ref,
            end_ref,
            start_pos,
            end_pos,
            filter,
            self.max_nodes,
        )?;
        let (_, state) = search.update(self.nav_mesh, usize::MAX)?;
        match state {
            SlicedPathState::PartialFailed => Err(Status::PathNotFound.into()),
            _ => Ok(search.finalize(usize::MAX)?.polys),
        }
    }

    /// Starts a sliced search, replacing any search in flight
    pub fn init_sliced_find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
    ) -> Result<SlicedPathState> {
        self.sliced = None;
        let search = SlicedFindPath::init(
            self.nav_mesh,
            start_ref,
            end_ref,
            start_pos,
            end_pos,
            filter,
            self.max_nodes,
        )?;
        let state = search.state();
        self.sliced = Some(search);
        Ok(state)
    }

    /// Advances the sliced search by up to `max_iter` node expansions
    pub fn update_sliced_find_path(&mut self, max_iter: usize) -> Result<(usize, SlicedPathState)> {
        let search = self.sliced.as_mut().ok_or(Status::InvalidParam)?;
        search.update(self.nav_mesh, max_iter)
    }

    /// Takes the corridor of the finished sliced search
    ///
    /// The search is kept when it has not finished yet.
    pub fn finalize_sliced_find_path(&mut self, max_path: usize) -> Result<PathCorridor> {
        let search = self.sliced.as_ref().ok_or(Status::InvalidParam)?;
        let corridor = search.finalize(max_path)?;
        self.sliced = None;
        Ok(corridor)
    }

    /// Takes a corridor toward the furthest visited polygon of `existing`
    pub fn finalize_sliced_find_path_partial(
        &mut self,
        existing: &[PolyRef],
        max_path: usize,
    ) -> Result<PathCorridor> {
        let search = self.sliced.as_ref().ok_or(Status::InvalidParam)?;
        let corridor = search.finalize_partial(existing, max_path)?;
        self.sliced = None;
        Ok(corridor)
    }

    pub fn sliced_path_state(&self) -> Option<SlicedPathState> {
        self.sliced.as_ref().map(|s| s.state())
    }

    /// Drops the sliced search in flight
    pub fn cancel_sliced_find_path(&mut self) {
        self.sliced = None;
    }

    /// Reduces a corridor to straight waypoints
    pub fn find_straight_path(
        &self,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        path: &[PolyRef],
        max_points: usize,
    ) -> Result<StraightPath> {
        find_straight_path(self.nav_mesh, start_pos, end_pos, path, max_points)
    }

    /// Casts a walkability ray along the mesh surface
    pub fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        max_path: usize,
    ) -> Result<RaycastHit> {
        raycast(self.nav_mesh, start_ref, start_pos, end_pos, filter, max_path)
    }

    /// Picks a random point on the mesh
    ///
    /// `frand` must return values in `[0, 1)`. The tile is chosen starting
    /// from slot `frand() * max_tiles` and scanning forward to the next
    /// resident tile, the polygon by area-weighted reservoir sampling over the
    /// tile's ground polygons passing `filter`.
    pub fn find_random_point<F>(&self, filter: &QueryFilter, mut frand: F) -> Result<(PolyRef, [f32; 3])>
    where
        F: FnMut() -> f32,
    {
        let max_tiles = self.nav_mesh.max_tiles();
        let start = ((frand().clamp(0.0, 1.0) * max_tiles as f32) as usize).min(max_tiles - 1);
        let tile_index = (0..max_tiles)
            .map(|i| (start + i) % max_tiles)
            .find(|&i| self.nav_mesh.get_tile(i).is_some())
            .ok_or(Status::NotFound)?;
        let tile = self.nav_mesh.get_tile(tile_index).ok_or(Status::NotFound)?;
        let base: TileRef = self.nav_mesh.poly_ref_base(tile_index);

        let mut picked = None;
        let mut area_sum = 0.0f32;
        for (ip, poly) in tile.polys.iter().enumerate() {
            if poly.poly_type != PolyType::Ground || !filter.pass_filter(poly) {
                continue;
            }
            let (verts, n) = tile.poly_vertices(poly);
            let area: f32 = (2..n)
                .map(|j| tri_area_2d(&verts[0], &verts[j - 1], &verts[j]).abs())
                .sum();
            area_sum += area;
            if frand() * area_sum <= area {
                picked = Some((ip, verts, n));
            }
        }
        let (ip, verts, n) = picked.ok_or(Status::NotFound)?;
        let poly_ref = PolyRef::new(base.id() | ip as u32);

        let s = frand();
        let t = frand();
        let mut pt = random_point_in_convex_poly(&verts[..n], s, t);
        if let Ok(h) = self.nav_mesh.get_poly_height(poly_ref, &pt) {
            pt[1] = h;
        }
        Ok((poly_ref, pt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_pool::DEFAULT_MAX_NODES;
    use crate::test_mesh_helpers::*;
    use navkit_common::Error;

    #[test]
    fn test_find_path_single_tile() -> Result<()> {
        let mesh = build_grid_mesh(1, 1, &GridLayout::default())?;
        let query = NavMeshQuery::new(&mesh, DEFAULT_MAX_NODES);
        let filter = QueryFilter::default();

        let start = [0.5, 0.0, 0.5];
        let end = [3.5, 0.0, 0.5];
        let start_ref = poly_at(&mesh, &start)?;
        let end_ref = poly_at(&mesh, &end)?;
        let path = query.find_path(start_ref, end_ref, &start, &end, &filter)?;
        assert_eq!(path.len(), 4);
        assert_eq!(path.first(), Some(&start_ref));
        assert_eq!(path.last(), Some(&end_ref));
        Ok(())
    }

    #[test]
    fn test_find_path_same_poly() -> Result<()> {
        let mesh = build_grid_mesh(1, 1, &GridLayout::default())?;
        let query = NavMeshQuery::new(&mesh, DEFAULT_MAX_NODES);
        let pos = [1.5, 0.0, 1.5];
        let r = poly_at(&mesh, &pos)?;
        let path = query.find_path(r, r, &pos, &[1.6, 0.0, 1.6], &QueryFilter::default())?;
        assert_eq!(path, vec![r]);
        Ok(())
    }

    #[test]
    fn test_find_path_invalid_refs() -> Result<()> {
        let mesh = build_grid_mesh(1, 1, &GridLayout::default())?;
        let query = NavMeshQuery::new(&mesh, DEFAULT_MAX_NODES);
        let pos = [1.5, 0.0, 1.5];
        let r = poly_at(&mesh, &pos)?;
        let filter = QueryFilter::default();

        let err = query.find_path(PolyRef::new(0), r, &pos, &pos, &filter);
        assert!(matches!(err, Err(Error::InvalidReference(_))));
        let err = query.find_path(r, PolyRef::new(0x00ff_0000), &pos, &pos, &filter);
        assert!(matches!(err, Err(Error::InvalidReference(_))));
        Ok(())
    }

    #[test]
    fn test_find_path_disconnected() -> Result<()> {
        // A full row of blocked cells splits the tile in two
        let layout = GridLayout {
            blocked: (0..4).map(|x| (x, 2)).collect(),
            ..GridLayout::default()
        };
        let mesh = build_grid_mesh(1, 1, &layout)?;
        let query = NavMeshQuery::new(&mesh, DEFAULT_MAX_NODES);
        let start = [0.5, 0.0, 0.5];
        let end = [0.5, 0.0, 3.5];
        let start_ref = poly_at(&mesh, &start)?;
        let end_ref = poly_at(&mesh, &end)?;
        let err = query.find_path(start_ref, end_ref, &start, &end, &QueryFilter::default());
        assert!(matches!(err, Err(Error::NoPath(_))));
        Ok(())
    }

    #[test]
    fn test_find_path_avoids_expensive_area() -> Result<()> {
        let mesh = build_grid_mesh(1, 1, &GridLayout::default())?;
        let filter = QueryFilter::default();
        let start = [0.5, 0.0, 1.5];
        let end = [3.5, 0.0, 1.5];
        let start_ref = poly_at(&mesh, &start)?;
        let end_ref = poly_at(&mesh, &end)?;

        let direct = {
            let query = NavMeshQuery::new(&mesh, DEFAULT_MAX_NODES);
            query.find_path(start_ref, end_ref, &start, &end, &filter)?
        };
        assert_eq!(direct.len(), 4);

        // Excluding the middle cell's flags forces a detour
        let mut mesh = mesh;
        let middle = poly_at(&mesh, &[1.5, 0.0, 1.5])?;
        mesh.set_poly_flags(middle, crate::PolyFlags::DISABLED)?;
        let filter = QueryFilter {
            exclude_flags: crate::PolyFlags::DISABLED,
            ..QueryFilter::default()
        };
        let query = NavMeshQuery::new(&mesh, DEFAULT_MAX_NODES);
        let detour = query.find_path(start_ref, end_ref, &start, &end, &filter)?;
        assert!(!detour.contains(&middle));
        assert!(detour.len() > direct.len());
        Ok(())
    }

    #[test]
    fn test_small_node_pool_fails() -> Result<()> {
        let layout = GridLayout {
            blocked: (0..4).map(|x| (x, 2)).collect(),
            ..GridLayout::default()
        };
        let mesh = build_grid_mesh(1, 1, &layout)?;
        let query = NavMeshQuery::new(&mesh, 3);
        let start = [0.5, 0.0, 0.5];
        let end = [0.5, 0.0, 3.5];
        let start_ref = poly_at(&mesh, &start)?;
        let end_ref = poly_at(&mesh, &end)?;
        let err = query.find_path(start_ref, end_ref, &start, &end, &QueryFilter::default());
        assert!(matches!(err, Err(Error::OutOfResources(_))));
        Ok(())
    }

    #[test]
    fn test_sliced_query_lifecycle() -> Result<()> {
        let mesh = build_grid_mesh(1, 1, &GridLayout::default())?;
        let mut query = NavMeshQuery::new(&mesh, DEFAULT_MAX_NODES);
        let filter = QueryFilter::default();
        let start = [0.5, 0.0, 0.5];
        let end = [3.5, 0.0, 3.5];
        let start_ref = poly_at(&mesh, &start)?;
        let end_ref = poly_at(&mesh, &end)?;

        assert!(query.update_sliced_find_path(1).is_err());
        let state = query.init_sliced_find_path(start_ref, end_ref, &start, &end, &filter)?;
        assert_eq!(state, SlicedPathState::InProgress);
        assert!(matches!(
            query.finalize_sliced_find_path(16),
            Err(Error::NotFinished)
        ));

        while query.sliced_path_state() == Some(SlicedPathState::InProgress) {
            query.update_sliced_find_path(2)?;
        }
        let corridor = query.finalize_sliced_find_path(16)?;
        assert!(!corridor.partial);
        assert_eq!(corridor.polys.last(), Some(&end_ref));
        assert_eq!(query.sliced_path_state(), None);
        Ok(())
    }

    #[test]
    fn test_find_random_point() -> Result<()> {
        let mesh = build_grid_mesh(2, 1, &GridLayout::default())?;
        let query = NavMeshQuery::new(&mesh, DEFAULT_MAX_NODES);
        let filter = QueryFilter::default();

        let mut seed = 12345u32;
        let mut frand = move || {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            (seed >> 8) as f32 / (1u32 << 24) as f32
        };
        for _ in 0..20 {
            let (r, pt) = query.find_random_point(&filter, &mut frand)?;
            assert!(mesh.is_valid_poly_ref(r));
            let (tile, poly) = mesh.get_tile_and_poly_by_ref(r)?;
            let (verts, n) = tile.poly_vertices(poly);
            assert!(navkit_common::point_in_polygon_2d(&pt, &verts[..n]));
            assert!(pt[1].abs() < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_find_random_point_empty_mesh() -> Result<()> {
        let mesh = NavMesh::new(grid_mesh_params(4))?;
        let query = NavMeshQuery::new(&mesh, DEFAULT_MAX_NODES);
        assert!(query.find_random_point(&QueryFilter::default(), || 0.5).is_err());
        Ok(())
    }
}
