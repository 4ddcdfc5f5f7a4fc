//! Queries spanning several tiles and tiles swapped at runtime

use crate::test_mesh_helpers::*;
use crate::{
    decode_poly_ref_tile, NavMesh, NavMeshQuery, PolyRef, QueryFilter, StraightPathFlags,
    DEFAULT_MAX_NODES,
};
use navkit_common::{Error, Result};

fn find_corridor(mesh: &NavMesh, start: &[f32; 3], end: &[f32; 3]) -> Result<Vec<PolyRef>> {
    let query = NavMeshQuery::new(mesh, DEFAULT_MAX_NODES);
    query.find_path(
        poly_at(mesh, start)?,
        poly_at(mesh, end)?,
        start,
        end,
        &QueryFilter::default(),
    )
}

fn assert_linked(mesh: &NavMesh, path: &[PolyRef]) -> Result<()> {
    for pair in path.windows(2) {
        assert!(
            mesh.find_link(pair[0], pair[1])?.is_some(),
            "{} does not link to {}",
            pair[0],
            pair[1]
        );
    }
    Ok(())
}

#[test]
fn test_corridor_crosses_tile_borders() -> Result<()> {
    let mesh = build_grid_mesh(2, 2, &GridLayout::default())?;
    let start = [0.5, 0.0, 0.5];
    let end = [7.5, 0.0, 7.5];

    let path = find_corridor(&mesh, &start, &end)?;
    let first = path.first().copied().unwrap_or_default();
    let last = path.last().copied().unwrap_or_default();
    assert_ne!(decode_poly_ref_tile(first), decode_poly_ref_tile(last));
    assert_linked(&mesh, &path)?;

    // The diagonal runs through cell corners and the shared tile corner,
    // none of which bends the line
    let query = NavMeshQuery::new(&mesh, DEFAULT_MAX_NODES);
    let straight = query.find_straight_path(&start, &end, &path, 32)?;
    assert_eq!(straight.positions(), vec![start, end]);
    assert!(straight.points[1].flags.contains(StraightPathFlags::END));

    let (start, end) = ([2.5, 0.0, 2.5], [5.5, 0.0, 5.5]);
    let path = find_corridor(&mesh, &start, &end)?;
    let straight = query.find_straight_path(&start, &end, &path, 32)?;
    assert_eq!(straight.len(), 2);

    // A row crossing the x border needs no turn
    let start = [0.5, 0.0, 2.5];
    let end = [7.5, 0.0, 2.5];
    let path = find_corridor(&mesh, &start, &end)?;
    assert_eq!(path.len(), 8);
    let straight = query.find_straight_path(&start, &end, &path, 32)?;
    assert_eq!(straight.len(), 2);
    assert!(straight.points[0].flags.contains(StraightPathFlags::START));
    assert!(straight.points[1].flags.contains(StraightPathFlags::END));
    assert!((straight.points[1].pos[0] - 7.5).abs() < 1e-4);
    Ok(())
}

#[test]
fn test_border_portal_carries_side() -> Result<()> {
    let mesh = build_grid_mesh(2, 1, &GridLayout::default())?;
    let west = poly_at(&mesh, &[3.5, 0.0, 0.5])?;
    let east = poly_at(&mesh, &[4.5, 0.0, 0.5])?;

    let link = mesh
        .find_link(west, east)?
        .ok_or_else(|| Error::InvalidInput("missing border link".into()))?;
    assert_eq!(link.side, 0);
    let back = mesh
        .find_link(east, west)?
        .ok_or_else(|| Error::InvalidInput("missing border link".into()))?;
    assert_eq!(back.side, 4);

    let (left, right, _, _) = mesh.get_portal_points(west, east)?;
    assert!((left[0] - 4.0).abs() < 1e-4 && (right[0] - 4.0).abs() < 1e-4);
    Ok(())
}

#[test]
fn test_rebuilt_tile_invalidates_old_refs() -> Result<()> {
    let layout = GridLayout::default();
    let mut mesh = build_grid_mesh(2, 2, &layout)?;
    let pos = [5.5, 0.0, 5.5];
    let old_ref = poly_at(&mesh, &pos)?;

    let tile_ref = mesh
        .get_tile_ref_at(1, 1, 0)
        .ok_or_else(|| Error::InvalidInput("tile (1, 1) missing".into()))?;
    mesh.remove_tile(tile_ref)?;
    assert!(matches!(mesh.get_poly(old_ref), Err(Error::InvalidReference(_))));

    mesh.add_tile(build_grid_tile(1, 1, &layout)?)?;
    let new_ref = poly_at(&mesh, &pos)?;
    assert_ne!(new_ref, old_ref);
    assert!(!mesh.is_valid_poly_ref(old_ref));

    // The rebuilt tile is stitched back into its neighbors
    let path = find_corridor(&mesh, &[0.5, 0.0, 0.5], &pos)?;
    assert_eq!(path.last(), Some(&new_ref));
    assert_linked(&mesh, &path)?;
    Ok(())
}

#[test]
fn test_diagonal_tiles_do_not_connect() -> Result<()> {
    let mut mesh = build_grid_mesh(2, 2, &GridLayout::default())?;
    for (x, y) in [(1, 0), (0, 1)] {
        let tile_ref = mesh
            .get_tile_ref_at(x, y, 0)
            .ok_or_else(|| Error::InvalidInput(format!("tile ({x}, {y}) missing")))?;
        mesh.remove_tile(tile_ref)?;
    }
    assert_eq!(mesh.tile_count(), 2);

    let err = find_corridor(&mesh, &[0.5, 0.0, 0.5], &[7.5, 0.0, 7.5]);
    assert!(matches!(err, Err(Error::NoPath(_))));
    Ok(())
}

#[test]
fn test_raycast_across_tiles() -> Result<()> {
    let layout = GridLayout::default();
    let mut mesh = build_grid_mesh(2, 1, &layout)?;
    let filter = QueryFilter::default();
    let start = [0.5, 0.0, 0.5];
    let end = [7.5, 0.0, 0.5];

    {
        let query = NavMeshQuery::new(&mesh, DEFAULT_MAX_NODES);
        let hit = query.raycast(poly_at(&mesh, &start)?, &start, &end, &filter, 32)?;
        assert!(!hit.hit_wall());
        assert_eq!(hit.path.len(), 8);
    }

    let tile_ref = mesh
        .get_tile_ref_at(1, 0, 0)
        .ok_or_else(|| Error::InvalidInput("tile (1, 0) missing".into()))?;
    mesh.remove_tile(tile_ref)?;

    let query = NavMeshQuery::new(&mesh, DEFAULT_MAX_NODES);
    let hit = query.raycast(poly_at(&mesh, &start)?, &start, &end, &filter, 32)?;
    assert!(hit.hit_wall());
    let at = hit.hit_point(&start, &end);
    assert!((at[0] - 4.0).abs() < 1e-3);
    Ok(())
}

#[test]
fn test_tile_lookup_by_position() -> Result<()> {
    let mesh = build_grid_mesh(3, 2, &GridLayout::default())?;
    assert_eq!(mesh.tile_count(), 6);
    assert_eq!(mesh.calc_tile_loc(&[9.5, 0.0, 4.5]), (2, 1));
    let tile = mesh
        .get_tile_at(2, 1, 0)
        .ok_or_else(|| Error::InvalidInput("tile (2, 1) missing".into()))?;
    assert_eq!((tile.header.x, tile.header.y), (2, 1));
    assert!(mesh.get_tile_at(3, 1, 0).is_none());
    assert_eq!(mesh.get_tiles_at(0, 0).len(), 1);
    Ok(())
}
