//! Sliced searches driven in small budgets, across mesh edits

use crate::test_mesh_helpers::*;
use crate::{
    find_path_sliced, NavMesh, NavMeshQuery, PolyRef, QueryFilter, SlicedFindPath,
    SlicedPathState, DEFAULT_MAX_NODES,
};
use navkit_common::{Error, Result};

/// Two tiles of 25 x 25 cells with only the z = 0 row walkable: a strip of
/// 50 polygons
fn strip_mesh() -> Result<NavMesh> {
    let layout = GridLayout {
        cells: 25,
        tile_size: 25.0,
        blocked: (1..25)
            .flat_map(|z| (0..25).map(move |x| (x, z)))
            .collect(),
        ..GridLayout::default()
    };
    build_grid_mesh(2, 1, &layout)
}

const STRIP_START: [f32; 3] = [0.5, 0.0, 0.5];
const STRIP_END: [f32; 3] = [49.5, 0.0, 0.5];

fn start_search(mesh: &NavMesh, start: &[f32; 3], end: &[f32; 3]) -> Result<SlicedFindPath> {
    SlicedFindPath::init(
        mesh,
        poly_at(mesh, start)?,
        poly_at(mesh, end)?,
        start,
        end,
        &QueryFilter::default(),
        DEFAULT_MAX_NODES,
    )
}

fn full_path(mesh: &NavMesh, start: &[f32; 3], end: &[f32; 3]) -> Result<Vec<PolyRef>> {
    NavMeshQuery::new(mesh, DEFAULT_MAX_NODES).find_path(
        poly_at(mesh, start)?,
        poly_at(mesh, end)?,
        start,
        end,
        &QueryFilter::default(),
    )
}

fn swap_tile(mesh: &mut NavMesh, x: i32, y: i32) -> Result<()> {
    let tile_ref = mesh
        .get_tile_ref_at(x, y, 0)
        .ok_or_else(|| Error::InvalidInput(format!("tile ({x}, {y}) missing")))?;
    let tile = mesh.remove_tile(tile_ref)?;
    mesh.add_tile(tile)?;
    Ok(())
}

#[test]
fn test_one_node_per_call() -> Result<()> {
    let mesh = strip_mesh()?;
    let expected = full_path(&mesh, &STRIP_START, &STRIP_END)?;
    assert_eq!(expected.len(), 50);

    let mut search = start_search(&mesh, &STRIP_START, &STRIP_END)?;
    let mut calls = 0;
    while !search.state().is_terminal() {
        let (done, _) = search.update(&mesh, 1)?;
        assert_eq!(done, 1);
        calls += 1;

        // The best guess so far is always a prefix of the final corridor
        let partial = search.current_corridor();
        assert_eq!(partial[..], expected[..partial.len()]);
    }

    assert_eq!(calls, 50);
    assert_eq!(search.iterations(), 50);
    assert_eq!(search.state(), SlicedPathState::Succeeded);
    let corridor = search.finalize(usize::MAX)?;
    assert!(!corridor.partial);
    assert_eq!(corridor.polys, expected);

    // Further updates are no-ops
    assert_eq!(search.update(&mesh, 10)?, (0, SlicedPathState::Succeeded));
    Ok(())
}

#[test]
fn test_slice_size_does_not_change_result() -> Result<()> {
    let mesh = build_grid_mesh(2, 2, &GridLayout::default())?;
    let start = [0.5, 0.0, 0.5];
    let end = [7.5, 0.0, 6.5];
    let expected = full_path(&mesh, &start, &end)?;

    for slice in [1, 2, 3, 7, 1000] {
        let (corridor, calls) = find_path_sliced(
            &mesh,
            poly_at(&mesh, &start)?,
            poly_at(&mesh, &end)?,
            &start,
            &end,
            &QueryFilter::default(),
            DEFAULT_MAX_NODES,
            slice,
        )?;
        assert_eq!(corridor.polys, expected, "slice size {slice}");
        assert!(calls >= 1);
    }
    Ok(())
}

#[test]
fn test_finalize_before_finish() -> Result<()> {
    let mesh = strip_mesh()?;
    let mut search = start_search(&mesh, &STRIP_START, &STRIP_END)?;
    search.update(&mesh, 5)?;
    assert_eq!(search.state(), SlicedPathState::InProgress);
    assert!(matches!(search.finalize(64), Err(Error::NotFinished)));
    Ok(())
}

#[test]
fn test_swapped_end_tile_fails_search() -> Result<()> {
    let mut mesh = build_grid_mesh(2, 2, &GridLayout::default())?;
    let mut search = start_search(&mesh, &[0.5, 0.0, 0.5], &[7.5, 0.0, 7.5])?;
    search.update(&mesh, 2)?;

    swap_tile(&mut mesh, 1, 1)?;
    assert!(matches!(
        search.update(&mesh, 2),
        Err(Error::InvalidReference(_))
    ));
    assert_eq!(search.state(), SlicedPathState::Failed);
    assert!(matches!(
        search.finalize(64),
        Err(Error::InvalidReference(_))
    ));
    Ok(())
}

#[test]
fn test_swapped_visited_tile_fails_search() -> Result<()> {
    let mut mesh = build_grid_mesh(2, 2, &GridLayout::default())?;
    let mut search = start_search(&mesh, &[0.5, 0.0, 0.5], &[7.5, 0.0, 7.5])?;
    search.update(&mesh, 2)?;

    swap_tile(&mut mesh, 0, 0)?;
    assert!(matches!(
        search.update(&mesh, 2),
        Err(Error::InvalidReference(_))
    ));
    assert_eq!(search.state(), SlicedPathState::Failed);
    Ok(())
}

#[test]
fn test_unrelated_tile_swap_is_harmless() -> Result<()> {
    let mut mesh = build_grid_mesh(3, 1, &GridLayout::default())?;
    let start = [0.5, 0.0, 0.5];
    let end = [3.5, 0.0, 0.5];
    let expected = full_path(&mesh, &start, &end)?;

    let mut search = start_search(&mesh, &start, &end)?;
    search.update(&mesh, 1)?;
    swap_tile(&mut mesh, 2, 0)?;
    while !search.state().is_terminal() {
        search.update(&mesh, 1)?;
    }
    assert_eq!(search.finalize(usize::MAX)?.polys, expected);
    Ok(())
}

#[test]
fn test_disconnected_search_is_partial() -> Result<()> {
    let layout = GridLayout {
        blocked: (0..4).map(|x| (x, 2)).collect(),
        ..GridLayout::default()
    };
    let mesh = build_grid_mesh(1, 1, &layout)?;
    let start = [0.5, 0.0, 0.5];
    let end = [1.5, 0.0, 3.5];
    let start_ref = poly_at(&mesh, &start)?;
    let end_ref = poly_at(&mesh, &end)?;

    let mut search = start_search(&mesh, &start, &end)?;
    while !search.state().is_terminal() {
        search.update(&mesh, 3)?;
    }
    assert_eq!(search.state(), SlicedPathState::PartialFailed);

    let corridor = search.finalize(usize::MAX)?;
    assert!(corridor.partial);
    assert_eq!(corridor.polys.first(), Some(&start_ref));
    assert!(!corridor.polys.contains(&end_ref));
    Ok(())
}

#[test]
fn test_finalize_partial_follows_existing_corridor() -> Result<()> {
    let mesh = strip_mesh()?;
    let expected = full_path(&mesh, &STRIP_START, &STRIP_END)?;

    let mut search = start_search(&mesh, &STRIP_START, &STRIP_END)?;
    search.update(&mesh, 20)?;
    assert_eq!(search.state(), SlicedPathState::InProgress);

    // Polygons beyond the search frontier are skipped
    let corridor = search.finalize_partial(&expected, usize::MAX)?;
    assert!(corridor.partial);
    assert_eq!(corridor.polys[..], expected[..corridor.polys.len()]);

    let corridor = search.finalize_partial(&expected[..5], 3)?;
    assert_eq!(corridor.polys, expected[..3].to_vec());
    assert!(corridor.truncated);
    Ok(())
}
