//! Layer and cache fixtures shared by tests

use navkit::{NavMesh, PolyRef, QueryFilter, WALKABLE_AREA};
use navkit_common::{Error, Result};

use crate::{TileCache, TileCacheLayer, TileCacheParams};

/// 8 x 8 cells of 0.5 units: tiles are 4 x 4 world units
pub fn test_params() -> TileCacheParams {
    TileCacheParams {
        origin: [0.0; 3],
        cs: 0.5,
        ch: 0.25,
        width: 8,
        height: 8,
        walkable_height: 2.0,
        walkable_radius: 0.5,
        walkable_climb: 0.5,
        max_tiles: 16,
        max_obstacles: 32,
    }
}

/// Flat layer at height 0 with the given cells left out, as (x, z)
pub fn flat_layer(
    tx: i32,
    ty: i32,
    params: &TileCacheParams,
    blocked: &[(usize, usize)],
) -> Result<TileCacheLayer> {
    let mut layer = TileCacheLayer::new(tx, ty, 0, params)?;
    for z in 0..layer.height() {
        for x in 0..layer.width() {
            if !blocked.contains(&(x, z)) {
                layer.set_cell(x, z, 0, WALKABLE_AREA)?;
            }
        }
    }
    layer.build_connections(params.walkable_climb_cells(), params.ch);
    Ok(layer)
}

/// Cache and mesh of `nx` by `ny` tiles, every tile built
pub fn build_cache(
    nx: i32,
    ny: i32,
    params: &TileCacheParams,
    blocked: &[(usize, usize)],
) -> Result<(TileCache, NavMesh)> {
    let mut cache = TileCache::new(params.clone())?;
    let mut mesh = NavMesh::new(cache.nav_mesh_params(256))?;
    for ty in 0..ny {
        for tx in 0..nx {
            let data = cache.compress_layer(&flat_layer(tx, ty, params, blocked)?)?;
            let tile_ref = cache.add_tile(data)?;
            cache.build_nav_mesh_tile(tile_ref, &mut mesh)?;
        }
    }
    Ok((cache, mesh))
}

/// Runs updates until the cache is idle, returns the number of calls
pub fn update_until_done(
    cache: &mut TileCache,
    mesh: &mut NavMesh,
    max_tiles: usize,
) -> Result<usize> {
    let mut calls = 0;
    while !cache.is_up_to_date() {
        cache.update(max_tiles, mesh)?;
        calls += 1;
        if calls > 1000 {
            return Err(Error::InvalidInput("tile cache never settled".into()));
        }
    }
    Ok(calls)
}

/// Polygon under a point
pub fn poly_at(mesh: &NavMesh, pos: &[f32; 3]) -> Result<PolyRef> {
    let (reference, _) = mesh
        .find_nearest_poly(pos, &[0.1, 1.0, 0.1], &QueryFilter::default())?
        .ok_or_else(|| Error::InvalidInput(format!("no polygon at {pos:?}")))?;
    Ok(reference)
}
