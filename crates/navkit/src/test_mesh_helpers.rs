//! Grid mesh fixtures shared by tests

use super::{
    MeshTile, NavMesh, NavMeshBuilder, NavMeshCreateParams, NavMeshParams, OffMeshConnectionParams,
    PolyFlags, PolyRef, QueryFilter, Result, EXT_LINK, MESH_NULL_IDX, WALKABLE_AREA,
};

/// Voxel size used by the fixtures
pub const FIXTURE_CS: f32 = 0.25;
pub const FIXTURE_CH: f32 = 0.25;

/// Layout of a square tile made of one quad per cell
#[derive(Debug, Clone)]
pub struct GridLayout {
    /// Cells per side
    pub cells: usize,
    pub cell_size: f32,
    /// World size of the tile
    pub tile_size: f32,
    /// Surface height
    pub height: f32,
    /// Shift of all cells along z inside the tile
    pub z_offset: f32,
    /// Cells left out, as (x, z)
    pub blocked: Vec<(usize, usize)>,
    pub area: u8,
    pub flags: PolyFlags,
    pub off_mesh_connections: Vec<OffMeshConnectionParams>,
}

impl Default for GridLayout {
    fn default() -> Self {
        Self {
            cells: 4,
            cell_size: 1.0,
            tile_size: 4.0,
            height: 0.0,
            z_offset: 0.0,
            blocked: Vec::new(),
            area: WALKABLE_AREA,
            flags: PolyFlags::WALK,
            off_mesh_connections: Vec::new(),
        }
    }
}

/// Mesh parameters for 4 x 4 world-unit tiles
pub fn grid_mesh_params(max_tiles: usize) -> NavMeshParams {
    mesh_params_with_tile_size(max_tiles, 4.0)
}

pub fn mesh_params_with_tile_size(max_tiles: usize, tile_size: f32) -> NavMeshParams {
    NavMeshParams {
        origin: [0.0; 3],
        tile_width: tile_size,
        tile_height: tile_size,
        max_tiles,
        max_polys_per_tile: 256,
    }
}

/// Build input for a grid tile
pub fn grid_create_params(tx: i32, ty: i32, layout: &GridLayout) -> NavMeshCreateParams {
    let n = layout.cells;
    let bmin = [
        tx as f32 * layout.tile_size,
        0.0,
        ty as f32 * layout.tile_size,
    ];
    let bmax = [
        bmin[0] + layout.tile_size,
        layout.height + 1.0,
        bmin[2] + layout.tile_size,
    ];

    let walkable = |x: usize, z: usize| !layout.blocked.contains(&(x, z));
    let mut poly_index = vec![None; n * n];
    let mut count = 0u16;
    for z in 0..n {
        for x in 0..n {
            if walkable(x, z) {
                poly_index[z * n + x] = Some(count);
                count += 1;
            }
        }
    }

    // Corner (gx, gz) -> vertex index
    let mut verts = Vec::new();
    let mut corner = vec![None; (n + 1) * (n + 1)];
    let mut vertex = |gx: usize, gz: usize, verts: &mut Vec<u16>| -> u16 {
        let slot = &mut corner[gz * (n + 1) + gx];
        if let Some(v) = *slot {
            return v;
        }
        let v = (verts.len() / 3) as u16;
        verts.push((gx as f32 * layout.cell_size / FIXTURE_CS).round() as u16);
        verts.push((layout.height / FIXTURE_CH).round() as u16);
        verts.push(((gz as f32 * layout.cell_size + layout.z_offset) / FIXTURE_CS).round() as u16);
        *slot = Some(v);
        v
    };

    let nvp = 6;
    let mut polys = Vec::new();
    for z in 0..n {
        for x in 0..n {
            if !walkable(x, z) {
                continue;
            }
            let quad = [
                vertex(x, z, &mut verts),
                vertex(x, z + 1, &mut verts),
                vertex(x + 1, z + 1, &mut verts),
                vertex(x + 1, z, &mut verts),
            ];
            let nei = |cx: Option<usize>, cz: Option<usize>, side: u16| -> u16 {
                match (cx, cz) {
                    (Some(cx), Some(cz)) if cx < n && cz < n => {
                        poly_index[cz * n + cx].unwrap_or(MESH_NULL_IDX)
                    }
                    _ => EXT_LINK | side,
                }
            };
            let neis = [
                nei(x.checked_sub(1), Some(z), 4),
                nei(Some(x), Some(z + 1), 2),
                nei(Some(x + 1), Some(z), 0),
                nei(Some(x), z.checked_sub(1), 6),
            ];
            polys.extend_from_slice(&quad);
            polys.extend_from_slice(&[MESH_NULL_IDX; 2]);
            polys.extend_from_slice(&neis);
            polys.extend_from_slice(&[MESH_NULL_IDX; 2]);
        }
    }

    NavMeshCreateParams {
        verts,
        polys,
        poly_flags: vec![layout.flags; count as usize],
        poly_areas: vec![layout.area; count as usize],
        nvp,
        off_mesh_connections: layout.off_mesh_connections.clone(),
        tile_x: tx,
        tile_y: ty,
        bmin,
        bmax,
        walkable_height: 2.0,
        walkable_radius: 0.5,
        walkable_climb: 0.5,
        cs: FIXTURE_CS,
        ch: FIXTURE_CH,
        build_bv_tree: true,
        ..NavMeshCreateParams::default()
    }
}

pub fn build_grid_tile(tx: i32, ty: i32, layout: &GridLayout) -> Result<MeshTile> {
    NavMeshBuilder::build_tile(&grid_create_params(tx, ty, layout))
}

/// Mesh of `nx` by `ny` identical tiles
pub fn build_grid_mesh(nx: i32, ny: i32, layout: &GridLayout) -> Result<NavMesh> {
    let mut mesh = NavMesh::new(mesh_params_with_tile_size(
        (nx * ny) as usize + 4,
        layout.tile_size,
    ))?;
    for ty in 0..ny {
        for tx in 0..nx {
            mesh.add_tile(build_grid_tile(tx, ty, layout)?)?;
        }
    }
    Ok(mesh)
}

/// Polygon under a point
pub fn poly_at(mesh: &NavMesh, pos: &[f32; 3]) -> Result<PolyRef> {
    let (reference, _) = mesh
        .find_nearest_poly(pos, &[0.1, 2.0, 0.1], &QueryFilter::default())?
        .ok_or_else(|| navkit_common::Error::InvalidInput(format!("no polygon at {pos:?}")))?;
    Ok(reference)
}
