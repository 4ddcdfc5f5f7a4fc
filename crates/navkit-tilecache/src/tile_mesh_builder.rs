//! Polygon generation from carved tile layers

use std::collections::HashMap;

use navkit::{NavMeshCreateParams, PolyFlags, EXT_LINK, MESH_NULL_IDX};
use navkit_common::{Error, Result};

use crate::tile_cache::TileCacheParams;
use crate::tile_cache_data::TileCacheLayer;

/// Turns a carved layer into navigation mesh build input
pub trait TileMeshBuilder: std::fmt::Debug {
    /// Returns `None` when the layer has nothing walkable left
    fn build(
        &self,
        layer: &TileCacheLayer,
        params: &TileCacheParams,
    ) -> Result<Option<NavMeshCreateParams>>;
}

/// Emits one quad per walkable cell
///
/// Cells sharing a corner at the same height share the vertex. Connected
/// cells become internal neighbors and cells on the tile border get portals
/// towards the neighboring tile.
#[derive(Debug, Clone)]
pub struct CellMeshBuilder {
    /// Flags given to every generated polygon
    pub poly_flags: PolyFlags,
}

impl Default for CellMeshBuilder {
    fn default() -> Self {
        Self {
            poly_flags: PolyFlags::WALK,
        }
    }
}

/// Portal side per cell edge, edges ordered -x, +z, +x, -z
const EDGE_SIDES: [u16; 4] = [4, 2, 0, 6];

const NVP: usize = 6;

impl TileMeshBuilder for CellMeshBuilder {
    fn build(
        &self,
        layer: &TileCacheLayer,
        params: &TileCacheParams,
    ) -> Result<Option<NavMeshCreateParams>> {
        let (w, h) = (layer.width(), layer.height());

        let mut poly_index = vec![MESH_NULL_IDX; w * h];
        let mut count = 0usize;
        for (idx, slot) in poly_index.iter_mut().enumerate() {
            if layer.areas[idx] != navkit::NULL_AREA {
                *slot = count as u16;
                count += 1;
            }
        }
        if count == 0 {
            return Ok(None);
        }
        if count >= MESH_NULL_IDX as usize {
            return Err(Error::InvalidInput(format!(
                "layer ({}, {}) has too many cells",
                layer.header.tx, layer.header.ty
            )));
        }

        let mut verts: Vec<u16> = Vec::new();
        let mut shared: HashMap<(usize, usize, u8), u16> = HashMap::new();
        let mut vertex = |gx: usize, gz: usize, y: u8, verts: &mut Vec<u16>| -> Result<u16> {
            if let Some(&v) = shared.get(&(gx, gz, y)) {
                return Ok(v);
            }
            let v = verts.len() / 3;
            if v >= MESH_NULL_IDX as usize {
                return Err(Error::InvalidInput("too many vertices in layer".into()));
            }
            verts.extend_from_slice(&[gx as u16, y as u16, gz as u16]);
            shared.insert((gx, gz, y), v as u16);
            Ok(v as u16)
        };

        let mut polys = Vec::with_capacity(count * NVP * 2);
        let mut poly_areas = Vec::with_capacity(count);
        for z in 0..h {
            for x in 0..w {
                let idx = z * w + x;
                if poly_index[idx] == MESH_NULL_IDX {
                    continue;
                }
                let y = layer.heights[idx];
                let quad = [
                    vertex(x, z, y, &mut verts)?,
                    vertex(x, z + 1, y, &mut verts)?,
                    vertex(x + 1, z + 1, y, &mut verts)?,
                    vertex(x + 1, z, y, &mut verts)?,
                ];

                let mut neis = [MESH_NULL_IDX; 4];
                for (dir, nei) in neis.iter_mut().enumerate() {
                    *nei = match layer.neighbour(x, z, dir) {
                        None => EXT_LINK | EDGE_SIDES[dir],
                        Some((nx, nz)) if layer.is_connected(x, z, dir) => {
                            poly_index[nz * w + nx]
                        }
                        Some(_) => MESH_NULL_IDX,
                    };
                }

                polys.extend_from_slice(&quad);
                polys.extend_from_slice(&[MESH_NULL_IDX; NVP - 4]);
                polys.extend_from_slice(&neis);
                polys.extend_from_slice(&[MESH_NULL_IDX; NVP - 4]);
                poly_areas.push(layer.areas[idx]);
            }
        }

        let mut bmax = layer.header.bmax;
        bmax[1] = bmax[1].max(layer.header.bmin[1] + layer.header.hmax as f32 * params.ch);

        Ok(Some(NavMeshCreateParams {
            verts,
            polys,
            poly_flags: vec![self.poly_flags; count],
            poly_areas,
            nvp: NVP,
            tile_x: layer.header.tx,
            tile_y: layer.header.ty,
            tile_layer: layer.header.tlayer,
            bmin: layer.header.bmin,
            bmax,
            walkable_height: params.walkable_height,
            walkable_radius: params.walkable_radius,
            walkable_climb: params.walkable_climb,
            cs: params.cs,
            ch: params.ch,
            build_bv_tree: true,
            ..NavMeshCreateParams::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_layers::*;
    use navkit::{NavMeshBuilder, WALKABLE_AREA};

    #[test]
    fn test_full_layer() -> Result<()> {
        let params = test_params();
        let layer = flat_layer(0, 0, &params, &[])?;
        let create = CellMeshBuilder::default()
            .build(&layer, &params)?
            .ok_or_else(|| Error::InvalidInput("no polygons".into()))?;
        assert_eq!(create.poly_count(), 64);
        assert_eq!(create.vert_count(), 81);

        let tile = NavMeshBuilder::build_tile(&create)?;
        assert_eq!(tile.polys.len(), 64);
        // Corner cell: two portals, two internal neighbors stored as index + 1
        let first = &tile.polys[0];
        assert_eq!(first.neighbors[0], EXT_LINK | 4);
        assert_eq!(first.neighbors[1], 9);
        assert_eq!(first.neighbors[2], 2);
        assert_eq!(first.neighbors[3], EXT_LINK | 6);
        Ok(())
    }

    #[test]
    fn test_carved_cells_become_walls() -> Result<()> {
        let params = test_params();
        let layer = flat_layer(0, 0, &params, &[(1, 0)])?;
        let create = CellMeshBuilder::default()
            .build(&layer, &params)?
            .ok_or_else(|| Error::InvalidInput("no polygons".into()))?;
        assert_eq!(create.poly_count(), 63);
        // Poly 0 is cell (0, 0); its +x edge faces the carved cell
        assert_eq!(create.polys[NVP + 2], MESH_NULL_IDX);
        Ok(())
    }

    #[test]
    fn test_height_step_splits_vertices() -> Result<()> {
        let params = test_params();
        let mut layer = flat_layer(0, 0, &params, &[])?;
        layer.set_cell(0, 0, 8, WALKABLE_AREA)?;
        layer.build_connections(params.walkable_climb_cells(), params.ch);
        let create = CellMeshBuilder::default()
            .build(&layer, &params)?
            .ok_or_else(|| Error::InvalidInput("no polygons".into()))?;
        // The raised cell brings four vertices of its own and no longer
        // shares the grid origin corner
        assert_eq!(create.vert_count(), 81 - 1 + 4);
        assert_eq!(create.polys[NVP + 2], MESH_NULL_IDX);
        Ok(())
    }

    #[test]
    fn test_empty_layer_builds_nothing() -> Result<()> {
        let params = test_params();
        let layer = flat_layer(0, 0, &params, &[])?;
        let mut empty = layer.clone();
        empty.areas.fill(navkit::NULL_AREA);
        assert!(CellMeshBuilder::default().build(&empty, &params)?.is_none());
        Ok(())
    }
}
