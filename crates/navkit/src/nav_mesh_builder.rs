//! Navigation mesh builder for creating tiles from pre-built polygon data
//!
//! This module provides the [`NavMeshBuilder`] which turns voxel-space polygon
//! meshes into [`MeshTile`]s ready to be added to a [`super::NavMesh`]. Links are
//! created by the mesh when the tile is added, since they need the tile's
//! final reference.

use navkit_common::{Error, Result};

use super::bv_tree::build_bv_tree;
use super::{
    MeshTile, OffMeshConnection, Poly, PolyDetail, PolyFlags, PolyType, TileHeader, EXT_LINK,
    LINK_INTERNAL, MAX_VERTS_PER_POLY, MESH_NULL_IDX, OFFMESH_CON_BIDIR,
};

/// An off-mesh connection supplied with a tile's build input
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct OffMeshConnectionParams {
    pub start: [f32; 3],
    pub end: [f32; 3],
    pub radius: f32,
    pub bidirectional: bool,
    pub area: u8,
    pub flags: PolyFlags,
    pub user_id: u32,
}

/// Build input for one navigation mesh tile
///
/// Vertices are voxel coordinates relative to `bmin`: world position is
/// `bmin + (x * cs, y * ch, z * cs)`. Each polygon takes `2 * nvp` entries in
/// `polys`: `nvp` vertex indices padded with [`MESH_NULL_IDX`], then `nvp`
/// neighbor entries where [`MESH_NULL_IDX`] is a wall, a polygon index is an
/// internal neighbor and `EXT_LINK | side` is a portal to the tile on `side`.
///
/// The detail mesh is optional. Detail triangle indices below a polygon's
/// vertex count name polygon vertices; higher indices name
/// `detail_verts[vert_base + i - vert_count]`.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct NavMeshCreateParams {
    pub verts: Vec<u16>,
    pub polys: Vec<u16>,
    pub poly_flags: Vec<PolyFlags>,
    pub poly_areas: Vec<u8>,
    /// Maximum vertices per polygon in `polys`
    pub nvp: usize,

    pub detail_meshes: Vec<PolyDetail>,
    pub detail_verts: Vec<f32>,
    pub detail_tris: Vec<u8>,

    pub off_mesh_connections: Vec<OffMeshConnectionParams>,

    pub user_id: u32,
    pub tile_x: i32,
    pub tile_y: i32,
    pub tile_layer: i32,
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],

    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub cs: f32,
    pub ch: f32,

    pub build_bv_tree: bool,
}

impl NavMeshCreateParams {
    pub fn vert_count(&self) -> usize {
        self.verts.len() / 3
    }

    pub fn poly_count(&self) -> usize {
        if self.nvp == 0 {
            0
        } else {
            self.polys.len() / (self.nvp * 2)
        }
    }
}

/// Builder for creating navigation mesh tiles
pub struct NavMeshBuilder;

impl NavMeshBuilder {
    /// Creates a navigation mesh tile from build input
    pub fn build_tile(params: &NavMeshCreateParams) -> Result<MeshTile> {
        Self::validate_params(params)?;

        let mut tile = MeshTile {
            header: TileHeader {
                x: params.tile_x,
                y: params.tile_y,
                layer: params.tile_layer,
                user_id: params.user_id,
                bmin: params.bmin,
                bmax: params.bmax,
                walkable_height: params.walkable_height,
                walkable_radius: params.walkable_radius,
                walkable_climb: params.walkable_climb,
                bv_quant_factor: 1.0 / params.cs,
            },
            ..MeshTile::default()
        };

        tile.verts = params
            .verts
            .chunks_exact(3)
            .flat_map(|v| {
                [
                    params.bmin[0] + v[0] as f32 * params.cs,
                    params.bmin[1] + v[1] as f32 * params.ch,
                    params.bmin[2] + v[2] as f32 * params.cs,
                ]
            })
            .collect();

        tile.polys = Self::build_polygons(params);
        Self::build_detail_mesh(params, &mut tile);

        if params.build_bv_tree {
            let bounds: Vec<([f32; 3], [f32; 3])> =
                tile.polys.iter().map(|p| tile.poly_bounds(p)).collect();
            tile.bv_tree = build_bv_tree(&bounds, &tile.header.bmin, tile.header.bv_quant_factor);
        }

        // Off-mesh polygons go after the ground polygons and stay out of the tree
        Self::build_off_mesh_connections(params, &mut tile);

        Ok(tile)
    }

    fn validate_params(params: &NavMeshCreateParams) -> Result<()> {
        if params.nvp < 3 || params.nvp > MAX_VERTS_PER_POLY {
            return Err(Error::InvalidInput(format!(
                "nvp must be in 3..={MAX_VERTS_PER_POLY}, got {}",
                params.nvp
            )));
        }
        if params.verts.len() % 3 != 0 || params.vert_count() < 3 {
            return Err(Error::InvalidInput("tile needs at least 3 vertices".into()));
        }
        if params.vert_count() >= MESH_NULL_IDX as usize {
            return Err(Error::InvalidInput("too many vertices".into()));
        }
        if params.polys.is_empty() || params.polys.len() % (params.nvp * 2) != 0 {
            return Err(Error::InvalidInput(
                "polygon data must hold 2 * nvp entries per polygon".into(),
            ));
        }
        let poly_count = params.poly_count();
        // Off-mesh connections add two vertices and one polygon each
        let off_mesh_count = params.off_mesh_connections.len();
        if params.vert_count() + 2 * off_mesh_count >= MESH_NULL_IDX as usize {
            return Err(Error::InvalidInput(
                "too many vertices with off-mesh connections".into(),
            ));
        }
        if poly_count + off_mesh_count >= MESH_NULL_IDX as usize {
            return Err(Error::InvalidInput("too many polygons".into()));
        }
        if params.poly_flags.len() != poly_count || params.poly_areas.len() != poly_count {
            return Err(Error::InvalidInput(
                "one flag and area entry is needed per polygon".into(),
            ));
        }
        if !(params.cs > 0.0 && params.ch > 0.0) {
            return Err(Error::InvalidInput("cell size must be positive".into()));
        }
        if (0..3).any(|k| !(params.bmin[k] <= params.bmax[k])) {
            return Err(Error::InvalidInput("tile bounds are inverted".into()));
        }

        let vert_count = params.vert_count();
        for poly in params.polys.chunks_exact(params.nvp * 2) {
            let (verts, neis) = poly.split_at(params.nvp);
            let n = verts.iter().take_while(|&&v| v != MESH_NULL_IDX).count();
            if n < 3 {
                return Err(Error::InvalidInput("degenerate polygon".into()));
            }
            if verts[..n].iter().any(|&v| v as usize >= vert_count) {
                return Err(Error::InvalidInput("polygon vertex out of range".into()));
            }
            for &nei in &neis[..n] {
                let internal = nei != MESH_NULL_IDX && nei & EXT_LINK == 0;
                if internal && nei as usize >= poly_count {
                    return Err(Error::InvalidInput("polygon neighbor out of range".into()));
                }
            }
        }

        if !params.detail_meshes.is_empty() && params.detail_meshes.len() != poly_count {
            return Err(Error::InvalidInput(
                "detail mesh must cover every polygon".into(),
            ));
        }
        if params.detail_verts.len() % 3 != 0 || params.detail_tris.len() % 4 != 0 {
            return Err(Error::InvalidInput("malformed detail mesh".into()));
        }
        Ok(())
    }

    fn build_polygons(params: &NavMeshCreateParams) -> Vec<Poly> {
        let nvp = params.nvp;
        params
            .polys
            .chunks_exact(nvp * 2)
            .enumerate()
            .map(|(i, src)| {
                let mut poly = Poly::new(params.poly_areas[i], PolyType::Ground, params.poly_flags[i]);
                let n = src[..nvp].iter().take_while(|&&v| v != MESH_NULL_IDX).count();
                for j in 0..n {
                    poly.verts[j] = src[j];
                    let nei = src[nvp + j];
                    poly.neighbors[j] = if nei == MESH_NULL_IDX {
                        0
                    } else if nei & EXT_LINK != 0 {
                        EXT_LINK | (nei & 0x7)
                    } else {
                        nei + 1
                    };
                }
                poly.vert_count = n as u8;
                poly
            })
            .collect()
    }

    fn build_detail_mesh(params: &NavMeshCreateParams, tile: &mut MeshTile) {
        if !params.detail_meshes.is_empty() {
            tile.detail_meshes = params.detail_meshes.clone();
            tile.detail_verts = params.detail_verts.clone();
            tile.detail_tris = params.detail_tris.clone();
            return;
        }

        // Triangle fan over the polygon outline
        let mut tri_base = 0u32;
        for poly in &tile.polys {
            let n = poly.vert_count as usize;
            tile.detail_meshes.push(PolyDetail {
                vert_base: 0,
                tri_base,
                vert_count: 0,
                tri_count: (n - 2) as u8,
            });
            for j in 2..n {
                tile.detail_tris
                    .extend_from_slice(&[0, (j - 1) as u8, j as u8, 0]);
            }
            tri_base += (n - 2) as u32;
        }
    }

    fn build_off_mesh_connections(params: &NavMeshCreateParams, tile: &mut MeshTile) {
        for con in &params.off_mesh_connections {
            if classify_off_mesh_point(&con.start, &params.bmin, &params.bmax) != LINK_INTERNAL {
                continue;
            }
            let base = (tile.verts.len() / 3) as u16;
            tile.verts.extend_from_slice(&con.start);
            tile.verts.extend_from_slice(&con.end);

            let mut poly = Poly::new(con.area, PolyType::OffMeshConnection, con.flags);
            poly.verts[0] = base;
            poly.verts[1] = base + 1;
            poly.vert_count = 2;
            let poly_index = tile.polys.len() as u16;
            tile.polys.push(poly);

            tile.off_mesh_connections.push(OffMeshConnection {
                pos: [
                    con.start[0],
                    con.start[1],
                    con.start[2],
                    con.end[0],
                    con.end[1],
                    con.end[2],
                ],
                radius: con.radius,
                poly: poly_index,
                flags: if con.bidirectional { OFFMESH_CON_BIDIR } else { 0 },
                side: classify_off_mesh_point(&con.end, &params.bmin, &params.bmax),
                user_id: con.user_id,
            });
        }
    }
}

/// Tile side a point lies beyond, or [`LINK_INTERNAL`] when inside on XZ
pub fn classify_off_mesh_point(pt: &[f32; 3], bmin: &[f32; 3], bmax: &[f32; 3]) -> u8 {
    const XP: u8 = 1 << 0;
    const ZP: u8 = 1 << 1;
    const XM: u8 = 1 << 2;
    const ZM: u8 = 1 << 3;

    let mut outcode = 0;
    if pt[0] >= bmax[0] {
        outcode |= XP;
    }
    if pt[2] >= bmax[2] {
        outcode |= ZP;
    }
    if pt[0] < bmin[0] {
        outcode |= XM;
    }
    if pt[2] < bmin[2] {
        outcode |= ZM;
    }

    match outcode {
        XP => 0,
        c if c == XP | ZP => 1,
        ZP => 2,
        c if c == XM | ZP => 3,
        XM => 4,
        c if c == XM | ZM => 5,
        ZM => 6,
        c if c == XP | ZM => 7,
        _ => LINK_INTERNAL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_params() -> NavMeshCreateParams {
        let n = MESH_NULL_IDX;
        NavMeshCreateParams {
            verts: vec![0, 0, 0, 0, 0, 4, 4, 0, 4, 4, 0, 0],
            polys: vec![0, 1, 2, 3, n, n, n, n, n, n, n, n],
            poly_flags: vec![PolyFlags::WALK],
            poly_areas: vec![1],
            nvp: 6,
            bmin: [10.0, 0.0, 20.0],
            bmax: [12.0, 1.0, 22.0],
            walkable_climb: 0.5,
            cs: 0.5,
            ch: 0.25,
            build_bv_tree: true,
            ..NavMeshCreateParams::default()
        }
    }

    #[test]
    fn test_build_quad_tile() -> Result<()> {
        let tile = NavMeshBuilder::build_tile(&quad_params())?;
        assert_eq!(tile.polys.len(), 1);
        assert_eq!(tile.polys[0].vert_count, 4);
        assert_eq!(tile.vertex(2), [12.0, 0.0, 22.0]);
        assert_eq!(tile.header.bv_quant_factor, 2.0);
        assert_eq!(tile.bv_tree.len(), 1);
        // Fan detail mesh of two triangles
        assert_eq!(tile.detail_meshes[0].tri_count, 2);
        assert_eq!(tile.detail_tris.len(), 8);
        Ok(())
    }

    #[test]
    fn test_neighbor_conversion() -> Result<()> {
        let n = MESH_NULL_IDX;
        let mut params = quad_params();
        params.verts.extend_from_slice(&[4, 0, 8, 0, 0, 8]);
        params.polys = vec![
            0, 1, 2, 3, n, n, EXT_LINK | 4, 1, n, n, n, n, //
            1, 5, 4, 2, n, n, n, n, n, 0, n, n,
        ];
        params.poly_flags = vec![PolyFlags::WALK; 2];
        params.poly_areas = vec![1; 2];
        params.bmax = [12.0, 1.0, 24.0];
        let tile = NavMeshBuilder::build_tile(&params)?;
        assert_eq!(tile.polys[0].neighbors[0], EXT_LINK | 4);
        assert_eq!(tile.polys[0].neighbors[1], 2);
        assert_eq!(tile.polys[0].neighbors[2], 0);
        assert_eq!(tile.polys[1].neighbors[3], 1);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut params = quad_params();
        params.nvp = 2;
        assert!(NavMeshBuilder::build_tile(&params).is_err());

        let mut params = quad_params();
        params.polys[1] = 99;
        assert!(matches!(
            NavMeshBuilder::build_tile(&params),
            Err(Error::InvalidInput(_))
        ));

        let mut params = quad_params();
        params.poly_areas.clear();
        assert!(NavMeshBuilder::build_tile(&params).is_err());
    }

    #[test]
    fn test_off_mesh_connections_filtered_by_start() -> Result<()> {
        let mut params = quad_params();
        let con = OffMeshConnectionParams {
            start: [11.0, 0.0, 21.0],
            end: [13.0, 0.0, 21.0],
            radius: 0.5,
            bidirectional: true,
            area: 2,
            flags: PolyFlags::JUMP,
            user_id: 7,
        };
        params.off_mesh_connections.push(con.clone());
        params.off_mesh_connections.push(OffMeshConnectionParams {
            start: [30.0, 0.0, 21.0],
            ..con
        });

        let tile = NavMeshBuilder::build_tile(&params)?;
        assert_eq!(tile.off_mesh_connections.len(), 1);
        let stored = &tile.off_mesh_connections[0];
        assert_eq!(stored.side, 0);
        assert_eq!(stored.flags, OFFMESH_CON_BIDIR);
        assert_eq!(tile.polys[stored.poly as usize].poly_type, PolyType::OffMeshConnection);
        // The tree only covers ground polygons
        assert_eq!(tile.bv_tree.len(), 1);
        Ok(())
    }

    #[test]
    fn test_rejects_off_mesh_vertex_overflow() -> Result<()> {
        let con = OffMeshConnectionParams {
            start: [11.0, 0.0, 21.0],
            end: [11.5, 0.0, 21.5],
            radius: 0.5,
            bidirectional: false,
            area: 2,
            flags: PolyFlags::JUMP,
            user_id: 0,
        };
        // Four ground vertices plus two per connection no longer fit u16 indices
        let mut params = quad_params();
        params.off_mesh_connections = vec![con.clone(); 32_766];
        assert!(matches!(
            NavMeshBuilder::build_tile(&params),
            Err(Error::InvalidInput(_))
        ));

        params.off_mesh_connections.truncate(32_765);
        let tile = NavMeshBuilder::build_tile(&params)?;
        assert_eq!(tile.polys.len(), 32_766);
        assert_eq!(tile.verts.len() / 3, 4 + 2 * 32_765);
        Ok(())
    }

    #[test]
    fn test_classify_off_mesh_point() {
        let bmin = [0.0, 0.0, 0.0];
        let bmax = [10.0, 1.0, 10.0];
        assert_eq!(classify_off_mesh_point(&[5.0, 0.0, 5.0], &bmin, &bmax), LINK_INTERNAL);
        assert_eq!(classify_off_mesh_point(&[11.0, 0.0, 5.0], &bmin, &bmax), 0);
        assert_eq!(classify_off_mesh_point(&[11.0, 0.0, 11.0], &bmin, &bmax), 1);
        assert_eq!(classify_off_mesh_point(&[5.0, 0.0, 11.0], &bmin, &bmax), 2);
        assert_eq!(classify_off_mesh_point(&[-1.0, 0.0, 5.0], &bmin, &bmax), 4);
        assert_eq!(classify_off_mesh_point(&[5.0, 0.0, -1.0], &bmin, &bmax), 6);
        assert_eq!(classify_off_mesh_point(&[11.0, 0.0, -1.0], &bmin, &bmax), 7);
    }
}
