//! Binary layout of navigation mesh tiles and tile sets
//!
//! A tile is written as a fixed header followed by its vertices, polygons,
//! detail mesh, BV tree and off-mesh connections, all little-endian. Links are
//! not stored; they are rebuilt when the tile is added to a mesh.
//!
//! A tile set stream starts with a [`NavMeshSetHeader`] and holds one
//! `{ tile_ref, data_size, bytes }` record per resident tile so a loaded mesh
//! hands out the same references as the saved one.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use navkit_common::{Error, Result};

use super::bv_tree::BVNode;
use super::nav_mesh::{MeshTile, OffMeshConnection, Poly, PolyDetail, TileHeader};
use super::{NavMesh, NavMeshParams, PolyFlags, PolyRef, PolyType, Status, MAX_VERTS_PER_POLY};

/// Magic number of a serialized tile ('NAVT')
pub const NAVMESH_TILE_MAGIC: u32 = u32::from_le_bytes(*b"NAVT");

/// Current tile layout version
pub const NAVMESH_TILE_VERSION: u32 = 1;

/// Magic number of a tile set stream ('MSAT')
pub const NAVMESH_SET_MAGIC: u32 = u32::from_le_bytes(*b"MSAT");

/// Current tile set layout version
pub const NAVMESH_SET_VERSION: u32 = 1;

/// Upper bound on any element count read from a stream
const MAX_ELEMENT_COUNT: u32 = 1 << 24;

fn read_f32x3<R: Read>(reader: &mut R) -> Result<[f32; 3]> {
    Ok([
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
    ])
}

fn write_f32x3<W: Write>(writer: &mut W, v: &[f32; 3]) -> Result<()> {
    for &c in v {
        writer.write_f32::<LittleEndian>(c)?;
    }
    Ok(())
}

fn read_count<R: Read>(reader: &mut R) -> Result<usize> {
    let count = reader.read_u32::<LittleEndian>()?;
    if count > MAX_ELEMENT_COUNT {
        return Err(Status::DataCorrupted.into());
    }
    Ok(count as usize)
}

/// Writes mesh layout parameters
pub fn write_nav_mesh_params<W: Write>(writer: &mut W, params: &NavMeshParams) -> Result<()> {
    write_f32x3(writer, &params.origin)?;
    writer.write_f32::<LittleEndian>(params.tile_width)?;
    writer.write_f32::<LittleEndian>(params.tile_height)?;
    writer.write_u32::<LittleEndian>(params.max_tiles as u32)?;
    writer.write_u32::<LittleEndian>(params.max_polys_per_tile as u32)?;
    Ok(())
}

/// Reads mesh layout parameters
pub fn read_nav_mesh_params<R: Read>(reader: &mut R) -> Result<NavMeshParams> {
    Ok(NavMeshParams {
        origin: read_f32x3(reader)?,
        tile_width: reader.read_f32::<LittleEndian>()?,
        tile_height: reader.read_f32::<LittleEndian>()?,
        max_tiles: reader.read_u32::<LittleEndian>()? as usize,
        max_polys_per_tile: reader.read_u32::<LittleEndian>()? as usize,
    })
}

/// Fixed header written in front of every tile
#[derive(Debug, Clone, PartialEq)]
struct TileDataHeader {
    magic: u32,
    version: u32,
    header: TileHeader,
    vert_count: u32,
    poly_count: u32,
    detail_mesh_count: u32,
    detail_vert_count: u32,
    detail_tri_count: u32,
    bv_node_count: u32,
    off_mesh_con_count: u32,
}

impl TileDataHeader {
    fn for_tile(tile: &MeshTile) -> Self {
        Self {
            magic: NAVMESH_TILE_MAGIC,
            version: NAVMESH_TILE_VERSION,
            header: tile.header.clone(),
            vert_count: (tile.verts.len() / 3) as u32,
            poly_count: tile.polys.len() as u32,
            detail_mesh_count: tile.detail_meshes.len() as u32,
            detail_vert_count: (tile.detail_verts.len() / 3) as u32,
            detail_tri_count: (tile.detail_tris.len() / 4) as u32,
            bv_node_count: tile.bv_tree.len() as u32,
            off_mesh_con_count: tile.off_mesh_connections.len() as u32,
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        let h = &self.header;
        writer.write_i32::<LittleEndian>(h.x)?;
        writer.write_i32::<LittleEndian>(h.y)?;
        writer.write_i32::<LittleEndian>(h.layer)?;
        writer.write_u32::<LittleEndian>(h.user_id)?;
        write_f32x3(writer, &h.bmin)?;
        write_f32x3(writer, &h.bmax)?;
        writer.write_f32::<LittleEndian>(h.walkable_height)?;
        writer.write_f32::<LittleEndian>(h.walkable_radius)?;
        writer.write_f32::<LittleEndian>(h.walkable_climb)?;
        writer.write_f32::<LittleEndian>(h.bv_quant_factor)?;
        for count in [
            self.vert_count,
            self.poly_count,
            self.detail_mesh_count,
            self.detail_vert_count,
            self.detail_tri_count,
            self.bv_node_count,
            self.off_mesh_con_count,
        ] {
            writer.write_u32::<LittleEndian>(count)?;
        }
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != NAVMESH_TILE_MAGIC {
            return Err(Status::WrongMagic.into());
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != NAVMESH_TILE_VERSION {
            return Err(Status::WrongVersion.into());
        }
        let header = TileHeader {
            x: reader.read_i32::<LittleEndian>()?,
            y: reader.read_i32::<LittleEndian>()?,
            layer: reader.read_i32::<LittleEndian>()?,
            user_id: reader.read_u32::<LittleEndian>()?,
            bmin: read_f32x3(reader)?,
            bmax: read_f32x3(reader)?,
            walkable_height: reader.read_f32::<LittleEndian>()?,
            walkable_radius: reader.read_f32::<LittleEndian>()?,
            walkable_climb: reader.read_f32::<LittleEndian>()?,
            bv_quant_factor: reader.read_f32::<LittleEndian>()?,
        };
        Ok(Self {
            magic,
            version,
            header,
            vert_count: read_count(reader)? as u32,
            poly_count: read_count(reader)? as u32,
            detail_mesh_count: read_count(reader)? as u32,
            detail_vert_count: read_count(reader)? as u32,
            detail_tri_count: read_count(reader)? as u32,
            bv_node_count: read_count(reader)? as u32,
            off_mesh_con_count: read_count(reader)? as u32,
        })
    }
}

fn write_poly<W: Write>(writer: &mut W, poly: &Poly) -> Result<()> {
    for &v in &poly.verts {
        writer.write_u16::<LittleEndian>(v)?;
    }
    for &n in &poly.neighbors {
        writer.write_u16::<LittleEndian>(n)?;
    }
    writer.write_u16::<LittleEndian>(poly.flags.bits())?;
    writer.write_u8(poly.vert_count)?;
    writer.write_u8(poly.area)?;
    writer.write_u8(poly.poly_type as u8)?;
    Ok(())
}

fn read_poly<R: Read>(reader: &mut R, vert_count: usize) -> Result<Poly> {
    let mut verts = [0u16; MAX_VERTS_PER_POLY];
    for v in &mut verts {
        *v = reader.read_u16::<LittleEndian>()?;
    }
    let mut neighbors = [0u16; MAX_VERTS_PER_POLY];
    for n in &mut neighbors {
        *n = reader.read_u16::<LittleEndian>()?;
    }
    let flags = PolyFlags::from_bits_truncate(reader.read_u16::<LittleEndian>()?);
    let count = reader.read_u8()?;
    let area = reader.read_u8()?;
    let poly_type = match reader.read_u8()? {
        0 => PolyType::Ground,
        1 => PolyType::OffMeshConnection,
        _ => return Err(Status::DataCorrupted.into()),
    };

    if count as usize > MAX_VERTS_PER_POLY
        || verts[..count as usize]
            .iter()
            .any(|&v| v as usize >= vert_count)
    {
        return Err(Status::DataCorrupted.into());
    }

    let mut poly = Poly::new(area, poly_type, flags);
    poly.verts = verts;
    poly.neighbors = neighbors;
    poly.vert_count = count;
    Ok(poly)
}

/// Writes a tile to a byte stream
pub fn write_tile<W: Write>(writer: &mut W, tile: &MeshTile) -> Result<()> {
    TileDataHeader::for_tile(tile).write_to(writer)?;

    for &v in &tile.verts {
        writer.write_f32::<LittleEndian>(v)?;
    }
    for poly in &tile.polys {
        write_poly(writer, poly)?;
    }
    for pd in &tile.detail_meshes {
        writer.write_u32::<LittleEndian>(pd.vert_base)?;
        writer.write_u32::<LittleEndian>(pd.tri_base)?;
        writer.write_u8(pd.vert_count)?;
        writer.write_u8(pd.tri_count)?;
    }
    for &v in &tile.detail_verts {
        writer.write_f32::<LittleEndian>(v)?;
    }
    writer.write_all(&tile.detail_tris)?;
    for node in &tile.bv_tree {
        for &c in node.bmin.iter().chain(node.bmax.iter()) {
            writer.write_u16::<LittleEndian>(c)?;
        }
        writer.write_i32::<LittleEndian>(node.i)?;
    }
    for con in &tile.off_mesh_connections {
        for &c in &con.pos {
            writer.write_f32::<LittleEndian>(c)?;
        }
        writer.write_f32::<LittleEndian>(con.radius)?;
        writer.write_u16::<LittleEndian>(con.poly)?;
        writer.write_u8(con.flags)?;
        writer.write_u8(con.side)?;
        writer.write_u32::<LittleEndian>(con.user_id)?;
    }
    Ok(())
}

/// Reads a tile written by [`write_tile`]
///
/// The tile comes back unlinked and not resident; add it to a mesh to use it.
pub fn read_tile<R: Read>(reader: &mut R) -> Result<MeshTile> {
    let h = TileDataHeader::read_from(reader)?;
    let vert_count = h.vert_count as usize;
    let poly_count = h.poly_count as usize;

    let mut tile = MeshTile {
        header: h.header,
        ..MeshTile::default()
    };

    tile.verts.reserve(vert_count * 3);
    for _ in 0..vert_count * 3 {
        tile.verts.push(reader.read_f32::<LittleEndian>()?);
    }

    tile.polys.reserve(poly_count);
    for _ in 0..poly_count {
        tile.polys.push(read_poly(reader, vert_count)?);
    }

    for _ in 0..h.detail_mesh_count {
        tile.detail_meshes.push(PolyDetail {
            vert_base: reader.read_u32::<LittleEndian>()?,
            tri_base: reader.read_u32::<LittleEndian>()?,
            vert_count: reader.read_u8()?,
            tri_count: reader.read_u8()?,
        });
    }
    for _ in 0..h.detail_vert_count * 3 {
        tile.detail_verts.push(reader.read_f32::<LittleEndian>()?);
    }
    tile.detail_tris = vec![0; h.detail_tri_count as usize * 4];
    reader.read_exact(&mut tile.detail_tris)?;

    for _ in 0..h.bv_node_count {
        let mut q = [0u16; 6];
        for c in &mut q {
            *c = reader.read_u16::<LittleEndian>()?;
        }
        let i = reader.read_i32::<LittleEndian>()?;
        if i >= poly_count as i32 {
            return Err(Status::DataCorrupted.into());
        }
        tile.bv_tree.push(BVNode {
            bmin: [q[0], q[1], q[2]],
            bmax: [q[3], q[4], q[5]],
            i,
        });
    }

    for _ in 0..h.off_mesh_con_count {
        let mut pos = [0.0f32; 6];
        for c in &mut pos {
            *c = reader.read_f32::<LittleEndian>()?;
        }
        let con = OffMeshConnection {
            pos,
            radius: reader.read_f32::<LittleEndian>()?,
            poly: reader.read_u16::<LittleEndian>()?,
            flags: reader.read_u8()?,
            side: reader.read_u8()?,
            user_id: reader.read_u32::<LittleEndian>()?,
        };
        let is_con_poly = tile
            .polys
            .get(con.poly as usize)
            .is_some_and(|p| p.poly_type == PolyType::OffMeshConnection);
        if !is_con_poly {
            return Err(Status::DataCorrupted.into());
        }
        tile.off_mesh_connections.push(con);
    }

    Ok(tile)
}

/// Serializes a tile to a byte buffer
pub fn save_tile_to_binary(tile: &MeshTile) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    write_tile(&mut buffer, tile)?;
    Ok(buffer)
}

/// Deserializes a tile from a byte buffer
pub fn load_tile_from_binary(data: &[u8]) -> Result<MeshTile> {
    read_tile(&mut Cursor::new(data))
}

/// Header of a tile set stream
#[derive(Debug, Clone, PartialEq)]
pub struct NavMeshSetHeader {
    pub magic: u32,
    pub version: u32,
    pub tile_count: u32,
    pub params: NavMeshParams,
    /// Union of the bounds of all saved tiles
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
}

impl NavMeshSetHeader {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.tile_count)?;
        write_nav_mesh_params(writer, &self.params)?;
        write_f32x3(writer, &self.bmin)?;
        write_f32x3(writer, &self.bmax)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != NAVMESH_SET_MAGIC {
            return Err(Status::WrongMagic.into());
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != NAVMESH_SET_VERSION {
            return Err(Status::WrongVersion.into());
        }
        Ok(Self {
            magic,
            version,
            tile_count: read_count(reader)? as u32,
            params: read_nav_mesh_params(reader)?,
            bmin: read_f32x3(reader)?,
            bmax: read_f32x3(reader)?,
        })
    }
}

/// Union of the bounds of all resident tiles, zero for an empty mesh
pub fn nav_mesh_bounds(mesh: &NavMesh) -> ([f32; 3], [f32; 3]) {
    let mut bmin = [f32::MAX; 3];
    let mut bmax = [f32::MIN; 3];
    let mut any = false;
    for (_, tile) in mesh.tiles() {
        any = true;
        for k in 0..3 {
            bmin[k] = bmin[k].min(tile.header.bmin[k]);
            bmax[k] = bmax[k].max(tile.header.bmax[k]);
        }
    }
    if any {
        (bmin, bmax)
    } else {
        ([0.0; 3], [0.0; 3])
    }
}

/// Writes every resident tile of a mesh as a tile set
pub fn write_nav_mesh_set<W: Write>(writer: &mut W, mesh: &NavMesh) -> Result<()> {
    let (bmin, bmax) = nav_mesh_bounds(mesh);
    let header = NavMeshSetHeader {
        magic: NAVMESH_SET_MAGIC,
        version: NAVMESH_SET_VERSION,
        tile_count: mesh.tile_count() as u32,
        params: mesh.params().clone(),
        bmin,
        bmax,
    };
    header.write_to(writer)?;

    for (idx, tile) in mesh.tiles() {
        let data = save_tile_to_binary(tile)?;
        writer.write_u32::<LittleEndian>(mesh.poly_ref_base(idx).id())?;
        writer.write_u32::<LittleEndian>(data.len() as u32)?;
        writer.write_all(&data)?;
    }
    Ok(())
}

/// Reads a tile set and rebuilds the mesh
///
/// Each tile is restored at the reference it was saved with.
pub fn read_nav_mesh_set<R: Read>(reader: &mut R) -> Result<NavMesh> {
    let header = NavMeshSetHeader::read_from(reader)?;
    let mut mesh = NavMesh::new(header.params)?;

    for _ in 0..header.tile_count {
        let tile_ref = PolyRef::new(reader.read_u32::<LittleEndian>()?);
        let size = read_count(reader)?;
        if !tile_ref.is_valid() || size == 0 {
            return Err(Status::DataCorrupted.into());
        }
        let mut data = vec![0u8; size];
        reader.read_exact(&mut data)?;
        let tile = load_tile_from_binary(&data)?;
        mesh.restore_tile(tile, tile_ref).map_err(|e| match e {
            Error::InvalidReference(_) => Status::DataCorrupted.into(),
            other => other,
        })?;
    }
    log::debug!("loaded {} tiles from tile set", mesh.tile_count());
    Ok(mesh)
}

/// Serializes a mesh as a tile set into a byte buffer
pub fn save_nav_mesh_to_binary(mesh: &NavMesh) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    write_nav_mesh_set(&mut buffer, mesh)?;
    Ok(buffer)
}

/// Deserializes a mesh from a tile set buffer
pub fn load_nav_mesh_from_binary(data: &[u8]) -> Result<NavMesh> {
    read_nav_mesh_set(&mut Cursor::new(data))
}
