//! Persisted tile cache layout
//!
//! A tile cache stream starts with a [`TileCacheSetHeader`] and holds one
//! `{ compressed_ref, data_size, bytes }` record per stored tile. Obstacles
//! are runtime state and are not saved.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use navkit::{read_nav_mesh_params, write_nav_mesh_params, NavMeshParams, Status};
use navkit_common::{Aabb, Error, Result, Vec3};

use crate::tile_cache::{CompressedTileRef, TileCache, TileCacheParams};

/// Magic number of a tile cache stream ('TSAT')
pub const TILECACHE_SET_MAGIC: u32 = u32::from_le_bytes(*b"TSAT");

/// Current tile cache stream version
pub const TILECACHE_SET_VERSION: u32 = 1;

/// Upper bound on the size of one stored tile
const MAX_TILE_DATA_SIZE: usize = 1 << 24;

/// Header of a tile cache stream
#[derive(Debug, Clone, PartialEq)]
pub struct TileCacheSetHeader {
    pub magic: u32,
    pub version: u32,
    pub tile_count: u32,
    pub mesh_params: NavMeshParams,
    pub cache_params: TileCacheParams,
    /// Union of the stored tile bounds
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
}

impl TileCacheSetHeader {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.tile_count)?;
        write_nav_mesh_params(writer, &self.mesh_params)?;
        write_cache_params(writer, &self.cache_params)?;
        for v in self.bmin.iter().chain(&self.bmax) {
            writer.write_f32::<LittleEndian>(*v)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != TILECACHE_SET_MAGIC {
            return Err(Status::WrongMagic.into());
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != TILECACHE_SET_VERSION {
            return Err(Status::WrongVersion.into());
        }
        let tile_count = reader.read_u32::<LittleEndian>()?;
        let mesh_params = read_nav_mesh_params(reader)?;
        let cache_params = read_cache_params(reader)?;
        let mut bounds = [0.0f32; 6];
        for v in &mut bounds {
            *v = reader.read_f32::<LittleEndian>()?;
        }
        Ok(Self {
            magic,
            version,
            tile_count,
            mesh_params,
            cache_params,
            bmin: [bounds[0], bounds[1], bounds[2]],
            bmax: [bounds[3], bounds[4], bounds[5]],
        })
    }
}

fn write_cache_params<W: Write>(writer: &mut W, params: &TileCacheParams) -> Result<()> {
    for v in &params.origin {
        writer.write_f32::<LittleEndian>(*v)?;
    }
    writer.write_f32::<LittleEndian>(params.cs)?;
    writer.write_f32::<LittleEndian>(params.ch)?;
    writer.write_i32::<LittleEndian>(params.width)?;
    writer.write_i32::<LittleEndian>(params.height)?;
    writer.write_f32::<LittleEndian>(params.walkable_height)?;
    writer.write_f32::<LittleEndian>(params.walkable_radius)?;
    writer.write_f32::<LittleEndian>(params.walkable_climb)?;
    writer.write_i32::<LittleEndian>(params.max_tiles)?;
    writer.write_i32::<LittleEndian>(params.max_obstacles)?;
    Ok(())
}

fn read_cache_params<R: Read>(reader: &mut R) -> Result<TileCacheParams> {
    Ok(TileCacheParams {
        origin: [
            reader.read_f32::<LittleEndian>()?,
            reader.read_f32::<LittleEndian>()?,
            reader.read_f32::<LittleEndian>()?,
        ],
        cs: reader.read_f32::<LittleEndian>()?,
        ch: reader.read_f32::<LittleEndian>()?,
        width: reader.read_i32::<LittleEndian>()?,
        height: reader.read_i32::<LittleEndian>()?,
        walkable_height: reader.read_f32::<LittleEndian>()?,
        walkable_radius: reader.read_f32::<LittleEndian>()?,
        walkable_climb: reader.read_f32::<LittleEndian>()?,
        max_tiles: reader.read_i32::<LittleEndian>()?,
        max_obstacles: reader.read_i32::<LittleEndian>()?,
    })
}

/// Union of the bounds of all stored tiles
pub fn tile_cache_bounds(cache: &TileCache) -> ([f32; 3], [f32; 3]) {
    let mut bounds = Aabb::empty();
    for (_, tile) in cache.tiles() {
        bounds.expand_point(Vec3::from(tile.header.bmin));
        bounds.expand_point(Vec3::from(tile.header.bmax));
    }
    if bounds.is_valid() {
        (bounds.min_array(), bounds.max_array())
    } else {
        ([0.0; 3], [0.0; 3])
    }
}

/// Writes the stored tiles of a cache with the mesh layout they build into
pub fn write_tile_cache_set<W: Write>(
    writer: &mut W,
    cache: &TileCache,
    mesh_params: &NavMeshParams,
) -> Result<()> {
    let (bmin, bmax) = tile_cache_bounds(cache);
    let header = TileCacheSetHeader {
        magic: TILECACHE_SET_MAGIC,
        version: TILECACHE_SET_VERSION,
        tile_count: cache.tile_count() as u32,
        mesh_params: mesh_params.clone(),
        cache_params: cache.params().clone(),
        bmin,
        bmax,
    };
    header.write_to(writer)?;

    for (tile_ref, tile) in cache.tiles() {
        writer.write_u32::<LittleEndian>(tile_ref.id())?;
        writer.write_u32::<LittleEndian>(tile.data.len() as u32)?;
        writer.write_all(&tile.data)?;
    }
    Ok(())
}

/// Reads a tile cache stream
///
/// Tiles come back under their saved references. The navigation mesh is not
/// built; create one from the returned parameters and call
/// [`TileCache::build_all_nav_mesh_tiles`].
pub fn read_tile_cache_set<R: Read>(reader: &mut R) -> Result<(NavMeshParams, TileCache)> {
    let header = TileCacheSetHeader::read_from(reader)?;
    let mut cache = TileCache::new(header.cache_params)?;

    for _ in 0..header.tile_count {
        let tile_ref = CompressedTileRef::new(reader.read_u32::<LittleEndian>()?);
        let size = reader.read_u32::<LittleEndian>()? as usize;
        if size == 0 || size > MAX_TILE_DATA_SIZE {
            return Err(Status::DataCorrupted.into());
        }
        let mut data = vec![0u8; size];
        reader.read_exact(&mut data)?;
        cache.restore_tile(data, tile_ref).map_err(|e| match e {
            Error::InvalidReference(_) => Status::DataCorrupted.into(),
            other => other,
        })?;
    }
    log::debug!("loaded {} compressed tiles", cache.tile_count());
    Ok((header.mesh_params, cache))
}

pub fn save_tile_cache_to_binary(cache: &TileCache, mesh_params: &NavMeshParams) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    write_tile_cache_set(&mut buffer, cache, mesh_params)?;
    Ok(buffer)
}

pub fn load_tile_cache_from_binary(data: &[u8]) -> Result<(NavMeshParams, TileCache)> {
    read_tile_cache_set(&mut Cursor::new(data))
}
