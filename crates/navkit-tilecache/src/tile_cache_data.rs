//! Tile cache layer data and its compressed layout
//!
//! A compressed tile is the uncompressed [`TileCacheLayerHeader`] followed by
//! the cell payload (heights, areas, connections) run through a
//! [`TileCacheCompressor`].

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use navkit::{Status, NULL_AREA};
use navkit_common::{Error, Result};

use crate::compressor::TileCacheCompressor;
use crate::tile_cache::TileCacheParams;

/// Magic number of a tile cache layer ('NVTL')
pub const TILECACHE_MAGIC: u32 = u32::from_le_bytes(*b"NVTL");

/// Current layer layout version
pub const TILECACHE_VERSION: u32 = 1;

/// Size in bytes of a serialized layer header
pub const LAYER_HEADER_SIZE: usize = 54;

/// Connection bit offsets per direction: -x, +z, +x, -z
pub const DIR_OFFSETS: [(i32, i32); 4] = [(-1, 0), (0, 1), (1, 0), (0, -1)];

/// Header of a tile cache layer
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct TileCacheLayerHeader {
    pub magic: u32,
    pub version: u32,
    pub tx: i32,
    pub ty: i32,
    pub tlayer: i32,
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    /// Height range of walkable cells, in cell-height units above `bmin[1]`
    pub hmin: u16,
    pub hmax: u16,
    /// Grid size in cells
    pub width: u8,
    pub height: u8,
    /// Walkable cell bounds; `minx > maxx` when nothing is walkable
    pub minx: u8,
    pub maxx: u8,
    pub miny: u8,
    pub maxy: u8,
}

impl TileCacheLayerHeader {
    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Bounds of the walkable part of the tile, `None` when nothing is walkable
    pub fn tight_bounds(&self, cs: f32) -> Option<([f32; 3], [f32; 3])> {
        if self.minx > self.maxx || self.miny > self.maxy {
            return None;
        }
        Some((
            [
                self.bmin[0] + self.minx as f32 * cs,
                self.bmin[1],
                self.bmin[2] + self.miny as f32 * cs,
            ],
            [
                self.bmin[0] + (self.maxx as f32 + 1.0) * cs,
                self.bmax[1],
                self.bmin[2] + (self.maxy as f32 + 1.0) * cs,
            ],
        ))
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_i32::<LittleEndian>(self.tx)?;
        writer.write_i32::<LittleEndian>(self.ty)?;
        writer.write_i32::<LittleEndian>(self.tlayer)?;
        for v in self.bmin.iter().chain(&self.bmax) {
            writer.write_f32::<LittleEndian>(*v)?;
        }
        writer.write_u16::<LittleEndian>(self.hmin)?;
        writer.write_u16::<LittleEndian>(self.hmax)?;
        writer.write_all(&[
            self.width,
            self.height,
            self.minx,
            self.maxx,
            self.miny,
            self.maxy,
        ])?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != TILECACHE_MAGIC {
            return Err(Status::WrongMagic.into());
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != TILECACHE_VERSION {
            return Err(Status::WrongVersion.into());
        }
        let tx = reader.read_i32::<LittleEndian>()?;
        let ty = reader.read_i32::<LittleEndian>()?;
        let tlayer = reader.read_i32::<LittleEndian>()?;
        let mut bounds = [0.0f32; 6];
        for v in &mut bounds {
            *v = reader.read_f32::<LittleEndian>()?;
        }
        let hmin = reader.read_u16::<LittleEndian>()?;
        let hmax = reader.read_u16::<LittleEndian>()?;
        let mut grid = [0u8; 6];
        reader.read_exact(&mut grid)?;

        let header = Self {
            magic,
            version,
            tx,
            ty,
            tlayer,
            bmin: [bounds[0], bounds[1], bounds[2]],
            bmax: [bounds[3], bounds[4], bounds[5]],
            hmin,
            hmax,
            width: grid[0],
            height: grid[1],
            minx: grid[2],
            maxx: grid[3],
            miny: grid[4],
            maxy: grid[5],
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Status::DataCorrupted.into());
        }
        if self.bmin.iter().chain(&self.bmax).any(|v| !v.is_finite())
            || (0..3).any(|k| self.bmin[k] > self.bmax[k])
        {
            return Err(Status::DataCorrupted.into());
        }
        Ok(())
    }
}

/// Decompressed cell grid of one tile
///
/// Cells are stored row by row (`z * width + x`). A cell is walkable when its
/// area is not [`NULL_AREA`].
#[derive(Debug, Clone, PartialEq)]
pub struct TileCacheLayer {
    pub header: TileCacheLayerHeader,
    /// Surface height in cell-height units above `header.bmin[1]`
    pub heights: Vec<u8>,
    pub areas: Vec<u8>,
    /// Connection mask per cell, bit `d` set when the neighbor in
    /// direction `d` of [`DIR_OFFSETS`] is reachable
    pub cons: Vec<u8>,
}

impl TileCacheLayer {
    /// Creates an empty (unwalkable) layer for tile `(tx, ty, tlayer)`
    pub fn new(tx: i32, ty: i32, tlayer: i32, params: &TileCacheParams) -> Result<Self> {
        params.validate()?;
        let (bmin, bmax) = params.tile_bounds(tx, ty);
        let header = TileCacheLayerHeader {
            magic: TILECACHE_MAGIC,
            version: TILECACHE_VERSION,
            tx,
            ty,
            tlayer,
            bmin,
            bmax,
            hmin: 0,
            hmax: 0,
            width: params.width as u8,
            height: params.height as u8,
            minx: params.width as u8,
            maxx: 0,
            miny: params.height as u8,
            maxy: 0,
        };
        let cells = header.cell_count();
        Ok(Self {
            header,
            heights: vec![0; cells],
            areas: vec![NULL_AREA; cells],
            cons: vec![0; cells],
        })
    }

    pub fn width(&self) -> usize {
        self.header.width as usize
    }

    pub fn height(&self) -> usize {
        self.header.height as usize
    }

    pub fn cell_index(&self, x: usize, z: usize) -> Option<usize> {
        (x < self.width() && z < self.height()).then(|| z * self.width() + x)
    }

    /// Sets the surface height and area of a cell
    pub fn set_cell(&mut self, x: usize, z: usize, height: u8, area: u8) -> Result<()> {
        let idx = self
            .cell_index(x, z)
            .ok_or_else(|| Error::InvalidInput(format!("cell ({x}, {z}) outside layer")))?;
        self.heights[idx] = height;
        self.areas[idx] = area;
        Ok(())
    }

    pub fn is_walkable(&self, x: usize, z: usize) -> bool {
        self.cell_index(x, z)
            .is_some_and(|idx| self.areas[idx] != NULL_AREA)
    }

    /// Neighbor of a cell in direction `dir`, if inside the layer
    pub fn neighbour(&self, x: usize, z: usize, dir: usize) -> Option<(usize, usize)> {
        let (dx, dz) = DIR_OFFSETS[dir & 3];
        let nx = x as i32 + dx;
        let nz = z as i32 + dz;
        if nx < 0 || nz < 0 {
            return None;
        }
        let (nx, nz) = (nx as usize, nz as usize);
        (nx < self.width() && nz < self.height()).then_some((nx, nz))
    }

    pub fn is_connected(&self, x: usize, z: usize, dir: usize) -> bool {
        self.cell_index(x, z)
            .is_some_and(|idx| self.cons[idx] & (1 << (dir & 3)) != 0)
    }

    /// Recomputes connections, height range and walkable bounds
    ///
    /// Two walkable cells are connected when their heights differ by at most
    /// `walkable_climb` cell-height units.
    pub fn build_connections(&mut self, walkable_climb: u8, ch: f32) {
        let (w, h) = (self.width(), self.height());
        let mut hmin = u16::MAX;
        let mut hmax = 0u16;
        let (mut minx, mut maxx, mut miny, mut maxy) = (w, 0, h, 0);

        for z in 0..h {
            for x in 0..w {
                let idx = z * w + x;
                self.cons[idx] = 0;
                if self.areas[idx] == NULL_AREA {
                    continue;
                }
                let y = self.heights[idx];
                hmin = hmin.min(y as u16);
                hmax = hmax.max(y as u16);
                minx = minx.min(x);
                maxx = maxx.max(x);
                miny = miny.min(z);
                maxy = maxy.max(z);

                for dir in 0..4 {
                    let Some((nx, nz)) = self.neighbour(x, z, dir) else {
                        continue;
                    };
                    let nidx = nz * w + nx;
                    if self.areas[nidx] != NULL_AREA
                        && self.heights[nidx].abs_diff(y) <= walkable_climb
                    {
                        self.cons[idx] |= 1 << dir;
                    }
                }
            }
        }

        if hmin > hmax {
            hmin = 0;
        }
        self.header.hmin = hmin;
        self.header.hmax = hmax;
        self.header.minx = minx as u8;
        self.header.maxx = maxx as u8;
        self.header.miny = miny as u8;
        self.header.maxy = maxy as u8;
        self.header.bmax[1] = self.header.bmin[1] + hmax as f32 * ch;
    }

    pub fn walkable_cell_count(&self) -> usize {
        self.areas.iter().filter(|&&a| a != NULL_AREA).count()
    }

    /// Cell payload: heights, areas and connections back to back
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.heights.len() * 3);
        payload.extend_from_slice(&self.heights);
        payload.extend_from_slice(&self.areas);
        payload.extend_from_slice(&self.cons);
        payload
    }

    pub fn from_payload(header: TileCacheLayerHeader, payload: &[u8]) -> Result<Self> {
        let cells = header.cell_count();
        if payload.len() != cells * 3 {
            return Err(Status::DataCorrupted.into());
        }
        Ok(Self {
            header,
            heights: payload[..cells].to_vec(),
            areas: payload[cells..cells * 2].to_vec(),
            cons: payload[cells * 2..].to_vec(),
        })
    }
}

/// Reads only the header of a compressed tile
pub fn read_layer_header(data: &[u8]) -> Result<TileCacheLayerHeader> {
    TileCacheLayerHeader::read_from(&mut Cursor::new(data))
}

/// Serializes a layer as header plus compressed payload
pub fn encode_compressed_tile(
    layer: &TileCacheLayer,
    compressor: &dyn TileCacheCompressor,
) -> Result<Vec<u8>> {
    let payload = layer.to_payload();
    let compressed = compressor.compress(&payload)?;
    let mut data = Vec::with_capacity(LAYER_HEADER_SIZE + compressed.len());
    layer.header.write_to(&mut data)?;
    data.write_all(&compressed)?;
    Ok(data)
}

/// Restores a layer from header plus compressed payload
pub fn decode_compressed_tile(
    data: &[u8],
    compressor: &dyn TileCacheCompressor,
) -> Result<TileCacheLayer> {
    let header = read_layer_header(data)?;
    let payload = compressor.decompress(&data[LAYER_HEADER_SIZE..])?;
    TileCacheLayer::from_payload(header, &payload)
}
