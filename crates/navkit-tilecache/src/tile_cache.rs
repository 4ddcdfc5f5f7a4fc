//! Tile cache with dynamic obstacle support
//!
//! The cache owns the compressed base layer of every tile and a registry of
//! obstacles. Adding or removing an obstacle only records a request;
//! [`TileCache::update`] resolves requests into tile rebuilds and swaps the
//! rebuilt tiles into a [`NavMesh`], a bounded number per call.

use std::collections::{HashMap, VecDeque};

use navkit::{NavMesh, NavMeshBuilder, NavMeshParams, Status};
use navkit_common::{overlap_bounds, Error, Result};

use crate::compressor::{Lz4Compressor, TileCacheCompressor};
use crate::obstacle::{Obstacle, ObstacleRef, ObstacleShape, ObstacleState};
use crate::tile_cache_data::{
    decode_compressed_tile, encode_compressed_tile, read_layer_header, TileCacheLayer,
    TileCacheLayerHeader,
};
use crate::tile_mesh_builder::{CellMeshBuilder, TileMeshBuilder};

/// Maximum number of obstacle requests buffered between updates
pub const MAX_REQUESTS: usize = 64;

/// Largest navigation mesh tile count a cache hands to [`NavMesh`]
const MAX_NAV_MESH_TILES: usize = 1 << navkit::TILE_BITS;

/// Compressed tile reference: `(salt << 16) | index`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct CompressedTileRef(u32);

impl CompressedTileRef {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn id(&self) -> u32 {
        self.0
    }

    pub const fn encode(salt: u16, index: usize) -> Self {
        Self(((salt as u32) << 16) | (index as u32 & 0xffff))
    }

    pub const fn salt(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn index(&self) -> usize {
        (self.0 & 0xffff) as usize
    }
}

/// Parameters for the tile cache
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct TileCacheParams {
    /// World-space origin of tile (0, 0)
    pub origin: [f32; 3],
    /// Cell size (xz)
    pub cs: f32,
    /// Cell height (y)
    pub ch: f32,
    /// Tile size in cells along x
    pub width: i32,
    /// Tile size in cells along z
    pub height: i32,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    /// Maximum number of compressed tiles
    pub max_tiles: i32,
    /// Maximum number of obstacles
    pub max_obstacles: i32,
}

impl Default for TileCacheParams {
    fn default() -> Self {
        Self {
            origin: [0.0; 3],
            cs: 0.3,
            ch: 0.2,
            width: 48,
            height: 48,
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.9,
            max_tiles: 128,
            max_obstacles: 128,
        }
    }
}

impl TileCacheParams {
    pub fn validate(&self) -> Result<()> {
        if self.origin.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidInput("origin must be finite".into()));
        }
        if !(self.cs.is_finite() && self.cs > 0.0 && self.ch.is_finite() && self.ch > 0.0) {
            return Err(Error::InvalidInput("cell size and height must be positive".into()));
        }
        if !(1..=255).contains(&self.width) || !(1..=255).contains(&self.height) {
            return Err(Error::InvalidInput(
                "tile width and height must be in 1..=255 cells".into(),
            ));
        }
        if !(1..=0xffff).contains(&self.max_tiles) {
            return Err(Error::InvalidInput("max_tiles must be in 1..=65535".into()));
        }
        if !(1..=0xffff).contains(&self.max_obstacles) {
            return Err(Error::InvalidInput(
                "max_obstacles must be in 1..=65535".into(),
            ));
        }
        if self.walkable_height < 0.0 || self.walkable_radius < 0.0 || self.walkable_climb < 0.0 {
            return Err(Error::InvalidInput(
                "walkable parameters must not be negative".into(),
            ));
        }
        Ok(())
    }

    /// World size of a tile along x and z
    pub fn tile_size(&self) -> (f32, f32) {
        (self.width as f32 * self.cs, self.height as f32 * self.cs)
    }

    /// Bounds of tile `(tx, ty)` with a flat vertical extent at the origin
    pub fn tile_bounds(&self, tx: i32, ty: i32) -> ([f32; 3], [f32; 3]) {
        let (tw, th) = self.tile_size();
        let bmin = [
            self.origin[0] + tx as f32 * tw,
            self.origin[1],
            self.origin[2] + ty as f32 * th,
        ];
        (bmin, [bmin[0] + tw, bmin[1], bmin[2] + th])
    }

    /// Largest climbable step in cell-height units
    pub fn walkable_climb_cells(&self) -> u8 {
        (self.walkable_climb / self.ch).floor().clamp(0.0, 255.0) as u8
    }

    /// Navigation mesh layout matching the cache's tile grid
    pub fn nav_mesh_params(&self, max_polys_per_tile: usize) -> NavMeshParams {
        let (tile_width, tile_height) = self.tile_size();
        NavMeshParams {
            origin: self.origin,
            tile_width,
            tile_height,
            max_tiles: (self.max_tiles as usize).min(MAX_NAV_MESH_TILES),
            max_polys_per_tile,
        }
    }
}

#[cfg(feature = "serialization")]
impl TileCacheParams {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Codec(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Codec(e.to_string()))
    }

    pub fn to_binary(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| Error::Codec(e.to_string()))
    }

    pub fn from_binary(data: &[u8]) -> Result<Self> {
        postcard::from_bytes(data).map_err(|e| Error::Codec(e.to_string()))
    }
}

/// Compressed tile stored in the cache
#[derive(Debug, Clone)]
pub struct CompressedTile {
    pub header: TileCacheLayerHeader,
    /// Header followed by the compressed payload
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy)]
struct ObstacleRequest {
    action: RequestAction,
    reference: ObstacleRef,
}

/// Tile cache for dynamic navigation mesh updates
#[derive(Debug)]
pub struct TileCache {
    params: TileCacheParams,
    compressor: Box<dyn TileCacheCompressor>,
    mesh_builder: Box<dyn TileMeshBuilder>,

    tiles: Vec<Option<CompressedTile>>,
    tile_salts: Vec<u16>,
    free_tiles: Vec<usize>,
    /// Tile slots per (x, y) column
    pos_lookup: HashMap<(i32, i32), Vec<usize>>,

    obstacles: Vec<Obstacle>,
    free_obstacles: Vec<usize>,

    requests: Vec<ObstacleRequest>,
    /// Tiles waiting for a rebuild, each at most once
    update_queue: VecDeque<CompressedTileRef>,
}

impl TileCache {
    /// Creates a tile cache with LZ4 payloads and the cell mesh builder
    pub fn new(params: TileCacheParams) -> Result<Self> {
        Self::with_components(
            params,
            Box::new(Lz4Compressor),
            Box::new(CellMeshBuilder::default()),
        )
    }

    pub fn with_components(
        params: TileCacheParams,
        compressor: Box<dyn TileCacheCompressor>,
        mesh_builder: Box<dyn TileMeshBuilder>,
    ) -> Result<Self> {
        params.validate()?;
        let max_tiles = params.max_tiles as usize;
        let max_obstacles = params.max_obstacles as usize;
        Ok(Self {
            params,
            compressor,
            mesh_builder,
            tiles: vec![None; max_tiles],
            tile_salts: vec![1; max_tiles],
            free_tiles: (0..max_tiles).rev().collect(),
            pos_lookup: HashMap::new(),
            obstacles: vec![Obstacle::default(); max_obstacles],
            free_obstacles: (0..max_obstacles).rev().collect(),
            requests: Vec::new(),
            update_queue: VecDeque::new(),
        })
    }

    pub fn params(&self) -> &TileCacheParams {
        &self.params
    }

    pub fn compressor(&self) -> &dyn TileCacheCompressor {
        self.compressor.as_ref()
    }

    /// Navigation mesh layout matching this cache
    pub fn nav_mesh_params(&self, max_polys_per_tile: usize) -> NavMeshParams {
        self.params.nav_mesh_params(max_polys_per_tile)
    }

    /// Encodes a layer with this cache's compressor, ready for [`Self::add_tile`]
    pub fn compress_layer(&self, layer: &TileCacheLayer) -> Result<Vec<u8>> {
        encode_compressed_tile(layer, self.compressor.as_ref())
    }

    /// Number of stored tiles
    pub fn tile_count(&self) -> usize {
        self.tiles.len() - self.free_tiles.len()
    }

    /// Number of live obstacles, including those being removed
    pub fn obstacle_count(&self) -> usize {
        self.obstacles.len() - self.free_obstacles.len()
    }

    /// Whether all requests and rebuilds have been processed
    pub fn is_up_to_date(&self) -> bool {
        self.requests.is_empty() && self.update_queue.is_empty()
    }

    // Tiles

    /// Stores a compressed tile and returns its reference
    ///
    /// The tile is not built into any navigation mesh; call
    /// [`Self::build_nav_mesh_tile`] for that.
    pub fn add_tile(&mut self, data: Vec<u8>) -> Result<CompressedTileRef> {
        let header = self.check_tile_header(&data)?;
        let idx = *self.free_tiles.last().ok_or(Status::TileCacheFull)?;
        self.free_tiles.pop();
        Ok(self.insert_tile(idx, header, data))
    }

    /// Stores a compressed tile at the slot and salt encoded in `tile_ref`
    pub fn restore_tile(
        &mut self,
        data: Vec<u8>,
        tile_ref: CompressedTileRef,
    ) -> Result<CompressedTileRef> {
        let idx = tile_ref.index();
        if idx >= self.tiles.len() || tile_ref.salt() == 0 {
            return Err(Status::OutOfRange.into());
        }
        let header = self.check_tile_header(&data)?;
        let pos = self
            .free_tiles
            .iter()
            .position(|&s| s == idx)
            .ok_or(Status::AlreadyExists)?;
        self.free_tiles.remove(pos);
        self.tile_salts[idx] = tile_ref.salt();
        Ok(self.insert_tile(idx, header, data))
    }

    fn check_tile_header(&self, data: &[u8]) -> Result<TileCacheLayerHeader> {
        let header = read_layer_header(data)?;
        if header.width as i32 != self.params.width || header.height as i32 != self.params.height
        {
            return Err(Error::InvalidInput(format!(
                "tile is {}x{} cells, cache expects {}x{}",
                header.width, header.height, self.params.width, self.params.height
            )));
        }
        if self
            .find_tile_index(header.tx, header.ty, header.tlayer)
            .is_some()
        {
            return Err(Status::AlreadyExists.into());
        }
        Ok(header)
    }

    fn insert_tile(
        &mut self,
        idx: usize,
        header: TileCacheLayerHeader,
        data: Vec<u8>,
    ) -> CompressedTileRef {
        self.pos_lookup
            .entry((header.tx, header.ty))
            .or_default()
            .push(idx);
        log::debug!(
            "stored compressed tile ({}, {}, {}) in slot {idx}, {} bytes",
            header.tx,
            header.ty,
            header.tlayer,
            data.len()
        );
        self.tiles[idx] = Some(CompressedTile { header, data });
        CompressedTileRef::encode(self.tile_salts[idx], idx)
    }

    /// Removes a tile and returns its compressed data
    ///
    /// The slot's salt is bumped so the old reference is rejected afterwards.
    /// The navigation mesh tile built from it is left alone.
    pub fn remove_tile(&mut self, tile_ref: CompressedTileRef) -> Result<Vec<u8>> {
        let idx = self.resolve_tile(tile_ref)?;
        let tile = self.tiles[idx].take().ok_or(Status::StaleReference)?;
        let key = (tile.header.tx, tile.header.ty);
        if let Some(slots) = self.pos_lookup.get_mut(&key) {
            slots.retain(|&s| s != idx);
            if slots.is_empty() {
                self.pos_lookup.remove(&key);
            }
        }
        self.tile_salts[idx] = next_salt(self.tile_salts[idx]);
        self.free_tiles.push(idx);
        log::debug!(
            "removed compressed tile ({}, {}, {}) from slot {idx}",
            tile.header.tx,
            tile.header.ty,
            tile.header.tlayer
        );
        Ok(tile.data)
    }

    fn resolve_tile(&self, tile_ref: CompressedTileRef) -> Result<usize> {
        let idx = tile_ref.index();
        if idx >= self.tiles.len() {
            return Err(Status::OutOfRange.into());
        }
        if self.tile_salts[idx] != tile_ref.salt() || self.tiles[idx].is_none() {
            return Err(Status::StaleReference.into());
        }
        Ok(idx)
    }

    pub fn get_tile_by_ref(&self, tile_ref: CompressedTileRef) -> Result<&CompressedTile> {
        let idx = self.resolve_tile(tile_ref)?;
        self.tiles[idx]
            .as_ref()
            .ok_or_else(|| Status::StaleReference.into())
    }

    fn find_tile_index(&self, tx: i32, ty: i32, tlayer: i32) -> Option<usize> {
        self.pos_lookup.get(&(tx, ty))?.iter().copied().find(|&i| {
            self.tiles[i]
                .as_ref()
                .is_some_and(|t| t.header.tlayer == tlayer)
        })
    }

    pub fn get_tile_at(&self, tx: i32, ty: i32, tlayer: i32) -> Option<CompressedTileRef> {
        self.find_tile_index(tx, ty, tlayer)
            .map(|i| CompressedTileRef::encode(self.tile_salts[i], i))
    }

    /// References of all layers stored in a tile column
    pub fn get_tiles_at(&self, tx: i32, ty: i32) -> Vec<CompressedTileRef> {
        self.pos_lookup
            .get(&(tx, ty))
            .map(|slots| {
                slots
                    .iter()
                    .map(|&i| CompressedTileRef::encode(self.tile_salts[i], i))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Iterates stored tiles with their references
    pub fn tiles(&self) -> impl Iterator<Item = (CompressedTileRef, &CompressedTile)> {
        self.tiles.iter().enumerate().filter_map(|(i, t)| {
            t.as_ref()
                .map(|t| (CompressedTileRef::encode(self.tile_salts[i], i), t))
        })
    }

    /// Stored tiles whose walkable bounds overlap a box
    pub fn query_tiles(&self, bmin: &[f32; 3], bmax: &[f32; 3]) -> Vec<CompressedTileRef> {
        let (tw, th) = self.params.tile_size();
        let origin = self.params.origin;
        let tx0 = ((bmin[0] - origin[0]) / tw).floor() as i32;
        let tx1 = ((bmax[0] - origin[0]) / tw).floor() as i32;
        let ty0 = ((bmin[2] - origin[2]) / th).floor() as i32;
        let ty1 = ((bmax[2] - origin[2]) / th).floor() as i32;

        let mut result = Vec::new();
        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                for tile_ref in self.get_tiles_at(tx, ty) {
                    let Some(tile) = self.tiles[tile_ref.index()].as_ref() else {
                        continue;
                    };
                    let Some((tmin, tmax)) = tile.header.tight_bounds(self.params.cs) else {
                        continue;
                    };
                    if overlap_bounds(bmin, bmax, &tmin, &tmax) {
                        result.push(tile_ref);
                    }
                }
            }
        }
        result
    }

    // Obstacles

    /// Adds an upright cylinder standing on `pos`
    pub fn add_obstacle(&mut self, pos: [f32; 3], radius: f32, height: f32) -> Result<ObstacleRef> {
        self.add_obstacle_shape(ObstacleShape::Cylinder {
            pos,
            radius,
            height,
        })
    }

    pub fn add_box_obstacle(&mut self, bmin: [f32; 3], bmax: [f32; 3]) -> Result<ObstacleRef> {
        self.add_obstacle_shape(ObstacleShape::Box { bmin, bmax })
    }

    /// Adds a box rotated by `y_radians` around the Y axis
    pub fn add_oriented_box_obstacle(
        &mut self,
        center: [f32; 3],
        half_extents: [f32; 3],
        y_radians: f32,
    ) -> Result<ObstacleRef> {
        self.add_obstacle_shape(ObstacleShape::oriented_box(center, half_extents, y_radians))
    }

    /// Registers an obstacle and requests a rebuild of the tiles it touches
    ///
    /// Fails with `TileCacheFull` when the obstacle registry or the request
    /// buffer is full.
    pub fn add_obstacle_shape(&mut self, shape: ObstacleShape) -> Result<ObstacleRef> {
        shape.validate()?;
        if self.requests.len() >= MAX_REQUESTS {
            return Err(Status::TileCacheFull.into());
        }
        let idx = self.free_obstacles.pop().ok_or(Status::TileCacheFull)?;

        let ob = &mut self.obstacles[idx];
        ob.shape = shape;
        ob.state = ObstacleState::Processing;
        ob.touched.clear();
        ob.pending.clear();
        let reference = ObstacleRef::encode(ob.salt, idx);

        self.requests.push(ObstacleRequest {
            action: RequestAction::Add,
            reference,
        });
        log::debug!("obstacle {:#x} added, processing", reference.id());
        Ok(reference)
    }

    /// Requests removal of an obstacle
    ///
    /// The obstacle stays carved until the touched tiles are rebuilt by
    /// [`Self::update`]; its reference is rejected once that is done.
    pub fn remove_obstacle(&mut self, reference: ObstacleRef) -> Result<()> {
        let idx = self.resolve_obstacle(reference)?;
        if self.obstacles[idx].state == ObstacleState::Removing {
            return Ok(());
        }
        if self.requests.len() >= MAX_REQUESTS {
            return Err(Status::TileCacheFull.into());
        }
        self.requests.push(ObstacleRequest {
            action: RequestAction::Remove,
            reference,
        });
        Ok(())
    }

    fn resolve_obstacle(&self, reference: ObstacleRef) -> Result<usize> {
        let idx = reference.index();
        let ob = self.obstacles.get(idx).ok_or(Status::OutOfRange)?;
        if ob.salt != reference.salt() || ob.state == ObstacleState::Empty {
            return Err(Status::StaleReference.into());
        }
        Ok(idx)
    }

    pub fn get_obstacle(&self, reference: ObstacleRef) -> Result<&Obstacle> {
        let idx = self.resolve_obstacle(reference)?;
        Ok(&self.obstacles[idx])
    }

    pub fn obstacle_state(&self, reference: ObstacleRef) -> Result<ObstacleState> {
        Ok(self.get_obstacle(reference)?.state)
    }

    pub fn get_obstacle_bounds(&self, reference: ObstacleRef) -> Result<([f32; 3], [f32; 3])> {
        Ok(self.get_obstacle(reference)?.shape.bounds())
    }

    /// Iterates live obstacles with their references
    pub fn obstacles(&self) -> impl Iterator<Item = (ObstacleRef, &Obstacle)> {
        self.obstacles
            .iter()
            .enumerate()
            .filter(|(_, ob)| ob.state != ObstacleState::Empty)
            .map(|(i, ob)| (ObstacleRef::encode(ob.salt, i), ob))
    }

    fn free_obstacle(&mut self, idx: usize) {
        let ob = &mut self.obstacles[idx];
        log::debug!(
            "obstacle {:#x} removed",
            ObstacleRef::encode(ob.salt, idx).id()
        );
        ob.state = ObstacleState::Empty;
        ob.salt = next_salt(ob.salt);
        ob.touched.clear();
        ob.pending.clear();
        self.free_obstacles.push(idx);
    }

    fn queue_rebuild(&mut self, tile_ref: CompressedTileRef) {
        if !self.update_queue.contains(&tile_ref) {
            self.update_queue.push_back(tile_ref);
        }
    }

    // Updates

    /// Processes obstacle requests, then rebuilds up to `max_tiles` tiles
    ///
    /// Returns the number of tiles taken off the rebuild queue. Requests are
    /// always processed in full, even with a zero tile budget.
    pub fn update(&mut self, max_tiles: usize, nav_mesh: &mut NavMesh) -> Result<usize> {
        self.process_requests();

        let mut processed = 0;
        while processed < max_tiles {
            let Some(tile_ref) = self.update_queue.pop_front() else {
                break;
            };
            processed += 1;
            let result = match self.build_nav_mesh_tile(tile_ref, nav_mesh) {
                Err(Error::InvalidReference(msg)) => {
                    log::warn!(
                        "dropping rebuild of compressed tile {:#x}: {msg}",
                        tile_ref.id()
                    );
                    Ok(())
                }
                other => other,
            };
            // Obstacle bookkeeping advances even when the rebuild failed
            self.finish_tile(tile_ref);
            result?;
        }
        Ok(processed)
    }

    fn process_requests(&mut self) {
        let requests = std::mem::take(&mut self.requests);
        for request in requests {
            let idx = match self.resolve_obstacle(request.reference) {
                Ok(idx) => idx,
                Err(e) => {
                    log::warn!(
                        "dropping request for obstacle {:#x}: {e}",
                        request.reference.id()
                    );
                    continue;
                }
            };

            match request.action {
                RequestAction::Add => {
                    let (bmin, bmax) = self.obstacles[idx].shape.bounds();
                    let touched = self.query_tiles(&bmin, &bmax);
                    for &tile_ref in &touched {
                        self.queue_rebuild(tile_ref);
                    }
                    let ob = &mut self.obstacles[idx];
                    ob.pending = touched.clone();
                    ob.touched = touched;
                    if ob.pending.is_empty() {
                        ob.state = ObstacleState::Processed;
                        log::debug!(
                            "obstacle {:#x} touches no tiles, processed",
                            request.reference.id()
                        );
                    }
                }
                RequestAction::Remove => {
                    let touched = self.obstacles[idx].touched.clone();
                    for &tile_ref in &touched {
                        self.queue_rebuild(tile_ref);
                    }
                    let ob = &mut self.obstacles[idx];
                    ob.state = ObstacleState::Removing;
                    ob.pending = touched;
                    if ob.pending.is_empty() {
                        self.free_obstacle(idx);
                    }
                }
            }
        }
    }

    /// Advances every obstacle waiting on `tile_ref`
    fn finish_tile(&mut self, tile_ref: CompressedTileRef) {
        let mut freed = Vec::new();
        for (idx, ob) in self.obstacles.iter_mut().enumerate() {
            if !matches!(
                ob.state,
                ObstacleState::Processing | ObstacleState::Removing
            ) {
                continue;
            }
            let before = ob.pending.len();
            ob.pending.retain(|&r| r != tile_ref);
            if before == 0 || !ob.pending.is_empty() {
                continue;
            }
            if ob.state == ObstacleState::Processing {
                ob.state = ObstacleState::Processed;
                log::debug!(
                    "obstacle {:#x} processed",
                    ObstacleRef::encode(ob.salt, idx).id()
                );
            } else {
                freed.push(idx);
            }
        }
        for idx in freed {
            self.free_obstacle(idx);
        }
    }

    /// Rebuilds the navigation mesh tile of a compressed tile
    ///
    /// The base layer is decompressed, every live obstacle overlapping it is
    /// carved in, and the result replaces the tile at the same location in
    /// `nav_mesh`. The new tile is fully built before the old one is removed,
    /// so a failed build leaves the mesh untouched. A layer with nothing
    /// walkable left only removes the old tile.
    pub fn build_nav_mesh_tile(
        &self,
        tile_ref: CompressedTileRef,
        nav_mesh: &mut NavMesh,
    ) -> Result<()> {
        let tile = self.get_tile_by_ref(tile_ref)?;
        let mut layer = decode_compressed_tile(&tile.data, self.compressor.as_ref())?;
        let (tx, ty, tlayer) = (layer.header.tx, layer.header.ty, layer.header.tlayer);

        let mut carved = 0;
        if let Some((tmin, tmax)) = layer.header.tight_bounds(self.params.cs) {
            for ob in &self.obstacles {
                if !matches!(
                    ob.state,
                    ObstacleState::Processing | ObstacleState::Processed
                ) {
                    continue;
                }
                let (bmin, bmax) = ob.shape.bounds();
                if overlap_bounds(&bmin, &bmax, &tmin, &tmax) {
                    carved += ob.shape.rasterize(&mut layer, self.params.cs, self.params.ch);
                }
            }
        }
        layer.build_connections(self.params.walkable_climb_cells(), self.params.ch);

        let new_tile = match self.mesh_builder.build(&layer, &self.params)? {
            Some(create) => {
                let built = NavMeshBuilder::build_tile(&create)?;
                let max_polys = nav_mesh.params().max_polys_per_tile;
                if built.polys.len() > max_polys {
                    return Err(Error::InvalidInput(format!(
                        "tile ({tx}, {ty}) has {} polygons, mesh allows {max_polys}",
                        built.polys.len()
                    )));
                }
                Some(built)
            }
            None => None,
        };

        if let Some(old) = nav_mesh.get_tile_ref_at(tx, ty, tlayer) {
            nav_mesh.remove_tile(old)?;
        }
        let poly_count = new_tile.as_ref().map_or(0, |t| t.polys.len());
        if let Some(new_tile) = new_tile {
            nav_mesh.add_tile(new_tile)?;
        }
        log::debug!(
            "rebuilt tile ({tx}, {ty}, {tlayer}): {poly_count} polygons, {carved} cells carved"
        );
        Ok(())
    }

    /// Rebuilds every layer stored in a tile column
    pub fn build_nav_mesh_tiles_at(&self, tx: i32, ty: i32, nav_mesh: &mut NavMesh) -> Result<()> {
        for tile_ref in self.get_tiles_at(tx, ty) {
            self.build_nav_mesh_tile(tile_ref, nav_mesh)?;
        }
        Ok(())
    }

    /// Builds every stored tile into `nav_mesh`, returns the tile count
    pub fn build_all_nav_mesh_tiles(&self, nav_mesh: &mut NavMesh) -> Result<usize> {
        let refs: Vec<_> = self.tiles().map(|(r, _)| r).collect();
        for &tile_ref in &refs {
            self.build_nav_mesh_tile(tile_ref, nav_mesh)?;
        }
        Ok(refs.len())
    }
}

/// Next salt of a slot; zero is never handed out
fn next_salt(salt: u16) -> u16 {
    match salt.wrapping_add(1) {
        0 => 1,
        s => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_layers::*;

    #[test]
    fn test_create_tile_cache() -> Result<()> {
        let cache = TileCache::new(test_params())?;
        assert_eq!(cache.tile_count(), 0);
        assert_eq!(cache.obstacle_count(), 0);
        assert!(cache.is_up_to_date());
        let mesh_params = cache.nav_mesh_params(256);
        assert_eq!(mesh_params.tile_width, 4.0);
        assert_eq!(mesh_params.max_tiles, 16);
        Ok(())
    }

    #[test]
    fn test_invalid_params() {
        let bad = [
            TileCacheParams {
                cs: 0.0,
                ..test_params()
            },
            TileCacheParams {
                width: 256,
                ..test_params()
            },
            TileCacheParams {
                max_tiles: 0,
                ..test_params()
            },
            TileCacheParams {
                max_obstacles: 0x10000,
                ..test_params()
            },
            TileCacheParams {
                origin: [f32::NAN, 0.0, 0.0],
                ..test_params()
            },
        ];
        for params in bad {
            assert!(matches!(
                TileCache::new(params),
                Err(Error::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn test_tile_slots() -> Result<()> {
        let params = TileCacheParams {
            max_tiles: 2,
            ..test_params()
        };
        let mut cache = TileCache::new(params.clone())?;
        let a = cache.add_tile(cache.compress_layer(&flat_layer(0, 0, &params, &[])?)?)?;
        let b = cache.add_tile(cache.compress_layer(&flat_layer(1, 0, &params, &[])?)?)?;
        assert_ne!(a, b);
        assert_eq!(cache.get_tiles_at(1, 0), vec![b]);
        assert_eq!(cache.get_tile_at(0, 0, 0), Some(a));

        let third = cache.compress_layer(&flat_layer(2, 0, &params, &[])?)?;
        assert!(matches!(
            cache.add_tile(third.clone()),
            Err(Error::OutOfResources(_))
        ));

        let duplicate = cache.compress_layer(&flat_layer(0, 0, &params, &[])?)?;
        match cache.add_tile(duplicate) {
            Err(Error::InvalidInput(msg)) => assert_eq!(msg, Status::AlreadyExists.to_string()),
            other => panic!("unexpected result {other:?}"),
        }

        // Removing bumps the salt; the old reference is rejected
        let data = cache.remove_tile(a)?;
        assert_eq!(read_layer_header(&data)?.tx, 0);
        assert!(matches!(
            cache.get_tile_by_ref(a),
            Err(Error::InvalidReference(_))
        ));
        assert!(matches!(
            cache.remove_tile(a),
            Err(Error::InvalidReference(_))
        ));
        let c = cache.add_tile(third)?;
        assert_eq!(c.index(), a.index());
        assert_ne!(c.salt(), a.salt());
        Ok(())
    }

    #[test]
    fn test_rejects_foreign_grid_size() -> Result<()> {
        let params = test_params();
        let mut cache = TileCache::new(params.clone())?;
        let other = TileCacheParams {
            width: 4,
            height: 4,
            ..params
        };
        let data = encode_compressed_tile(&flat_layer(0, 0, &other, &[])?, &Lz4Compressor)?;
        assert!(matches!(cache.add_tile(data), Err(Error::InvalidInput(_))));
        Ok(())
    }

    #[test]
    fn test_obstacle_management() -> Result<()> {
        let params = TileCacheParams {
            max_obstacles: 2,
            ..test_params()
        };
        let mut cache = TileCache::new(params)?;
        let a = cache.add_obstacle([1.0, 0.0, 1.0], 0.5, 2.0)?;
        let b = cache.add_box_obstacle([2.0, 0.0, 2.0], [3.0, 1.0, 3.0])?;
        assert_eq!(cache.obstacle_count(), 2);
        assert_eq!(cache.obstacle_state(a)?, ObstacleState::Processing);
        assert_eq!(cache.get_obstacle_bounds(b)?, ([2.0, 0.0, 2.0], [3.0, 1.0, 3.0]));
        assert!(!cache.is_up_to_date());

        assert!(matches!(
            cache.add_oriented_box_obstacle([0.0; 3], [1.0; 3], 0.5),
            Err(Error::OutOfResources(_))
        ));
        assert!(matches!(
            cache.add_obstacle([0.0; 3], -1.0, 1.0),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            cache.remove_obstacle(ObstacleRef::encode(9, a.index())),
            Err(Error::InvalidReference(_))
        ));
        Ok(())
    }

    #[test]
    fn test_next_salt_skips_zero() {
        assert_eq!(next_salt(1), 2);
        assert_eq!(next_salt(u16::MAX), 1);
    }
}
