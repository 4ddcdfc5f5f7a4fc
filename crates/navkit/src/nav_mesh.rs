//! Navigation mesh store
//!
//! The mesh owns a fixed number of tile slots. Each resident tile is a
//! self-contained slab of polygons with its own link arena; links between
//! tiles are plain [`PolyRef`]s resolved through the mesh, so adjacency never
//! forms ownership cycles. Every slot carries a salt that is bumped when its
//! tile is removed, which invalidates all references handed out for it.

use std::collections::HashMap;

use navkit_common::{
    closest_height_point_triangle, dist_point_segment_sqr_2d, point_in_polygon_2d, vdist_sqr,
    vis_finite, vlerp, vsub, Error, Result,
};

use super::bv_tree::{BVNode, BVQueryIter};
use super::{
    NavMeshParams, PolyFlags, PolyRef, PolyType, QueryFilter, Status, TileRef, EXT_LINK,
    LINK_INTERNAL, MAX_VERTS_PER_POLY, OFFMESH_CON_BIDIR,
};

/// Number of bits for the polygon index in a reference
pub const POLY_BITS: u32 = 16;
/// Number of bits for the tile slot index in a reference
pub const TILE_BITS: u32 = 10;
/// Number of bits for the salt in a reference
pub const SALT_BITS: u32 = 6;

const POLY_MASK: u32 = (1 << POLY_BITS) - 1;
const TILE_MASK: u32 = (1 << TILE_BITS) - 1;
const SALT_MASK: u32 = (1 << SALT_BITS) - 1;

/// Packs salt, tile slot and polygon index into a reference
#[inline]
pub fn encode_poly_ref(salt: u32, tile_index: u32, poly_index: u32) -> PolyRef {
    PolyRef::new(
        ((salt & SALT_MASK) << (POLY_BITS + TILE_BITS))
            | ((tile_index & TILE_MASK) << POLY_BITS)
            | (poly_index & POLY_MASK),
    )
}

/// Unpacks a reference into `(salt, tile_index, poly_index)`
#[inline]
pub fn decode_poly_ref(reference: PolyRef) -> (u32, u32, u32) {
    let id = reference.id();
    (
        (id >> (POLY_BITS + TILE_BITS)) & SALT_MASK,
        (id >> POLY_BITS) & TILE_MASK,
        id & POLY_MASK,
    )
}

#[inline]
pub fn decode_poly_ref_tile(reference: PolyRef) -> u32 {
    (reference.id() >> POLY_BITS) & TILE_MASK
}

#[inline]
pub fn decode_poly_ref_poly(reference: PolyRef) -> u32 {
    reference.id() & POLY_MASK
}

/// Side on the neighbor tile facing `side`
#[inline]
pub fn opposite_tile(side: u8) -> u8 {
    (side + 4) & 7
}

/// A directed link from one polygon to another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Link {
    /// Neighbor polygon
    pub reference: PolyRef,
    /// Next link of the same polygon
    pub next: Option<usize>,
    /// Edge of the owning polygon this link crosses
    pub edge: u8,
    /// Tile side for portal links, [`LINK_INTERNAL`] otherwise
    pub side: u8,
    /// Start of the shared portion of the edge, 0..=255
    pub bmin: u8,
    /// End of the shared portion of the edge, 0..=255
    pub bmax: u8,
}

impl Link {
    pub fn new(reference: PolyRef, edge: u8, side: u8) -> Self {
        Self {
            reference,
            next: None,
            edge,
            side,
            bmin: 0,
            bmax: 255,
        }
    }

    /// Whether the link covers only part of its edge
    pub fn is_partial(&self) -> bool {
        self.side != LINK_INTERNAL && (self.bmin != 0 || self.bmax != 255)
    }
}

/// A convex navigation polygon
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Poly {
    /// Head of the polygon's link list
    pub first_link: Option<usize>,
    /// Vertex indices into the tile's vertex array
    pub verts: [u16; MAX_VERTS_PER_POLY],
    /// Per edge: 0 = wall, `n + 1` = internal neighbor `n`, `EXT_LINK | side` = portal
    pub neighbors: [u16; MAX_VERTS_PER_POLY],
    pub flags: PolyFlags,
    pub vert_count: u8,
    pub area: u8,
    pub poly_type: PolyType,
}

impl Poly {
    pub fn new(area: u8, poly_type: PolyType, flags: PolyFlags) -> Self {
        Self {
            first_link: None,
            verts: [0; MAX_VERTS_PER_POLY],
            neighbors: [0; MAX_VERTS_PER_POLY],
            flags,
            vert_count: 0,
            area,
            poly_type,
        }
    }
}

/// Range of the detail mesh belonging to one polygon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PolyDetail {
    pub vert_base: u32,
    pub tri_base: u32,
    pub vert_count: u8,
    pub tri_count: u8,
}

/// A shortcut between two points that are not connected by polygons
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct OffMeshConnection {
    /// Start and end point
    pub pos: [f32; 6],
    /// Snap radius at both endpoints
    pub radius: f32,
    /// Index of the connection's polygon in the tile
    pub poly: u16,
    /// [`OFFMESH_CON_BIDIR`] or 0
    pub flags: u8,
    /// Tile side the end point lies on, [`LINK_INTERNAL`] when inside the tile
    pub side: u8,
    pub user_id: u32,
}

impl OffMeshConnection {
    pub fn start(&self) -> [f32; 3] {
        [self.pos[0], self.pos[1], self.pos[2]]
    }

    pub fn end(&self) -> [f32; 3] {
        [self.pos[3], self.pos[4], self.pos[5]]
    }
}

/// Fixed tile header
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct TileHeader {
    pub x: i32,
    pub y: i32,
    pub layer: i32,
    pub user_id: u32,
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub bv_quant_factor: f32,
}

/// A tile of navigation polygons
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct MeshTile {
    /// Salt of the slot the tile lives in; 0 while not resident
    pub salt: u32,
    pub header: TileHeader,
    pub polys: Vec<Poly>,
    /// World-space vertex positions, three floats per vertex
    pub verts: Vec<f32>,
    pub links: Vec<Link>,
    /// Head of the free list threaded through `links`
    pub links_free: Option<usize>,
    pub detail_meshes: Vec<PolyDetail>,
    /// Extra detail vertices, three floats per vertex
    pub detail_verts: Vec<f32>,
    /// Detail triangles: three vertex indices and an edge flag byte
    pub detail_tris: Vec<u8>,
    pub bv_tree: Vec<BVNode>,
    pub off_mesh_connections: Vec<OffMeshConnection>,
}

impl MeshTile {
    /// Position of vertex `i`
    #[inline]
    pub fn vertex(&self, i: usize) -> [f32; 3] {
        let b = i * 3;
        match self.verts.get(b..b + 3) {
            Some(v) => [v[0], v[1], v[2]],
            None => [0.0; 3],
        }
    }

    fn set_vertex(&mut self, i: usize, pos: &[f32; 3]) {
        let b = i * 3;
        if let Some(v) = self.verts.get_mut(b..b + 3) {
            v.copy_from_slice(pos);
        }
    }

    /// World positions of a polygon's vertices
    pub fn poly_vertices(&self, poly: &Poly) -> ([[f32; 3]; MAX_VERTS_PER_POLY], usize) {
        let mut verts = [[0.0; 3]; MAX_VERTS_PER_POLY];
        let n = (poly.vert_count as usize).min(MAX_VERTS_PER_POLY);
        for (j, v) in verts.iter_mut().enumerate().take(n) {
            *v = self.vertex(poly.verts[j] as usize);
        }
        (verts, n)
    }

    /// World-space bounds of a polygon
    pub fn poly_bounds(&self, poly: &Poly) -> ([f32; 3], [f32; 3]) {
        let (verts, n) = self.poly_vertices(poly);
        let mut bmin = [f32::MAX; 3];
        let mut bmax = [f32::MIN; 3];
        for v in &verts[..n] {
            for k in 0..3 {
                bmin[k] = bmin[k].min(v[k]);
                bmax[k] = bmax[k].max(v[k]);
            }
        }
        (bmin, bmax)
    }

    /// Iterates the links of a polygon
    pub fn poly_links<'a>(&'a self, poly: &Poly) -> LinkIter<'a> {
        LinkIter {
            links: &self.links,
            cur: poly.first_link,
        }
    }

    fn detail_vertex(&self, poly: &Poly, pd: &PolyDetail, idx: u8) -> [f32; 3] {
        if idx < poly.vert_count {
            self.vertex(poly.verts[idx as usize] as usize)
        } else {
            let i = (pd.vert_base as usize + (idx - poly.vert_count) as usize) * 3;
            match self.detail_verts.get(i..i + 3) {
                Some(v) => [v[0], v[1], v[2]],
                None => [0.0; 3],
            }
        }
    }

    /// Iterates the detail triangles of polygon `ip` as world positions
    fn detail_triangles(&self, ip: usize) -> impl Iterator<Item = [[f32; 3]; 3]> + '_ {
        let poly = &self.polys[ip];
        let pd = self.detail_meshes.get(ip).copied().unwrap_or_default();
        (0..pd.tri_count as usize).filter_map(move |j| {
            let t = (pd.tri_base as usize + j) * 4;
            let tri = self.detail_tris.get(t..t + 3)?;
            Some([
                self.detail_vertex(poly, &pd, tri[0]),
                self.detail_vertex(poly, &pd, tri[1]),
                self.detail_vertex(poly, &pd, tri[2]),
            ])
        })
    }

    fn alloc_link(&mut self, link: Link) -> usize {
        match self.links_free {
            Some(idx) => {
                self.links_free = self.links[idx].next;
                self.links[idx] = link;
                idx
            }
            None => {
                self.links.push(link);
                self.links.len() - 1
            }
        }
    }

    /// Prepends a link to a polygon's list
    fn add_link(&mut self, poly: usize, mut link: Link) {
        link.next = self.polys[poly].first_link;
        let idx = self.alloc_link(link);
        self.polys[poly].first_link = Some(idx);
    }

    /// Removes every link pointing into tile slot `target`
    fn unconnect_links(&mut self, target: u32) -> usize {
        let mut removed = 0;
        for ip in 0..self.polys.len() {
            let mut prev: Option<usize> = None;
            let mut cur = self.polys[ip].first_link;
            while let Some(idx) = cur {
                let next = self.links[idx].next;
                if decode_poly_ref_tile(self.links[idx].reference) == target {
                    match prev {
                        Some(p) => self.links[p].next = next,
                        None => self.polys[ip].first_link = next,
                    }
                    self.links[idx].next = self.links_free;
                    self.links_free = Some(idx);
                    removed += 1;
                } else {
                    prev = Some(idx);
                }
                cur = next;
            }
        }
        removed
    }
}

/// Iterator over a polygon's link list
pub struct LinkIter<'a> {
    links: &'a [Link],
    cur: Option<usize>,
}

impl<'a> Iterator for LinkIter<'a> {
    type Item = &'a Link;

    fn next(&mut self) -> Option<&'a Link> {
        let link = self.links.get(self.cur?)?;
        self.cur = link.next;
        Some(link)
    }
}

/// Lazy iterator over the ground polygons of one tile overlapping a box
pub enum TilePolyIter<'a> {
    Tree(BVQueryIter<'a>),
    Linear {
        tile: &'a MeshTile,
        next: usize,
        bmin: [f32; 3],
        bmax: [f32; 3],
    },
}

impl Iterator for TilePolyIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self {
            TilePolyIter::Tree(it) => it.next(),
            TilePolyIter::Linear {
                tile,
                next,
                bmin,
                bmax,
            } => {
                while *next < tile.polys.len() {
                    let ip = *next;
                    *next += 1;
                    let poly = &tile.polys[ip];
                    if poly.poly_type == PolyType::OffMeshConnection {
                        continue;
                    }
                    let (pmin, pmax) = tile.poly_bounds(poly);
                    if navkit_common::overlap_bounds(bmin, bmax, &pmin, &pmax) {
                        return Some(ip);
                    }
                }
                None
            }
        }
    }
}

/// Pending link produced while connecting tiles
struct PendingLink {
    poly: usize,
    link: Link,
}

/// Navigation mesh made of tiles
#[derive(Debug)]
pub struct NavMesh {
    params: NavMeshParams,
    tiles: Vec<Option<MeshTile>>,
    salts: Vec<u32>,
    free_slots: Vec<usize>,
    /// Tile slots per (x, y) column
    pos_lookup: HashMap<(i32, i32), Vec<usize>>,
}

impl NavMesh {
    /// Creates an empty navigation mesh
    pub fn new(params: NavMeshParams) -> Result<Self> {
        if !vis_finite(&params.origin) {
            return Err(Error::InvalidInput("origin must be finite".into()));
        }
        if !(params.tile_width.is_finite() && params.tile_width > 0.0)
            || !(params.tile_height.is_finite() && params.tile_height > 0.0)
        {
            return Err(Error::InvalidInput("tile size must be positive".into()));
        }
        if params.max_tiles == 0 || params.max_tiles > (1 << TILE_BITS) {
            return Err(Error::InvalidInput(format!(
                "max_tiles must be in 1..={}",
                1 << TILE_BITS
            )));
        }
        if params.max_polys_per_tile == 0 || params.max_polys_per_tile > (1 << POLY_BITS) {
            return Err(Error::InvalidInput(format!(
                "max_polys_per_tile must be in 1..={}",
                1 << POLY_BITS
            )));
        }

        let max_tiles = params.max_tiles;
        Ok(Self {
            params,
            tiles: vec![None; max_tiles],
            salts: vec![1; max_tiles],
            free_slots: (0..max_tiles).rev().collect(),
            pos_lookup: HashMap::new(),
        })
    }

    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    pub fn max_tiles(&self) -> usize {
        self.params.max_tiles
    }

    /// Number of resident tiles
    pub fn tile_count(&self) -> usize {
        self.params.max_tiles - self.free_slots.len()
    }

    /// Grid location of the tile containing `pos`
    pub fn calc_tile_loc(&self, pos: &[f32; 3]) -> (i32, i32) {
        let tx = ((pos[0] - self.params.origin[0]) / self.params.tile_width).floor() as i32;
        let ty = ((pos[2] - self.params.origin[2]) / self.params.tile_height).floor() as i32;
        (tx, ty)
    }

    /// Adds a built tile and connects it to its resident neighbors
    ///
    /// Returns the reference of the new tile. The tile's position comes from
    /// its header; a tile already resident at that position fails with
    /// `AlreadyExists`.
    pub fn add_tile(&mut self, mut tile: MeshTile) -> Result<TileRef> {
        let (x, y, layer) = (tile.header.x, tile.header.y, tile.header.layer);
        if self.get_tile_at(x, y, layer).is_some() {
            return Err(Status::AlreadyExists.into());
        }
        if tile.polys.len() > self.params.max_polys_per_tile {
            return Err(Error::InvalidInput(format!(
                "tile has {} polygons, limit is {}",
                tile.polys.len(),
                self.params.max_polys_per_tile
            )));
        }
        let idx = self.free_slots.pop().ok_or(Status::OutOfTiles)?;

        tile.salt = self.salts[idx];
        tile.links.clear();
        tile.links_free = None;
        for poly in &mut tile.polys {
            poly.first_link = None;
        }

        self.tiles[idx] = Some(tile);
        self.pos_lookup.entry((x, y)).or_default().push(idx);

        self.connect_int_links(idx);
        self.base_off_mesh_links(idx);
        self.connect_ext_off_mesh_links(idx, idx, None);

        // Other layers in the same column
        for nei in self.tile_indices_at(x, y) {
            if nei != idx {
                self.connect_ext_off_mesh_links(idx, nei, None);
                self.connect_ext_off_mesh_links(nei, idx, None);
            }
        }

        for side in 0..8u8 {
            let (nx, ny) = neighbour_loc(x, y, side);
            for nei in self.tile_indices_at(nx, ny) {
                self.connect_ext_links(idx, nei, Some(side));
                self.connect_ext_links(nei, idx, Some(opposite_tile(side)));
                self.connect_ext_off_mesh_links(idx, nei, Some(side));
                self.connect_ext_off_mesh_links(nei, idx, Some(opposite_tile(side)));
            }
        }

        let tile_ref = self.poly_ref_base(idx);
        log::debug!("added tile ({x}, {y}, {layer}) as {tile_ref} in slot {idx}");
        Ok(tile_ref)
    }

    /// Removes a tile, severing every link into it, and returns it
    ///
    /// The slot's salt is bumped so references into the removed tile no
    /// longer resolve.
    pub fn remove_tile(&mut self, tile_ref: TileRef) -> Result<MeshTile> {
        let idx = self.resolve_tile_ref(tile_ref)?;
        let (x, y) = match &self.tiles[idx] {
            Some(tile) => (tile.header.x, tile.header.y),
            None => return Err(Status::StaleReference.into()),
        };

        let mut neighbours = self.tile_indices_at(x, y);
        for side in 0..8u8 {
            let (nx, ny) = neighbour_loc(x, y, side);
            neighbours.extend(self.tile_indices_at(nx, ny));
        }
        let mut severed = 0;
        for nei in neighbours {
            if nei == idx {
                continue;
            }
            if let Some(tile) = self.tiles[nei].as_mut() {
                severed += tile.unconnect_links(idx as u32);
            }
        }

        if let Some(slots) = self.pos_lookup.get_mut(&(x, y)) {
            slots.retain(|&s| s != idx);
            if slots.is_empty() {
                self.pos_lookup.remove(&(x, y));
            }
        }

        let mut tile = self.tiles[idx]
            .take()
            .ok_or(Status::StaleReference)?;

        let mut salt = (self.salts[idx] + 1) & SALT_MASK;
        if salt == 0 {
            salt = 1;
        }
        self.salts[idx] = salt;
        self.free_slots.push(idx);

        tile.salt = 0;
        tile.links.clear();
        tile.links_free = None;
        for poly in &mut tile.polys {
            poly.first_link = None;
        }

        log::debug!(
            "removed tile ({}, {}, {}) from slot {idx}, severed {severed} neighbor links",
            tile.header.x,
            tile.header.y,
            tile.header.layer
        );
        Ok(tile)
    }

    /// Adds a tile into the exact slot and salt encoded in `tile_ref`
    ///
    /// Used when restoring a saved mesh so previously stored references stay
    /// valid.
    pub fn restore_tile(&mut self, tile: MeshTile, tile_ref: TileRef) -> Result<TileRef> {
        let (salt, idx, _) = decode_poly_ref(tile_ref);
        let idx = idx as usize;
        if idx >= self.params.max_tiles || salt == 0 {
            return Err(Status::OutOfRange.into());
        }
        let pos = self
            .free_slots
            .iter()
            .position(|&s| s == idx)
            .ok_or(Status::AlreadyExists)?;
        // Move the requested slot to the top of the free stack
        let slot = self.free_slots.remove(pos);
        self.free_slots.push(slot);
        let prev_salt = self.salts[idx];
        self.salts[idx] = salt;

        match self.add_tile(tile) {
            Ok(r) => Ok(r),
            Err(e) => {
                self.salts[idx] = prev_salt;
                Err(e)
            }
        }
    }

    /// Tile at a grid location and layer
    pub fn get_tile_at(&self, x: i32, y: i32, layer: i32) -> Option<&MeshTile> {
        self.pos_lookup.get(&(x, y))?.iter().find_map(|&i| {
            self.tiles[i]
                .as_ref()
                .filter(|t| t.header.layer == layer)
        })
    }

    /// All tiles in a grid column
    pub fn get_tiles_at(&self, x: i32, y: i32) -> Vec<&MeshTile> {
        self.tile_indices_at(x, y)
            .into_iter()
            .filter_map(|i| self.tiles[i].as_ref())
            .collect()
    }

    fn tile_indices_at(&self, x: i32, y: i32) -> Vec<usize> {
        self.pos_lookup.get(&(x, y)).cloned().unwrap_or_default()
    }

    /// Reference of the tile at a grid location and layer
    pub fn get_tile_ref_at(&self, x: i32, y: i32, layer: i32) -> Option<TileRef> {
        let idx = *self.pos_lookup.get(&(x, y))?.iter().find(|&&i| {
            self.tiles[i]
                .as_ref()
                .is_some_and(|t| t.header.layer == layer)
        })?;
        Some(self.poly_ref_base(idx))
    }

    /// Tile by slot index
    pub fn get_tile(&self, index: usize) -> Option<&MeshTile> {
        self.tiles.get(index)?.as_ref()
    }

    /// Iterates resident tiles with their slot index
    pub fn tiles(&self) -> impl Iterator<Item = (usize, &MeshTile)> {
        self.tiles
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (i, t)))
    }

    /// Reference of polygon 0 in the tile at `index`
    pub fn poly_ref_base(&self, index: usize) -> PolyRef {
        encode_poly_ref(self.salts[index], index as u32, 0)
    }

    fn resolve_tile_ref(&self, tile_ref: TileRef) -> Result<usize> {
        if !tile_ref.is_valid() {
            return Err(Status::OutOfRange.into());
        }
        let (salt, idx, _) = decode_poly_ref(tile_ref);
        let idx = idx as usize;
        if idx >= self.params.max_tiles {
            return Err(Status::OutOfRange.into());
        }
        if self.salts[idx] != salt || self.tiles[idx].is_none() {
            return Err(Status::StaleReference.into());
        }
        Ok(idx)
    }

    /// Resolves a polygon reference to its tile and polygon
    pub fn get_tile_and_poly_by_ref(&self, reference: PolyRef) -> Result<(&MeshTile, &Poly)> {
        let idx = self.resolve_tile_ref(reference)?;
        let tile = self.tiles[idx].as_ref().ok_or(Status::StaleReference)?;
        let ip = decode_poly_ref_poly(reference) as usize;
        let poly = tile.polys.get(ip).ok_or(Status::OutOfRange)?;
        Ok((tile, poly))
    }

    /// Resolves a polygon reference
    pub fn get_poly(&self, reference: PolyRef) -> Result<&Poly> {
        self.get_tile_and_poly_by_ref(reference).map(|(_, p)| p)
    }

    /// Checks whether a reference resolves to a live polygon
    pub fn is_valid_poly_ref(&self, reference: PolyRef) -> bool {
        self.get_tile_and_poly_by_ref(reference).is_ok()
    }

    pub fn get_poly_flags(&self, reference: PolyRef) -> Result<PolyFlags> {
        Ok(self.get_poly(reference)?.flags)
    }

    pub fn set_poly_flags(&mut self, reference: PolyRef, flags: PolyFlags) -> Result<()> {
        self.poly_mut(reference)?.flags = flags;
        Ok(())
    }

    pub fn get_poly_area(&self, reference: PolyRef) -> Result<u8> {
        Ok(self.get_poly(reference)?.area)
    }

    pub fn set_poly_area(&mut self, reference: PolyRef, area: u8) -> Result<()> {
        self.poly_mut(reference)?.area = area;
        Ok(())
    }

    fn poly_mut(&mut self, reference: PolyRef) -> Result<&mut Poly> {
        let idx = self.resolve_tile_ref(reference)?;
        let ip = decode_poly_ref_poly(reference) as usize;
        self.tiles[idx]
            .as_mut()
            .and_then(|t| t.polys.get_mut(ip))
            .ok_or_else(|| Status::OutOfRange.into())
    }

    /// Lazily iterates ground polygons of a tile overlapping a box
    pub fn tile_polys_in_bounds<'a>(
        &self,
        tile: &'a MeshTile,
        qmin: &[f32; 3],
        qmax: &[f32; 3],
    ) -> TilePolyIter<'a> {
        if tile.bv_tree.is_empty() {
            TilePolyIter::Linear {
                tile,
                next: 0,
                bmin: *qmin,
                bmax: *qmax,
            }
        } else {
            TilePolyIter::Tree(BVQueryIter::new(
                &tile.bv_tree,
                &tile.header.bmin,
                &tile.header.bmax,
                tile.header.bv_quant_factor,
                qmin,
                qmax,
            ))
        }
    }

    /// Polygons passing `filter` whose bounds overlap the query box
    pub fn query_polygons(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &QueryFilter,
    ) -> Result<Vec<PolyRef>> {
        validate_query_box(center, half_extents)?;
        let qmin = vsub(center, half_extents);
        let qmax = navkit_common::vadd(center, half_extents);
        let (minx, miny) = self.calc_tile_loc(&qmin);
        let (maxx, maxy) = self.calc_tile_loc(&qmax);

        let mut result = Vec::new();
        for y in miny..=maxy {
            for x in minx..=maxx {
                for idx in self.tile_indices_at(x, y) {
                    let Some(tile) = self.tiles[idx].as_ref() else {
                        continue;
                    };
                    let base = encode_poly_ref(tile.salt, idx as u32, 0).id();
                    for ip in self.tile_polys_in_bounds(tile, &qmin, &qmax) {
                        if filter.pass_filter(&tile.polys[ip]) {
                            result.push(PolyRef::new(base | ip as u32));
                        }
                    }
                }
            }
        }
        Ok(result)
    }

    /// Finds the polygon nearest to `center` within the query box
    ///
    /// Returns the polygon and the closest point on it, or `None` if no
    /// polygon overlaps the box.
    pub fn find_nearest_poly(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &QueryFilter,
    ) -> Result<Option<(PolyRef, [f32; 3])>> {
        let mut nearest: Option<(PolyRef, [f32; 3])> = None;
        let mut nearest_dist = f32::MAX;
        for reference in self.query_polygons(center, half_extents, filter)? {
            let (tile, _) = self.get_tile_and_poly_by_ref(reference)?;
            let (closest, over) = self.closest_point_on_poly(reference, center)?;
            let d = nearest_distance(center, &closest, over, tile.header.walkable_climb);
            if d < nearest_dist {
                nearest_dist = d;
                nearest = Some((reference, closest));
            }
        }
        Ok(nearest)
    }

    /// Nearest ground polygon of one tile, ignoring filters
    fn find_nearest_poly_in_tile(
        &self,
        idx: usize,
        center: &[f32; 3],
        half_extents: &[f32; 3],
    ) -> Option<(usize, [f32; 3])> {
        let tile = self.tiles[idx].as_ref()?;
        let qmin = vsub(center, half_extents);
        let qmax = navkit_common::vadd(center, half_extents);
        let mut best = None;
        let mut best_dist = f32::MAX;
        for ip in self.tile_polys_in_bounds(tile, &qmin, &qmax) {
            let (closest, over) = closest_point_on_tile_poly(tile, ip, center);
            let d = nearest_distance(center, &closest, over, tile.header.walkable_climb);
            if d < best_dist {
                best_dist = d;
                best = Some((ip, closest));
            }
        }
        best
    }

    /// Height of a polygon's detail surface below or above `pos`
    ///
    /// Fails with `PointOutsidePolygon` if `pos` does not project onto the
    /// polygon on the XZ plane. The footprint test is half-open: a point on
    /// an edge facing +x or +z belongs to the polygon on the other side.
    pub fn get_poly_height(&self, reference: PolyRef, pos: &[f32; 3]) -> Result<f32> {
        if !vis_finite(pos) {
            return Err(Status::InvalidParam.into());
        }
        let (tile, _) = self.get_tile_and_poly_by_ref(reference)?;
        let ip = decode_poly_ref_poly(reference) as usize;
        tile_poly_height(tile, ip, pos).ok_or_else(|| Status::PointOutsidePolygon.into())
    }

    /// Closest point on a polygon to `pos`
    ///
    /// The flag tells whether `pos` lies over the polygon, in which case the
    /// point is `pos` moved onto the detail surface.
    pub fn closest_point_on_poly(
        &self,
        reference: PolyRef,
        pos: &[f32; 3],
    ) -> Result<([f32; 3], bool)> {
        if !vis_finite(pos) {
            return Err(Status::InvalidParam.into());
        }
        let (tile, _) = self.get_tile_and_poly_by_ref(reference)?;
        let ip = decode_poly_ref_poly(reference) as usize;
        Ok(closest_point_on_tile_poly(tile, ip, pos))
    }

    /// Closest point on a polygon's boundary, or `pos` itself if inside
    ///
    /// Works on the polygon outline only and keeps the height of `pos` for
    /// interior points.
    pub fn closest_point_on_poly_boundary(
        &self,
        reference: PolyRef,
        pos: &[f32; 3],
    ) -> Result<[f32; 3]> {
        if !vis_finite(pos) {
            return Err(Status::InvalidParam.into());
        }
        let (tile, poly) = self.get_tile_and_poly_by_ref(reference)?;
        let (verts, n) = tile.poly_vertices(poly);
        let verts = &verts[..n];
        if n >= 3 && point_in_polygon_2d(pos, verts) {
            return Ok(*pos);
        }
        Ok(closest_point_on_outline(verts, pos))
    }

    /// Finds the link from one polygon to another
    pub fn find_link(&self, from: PolyRef, to: PolyRef) -> Result<Option<&Link>> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(from)?;
        Ok(tile.poly_links(poly).find(|l| l.reference == to))
    }

    /// Portal segment between two adjacent polygons
    ///
    /// Returns the left and right portal points as seen when moving from
    /// `from` to `to`, plus both polygon types. Off-mesh connections collapse
    /// the portal to their endpoint.
    pub fn get_portal_points(
        &self,
        from: PolyRef,
        to: PolyRef,
    ) -> Result<([f32; 3], [f32; 3], PolyType, PolyType)> {
        let (from_tile, from_poly) = self.get_tile_and_poly_by_ref(from)?;
        let (to_tile, to_poly) = self.get_tile_and_poly_by_ref(to)?;

        let link = from_tile
            .poly_links(from_poly)
            .find(|l| l.reference == to)
            .ok_or(Status::InvalidParam)?;

        if from_poly.poly_type == PolyType::OffMeshConnection {
            let v = from_tile.vertex(from_poly.verts[link.edge as usize % 2] as usize);
            return Ok((v, v, from_poly.poly_type, to_poly.poly_type));
        }

        if to_poly.poly_type == PolyType::OffMeshConnection {
            let back = to_tile
                .poly_links(to_poly)
                .find(|l| l.reference == from)
                .ok_or(Status::InvalidParam)?;
            let v = to_tile.vertex(to_poly.verts[back.edge as usize % 2] as usize);
            return Ok((v, v, from_poly.poly_type, to_poly.poly_type));
        }

        let n = from_poly.vert_count as usize;
        let e = link.edge as usize;
        let v0 = from_tile.vertex(from_poly.verts[e] as usize);
        let v1 = from_tile.vertex(from_poly.verts[(e + 1) % n] as usize);

        if link.is_partial() {
            let s = 1.0 / 255.0;
            let left = vlerp(&v0, &v1, link.bmin as f32 * s);
            let right = vlerp(&v0, &v1, link.bmax as f32 * s);
            return Ok((left, right, from_poly.poly_type, to_poly.poly_type));
        }
        Ok((v0, v1, from_poly.poly_type, to_poly.poly_type))
    }

    /// Midpoint of the portal between two adjacent polygons
    pub fn get_edge_mid_point(&self, from: PolyRef, to: PolyRef) -> Result<[f32; 3]> {
        let (left, right, _, _) = self.get_portal_points(from, to)?;
        Ok(vlerp(&left, &right, 0.5))
    }

    fn connect_int_links(&mut self, idx: usize) {
        let Some(tile) = self.tiles[idx].as_mut() else {
            return;
        };
        let base = encode_poly_ref(tile.salt, idx as u32, 0).id();
        for ip in 0..tile.polys.len() {
            if tile.polys[ip].poly_type == PolyType::OffMeshConnection {
                continue;
            }
            // Walk edges backwards so the prepended list ends up in edge order
            for j in (0..tile.polys[ip].vert_count as usize).rev() {
                let nei = tile.polys[ip].neighbors[j];
                if nei == 0 || nei & EXT_LINK != 0 {
                    continue;
                }
                let link = Link {
                    bmin: 0,
                    bmax: 0,
                    ..Link::new(PolyRef::new(base | (nei as u32 - 1)), j as u8, LINK_INTERNAL)
                };
                tile.add_link(ip, link);
            }
        }
    }

    /// Links the start of each off-mesh connection to its landing polygon
    fn base_off_mesh_links(&mut self, idx: usize) {
        let Some(tile) = self.tiles[idx].as_ref() else {
            return;
        };
        let base = encode_poly_ref(tile.salt, idx as u32, 0).id();
        let climb = tile.header.walkable_climb;

        let mut pending = Vec::new();
        let mut snaps = Vec::new();
        for con in &tile.off_mesh_connections {
            let ext = [con.radius, climb, con.radius];
            let p = con.start();
            let Some((land, nearest)) = self.find_nearest_poly_in_tile(idx, &p, &ext) else {
                continue;
            };
            let dx = nearest[0] - p[0];
            let dz = nearest[2] - p[2];
            if dx * dx + dz * dz > con.radius * con.radius {
                continue;
            }
            let con_poly = con.poly as usize;
            snaps.push((tile.polys[con_poly].verts[0] as usize, nearest));
            pending.push(PendingLink {
                poly: con_poly,
                link: Link {
                    bmin: 0,
                    bmax: 0,
                    ..Link::new(PolyRef::new(base | land as u32), 0, LINK_INTERNAL)
                },
            });
            pending.push(PendingLink {
                poly: land,
                link: Link {
                    bmin: 0,
                    bmax: 0,
                    ..Link::new(PolyRef::new(base | con_poly as u32), 0xff, LINK_INTERNAL)
                },
            });
        }

        self.apply_pending(idx, pending, snaps);
    }

    /// Links the end of `target`'s off-mesh connections into tile `idx`
    fn connect_ext_off_mesh_links(&mut self, idx: usize, target: usize, side: Option<u8>) {
        let (Some(tile), Some(target_tile)) = (self.tiles[idx].as_ref(), self.tiles[target].as_ref())
        else {
            return;
        };
        let base = encode_poly_ref(tile.salt, idx as u32, 0).id();
        let target_base = encode_poly_ref(target_tile.salt, target as u32, 0).id();
        let opposite = side.map(opposite_tile).unwrap_or(LINK_INTERNAL);

        let mut target_pending = Vec::new();
        let mut target_snaps = Vec::new();
        let mut tile_pending = Vec::new();
        for con in &target_tile.off_mesh_connections {
            if con.side != opposite {
                continue;
            }
            let con_poly = con.poly as usize;
            let Some(poly) = target_tile.polys.get(con_poly) else {
                continue;
            };
            // Skip connections whose start did not land on the mesh
            if poly.first_link.is_none() {
                continue;
            }
            let ext = [con.radius, target_tile.header.walkable_climb, con.radius];
            let p = con.end();
            let Some((land, nearest)) = self.find_nearest_poly_in_tile(idx, &p, &ext) else {
                continue;
            };
            let dx = nearest[0] - p[0];
            let dz = nearest[2] - p[2];
            if dx * dx + dz * dz > con.radius * con.radius {
                continue;
            }
            target_snaps.push((poly.verts[1] as usize, nearest));
            target_pending.push(PendingLink {
                poly: con_poly,
                link: Link {
                    bmin: 0,
                    bmax: 0,
                    ..Link::new(PolyRef::new(base | land as u32), 1, opposite)
                },
            });
            if con.flags & OFFMESH_CON_BIDIR != 0 {
                tile_pending.push(PendingLink {
                    poly: land,
                    link: Link {
                        bmin: 0,
                        bmax: 0,
                        ..Link::new(
                            PolyRef::new(target_base | con_poly as u32),
                            0xff,
                            side.unwrap_or(LINK_INTERNAL),
                        )
                    },
                });
            }
        }

        self.apply_pending(target, target_pending, target_snaps);
        self.apply_pending(idx, tile_pending, Vec::new());
    }

    /// Creates links from the portal edges of tile `idx` into tile `target`
    fn connect_ext_links(&mut self, idx: usize, target: usize, side: Option<u8>) {
        let (Some(tile), Some(target_tile)) = (self.tiles[idx].as_ref(), self.tiles[target].as_ref())
        else {
            return;
        };
        if idx == target {
            return;
        }
        let target_base = encode_poly_ref(target_tile.salt, target as u32, 0).id();

        let mut pending = Vec::new();
        for (ip, poly) in tile.polys.iter().enumerate() {
            let n = poly.vert_count as usize;
            for j in 0..n {
                let nei = poly.neighbors[j];
                if nei & EXT_LINK == 0 {
                    continue;
                }
                let dir = (nei & 0xff) as u8;
                if side.is_some_and(|s| s != dir) {
                    continue;
                }
                let va = tile.vertex(poly.verts[j] as usize);
                let vb = tile.vertex(poly.verts[(j + 1) % n] as usize);
                for (target_poly, tmin, tmax) in
                    find_connecting_polys(&va, &vb, target_tile, opposite_tile(dir))
                {
                    let mut link = Link::new(
                        PolyRef::new(target_base | target_poly as u32),
                        j as u8,
                        dir,
                    );
                    let axis = if dir == 0 || dir == 4 { 2 } else { 0 };
                    let span = vb[axis] - va[axis];
                    if span.abs() > f32::EPSILON {
                        let mut t0 = (tmin - va[axis]) / span;
                        let mut t1 = (tmax - va[axis]) / span;
                        if t0 > t1 {
                            std::mem::swap(&mut t0, &mut t1);
                        }
                        link.bmin = (t0.clamp(0.0, 1.0) * 255.0).round() as u8;
                        link.bmax = (t1.clamp(0.0, 1.0) * 255.0).round() as u8;
                    }
                    pending.push(PendingLink { poly: ip, link });
                }
            }
        }

        self.apply_pending(idx, pending, Vec::new());
    }

    fn apply_pending(
        &mut self,
        idx: usize,
        pending: Vec<PendingLink>,
        snaps: Vec<(usize, [f32; 3])>,
    ) {
        let Some(tile) = self.tiles[idx].as_mut() else {
            return;
        };
        for (vert, pos) in snaps {
            tile.set_vertex(vert, &pos);
        }
        for p in pending {
            if p.poly < tile.polys.len() {
                tile.add_link(p.poly, p.link);
            }
        }
    }
}

fn neighbour_loc(x: i32, y: i32, side: u8) -> (i32, i32) {
    match side {
        0 => (x + 1, y),
        1 => (x + 1, y + 1),
        2 => (x, y + 1),
        3 => (x - 1, y + 1),
        4 => (x - 1, y),
        5 => (x - 1, y - 1),
        6 => (x, y - 1),
        _ => (x + 1, y - 1),
    }
}

fn validate_query_box(center: &[f32; 3], half_extents: &[f32; 3]) -> Result<()> {
    if !vis_finite(center) || !vis_finite(half_extents) || half_extents.iter().any(|&e| e < 0.0)
    {
        return Err(Status::InvalidParam.into());
    }
    Ok(())
}

fn nearest_distance(center: &[f32; 3], closest: &[f32; 3], over: bool, climb: f32) -> f32 {
    if over {
        // Over the polygon: only height beyond the climb limit counts
        let d = (center[1] - closest[1]).abs() - climb;
        if d > 0.0 {
            d * d
        } else {
            0.0
        }
    } else {
        vdist_sqr(center, closest)
    }
}

fn closest_point_on_outline(verts: &[[f32; 3]], pos: &[f32; 3]) -> [f32; 3] {
    let n = verts.len();
    if n == 0 {
        return *pos;
    }
    let mut best = verts[0];
    let mut best_d = f32::MAX;
    for i in 0..n {
        let a = &verts[i];
        let b = &verts[(i + 1) % n];
        let (d, t) = dist_point_segment_sqr_2d(pos, a, b);
        if d < best_d {
            best_d = d;
            best = vlerp(a, b, t);
        }
    }
    best
}

pub(crate) fn tile_poly_height(tile: &MeshTile, ip: usize, pos: &[f32; 3]) -> Option<f32> {
    let poly = tile.polys.get(ip)?;
    if poly.poly_type == PolyType::OffMeshConnection {
        let v0 = tile.vertex(poly.verts[0] as usize);
        let v1 = tile.vertex(poly.verts[1] as usize);
        let (_, t) = dist_point_segment_sqr_2d(pos, &v0, &v1);
        return Some(v0[1] + (v1[1] - v0[1]) * t);
    }

    let (verts, n) = tile.poly_vertices(poly);
    if !point_in_polygon_2d(pos, &verts[..n]) {
        return None;
    }

    for tri in tile.detail_triangles(ip) {
        if let Some(h) = closest_height_point_triangle(pos, &tri[0], &tri[1], &tri[2]) {
            return Some(h);
        }
    }

    // Inside the outline but between detail triangles by rounding; use the
    // nearest detail edge
    let mut best_d = f32::MAX;
    let mut best_h = pos[1];
    for tri in tile.detail_triangles(ip) {
        for k in 0..3 {
            let a = &tri[k];
            let b = &tri[(k + 1) % 3];
            let (d, t) = dist_point_segment_sqr_2d(pos, a, b);
            if d < best_d {
                best_d = d;
                best_h = a[1] + (b[1] - a[1]) * t;
            }
        }
    }
    Some(best_h)
}

pub(crate) fn closest_point_on_tile_poly(
    tile: &MeshTile,
    ip: usize,
    pos: &[f32; 3],
) -> ([f32; 3], bool) {
    let Some(poly) = tile.polys.get(ip) else {
        return (*pos, false);
    };
    if poly.poly_type == PolyType::OffMeshConnection {
        let v0 = tile.vertex(poly.verts[0] as usize);
        let v1 = tile.vertex(poly.verts[1] as usize);
        let (_, t) = dist_point_segment_sqr_2d(pos, &v0, &v1);
        return (vlerp(&v0, &v1, t), false);
    }
    if let Some(h) = tile_poly_height(tile, ip, pos) {
        return ([pos[0], h, pos[2]], true);
    }
    let (verts, n) = tile.poly_vertices(poly);
    (closest_point_on_outline(&verts[..n], pos), false)
}

/// Slab end points of an edge projected onto the border axis of `side`
fn calc_slab_end_points(va: &[f32; 3], vb: &[f32; 3], side: u8) -> ([f32; 2], [f32; 2]) {
    let axis = if side == 0 || side == 4 { 2 } else { 0 };
    if va[axis] < vb[axis] {
        ([va[axis], va[1]], [vb[axis], vb[1]])
    } else {
        ([vb[axis], vb[1]], [va[axis], va[1]])
    }
}

fn get_slab_coord(v: &[f32; 3], side: u8) -> f32 {
    match side {
        0 | 4 => v[0],
        2 | 6 => v[2],
        _ => 0.0,
    }
}

/// Checks whether two edge slabs overlap along the border and in height
fn overlap_slabs(amin: &[f32; 2], amax: &[f32; 2], bmin: &[f32; 2], bmax: &[f32; 2], px: f32, py: f32) -> bool {
    let minx = (amin[0] + px).max(bmin[0] + px);
    let maxx = (amax[0] - px).min(bmax[0] - px);
    if minx > maxx {
        return false;
    }

    let slope = |lo: &[f32; 2], hi: &[f32; 2], x: f32| {
        let dx = hi[0] - lo[0];
        if dx.abs() < f32::EPSILON {
            lo[1]
        } else {
            lo[1] + (hi[1] - lo[1]) / dx * (x - lo[0])
        }
    };
    let aminy = slope(amin, amax, minx);
    let amaxy = slope(amin, amax, maxx);
    let bminy = slope(bmin, bmax, minx);
    let bmaxy = slope(bmin, bmax, maxx);

    let dmin = bminy - aminy;
    let dmax = bmaxy - amaxy;
    if dmin * dmax < 0.0 {
        return true;
    }
    let thr = (py * 2.0) * (py * 2.0);
    dmin * dmin <= thr || dmax * dmax <= thr
}

/// Polygons of `tile` with a portal edge on `side` overlapping `va..vb`
///
/// Returns the polygon index and the overlapping range along the border axis.
fn find_connecting_polys(
    va: &[f32; 3],
    vb: &[f32; 3],
    tile: &MeshTile,
    side: u8,
) -> Vec<(usize, f32, f32)> {
    let (amin, amax) = calc_slab_end_points(va, vb, side);
    let apos = get_slab_coord(va, side);
    let marker = EXT_LINK | side as u16;

    let mut result = Vec::new();
    for (ip, poly) in tile.polys.iter().enumerate() {
        let n = poly.vert_count as usize;
        for j in 0..n {
            if poly.neighbors[j] != marker {
                continue;
            }
            let vc = tile.vertex(poly.verts[j] as usize);
            let vd = tile.vertex(poly.verts[(j + 1) % n] as usize);
            let bpos = get_slab_coord(&vc, side);
            if (apos - bpos).abs() > 0.01 {
                continue;
            }
            let (bmin, bmax) = calc_slab_end_points(&vc, &vd, side);
            if !overlap_slabs(&amin, &amax, &bmin, &bmax, 0.01, tile.header.walkable_climb) {
                continue;
            }
            result.push((ip, amin[0].max(bmin[0]), amax[0].min(bmax[0])));
            break;
        }
    }
    result
}
