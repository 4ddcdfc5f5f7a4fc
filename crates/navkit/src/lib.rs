//! Runtime navigation mesh: tile store, spatial queries and path search
//!
//! A [`NavMesh`] holds grid-aligned tiles of convex polygons. Tiles are built
//! from pre-processed geometry with [`NavMeshBuilder`], added and removed at
//! runtime, and stitched together along their borders. [`NavMeshQuery`]
//! answers nearest-polygon, height, path, straight-path and raycast queries
//! against it, and [`SlicedFindPath`] runs a path search in budgeted steps
//! that can be resumed across frames while the mesh changes underneath.
//!
//! # Example
//!
//! ```rust,ignore
//! use navkit::{NavMesh, NavMeshQuery, QueryFilter};
//!
//! let query = NavMeshQuery::new(&nav_mesh, 2048);
//! let filter = QueryFilter::default();
//! let (start_ref, start) = query
//!     .find_nearest_poly(&[1.0, 0.0, 1.0], &[2.0, 4.0, 2.0], &filter)?
//!     .ok_or(navkit::Status::InvalidStart)?;
//! let (end_ref, end) = query
//!     .find_nearest_poly(&[18.0, 0.0, 18.0], &[2.0, 4.0, 2.0], &filter)?
//!     .ok_or(navkit::Status::InvalidEnd)?;
//! let corridor = query.find_path(start_ref, end_ref, &start, &end, &filter)?;
//! let path = query.find_straight_path(&start, &end, &corridor, 32)?;
//! ```

pub mod binary_format;
pub mod bv_tree;
pub mod nav_mesh;
pub mod nav_mesh_builder;
pub mod nav_mesh_query;
pub mod node_pool;
pub mod raycast_hit;
pub mod sliced_pathfinding;
pub mod status;
pub mod straight_path;

#[cfg(test)]
pub(crate) mod test_mesh_helpers;

#[cfg(test)]
mod multi_tile_tests;
#[cfg(test)]
mod sliced_pathfinding_tests;

pub use binary_format::*;
pub use bv_tree::BVNode;
pub use nav_mesh::*;
pub use nav_mesh_builder::*;
pub use nav_mesh_query::*;
pub use node_pool::DEFAULT_MAX_NODES;
pub use raycast_hit::*;
pub use sliced_pathfinding::*;
pub use status::Status;
pub use straight_path::*;

pub use navkit_common::{Error, Result};

/// Maximum number of vertices per navigation polygon
pub const MAX_VERTS_PER_POLY: usize = 6;

/// Number of distinct area types
pub const MAX_AREAS: usize = 64;

/// Area id marking unwalkable space
pub const NULL_AREA: u8 = 0;

/// Default area id for walkable ground
pub const WALKABLE_AREA: u8 = 63;

/// Flag marking a polygon edge as a tile portal; the low bits hold the side
pub const EXT_LINK: u16 = 0x8000;

/// Marks an unused vertex or a wall edge in [`NavMeshCreateParams`]
pub const MESH_NULL_IDX: u16 = 0xffff;

/// Side value of links inside one tile
pub const LINK_INTERNAL: u8 = 0xff;

/// Flag on off-mesh connections that can be traversed in both directions
pub const OFFMESH_CON_BIDIR: u8 = 1;

/// A reference to a polygon in a navigation mesh
///
/// The id packs a salt, a tile slot index and a polygon index. A reference
/// stays valid only while its tile occupies the slot with the same salt; id
/// zero never refers to a polygon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PolyRef(u32);

impl PolyRef {
    /// Creates a reference from its raw id
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id
    pub const fn id(&self) -> u32 {
        self.0
    }

    /// Checks that the raw id is non-zero
    ///
    /// This does not check the reference against any mesh; use
    /// [`NavMesh::is_valid_poly_ref`] for that.
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u32> for PolyRef {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PolyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A reference to a tile: the polygon reference base of the tile's first
/// polygon
pub type TileRef = PolyRef;

bitflags::bitflags! {
    /// Polygon flags used by query filters
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct PolyFlags: u16 {
        /// Regular ground that can be walked on
        const WALK = 0x01;
        /// Water
        const SWIM = 0x02;
        /// Passable only while open
        const DOOR = 0x04;
        /// Jumps and ladders
        const JUMP = 0x08;
        /// Temporarily closed
        const DISABLED = 0x10;
    }
}

/// Type of a navigation polygon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum PolyType {
    /// A convex ground polygon
    #[default]
    Ground = 0,
    /// Two-vertex polygon standing for an off-mesh connection
    OffMeshConnection = 1,
}

/// Navigation mesh layout parameters
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct NavMeshParams {
    /// World-space origin of tile (0, 0)
    pub origin: [f32; 3],
    /// Tile size along X
    pub tile_width: f32,
    /// Tile size along Z
    pub tile_height: f32,
    /// Maximum number of resident tiles
    pub max_tiles: usize,
    /// Maximum number of polygons per tile
    pub max_polys_per_tile: usize,
}

impl Default for NavMeshParams {
    fn default() -> Self {
        Self {
            origin: [0.0; 3],
            tile_width: 32.0,
            tile_height: 32.0,
            max_tiles: 128,
            max_polys_per_tile: 4096,
        }
    }
}

#[cfg(feature = "serialization")]
impl NavMeshParams {
    /// Serializes the parameters to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Codec(e.to_string()))
    }

    /// Deserializes parameters from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Codec(e.to_string()))
    }

    /// Serializes the parameters to a compact binary form
    pub fn to_binary(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| Error::Codec(e.to_string()))
    }

    /// Deserializes parameters from their compact binary form
    pub fn from_binary(data: &[u8]) -> Result<Self> {
        postcard::from_bytes(data).map_err(|e| Error::Codec(e.to_string()))
    }
}

/// Filter deciding which polygons a query may visit and what they cost
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct QueryFilter {
    /// Cost multiplier per area id
    #[cfg_attr(feature = "serialization", serde(with = "area_cost_serde"))]
    pub area_cost: [f32; MAX_AREAS],
    /// At least one of these flags must be set on a polygon
    pub include_flags: PolyFlags,
    /// None of these flags may be set on a polygon
    pub exclude_flags: PolyFlags,
    /// Bit `n` excludes area id `n`
    pub excluded_areas: u64,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            area_cost: [1.0; MAX_AREAS],
            include_flags: PolyFlags::all(),
            exclude_flags: PolyFlags::empty(),
            excluded_areas: 0,
        }
    }
}

impl QueryFilter {
    /// Checks whether a polygon may be visited
    pub fn pass_filter(&self, poly: &Poly) -> bool {
        poly.flags.intersects(self.include_flags)
            && !poly.flags.intersects(self.exclude_flags)
            && !self.is_area_excluded(poly.area)
    }

    /// Checks whether an area id is excluded
    pub fn is_area_excluded(&self, area: u8) -> bool {
        (area as usize) < MAX_AREAS && self.excluded_areas & (1u64 << area) != 0
    }

    /// Excludes or re-includes an area id
    pub fn set_area_excluded(&mut self, area: u8, excluded: bool) {
        if (area as usize) < MAX_AREAS {
            if excluded {
                self.excluded_areas |= 1u64 << area;
            } else {
                self.excluded_areas &= !(1u64 << area);
            }
        }
    }

    /// Sets the traversal cost multiplier of an area
    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        if let Some(c) = self.area_cost.get_mut(area as usize) {
            *c = cost;
        }
    }

    /// Returns the traversal cost multiplier of an area
    pub fn area_cost(&self, area: u8) -> f32 {
        self.area_cost.get(area as usize).copied().unwrap_or(1.0)
    }

    /// Cost of moving from `pa` to `pb` across a polygon of the given area
    pub fn get_cost(&self, pa: &[f32; 3], pb: &[f32; 3], area: u8) -> f32 {
        navkit_common::vdist(pa, pb) * self.area_cost(area)
    }

    /// Smallest cost multiplier over the areas this filter admits
    ///
    /// Scaling the distance heuristic by this value keeps it from
    /// overestimating the remaining cost.
    pub fn min_area_cost(&self) -> f32 {
        let mut min = f32::MAX;
        for (area, &cost) in self.area_cost.iter().enumerate() {
            if !self.is_area_excluded(area as u8) && cost.is_finite() {
                min = min.min(cost);
            }
        }
        if min == f32::MAX {
            1.0
        } else {
            min.max(0.0)
        }
    }
}

#[cfg(feature = "serialization")]
mod area_cost_serde {
    use super::MAX_AREAS;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(costs: &[f32; MAX_AREAS], s: S) -> Result<S::Ok, S::Error> {
        costs.as_slice().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[f32; MAX_AREAS], D::Error> {
        let v = Vec::<f32>::deserialize(d)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 area costs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_filter_defaults() {
        let filter = QueryFilter::default();
        let poly = Poly::new(WALKABLE_AREA, PolyType::Ground, PolyFlags::WALK);
        assert!(filter.pass_filter(&poly));
        assert_eq!(filter.min_area_cost(), 1.0);
    }

    #[test]
    fn test_query_filter_flags_and_areas() {
        let mut filter = QueryFilter::default();
        let walk = Poly::new(1, PolyType::Ground, PolyFlags::WALK);
        let door = Poly::new(1, PolyType::Ground, PolyFlags::WALK | PolyFlags::DOOR);

        filter.exclude_flags = PolyFlags::DOOR;
        assert!(filter.pass_filter(&walk));
        assert!(!filter.pass_filter(&door));

        filter.set_area_excluded(1, true);
        assert!(!filter.pass_filter(&walk));
        filter.set_area_excluded(1, false);
        assert!(filter.pass_filter(&walk));

        filter.include_flags = PolyFlags::SWIM;
        assert!(!filter.pass_filter(&walk));
    }

    #[test]
    fn test_query_filter_cost() {
        let mut filter = QueryFilter::default();
        filter.set_area_cost(5, 10.0);
        let a = [0.0, 0.0, 0.0];
        let b = [3.0, 0.0, 4.0];
        assert_eq!(filter.get_cost(&a, &b, 5), 50.0);
        assert_eq!(filter.get_cost(&a, &b, 0), 5.0);

        for area in 0..MAX_AREAS as u8 {
            filter.set_area_cost(area, 2.0);
        }
        filter.set_area_cost(7, 0.5);
        assert_eq!(filter.min_area_cost(), 0.5);
        filter.set_area_excluded(7, true);
        assert_eq!(filter.min_area_cost(), 2.0);
    }

    #[test]
    fn test_poly_ref_basics() {
        assert!(!PolyRef::default().is_valid());
        assert!(PolyRef::new(1).is_valid());
        assert_eq!(PolyRef::from(42).id(), 42);
    }

    #[cfg(feature = "serialization")]
    #[test]
    fn test_params_serialization() -> Result<()> {
        let params = NavMeshParams {
            origin: [1.0, 2.0, 3.0],
            ..NavMeshParams::default()
        };
        assert_eq!(NavMeshParams::from_json(&params.to_json()?)?, params);
        assert_eq!(NavMeshParams::from_binary(&params.to_binary()?)?, params);
        Ok(())
    }
}
