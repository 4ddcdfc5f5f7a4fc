//! Dynamic obstacle management and tile caching for navigation meshes
//!
//! The tile cache keeps a compressed walkable-cell layer per tile and
//! regenerates navigation mesh tiles from it whenever obstacles are added or
//! removed, without rebuilding the rest of the mesh.
//!
//! # Features
//!
//! - **Compressed layers**: cell heights, areas and connections stored through
//!   a pluggable [`TileCacheCompressor`] (LZ4 by default)
//! - **Dynamic obstacles**: cylinders, axis-aligned boxes and boxes rotated
//!   around the Y axis
//! - **Incremental updates**: only tiles touched by a changed obstacle are
//!   rebuilt, a bounded number per [`TileCache::update`] call
//! - **Hot swap**: rebuilt tiles replace the old ones in a
//!   [`navkit::NavMesh`] so in-flight queries see stale references rather
//!   than half-built tiles
//!
//! # Example
//!
//! ```rust,ignore
//! use navkit::{NavMesh, NavMeshParams};
//! use navkit_tilecache::{TileCache, TileCacheParams};
//!
//! let mut cache = TileCache::new(params)?;
//! let mut nav_mesh = NavMesh::new(cache.nav_mesh_params(256))?;
//! for layer in layers {
//!     let tile_ref = cache.add_tile(cache.compress_layer(&layer)?)?;
//!     cache.build_nav_mesh_tile(tile_ref, &mut nav_mesh)?;
//! }
//!
//! let obstacle = cache.add_obstacle([10.0, 0.0, 10.0], 1.5, 2.0)?;
//! while !cache.is_up_to_date() {
//!     cache.update(4, &mut nav_mesh)?;
//! }
//! ```
//!
//! # Architecture
//!
//! - [`TileCache`]: compressed tiles, obstacle registry and rebuild queue
//! - [`TileCacheLayer`]: decompressed cell grid of one tile
//! - [`TileMeshBuilder`]: turns a carved layer into navigation mesh input
//! - [`ObstacleShape`]: obstacle geometry and its rasterization onto a layer

pub mod compressor;
pub mod obstacle;
pub mod tile_cache;
pub mod tile_cache_data;
pub mod tile_cache_set;
pub mod tile_mesh_builder;

#[cfg(test)]
pub(crate) mod test_layers;


pub use compressor::*;
pub use obstacle::*;
pub use tile_cache::*;
pub use tile_cache_data::*;
pub use tile_cache_set::*;
pub use tile_mesh_builder::*;
