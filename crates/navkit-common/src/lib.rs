//! Common utilities and data structures shared by the navkit crates

mod bounds;
mod geometry;
mod vector;

pub use bounds::*;
pub use geometry::*;
pub use vector::*;

/// Represents a 3D position
pub type Vec3 = glam::Vec3;

/// Error types for the library
///
/// Every fallible operation in navkit reports one of these categories. The
/// message carries the detailed reason.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Stale salt or out-of-range index in a reference
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// Malformed query parameters or degenerate geometry
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Node pool, tile slot or obstacle registry exhausted
    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// Start and end are not connected
    #[error("no path: {0}")]
    NoPath(String),

    /// A sliced query was finalized before reaching a terminal state
    #[error("query not finished")]
    NotFinished,

    /// Tile payload could not be compressed or decompressed
    #[error("codec error: {0}")]
    Codec(String),

    /// Byte stream read or write failed
    #[cfg(feature = "std")]
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for navkit operations
pub type Result<T> = std::result::Result<T, Error>;
