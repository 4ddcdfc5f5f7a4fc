//! Status codes for navigation operations

use navkit_common::Error;

/// Detailed status of a navigation operation
///
/// Every failure status converts into one [`Error`] category; the status text
/// becomes the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation was successful
    Success,
    /// The reference's salt no longer matches the live tile
    StaleReference,
    /// The reference's tile or polygon index is out of range
    OutOfRange,
    /// The start reference does not resolve to a live polygon
    InvalidStart,
    /// The end reference does not resolve to a live polygon
    InvalidEnd,
    /// The point does not project onto the polygon
    PointOutsidePolygon,
    /// Provided parameter was invalid
    InvalidParam,
    /// The search node pool is exhausted
    OutOfNodes,
    /// No free tile slot is left
    OutOfTiles,
    /// The tile cache has no room for another tile or obstacle request
    TileCacheFull,
    /// Start and end are disconnected
    PathNotFound,
    /// A sliced query has not reached a terminal state
    QueryNotFinished,
    /// Stream has wrong magic number
    WrongMagic,
    /// Stream has wrong version
    WrongVersion,
    /// Input data is corrupted or invalid
    DataCorrupted,
    /// Value already exists
    AlreadyExists,
    /// Value does not exist or is not found
    NotFound,
}

impl Status {
    /// Checks if the status is a failure
    pub fn is_failure(&self) -> bool {
        *self != Status::Success
    }

    /// Checks if the status is a success
    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }

    /// Converts status to a result
    pub fn to_result<T>(self, value: T) -> navkit_common::Result<T> {
        if self.is_success() {
            Ok(value)
        } else {
            Err(self.into())
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "Success"),
            Status::StaleReference => write!(f, "Stale reference"),
            Status::OutOfRange => write!(f, "Reference out of range"),
            Status::InvalidStart => write!(f, "Invalid start reference"),
            Status::InvalidEnd => write!(f, "Invalid end reference"),
            Status::PointOutsidePolygon => write!(f, "Point outside polygon"),
            Status::InvalidParam => write!(f, "Invalid parameter"),
            Status::OutOfNodes => write!(f, "Out of search nodes"),
            Status::OutOfTiles => write!(f, "Out of tile slots"),
            Status::TileCacheFull => write!(f, "Tile cache full"),
            Status::PathNotFound => write!(f, "Path not found"),
            Status::QueryNotFinished => write!(f, "Query not finished"),
            Status::WrongMagic => write!(f, "Wrong magic number"),
            Status::WrongVersion => write!(f, "Wrong version"),
            Status::DataCorrupted => write!(f, "Data corrupted"),
            Status::AlreadyExists => write!(f, "Value already exists"),
            Status::NotFound => write!(f, "Value not found"),
        }
    }
}

impl std::error::Error for Status {}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        let msg = status.to_string();
        match status {
            Status::StaleReference
            | Status::OutOfRange
            | Status::InvalidStart
            | Status::InvalidEnd => Error::InvalidReference(msg),
            Status::OutOfNodes | Status::OutOfTiles | Status::TileCacheFull => {
                Error::OutOfResources(msg)
            }
            Status::PathNotFound => Error::NoPath(msg),
            Status::QueryNotFinished => Error::NotFinished,
            Status::Success
            | Status::PointOutsidePolygon
            | Status::InvalidParam
            | Status::WrongMagic
            | Status::WrongVersion
            | Status::DataCorrupted
            | Status::AlreadyExists
            | Status::NotFound => Error::InvalidInput(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_maps_to_error_category() {
        assert!(matches!(
            Error::from(Status::StaleReference),
            Error::InvalidReference(_)
        ));
        assert!(matches!(
            Error::from(Status::TileCacheFull),
            Error::OutOfResources(_)
        ));
        assert!(matches!(Error::from(Status::PathNotFound), Error::NoPath(_)));
        assert!(matches!(
            Error::from(Status::QueryNotFinished),
            Error::NotFinished
        ));
        assert!(matches!(
            Error::from(Status::PointOutsidePolygon),
            Error::InvalidInput(_)
        ));
    }

    #[test]
    fn test_to_result() {
        assert_eq!(Status::Success.to_result(7).ok(), Some(7));
        assert!(Status::OutOfNodes.to_result(7).is_err());
    }
}
