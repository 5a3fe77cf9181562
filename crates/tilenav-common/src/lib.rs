//! Common utilities and data structures shared by the tilenav crates

mod geometry;
mod math;
mod mesh;

pub use geometry::*;
pub use math::*;
pub use mesh::*;

/// Represents a 3D position
pub type Vec3 = glam::Vec3;

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid bounds or settings, detected before any build work starts
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid input mesh: {0}")]
    InvalidMesh(String),

    #[error("tile ({tx}, {ty}) failed to build: {reason}")]
    TileBuild { tx: i32, ty: i32, reason: String },

    #[error("tile store error: {0}")]
    Store(String),

    #[error("tile store does not match the live grid: {0}")]
    IncompatibleStore(String),

    #[error("navigation mesh error: {0}")]
    NavMesh(String),

    #[error("pathfinding failed: {0}")]
    Pathfinding(String),

    #[error("operation cancelled")]
    Cancelled,

    #[cfg(feature = "std")]
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Hard failures that retrying with the same inputs cannot fix
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// True for a cooperative cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Result type for tilenav operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::Config("tile size".into()).is_configuration());
        assert!(!Error::Store("truncated".into()).is_configuration());
        assert!(Error::Cancelled.is_cancelled());
    }

    #[test]
    fn test_error_display() {
        let err = Error::TileBuild {
            tx: 3,
            ty: -1,
            reason: "too many polygons".into(),
        };
        assert_eq!(err.to_string(), "tile (3, -1) failed to build: too many polygons");
    }
}
