//! Tiled navigation mesh container and tile data
//!
//! This crate holds everything that lives "inside" a navigation mesh:
//!
//! - **Meshing seam**: the [`MeshingPipeline`] trait turns a tile's triangle subset into
//!   polygons. [`WalkableTriangleMesher`] is a small reference implementation.
//! - **Tile blobs**: [`TileData`] is the relocatable per-tile payload, serialized with
//!   little-endian framing so it can be persisted and reloaded byte for byte.
//! - **Container**: [`NavMesh`] owns the live tiles keyed by `(tx, ty, layer)` and resolves
//!   polygon adjacency across tile borders.
//! - **Queries**: [`NavMeshQuery`] answers nearest-polygon and path queries.

mod mesher;
mod nav_mesh;
mod nav_mesh_query;
mod tile_data;

#[cfg(test)]
mod test_mesh_helpers;

#[cfg(test)]
mod nav_mesh_multi_tile_tests;

pub use mesher::{
    ConnectorSegment, DetailTriangle, MeshPoly, MeshingConfig, MeshingInput, MeshingPipeline,
    PolyMeshOutput, WalkableTriangleMesher,
};
pub use nav_mesh::{MeshTile, NavMesh, NavMeshParams};
pub use nav_mesh_query::{
    simplify_min_edge, NavMeshQuery, QueryFilter, StraightPathPoint, MAX_PATH_POLYS,
    STRAIGHTPATH_END, STRAIGHTPATH_OFFMESH_CONNECTION, STRAIGHTPATH_START,
};
pub use tile_data::{
    OffMeshConnection, Poly, PolyDetail, PolyType, TileAgentInfo, TileData, TileHeader,
};

/// Maximum number of vertices per polygon
pub const MAX_VERTS_PER_POLY: usize = 6;

/// Magic number for tile blobs ('TNAV')
pub const TILE_MAGIC: u32 = u32::from_be_bytes(*b"TNAV");

/// Current tile blob version
pub const TILE_VERSION: u32 = 1;

/// Area ids carried on polygons and offmesh links.
pub mod nav_area {
    pub const NULL: u8 = 0;
    pub const OFFMESH: u8 = 2;
    pub const JUMP: u8 = 3;
    pub const DROP: u8 = 4;
    pub const GROUND: u8 = 63;

    /// Number of distinct area ids a cost table covers
    pub const MAX_AREAS: usize = 64;
}

/// Polygon flag set on every walkable polygon
pub const POLY_FLAG_WALK: u16 = 0x01;

/// Identifier of a tile inside one [`NavMesh`].
///
/// Ids are never reused while the container lives, so a stale [`PolyRef`] into a
/// replaced tile does not resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileId(pub u32);

/// Reference to a polygon: owning tile plus polygon index within that tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyRef {
    pub tile: TileId,
    pub poly: u32,
}

impl PolyRef {
    pub fn new(tile: TileId, poly: u32) -> Self {
        Self { tile, poly }
    }
}

/// Packs a tile coordinate into a single map key.
#[inline]
pub fn tile_key(tx: i32, ty: i32) -> u64 {
    ((tx as u32 as u64) << 32) | (ty as u32 as u64)
}

/// Inverse of [`tile_key`].
#[inline]
pub fn tile_key_coords(key: u64) -> (i32, i32) {
    ((key >> 32) as u32 as i32, key as u32 as i32)
}
