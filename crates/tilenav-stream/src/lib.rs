//! Tile lifecycle engine for large, continuously edited worlds
//!
//! This crate keeps a tiled navigation mesh in step with a world made of named geometry
//! instances:
//!
//! - **Grid planning**: [`TileGridPlanner`] derives tile dimensions and the polygon
//!   reference budget from world bounds and [`GenerationSettings`].
//! - **Tile building**: [`TileBuilder`] selects the triangles around one tile, hands them to
//!   a [`MeshingPipeline`](tilenav_mesh::MeshingPipeline) and serializes the result together
//!   with the offmesh links the tile owns.
//! - **Persistence**: [`TileCacheStore`] writes every live tile to a single indexed file and
//!   only trusts it again when the grid parameters and per-tile content hashes still match.
//! - **Streaming**: [`ResidencyManager`] keeps a bounded, least-recently-used working set of
//!   tiles around a moving focus.
//! - **Incremental updates**: [`DirtyTracker`] diffs instance fingerprints and rebuilds only
//!   the tiles under changed geometry.
//! - **Link synthesis**: [`OffmeshLinkGenerator`] raycasts the cached world triangles to
//!   create drop, jump, facing-pair and island reconnection links.
//! - **Runtime**: [`NavRuntime`] ties everything together, runs full builds on a
//!   [`BuildWorker`] thread and answers path queries.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use glam::Vec3;
//! use tilenav_common::{Bounds, TriMesh};
//! use tilenav_stream::{BuildMode, GenerationSettings, NavRuntime, RuntimeConfig};
//!
//! # fn example() -> tilenav_common::Result<()> {
//! let settings = GenerationSettings::default().with_mode(BuildMode::Tiled);
//! let mut runtime = NavRuntime::new(RuntimeConfig::default().with_settings(settings));
//! runtime.init_grid(Bounds::new(Vec3::new(-50.0, -5.0, -50.0), Vec3::new(50.0, 20.0, 50.0)))?;
//!
//! let floor = Arc::new(TriMesh::from_buffers(
//!     vec![-40.0, 0.0, -40.0, 40.0, 0.0, -40.0, 40.0, 0.0, 40.0, -40.0, 0.0, 40.0],
//!     vec![0, 2, 1, 0, 3, 2],
//! )?);
//! runtime.add_instance("floor", floor, Vec3::ZERO, Vec3::ZERO)?;
//! runtime.build_all()?;
//!
//! let path = runtime.find_path(Vec3::new(-30.0, 0.0, -30.0), Vec3::new(30.0, 0.0, 30.0))?;
//! println!("{} path points", path.len());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(unused))]

pub mod config;
mod container;
mod dirty;
mod geometry_set;
mod grid;
pub mod offmesh;
mod path_query;
mod raycast;
mod residency;
mod runtime;
mod snapshot;
mod tile_builder;
mod tile_store;
mod tiled_build;
mod worker;

#[cfg(test)]
mod test_helpers;



#[cfg(test)]
mod streaming_tests;

pub use config::{
    AutoOffmeshParams, BuildMode, GenerationSettings, IslandLinkParams, PathQueryConfig,
    RuntimeConfig, StreamingConfig,
};
pub use container::NavMeshContainer;
pub use dirty::{DirtyBoundsEvent, DirtyTracker, RebuildReport};
pub use geometry_set::{rotation_matrix, GeometryInstance, GeometrySet};
pub use grid::{TileGrid, TileGridPlanner, DESIRED_MAX_POLYS, MAX_TILE_COUNT, TOTAL_REF_BITS};
pub use offmesh::{OffmeshLink, OffmeshLinkGenerator};
pub use path_query::PathQuery;
pub use raycast::{RayHit, RaycastMesh};
pub use residency::{ResidencyManager, StoreThenBuild, TileSource, TouchReport};
pub use runtime::{NavRuntime, RuntimeStats};
pub use snapshot::{RuntimeSnapshot, SnapshotInstance, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
pub use tile_builder::{BuiltTile, TileBuildOutcome, TileBuilder};
pub use tile_store::{
    GridParamsBlob, TileCacheStore, TileIndexEntry, TileRecord, TILE_STORE_MAGIC,
    TILE_STORE_VERSION,
};
pub use tiled_build::{build_all_tiles, TiledBuildReport};
pub use worker::{BuildJob, BuildResult, BuildWorker, CancellationToken};
