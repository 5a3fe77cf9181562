//! Shared geometry builders for tests

use glam::Vec3;
use tilenav_common::{Bounds, TriMesh};

use crate::mesher::{ConnectorSegment, MeshingConfig, MeshingInput, MeshingPipeline};
use crate::tile_data::{TileAgentInfo, TileData};
use crate::{NavMeshParams, WalkableTriangleMesher};

/// Flat grid of `nx * nz` quads at `origin`, two triangles per quad.
pub fn flat_grid(origin: Vec3, nx: usize, nz: usize, cell: f32) -> TriMesh {
    let mut mesh = TriMesh::new();
    for j in 0..=nz {
        for i in 0..=nx {
            mesh.push_vertex(origin + Vec3::new(i as f32 * cell, 0.0, j as f32 * cell));
        }
    }
    let row = (nx + 1) as u32;
    for j in 0..nz as u32 {
        for i in 0..nx as u32 {
            let v00 = j * row + i;
            let v10 = v00 + 1;
            let v01 = v00 + row;
            let v11 = v01 + 1;
            mesh.push_triangle(v00, v01, v11);
            mesh.push_triangle(v00, v11, v10);
        }
    }
    mesh
}

pub fn meshing_config() -> MeshingConfig {
    MeshingConfig {
        cell_size: 0.3,
        cell_height: 0.2,
        walkable_slope_angle: 60.0,
        walkable_height_cells: 10,
        walkable_climb_cells: 5,
        walkable_radius_cells: 2,
        max_edge_len_cells: 40,
        max_simplification_error: 1.3,
        min_region_area: 64,
        merge_region_area: 400,
        max_verts_per_poly: 6,
        detail_sample_dist: 1.8,
        detail_sample_max_error: 0.2,
        border_size_cells: 5,
        tile_size_cells: 48,
    }
}

pub fn agent_info() -> TileAgentInfo {
    TileAgentInfo {
        walkable_height: 2.0,
        walkable_radius: 0.6,
        walkable_climb: 1.0,
    }
}

pub fn test_params(tile_size: f32) -> NavMeshParams {
    NavMeshParams {
        origin: Vec3::ZERO,
        tile_width: tile_size,
        tile_height: tile_size,
        max_tiles: 64,
        max_polys: 1024,
    }
}

/// Tile `(tx, ty)` of a flat floor at y = 0, split into `n * n` quads.
pub fn build_flat_tile_data(
    tx: i32,
    ty: i32,
    size: f32,
    n: usize,
    connectors: &[ConnectorSegment],
) -> TileData {
    let origin = Vec3::new(tx as f32 * size, 0.0, ty as f32 * size);
    let mesh = flat_grid(origin, n, n, size / n as f32);
    let tile_bounds = Bounds::new(
        origin - Vec3::Y,
        origin + Vec3::new(size, 1.0, size),
    );
    let triangles: Vec<u32> = (0..mesh.tri_count() as u32).collect();
    let config = meshing_config();
    let input = MeshingInput {
        mesh: &mesh,
        triangles: &triangles,
        bounds: tile_bounds,
        tile_bounds,
        config: &config,
        connectors,
    };
    let out = WalkableTriangleMesher::new().build(&input).unwrap();
    TileData::from_mesh_output(tx, ty, &out, connectors, tile_bounds, agent_info()).unwrap()
}

/// Serialized form of [`build_flat_tile_data`] without connectors.
pub fn build_flat_tile(tx: i32, ty: i32, size: f32, n: usize) -> Vec<u8> {
    build_flat_tile_data(tx, ty, size, n, &[]).to_bytes().unwrap()
}
