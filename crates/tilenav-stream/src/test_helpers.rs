//! Scenario geometry and small fixtures shared by the tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use glam::Vec3;
use tilenav_common::{Bounds, Error, Result, TriMesh};
use tilenav_mesh::{
    MeshingInput, MeshingPipeline, NavMeshParams, PolyMeshOutput, TileData, WalkableTriangleMesher,
};

use crate::config::{BuildMode, GenerationSettings};
use crate::geometry_set::GeometryInstance;
use crate::grid::{TileGrid, TileGridPlanner};
use crate::tile_builder::TileBuilder;

/// Flat floor of unit cells starting at `origin`, two triangles per cell.
pub fn flat_floor(origin: Vec3, size_x: f32, size_z: f32) -> TriMesh {
    let nx = size_x.round().max(1.0) as u32;
    let nz = size_z.round().max(1.0) as u32;
    let (cx, cz) = (size_x / nx as f32, size_z / nz as f32);

    let mut mesh = TriMesh::new();
    for j in 0..=nz {
        for i in 0..=nx {
            mesh.push_vertex(origin + Vec3::new(i as f32 * cx, 0.0, j as f32 * cz));
        }
    }
    let row = nx + 1;
    for j in 0..nz {
        for i in 0..nx {
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

/// Horizontal quad at height `y` as two triangles.
pub fn quad(mesh: &mut TriMesh, min: (f32, f32), max: (f32, f32), y: f32) {
    let a = mesh.push_vertex(Vec3::new(min.0, y, min.1));
    let b = mesh.push_vertex(Vec3::new(max.0, y, min.1));
    let c = mesh.push_vertex(Vec3::new(max.0, y, max.1));
    let d = mesh.push_vertex(Vec3::new(min.0, y, max.1));
    mesh.push_triangle(a, d, c);
    mesh.push_triangle(a, c, b);
}

/// Vertical wall in the plane `x`, spanning `z` and `y`.
pub fn wall_x(mesh: &mut TriMesh, x: f32, z: (f32, f32), y: (f32, f32)) {
    let a = mesh.push_vertex(Vec3::new(x, y.0, z.0));
    let b = mesh.push_vertex(Vec3::new(x, y.0, z.1));
    let c = mesh.push_vertex(Vec3::new(x, y.1, z.1));
    let d = mesh.push_vertex(Vec3::new(x, y.1, z.0));
    mesh.push_triangle(a, b, c);
    mesh.push_triangle(a, c, d);
}

/// A 3 unit cliff: plateau at y = 3 over x 0..10, ground at y = 0 over x 10..20, both
/// 10 deep, joined by a wall at x = 10.
pub fn cliff() -> TriMesh {
    let mut mesh = TriMesh::new();
    quad(&mut mesh, (0.0, 0.0), (10.0, 10.0), 3.0);
    quad(&mut mesh, (10.0, 0.0), (20.0, 10.0), 0.0);
    wall_x(&mut mesh, 10.0, (0.0, 10.0), (0.0, 3.0));
    mesh
}

/// Two 6 x 6 islands at y = 0 with a 4 unit gap between x = 6 and x = 10, optionally
/// split by a wall at x = 8.
pub fn islands(with_wall: bool) -> TriMesh {
    let mut mesh = TriMesh::new();
    quad(&mut mesh, (0.0, 0.0), (6.0, 6.0), 0.0);
    quad(&mut mesh, (10.0, 0.0), (16.0, 6.0), 0.0);
    if with_wall {
        wall_x(&mut mesh, 8.0, (-1.0, 7.0), (-1.0, 3.0));
    }
    mesh
}

/// Tiled settings with `tile_world` unit tiles, 0.5 unit cells and a 2 unit skirt.
pub fn tiled_settings(tile_world: f32) -> GenerationSettings {
    GenerationSettings::default()
        .with_mode(BuildMode::Tiled)
        .with_cell_size(0.5)
        .with_agent_radius(0.5)
        .with_tile_size((tile_world / 0.5).round() as i32)
}

/// Square world of `world_size` units from the origin, 10 units tall.
pub fn world_bounds(world_size: f32) -> Bounds {
    Bounds::new(
        Vec3::new(0.0, -5.0, 0.0),
        Vec3::new(world_size, 5.0, world_size),
    )
}

/// Builder over a square world with `mesh` already cached.
pub fn tiled_builder(mesh: TriMesh, tile_world: f32, world_size: f32) -> TileBuilder {
    let settings = tiled_settings(tile_world);
    let grid = TileGridPlanner::plan(&settings, world_bounds(world_size)).unwrap();
    let mut builder = TileBuilder::new(settings, grid, Arc::new(WalkableTriangleMesher::new()));
    builder.update_cached_geometry(Arc::new(mesh));
    builder
}

/// Container parameters of an 8 x 8 grid of 4 unit tiles at the origin.
pub fn small_params() -> NavMeshParams {
    NavMeshParams {
        origin: Vec3::ZERO,
        tile_width: 4.0,
        tile_height: 4.0,
        max_tiles: 64,
        max_polys: 1024,
    }
}

/// Grid matching [`small_params`].
pub fn small_grid() -> TileGrid {
    TileGrid {
        bounds: Bounds::new(Vec3::ZERO, Vec3::new(32.0, 4.0, 32.0)),
        tile_width: 4.0,
        tile_height: 4.0,
        tile_count_x: 8,
        tile_count_y: 8,
        tile_bits: 6,
        poly_bits: 10,
    }
}

/// Serialized flat tile `(tx, ty)` of [`small_params`], 4 x 4 unit cells at y = 0.
pub fn flat_tile_blob(tx: i32, ty: i32) -> Vec<u8> {
    let origin = Vec3::new(tx as f32 * 4.0, 0.0, ty as f32 * 4.0);
    let mesh = flat_floor(origin, 4.0, 4.0);
    let core = Bounds::new(origin - Vec3::Y, origin + Vec3::new(4.0, 1.0, 4.0));
    let triangles: Vec<u32> = (0..mesh.tri_count() as u32).collect();
    let settings = GenerationSettings::default();
    let config = settings.to_meshing_config();
    let input = MeshingInput {
        mesh: &mesh,
        triangles: &triangles,
        bounds: core,
        tile_bounds: core,
        config: &config,
        connectors: &[],
    };
    let out = WalkableTriangleMesher::new().build(&input).unwrap();
    TileData::from_mesh_output(tx, ty, &out, &[], core, settings.agent_info())
        .unwrap()
        .to_bytes()
        .unwrap()
}

pub fn instance(id: &str, mesh: TriMesh, position: Vec3) -> Result<GeometryInstance> {
    GeometryInstance::new(id, Arc::new(mesh), position, Vec3::ZERO)
}

/// Meshes like [`WalkableTriangleMesher`] and counts how often it ran.
#[derive(Debug, Default)]
pub struct CountingMesher {
    inner: WalkableTriangleMesher,
    calls: AtomicUsize,
}

impl CountingMesher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MeshingPipeline for CountingMesher {
    fn build(&self, input: &MeshingInput<'_>) -> Result<PolyMeshOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.build(input)
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Meshes like [`WalkableTriangleMesher`] but fails the tile whose core holds `at`
/// while armed.
#[derive(Debug, Default)]
pub struct FailingMesher {
    inner: WalkableTriangleMesher,
    at: Vec3,
    armed: AtomicBool,
}

impl FailingMesher {
    pub fn new(at: Vec3) -> Self {
        Self {
            at,
            ..Default::default()
        }
    }

    pub fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::SeqCst);
    }
}

impl MeshingPipeline for FailingMesher {
    fn build(&self, input: &MeshingInput<'_>) -> Result<PolyMeshOutput> {
        if self.armed.load(Ordering::SeqCst) && input.tile_bounds.contains_xz(self.at) {
            return Err(Error::NavMesh("mesher failure".to_string()));
        }
        self.inner.build(input)
    }

    fn name(&self) -> &str {
        "failing"
    }
}
