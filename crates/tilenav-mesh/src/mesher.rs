//! Meshing seam between tile planning and polygon extraction
//!
//! The lifecycle engine only depends on [`MeshingPipeline`]. A production setup plugs a
//! voxelizing mesher in here; [`WalkableTriangleMesher`] is the built-in reference
//! implementation that turns walkable source triangles directly into polygons.

use std::collections::HashMap;

use glam::Vec3;
use tilenav_common::{deg_to_rad, tri_area_2d, triangle_normal, Bounds, Error, Result, TriMesh};

use crate::{nav_area, POLY_FLAG_WALK};

/// Walkability and simplification settings handed to a meshing pipeline.
///
/// Distances ending in `_cells` are in voxel units, everything else is world units.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshingConfig {
    pub cell_size: f32,
    pub cell_height: f32,
    /// Maximum walkable slope in degrees
    pub walkable_slope_angle: f32,
    pub walkable_height_cells: i32,
    pub walkable_climb_cells: i32,
    pub walkable_radius_cells: i32,
    pub max_edge_len_cells: i32,
    pub max_simplification_error: f32,
    pub min_region_area: i32,
    pub merge_region_area: i32,
    pub max_verts_per_poly: i32,
    pub detail_sample_dist: f32,
    pub detail_sample_max_error: f32,
    pub border_size_cells: i32,
    pub tile_size_cells: i32,
}

/// Offmesh connector passed alongside the triangle subset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectorSegment {
    pub start: Vec3,
    pub end: Vec3,
    pub radius: f32,
    pub bidirectional: bool,
    pub area: u8,
    pub flags: u16,
    pub user_id: u32,
}

/// Everything a pipeline needs to mesh one tile.
#[derive(Debug, Clone, Copy)]
pub struct MeshingInput<'a> {
    /// World geometry; only `triangles` are relevant to this tile
    pub mesh: &'a TriMesh,
    /// Indices of the triangles overlapping `bounds`
    pub triangles: &'a [u32],
    /// Tile box grown by the border skirt
    pub bounds: Bounds,
    /// Tile box without the skirt; polygons must not extend their ownership past it
    pub tile_bounds: Bounds,
    pub config: &'a MeshingConfig,
    pub connectors: &'a [ConnectorSegment],
}

/// Polygon produced by a pipeline, indexing into [`PolyMeshOutput::verts`].
#[derive(Debug, Clone, PartialEq)]
pub struct MeshPoly {
    pub verts: Vec<u16>,
    /// Internal neighbour across each edge (`verts[i]` to `verts[i + 1]`)
    pub neighbors: Vec<Option<u16>>,
    pub area: u8,
    pub flags: u16,
}

/// Height-detail triangle belonging to a polygon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetailTriangle {
    pub poly: u16,
    pub verts: [Vec3; 3],
}

/// Vertex, polygon and detail buffers for one tile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolyMeshOutput {
    pub verts: Vec<Vec3>,
    pub polys: Vec<MeshPoly>,
    pub detail: Vec<DetailTriangle>,
}

impl PolyMeshOutput {
    pub fn is_empty(&self) -> bool {
        self.polys.is_empty()
    }
}

/// Converts a tile's triangle subset into a polygon mesh.
///
/// Implementations must be deterministic for identical input and must not retain
/// references past the call.
pub trait MeshingPipeline: Send + Sync {
    /// Builds the polygon mesh, returning an empty output when nothing is walkable.
    fn build(&self, input: &MeshingInput<'_>) -> Result<PolyMeshOutput>;

    /// Human readable name for logs
    fn name(&self) -> &str;
}

/// Reference pipeline: every walkable source triangle whose centroid falls inside the
/// tile becomes one polygon.
///
/// Vertices are welded on exact position so shared edges become internal neighbours.
/// Slope is the only walkability test; clearance and climb are not evaluated.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkableTriangleMesher;

impl WalkableTriangleMesher {
    pub fn new() -> Self {
        Self
    }
}

impl MeshingPipeline for WalkableTriangleMesher {
    fn build(&self, input: &MeshingInput<'_>) -> Result<PolyMeshOutput> {
        let walkable_thr = deg_to_rad(input.config.walkable_slope_angle).cos();
        let tile = &input.tile_bounds;

        let mut out = PolyMeshOutput::default();
        let mut welded: HashMap<[u32; 3], u16> = HashMap::new();

        for &tri in input.triangles {
            let [a, b, c] = input.mesh.triangle(tri as usize);
            let normal = triangle_normal(a, b, c);
            if normal == Vec3::ZERO || normal.y.abs() < walkable_thr {
                continue;
            }

            let area = tri_area_2d(a, b, c);
            if area.abs() <= f32::EPSILON {
                continue;
            }

            // Half-open ownership so a triangle is meshed by exactly one tile
            let centroid = (a + b + c) / 3.0;
            if centroid.x < tile.min.x
                || centroid.x >= tile.max.x
                || centroid.z < tile.min.z
                || centroid.z >= tile.max.z
            {
                continue;
            }

            // Consistent winding: positive 2D area
            let corners = if area > 0.0 { [a, b, c] } else { [a, c, b] };

            let mut verts = Vec::with_capacity(3);
            for v in corners {
                let key = [v.x.to_bits(), v.y.to_bits(), v.z.to_bits()];
                let idx = match welded.get(&key) {
                    Some(&idx) => idx,
                    None => {
                        let idx = u16::try_from(out.verts.len()).map_err(|_| {
                            Error::InvalidMesh("tile exceeds 65535 vertices".to_string())
                        })?;
                        out.verts.push(v);
                        welded.insert(key, idx);
                        idx
                    }
                };
                verts.push(idx);
            }

            let poly = u16::try_from(out.polys.len())
                .map_err(|_| Error::InvalidMesh("tile exceeds 65535 polygons".to_string()))?;
            out.detail.push(DetailTriangle {
                poly,
                verts: corners,
            });
            out.polys.push(MeshPoly {
                neighbors: vec![None; verts.len()],
                verts,
                area: nav_area::GROUND,
                flags: POLY_FLAG_WALK,
            });
        }

        connect_internal_edges(&mut out.polys);
        Ok(out)
    }

    fn name(&self) -> &str {
        "walkable-triangle"
    }
}

/// Links polygons sharing an edge. Edges used by more than two polygons stay open.
fn connect_internal_edges(polys: &mut [MeshPoly]) {
    let mut edges: HashMap<(u16, u16), Vec<(u16, usize)>> = HashMap::new();
    for (pi, poly) in polys.iter().enumerate() {
        let n = poly.verts.len();
        for e in 0..n {
            let va = poly.verts[e];
            let vb = poly.verts[(e + 1) % n];
            let key = (va.min(vb), va.max(vb));
            edges.entry(key).or_default().push((pi as u16, e));
        }
    }

    for users in edges.values() {
        if let [(pa, ea), (pb, eb)] = users.as_slice() {
            if pa != pb {
                polys[*pa as usize].neighbors[*ea] = Some(*pb);
                polys[*pb as usize].neighbors[*eb] = Some(*pa);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::{flat_grid, meshing_config};

    fn build_all(mesh: &TriMesh, tile_bounds: Bounds) -> PolyMeshOutput {
        let config = meshing_config();
        let triangles: Vec<u32> = (0..mesh.tri_count() as u32).collect();
        let input = MeshingInput {
            mesh,
            triangles: &triangles,
            bounds: tile_bounds,
            tile_bounds,
            config: &config,
            connectors: &[],
        };
        WalkableTriangleMesher::new().build(&input).unwrap()
    }

    #[test]
    fn test_flat_quad_becomes_two_connected_polys() {
        let mesh = flat_grid(Vec3::ZERO, 1, 1, 4.0);
        let out = build_all(&mesh, mesh.calculate_bounds().expanded_xz(0.1));

        assert_eq!(out.polys.len(), 2);
        assert_eq!(out.verts.len(), 4);
        assert_eq!(out.detail.len(), 2);
        let linked: usize = out
            .polys
            .iter()
            .map(|p| p.neighbors.iter().flatten().count())
            .sum();
        assert_eq!(linked, 2);
    }

    #[test]
    fn test_steep_triangles_are_dropped() {
        let mut mesh = TriMesh::new();
        let a = mesh.push_vertex(Vec3::new(0.0, 0.0, 0.0));
        let b = mesh.push_vertex(Vec3::new(0.0, 5.0, 0.0));
        let c = mesh.push_vertex(Vec3::new(0.0, 0.0, 5.0));
        mesh.push_triangle(a, b, c);

        let out = build_all(&mesh, Bounds::new(Vec3::splat(-10.0), Vec3::splat(10.0)));
        assert!(out.is_empty());
    }

    #[test]
    fn test_only_owned_centroids_are_meshed() {
        let mesh = flat_grid(Vec3::ZERO, 4, 1, 2.0);
        // Covers the first two columns of quads
        let tile = Bounds::new(Vec3::new(0.0, -1.0, 0.0), Vec3::new(4.0, 1.0, 2.0));
        let out = build_all(&mesh, tile);
        assert_eq!(out.polys.len(), 4);
    }

    #[test]
    fn test_winding_is_normalized() {
        let mesh = flat_grid(Vec3::ZERO, 2, 2, 1.0);
        let out = build_all(&mesh, mesh.calculate_bounds().expanded_xz(0.1));
        for poly in &out.polys {
            let v: Vec<Vec3> = poly.verts.iter().map(|&i| out.verts[i as usize]).collect();
            assert!(tri_area_2d(v[0], v[1], v[2]) > 0.0);
        }
    }
}
