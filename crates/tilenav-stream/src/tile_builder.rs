//! Per-tile navmesh generation from the cached world geometry

use std::collections::HashMap;
use std::sync::Arc;

use glam::Vec3;
use tilenav_common::{
    closest_height_on_triangle, fnv_fold, Bounds, Error, Fnv1a64, Result, TriMesh, FNV_SEED,
};
use tilenav_mesh::{
    tile_key, ConnectorSegment, MeshingConfig, MeshingInput, MeshingPipeline, PolyMeshOutput,
    TileData,
};

use crate::config::{BuildMode, GenerationSettings};
use crate::grid::TileGrid;
use crate::offmesh::OffmeshLink;

/// First id handed to links that carry user id 0
const FIRST_SEQUENTIAL_LINK_ID: u32 = 1000;

/// A serialized tile ready for the container
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltTile {
    pub tx: i32,
    pub ty: i32,
    pub blob: Vec<u8>,
    pub content_hash: u64,
    pub poly_count: u32,
}

/// Result of building one tile
#[derive(Debug, Clone, PartialEq)]
pub enum TileBuildOutcome {
    Built(BuiltTile),
    /// Nothing walkable in the tile
    Empty { tx: i32, ty: i32, content_hash: u64 },
}

impl TileBuildOutcome {
    pub fn content_hash(&self) -> u64 {
        match self {
            TileBuildOutcome::Built(tile) => tile.content_hash,
            TileBuildOutcome::Empty { content_hash, .. } => *content_hash,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, TileBuildOutcome::Empty { .. })
    }
}

/// Builds tiles of one grid from a cached copy of the combined world geometry.
///
/// Cloning is cheap: geometry and the meshing pipeline are shared.
#[derive(Clone)]
pub struct TileBuilder {
    settings: GenerationSettings,
    grid: TileGrid,
    meshing: MeshingConfig,
    pipeline: Arc<dyn MeshingPipeline>,
    geometry: Arc<TriMesh>,
    geometry_bounds: Bounds,
    /// Candidate triangles per tile, ascending
    buckets: Arc<HashMap<u64, Vec<u32>>>,
    links: Arc<Vec<OffmeshLink>>,
    settings_hash: u64,
}

impl std::fmt::Debug for TileBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileBuilder")
            .field("pipeline", &self.pipeline.name())
            .field("grid", &self.grid)
            .field("triangles", &self.geometry.tri_count())
            .field("links", &self.links.len())
            .finish()
    }
}

impl TileBuilder {
    pub fn new(
        settings: GenerationSettings,
        grid: TileGrid,
        pipeline: Arc<dyn MeshingPipeline>,
    ) -> Self {
        let settings_hash = hash_settings(&settings);
        Self {
            meshing: settings.to_meshing_config(),
            settings,
            grid,
            pipeline,
            geometry: Arc::new(TriMesh::new()),
            geometry_bounds: Bounds::default(),
            buckets: Arc::new(HashMap::new()),
            links: Arc::new(Vec::new()),
            settings_hash,
        }
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn geometry(&self) -> &Arc<TriMesh> {
        &self.geometry
    }

    pub fn has_geometry(&self) -> bool {
        !self.geometry.is_empty()
    }

    pub fn links(&self) -> &[OffmeshLink] {
        &self.links
    }

    /// Replaces the cached world geometry and re-indexes triangles per tile.
    pub fn update_cached_geometry(&mut self, geometry: Arc<TriMesh>) {
        // Slightly wider than the skirt so tiles touching a triangle exactly are found
        let reach = self.border_world() + self.grid.tile_width * 1e-3;
        let mut buckets: HashMap<u64, Vec<u32>> = HashMap::new();
        for t in 0..geometry.tri_count() {
            let tri_bounds = geometry.triangle_bounds(t).expanded_xz(reach);
            for (tx, ty) in self.grid.tiles_in_bounds(&tri_bounds) {
                buckets.entry(tile_key(tx, ty)).or_default().push(t as u32);
            }
        }
        self.geometry_bounds = geometry.calculate_bounds();
        self.geometry = geometry;
        self.buckets = Arc::new(buckets);
        log::debug!(
            "Cached {} triangles over {} tiles",
            self.geometry.tri_count(),
            self.buckets.len()
        );
    }

    /// Replaces the link list, resolving each link's owning tile from its start point.
    pub fn set_links(&mut self, links: &[OffmeshLink]) {
        let resolved = links
            .iter()
            .map(|link| {
                let mut link = link.clone();
                link.owner = self.grid.tile_of(link.start);
                link
            })
            .collect();
        self.links = Arc::new(resolved);
    }

    fn border_world(&self) -> f32 {
        self.settings.border_size_cells() as f32 * self.settings.cell_size
    }

    /// Tile core rectangle with the Y range of the whole geometry.
    fn tile_core_bounds(&self, tx: i32, ty: i32) -> Bounds {
        let mut core = self.grid.tile_bounds(tx, ty);
        if self.has_geometry() {
            core.min.y = core.min.y.min(self.geometry_bounds.min.y);
            core.max.y = core.max.y.max(self.geometry_bounds.max.y);
        }
        core
    }

    /// Tile rectangle grown by the border skirt.
    pub fn tile_build_bounds(&self, tx: i32, ty: i32) -> Bounds {
        self.tile_core_bounds(tx, ty).expanded_xz(self.border_world())
    }

    /// Source triangles overlapping the tile's build bounds, ascending.
    pub fn collect_tile_triangles(&self, tx: i32, ty: i32) -> Vec<u32> {
        let Some(candidates) = self.buckets.get(&tile_key(tx, ty)) else {
            return Vec::new();
        };
        let build_bounds = self.tile_build_bounds(tx, ty);
        candidates
            .iter()
            .copied()
            .filter(|&t| self.geometry.triangle_bounds(t as usize).overlaps_xz(&build_bounds))
            .collect()
    }

    /// Links owned by `(tx, ty)` as connector segments, in list order.
    fn owned_connectors(&self, tx: i32, ty: i32) -> Vec<ConnectorSegment> {
        self.links
            .iter()
            .enumerate()
            .filter(|(_, link)| link.owner == (tx, ty))
            .map(|(index, link)| {
                let user_id = if link.user_id != 0 {
                    link.user_id
                } else {
                    FIRST_SEQUENTIAL_LINK_ID + index as u32
                };
                link.to_connector(user_id)
            })
            .collect()
    }

    /// Hash of everything the tile is built from.
    pub fn content_hash(&self, tx: i32, ty: i32) -> u64 {
        let triangles = self.collect_tile_triangles(tx, ty);
        let connectors = self.owned_connectors(tx, ty);
        self.hash_inputs(&triangles, &connectors)
    }

    fn hash_inputs(&self, triangles: &[u32], connectors: &[ConnectorSegment]) -> u64 {
        let mut used: Vec<u32> = triangles
            .iter()
            .flat_map(|&t| self.geometry.tri_indices(t as usize))
            .collect();
        used.sort_unstable();
        used.dedup();

        let mut verts = Fnv1a64::new();
        for &v in &used {
            let p = self.geometry.vertex(v as usize);
            verts.write_f32(p.x);
            verts.write_f32(p.y);
            verts.write_f32(p.z);
        }

        let mut indices = Fnv1a64::new();
        for &t in triangles {
            for v in self.geometry.tri_indices(t as usize) {
                let local = used.binary_search(&v).unwrap_or_default();
                indices.write_u32(local as u32);
            }
        }

        let mut links = Fnv1a64::new();
        for con in connectors {
            for p in [con.start, con.end] {
                links.write_f32(p.x);
                links.write_f32(p.y);
                links.write_f32(p.z);
            }
            links.write_f32(con.radius);
            links.write(&[con.bidirectional as u8, con.area]);
            links.write(&con.flags.to_le_bytes());
            links.write_u32(con.user_id);
        }

        let mut hash = fnv_fold(FNV_SEED, verts.finish());
        hash = fnv_fold(hash, indices.finish());
        hash = fnv_fold(hash, links.finish());
        fnv_fold(hash, self.settings_hash)
    }

    /// Builds tile `(tx, ty)`.
    pub fn build_tile(&self, tx: i32, ty: i32) -> Result<TileBuildOutcome> {
        if !self.grid.contains_tile(tx, ty) {
            return Err(Error::TileBuild {
                tx,
                ty,
                reason: "tile lies outside the grid".to_string(),
            });
        }

        let triangles = self.collect_tile_triangles(tx, ty);
        let mut connectors = self.owned_connectors(tx, ty);
        let content_hash = self.hash_inputs(&triangles, &connectors);
        if triangles.is_empty() {
            return Ok(TileBuildOutcome::Empty {
                tx,
                ty,
                content_hash,
            });
        }

        let core = self.tile_core_bounds(tx, ty);
        let input = MeshingInput {
            mesh: &self.geometry,
            triangles: &triangles,
            bounds: core.expanded_xz(self.border_world()),
            tile_bounds: core,
            config: &self.meshing,
            connectors: &connectors,
        };
        let mesh = self.pipeline.build(&input).map_err(|e| Error::TileBuild {
            tx,
            ty,
            reason: e.to_string(),
        })?;
        if mesh.is_empty() {
            return Ok(TileBuildOutcome::Empty {
                tx,
                ty,
                content_hash,
            });
        }

        for con in &mut connectors {
            if let Some(h) = surface_height(&mesh, con.start) {
                con.start.y = h;
            }
        }

        let poly_count = (mesh.polys.len() + connectors.len()) as u32;
        if poly_count > self.grid.max_polys() {
            return Err(Error::TileBuild {
                tx,
                ty,
                reason: format!(
                    "{poly_count} polygons exceed the limit of {}",
                    self.grid.max_polys()
                ),
            });
        }

        let data = TileData::from_mesh_output(
            tx,
            ty,
            &mesh,
            &connectors,
            core,
            self.settings.agent_info(),
        )
        .map_err(|e| Error::TileBuild {
            tx,
            ty,
            reason: e.to_string(),
        })?;
        let blob = data.to_bytes()?;

        log::debug!(
            "Built tile ({tx}, {ty}): {} triangles, {poly_count} polygons, {} links",
            triangles.len(),
            connectors.len()
        );

        Ok(TileBuildOutcome::Built(BuiltTile {
            tx,
            ty,
            blob,
            content_hash,
            poly_count,
        }))
    }
}

/// Detail surface height under `pos` closest to its current height.
fn surface_height(mesh: &PolyMeshOutput, pos: Vec3) -> Option<f32> {
    mesh.detail
        .iter()
        .filter_map(|tri| closest_height_on_triangle(pos, tri.verts[0], tri.verts[1], tri.verts[2]))
        .min_by(|a, b| (a - pos.y).abs().total_cmp(&(b - pos.y).abs()))
}

fn hash_settings(settings: &GenerationSettings) -> u64 {
    let mut h = Fnv1a64::new();
    h.write(&[match settings.mode {
        BuildMode::SingleMesh => 0,
        BuildMode::Tiled => 1,
    }]);
    for v in [
        settings.cell_size,
        settings.cell_height,
        settings.agent_height,
        settings.agent_radius,
        settings.agent_max_climb,
        settings.agent_max_slope,
        settings.region_min_size,
        settings.region_merge_size,
        settings.edge_max_len,
        settings.edge_max_error,
        settings.detail_sample_dist,
        settings.detail_sample_max_error,
    ] {
        h.write_f32(v);
    }
    h.write_u32(settings.verts_per_poly as u32);
    h.write_u32(settings.tile_size as u32);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{flat_floor, tiled_builder};
    use tilenav_mesh::WalkableTriangleMesher;

    #[test]
    fn test_empty_tile_without_triangles() -> Result<()> {
        let builder = tiled_builder(flat_floor(Vec3::ZERO, 8.0, 8.0), 10.0, 40.0);
        // Floor covers tile (0, 0) only; (3, 3) is far from it.
        assert!(builder.build_tile(3, 3)?.is_empty());
        assert!(builder.collect_tile_triangles(3, 3).is_empty());
        Ok(())
    }

    #[test]
    fn test_border_skirt_selects_neighbour_triangles() {
        let builder = tiled_builder(flat_floor(Vec3::ZERO, 20.0, 20.0), 10.0, 40.0);
        let own = builder.collect_tile_triangles(0, 0);
        let all: Vec<u32> = (0..builder.geometry().tri_count() as u32).collect();
        // A 2 unit skirt reaches two cells past each tile edge
        assert_eq!(own.len(), 13 * 13 * 2);
        assert!(own.len() < all.len());
        let bounds = builder.tile_build_bounds(0, 0);
        assert!((bounds.max.x - 12.0).abs() < 1e-4);
        assert!((bounds.min.x + 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_build_is_deterministic() -> Result<()> {
        let builder = tiled_builder(flat_floor(Vec3::ZERO, 20.0, 20.0), 10.0, 40.0);
        let a = builder.build_tile(1, 0)?;
        let b = builder.build_tile(1, 0)?;
        assert_eq!(a, b);
        let TileBuildOutcome::Built(tile) = a else {
            panic!("expected a built tile");
        };
        assert_eq!(tile.poly_count, 200);
        assert_eq!(tile.content_hash, builder.content_hash(1, 0));
        Ok(())
    }

    #[test]
    fn test_hash_tracks_geometry_and_links() {
        let mut builder = tiled_builder(flat_floor(Vec3::ZERO, 20.0, 20.0), 10.0, 40.0);
        let before = builder.content_hash(0, 0);
        let other = builder.content_hash(1, 1);

        builder.set_links(&[OffmeshLink::new(
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(4.0, 0.0, 2.0),
            true,
        )]);
        assert_ne!(builder.content_hash(0, 0), before);
        assert_eq!(builder.content_hash(1, 1), other);

        builder.update_cached_geometry(Arc::new(flat_floor(Vec3::new(0.0, 1.0, 0.0), 20.0, 20.0)));
        assert_ne!(builder.content_hash(1, 1), other);
    }

    #[test]
    fn test_hash_ignores_global_vertex_offsets() {
        let floor = flat_floor(Vec3::ZERO, 20.0, 20.0);
        let a = tiled_builder(floor.clone(), 10.0, 40.0);

        // Same geometry preceded by an unrelated far away triangle
        let mut shifted = TriMesh::new();
        let p = shifted.push_vertex(Vec3::new(35.0, 0.0, 35.0));
        let q = shifted.push_vertex(Vec3::new(36.0, 0.0, 35.0));
        let r = shifted.push_vertex(Vec3::new(35.0, 0.0, 36.0));
        shifted.push_triangle(p, r, q);
        shifted.append_transformed(&floor, |v| v);
        let b = tiled_builder(shifted, 10.0, 40.0);

        assert_eq!(a.content_hash(0, 0), b.content_hash(0, 0));
    }

    #[test]
    fn test_link_start_is_snapped_and_numbered() -> Result<()> {
        let mut builder = tiled_builder(flat_floor(Vec3::ZERO, 20.0, 20.0), 10.0, 40.0);
        builder.set_links(&[OffmeshLink::new(
            Vec3::new(2.0, 0.4, 2.0),
            Vec3::new(14.0, 0.0, 2.0),
            false,
        )]);

        let TileBuildOutcome::Built(tile) = builder.build_tile(0, 0)? else {
            panic!("expected a built tile");
        };
        let data = TileData::from_bytes(&tile.blob)?;
        assert_eq!(data.off_mesh_cons.len(), 1);
        let con = &data.off_mesh_cons[0];
        assert!(con.start.y.abs() < 1e-5);
        assert_eq!(con.user_id, FIRST_SEQUENTIAL_LINK_ID);
        assert!(!con.is_bidirectional());

        // The end tile does not own the link
        let TileBuildOutcome::Built(end_tile) = builder.build_tile(1, 0)? else {
            panic!("expected a built tile");
        };
        assert!(TileData::from_bytes(&end_tile.blob)?.off_mesh_cons.is_empty());
        Ok(())
    }

    #[test]
    fn test_poly_limit_is_an_error() -> Result<()> {
        let settings = crate::test_helpers::tiled_settings(10.0);
        let mut grid = crate::TileGridPlanner::plan(
            &settings,
            Bounds::new(Vec3::new(0.0, -5.0, 0.0), Vec3::new(40.0, 5.0, 40.0)),
        )?;
        grid.poly_bits = 4;
        let mut builder = TileBuilder::new(settings, grid, Arc::new(WalkableTriangleMesher::new()));
        builder.update_cached_geometry(Arc::new(flat_floor(Vec3::ZERO, 20.0, 20.0)));

        let err = builder.build_tile(0, 0).unwrap_err();
        assert!(matches!(err, Error::TileBuild { tx: 0, ty: 0, .. }));
        Ok(())
    }

    #[test]
    fn test_outside_grid_is_an_error() {
        let builder = tiled_builder(flat_floor(Vec3::ZERO, 20.0, 20.0), 10.0, 40.0);
        assert!(builder.build_tile(-1, 0).is_err());
        assert!(builder.build_tile(4, 0).is_err());
    }
}
