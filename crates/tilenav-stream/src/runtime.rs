//! Runtime façade
//!
//! [`NavRuntime`] owns the geometry instances, the offmesh link list and one grid session
//! (grid, tile builder and live container). Every mutating call happens on the caller's
//! thread; only full builds submitted with [`NavRuntime::build_async`] run elsewhere, and
//! their result is swapped in by [`NavRuntime::poll_build`].

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::Vec3;
use tilenav_common::{Bounds, Error, Result, TriMesh};
use tilenav_mesh::{MeshingPipeline, NavMesh, StraightPathPoint, WalkableTriangleMesher};

use crate::config::{
    AutoOffmeshParams, GenerationSettings, IslandLinkParams, PathQueryConfig, RuntimeConfig,
};
use crate::container::NavMeshContainer;
use crate::dirty::{DirtyBoundsEvent, DirtyTracker, RebuildReport};
use crate::geometry_set::{GeometryInstance, GeometrySet};
use crate::grid::{TileGrid, TileGridPlanner};
use crate::offmesh::{self, OffmeshLink, OffmeshLinkGenerator};
use crate::path_query::PathQuery;
use crate::raycast::RaycastMesh;
use crate::residency::{ResidencyManager, StoreThenBuild, TouchReport};
use crate::snapshot::{RuntimeSnapshot, SnapshotInstance};
use crate::tile_builder::{TileBuildOutcome, TileBuilder};
use crate::tile_store::{
    read_tile_db_index, read_tile_payload, write_tile_db, GridParamsBlob, TileCacheStore,
};
use crate::tiled_build::{build_all_tiles, TiledBuildReport};
use crate::worker::{BuildJob, BuildResult, BuildWorker, CancellationToken};

/// Grid, builder and live tiles of one session
struct Session {
    grid: TileGrid,
    builder: TileBuilder,
    container: NavMeshContainer,
}

/// Counters describing the runtime at a glance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub instances: usize,
    pub links: usize,
    pub tiles: usize,
    pub resident_tiles: usize,
    pub pending_dirty: usize,
    pub building: bool,
}

/// Keeps a tiled navigation mesh in step with a set of named geometry instances.
pub struct NavRuntime {
    config: RuntimeConfig,
    pipeline: Arc<dyn MeshingPipeline>,
    geometry: GeometrySet,
    links: Vec<OffmeshLink>,
    session: Option<Session>,
    dirty: DirtyTracker,
    residency: ResidencyManager,
    worker: BuildWorker,
    store: Option<TileCacheStore>,
    /// Bumped on every instance edit
    geometry_revision: u64,
    /// Revision the builder's cached geometry was combined from
    cached_revision: Option<u64>,
    /// Revision the most recent background build was submitted with
    submitted_revision: u64,
    /// Background results up to this generation belong to an earlier grid
    stale_through: u64,
    raycast: Option<(Arc<TriMesh>, RaycastMesh)>,
}

impl std::fmt::Debug for NavRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavRuntime")
            .field("pipeline", &self.pipeline.name())
            .field("grid", &self.grid())
            .field("stats", &self.stats())
            .finish()
    }
}

fn no_grid() -> Error {
    Error::Config("navigation grid not initialized".to_string())
}

impl NavRuntime {
    /// Runtime using the built-in [`WalkableTriangleMesher`].
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_pipeline(config, Arc::new(WalkableTriangleMesher::new()))
    }

    pub fn with_pipeline(config: RuntimeConfig, pipeline: Arc<dyn MeshingPipeline>) -> Self {
        Self {
            residency: ResidencyManager::new(config.streaming.max_resident_tiles),
            store: config.store_path.clone().map(TileCacheStore::new),
            config,
            pipeline,
            geometry: GeometrySet::new(),
            links: Vec::new(),
            session: None,
            dirty: DirtyTracker::new(),
            worker: BuildWorker::new(),
            geometry_revision: 0,
            cached_revision: None,
            submitted_revision: 0,
            stale_through: 0,
            raycast: None,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.config.settings
    }

    pub fn grid(&self) -> Option<&TileGrid> {
        self.session.as_ref().map(|s| &s.grid)
    }

    pub fn container(&self) -> Option<&NavMeshContainer> {
        self.session.as_ref().map(|s| &s.container)
    }

    pub fn nav_mesh(&self) -> Option<&NavMesh> {
        self.container().map(NavMeshContainer::nav_mesh)
    }

    pub fn geometry(&self) -> &GeometrySet {
        &self.geometry
    }

    pub fn residency(&self) -> &ResidencyManager {
        &self.residency
    }

    pub fn store(&self) -> Option<&TileCacheStore> {
        self.store.as_ref()
    }

    /// Dirty regions queued for the next [`NavRuntime::rebuild_dirty`].
    pub fn pending_dirty(&self) -> &[DirtyBoundsEvent] {
        self.dirty.pending()
    }

    pub fn is_building(&self) -> bool {
        self.worker.is_busy()
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            instances: self.geometry.len(),
            links: self.links.len(),
            tiles: self.container().map_or(0, NavMeshContainer::tile_count),
            resident_tiles: self.residency.resident_count(),
            pending_dirty: self.dirty.pending().len(),
            building: self.worker.is_busy(),
        }
    }

    pub fn set_auto_offmesh_params(&mut self, params: AutoOffmeshParams) -> Result<()> {
        params.validate().map_err(Error::Config)?;
        self.config.auto_offmesh = params;
        Ok(())
    }

    pub fn set_island_link_params(&mut self, params: IslandLinkParams) -> Result<()> {
        params.validate().map_err(Error::Config)?;
        self.config.island_links = params;
        Ok(())
    }

    pub fn set_path_query_config(&mut self, config: PathQueryConfig) {
        self.config.path_query = config;
    }

    pub fn set_max_resident_tiles(&mut self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(Error::Config(
                "Max resident tiles must be at least one".to_string(),
            ));
        }
        self.config.streaming.max_resident_tiles = max;
        self.residency.set_max_resident(max);
        Ok(())
    }

    /// Changes the clip box applied when instances are combined. Takes effect on the next
    /// build; tiles already built keep their geometry until rebuilt.
    pub fn set_build_bounds(&mut self, bounds: Option<Bounds>) -> Result<()> {
        if bounds.is_some_and(|b| !b.is_valid()) {
            return Err(Error::Config(
                "Build bounds invalid: min must not exceed max".to_string(),
            ));
        }
        self.config.build_bounds = bounds;
        self.cached_revision = None;
        Ok(())
    }

    /// Starts a grid session over `world_bounds`.
    ///
    /// Any previous session is dropped along with its tiles; a background build still
    /// running for it is cancelled and its result discarded.
    pub fn init_grid(&mut self, world_bounds: Bounds) -> Result<()> {
        self.config.validate().map_err(Error::Config)?;
        let grid = TileGridPlanner::plan(&self.config.settings, world_bounds)?;
        let container = NavMeshContainer::new(grid.nav_params())?;
        let mut builder = TileBuilder::new(self.config.settings.clone(), grid, self.pipeline.clone());
        builder.set_links(&self.links);

        self.worker.cancel();
        self.stale_through = self.worker.latest_generation();
        self.dirty.reset();
        self.residency = ResidencyManager::new(self.config.streaming.max_resident_tiles);
        self.cached_revision = None;
        self.raycast = None;
        self.session = Some(Session {
            grid,
            builder,
            container,
        });

        log::info!(
            "Grid session: {}x{} tiles of {:.2} units over {:?}",
            grid.tile_count_x,
            grid.tile_count_y,
            grid.tile_width,
            world_bounds
        );
        Ok(())
    }

    /// Starts a grid session over the current instances' bounds grown by `margin`.
    pub fn init_grid_from_geometry(&mut self, margin: f32) -> Result<()> {
        let bounds = self
            .geometry
            .world_bounds()
            .ok_or_else(|| Error::Config("no geometry to derive world bounds from".to_string()))?;
        let pad = Vec3::splat(margin.max(0.0));
        self.init_grid(Bounds::new(bounds.min - pad, bounds.max + pad))
    }

    /// Ends the session, freeing every tile.
    pub fn shutdown(&mut self) {
        self.worker.cancel();
        self.stale_through = self.worker.latest_generation();
        if let Some(session) = self.session.as_mut() {
            self.residency.clear_all(&mut session.container);
        }
        self.session = None;
        self.dirty.reset();
        self.cached_revision = None;
        self.raycast = None;
    }

    /// Adds or replaces instance `id`. Tiles are updated by the next rebuild.
    pub fn add_instance(
        &mut self,
        id: impl Into<String>,
        mesh: Arc<TriMesh>,
        position: Vec3,
        rotation: Vec3,
    ) -> Result<()> {
        let instance = GeometryInstance::new(id, mesh, position, rotation)?;
        let bounds = instance.world_bounds();
        if let Some(old) = self.geometry.insert(instance) {
            // A replacement may reuse the old buffer's address and shape
            self.dirty.mark_dirty(old.world_bounds().union(&bounds));
        }
        self.geometry_revision += 1;
        Ok(())
    }

    pub fn update_instance(&mut self, id: &str, position: Vec3, rotation: Vec3) -> Result<()> {
        self.geometry.update_transform(id, position, rotation)?;
        self.geometry_revision += 1;
        Ok(())
    }

    /// Removes instance `id`. Returns whether it existed.
    pub fn remove_instance(&mut self, id: &str) -> bool {
        let removed = self.geometry.remove(id).is_some();
        if removed {
            self.geometry_revision += 1;
        }
        removed
    }

    /// Recombines instances into the builder when they changed since the last combine.
    fn refresh_cached_geometry(&mut self) -> Result<()> {
        let revision = self.geometry_revision;
        let stale = self.cached_revision != Some(revision);
        let combined = stale.then(|| self.geometry.combine(self.config.build_bounds.as_ref()));
        let session = self.session.as_mut().ok_or_else(no_grid)?;
        if let Some(combined) = combined {
            session.builder.update_cached_geometry(Arc::new(combined));
            self.cached_revision = Some(revision);
        }
        Ok(())
    }

    /// Builds every tile of the grid, reusing matching tiles from the store.
    pub fn build_all(&mut self) -> Result<TiledBuildReport> {
        self.build_all_with(&CancellationToken::new())
    }

    /// [`NavRuntime::build_all`] with an external cancellation token.
    ///
    /// Tiles are built into a fresh container that replaces the live one only on success;
    /// a cancelled or failed build leaves the live tiles untouched.
    pub fn build_all_with(&mut self, cancel: &CancellationToken) -> Result<TiledBuildReport> {
        self.refresh_cached_geometry()?;
        let session = self.session.as_mut().ok_or_else(no_grid)?;
        let params = session.grid.nav_params();
        let tiles: Vec<_> = session.grid.all_tiles().collect();

        let mut container = NavMeshContainer::new(params)?;
        let mut source = StoreThenBuild::new(self.store.as_mut(), &session.builder, &params);
        let report = build_all_tiles(&mut source, &mut container, &tiles, cancel)?;

        session.container = container;
        self.dirty.sync(&self.geometry);
        self.residency.reconcile(&session.container);
        Ok(report)
    }

    /// Submits a full build to the background worker.
    ///
    /// Returns the build generation, or `None` when the request was coalesced behind a
    /// running build.
    pub fn build_async(&mut self) -> Result<Option<u64>> {
        self.refresh_cached_geometry()?;
        let session = self.session.as_ref().ok_or_else(no_grid)?;
        let job = BuildJob {
            builder: session.builder.clone(),
            params: session.grid.nav_params(),
            tiles: session.grid.all_tiles().collect(),
            store_path: self.store.as_ref().map(|s| s.path().to_path_buf()),
        };
        let generation = self.worker.submit(job)?;
        self.submitted_revision = self.geometry_revision;
        self.dirty.sync(&self.geometry);
        Ok(generation)
    }

    /// Collects a finished background build, swapping its container in.
    ///
    /// `None` while nothing has finished. Results of builds started for an earlier grid
    /// are dropped.
    pub fn poll_build(&mut self) -> Option<Result<TiledBuildReport>> {
        let result = self.worker.poll()?;
        self.accept_build(result)
    }

    /// Blocks until the running background build finishes.
    pub fn wait_build(&mut self) -> Option<Result<TiledBuildReport>> {
        let result = self.worker.wait()?;
        self.accept_build(result)
    }

    /// Cancels the running background build; it publishes nothing.
    pub fn cancel_build(&mut self) {
        self.worker.cancel();
    }

    fn accept_build(&mut self, result: BuildResult) -> Option<Result<TiledBuildReport>> {
        if result.generation() <= self.stale_through {
            log::debug!("Dropping build {} from an earlier grid", result.generation());
            return None;
        }
        match result {
            BuildResult::Finished {
                generation,
                container,
                report,
            } => {
                let session = self.session.as_mut()?;
                session.container = container;
                self.residency.reconcile(&session.container);
                if self.geometry_revision != self.submitted_revision {
                    // Fingerprints date from submit; the next scan picks these edits up
                    log::debug!("Instances changed during build {generation}");
                }
                log::info!("Swapped in background build {generation}");
                Some(Ok(report))
            }
            BuildResult::Cancelled { generation } => {
                log::info!("Background build {generation} cancelled");
                self.mark_grid_dirty();
                Some(Err(Error::Cancelled))
            }
            BuildResult::Failed { generation, error } => {
                log::warn!("Background build {generation} failed: {error}");
                self.mark_grid_dirty();
                Some(Err(error))
            }
        }
    }

    /// The live tiles predate a sync that never published, so every tile is suspect.
    fn mark_grid_dirty(&mut self) {
        if let Some(session) = self.session.as_ref() {
            self.dirty.mark_dirty(session.grid.bounds);
        }
    }

    /// Rebuilds only the tiles under geometry or links that changed since the last build.
    pub fn rebuild_dirty(&mut self) -> Result<RebuildReport> {
        self.rebuild_dirty_with(&CancellationToken::new())
    }

    pub fn rebuild_dirty_with(&mut self, cancel: &CancellationToken) -> Result<RebuildReport> {
        let revision = self.geometry_revision;
        let session = self.session.as_mut().ok_or_else(no_grid)?;
        let clip = self.config.build_bounds;
        let before = Arc::clone(session.builder.geometry());
        let report = self.dirty.rebuild_dirty(
            &self.geometry,
            &mut session.builder,
            &mut session.container,
            clip.as_ref(),
            cancel,
        )?;
        if !Arc::ptr_eq(&before, session.builder.geometry()) {
            self.cached_revision = Some(revision);
        }
        self.residency.reconcile(&session.container);
        Ok(report)
    }

    /// Builds or rebuilds the tile containing `pos`.
    pub fn build_single_tile(&mut self, pos: Vec3) -> Result<(i32, i32)> {
        self.refresh_cached_geometry()?;
        let session = self.session.as_mut().ok_or_else(no_grid)?;
        let (tx, ty) = session.grid.tile_of(pos);
        if !session.grid.contains_tile(tx, ty) {
            return Err(Error::TileBuild {
                tx,
                ty,
                reason: format!("{pos} lies outside the grid"),
            });
        }
        match session.builder.build_tile(tx, ty)? {
            TileBuildOutcome::Built(tile) => {
                session.container.add_or_replace(tile)?;
            }
            TileBuildOutcome::Empty { .. } => {
                session.container.remove(tx, ty);
            }
        }
        self.residency.reconcile(&session.container);
        Ok((tx, ty))
    }

    /// Removes tile `(tx, ty)` from the live mesh. Returns whether it was present.
    pub fn remove_tile(&mut self, tx: i32, ty: i32) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let removed = session.container.remove(tx, ty);
        self.residency.reconcile(&session.container);
        removed
    }

    /// Streams the tiles within `radius` of `center` in, from the store first and from
    /// geometry when allowed, evicting the least recently used beyond the cap.
    pub fn stream_around(&mut self, center: Vec3, radius: f32) -> Result<TouchReport> {
        let allow_build = self.config.streaming.allow_build;
        if allow_build {
            self.refresh_cached_geometry()?;
        }
        let session = self.session.as_mut().ok_or_else(no_grid)?;
        let params = session.grid.nav_params();
        let mut source = StoreThenBuild::new(self.store.as_mut(), &session.builder, &params);
        Ok(self.residency.touch_region(
            &mut session.container,
            &session.grid,
            &mut source,
            center,
            radius,
            allow_build,
        ))
    }

    /// Builds every tile overlapping `bounds`, then optionally rewrites the store with
    /// the full live tile set.
    pub fn bake_bounds(&mut self, bounds: Bounds, persist: bool) -> Result<TiledBuildReport> {
        if !bounds.is_valid() {
            return Err(Error::Config("bake bounds invalid: min must not exceed max".to_string()));
        }
        self.refresh_cached_geometry()?;
        let session = self.session.as_mut().ok_or_else(no_grid)?;
        let params = session.grid.nav_params();
        let tiles = session.grid.tiles_in_bounds(&bounds);

        let report = {
            let mut source = StoreThenBuild::new(self.store.as_mut(), &session.builder, &params);
            build_all_tiles(&mut source, &mut session.container, &tiles, &CancellationToken::new())?
        };
        self.residency.reconcile(&session.container);

        if persist {
            let store = self
                .store
                .as_mut()
                .ok_or_else(|| Error::Config("no tile store path configured".to_string()))?;
            store.save_container(&session.container)?;
        }
        Ok(report)
    }

    /// Drops every resident tile. Geometry, links and the store are kept.
    pub fn clear_resident(&mut self) {
        if let Some(session) = self.session.as_mut() {
            self.residency.clear_all(&mut session.container);
        }
    }

    /// Writes every live tile to the store. Returns the number written.
    pub fn save_store(&mut self) -> Result<usize> {
        let session = self.session.as_ref().ok_or_else(no_grid)?;
        let store = self
            .store
            .as_mut()
            .ok_or_else(|| Error::Config("no tile store path configured".to_string()))?;
        store.save_container(&session.container)
    }

    /// Switches to the store at `path`. Returns the number of compatible tiles it holds;
    /// an incompatible or unreadable store counts as empty.
    pub fn attach_store(&mut self, path: impl Into<PathBuf>) -> Result<usize> {
        let path = path.into();
        let mut store = TileCacheStore::new(&path);
        let count = match self.session.as_ref() {
            Some(session) => match store.load_index(session.container.params()) {
                Ok(true) => store.len(),
                Ok(false) => 0,
                Err(e) if e.is_configuration() => return Err(e),
                Err(e) => {
                    log::warn!("Store {} not usable: {e}", path.display());
                    0
                }
            },
            None => 0,
        };
        self.config.store_path = Some(path);
        self.store = Some(store);
        Ok(count)
    }

    /// Loads stored tiles overlapping `bounds` without building anything.
    pub fn load_stored_tiles(&mut self, bounds: Bounds) -> Result<usize> {
        let session = self.session.as_mut().ok_or_else(no_grid)?;
        let store = self
            .store
            .as_mut()
            .ok_or_else(|| Error::Config("no tile store path configured".to_string()))?;
        let loaded = store.load_tiles_in_bounds(&mut session.container, &session.grid, &bounds)?;
        self.residency.reconcile(&session.container);
        Ok(loaded)
    }

    pub fn links(&self) -> &[OffmeshLink] {
        &self.links
    }

    /// Adds a manual link; its owning tile is rebuilt by the next dirty rebuild.
    pub fn add_link(&mut self, link: OffmeshLink) {
        let mut links = self.links.clone();
        links.push(link);
        self.replace_links(links);
    }

    /// Removes the link with an endpoint nearest to `point`.
    pub fn remove_nearest_link(&mut self, point: Vec3) -> Option<OffmeshLink> {
        let mut links = self.links.clone();
        let removed = offmesh::remove_nearest_link(&mut links, point)?;
        self.replace_links(links);
        Some(removed)
    }

    pub fn clear_links(&mut self) {
        self.replace_links(Vec::new());
    }

    /// Installs `links` and queues the owner tiles of the old and new lists.
    fn replace_links(&mut self, links: Vec<OffmeshLink>) {
        if let Some(session) = self.session.as_mut() {
            // Sequential ids shift with list order, so every owner tile is affected
            for link in self.links.iter().chain(links.iter()) {
                let (tx, ty) = session.grid.tile_of(link.start);
                if session.grid.contains_tile(tx, ty) {
                    self.dirty.mark_dirty(session.grid.tile_bounds(tx, ty));
                }
            }
            session.builder.set_links(&links);
        }
        self.links = links;
    }

    /// Raycast copy of the builder's cached geometry, rebuilt when the cache changed.
    fn raycast_mesh(&mut self) -> Result<()> {
        self.refresh_cached_geometry()?;
        let session = self.session.as_ref().ok_or_else(no_grid)?;
        let geometry = session.builder.geometry();
        let fresh = self
            .raycast
            .as_ref()
            .is_some_and(|(cached, _)| Arc::ptr_eq(cached, geometry));
        if !fresh {
            self.raycast = Some((Arc::clone(geometry), RaycastMesh::new(geometry)));
        }
        Ok(())
    }

    /// Regenerates the automatic drop, jump and facing links over the live mesh and
    /// rebuilds the tiles whose links changed. Manual links are kept.
    ///
    /// Returns the number of generated links.
    pub fn generate_auto_links(&mut self) -> Result<usize> {
        let params = self.config.auto_offmesh.clone();
        params.validate().map_err(Error::Config)?;
        self.raycast_mesh()?;
        let generated = {
            let (session, raycast) = self.link_inputs()?;
            OffmeshLinkGenerator::new(session.container.nav_mesh(), raycast).generate(&params)
        };
        let count = generated.len();
        let merged = offmesh::replace_link_group(&self.links, generated, params.user_id_base);
        self.replace_links(merged);
        self.rebuild_dirty()?;
        Ok(count)
    }

    /// Links the island under `target` to nearby disconnected ground, replacing earlier
    /// island links. Returns the number of generated links.
    pub fn generate_island_links(&mut self, target: Vec3) -> Result<usize> {
        let params = self.config.island_links.clone();
        params.validate().map_err(Error::Config)?;
        self.raycast_mesh()?;
        let generated = {
            let (session, raycast) = self.link_inputs()?;
            OffmeshLinkGenerator::new(session.container.nav_mesh(), raycast)
                .generate_island_links(target, &params)
        };
        let count = generated.len();
        let merged = offmesh::replace_link_group(&self.links, generated, params.user_id_base);
        self.replace_links(merged);
        self.rebuild_dirty()?;
        Ok(count)
    }

    fn link_inputs(&self) -> Result<(&Session, &RaycastMesh)> {
        let session = self.session.as_ref().ok_or_else(no_grid)?;
        if session.container.is_empty() {
            return Err(Error::NavMesh("no tiles to generate links over".to_string()));
        }
        let (_, raycast) = self.raycast.as_ref().ok_or_else(no_grid)?;
        Ok((session, raycast))
    }

    /// Path query over the live tiles using the configured filter and simplification.
    pub fn path_query(&self) -> Result<PathQuery<'_>> {
        self.path_query_with(&self.config.path_query)
    }

    pub fn path_query_with<'a>(&'a self, config: &PathQueryConfig) -> Result<PathQuery<'a>> {
        let nav = self.nav_mesh().ok_or_else(no_grid)?;
        Ok(PathQuery::new(nav, &self.config.settings, config))
    }

    /// Path positions from `start` to `end`.
    pub fn find_path(&self, start: Vec3, end: Vec3) -> Result<Vec<Vec3>> {
        self.path_query()?.find_path(start, end)
    }

    pub fn find_straight_path(&self, start: Vec3, end: Vec3) -> Result<Vec<StraightPathPoint>> {
        self.path_query()?.find_straight_path(start, end)
    }

    /// Captures settings, instances, links and the live tiles.
    pub fn snapshot(&self) -> Result<RuntimeSnapshot> {
        let instances = self
            .geometry
            .iter()
            .map(|inst| SnapshotInstance {
                id: inst.id.clone(),
                position: inst.position(),
                rotation: inst.rotation(),
                source_bounds: inst.source().calculate_bounds(),
                mesh: TriMesh::clone(inst.source()),
            })
            .collect();

        let (world_bounds, tile_db) = match self.session.as_ref() {
            Some(session) => {
                let mut cursor = Cursor::new(Vec::new());
                if !session.container.is_empty() {
                    write_tile_db(
                        &mut cursor,
                        &GridParamsBlob::from(session.container.params()),
                        session.container.records(),
                    )?;
                }
                (Some(session.grid.bounds), cursor.into_inner())
            }
            None => (None, Vec::new()),
        };

        Ok(RuntimeSnapshot {
            settings: self.config.settings.clone(),
            world_bounds,
            build_bounds: self.config.build_bounds,
            instances,
            links: self.links.clone(),
            tile_db,
        })
    }

    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        self.snapshot()?.save(path)
    }

    /// Restores a snapshot, replacing instances, links and the grid session.
    ///
    /// Embedded tiles are attached directly when their grid parameters match the
    /// restored grid. An incompatible or corrupt tile database attaches nothing and
    /// leaves the whole grid dirty for the next rebuild. Returns the number of tiles
    /// attached.
    pub fn restore_snapshot(&mut self, snapshot: RuntimeSnapshot) -> Result<usize> {
        let mut geometry = GeometrySet::new();
        for inst in snapshot.instances {
            geometry.insert(GeometryInstance::new(
                inst.id,
                Arc::new(inst.mesh),
                inst.position,
                inst.rotation,
            )?);
        }

        self.config.settings = snapshot.settings;
        self.config.build_bounds = snapshot.build_bounds;
        self.geometry = geometry;
        self.geometry_revision += 1;
        self.links = snapshot.links;

        let Some(world_bounds) = snapshot.world_bounds else {
            self.shutdown();
            return Ok(0);
        };
        self.init_grid(world_bounds)?;
        self.refresh_cached_geometry()?;
        self.dirty.sync(&self.geometry);

        if snapshot.tile_db.is_empty() {
            return Ok(0);
        }
        match self.attach_snapshot_tiles(&snapshot.tile_db) {
            Ok(attached) => {
                log::info!("Attached {attached} snapshot tiles");
                Ok(attached)
            }
            Err(e) => {
                log::warn!("Snapshot tiles not attached: {e}");
                if let Some(session) = self.session.as_mut() {
                    session.container.clear();
                    self.residency.reconcile(&session.container);
                }
                self.mark_grid_dirty();
                Ok(0)
            }
        }
    }

    /// Attaches every tile of an embedded tile database; all or nothing on read errors.
    fn attach_snapshot_tiles(&mut self, tile_db: &[u8]) -> Result<usize> {
        let session = self.session.as_mut().ok_or_else(no_grid)?;
        let mut reader = Cursor::new(tile_db);
        let (stored, entries) = read_tile_db_index(&mut reader)?;
        stored.check_compatible(&GridParamsBlob::from(session.container.params()))?;

        let mut blobs = Vec::with_capacity(entries.len());
        for entry in &entries {
            blobs.push(read_tile_payload(&mut reader, 0, entry)?);
        }
        let mut attached = 0;
        let mut skipped = Vec::new();
        for (entry, blob) in entries.iter().zip(blobs) {
            match session.container.add_blob(entry.tx, entry.ty, blob, entry.content_hash) {
                Ok(_) => attached += 1,
                Err(e) => {
                    log::warn!("Snapshot tile ({}, {}) skipped: {e}", entry.tx, entry.ty);
                    skipped.push(session.grid.tile_bounds(entry.tx, entry.ty));
                }
            }
        }
        self.residency.reconcile(&session.container);
        for bounds in skipped {
            self.dirty.mark_dirty(bounds);
        }
        Ok(attached)
    }

    pub fn load_snapshot(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let snapshot = RuntimeSnapshot::load(path)?;
        self.restore_snapshot(snapshot)
    }
}
