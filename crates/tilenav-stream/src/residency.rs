//! Bounded working set of tiles around a moving focus

use std::collections::{HashMap, HashSet};

use byteorder::{ByteOrder, LittleEndian};
use glam::Vec3;
use tilenav_common::Result;
use tilenav_mesh::{tile_key, tile_key_coords, NavMeshParams};

use crate::container::NavMeshContainer;
use crate::grid::TileGrid;
use crate::tile_builder::{BuiltTile, TileBuildOutcome, TileBuilder};
use crate::tile_store::TileCacheStore;

/// Where tiles come from when they are not resident.
pub trait TileSource {
    /// Fetches a previously built tile, `None` when there is no usable copy.
    fn load(&mut self, tx: i32, ty: i32) -> Result<Option<BuiltTile>>;

    /// Builds a tile from geometry, `None` when the tile is empty.
    fn build(&mut self, tx: i32, ty: i32) -> Result<Option<BuiltTile>>;
}

/// Loads from a tile store first and falls back to the builder.
///
/// A stored tile is only trusted when its content hash matches the hash the builder
/// derives from the current geometry. Without cached geometry there is nothing to compare
/// against and the store is trusted as is.
pub struct StoreThenBuild<'a> {
    store: Option<&'a mut TileCacheStore>,
    builder: &'a TileBuilder,
}

impl<'a> StoreThenBuild<'a> {
    /// A store that cannot be read or does not match `live` is ignored.
    pub fn new(
        store: Option<&'a mut TileCacheStore>,
        builder: &'a TileBuilder,
        live: &NavMeshParams,
    ) -> Self {
        let store = store.and_then(|store| match store.load_index(live) {
            Ok(_) if store.is_loaded() => Some(store),
            Ok(_) => None,
            Err(_) => None,
        });
        Self { store, builder }
    }
}

impl TileSource for StoreThenBuild<'_> {
    fn load(&mut self, tx: i32, ty: i32) -> Result<Option<BuiltTile>> {
        let Some(store) = self.store.as_deref() else {
            return Ok(None);
        };
        let Some((blob, content_hash)) = store.read_tile(tx, ty)? else {
            return Ok(None);
        };
        if self.builder.has_geometry() && content_hash != self.builder.content_hash(tx, ty) {
            log::debug!("Stored tile ({tx}, {ty}) is stale");
            return Ok(None);
        }
        Ok(Some(BuiltTile {
            tx,
            ty,
            poly_count: blob_poly_count(&blob),
            blob,
            content_hash,
        }))
    }

    fn build(&mut self, tx: i32, ty: i32) -> Result<Option<BuiltTile>> {
        Ok(match self.builder.build_tile(tx, ty)? {
            TileBuildOutcome::Built(tile) => Some(tile),
            TileBuildOutcome::Empty { .. } => None,
        })
    }
}

/// Polygon count from a tile blob header.
fn blob_poly_count(blob: &[u8]) -> u32 {
    blob.get(20..24).map_or(0, LittleEndian::read_u32)
}

/// What one touch did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TouchReport {
    /// Tiles covered by the touch region
    pub touched: usize,
    pub loaded: usize,
    pub built: usize,
    /// Covered tiles with nothing to load and nothing to build
    pub missing: usize,
    pub failed: usize,
    pub evicted: Vec<(i32, i32)>,
}

/// Streams tiles in and out of a container, evicting the least recently touched.
#[derive(Debug, Clone)]
pub struct ResidencyManager {
    max_resident: usize,
    stamps: HashMap<u64, u64>,
    counter: u64,
}

impl ResidencyManager {
    pub fn new(max_resident: usize) -> Self {
        Self {
            max_resident,
            stamps: HashMap::new(),
            counter: 0,
        }
    }

    pub fn max_resident(&self) -> usize {
        self.max_resident
    }

    pub fn set_max_resident(&mut self, max_resident: usize) {
        self.max_resident = max_resident;
    }

    pub fn resident_count(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_resident(&self, tx: i32, ty: i32) -> bool {
        self.stamps.contains_key(&tile_key(tx, ty))
    }

    /// Last access stamp of a resident tile.
    pub fn stamp(&self, tx: i32, ty: i32) -> Option<u64> {
        self.stamps.get(&tile_key(tx, ty)).copied()
    }

    /// Resident tiles, oldest first.
    pub fn resident_tiles(&self) -> Vec<(i32, i32)> {
        let mut tiles: Vec<_> = self.stamps.iter().map(|(&k, &s)| (s, k)).collect();
        tiles.sort_unstable();
        tiles.into_iter().map(|(_, k)| tile_key_coords(k)).collect()
    }

    fn next_stamp(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Brings the tiles within `radius` of `center` into the container.
    pub fn touch_region(
        &mut self,
        container: &mut NavMeshContainer,
        grid: &TileGrid,
        source: &mut dyn TileSource,
        center: Vec3,
        radius: f32,
        allow_build: bool,
    ) -> TouchReport {
        let tiles = grid.tiles_around(center, radius);
        self.touch_tiles(container, source, &tiles, allow_build)
    }

    /// Brings `tiles` into the container, stamps them and evicts beyond the cap.
    pub fn touch_tiles(
        &mut self,
        container: &mut NavMeshContainer,
        source: &mut dyn TileSource,
        tiles: &[(i32, i32)],
        allow_build: bool,
    ) -> TouchReport {
        self.reconcile(container);

        let mut report = TouchReport {
            touched: tiles.len(),
            ..Default::default()
        };
        let mut current = HashSet::with_capacity(tiles.len());

        for &(tx, ty) in tiles {
            let key = tile_key(tx, ty);
            current.insert(key);
            if !container.has_tile(tx, ty) {
                match self.fetch(container, source, tx, ty, allow_build) {
                    Ok(Fetched::Loaded) => report.loaded += 1,
                    Ok(Fetched::Built) => report.built += 1,
                    Ok(Fetched::Missing) => {
                        report.missing += 1;
                        continue;
                    }
                    Err(e) => {
                        log::warn!("Could not stream in tile ({tx}, {ty}): {e}");
                        report.failed += 1;
                        continue;
                    }
                }
            }
            let stamp = self.next_stamp();
            self.stamps.insert(key, stamp);
        }

        report.evicted = self.evict(container, &current);
        if report.loaded + report.built + report.evicted.len() > 0 {
            log::debug!(
                "Residency: {} loaded, {} built, {} evicted, {} resident",
                report.loaded,
                report.built,
                report.evicted.len(),
                self.stamps.len()
            );
        }
        report
    }

    fn fetch(
        &mut self,
        container: &mut NavMeshContainer,
        source: &mut dyn TileSource,
        tx: i32,
        ty: i32,
        allow_build: bool,
    ) -> Result<Fetched> {
        let loaded = match source.load(tx, ty) {
            Ok(tile) => tile,
            Err(e) => {
                log::warn!("Stored tile ({tx}, {ty}) could not be read: {e}");
                None
            }
        };
        if let Some(tile) = loaded {
            match container.add_or_replace(tile) {
                Ok(_) => return Ok(Fetched::Loaded),
                Err(e) => log::warn!("Stored tile ({tx}, {ty}) rejected: {e}"),
            }
        }
        if !allow_build {
            return Ok(Fetched::Missing);
        }
        match source.build(tx, ty)? {
            Some(tile) => {
                container.add_or_replace(tile)?;
                Ok(Fetched::Built)
            }
            None => Ok(Fetched::Missing),
        }
    }

    /// Evicts oldest tiles outside `protected` until the cap holds or nothing is evictable.
    pub fn evict(
        &mut self,
        container: &mut NavMeshContainer,
        protected: &HashSet<u64>,
    ) -> Vec<(i32, i32)> {
        let mut evicted = Vec::new();
        while self.stamps.len() > self.max_resident {
            let victim = self
                .stamps
                .iter()
                .filter(|(key, _)| !protected.contains(key))
                .min_by_key(|(_, &stamp)| stamp)
                .map(|(&key, _)| key);
            let Some(key) = victim else {
                break;
            };
            self.stamps.remove(&key);
            let (tx, ty) = tile_key_coords(key);
            container.remove(tx, ty);
            evicted.push((tx, ty));
        }
        evicted
    }

    /// Makes the tracked set match the container's tiles.
    ///
    /// Tiles added behind the manager's back are adopted as the oldest entries.
    pub fn reconcile(&mut self, container: &NavMeshContainer) {
        self.stamps.retain(|&key, _| {
            let (tx, ty) = tile_key_coords(key);
            container.has_tile(tx, ty)
        });
        for (tx, ty) in container.tile_coords() {
            self.stamps.entry(tile_key(tx, ty)).or_insert(0);
        }
    }

    /// Drops every resident tile and resets stamps.
    pub fn clear_all(&mut self, container: &mut NavMeshContainer) {
        container.clear();
        self.stamps.clear();
        self.counter = 0;
    }
}

enum Fetched {
    Loaded,
    Built,
    Missing,
}
