//! Incremental updates driven by geometry instance changes

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use glam::Vec3;
use tilenav_common::{Bounds, Result};

use crate::container::NavMeshContainer;
use crate::geometry_set::{GeometryInstance, GeometrySet};
use crate::tile_builder::{TileBuildOutcome, TileBuilder};
use crate::worker::CancellationToken;

/// Bounds changes smaller than this do not count as a move
const BOUNDS_EPSILON: f32 = 1e-3;

/// World region whose tiles no longer match their geometry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirtyBoundsEvent {
    pub bmin: Vec3,
    pub bmax: Vec3,
}

impl DirtyBoundsEvent {
    pub fn new(bmin: Vec3, bmax: Vec3) -> Self {
        Self { bmin, bmax }
    }

    pub fn bounds(&self) -> Bounds {
        Bounds::new(self.bmin, self.bmax)
    }
}

impl From<Bounds> for DirtyBoundsEvent {
    fn from(bounds: Bounds) -> Self {
        Self::new(bounds.min, bounds.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Fingerprint {
    bounds: Bounds,
    vertex_count: usize,
    index_count: usize,
    source_id: usize,
}

impl Fingerprint {
    fn of(instance: &GeometryInstance) -> Self {
        Self {
            bounds: instance.world_bounds(),
            vertex_count: instance.vertex_count(),
            index_count: instance.index_count(),
            source_id: instance.source_id(),
        }
    }

    fn differs(&self, other: &Fingerprint) -> bool {
        self.vertex_count != other.vertex_count
            || self.index_count != other.index_count
            || self.source_id != other.source_id
            || !self.bounds.approx_eq(&other.bounds, BOUNDS_EPSILON)
    }
}

/// Outcome of a dirty rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub events: usize,
    /// Tiles covered by the dirty bounds, in rebuild order
    pub tiles: Vec<(i32, i32)>,
    pub rebuilt: usize,
    pub removed: usize,
    pub cancelled: bool,
}

impl RebuildReport {
    pub fn is_noop(&self) -> bool {
        self.tiles.is_empty()
    }
}

/// Remembers what every instance looked like at the last scan and turns changes into
/// dirty bounds.
#[derive(Debug, Clone, Default)]
pub struct DirtyTracker {
    known: HashMap<String, Fingerprint>,
    pending: Vec<DirtyBoundsEvent>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &[DirtyBoundsEvent] {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn take_pending(&mut self) -> Vec<DirtyBoundsEvent> {
        std::mem::take(&mut self.pending)
    }

    /// Forgets all fingerprints and pending events.
    pub fn reset(&mut self) {
        self.known.clear();
        self.pending.clear();
    }

    /// Records the current state of `set` without raising events.
    pub fn sync(&mut self, set: &GeometrySet) {
        self.known = set
            .iter()
            .map(|inst| (inst.id.clone(), Fingerprint::of(inst)))
            .collect();
        self.pending.clear();
    }

    /// Queues an explicit dirty region.
    pub fn mark_dirty(&mut self, bounds: Bounds) {
        if bounds.is_valid() {
            self.pending.push(bounds.into());
        }
    }

    /// Diffs `set` against the last scan and queues one event per new, changed or vanished
    /// instance. Returns the number of events raised.
    pub fn scan(&mut self, set: &GeometrySet) -> usize {
        let before = self.pending.len();
        let mut current = HashMap::with_capacity(set.len());

        for inst in set.iter() {
            let now = Fingerprint::of(inst);
            match self.known.get(&inst.id) {
                None => self.pending.push(now.bounds.into()),
                Some(prev) if prev.differs(&now) => {
                    self.pending.push(prev.bounds.union(&now.bounds).into());
                }
                Some(prev) => {
                    // Sub-epsilon drift keeps the old reference so it cannot accumulate
                    current.insert(inst.id.clone(), *prev);
                    continue;
                }
            }
            current.insert(inst.id.clone(), now);
        }

        for (id, prev) in &self.known {
            if !current.contains_key(id) {
                self.pending.push(prev.bounds.into());
            }
        }

        self.known = current;
        let raised = self.pending.len() - before;
        if raised > 0 {
            log::debug!("Dirty scan raised {raised} events");
        }
        raised
    }

    /// Tiles whose build inputs overlap a pending event, including the border skirt.
    pub fn dirty_tiles(&self, builder: &TileBuilder) -> Vec<(i32, i32)> {
        let skirt = builder.settings().border_size_cells() as f32 * builder.settings().cell_size;
        let grid = builder.grid();
        let tiles: BTreeSet<(i32, i32)> = self
            .pending
            .iter()
            .flat_map(|event| grid.tiles_in_bounds(&event.bounds().expanded_xz(skirt)))
            .map(|(tx, ty)| (ty, tx))
            .collect();
        tiles.into_iter().map(|(ty, tx)| (tx, ty)).collect()
    }

    /// Scans `set` and rebuilds exactly the tiles under pending events.
    ///
    /// Geometry is recombined (clipped to `clip` when given) and cached in the builder
    /// before any tile is built. Empty tiles are removed. A failing tile aborts the batch
    /// with tiles swapped so far kept; on error or cancellation the events stay pending.
    pub fn rebuild_dirty(
        &mut self,
        set: &GeometrySet,
        builder: &mut TileBuilder,
        container: &mut NavMeshContainer,
        clip: Option<&Bounds>,
        cancel: &CancellationToken,
    ) -> Result<RebuildReport> {
        self.scan(set);
        let mut report = RebuildReport {
            events: self.pending.len(),
            ..Default::default()
        };
        if self.pending.is_empty() {
            return Ok(report);
        }

        builder.update_cached_geometry(Arc::new(set.combine(clip)));
        report.tiles = self.dirty_tiles(builder);

        for &(tx, ty) in &report.tiles {
            if cancel.is_cancelled() {
                log::info!("Dirty rebuild cancelled after {} tiles", report.rebuilt + report.removed);
                report.cancelled = true;
                return Ok(report);
            }
            match builder.build_tile(tx, ty)? {
                TileBuildOutcome::Built(tile) => {
                    container.add_or_replace(tile)?;
                    report.rebuilt += 1;
                }
                TileBuildOutcome::Empty { .. } => {
                    if container.remove(tx, ty) {
                        report.removed += 1;
                    }
                }
            }
        }

        self.pending.clear();
        log::info!(
            "Rebuilt {} dirty tiles ({} removed) from {} events",
            report.rebuilt,
            report.removed,
            report.events
        );
        Ok(report)
    }
}
