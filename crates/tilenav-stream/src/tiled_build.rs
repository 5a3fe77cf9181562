//! Batch build of a tile list, reusing stored tiles whose content hash still matches

use std::time::Duration;

use tilenav_common::{Error, Result};
use web_time::Instant;

use crate::container::NavMeshContainer;
use crate::residency::TileSource;
use crate::worker::CancellationToken;

/// Tiles handled between progress logs and batch-level cancellation checks
const BATCH_SIZE: usize = 64;

/// Summary of a batch build
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TiledBuildReport {
    pub requested: usize,
    pub built: usize,
    pub from_cache: usize,
    pub empty: usize,
    pub elapsed: Duration,
}

impl TiledBuildReport {
    pub fn resident(&self) -> usize {
        self.built + self.from_cache
    }
}

/// Fills `container` with `tiles`, loading from `source` when possible and building
/// otherwise.
///
/// The token is checked before every tile and every batch; a cancelled build returns
/// [`Error::Cancelled`]. Build errors abort the remaining tiles.
pub fn build_all_tiles(
    source: &mut dyn TileSource,
    container: &mut NavMeshContainer,
    tiles: &[(i32, i32)],
    cancel: &CancellationToken,
) -> Result<TiledBuildReport> {
    let start = Instant::now();
    let mut report = TiledBuildReport {
        requested: tiles.len(),
        ..Default::default()
    };

    for (batch_index, batch) in tiles.chunks(BATCH_SIZE).enumerate() {
        cancel.check()?;
        for &(tx, ty) in batch {
            cancel.check()?;

            let cached = source.load(tx, ty).unwrap_or_else(|e| {
                log::warn!("Ignoring stored tile ({tx}, {ty}): {e}");
                None
            });
            if let Some(tile) = cached {
                match container.add_or_replace(tile) {
                    Ok(_) => {
                        report.from_cache += 1;
                        continue;
                    }
                    Err(e) => log::warn!("Stored tile ({tx}, {ty}) rejected: {e}"),
                }
            }

            match source.build(tx, ty)? {
                Some(tile) => {
                    container
                        .add_or_replace(tile)
                        .map_err(|e| Error::TileBuild {
                            tx,
                            ty,
                            reason: e.to_string(),
                        })?;
                    report.built += 1;
                }
                None => {
                    container.remove(tx, ty);
                    report.empty += 1;
                }
            }
        }
        log::debug!(
            "Batch {} of {} done ({} tiles so far)",
            batch_index + 1,
            tiles.len().div_ceil(BATCH_SIZE),
            report.built + report.from_cache + report.empty
        );
    }

    report.elapsed = start.elapsed();
    log::info!(
        "Tiled build: {} built, {} from cache, {} empty of {} in {:.2?}",
        report.built,
        report.from_cache,
        report.empty,
        report.requested,
        report.elapsed
    );
    Ok(report)
}
