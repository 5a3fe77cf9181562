//! Residency, tile store reuse and dirty coverage through the runtime

use std::path::Path;
use std::sync::Arc;

use glam::Vec3;
use tilenav_common::{Bounds, Error, Result};

use crate::config::RuntimeConfig;
use crate::runtime::NavRuntime;
use crate::test_helpers::{
    flat_floor, tiled_settings, world_bounds, CountingMesher, FailingMesher,
};

fn config() -> RuntimeConfig {
    RuntimeConfig::default().with_settings(tiled_settings(10.0))
}

/// 4 x 4 grid of 10 unit tiles, fully floored.
fn full_floor(config: RuntimeConfig) -> Result<NavRuntime> {
    let mut runtime = NavRuntime::new(config);
    runtime.init_grid(world_bounds(40.0))?;
    runtime.add_instance(
        "floor",
        Arc::new(flat_floor(Vec3::ZERO, 40.0, 40.0)),
        Vec3::ZERO,
        Vec3::ZERO,
    )?;
    Ok(runtime)
}

fn tile_center(tx: i32, ty: i32) -> Vec3 {
    Vec3::new(tx as f32 * 10.0 + 5.0, 0.0, ty as f32 * 10.0 + 5.0)
}

fn saved_store(path: &Path) -> Result<()> {
    let mut runtime = full_floor(config().with_store_path(path))?;
    assert_eq!(runtime.build_all()?.built, 16);
    assert_eq!(runtime.save_store()?, 16);
    Ok(())
}

#[test]
fn test_streaming_evicts_least_recent() -> Result<()> {
    let mut runtime = full_floor(config().with_max_resident_tiles(2))?;

    let first = runtime.stream_around(tile_center(0, 0), 0.5)?;
    assert_eq!((first.touched, first.built), (1, 1));
    runtime.stream_around(tile_center(1, 0), 0.5)?;
    assert_eq!(runtime.residency().resident_count(), 2);

    let third = runtime.stream_around(tile_center(2, 0), 0.5)?;
    assert_eq!(third.evicted, vec![(0, 0)]);
    assert_eq!(runtime.residency().resident_tiles(), vec![(1, 0), (2, 0)]);
    let container = runtime.container().expect("grid initialized");
    assert_eq!(container.tile_count(), 2);
    assert!(!container.has_tile(0, 0));

    // Touching a resident tile refreshes it
    runtime.stream_around(tile_center(1, 0), 0.5)?;
    let fourth = runtime.stream_around(tile_center(3, 0), 0.5)?;
    assert_eq!(fourth.evicted, vec![(2, 0)]);
    Ok(())
}

#[test]
fn test_region_larger_than_cap_stays_resident() -> Result<()> {
    let mut runtime = full_floor(config().with_max_resident_tiles(2))?;
    let report = runtime.stream_around(Vec3::new(20.0, 0.0, 20.0), 6.0)?;
    assert_eq!(report.touched, 4);
    assert!(report.evicted.is_empty());
    assert_eq!(runtime.residency().resident_count(), 4);
    Ok(())
}

#[test]
fn test_second_session_reuses_store() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tiles.tndb");
    saved_store(&path)?;

    let mut runtime = full_floor(config().with_store_path(&path))?;
    let report = runtime.build_all()?;
    assert_eq!(report.from_cache, 16);
    assert_eq!(report.built, 0);

    // Raised geometry no longer matches any stored hash
    runtime.update_instance("floor", Vec3::Y, Vec3::ZERO)?;
    let report = runtime.build_all()?;
    assert_eq!(report.from_cache, 0);
    assert_eq!(report.built, 16);
    Ok(())
}

#[test]
fn test_streams_from_store_without_geometry() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tiles.tndb");
    saved_store(&path)?;

    let mut config = config();
    config.streaming.allow_build = false;
    let mut runtime = NavRuntime::new(config);
    runtime.init_grid(world_bounds(40.0))?;
    assert_eq!(runtime.attach_store(&path)?, 16);

    let report = runtime.stream_around(tile_center(1, 1), 0.5)?;
    assert_eq!(report.loaded, 1);
    assert_eq!(report.built, 0);
    assert!(runtime.residency().is_resident(1, 1));

    let area = Bounds::new(Vec3::new(0.0, -1.0, 0.0), Vec3::new(19.0, 1.0, 9.0));
    assert_eq!(runtime.load_stored_tiles(area)?, 2);

    runtime.clear_resident();
    assert_eq!(runtime.stats().tiles, 0);
    assert_eq!(runtime.residency().resident_count(), 0);
    Ok(())
}

#[test]
fn test_incompatible_store_is_ignored() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tiles.tndb");
    saved_store(&path)?;

    // 20 unit tiles do not line up with the stored grid
    let config = RuntimeConfig::default().with_settings(tiled_settings(20.0));
    let mut runtime = NavRuntime::new(config);
    runtime.init_grid(world_bounds(40.0))?;
    runtime.add_instance(
        "floor",
        Arc::new(flat_floor(Vec3::ZERO, 40.0, 40.0)),
        Vec3::ZERO,
        Vec3::ZERO,
    )?;
    assert_eq!(runtime.attach_store(&path)?, 0);
    let report = runtime.build_all()?;
    assert_eq!(report.from_cache, 0);
    assert_eq!(report.built, 4);
    Ok(())
}

#[test]
fn test_bake_persists_live_tiles() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("baked.tndb");
    let mut runtime = full_floor(config().with_store_path(&path))?;

    let area = Bounds::new(Vec3::new(1.0, -1.0, 1.0), Vec3::new(9.0, 1.0, 9.0));
    let report = runtime.bake_bounds(area, true)?;
    assert_eq!(report.requested, 1);
    assert_eq!(report.built, 1);
    assert_eq!(runtime.store().map(|s| s.len()), Some(1));

    // Without persisting the store keeps its previous contents
    let area = Bounds::new(Vec3::new(11.0, -1.0, 1.0), Vec3::new(19.0, 1.0, 9.0));
    runtime.bake_bounds(area, false)?;
    assert_eq!(runtime.stats().tiles, 2);
    assert_eq!(runtime.store().map(|s| s.len()), Some(1));

    let mut other = full_floor(config())?;
    assert!(other.bake_bounds(area, true).is_err());
    Ok(())
}

#[test]
fn test_dirty_rebuild_covers_both_positions() -> Result<()> {
    let mut runtime = NavRuntime::new(config());
    runtime.init_grid(world_bounds(40.0))?;
    runtime.add_instance(
        "crate",
        Arc::new(flat_floor(Vec3::ZERO, 4.0, 4.0)),
        Vec3::ZERO,
        Vec3::ZERO,
    )?;
    runtime.add_instance(
        "far",
        Arc::new(flat_floor(Vec3::ZERO, 4.0, 4.0)),
        Vec3::new(30.0, 0.0, 30.0),
        Vec3::ZERO,
    )?;
    runtime.build_all()?;

    runtime.update_instance("crate", Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO)?;
    let report = runtime.rebuild_dirty()?;
    assert_eq!(report.events, 1);
    assert_eq!(report.tiles, vec![(0, 0), (1, 0)]);
    let container = runtime.container().expect("grid initialized");
    assert!(container.has_tile(1, 0));
    assert!(!container.has_tile(0, 0));
    assert!(container.has_tile(3, 3));
    Ok(())
}

#[test]
fn test_unchanged_scene_builds_nothing() -> Result<()> {
    let mesher = Arc::new(CountingMesher::default());
    let mut runtime = NavRuntime::with_pipeline(config(), mesher.clone());
    runtime.init_grid(world_bounds(40.0))?;
    runtime.add_instance(
        "floor",
        Arc::new(flat_floor(Vec3::ZERO, 20.0, 20.0)),
        Vec3::ZERO,
        Vec3::ZERO,
    )?;
    runtime.build_all()?;
    // Tiles whose skirt reaches the floor run the mesher too
    let calls = mesher.calls();
    assert!(calls >= 4);

    assert!(runtime.rebuild_dirty()?.is_noop());
    // Same transform again is not a change
    runtime.update_instance("floor", Vec3::ZERO, Vec3::ZERO)?;
    assert!(runtime.rebuild_dirty()?.is_noop());
    assert_eq!(mesher.calls(), calls);
    Ok(())
}

#[test]
fn test_failed_dirty_rebuild_keeps_earlier_tiles_and_retries() -> Result<()> {
    let mesher = Arc::new(FailingMesher::new(tile_center(1, 1)));
    let mut runtime = NavRuntime::with_pipeline(config(), mesher.clone());
    runtime.init_grid(world_bounds(40.0))?;
    runtime.add_instance(
        "floor",
        Arc::new(flat_floor(Vec3::ZERO, 40.0, 40.0)),
        Vec3::ZERO,
        Vec3::ZERO,
    )?;
    assert_eq!(runtime.build_all()?.built, 16);
    let hash = |runtime: &NavRuntime, tx, ty| {
        runtime
            .container()
            .and_then(|c| c.content_hash(tx, ty))
            .expect("tile present")
    };
    let before: Vec<u64> = (0..4)
        .flat_map(|ty| (0..4).map(move |tx| (tx, ty)))
        .map(|(tx, ty)| hash(&runtime, tx, ty))
        .collect();

    mesher.set_armed(true);
    runtime.update_instance("floor", Vec3::Y, Vec3::ZERO)?;
    let result = runtime.rebuild_dirty();
    assert!(matches!(result, Err(Error::TileBuild { tx: 1, ty: 1, .. })));

    // Row-major order: the first row and (0, 1) went in before the failure
    for (tx, ty) in [(0, 0), (3, 0), (0, 1)] {
        assert_ne!(hash(&runtime, tx, ty), before[(ty * 4 + tx) as usize]);
    }
    for (tx, ty) in [(1, 1), (2, 1), (3, 3)] {
        assert_eq!(hash(&runtime, tx, ty), before[(ty * 4 + tx) as usize]);
    }
    assert_eq!(runtime.stats().tiles, 16);
    assert!(!runtime.pending_dirty().is_empty());

    mesher.set_armed(false);
    let report = runtime.rebuild_dirty()?;
    assert_eq!(report.rebuilt, 16);
    assert!(runtime.pending_dirty().is_empty());
    for ty in 0..4 {
        for tx in 0..4 {
            assert_ne!(hash(&runtime, tx, ty), before[(ty * 4 + tx) as usize]);
        }
    }
    Ok(())
}

#[test]
fn test_corrupt_store_loads_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tiles.tndb");
    std::fs::write(&path, b"not a tile database")?;

    let mut runtime = full_floor(config())?;
    assert_eq!(runtime.attach_store(&path)?, 0);
    assert_eq!(runtime.load_stored_tiles(world_bounds(40.0))?, 0);
    assert_eq!(runtime.stats().tiles, 0);
    Ok(())
}
