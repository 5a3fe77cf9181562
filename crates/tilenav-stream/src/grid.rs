//! Tile grid planning
//!
//! A grid session fixes the world bounds and tile size once. Every other component
//! addresses tiles through the [`TileGrid`] produced here.

use glam::Vec3;
use tilenav_common::{ilog2, next_pow2, Bounds, Error, Result};
use tilenav_mesh::NavMeshParams;

use crate::config::{BuildMode, GenerationSettings};

/// Safety ceiling on the number of tiles in one grid
pub const MAX_TILE_COUNT: u32 = 32768;

/// Bits available to a packed polygon reference (tile bits + polygon bits)
pub const TOTAL_REF_BITS: u32 = 22;

/// Per-tile polygon budget the planner aims for
pub const DESIRED_MAX_POLYS: u32 = 2048;

/// Tile layout of one grid session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGrid {
    pub bounds: Bounds,
    pub tile_width: f32,
    pub tile_height: f32,
    pub tile_count_x: i32,
    pub tile_count_y: i32,
    pub tile_bits: u32,
    pub poly_bits: u32,
}

impl TileGrid {
    pub fn origin(&self) -> Vec3 {
        self.bounds.min
    }

    /// Edge length of a tile along X, in world units.
    pub fn tile_world_size(&self) -> f32 {
        self.tile_width
    }

    pub fn tile_count_total(&self) -> u32 {
        (self.tile_count_x * self.tile_count_y) as u32
    }

    pub fn max_tiles(&self) -> u32 {
        self.tile_count_total()
    }

    pub fn max_polys(&self) -> u32 {
        1 << self.poly_bits
    }

    /// Container parameters matching this grid.
    pub fn nav_params(&self) -> NavMeshParams {
        NavMeshParams {
            origin: self.origin(),
            tile_width: self.tile_width,
            tile_height: self.tile_height,
            max_tiles: self.max_tiles(),
            max_polys: self.max_polys(),
        }
    }

    /// Tile coordinate containing `pos`. May lie outside the grid.
    pub fn tile_of(&self, pos: Vec3) -> (i32, i32) {
        (
            ((pos.x - self.bounds.min.x) / self.tile_width).floor() as i32,
            ((pos.z - self.bounds.min.z) / self.tile_height).floor() as i32,
        )
    }

    pub fn contains_tile(&self, tx: i32, ty: i32) -> bool {
        (0..self.tile_count_x).contains(&tx) && (0..self.tile_count_y).contains(&ty)
    }

    /// Core rectangle of tile `(tx, ty)`, clamped to the world bounds on X and Z.
    /// The Y range always spans the whole world.
    pub fn tile_bounds(&self, tx: i32, ty: i32) -> Bounds {
        let min = Vec3::new(
            self.bounds.min.x + tx as f32 * self.tile_width,
            self.bounds.min.y,
            self.bounds.min.z + ty as f32 * self.tile_height,
        );
        let max = Vec3::new(
            (min.x + self.tile_width).min(self.bounds.max.x),
            self.bounds.max.y,
            (min.z + self.tile_height).min(self.bounds.max.z),
        );
        Bounds::new(min, max)
    }

    /// Tiles overlapping `area` on XZ, clamped to the grid, row by row.
    pub fn tiles_in_bounds(&self, area: &Bounds) -> Vec<(i32, i32)> {
        if !area.is_valid() || !area.overlaps_xz(&self.bounds) {
            return Vec::new();
        }
        let (x0, y0) = self.tile_of(area.min);
        let (x1, y1) = self.tile_of(area.max);
        let x0 = x0.clamp(0, self.tile_count_x - 1);
        let x1 = x1.clamp(0, self.tile_count_x - 1);
        let y0 = y0.clamp(0, self.tile_count_y - 1);
        let y1 = y1.clamp(0, self.tile_count_y - 1);

        let mut out = Vec::with_capacity(((x1 - x0 + 1) * (y1 - y0 + 1)) as usize);
        for ty in y0..=y1 {
            for tx in x0..=x1 {
                out.push((tx, ty));
            }
        }
        out
    }

    /// Tiles overlapping the square of half size `radius` around `center`.
    pub fn tiles_around(&self, center: Vec3, radius: f32) -> Vec<(i32, i32)> {
        let r = radius.max(0.0);
        let area = Bounds::new(
            Vec3::new(center.x - r, self.bounds.min.y, center.z - r),
            Vec3::new(center.x + r, self.bounds.max.y, center.z + r),
        );
        self.tiles_in_bounds(&area)
    }

    /// Every tile of the grid, row by row.
    pub fn all_tiles(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        (0..self.tile_count_y).flat_map(move |ty| (0..self.tile_count_x).map(move |tx| (tx, ty)))
    }
}

/// Derives a [`TileGrid`] from settings and world bounds
pub struct TileGridPlanner;

impl TileGridPlanner {
    pub fn plan(settings: &GenerationSettings, bounds: Bounds) -> Result<TileGrid> {
        settings.validate().map_err(Error::Config)?;

        let size = bounds.size();
        if !(size.x > 0.0 && size.z > 0.0) || !bounds.min.is_finite() || !bounds.max.is_finite()
        {
            return Err(Error::Config(format!(
                "world bounds must have a positive width and depth, got {} x {}",
                size.x, size.z
            )));
        }

        match settings.mode {
            BuildMode::SingleMesh => Ok(TileGrid {
                bounds,
                tile_width: size.x,
                tile_height: size.z,
                tile_count_x: 1,
                tile_count_y: 1,
                tile_bits: 0,
                poly_bits: TOTAL_REF_BITS,
            }),
            BuildMode::Tiled => Self::plan_tiled(settings, bounds),
        }
    }

    fn plan_tiled(settings: &GenerationSettings, bounds: Bounds) -> Result<TileGrid> {
        let tile_size = settings.tile_world_size();
        if !(tile_size > 0.0) {
            return Err(Error::Config(format!(
                "tile world size must be positive, got {tile_size}"
            )));
        }

        let size = bounds.size();
        let count_x = ((size.x / tile_size).ceil() as i64).max(1);
        let count_y = ((size.z / tile_size).ceil() as i64).max(1);
        let total = count_x * count_y;
        if total > MAX_TILE_COUNT as i64 {
            let suggested_world = (size.x * size.z / MAX_TILE_COUNT as f32).sqrt();
            let suggested_cells = (suggested_world / settings.cell_size).ceil() as i32;
            return Err(Error::Config(format!(
                "{total} tiles exceed the limit of {MAX_TILE_COUNT}; use a tile size of at least {suggested_cells} cells"
            )));
        }

        let tile_bits = ilog2(next_pow2(total as u32));
        if tile_bits >= TOTAL_REF_BITS {
            return Err(Error::Config(format!(
                "{tile_bits} tile bits leave no room for polygon indices"
            )));
        }
        let poly_bits = ilog2(next_pow2(DESIRED_MAX_POLYS)).min(TOTAL_REF_BITS - tile_bits);

        log::debug!(
            "Planned {count_x}x{count_y} tile grid ({tile_size} units, {tile_bits} tile bits, {poly_bits} poly bits)"
        );

        Ok(TileGrid {
            bounds,
            tile_width: tile_size,
            tile_height: tile_size,
            tile_count_x: count_x as i32,
            tile_count_y: count_y as i32,
            tile_bits,
            poly_bits,
        })
    }
}
