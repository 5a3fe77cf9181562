//! Generation, link synthesis and runtime settings

use std::collections::BTreeMap;
use std::path::PathBuf;

use tilenav_common::Bounds;
#[cfg(feature = "serialization")]
use tilenav_common::{Error, Result};
use tilenav_mesh::{nav_area, MeshingConfig, TileAgentInfo};

/// How the world is partitioned into tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum BuildMode {
    /// One tile covering the whole world bounds
    #[default]
    SingleMesh,
    /// Fixed grid of `tile_size` cell tiles
    Tiled,
}

/// Agent and rasterization settings shared by every tile of a grid session
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct GenerationSettings {
    pub mode: BuildMode,
    pub cell_size: f32,
    pub cell_height: f32,
    pub agent_height: f32,
    pub agent_radius: f32,
    pub agent_max_climb: f32,
    /// Degrees
    pub agent_max_slope: f32,
    pub region_min_size: f32,
    pub region_merge_size: f32,
    pub edge_max_len: f32,
    pub edge_max_error: f32,
    pub verts_per_poly: i32,
    pub detail_sample_dist: f32,
    pub detail_sample_max_error: f32,
    /// Tile edge length in cells
    pub tile_size: i32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            mode: BuildMode::SingleMesh,
            cell_size: 0.3,
            cell_height: 0.2,
            agent_height: 2.0,
            agent_radius: 0.6,
            agent_max_climb: 1.0,
            agent_max_slope: 60.0,
            region_min_size: 8.0,
            region_merge_size: 20.0,
            edge_max_len: 12.0,
            edge_max_error: 1.3,
            verts_per_poly: 6,
            detail_sample_dist: 6.0,
            detail_sample_max_error: 1.0,
            tile_size: 48,
        }
    }
}

impl GenerationSettings {
    pub fn new(mode: BuildMode, tile_size: i32, cell_size: f32) -> Self {
        Self {
            mode,
            tile_size,
            cell_size,
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_tile_size(mut self, tile_size: i32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn with_cell_size(mut self, cell_size: f32) -> Self {
        self.cell_size = cell_size;
        self
    }

    pub fn with_cell_height(mut self, cell_height: f32) -> Self {
        self.cell_height = cell_height;
        self
    }

    pub fn with_agent_height(mut self, agent_height: f32) -> Self {
        self.agent_height = agent_height;
        self
    }

    pub fn with_agent_radius(mut self, agent_radius: f32) -> Self {
        self.agent_radius = agent_radius;
        self
    }

    pub fn with_agent_max_climb(mut self, agent_max_climb: f32) -> Self {
        self.agent_max_climb = agent_max_climb;
        self
    }

    pub fn with_agent_max_slope(mut self, agent_max_slope: f32) -> Self {
        self.agent_max_slope = agent_max_slope;
        self
    }

    pub fn with_verts_per_poly(mut self, verts_per_poly: i32) -> Self {
        self.verts_per_poly = verts_per_poly;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.cell_size > 0.0) {
            return Err("Cell size must be positive".to_string());
        }
        if !(self.cell_height > 0.0) {
            return Err("Cell height must be positive".to_string());
        }
        if !(self.agent_height > 0.0) {
            return Err("Agent height must be positive".to_string());
        }
        if self.agent_radius < 0.0 {
            return Err("Agent radius cannot be negative".to_string());
        }
        if self.agent_max_climb < 0.0 {
            return Err("Agent max climb cannot be negative".to_string());
        }
        if !(0.0..=90.0).contains(&self.agent_max_slope) {
            return Err("Agent max slope must be within 0..=90 degrees".to_string());
        }
        if !(3..=tilenav_mesh::MAX_VERTS_PER_POLY as i32).contains(&self.verts_per_poly) {
            return Err(format!(
                "Verts per poly must be within 3..={}",
                tilenav_mesh::MAX_VERTS_PER_POLY
            ));
        }
        if self.mode == BuildMode::Tiled && self.tile_size <= 0 {
            return Err("Tile size must be positive in tiled mode".to_string());
        }
        Ok(())
    }

    /// Edge length of one tile in world units.
    pub fn tile_world_size(&self) -> f32 {
        self.tile_size as f32 * self.cell_size
    }

    pub fn walkable_height_cells(&self) -> i32 {
        (self.agent_height / self.cell_height).ceil() as i32
    }

    pub fn walkable_climb_cells(&self) -> i32 {
        (self.agent_max_climb / self.cell_height).floor() as i32
    }

    pub fn walkable_radius_cells(&self) -> i32 {
        (self.agent_radius / self.cell_size).ceil() as i32
    }

    /// Skirt around each tile, in cells.
    pub fn border_size_cells(&self) -> i32 {
        match self.mode {
            BuildMode::SingleMesh => 0,
            BuildMode::Tiled => self.walkable_radius_cells() + 3,
        }
    }

    pub fn to_meshing_config(&self) -> MeshingConfig {
        let border = self.border_size_cells();
        MeshingConfig {
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            walkable_slope_angle: self.agent_max_slope,
            walkable_height_cells: self.walkable_height_cells(),
            walkable_climb_cells: self.walkable_climb_cells(),
            walkable_radius_cells: self.walkable_radius_cells(),
            max_edge_len_cells: (self.edge_max_len / self.cell_size) as i32,
            max_simplification_error: self.edge_max_error,
            min_region_area: (self.region_min_size * self.region_min_size) as i32,
            merge_region_area: (self.region_merge_size * self.region_merge_size) as i32,
            max_verts_per_poly: self.verts_per_poly,
            detail_sample_dist: if self.detail_sample_dist < 0.9 {
                0.0
            } else {
                self.cell_size * self.detail_sample_dist
            },
            detail_sample_max_error: self.cell_height * self.detail_sample_max_error,
            border_size_cells: border,
            tile_size_cells: match self.mode {
                BuildMode::SingleMesh => 0,
                BuildMode::Tiled => self.tile_size + border * 2,
            },
        }
    }

    pub fn agent_info(&self) -> TileAgentInfo {
        TileAgentInfo {
            walkable_height: self.agent_height,
            walkable_radius: self.agent_radius,
            walkable_climb: self.agent_max_climb,
        }
    }
}

/// Parameters of automatic drop, jump and facing-pair link generation
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct AutoOffmeshParams {
    /// Bit 0 enables drop/jump links, bit 1 facing-pair links
    pub flags: u32,
    pub jump_height: f32,
    pub max_drop_height: f32,
    pub raycast_extra_height: f32,
    pub min_drop_threshold: f32,
    pub min_neighbor_height_delta: f32,
    /// Degrees
    pub max_slope: f32,
    pub agent_radius: f32,
    pub agent_height: f32,
    pub user_id_base: u32,
    pub edge_outset: f32,
    pub up_offset: f32,
    pub normal_offset: f32,
    pub z_offset: f32,
    /// Degrees of deviation from exactly opposed normals
    pub angle_tolerance: f32,
    pub max_height_diff: f32,
    pub min_height_diff: f32,
    pub min_distance: f32,
    pub max_distance: f32,
    pub drop_area: u8,
}

impl AutoOffmeshParams {
    pub const GEN_DROP_JUMP: u32 = 0x01;
    pub const GEN_FACING: u32 = 0x02;

    /// Mask selecting the part of a user id that identifies the generator
    pub const USER_ID_GROUP_MASK: u32 = 0xffff_0000;

    pub fn drop_jump_enabled(&self) -> bool {
        self.flags & Self::GEN_DROP_JUMP != 0
    }

    pub fn facing_enabled(&self) -> bool {
        self.flags & Self::GEN_FACING != 0
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_jump_height(mut self, jump_height: f32) -> Self {
        self.jump_height = jump_height;
        self
    }

    pub fn with_max_drop_height(mut self, max_drop_height: f32) -> Self {
        self.max_drop_height = max_drop_height;
        self
    }

    pub fn with_height_diff_range(mut self, min: f32, max: f32) -> Self {
        self.min_height_diff = min;
        self.max_height_diff = max;
        self
    }

    pub fn with_distance_range(mut self, min: f32, max: f32) -> Self {
        self.min_distance = min;
        self.max_distance = max;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_drop_height < 0.0 || self.jump_height < 0.0 {
            return Err("Drop and jump heights cannot be negative".to_string());
        }
        if self.min_height_diff > self.max_height_diff {
            return Err("Min height diff exceeds max height diff".to_string());
        }
        if self.min_distance > self.max_distance {
            return Err("Min distance exceeds max distance".to_string());
        }
        if !(0.0..=180.0).contains(&self.angle_tolerance) {
            return Err("Angle tolerance must be within 0..=180 degrees".to_string());
        }
        Ok(())
    }
}

impl Default for AutoOffmeshParams {
    fn default() -> Self {
        Self {
            flags: Self::GEN_DROP_JUMP,
            jump_height: 2.0,
            max_drop_height: 3.0,
            raycast_extra_height: 0.5,
            min_drop_threshold: 0.2,
            min_neighbor_height_delta: 0.3,
            max_slope: 60.0,
            agent_radius: 0.6,
            agent_height: 2.0,
            user_id_base: 0xAFAF_0000,
            edge_outset: 0.15,
            up_offset: 0.10,
            normal_offset: 0.10,
            z_offset: 0.05,
            angle_tolerance: 30.0,
            max_height_diff: 1.5,
            min_height_diff: 1.0,
            min_distance: 0.30,
            max_distance: 5.0,
            drop_area: nav_area::DROP,
        }
    }
}

/// Parameters of island reconnection around a target point
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct IslandLinkParams {
    /// Half size of the search rectangle along its forward axis
    pub half_length: f32,
    /// Half size of the search rectangle across its forward axis
    pub half_width: f32,
    /// Yaw of the forward axis in degrees, 0 pointing along +Z
    pub yaw: f32,
    pub max_links: usize,
    /// Minimum planar separation between chosen anchors
    pub min_anchor_spacing: f32,
    /// Largest height difference a link may bridge
    pub max_height_diff: f32,
    pub link_radius: f32,
    /// Height difference below which a link counts as level
    pub level_tolerance: f32,
    pub user_id_base: u32,
    pub up_offset: f32,
}

impl Default for IslandLinkParams {
    fn default() -> Self {
        Self {
            half_length: 10.0,
            half_width: 10.0,
            yaw: 0.0,
            max_links: 4,
            min_anchor_spacing: 2.0,
            max_height_diff: 4.0,
            link_radius: 0.6,
            level_tolerance: 0.5,
            user_id_base: 0xAFB0_0000,
            up_offset: 0.10,
        }
    }
}

impl IslandLinkParams {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.half_length > 0.0 && self.half_width > 0.0) {
            return Err("Island search rectangle must have a positive size".to_string());
        }
        if self.max_links == 0 {
            return Err("Island link count must be at least one".to_string());
        }
        Ok(())
    }
}

/// Tile streaming limits
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct StreamingConfig {
    pub max_resident_tiles: usize,
    /// Build missing tiles from geometry when the store has none
    pub allow_build: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_resident_tiles: 256,
            allow_build: true,
        }
    }
}

/// Defaults applied to path queries
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct PathQueryConfig {
    /// Straight path vertices closer than this to their predecessor are dropped; 0 keeps all
    pub min_edge: f32,
    /// Per-area traversal cost overrides
    pub area_costs: BTreeMap<u8, f32>,
    pub include_flags: u16,
    pub exclude_flags: u16,
}

impl Default for PathQueryConfig {
    fn default() -> Self {
        Self {
            min_edge: 0.0,
            area_costs: BTreeMap::new(),
            include_flags: 0xffff,
            exclude_flags: 0,
        }
    }
}

/// Everything a [`NavRuntime`](crate::NavRuntime) needs to start a session
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct RuntimeConfig {
    pub settings: GenerationSettings,
    pub auto_offmesh: AutoOffmeshParams,
    pub island_links: IslandLinkParams,
    pub streaming: StreamingConfig,
    pub path_query: PathQueryConfig,
    /// Tile store consulted by full builds and streaming
    pub store_path: Option<PathBuf>,
    /// Geometry outside this box is clipped away when instances are combined
    pub build_bounds: Option<Bounds>,
}

impl RuntimeConfig {
    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn with_max_resident_tiles(mut self, max: usize) -> Self {
        self.streaming.max_resident_tiles = max;
        self
    }

    pub fn with_build_bounds(mut self, bounds: Bounds) -> Self {
        self.build_bounds = Some(bounds);
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        self.settings.validate()?;
        self.auto_offmesh.validate()?;
        self.island_links.validate()?;
        if self.streaming.max_resident_tiles == 0 {
            return Err("Max resident tiles must be at least one".to_string());
        }
        if let Some(bounds) = &self.build_bounds {
            if !bounds.is_valid() {
                return Err("Build bounds invalid: min must not exceed max".to_string());
            }
        }
        Ok(())
    }

    #[cfg(feature = "serialization")]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("runtime config: {e}")))?;
        config.validate().map_err(Error::Config)?;
        Ok(config)
    }

    #[cfg(feature = "serialization")]
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Config(format!("runtime config: {e}")))
    }

    #[cfg(feature = "serialization")]
    pub fn load_json(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    #[cfg(feature = "serialization")]
    pub fn save_json(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let s = GenerationSettings::default();
        assert_eq!(s.mode, BuildMode::SingleMesh);
        assert_eq!(s.tile_size, 48);
        assert!((s.tile_world_size() - 14.4).abs() < 1e-4);
        assert_eq!(s.walkable_radius_cells(), 2);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_border_skirt_only_in_tiled_mode() {
        let s = GenerationSettings::default();
        assert_eq!(s.border_size_cells(), 0);
        let s = s.with_mode(BuildMode::Tiled);
        assert_eq!(s.border_size_cells(), 5);
        assert_eq!(s.to_meshing_config().tile_size_cells, 58);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(GenerationSettings::default()
            .with_cell_size(0.0)
            .validate()
            .is_err());
        assert!(GenerationSettings::default()
            .with_mode(BuildMode::Tiled)
            .with_tile_size(0)
            .validate()
            .is_err());
        assert!(GenerationSettings::default()
            .with_verts_per_poly(8)
            .validate()
            .is_err());
        assert!(AutoOffmeshParams::default()
            .with_height_diff_range(2.0, 1.0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_auto_offmesh_flags() {
        let p = AutoOffmeshParams::default();
        assert!(p.drop_jump_enabled());
        assert!(!p.facing_enabled());
        let p = p.with_flags(AutoOffmeshParams::GEN_FACING);
        assert!(!p.drop_jump_enabled());
        assert!(p.facing_enabled());
    }

    #[cfg(feature = "serialization")]
    #[test]
    fn test_runtime_config_json_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("runtime.json");

        let mut config = RuntimeConfig::default()
            .with_settings(GenerationSettings::default().with_mode(BuildMode::Tiled))
            .with_max_resident_tiles(12);
        config.path_query.area_costs.insert(nav_area::JUMP, 4.0);
        config.save_json(&path)?;

        let loaded = RuntimeConfig::load_json(&path)?;
        assert_eq!(loaded, config);
        Ok(())
    }

    #[cfg(feature = "serialization")]
    #[test]
    fn test_partial_json_uses_defaults() -> Result<()> {
        let config = RuntimeConfig::from_json(r#"{ "streaming": { "max_resident_tiles": 3 } }"#)?;
        assert_eq!(config.streaming.max_resident_tiles, 3);
        assert!(config.streaming.allow_build);
        assert_eq!(config.settings, GenerationSettings::default());
        Ok(())
    }

    #[cfg(feature = "serialization")]
    #[test]
    fn test_invalid_json_config_is_configuration_error() {
        let err = RuntimeConfig::from_json(r#"{ "streaming": { "max_resident_tiles": 0 } }"#)
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
