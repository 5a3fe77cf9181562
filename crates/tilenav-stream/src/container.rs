//! Live tile set with the content hash each tile was built from

use std::collections::HashMap;

use tilenav_common::Result;
use tilenav_mesh::{tile_key, NavMesh, NavMeshParams, TileId};

use crate::tile_builder::BuiltTile;
use crate::tile_store::TileRecord;

/// The live navigation mesh plus per-tile content hashes.
///
/// Hashes travel with the tiles so a store written from this set can be validated
/// against freshly derived geometry hashes later.
#[derive(Debug)]
pub struct NavMeshContainer {
    nav: NavMesh,
    hashes: HashMap<u64, u64>,
}

impl NavMeshContainer {
    pub fn new(params: NavMeshParams) -> Result<Self> {
        Ok(Self {
            nav: NavMesh::new(params)?,
            hashes: HashMap::new(),
        })
    }

    pub fn nav_mesh(&self) -> &NavMesh {
        &self.nav
    }

    pub fn params(&self) -> &NavMeshParams {
        self.nav.params()
    }

    pub fn tile_count(&self) -> usize {
        self.nav.tile_count()
    }

    pub fn is_empty(&self) -> bool {
        self.nav.is_empty()
    }

    pub fn has_tile(&self, tx: i32, ty: i32) -> bool {
        self.nav.has_tile(tx, ty)
    }

    pub fn content_hash(&self, tx: i32, ty: i32) -> Option<u64> {
        self.hashes.get(&tile_key(tx, ty)).copied()
    }

    /// Adds or replaces the tile at the built tile's coordinate.
    pub fn add_or_replace(&mut self, tile: BuiltTile) -> Result<TileId> {
        self.add_blob(tile.tx, tile.ty, tile.blob, tile.content_hash)
    }

    pub fn add_blob(&mut self, tx: i32, ty: i32, blob: Vec<u8>, content_hash: u64) -> Result<TileId> {
        let id = self.nav.add_or_replace_tile(tx, ty, blob)?;
        self.hashes.insert(tile_key(tx, ty), content_hash);
        Ok(id)
    }

    /// Removes the tile at `(tx, ty)`. Returns whether a tile was present.
    pub fn remove(&mut self, tx: i32, ty: i32) -> bool {
        self.hashes.remove(&tile_key(tx, ty));
        self.nav.remove_tile(tx, ty).is_some()
    }

    pub fn clear(&mut self) {
        self.nav.clear();
        self.hashes.clear();
    }

    pub fn tile_coords(&self) -> Vec<(i32, i32)> {
        self.nav.tile_coords()
    }

    /// Every live tile as a store record, sorted by coordinate.
    pub fn records(&self) -> Vec<TileRecord<'_>> {
        self.nav
            .tile_coords()
            .into_iter()
            .filter_map(|(tx, ty)| {
                let tile = self.nav.tile_at(tx, ty, 0)?;
                Some(TileRecord {
                    tx,
                    ty,
                    content_hash: self.content_hash(tx, ty).unwrap_or(0),
                    blob: tile.blob(),
                })
            })
            .collect()
    }
}
