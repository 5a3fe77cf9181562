//! Disk-backed tile store
//!
//! One file holds every tile blob of a grid, an index of where each blob lives and the
//! grid parameters the tiles were built for. Layout (little-endian):
//!
//! ```text
//! header   u32 magic, u32 version, u32 tile_count, u32 index_offset,
//!          f32 origin[3], f32 tile_width, f32 tile_height, i32 max_tiles, i32 max_polys
//! payloads tile blobs back to back
//! index    tile_count x { i32 tx, i32 ty, u32 data_size, u32 data_offset, u64 content_hash }
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tilenav_common::{Bounds, Error, Result};
use tilenav_mesh::{tile_key, NavMeshParams};

use crate::container::NavMeshContainer;
use crate::grid::TileGrid;

/// Magic number for tile store files ('TNDB')
pub const TILE_STORE_MAGIC: u32 = u32::from_be_bytes(*b"TNDB");

/// Current tile store version
pub const TILE_STORE_VERSION: u32 = 1;

const HEADER_SIZE: u64 = 16 + GridParamsBlob::SIZE;
const INDEX_ENTRY_SIZE: u64 = 24;

/// Origin and tile sizes may differ by this much and still be compatible
const PARAM_EPSILON: f32 = 1e-3;

/// Grid parameters stored in the file header
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridParamsBlob {
    pub origin: [f32; 3],
    pub tile_width: f32,
    pub tile_height: f32,
    pub max_tiles: i32,
    pub max_polys: i32,
}

impl GridParamsBlob {
    const SIZE: u64 = 28;

    /// Checks that tiles stored under `self` can be loaded into a container with `live`
    /// parameters.
    pub fn check_compatible(&self, live: &GridParamsBlob) -> Result<()> {
        let close = |a: f32, b: f32| (a - b).abs() <= PARAM_EPSILON;
        if !(0..3).all(|i| close(self.origin[i], live.origin[i])) {
            return Err(Error::IncompatibleStore(format!(
                "origin {:?} differs from live origin {:?}",
                self.origin, live.origin
            )));
        }
        if !close(self.tile_width, live.tile_width) || !close(self.tile_height, live.tile_height)
        {
            return Err(Error::IncompatibleStore(format!(
                "tile size {} x {} differs from live {} x {}",
                self.tile_width, self.tile_height, live.tile_width, live.tile_height
            )));
        }
        if live.max_tiles < self.max_tiles || live.max_polys < self.max_polys {
            return Err(Error::IncompatibleStore(format!(
                "stored limits {} tiles / {} polys exceed live {} / {}",
                self.max_tiles, self.max_polys, live.max_tiles, live.max_polys
            )));
        }
        Ok(())
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for v in self.origin {
            writer.write_f32::<LittleEndian>(v)?;
        }
        writer.write_f32::<LittleEndian>(self.tile_width)?;
        writer.write_f32::<LittleEndian>(self.tile_height)?;
        writer.write_i32::<LittleEndian>(self.max_tiles)?;
        writer.write_i32::<LittleEndian>(self.max_polys)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut origin = [0.0; 3];
        for v in &mut origin {
            *v = reader.read_f32::<LittleEndian>()?;
        }
        Ok(Self {
            origin,
            tile_width: reader.read_f32::<LittleEndian>()?,
            tile_height: reader.read_f32::<LittleEndian>()?,
            max_tiles: reader.read_i32::<LittleEndian>()?,
            max_polys: reader.read_i32::<LittleEndian>()?,
        })
    }
}

impl From<&NavMeshParams> for GridParamsBlob {
    fn from(params: &NavMeshParams) -> Self {
        Self {
            origin: params.origin.to_array(),
            tile_width: params.tile_width,
            tile_height: params.tile_height,
            max_tiles: params.max_tiles.min(i32::MAX as u32) as i32,
            max_polys: params.max_polys.min(i32::MAX as u32) as i32,
        }
    }
}

/// Location of one tile blob in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileIndexEntry {
    pub tx: i32,
    pub ty: i32,
    pub data_offset: u32,
    pub data_size: u32,
    pub content_hash: u64,
}

/// A tile handed to the writer
#[derive(Debug, Clone, Copy)]
pub struct TileRecord<'a> {
    pub tx: i32,
    pub ty: i32,
    pub content_hash: u64,
    pub blob: &'a [u8],
}

/// Writes a complete store: header placeholder, payloads, index, then the final header.
pub fn write_tile_db<'a, W: Write + Seek>(
    writer: &mut W,
    params: &GridParamsBlob,
    records: impl IntoIterator<Item = TileRecord<'a>>,
) -> Result<Vec<TileIndexEntry>> {
    let base = writer.stream_position()?;
    write_header(writer, 0, 0, params)?;

    let mut entries = Vec::new();
    for record in records {
        let offset = writer.stream_position()? - base;
        let data_offset = u32::try_from(offset)
            .map_err(|_| Error::Store(format!("tile data offset {offset} exceeds 4 GiB")))?;
        let data_size = u32::try_from(record.blob.len())
            .map_err(|_| Error::Store(format!("tile ({}, {}) blob too large", record.tx, record.ty)))?;
        writer.write_all(record.blob)?;
        entries.push(TileIndexEntry {
            tx: record.tx,
            ty: record.ty,
            data_offset,
            data_size,
            content_hash: record.content_hash,
        });
    }

    let index_pos = writer.stream_position()? - base;
    let index_offset = u32::try_from(index_pos)
        .map_err(|_| Error::Store(format!("index offset {index_pos} exceeds 4 GiB")))?;
    for entry in &entries {
        writer.write_i32::<LittleEndian>(entry.tx)?;
        writer.write_i32::<LittleEndian>(entry.ty)?;
        writer.write_u32::<LittleEndian>(entry.data_size)?;
        writer.write_u32::<LittleEndian>(entry.data_offset)?;
        writer.write_u64::<LittleEndian>(entry.content_hash)?;
    }
    let end = writer.stream_position()?;

    writer.seek(SeekFrom::Start(base))?;
    write_header(writer, entries.len() as u32, index_offset, params)?;
    writer.seek(SeekFrom::Start(end))?;
    writer.flush()?;
    Ok(entries)
}

fn write_header<W: Write>(
    writer: &mut W,
    tile_count: u32,
    index_offset: u32,
    params: &GridParamsBlob,
) -> Result<()> {
    writer.write_u32::<LittleEndian>(TILE_STORE_MAGIC)?;
    writer.write_u32::<LittleEndian>(TILE_STORE_VERSION)?;
    writer.write_u32::<LittleEndian>(tile_count)?;
    writer.write_u32::<LittleEndian>(index_offset)?;
    params.write_to(writer)
}

/// Reads and validates the header and index of a store.
pub fn read_tile_db_index<R: Read + Seek>(
    reader: &mut R,
) -> Result<(GridParamsBlob, Vec<TileIndexEntry>)> {
    let base = reader.stream_position()?;
    let len = reader.seek(SeekFrom::End(0))? - base;
    reader.seek(SeekFrom::Start(base))?;
    if len < HEADER_SIZE {
        return Err(Error::Store(format!("file of {len} bytes has no header")));
    }

    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != TILE_STORE_MAGIC {
        return Err(Error::Store(format!("bad magic {magic:#010x}")));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != TILE_STORE_VERSION {
        return Err(Error::Store(format!("unsupported version {version}")));
    }
    let tile_count = reader.read_u32::<LittleEndian>()? as u64;
    let index_offset = reader.read_u32::<LittleEndian>()? as u64;
    let params = GridParamsBlob::read_from(reader)?;

    if index_offset < HEADER_SIZE || index_offset + tile_count * INDEX_ENTRY_SIZE > len {
        return Err(Error::Store(format!(
            "index of {tile_count} entries at {index_offset} does not fit in {len} bytes"
        )));
    }

    reader.seek(SeekFrom::Start(base + index_offset))?;
    let mut entries = Vec::with_capacity(tile_count as usize);
    for _ in 0..tile_count {
        let entry = TileIndexEntry {
            tx: reader.read_i32::<LittleEndian>()?,
            ty: reader.read_i32::<LittleEndian>()?,
            data_size: reader.read_u32::<LittleEndian>()?,
            data_offset: reader.read_u32::<LittleEndian>()?,
            content_hash: reader.read_u64::<LittleEndian>()?,
        };
        let start = entry.data_offset as u64;
        if start < HEADER_SIZE || start + entry.data_size as u64 > index_offset {
            return Err(Error::Store(format!(
                "tile ({}, {}) payload lies outside the data section",
                entry.tx, entry.ty
            )));
        }
        entries.push(entry);
    }
    Ok((params, entries))
}

/// Reads one payload located by `entry` in a store that starts at `base` within `reader`.
pub fn read_tile_payload<R: Read + Seek>(
    reader: &mut R,
    base: u64,
    entry: &TileIndexEntry,
) -> Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(base + entry.data_offset as u64))?;
    let mut blob = vec![0; entry.data_size as usize];
    reader.read_exact(&mut blob)?;
    Ok(blob)
}

/// File-backed tile store with a cached index.
///
/// The index is re-read only when the file's modification time changes.
#[derive(Debug)]
pub struct TileCacheStore {
    path: PathBuf,
    params: Option<GridParamsBlob>,
    index: HashMap<u64, TileIndexEntry>,
    loaded_mtime: Option<SystemTime>,
}

impl TileCacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            params: None,
            index: HashMap::new(),
            loaded_mtime: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn is_loaded(&self) -> bool {
        self.params.is_some()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Grid parameters of the loaded index.
    pub fn params(&self) -> Option<&GridParamsBlob> {
        self.params.as_ref()
    }

    /// Full rewrite of the file from `records`.
    pub fn save<'a>(
        &mut self,
        params: &NavMeshParams,
        records: impl IntoIterator<Item = TileRecord<'a>>,
    ) -> Result<usize> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let blob_params = GridParamsBlob::from(params);
        let mut writer = BufWriter::new(File::create(&self.path)?);
        let entries = write_tile_db(&mut writer, &blob_params, records)?;
        writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?
            .sync_all()?;

        self.params = Some(blob_params);
        self.index = entries
            .iter()
            .map(|e| (tile_key(e.tx, e.ty), *e))
            .collect();
        self.loaded_mtime = self.modified_time();
        log::info!(
            "Saved {} tiles to {}",
            entries.len(),
            self.path.display()
        );
        Ok(entries.len())
    }

    /// Serializes the live container into the store.
    pub fn save_container(&mut self, container: &NavMeshContainer) -> Result<usize> {
        let params = *container.params();
        self.save(&params, container.records())
    }

    /// Loads the index if the file changed since the last load.
    ///
    /// Returns `Ok(true)` when the index was (re)read. A missing file clears the index.
    /// A corrupt or incompatible file clears the index and reports the error.
    pub fn load_index(&mut self, live: &NavMeshParams) -> Result<bool> {
        if !self.exists() {
            self.reset();
            return Ok(false);
        }
        let mtime = self.modified_time();
        if self.is_loaded() && mtime.is_some() && mtime == self.loaded_mtime {
            return Ok(false);
        }

        match self.read_index(live) {
            Ok((params, entries)) => {
                self.params = Some(params);
                self.index = entries
                    .into_iter()
                    .map(|e| (tile_key(e.tx, e.ty), e))
                    .collect();
                self.loaded_mtime = mtime;
                log::info!(
                    "Loaded tile store index with {} tiles from {}",
                    self.index.len(),
                    self.path.display()
                );
                Ok(true)
            }
            Err(e) => {
                log::warn!("Ignoring tile store {}: {e}", self.path.display());
                self.reset();
                Err(e)
            }
        }
    }

    fn read_index(&self, live: &NavMeshParams) -> Result<(GridParamsBlob, Vec<TileIndexEntry>)> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let (params, entries) = read_tile_db_index(&mut reader)?;
        params.check_compatible(&GridParamsBlob::from(live))?;
        Ok((params, entries))
    }

    fn reset(&mut self) {
        self.params = None;
        self.index.clear();
        self.loaded_mtime = None;
    }

    fn modified_time(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    pub fn entry(&self, tx: i32, ty: i32) -> Option<&TileIndexEntry> {
        self.index.get(&tile_key(tx, ty))
    }

    /// Index entries sorted by coordinate.
    pub fn entries(&self) -> Vec<TileIndexEntry> {
        let mut entries: Vec<_> = self.index.values().copied().collect();
        entries.sort_unstable_by_key(|e| (e.tx, e.ty));
        entries
    }

    /// Reads the blob of an indexed tile.
    pub fn read_tile(&self, tx: i32, ty: i32) -> Result<Option<(Vec<u8>, u64)>> {
        let Some(entry) = self.entry(tx, ty) else {
            return Ok(None);
        };
        let mut file = File::open(&self.path)?;
        let blob = read_tile_payload(&mut file, 0, entry)?;
        Ok(Some((blob, entry.content_hash)))
    }

    /// Loads every indexed tile overlapping `area` that is not already resident.
    ///
    /// Individual tiles that fail to load are skipped, and a corrupt or incompatible
    /// store loads nothing. Returns the number loaded.
    pub fn load_tiles_in_bounds(
        &mut self,
        container: &mut NavMeshContainer,
        grid: &TileGrid,
        area: &Bounds,
    ) -> Result<usize> {
        if self.load_index(container.params()).is_err() || !self.is_loaded() {
            return Ok(0);
        }
        let mut loaded = 0;
        for (tx, ty) in grid.tiles_in_bounds(area) {
            if container.has_tile(tx, ty) || self.entry(tx, ty).is_none() {
                continue;
            }
            match self.read_tile(tx, ty) {
                Ok(Some((blob, hash))) => match container.add_blob(tx, ty, blob, hash) {
                    Ok(_) => loaded += 1,
                    Err(e) => log::warn!("Skipping stored tile ({tx}, {ty}): {e}"),
                },
                Ok(None) => {}
                Err(e) => log::warn!("Skipping stored tile ({tx}, {ty}): {e}"),
            }
        }
        log::debug!("Loaded {loaded} stored tiles in bounds");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::test_helpers::{flat_tile_blob, small_params};

    #[test]
    fn test_round_trip_in_memory() -> Result<()> {
        let a = flat_tile_blob(0, 0);
        let b = flat_tile_blob(1, 0);
        let params = GridParamsBlob::from(&small_params());
        let records = [
            TileRecord { tx: 0, ty: 0, content_hash: 11, blob: &a },
            TileRecord { tx: 1, ty: 0, content_hash: 22, blob: &b },
        ];

        let mut cursor = Cursor::new(Vec::new());
        let written = write_tile_db(&mut cursor, &params, records)?;
        assert_eq!(written[0].data_offset as u64, HEADER_SIZE);

        cursor.set_position(0);
        let (read_params, entries) = read_tile_db_index(&mut cursor)?;
        assert_eq!(read_params, params);
        assert_eq!(entries, written);
        let summary: Vec<_> = entries
            .iter()
            .map(|e| (e.tx, e.ty, e.data_size as usize, e.content_hash))
            .collect();
        assert_eq!(summary, vec![(0, 0, a.len(), 11), (1, 0, b.len(), 22)]);

        assert_eq!(read_tile_payload(&mut cursor, 0, &entries[1])?, b);
        Ok(())
    }

    #[test]
    fn test_store_embedded_after_a_prefix() -> Result<()> {
        let a = flat_tile_blob(0, 0);
        let b = flat_tile_blob(3, 2);
        let params = GridParamsBlob::from(&small_params());
        let records = [
            TileRecord { tx: 0, ty: 0, content_hash: 1, blob: &a },
            TileRecord { tx: 3, ty: 2, content_hash: 2, blob: &b },
        ];

        let mut cursor = Cursor::new(Vec::new());
        cursor.write_all(b"prefix!")?;
        let base = cursor.stream_position()?;
        write_tile_db(&mut cursor, &params, records)?;

        cursor.set_position(base);
        let (_, entries) = read_tile_db_index(&mut cursor)?;
        assert_eq!(read_tile_payload(&mut cursor, base, &entries[0])?, a);
        assert_eq!(read_tile_payload(&mut cursor, base, &entries[1])?, b);
        Ok(())
    }

    #[test]
    fn test_header_layout() -> Result<()> {
        let params = GridParamsBlob::from(&small_params());
        let mut cursor = Cursor::new(Vec::new());
        write_tile_db(&mut cursor, &params, [])?;
        let bytes = cursor.into_inner();
        assert_eq!(bytes.len() as u64, HEADER_SIZE);
        assert_eq!(&bytes[0..4], &TILE_STORE_MAGIC.to_le_bytes());
        assert_eq!(&bytes[12..16], &(HEADER_SIZE as u32).to_le_bytes());
        Ok(())
    }

    #[test]
    fn test_corrupt_input_is_rejected() -> Result<()> {
        let blob = flat_tile_blob(0, 0);
        let params = GridParamsBlob::from(&small_params());
        let mut cursor = Cursor::new(Vec::new());
        write_tile_db(&mut cursor, &params, [TileRecord { tx: 0, ty: 0, content_hash: 1, blob: &blob }])?;
        let bytes = cursor.into_inner();

        let mut bad_magic = bytes.clone();
        bad_magic[0] ^= 0xff;
        assert!(read_tile_db_index(&mut Cursor::new(bad_magic)).is_err());

        let truncated = bytes[..bytes.len() - 4].to_vec();
        assert!(read_tile_db_index(&mut Cursor::new(truncated)).is_err());

        assert!(read_tile_db_index(&mut Cursor::new(vec![0u8; 8])).is_err());
        Ok(())
    }

    #[test]
    fn test_compatibility_guard() {
        let stored = GridParamsBlob::from(&small_params());

        let mut live = stored;
        live.origin[0] += 0.0005;
        live.max_tiles += 10;
        assert!(stored.check_compatible(&live).is_ok());

        let mut moved = stored;
        moved.origin[2] += 1.0;
        assert!(matches!(
            stored.check_compatible(&moved),
            Err(Error::IncompatibleStore(_))
        ));

        let mut resized = stored;
        resized.tile_width *= 2.0;
        assert!(stored.check_compatible(&resized).is_err());

        let mut smaller = stored;
        smaller.max_polys /= 2;
        assert!(stored.check_compatible(&smaller).is_err());
    }

    #[test]
    fn test_file_store_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tiles.tndb");
        let mut container = NavMeshContainer::new(small_params())?;
        container.add_blob(0, 0, flat_tile_blob(0, 0), 5)?;
        container.add_blob(2, 1, flat_tile_blob(2, 1), 6)?;

        let mut store = TileCacheStore::new(&path);
        assert_eq!(store.save_container(&container)?, 2);

        let mut reopened = TileCacheStore::new(&path);
        assert!(reopened.load_index(&small_params())?);
        assert!(!reopened.load_index(&small_params())?);
        assert_eq!(reopened.len(), 2);

        let (blob, hash) = reopened.read_tile(2, 1)?.unwrap();
        assert_eq!(hash, 6);
        assert_eq!(blob, container.nav_mesh().tile_at(2, 1, 0).unwrap().blob());
        assert!(reopened.read_tile(1, 1)?.is_none());
        Ok(())
    }

    #[test]
    fn test_incompatible_file_is_treated_as_absent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tiles.tndb");
        let mut container = NavMeshContainer::new(small_params())?;
        container.add_blob(0, 0, flat_tile_blob(0, 0), 5)?;
        TileCacheStore::new(&path).save_container(&container)?;

        let mut other = small_params();
        other.tile_width = 8.0;
        let mut store = TileCacheStore::new(&path);
        assert!(store.load_index(&other).is_err());
        assert!(!store.is_loaded());
        assert!(store.entry(0, 0).is_none());
        Ok(())
    }

    #[test]
    fn test_missing_file_is_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = TileCacheStore::new(dir.path().join("none.tndb"));
        assert!(!store.load_index(&small_params())?);
        assert!(store.is_empty());
        Ok(())
    }
}
