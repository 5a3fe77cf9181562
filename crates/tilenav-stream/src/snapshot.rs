//! Whole-runtime snapshot: settings, instances, links and the tile store bytes
//!
//! Layout (little-endian):
//!
//! ```text
//! u32 magic, u32 version, u32 flags, u32 instance_count, u32 link_count, u32 tile_db_size
//! settings
//! [world bounds]   when flags & HAS_WORLD_BOUNDS
//! [build bounds]   when flags & HAS_BUILD_BOUNDS
//! instances        id, position, rotation, source bounds, vertices, indices
//! links
//! tile db bytes
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::Vec3;
use tilenav_common::{Bounds, Error, Result, TriMesh};

use crate::config::{BuildMode, GenerationSettings};
use crate::offmesh::OffmeshLink;

/// Magic number for runtime snapshots ('TNSS')
pub const SNAPSHOT_MAGIC: u32 = u32::from_be_bytes(*b"TNSS");

/// Current snapshot version
pub const SNAPSHOT_VERSION: u32 = 1;

const HAS_WORLD_BOUNDS: u32 = 1 << 0;
const HAS_BUILD_BOUNDS: u32 = 1 << 1;

/// Upper bound on any single count read from a snapshot
const MAX_RECORD_COUNT: u32 = 1 << 28;

/// One geometry instance as stored in a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInstance {
    pub id: String,
    pub position: Vec3,
    /// Euler angles in degrees
    pub rotation: Vec3,
    /// Bounds of the untransformed source mesh
    pub source_bounds: Bounds,
    pub mesh: TriMesh,
}

/// Everything needed to restore a runtime without rebuilding its tiles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeSnapshot {
    pub settings: GenerationSettings,
    pub world_bounds: Option<Bounds>,
    pub build_bounds: Option<Bounds>,
    pub instances: Vec<SnapshotInstance>,
    pub links: Vec<OffmeshLink>,
    /// Raw tile store file, empty when no tiles were saved
    pub tile_db: Vec<u8>,
}

impl RuntimeSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::read_from(&mut std::io::Cursor::new(data))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        log::info!(
            "Saved snapshot with {} instances and {} links to {}",
            self.instances.len(),
            self.links.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path.as_ref())?);
        Self::read_from(&mut reader)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut flags = 0;
        if self.world_bounds.is_some() {
            flags |= HAS_WORLD_BOUNDS;
        }
        if self.build_bounds.is_some() {
            flags |= HAS_BUILD_BOUNDS;
        }

        writer.write_u32::<LittleEndian>(SNAPSHOT_MAGIC)?;
        writer.write_u32::<LittleEndian>(SNAPSHOT_VERSION)?;
        writer.write_u32::<LittleEndian>(flags)?;
        writer.write_u32::<LittleEndian>(count_u32(self.instances.len(), "instances")?)?;
        writer.write_u32::<LittleEndian>(count_u32(self.links.len(), "links")?)?;
        writer.write_u32::<LittleEndian>(count_u32(self.tile_db.len(), "tile db bytes")?)?;

        write_settings(writer, &self.settings)?;
        if let Some(b) = &self.world_bounds {
            write_bounds(writer, b)?;
        }
        if let Some(b) = &self.build_bounds {
            write_bounds(writer, b)?;
        }

        for inst in &self.instances {
            let id = inst.id.as_bytes();
            writer.write_u32::<LittleEndian>(count_u32(id.len(), "id bytes")?)?;
            writer.write_all(id)?;
            write_vec3(writer, inst.position)?;
            write_vec3(writer, inst.rotation)?;
            write_bounds(writer, &inst.source_bounds)?;
            writer.write_u32::<LittleEndian>(count_u32(inst.mesh.vertices.len(), "vertices")?)?;
            writer.write_u32::<LittleEndian>(count_u32(inst.mesh.indices.len(), "indices")?)?;
            for &v in &inst.mesh.vertices {
                writer.write_f32::<LittleEndian>(v)?;
            }
            for &i in &inst.mesh.indices {
                writer.write_u32::<LittleEndian>(i)?;
            }
        }

        for link in &self.links {
            write_vec3(writer, link.start)?;
            write_vec3(writer, link.end)?;
            writer.write_f32::<LittleEndian>(link.radius)?;
            writer.write_u8(link.bidirectional as u8)?;
            writer.write_u8(link.area)?;
            writer.write_u16::<LittleEndian>(link.flags)?;
            writer.write_u32::<LittleEndian>(link.user_id)?;
        }

        writer.write_all(&self.tile_db)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != SNAPSHOT_MAGIC {
            return Err(Error::Store(format!("bad snapshot magic {magic:#010x}")));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != SNAPSHOT_VERSION {
            return Err(Error::Store(format!("unsupported snapshot version {version}")));
        }
        let flags = reader.read_u32::<LittleEndian>()?;
        let instance_count = read_count(reader)?;
        let link_count = read_count(reader)?;
        let db_size = read_count(reader)?;

        let settings = read_settings(reader)?;
        let world_bounds = if flags & HAS_WORLD_BOUNDS != 0 {
            Some(read_bounds(reader)?)
        } else {
            None
        };
        let build_bounds = if flags & HAS_BUILD_BOUNDS != 0 {
            Some(read_bounds(reader)?)
        } else {
            None
        };

        let mut instances = Vec::new();
        for _ in 0..instance_count {
            let id_len = read_count(reader)?;
            let mut id = vec![0; id_len];
            reader.read_exact(&mut id)?;
            let id = String::from_utf8(id)
                .map_err(|_| Error::Store("instance id is not valid UTF-8".to_string()))?;
            let position = read_vec3(reader)?;
            let rotation = read_vec3(reader)?;
            let source_bounds = read_bounds(reader)?;
            let vert_len = read_count(reader)?;
            let index_len = read_count(reader)?;
            let mut vertices = Vec::new();
            for _ in 0..vert_len {
                vertices.push(reader.read_f32::<LittleEndian>()?);
            }
            let mut indices = Vec::new();
            for _ in 0..index_len {
                indices.push(reader.read_u32::<LittleEndian>()?);
            }
            instances.push(SnapshotInstance {
                id,
                position,
                rotation,
                source_bounds,
                mesh: TriMesh::from_buffers(vertices, indices)?,
            });
        }

        let mut links = Vec::new();
        for _ in 0..link_count {
            let start = read_vec3(reader)?;
            let end = read_vec3(reader)?;
            let radius = reader.read_f32::<LittleEndian>()?;
            let bidirectional = reader.read_u8()? != 0;
            let area = reader.read_u8()?;
            let flags = reader.read_u16::<LittleEndian>()?;
            let user_id = reader.read_u32::<LittleEndian>()?;
            links.push(
                OffmeshLink::new(start, end, bidirectional)
                    .with_radius(radius)
                    .with_area(area)
                    .with_flags(flags)
                    .with_user_id(user_id),
            );
        }

        let mut tile_db = vec![0; db_size];
        reader.read_exact(&mut tile_db)?;

        Ok(Self {
            settings,
            world_bounds,
            build_bounds,
            instances,
            links,
            tile_db,
        })
    }
}

fn count_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Store(format!("too many {what} for a snapshot")))
}

fn read_count<R: Read>(reader: &mut R) -> Result<usize> {
    let n = reader.read_u32::<LittleEndian>()?;
    if n > MAX_RECORD_COUNT {
        return Err(Error::Store(format!("snapshot count {n} is implausible")));
    }
    Ok(n as usize)
}

fn write_vec3<W: Write>(writer: &mut W, v: Vec3) -> Result<()> {
    writer.write_f32::<LittleEndian>(v.x)?;
    writer.write_f32::<LittleEndian>(v.y)?;
    writer.write_f32::<LittleEndian>(v.z)?;
    Ok(())
}

fn read_vec3<R: Read>(reader: &mut R) -> Result<Vec3> {
    Ok(Vec3::new(
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
    ))
}

fn write_bounds<W: Write>(writer: &mut W, b: &Bounds) -> Result<()> {
    write_vec3(writer, b.min)?;
    write_vec3(writer, b.max)
}

fn read_bounds<R: Read>(reader: &mut R) -> Result<Bounds> {
    Ok(Bounds::new(read_vec3(reader)?, read_vec3(reader)?))
}

fn write_settings<W: Write>(writer: &mut W, s: &GenerationSettings) -> Result<()> {
    writer.write_u8(match s.mode {
        BuildMode::SingleMesh => 0,
        BuildMode::Tiled => 1,
    })?;
    for v in [
        s.cell_size,
        s.cell_height,
        s.agent_height,
        s.agent_radius,
        s.agent_max_climb,
        s.agent_max_slope,
        s.region_min_size,
        s.region_merge_size,
        s.edge_max_len,
        s.edge_max_error,
        s.detail_sample_dist,
        s.detail_sample_max_error,
    ] {
        writer.write_f32::<LittleEndian>(v)?;
    }
    writer.write_i32::<LittleEndian>(s.verts_per_poly)?;
    writer.write_i32::<LittleEndian>(s.tile_size)?;
    Ok(())
}

fn read_settings<R: Read>(reader: &mut R) -> Result<GenerationSettings> {
    let mode = match reader.read_u8()? {
        0 => BuildMode::SingleMesh,
        1 => BuildMode::Tiled,
        other => return Err(Error::Store(format!("unknown build mode {other}"))),
    };
    let mut f = [0.0f32; 12];
    for v in &mut f {
        *v = reader.read_f32::<LittleEndian>()?;
    }
    Ok(GenerationSettings {
        mode,
        cell_size: f[0],
        cell_height: f[1],
        agent_height: f[2],
        agent_radius: f[3],
        agent_max_climb: f[4],
        agent_max_slope: f[5],
        region_min_size: f[6],
        region_merge_size: f[7],
        edge_max_len: f[8],
        edge_max_error: f[9],
        detail_sample_dist: f[10],
        detail_sample_max_error: f[11],
        verts_per_poly: reader.read_i32::<LittleEndian>()?,
        tile_size: reader.read_i32::<LittleEndian>()?,
    })
}
