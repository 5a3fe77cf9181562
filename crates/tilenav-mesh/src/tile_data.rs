//! Relocatable per-tile payload and its binary framing
//!
//! A tile blob is self-contained: vertices, polygons, height detail and offmesh
//! connections owned by the tile. Layout (little-endian):
//!
//! ```text
//! TileHeader
//! verts        vert_count   x [f32; 3]
//! polys        poly_count   x { verts [u16; 6], neis [u16; 6], flags u16, vert_count u8, area u8, type u8 }
//! detail       poly_count   x { tri_base u32, tri_count u32 }
//! detail tris  detail_count x [f32; 9]
//! offmesh      con_count    x { pos [f32; 6], radius f32, poly u16, flags u16, area u8, dir u8, user_id u32 }
//! ```

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::Vec3;
use tilenav_common::{closest_height_on_triangle, point_in_polygon_2d, Bounds, Error, Result};

use crate::mesher::{ConnectorSegment, PolyMeshOutput};
use crate::{MAX_VERTS_PER_POLY, TILE_MAGIC, TILE_VERSION};

/// Neighbour slot value meaning "no internal neighbour"
const NULL_NEI: u16 = 0;

/// Polygon type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum PolyType {
    /// Regular ground polygon
    Ground,
    /// Two-vertex polygon standing in for an offmesh connection
    OffMeshConnection,
}

impl PolyType {
    fn to_u8(self) -> u8 {
        match self {
            PolyType::Ground => 0,
            PolyType::OffMeshConnection => 1,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(PolyType::Ground),
            1 => Ok(PolyType::OffMeshConnection),
            other => Err(Error::NavMesh(format!("unknown polygon type {other}"))),
        }
    }
}

/// Polygon in a tile
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Poly {
    /// Vertex indices into [`TileData::verts`]
    pub verts: [u16; MAX_VERTS_PER_POLY],
    /// Internal neighbour per edge, stored as `poly index + 1` (0 = none)
    pub neis: [u16; MAX_VERTS_PER_POLY],
    pub flags: u16,
    pub vert_count: u8,
    pub area: u8,
    pub poly_type: PolyType,
}

impl Poly {
    /// Internal neighbour across edge `edge`, if any.
    pub fn neighbor(&self, edge: usize) -> Option<u32> {
        match self.neis[edge] {
            NULL_NEI => None,
            n => Some(n as u32 - 1),
        }
    }

    pub fn vert_indices(&self) -> &[u16] {
        &self.verts[..self.vert_count as usize]
    }
}

/// Detail triangle range of a polygon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyDetail {
    pub tri_base: u32,
    pub tri_count: u32,
}

/// Offmesh connection stored in the tile that owns its start point
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct OffMeshConnection {
    pub start: Vec3,
    pub end: Vec3,
    pub radius: f32,
    /// Index of the connection's polygon in this tile
    pub poly: u16,
    pub flags: u16,
    pub area: u8,
    /// Direction (bidir = 0, start->end only = 1)
    pub dir: u8,
    pub user_id: u32,
}

impl OffMeshConnection {
    pub fn is_bidirectional(&self) -> bool {
        self.dir == 0
    }
}

/// Tile header information
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileHeader {
    pub magic: u32,
    pub version: u32,
    pub x: i32,
    pub y: i32,
    pub layer: i32,
    pub poly_count: u32,
    pub vert_count: u32,
    pub detail_tri_count: u32,
    pub off_mesh_con_count: u32,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub bmin: Vec3,
    pub bmax: Vec3,
}

impl TileHeader {
    const SIZE: usize = 4 * 9 + 4 * 3 + 4 * 6;

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_i32::<LittleEndian>(self.x)?;
        writer.write_i32::<LittleEndian>(self.y)?;
        writer.write_i32::<LittleEndian>(self.layer)?;
        writer.write_u32::<LittleEndian>(self.poly_count)?;
        writer.write_u32::<LittleEndian>(self.vert_count)?;
        writer.write_u32::<LittleEndian>(self.detail_tri_count)?;
        writer.write_u32::<LittleEndian>(self.off_mesh_con_count)?;
        writer.write_f32::<LittleEndian>(self.walkable_height)?;
        writer.write_f32::<LittleEndian>(self.walkable_radius)?;
        writer.write_f32::<LittleEndian>(self.walkable_climb)?;
        write_vec3(writer, self.bmin)?;
        write_vec3(writer, self.bmax)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != TILE_MAGIC {
            return Err(Error::NavMesh(format!("bad tile magic {magic:#010x}")));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != TILE_VERSION {
            return Err(Error::NavMesh(format!("unsupported tile version {version}")));
        }
        Ok(Self {
            magic,
            version,
            x: reader.read_i32::<LittleEndian>()?,
            y: reader.read_i32::<LittleEndian>()?,
            layer: reader.read_i32::<LittleEndian>()?,
            poly_count: reader.read_u32::<LittleEndian>()?,
            vert_count: reader.read_u32::<LittleEndian>()?,
            detail_tri_count: reader.read_u32::<LittleEndian>()?,
            off_mesh_con_count: reader.read_u32::<LittleEndian>()?,
            walkable_height: reader.read_f32::<LittleEndian>()?,
            walkable_radius: reader.read_f32::<LittleEndian>()?,
            walkable_climb: reader.read_f32::<LittleEndian>()?,
            bmin: read_vec3(reader)?,
            bmax: read_vec3(reader)?,
        })
    }
}

/// Agent dimensions recorded in the header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileAgentInfo {
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
}

/// Complete contents of one tile
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileData {
    pub header: TileHeader,
    pub verts: Vec<Vec3>,
    pub polys: Vec<Poly>,
    pub detail_meshes: Vec<PolyDetail>,
    pub detail_tris: Vec<[Vec3; 3]>,
    pub off_mesh_cons: Vec<OffMeshConnection>,
}

impl TileData {
    const POLY_SIZE: usize = 2 * MAX_VERTS_PER_POLY * 2 + 2 + 3;
    const OFF_MESH_CON_SIZE: usize = 4 * 7 + 2 + 2 + 1 + 1 + 4;

    /// Assembles tile data from pipeline output plus the connectors owned by the tile.
    ///
    /// Ground polygons come first; each connector appends a two-vertex polygon.
    pub fn from_mesh_output(
        tx: i32,
        ty: i32,
        mesh: &PolyMeshOutput,
        connectors: &[ConnectorSegment],
        tile_bounds: Bounds,
        agent: TileAgentInfo,
    ) -> Result<Self> {
        let mut verts = mesh.verts.clone();
        let mut polys = Vec::with_capacity(mesh.polys.len() + connectors.len());

        for (pi, src) in mesh.polys.iter().enumerate() {
            if src.verts.len() < 3 || src.verts.len() > MAX_VERTS_PER_POLY {
                return Err(Error::NavMesh(format!(
                    "polygon {pi} has {} vertices, expected 3..={MAX_VERTS_PER_POLY}",
                    src.verts.len()
                )));
            }
            let mut poly = Poly {
                verts: [0; MAX_VERTS_PER_POLY],
                neis: [NULL_NEI; MAX_VERTS_PER_POLY],
                flags: src.flags,
                vert_count: src.verts.len() as u8,
                area: src.area,
                poly_type: PolyType::Ground,
            };
            for (i, &v) in src.verts.iter().enumerate() {
                if v as usize >= verts.len() {
                    return Err(Error::NavMesh(format!(
                        "polygon {pi} references missing vertex {v}"
                    )));
                }
                poly.verts[i] = v;
                poly.neis[i] = src
                    .neighbors
                    .get(i)
                    .copied()
                    .flatten()
                    .map_or(NULL_NEI, |n| n + 1);
            }
            polys.push(poly);
        }

        // Detail triangles grouped per polygon
        let mut per_poly: Vec<Vec<[Vec3; 3]>> = vec![Vec::new(); polys.len()];
        for tri in &mesh.detail {
            if let Some(slot) = per_poly.get_mut(tri.poly as usize) {
                slot.push(tri.verts);
            }
        }
        let mut detail_meshes = Vec::with_capacity(polys.len());
        let mut detail_tris = Vec::new();
        for tris in per_poly {
            detail_meshes.push(PolyDetail {
                tri_base: detail_tris.len() as u32,
                tri_count: tris.len() as u32,
            });
            detail_tris.extend(tris);
        }

        let mut off_mesh_cons = Vec::with_capacity(connectors.len());
        for con in connectors {
            let base = u16::try_from(verts.len())
                .map_err(|_| Error::NavMesh("tile exceeds 65535 vertices".to_string()))?;
            let poly_index = u16::try_from(polys.len())
                .map_err(|_| Error::NavMesh("tile exceeds 65535 polygons".to_string()))?;
            verts.push(con.start);
            verts.push(con.end);

            let mut poly_verts = [0; MAX_VERTS_PER_POLY];
            poly_verts[0] = base;
            poly_verts[1] = base + 1;
            polys.push(Poly {
                verts: poly_verts,
                neis: [NULL_NEI; MAX_VERTS_PER_POLY],
                flags: con.flags,
                vert_count: 2,
                area: con.area,
                poly_type: PolyType::OffMeshConnection,
            });
            off_mesh_cons.push(OffMeshConnection {
                start: con.start,
                end: con.end,
                radius: con.radius,
                poly: poly_index,
                flags: con.flags,
                area: con.area,
                dir: if con.bidirectional { 0 } else { 1 },
                user_id: con.user_id,
            });
        }

        let mut bounds = Bounds::from_points(verts.iter());
        if !bounds.is_valid() {
            bounds = tile_bounds;
        }

        Ok(Self {
            header: TileHeader {
                magic: TILE_MAGIC,
                version: TILE_VERSION,
                x: tx,
                y: ty,
                layer: 0,
                poly_count: polys.len() as u32,
                vert_count: verts.len() as u32,
                detail_tri_count: detail_tris.len() as u32,
                off_mesh_con_count: off_mesh_cons.len() as u32,
                walkable_height: agent.walkable_height,
                walkable_radius: agent.walkable_radius,
                walkable_climb: agent.walkable_climb,
                bmin: bounds.min,
                bmax: bounds.max,
            },
            verts,
            polys,
            detail_meshes,
            detail_tris,
            off_mesh_cons,
        })
    }

    /// Number of ground polygons (offmesh polygons follow them).
    pub fn ground_poly_count(&self) -> usize {
        self.detail_meshes.len()
    }

    pub fn poly_verts(&self, poly: &Poly) -> Vec<Vec3> {
        poly.vert_indices()
            .iter()
            .map(|&v| self.verts[v as usize])
            .collect()
    }

    /// Centroid of polygon `index`.
    pub fn poly_center(&self, index: usize) -> Vec3 {
        let poly = &self.polys[index];
        let n = poly.vert_count.max(1) as f32;
        poly.vert_indices()
            .iter()
            .fold(Vec3::ZERO, |acc, &v| acc + self.verts[v as usize])
            / n
    }

    /// Surface height of ground polygon `index` under `pos`, from the detail mesh.
    pub fn poly_height(&self, index: usize, pos: Vec3) -> Option<f32> {
        let detail = self.detail_meshes.get(index)?;
        let start = detail.tri_base as usize;
        let end = start + detail.tri_count as usize;
        self.detail_tris[start..end]
            .iter()
            .find_map(|[a, b, c]| closest_height_on_triangle(pos, *a, *b, *c))
    }

    /// Ground polygon containing `pos` on XZ whose surface is within `max_dy` of it.
    pub fn find_poly_containing(&self, pos: Vec3, max_dy: f32) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for index in 0..self.ground_poly_count() {
            let verts = self.poly_verts(&self.polys[index]);
            if !point_in_polygon_2d(pos, &verts) {
                continue;
            }
            let h = self.poly_height(index, pos).unwrap_or(self.poly_center(index).y);
            let dy = (h - pos.y).abs();
            if dy <= max_dy && best.map_or(true, |(_, d)| dy < d) {
                best = Some((index, dy));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Serializes the tile into its blob form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(
            TileHeader::SIZE + self.verts.len() * 12 + self.polys.len() * Self::POLY_SIZE,
        );
        self.write_to(&mut out)?;
        Ok(out)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.header.write_to(writer)?;
        for v in &self.verts {
            write_vec3(writer, *v)?;
        }
        for poly in &self.polys {
            for v in poly.verts {
                writer.write_u16::<LittleEndian>(v)?;
            }
            for n in poly.neis {
                writer.write_u16::<LittleEndian>(n)?;
            }
            writer.write_u16::<LittleEndian>(poly.flags)?;
            writer.write_u8(poly.vert_count)?;
            writer.write_u8(poly.area)?;
            writer.write_u8(poly.poly_type.to_u8())?;
        }
        for d in &self.detail_meshes {
            writer.write_u32::<LittleEndian>(d.tri_base)?;
            writer.write_u32::<LittleEndian>(d.tri_count)?;
        }
        for tri in &self.detail_tris {
            for v in tri {
                write_vec3(writer, *v)?;
            }
        }
        for con in &self.off_mesh_cons {
            write_vec3(writer, con.start)?;
            write_vec3(writer, con.end)?;
            writer.write_f32::<LittleEndian>(con.radius)?;
            writer.write_u16::<LittleEndian>(con.poly)?;
            writer.write_u16::<LittleEndian>(con.flags)?;
            writer.write_u8(con.area)?;
            writer.write_u8(con.dir)?;
            writer.write_u32::<LittleEndian>(con.user_id)?;
        }
        Ok(())
    }

    /// Parses and validates a tile blob.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(data);
        let header = TileHeader::read_from(&mut reader)?;

        let ground_count = header
            .poly_count
            .checked_sub(header.off_mesh_con_count)
            .ok_or_else(|| Error::NavMesh("offmesh count exceeds polygon count".to_string()))?;

        // Cheap size check before allocating from untrusted counts
        let expected = TileHeader::SIZE as u64
            + header.vert_count as u64 * 12
            + header.poly_count as u64 * Self::POLY_SIZE as u64
            + ground_count as u64 * 8
            + header.detail_tri_count as u64 * 36
            + header.off_mesh_con_count as u64 * Self::OFF_MESH_CON_SIZE as u64;
        if expected != data.len() as u64 {
            return Err(Error::NavMesh(format!(
                "tile blob is {} bytes, header describes {expected}",
                data.len()
            )));
        }

        let mut verts = Vec::with_capacity(header.vert_count as usize);
        for _ in 0..header.vert_count {
            verts.push(read_vec3(&mut reader)?);
        }

        let mut polys = Vec::with_capacity(header.poly_count as usize);
        for _ in 0..header.poly_count {
            let mut pv = [0u16; MAX_VERTS_PER_POLY];
            for v in pv.iter_mut() {
                *v = reader.read_u16::<LittleEndian>()?;
            }
            let mut neis = [0u16; MAX_VERTS_PER_POLY];
            for n in neis.iter_mut() {
                *n = reader.read_u16::<LittleEndian>()?;
            }
            let flags = reader.read_u16::<LittleEndian>()?;
            let vert_count = reader.read_u8()?;
            let area = reader.read_u8()?;
            let poly_type = PolyType::from_u8(reader.read_u8()?)?;
            if vert_count as usize > MAX_VERTS_PER_POLY
                || pv[..vert_count as usize]
                    .iter()
                    .any(|&v| v as u32 >= header.vert_count)
            {
                return Err(Error::NavMesh("polygon vertex out of range".to_string()));
            }
            polys.push(Poly {
                verts: pv,
                neis,
                flags,
                vert_count,
                area,
                poly_type,
            });
        }

        let mut detail_meshes = Vec::with_capacity(ground_count as usize);
        for _ in 0..ground_count {
            let d = PolyDetail {
                tri_base: reader.read_u32::<LittleEndian>()?,
                tri_count: reader.read_u32::<LittleEndian>()?,
            };
            if d.tri_base as u64 + d.tri_count as u64 > header.detail_tri_count as u64 {
                return Err(Error::NavMesh("detail range out of bounds".to_string()));
            }
            detail_meshes.push(d);
        }

        let mut detail_tris = Vec::with_capacity(header.detail_tri_count as usize);
        for _ in 0..header.detail_tri_count {
            detail_tris.push([
                read_vec3(&mut reader)?,
                read_vec3(&mut reader)?,
                read_vec3(&mut reader)?,
            ]);
        }

        let mut off_mesh_cons = Vec::with_capacity(header.off_mesh_con_count as usize);
        for _ in 0..header.off_mesh_con_count {
            let con = OffMeshConnection {
                start: read_vec3(&mut reader)?,
                end: read_vec3(&mut reader)?,
                radius: reader.read_f32::<LittleEndian>()?,
                poly: reader.read_u16::<LittleEndian>()?,
                flags: reader.read_u16::<LittleEndian>()?,
                area: reader.read_u8()?,
                dir: reader.read_u8()?,
                user_id: reader.read_u32::<LittleEndian>()?,
            };
            if con.poly as u32 >= header.poly_count {
                return Err(Error::NavMesh("offmesh polygon out of range".to_string()));
            }
            off_mesh_cons.push(con);
        }

        Ok(Self {
            header,
            verts,
            polys,
            detail_meshes,
            detail_tris,
            off_mesh_cons,
        })
    }
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
