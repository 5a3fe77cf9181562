//! Tile table for a tiled navigation mesh
//!
//! Tiles are addressed by `(tx, ty, layer)` and own their blob bytes. Adding a tile at
//! an occupied coordinate replaces the old one in a single step, so readers never see
//! a coordinate without a tile during a swap.

use std::collections::HashMap;

use glam::Vec3;
use tilenav_common::{
    closest_point_on_segment_2d, dist_point_segment_sqr_2d, point_in_polygon_2d, Bounds, Error,
    Result,
};

use crate::tile_data::{OffMeshConnection, Poly, PolyType, TileData};
use crate::{PolyRef, TileId};

/// Grid and capacity parameters of a [`NavMesh`]
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct NavMeshParams {
    /// World position of tile (0, 0)'s minimum corner
    pub origin: Vec3,
    pub tile_width: f32,
    pub tile_height: f32,
    pub max_tiles: u32,
    /// Maximum polygons in any single tile
    pub max_polys: u32,
}

/// A tile resident in the container
#[derive(Debug)]
pub struct MeshTile {
    pub id: TileId,
    pub data: TileData,
    blob: Vec<u8>,
}

impl MeshTile {
    /// The exact bytes the tile was added from.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub fn coords(&self) -> (i32, i32) {
        (self.data.header.x, self.data.header.y)
    }

    pub fn bounds(&self) -> Bounds {
        Bounds::new(self.data.header.bmin, self.data.header.bmax)
    }
}

/// Quantized, order independent edge key for matching edges across tiles
type EdgeKey = ([i32; 3], [i32; 3]);

fn quantize(v: Vec3) -> [i32; 3] {
    const Q: f32 = 1000.0;
    [
        (v.x * Q).round() as i32,
        (v.y * Q).round() as i32,
        (v.z * Q).round() as i32,
    ]
}

fn edge_key(a: Vec3, b: Vec3) -> EdgeKey {
    let qa = quantize(a);
    let qb = quantize(b);
    if qa <= qb {
        (qa, qb)
    } else {
        (qb, qa)
    }
}

/// Tiled navigation mesh
#[derive(Debug)]
pub struct NavMesh {
    params: NavMeshParams,
    tiles: HashMap<(i32, i32, i32), MeshTile>,
    tile_lookup: HashMap<TileId, (i32, i32, i32)>,
    next_tile_id: u32,
    /// Open ground edges of every tile, used to stitch neighbouring tiles
    portals: HashMap<EdgeKey, Vec<(PolyRef, u8)>>,
}

impl NavMesh {
    /// Creates a new navigation mesh
    pub fn new(params: NavMeshParams) -> Result<Self> {
        if !params.origin.is_finite() {
            return Err(Error::Config("navmesh origin must be finite".to_string()));
        }
        if !(params.tile_width > 0.0 && params.tile_height > 0.0) {
            return Err(Error::Config(format!(
                "tile size must be positive, got {} x {}",
                params.tile_width, params.tile_height
            )));
        }
        if params.max_tiles == 0 || params.max_polys == 0 {
            return Err(Error::Config(
                "max tiles and max polys must be non-zero".to_string(),
            ));
        }

        Ok(Self {
            params,
            tiles: HashMap::new(),
            tile_lookup: HashMap::new(),
            next_tile_id: 1,
            portals: HashMap::new(),
        })
    }

    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Total polygon count across tiles, offmesh polygons included.
    pub fn poly_count(&self) -> usize {
        self.tiles.values().map(|t| t.data.polys.len()).sum()
    }

    /// Adds the tile at `(tx, ty)`, replacing whatever is there.
    ///
    /// The blob is validated before anything is removed, so a rejected blob leaves the
    /// previous tile in place.
    pub fn add_or_replace_tile(&mut self, tx: i32, ty: i32, blob: Vec<u8>) -> Result<TileId> {
        let data = TileData::from_bytes(&blob)?;
        if (data.header.x, data.header.y) != (tx, ty) {
            return Err(Error::NavMesh(format!(
                "blob for tile ({}, {}) added at ({tx}, {ty})",
                data.header.x, data.header.y
            )));
        }
        if data.header.poly_count > self.params.max_polys {
            return Err(Error::Config(format!(
                "tile ({tx}, {ty}) has {} polygons, limit is {}",
                data.header.poly_count, self.params.max_polys
            )));
        }

        let key = (tx, ty, data.header.layer);
        let replacing = self.tiles.contains_key(&key);
        if !replacing && self.tiles.len() >= self.params.max_tiles as usize {
            return Err(Error::Config(format!(
                "tile table full ({} tiles)",
                self.params.max_tiles
            )));
        }
        if replacing {
            self.remove_tile_layer(tx, ty, data.header.layer);
        }

        let id = TileId(self.next_tile_id);
        self.next_tile_id = self.next_tile_id.wrapping_add(1).max(1);

        let tile = MeshTile { id, data, blob };
        self.register_portals(&tile);
        self.tile_lookup.insert(id, key);
        self.tiles.insert(key, tile);
        Ok(id)
    }

    /// Removes the tile at `(tx, ty)` and hands its blob back. No-op when absent.
    pub fn remove_tile(&mut self, tx: i32, ty: i32) -> Option<Vec<u8>> {
        self.remove_tile_layer(tx, ty, 0)
    }

    fn remove_tile_layer(&mut self, tx: i32, ty: i32, layer: i32) -> Option<Vec<u8>> {
        let tile = self.tiles.remove(&(tx, ty, layer))?;
        self.tile_lookup.remove(&tile.id);
        self.unregister_portals(&tile);
        Some(tile.blob)
    }

    /// Drops every tile.
    pub fn clear(&mut self) {
        self.tiles.clear();
        self.tile_lookup.clear();
        self.portals.clear();
    }

    pub fn tile_at(&self, tx: i32, ty: i32, layer: i32) -> Option<&MeshTile> {
        self.tiles.get(&(tx, ty, layer))
    }

    pub fn has_tile(&self, tx: i32, ty: i32) -> bool {
        self.tiles.contains_key(&(tx, ty, 0))
    }

    pub fn tile_by_id(&self, id: TileId) -> Option<&MeshTile> {
        self.tile_lookup.get(&id).and_then(|k| self.tiles.get(k))
    }

    pub fn tiles(&self) -> impl Iterator<Item = &MeshTile> {
        self.tiles.values()
    }

    /// Coordinates of every resident tile, sorted.
    pub fn tile_coords(&self) -> Vec<(i32, i32)> {
        let mut coords: Vec<_> = self.tiles.keys().map(|&(x, y, _)| (x, y)).collect();
        coords.sort_unstable();
        coords
    }

    pub fn poly(&self, poly_ref: PolyRef) -> Option<(&MeshTile, &Poly)> {
        let tile = self.tile_by_id(poly_ref.tile)?;
        let poly = tile.data.polys.get(poly_ref.poly as usize)?;
        Some((tile, poly))
    }

    pub fn is_valid_poly_ref(&self, poly_ref: PolyRef) -> bool {
        self.poly(poly_ref).is_some()
    }

    /// Neighbour across edge `edge` of a ground polygon, looking into adjacent tiles.
    pub fn edge_neighbor(&self, poly_ref: PolyRef, edge: usize) -> Option<PolyRef> {
        let (tile, poly) = self.poly(poly_ref)?;
        if let Some(n) = poly.neighbor(edge) {
            return Some(PolyRef::new(tile.id, n));
        }
        let (a, b) = self.edge_endpoints(tile, poly, edge);
        self.portals
            .get(&edge_key(a, b))?
            .iter()
            .find(|(r, _)| r.tile != tile.id)
            .map(|(r, _)| *r)
    }

    /// True for a ground edge with no neighbour in this or any resident tile.
    pub fn is_border_edge(&self, poly_ref: PolyRef, edge: usize) -> bool {
        self.edge_neighbor(poly_ref, edge).is_none()
    }

    /// Endpoints of edge `edge` of `poly`.
    pub fn edge_endpoints(&self, tile: &MeshTile, poly: &Poly, edge: usize) -> (Vec3, Vec3) {
        let n = poly.vert_count as usize;
        let a = tile.data.verts[poly.verts[edge] as usize];
        let b = tile.data.verts[poly.verts[(edge + 1) % n] as usize];
        (a, b)
    }

    /// Ground neighbours of a polygon with the shared edge index.
    pub fn ground_neighbors(&self, poly_ref: PolyRef) -> Vec<(PolyRef, usize)> {
        let Some((_, poly)) = self.poly(poly_ref) else {
            return Vec::new();
        };
        if poly.poly_type != PolyType::Ground {
            return Vec::new();
        }
        (0..poly.vert_count as usize)
            .filter_map(|e| self.edge_neighbor(poly_ref, e).map(|n| (n, e)))
            .collect()
    }

    /// Every offmesh connection with the reference of its polygon.
    pub fn off_mesh_connections(&self) -> impl Iterator<Item = (PolyRef, &OffMeshConnection)> {
        self.tiles.values().flat_map(|tile| {
            tile.data
                .off_mesh_cons
                .iter()
                .map(move |con| (PolyRef::new(tile.id, con.poly as u32), con))
        })
    }

    /// Nearest ground polygon to `center` within the box `center ± half_extents`.
    ///
    /// Returns the polygon and the closest point on it.
    pub fn find_nearest_poly(&self, center: Vec3, half_extents: Vec3) -> Option<(PolyRef, Vec3)> {
        let query = Bounds::new(center - half_extents, center + half_extents);
        let mut best: Option<(PolyRef, Vec3, f32)> = None;

        for tile in self.tiles.values() {
            if !tile.bounds().overlaps(&query) {
                continue;
            }
            for index in 0..tile.data.ground_poly_count() {
                let verts = tile.data.poly_verts(&tile.data.polys[index]);
                if !Bounds::from_points(verts.iter()).overlaps(&query) {
                    continue;
                }

                let nearest = closest_point_on_poly(&tile.data, index, &verts, center);
                if (nearest.y - center.y).abs() > half_extents.y {
                    continue;
                }
                let d = nearest.distance_squared(center);
                if best.map_or(true, |(_, _, bd)| d < bd) {
                    best = Some((PolyRef::new(tile.id, index as u32), nearest, d));
                }
            }
        }

        best.map(|(r, p, _)| (r, p))
    }

    /// Surface height of a ground polygon under `pos`.
    pub fn poly_height(&self, poly_ref: PolyRef, pos: Vec3) -> Option<f32> {
        let tile = self.tile_by_id(poly_ref.tile)?;
        tile.data.poly_height(poly_ref.poly as usize, pos)
    }

    pub fn poly_center(&self, poly_ref: PolyRef) -> Option<Vec3> {
        let tile = self.tile_by_id(poly_ref.tile)?;
        (poly_ref.poly < tile.data.polys.len() as u32)
            .then(|| tile.data.poly_center(poly_ref.poly as usize))
    }

    fn open_edges(tile: &MeshTile) -> impl Iterator<Item = (u32, u8, Vec3, Vec3)> + '_ {
        let data = &tile.data;
        (0..data.ground_poly_count()).flat_map(move |pi| {
            let poly = &data.polys[pi];
            let n = poly.vert_count as usize;
            (0..n).filter_map(move |e| {
                if poly.neighbor(e).is_some() {
                    return None;
                }
                let a = data.verts[poly.verts[e] as usize];
                let b = data.verts[poly.verts[(e + 1) % n] as usize];
                Some((pi as u32, e as u8, a, b))
            })
        })
    }

    fn register_portals(&mut self, tile: &MeshTile) {
        for (pi, e, a, b) in Self::open_edges(tile) {
            self.portals
                .entry(edge_key(a, b))
                .or_default()
                .push((PolyRef::new(tile.id, pi), e));
        }
    }

    fn unregister_portals(&mut self, tile: &MeshTile) {
        for (_, _, a, b) in Self::open_edges(tile) {
            let key = edge_key(a, b);
            if let Some(users) = self.portals.get_mut(&key) {
                users.retain(|(r, _)| r.tile != tile.id);
                if users.is_empty() {
                    self.portals.remove(&key);
                }
            }
        }
    }
}

fn closest_point_on_poly(data: &TileData, index: usize, verts: &[Vec3], pos: Vec3) -> Vec3 {
    if point_in_polygon_2d(pos, verts) {
        let h = data
            .poly_height(index, pos)
            .unwrap_or_else(|| data.poly_center(index).y);
        return Vec3::new(pos.x, h, pos.z);
    }

    let n = verts.len();
    let mut best = verts[0];
    let mut best_d = f32::MAX;
    for i in 0..n {
        let a = verts[i];
        let b = verts[(i + 1) % n];
        let (d, _) = dist_point_segment_sqr_2d(pos, a, b);
        if d < best_d {
            best_d = d;
            best = closest_point_on_segment_2d(pos, a, b);
        }
    }
    best
}
