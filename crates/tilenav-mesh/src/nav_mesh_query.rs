//! Navigation mesh query implementation
//!
//! Nearest-polygon lookup, A* over polygon adjacency (ground edges, cross-tile edges and
//! offmesh connections) and funnel string pulling into a straight path.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use glam::Vec3;
use tilenav_common::{tri_area_2d, Error, Result};

use crate::nav_area::MAX_AREAS;
use crate::tile_data::{Poly, PolyType};
use crate::{NavMesh, PolyRef};

/// Maximum number of polygons returned by [`NavMeshQuery::find_path`]
pub const MAX_PATH_POLYS: usize = 256;

/// Heuristic scale, slightly below 1 to keep A* admissible with float noise
const H_SCALE: f32 = 0.999;

/// Straight path vertex flags
pub const STRAIGHTPATH_START: u8 = 0x01;
pub const STRAIGHTPATH_END: u8 = 0x02;
pub const STRAIGHTPATH_OFFMESH_CONNECTION: u8 = 0x04;

/// Polygon filter with per-area traversal costs
#[derive(Debug, Clone)]
pub struct QueryFilter {
    pub include_flags: u16,
    pub exclude_flags: u16,
    area_cost: [f32; MAX_AREAS],
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            include_flags: 0xffff,
            exclude_flags: 0,
            area_cost: [1.0; MAX_AREAS],
        }
    }
}

impl QueryFilter {
    pub fn new(include_flags: u16) -> Self {
        Self {
            include_flags,
            ..Default::default()
        }
    }

    pub fn with_area_cost(mut self, area: u8, cost: f32) -> Self {
        self.set_area_cost(area, cost);
        self
    }

    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        if let Some(slot) = self.area_cost.get_mut(area as usize) {
            *slot = cost;
        }
    }

    pub fn area_cost(&self, area: u8) -> f32 {
        self.area_cost.get(area as usize).copied().unwrap_or(1.0)
    }

    pub fn pass_filter(&self, poly: &Poly) -> bool {
        (poly.flags & self.include_flags) != 0 && (poly.flags & self.exclude_flags) == 0
    }
}

/// One vertex of a straight path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StraightPathPoint {
    pub pos: Vec3,
    /// Polygon entered at this vertex
    pub poly: PolyRef,
    pub flags: u8,
}

/// Traversal through an offmesh connection, keyed by the ground polygon it leaves from
#[derive(Debug, Clone, Copy)]
struct OffMeshStep {
    con: PolyRef,
    entry: Vec3,
    exit: Vec3,
    exit_poly: PolyRef,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    poly: PolyRef,
    parent: Option<usize>,
    /// Position the node was entered at
    pos: Vec3,
    g: f32,
    h: f32,
    /// Offmesh connection crossed to reach this node
    via: Option<PolyRef>,
    closed: bool,
}

#[derive(Debug, Clone, Copy)]
struct HeapNode {
    index: usize,
    f: f32,
}

impl PartialEq for HeapNode {
    fn eq(&self, other: &Self) -> bool {
        self.f == other.f
    }
}

impl Eq for HeapNode {}

impl PartialOrd for HeapNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapNode {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap
        other.f.total_cmp(&self.f)
    }
}

/// Navigation mesh query structure
#[derive(Debug)]
pub struct NavMeshQuery<'a> {
    nav_mesh: &'a NavMesh,
    off_mesh_steps: HashMap<PolyRef, Vec<OffMeshStep>>,
}

impl<'a> NavMeshQuery<'a> {
    /// Creates a query and resolves offmesh connection endpoints against resident tiles.
    pub fn new(nav_mesh: &'a NavMesh) -> Self {
        let mut off_mesh_steps: HashMap<PolyRef, Vec<OffMeshStep>> = HashMap::new();
        for (con_ref, con) in nav_mesh.off_mesh_connections() {
            let ext = Vec3::new(con.radius, con.radius.max(1.0), con.radius);
            let start = nav_mesh.find_nearest_poly(con.start, ext);
            let end = nav_mesh.find_nearest_poly(con.end, ext);
            let (Some((start_poly, start_pos)), Some((end_poly, end_pos))) = (start, end) else {
                log::debug!("offmesh connection {} has an unresolved endpoint", con.user_id);
                continue;
            };
            off_mesh_steps.entry(start_poly).or_default().push(OffMeshStep {
                con: con_ref,
                entry: start_pos,
                exit: end_pos,
                exit_poly: end_poly,
            });
            if con.is_bidirectional() {
                off_mesh_steps.entry(end_poly).or_default().push(OffMeshStep {
                    con: con_ref,
                    entry: end_pos,
                    exit: start_pos,
                    exit_poly: start_poly,
                });
            }
        }
        Self {
            nav_mesh,
            off_mesh_steps,
        }
    }

    pub fn nav_mesh(&self) -> &NavMesh {
        self.nav_mesh
    }

    /// Nearest polygon passing `filter` within `center ± half_extents`.
    pub fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Option<(PolyRef, Vec3)> {
        let (poly_ref, pos) = self.nav_mesh.find_nearest_poly(center, half_extents)?;
        let (_, poly) = self.nav_mesh.poly(poly_ref)?;
        filter.pass_filter(poly).then_some((poly_ref, pos))
    }

    /// A* search from `start_ref` to `end_ref`.
    ///
    /// When the goal is unreachable the path leads to the polygon closest to it. The
    /// returned corridor includes offmesh connection polygons and is capped at
    /// [`MAX_PATH_POLYS`].
    pub fn find_path(
        &self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<Vec<PolyRef>> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref) || !self.nav_mesh.is_valid_poly_ref(end_ref)
        {
            return Err(Error::Pathfinding("invalid start or end polygon".to_string()));
        }
        if start_ref == end_ref {
            return Ok(vec![start_ref]);
        }

        let mut nodes: Vec<Node> = Vec::new();
        let mut lookup: HashMap<PolyRef, usize> = HashMap::new();
        let mut open = BinaryHeap::new();

        let start_h = start_pos.distance(end_pos) * H_SCALE;
        nodes.push(Node {
            poly: start_ref,
            parent: None,
            pos: start_pos,
            g: 0.0,
            h: start_h,
            via: None,
            closed: false,
        });
        lookup.insert(start_ref, 0);
        open.push(HeapNode { index: 0, f: start_h });

        let mut best = 0usize;
        let mut best_h = start_h;

        while let Some(HeapNode { index, f }) = open.pop() {
            let current = nodes[index];
            if current.closed || f > current.g + current.h {
                continue;
            }
            nodes[index].closed = true;

            if current.poly == end_ref {
                best = index;
                break;
            }
            if current.h < best_h {
                best_h = current.h;
                best = index;
            }

            let Some((cur_tile, cur_poly)) = self.nav_mesh.poly(current.poly) else {
                continue;
            };
            let cur_cost = filter.area_cost(cur_poly.area);

            let mut candidates: Vec<(PolyRef, Vec3, f32, Option<PolyRef>)> = Vec::new();
            for (neighbor, edge) in self.nav_mesh.ground_neighbors(current.poly) {
                let (a, b) = self.nav_mesh.edge_endpoints(cur_tile, cur_poly, edge);
                let mid = (a + b) * 0.5;
                candidates.push((neighbor, mid, current.pos.distance(mid) * cur_cost, None));
            }
            for step in self.off_mesh_steps.get(&current.poly).into_iter().flatten() {
                let Some((_, con_poly)) = self.nav_mesh.poly(step.con) else {
                    continue;
                };
                if !filter.pass_filter(con_poly) {
                    continue;
                }
                let cost = current.pos.distance(step.entry) * cur_cost
                    + step.entry.distance(step.exit) * filter.area_cost(con_poly.area);
                candidates.push((step.exit_poly, step.exit, cost, Some(step.con)));
            }

            for (neighbor, pos, step_cost, via) in candidates {
                if Some(neighbor) == current.parent.map(|p| nodes[p].poly) && via.is_none() {
                    continue;
                }
                let Some((_, n_poly)) = self.nav_mesh.poly(neighbor) else {
                    continue;
                };
                if !filter.pass_filter(n_poly) {
                    continue;
                }

                let mut g = current.g + step_cost;
                let h = if neighbor == end_ref {
                    g += pos.distance(end_pos) * filter.area_cost(n_poly.area);
                    0.0
                } else {
                    pos.distance(end_pos) * H_SCALE
                };

                match lookup.get(&neighbor) {
                    Some(&ni) if nodes[ni].g <= g => {}
                    Some(&ni) => {
                        nodes[ni] = Node {
                            poly: neighbor,
                            parent: Some(index),
                            pos,
                            g,
                            h,
                            via,
                            closed: false,
                        };
                        open.push(HeapNode { index: ni, f: g + h });
                    }
                    None => {
                        let ni = nodes.len();
                        nodes.push(Node {
                            poly: neighbor,
                            parent: Some(index),
                            pos,
                            g,
                            h,
                            via,
                            closed: false,
                        });
                        lookup.insert(neighbor, ni);
                        open.push(HeapNode { index: ni, f: g + h });
                    }
                }
            }
        }

        let mut path = Vec::new();
        let mut cursor = Some(best);
        while let Some(i) = cursor {
            if path.len() > nodes.len() * 2 {
                return Err(Error::Pathfinding("cycle in search tree".to_string()));
            }
            let node = &nodes[i];
            path.push(node.poly);
            if let Some(con) = node.via {
                path.push(con);
            }
            cursor = node.parent;
        }
        path.reverse();
        path.truncate(MAX_PATH_POLYS);
        Ok(path)
    }

    /// String-pulls a polygon corridor into straight path vertices.
    ///
    /// The corridor is funnelled piecewise; offmesh entry and exit points always become
    /// path vertices.
    pub fn find_straight_path(
        &self,
        start_pos: Vec3,
        end_pos: Vec3,
        path: &[PolyRef],
    ) -> Result<Vec<StraightPathPoint>> {
        let (&first, &last) = match (path.first(), path.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => return Err(Error::Pathfinding("empty polygon corridor".to_string())),
        };

        let mut segments: Vec<Vec<Portal>> = Vec::new();
        let mut portals = vec![Portal::point(start_pos, first, STRAIGHTPATH_START)];

        let mut i = 0;
        while i + 1 < path.len() {
            let from = path[i];
            let to = path[i + 1];
            let to_is_con = self
                .nav_mesh
                .poly(to)
                .map_or(false, |(_, p)| p.poly_type == PolyType::OffMeshConnection);

            if to_is_con {
                let step = self
                    .off_mesh_steps
                    .get(&from)
                    .and_then(|steps| steps.iter().find(|s| s.con == to))
                    .ok_or_else(|| {
                        Error::Pathfinding("corridor uses an unresolved offmesh link".into())
                    })?;
                portals.push(Portal::point(step.entry, to, STRAIGHTPATH_OFFMESH_CONNECTION));
                segments.push(std::mem::take(&mut portals));

                let exit_poly = path.get(i + 2).copied().unwrap_or(step.exit_poly);
                portals.push(Portal::point(step.exit, exit_poly, 0));
                i += 2;
                continue;
            }

            let (left, right) = self.portal_points(from, to)?;
            portals.push(Portal {
                left,
                right,
                poly: to,
                flags: 0,
            });
            i += 1;
        }

        portals.push(Portal::point(end_pos, last, STRAIGHTPATH_END));
        segments.push(portals);

        let mut out: Vec<StraightPathPoint> = Vec::new();
        for segment in &segments {
            for point in string_pull(segment) {
                match out.last_mut() {
                    Some(prev) if vequal(prev.pos, point.pos) => prev.flags |= point.flags,
                    _ => out.push(point),
                }
            }
        }
        Ok(out)
    }

    /// Shared edge between two adjacent ground polygons, ordered for travel `from -> to`.
    fn portal_points(&self, from: PolyRef, to: PolyRef) -> Result<(Vec3, Vec3)> {
        let (tile, poly) = self
            .nav_mesh
            .poly(from)
            .ok_or_else(|| Error::Pathfinding("corridor references a missing tile".into()))?;
        let edge = (0..poly.vert_count as usize)
            .find(|&e| self.nav_mesh.edge_neighbor(from, e) == Some(to))
            .ok_or_else(|| Error::Pathfinding("corridor polygons are not adjacent".into()))?;
        let (a, b) = self.nav_mesh.edge_endpoints(tile, poly, edge);

        let center = tile.data.poly_center(from.poly as usize);
        let mid = (a + b) * 0.5;
        if tri_area_2d(center, mid, a) > 0.0 {
            Ok((b, a))
        } else {
            Ok((a, b))
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Portal {
    left: Vec3,
    right: Vec3,
    poly: PolyRef,
    flags: u8,
}

impl Portal {
    fn point(pos: Vec3, poly: PolyRef, flags: u8) -> Self {
        Self {
            left: pos,
            right: pos,
            poly,
            flags,
        }
    }
}

fn vequal(a: Vec3, b: Vec3) -> bool {
    a.distance_squared(b) < 1e-12
}

/// Simple stupid funnel over a portal list whose first and last portals are points.
fn string_pull(portals: &[Portal]) -> Vec<StraightPathPoint> {
    let mut out: Vec<StraightPathPoint> = Vec::new();
    let (Some(first), Some(last)) = (portals.first(), portals.last()) else {
        return out;
    };

    let emit = |out: &mut Vec<StraightPathPoint>, portal: &Portal, pos: Vec3| match out.last_mut() {
        Some(prev) if vequal(prev.pos, pos) => prev.flags |= portal.flags,
        _ => out.push(StraightPathPoint {
            pos,
            poly: portal.poly,
            flags: portal.flags,
        }),
    };
    emit(&mut out, first, first.left);

    let mut apex = first.left;
    let mut left = first.left;
    let mut right = first.right;
    let (mut left_i, mut right_i) = (0usize, 0usize);

    let mut i = 1;
    while i < portals.len() {
        let p = &portals[i];

        if tri_area_2d(apex, right, p.right) <= 0.0 {
            if vequal(apex, right) || tri_area_2d(apex, left, p.right) > 0.0 {
                right = p.right;
                right_i = i;
            } else {
                // Right crossed over left, left becomes the new apex
                emit(&mut out, &portals[left_i], left);
                apex = left;
                right = apex;
                right_i = left_i;
                i = left_i + 1;
                continue;
            }
        }

        if tri_area_2d(apex, left, p.left) >= 0.0 {
            if vequal(apex, left) || tri_area_2d(apex, right, p.left) < 0.0 {
                left = p.left;
                left_i = i;
            } else {
                emit(&mut out, &portals[right_i], right);
                apex = right;
                left = apex;
                left_i = right_i;
                i = right_i + 1;
                continue;
            }
        }

        i += 1;
    }

    emit(&mut out, last, last.left);
    out
}

/// Drops interior vertices closer than `min_edge` to the previously kept vertex.
///
/// Start, end and offmesh vertices are always kept.
pub fn simplify_min_edge(points: &[StraightPathPoint], min_edge: f32) -> Vec<StraightPathPoint> {
    if points.len() <= 2 || !(min_edge > 0.0) {
        return points.to_vec();
    }
    let mut out: Vec<StraightPathPoint> = Vec::with_capacity(points.len());
    out.push(points[0]);
    for p in &points[1..points.len() - 1] {
        let pinned = p.flags & STRAIGHTPATH_OFFMESH_CONNECTION != 0;
        let far = out
            .last()
            .map_or(true, |last| last.pos.distance(p.pos) >= min_edge);
        if pinned || far {
            out.push(*p);
        }
    }
    if let Some(end) = points.last() {
        out.push(*end);
    }
    out
}
