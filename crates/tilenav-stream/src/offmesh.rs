//! Offmesh links and their automatic generation
//!
//! Generators look at the open borders of the live navmesh and validate candidate
//! connections by casting segments against a [`RaycastMesh`] copy of the world.

use std::collections::{HashSet, VecDeque};

use glam::Vec3;
use tilenav_common::{closest_point_on_segment_2d, deg_to_rad, dist_2d, triangle_normal};
use tilenav_mesh::{nav_area, ConnectorSegment, NavMesh, PolyRef, PolyType, POLY_FLAG_WALK};

use crate::config::{AutoOffmeshParams, IslandLinkParams};
use crate::raycast::RaycastMesh;

/// A connection between two points of the navmesh that walking alone cannot make
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct OffmeshLink {
    pub start: Vec3,
    pub end: Vec3,
    pub radius: f32,
    pub bidirectional: bool,
    pub area: u8,
    pub flags: u16,
    pub user_id: u32,
    /// Tile containing `start`, resolved when links are handed to a tile builder
    pub owner: (i32, i32),
}

impl Default for OffmeshLink {
    fn default() -> Self {
        Self {
            start: Vec3::ZERO,
            end: Vec3::ZERO,
            radius: 1.0,
            bidirectional: true,
            area: nav_area::GROUND,
            flags: POLY_FLAG_WALK,
            user_id: 0,
            owner: (-1, -1),
        }
    }
}

impl OffmeshLink {
    pub fn new(start: Vec3, end: Vec3, bidirectional: bool) -> Self {
        Self {
            start,
            end,
            bidirectional,
            ..Default::default()
        }
    }

    pub fn with_radius(mut self, radius: f32) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_area(mut self, area: u8) -> Self {
        self.area = area;
        self
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_user_id(mut self, user_id: u32) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn to_connector(&self, user_id: u32) -> ConnectorSegment {
        ConnectorSegment {
            start: self.start,
            end: self.end,
            radius: self.radius,
            bidirectional: self.bidirectional,
            area: self.area,
            flags: self.flags,
            user_id,
        }
    }

    /// Distance from `p` to the nearer endpoint.
    pub fn distance_to(&self, p: Vec3) -> f32 {
        self.start.distance(p).min(self.end.distance(p))
    }

    fn in_group(&self, user_id_base: u32) -> bool {
        self.user_id & AutoOffmeshParams::USER_ID_GROUP_MASK
            == user_id_base & AutoOffmeshParams::USER_ID_GROUP_MASK
    }
}

/// Replaces every link of the `user_id_base` group with `generated`. Other links are kept.
pub fn replace_link_group(
    existing: &[OffmeshLink],
    generated: Vec<OffmeshLink>,
    user_id_base: u32,
) -> Vec<OffmeshLink> {
    let mut out: Vec<OffmeshLink> = existing
        .iter()
        .filter(|link| !link.in_group(user_id_base))
        .cloned()
        .collect();
    out.extend(generated);
    out
}

/// Removes the link with an endpoint closest to `point`.
pub fn remove_nearest_link(links: &mut Vec<OffmeshLink>, point: Vec3) -> Option<OffmeshLink> {
    let index = links
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.distance_to(point).total_cmp(&b.distance_to(point)))
        .map(|(i, _)| i)?;
    Some(links.remove(index))
}

/// An open edge of a ground polygon
#[derive(Debug, Clone, Copy)]
pub struct BorderEdge {
    pub poly: PolyRef,
    pub a: Vec3,
    pub b: Vec3,
    pub mid: Vec3,
    /// Unit XZ normal pointing away from the polygon
    pub normal: Vec3,
    /// Polygon slope in degrees
    pub slope: f32,
}

#[derive(Debug, Default)]
struct FacingStats {
    pairs: usize,
    normals: usize,
    facing: usize,
    height: usize,
    distance: usize,
    blocked: usize,
    accepted: usize,
}

/// Synthesizes links over the live navmesh
pub struct OffmeshLinkGenerator<'a> {
    nav: &'a NavMesh,
    raycast: &'a RaycastMesh,
}

impl<'a> OffmeshLinkGenerator<'a> {
    pub fn new(nav: &'a NavMesh, raycast: &'a RaycastMesh) -> Self {
        Self { nav, raycast }
    }

    /// Open ground edges of every resident tile.
    pub fn border_edges(&self) -> Vec<BorderEdge> {
        let mut edges = Vec::new();
        for (tx, ty) in self.nav.tile_coords() {
            let Some(tile) = self.nav.tile_at(tx, ty, 0) else {
                continue;
            };
            for index in 0..tile.data.ground_poly_count() {
                let poly = &tile.data.polys[index];
                if poly.poly_type != PolyType::Ground {
                    continue;
                }
                let poly_ref = PolyRef::new(tile.id, index as u32);
                let verts = tile.data.poly_verts(poly);
                let center = tile.data.poly_center(index);
                let slope = if verts.len() >= 3 {
                    let n = triangle_normal(verts[0], verts[1], verts[2]);
                    n.y.abs().clamp(0.0, 1.0).acos().to_degrees()
                } else {
                    90.0
                };

                for e in 0..verts.len() {
                    if !self.nav.is_border_edge(poly_ref, e) {
                        continue;
                    }
                    let a = verts[e];
                    let b = verts[(e + 1) % verts.len()];
                    let mid = (a + b) * 0.5;
                    let mut normal = Vec3::new(b.z - a.z, 0.0, a.x - b.x).normalize_or_zero();
                    if normal == Vec3::ZERO {
                        continue;
                    }
                    if normal.dot(center - mid) > 0.0 {
                        normal = -normal;
                    }
                    edges.push(BorderEdge {
                        poly: poly_ref,
                        a,
                        b,
                        mid,
                        normal,
                        slope,
                    });
                }
            }
        }
        edges
    }

    /// Drop/jump and facing-pair links enabled by `params.flags`, numbered from
    /// `params.user_id_base`.
    pub fn generate(&self, params: &AutoOffmeshParams) -> Vec<OffmeshLink> {
        let edges = self.border_edges();
        let mut links = Vec::new();
        if params.drop_jump_enabled() {
            links.extend(self.generate_drop_jump(params, &edges));
        }
        if params.facing_enabled() {
            links.extend(self.generate_facing(params, &edges));
        }
        for (i, link) in links.iter_mut().enumerate() {
            link.user_id = params.user_id_base.wrapping_add(i as u32);
        }
        log::info!(
            "Generated {} automatic offmesh links from {} border edges",
            links.len(),
            edges.len()
        );
        links
    }

    /// One-way drop links off ledges, plus a jump back up when the ledge is low enough.
    pub fn generate_drop_jump(
        &self,
        params: &AutoOffmeshParams,
        edges: &[BorderEdge],
    ) -> Vec<OffmeshLink> {
        let min_normal_y = deg_to_rad(params.max_slope).cos();
        let up = Vec3::Y * params.up_offset;
        let mut seen: HashSet<[i32; 3]> = HashSet::new();
        let mut links = Vec::new();

        for edge in edges.iter().filter(|e| e.slope <= params.max_slope) {
            let takeoff = edge.mid;
            let probe = takeoff + edge.normal * (params.agent_radius + params.edge_outset);

            // Walkable ground continues at about the same level: not a ledge
            let neighbour_ext = Vec3::new(0.05, params.min_neighbor_height_delta, 0.05);
            if self
                .nav
                .find_nearest_poly(Vec3::new(probe.x, takeoff.y, probe.z), neighbour_ext)
                .is_some()
            {
                continue;
            }

            let ray_start = Vec3::new(
                probe.x,
                takeoff.y + params.up_offset + params.raycast_extra_height,
                probe.z,
            );
            let ray_end = Vec3::new(
                probe.x,
                takeoff.y - (params.max_drop_height + params.raycast_extra_height),
                probe.z,
            );
            let Some(hit) = self.raycast.raycast(ray_start, ray_end) else {
                continue;
            };

            let drop = takeoff.y - hit.position.y;
            if drop < params.min_drop_threshold || drop > params.max_drop_height {
                continue;
            }
            if hit.normal.y < min_normal_y {
                continue;
            }
            let landing = hit.position;
            if !self.raycast.is_segment_clear(landing + up, takeoff + up) {
                continue;
            }
            if !seen.insert(quantize(takeoff)) {
                continue;
            }

            links.push(OffmeshLink {
                start: takeoff,
                end: landing,
                radius: params.agent_radius,
                bidirectional: false,
                area: params.drop_area,
                ..Default::default()
            });
            if drop <= params.jump_height {
                links.push(OffmeshLink {
                    start: landing,
                    end: takeoff,
                    radius: params.agent_radius,
                    bidirectional: false,
                    area: nav_area::JUMP,
                    ..Default::default()
                });
            }
        }

        log::debug!("Drop/jump pass produced {} links", links.len());
        links
    }

    /// Bidirectional links between border edges that face each other across a gap.
    pub fn generate_facing(
        &self,
        params: &AutoOffmeshParams,
        edges: &[BorderEdge],
    ) -> Vec<OffmeshLink> {
        let min_opposition = deg_to_rad(params.angle_tolerance).cos();
        let lift = Vec3::Y * params.z_offset;
        let mut stats = FacingStats::default();
        let mut seen: HashSet<([i32; 3], [i32; 3])> = HashSet::new();
        let mut links = Vec::new();

        for (i, ei) in edges.iter().enumerate() {
            for ej in &edges[i + 1..] {
                stats.pairs += 1;

                if ei.normal.dot(-ej.normal) < min_opposition {
                    stats.normals += 1;
                    continue;
                }

                let mut d = ej.mid - ei.mid;
                d.y = 0.0;
                if ei.normal.dot(d) <= 0.0 || ej.normal.dot(-d) <= 0.0 {
                    stats.facing += 1;
                    continue;
                }

                let dh = (ej.mid.y - ei.mid.y).abs();
                if dh < params.min_height_diff || dh > params.max_height_diff {
                    stats.height += 1;
                    continue;
                }

                let dist = dist_2d(ei.mid, ej.mid);
                if dist < params.min_distance || dist > params.max_distance {
                    stats.distance += 1;
                    continue;
                }

                let pi = ei.mid + ei.normal * params.normal_offset + lift;
                let pj = ej.mid + ej.normal * params.normal_offset + lift;
                if !self.raycast.is_segment_clear(pi, pj) {
                    stats.blocked += 1;
                    continue;
                }

                let key = (quantize(ei.mid), quantize(ej.mid));
                if !seen.insert(key) {
                    continue;
                }
                stats.accepted += 1;
                links.push(OffmeshLink {
                    start: ei.mid,
                    end: ej.mid,
                    radius: params.agent_radius,
                    bidirectional: true,
                    area: nav_area::OFFMESH,
                    ..Default::default()
                });
            }
        }

        log::debug!("Facing pass: {stats:?}");
        links
    }

    /// Links from the island under `target` to nearby disconnected ground.
    ///
    /// Every anchor gets an outgoing link and a return link; the area of each follows
    /// its vertical direction.
    pub fn generate_island_links(&self, target: Vec3, params: &IslandLinkParams) -> Vec<OffmeshLink> {
        let search = Vec3::new(2.0, params.max_height_diff.max(2.0), 2.0);
        let Some((seed, _)) = self.nav.find_nearest_poly(target, search) else {
            log::debug!("No polygon near island target {target}");
            return Vec::new();
        };
        let island = self.flood_fill(seed);

        let yaw = deg_to_rad(params.yaw);
        let forward = Vec3::new(yaw.sin(), 0.0, yaw.cos());
        let side = Vec3::new(yaw.cos(), 0.0, -yaw.sin());
        let in_rect = |p: Vec3| {
            let d = p - target;
            d.dot(forward).abs() <= params.half_length && d.dot(side).abs() <= params.half_width
        };

        let edges = self.border_edges();
        let island_edges: Vec<&BorderEdge> =
            edges.iter().filter(|e| island.contains(&e.poly)).collect();
        let mut candidates: Vec<&BorderEdge> = edges
            .iter()
            .filter(|e| !island.contains(&e.poly) && in_rect(e.mid))
            .collect();
        candidates.sort_by(|a, b| {
            dist_2d(a.mid, target)
                .total_cmp(&dist_2d(b.mid, target))
                .then(quantize(a.mid).cmp(&quantize(b.mid)))
        });

        let up = Vec3::Y * params.up_offset;
        let mut anchors: Vec<Vec3> = Vec::new();
        let mut links = Vec::new();
        for candidate in candidates {
            if anchors.len() >= params.max_links {
                break;
            }
            let anchor = candidate.mid;
            if anchors
                .iter()
                .any(|a| dist_2d(*a, anchor) < params.min_anchor_spacing)
            {
                continue;
            }

            let Some(from) = island_edges
                .iter()
                .map(|e| closest_point_on_segment_2d(anchor, e.a, e.b))
                .min_by(|p, q| dist_2d(*p, anchor).total_cmp(&dist_2d(*q, anchor)))
            else {
                break;
            };
            if (anchor.y - from.y).abs() > params.max_height_diff {
                continue;
            }
            if !self.raycast.is_segment_clear(from + up, anchor + up) {
                continue;
            }

            anchors.push(anchor);
            for (start, end) in [(from, anchor), (anchor, from)] {
                links.push(OffmeshLink {
                    start,
                    end,
                    radius: params.link_radius,
                    bidirectional: false,
                    area: area_for_direction(end.y - start.y, params.level_tolerance),
                    user_id: params.user_id_base.wrapping_add(links.len() as u32),
                    ..Default::default()
                });
            }
        }

        log::info!(
            "Island of {} polygons: {} reconnection links",
            island.len(),
            links.len()
        );
        links
    }

    /// Ground polygons reachable from `seed` by walking.
    fn flood_fill(&self, seed: PolyRef) -> HashSet<PolyRef> {
        let mut visited = HashSet::from([seed]);
        let mut queue = VecDeque::from([seed]);
        while let Some(current) = queue.pop_front() {
            for (next, _) in self.nav.ground_neighbors(current) {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        visited
    }
}

fn area_for_direction(dy: f32, level_tolerance: f32) -> u8 {
    if dy > level_tolerance {
        nav_area::JUMP
    } else if dy < -level_tolerance {
        nav_area::DROP
    } else {
        nav_area::OFFMESH
    }
}

fn quantize(p: Vec3) -> [i32; 3] {
    const Q: f32 = 10.0;
    [
        (p.x * Q).round() as i32,
        (p.y * Q).round() as i32,
        (p.z * Q).round() as i32,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_defaults() {
        let link = OffmeshLink::default();
        assert_eq!(link.radius, 1.0);
        assert!(link.bidirectional);
        assert_eq!(link.area, nav_area::GROUND);
        assert_eq!(link.flags, 1);
        assert_eq!(link.user_id, 0);
        assert_eq!(link.owner, (-1, -1));
    }

    #[test]
    fn test_replace_link_group_keeps_manual_links() {
        let manual = OffmeshLink::new(Vec3::ZERO, Vec3::X, true);
        let old_auto = OffmeshLink::new(Vec3::Z, Vec3::X, false).with_user_id(0xAFAF_0003);
        let island = OffmeshLink::new(Vec3::Z, Vec3::Y, false).with_user_id(0xAFB0_0001);
        let fresh = OffmeshLink::new(Vec3::Y, Vec3::X, false).with_user_id(0xAFAF_0000);

        let merged = replace_link_group(
            &[manual.clone(), old_auto, island.clone()],
            vec![fresh.clone()],
            0xAFAF_0000,
        );
        assert_eq!(merged, vec![manual, island, fresh]);
    }

    #[test]
    fn test_remove_nearest_link() {
        let mut links = vec![
            OffmeshLink::new(Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0), true),
            OffmeshLink::new(Vec3::new(10.0, 0.0, 0.0), Vec3::new(12.0, 0.0, 0.0), true),
        ];
        let removed = remove_nearest_link(&mut links, Vec3::new(11.5, 0.0, 0.0)).unwrap();
        assert_eq!(removed.start, Vec3::new(10.0, 0.0, 0.0));
        assert_eq!(links.len(), 1);

        let mut empty = Vec::new();
        assert!(remove_nearest_link(&mut empty, Vec3::ZERO).is_none());
    }

    #[test]
    fn test_area_for_direction() {
        assert_eq!(area_for_direction(2.0, 0.5), nav_area::JUMP);
        assert_eq!(area_for_direction(-2.0, 0.5), nav_area::DROP);
        assert_eq!(area_for_direction(0.3, 0.5), nav_area::OFFMESH);
    }
}
