//! Path queries over the live container

use glam::Vec3;
use tilenav_common::{Error, Result};
use tilenav_mesh::{
    nav_area, simplify_min_edge, NavMesh, NavMeshQuery, QueryFilter, StraightPathPoint,
};

use crate::config::{GenerationSettings, PathQueryConfig};

/// Point-to-point path search with the agent's search extents and per-area costs.
#[derive(Debug)]
pub struct PathQuery<'a> {
    query: NavMeshQuery<'a>,
    filter: QueryFilter,
    extents: Vec3,
    min_edge: f32,
}

impl<'a> PathQuery<'a> {
    pub fn new(nav: &'a NavMesh, settings: &GenerationSettings, config: &PathQueryConfig) -> Self {
        let mut filter = QueryFilter::new(config.include_flags);
        filter.exclude_flags = config.exclude_flags;
        for (&area, &cost) in &config.area_costs {
            if (area as usize) < nav_area::MAX_AREAS {
                filter.set_area_cost(area, cost);
            } else {
                log::warn!("Ignoring cost for out of range area {area}");
            }
        }
        Self {
            query: NavMeshQuery::new(nav),
            filter,
            extents: search_extents(settings),
            min_edge: config.min_edge.max(0.0),
        }
    }

    pub fn filter(&self) -> &QueryFilter {
        &self.filter
    }

    /// Half extents used to snap endpoints onto the mesh
    pub fn extents(&self) -> Vec3 {
        self.extents
    }

    pub fn with_min_edge(mut self, min_edge: f32) -> Self {
        self.min_edge = min_edge.max(0.0);
        self
    }

    /// Straight path from `start` to `end` with per-vertex polygon and flags.
    ///
    /// When `min_edge` is positive, interior vertices closer than that to the previously
    /// kept vertex are dropped.
    pub fn find_straight_path(&self, start: Vec3, end: Vec3) -> Result<Vec<StraightPathPoint>> {
        let (start_ref, start_pos) = self
            .query
            .find_nearest_poly(start, self.extents, &self.filter)
            .ok_or_else(|| Error::Pathfinding(format!("no polygon near start {start}")))?;
        let (end_ref, end_pos) = self
            .query
            .find_nearest_poly(end, self.extents, &self.filter)
            .ok_or_else(|| Error::Pathfinding(format!("no polygon near end {end}")))?;

        let corridor = self
            .query
            .find_path(start_ref, end_ref, start_pos, end_pos, &self.filter)?;
        if corridor.is_empty() {
            return Err(Error::Pathfinding("empty polygon corridor".to_string()));
        }

        let points = self.query.find_straight_path(start_pos, end_pos, &corridor)?;
        Ok(if self.min_edge > 0.0 {
            simplify_min_edge(&points, self.min_edge)
        } else {
            points
        })
    }

    /// Path positions from `start` to `end`.
    pub fn find_path(&self, start: Vec3, end: Vec3) -> Result<Vec<Vec3>> {
        Ok(self
            .find_straight_path(start, end)?
            .into_iter()
            .map(|p| p.pos)
            .collect())
    }
}

/// Search box around a query point: four agent radii sideways, half the agent height up
/// and down.
fn search_extents(settings: &GenerationSettings) -> Vec3 {
    let side = settings.agent_radius * 4.0 + 0.1;
    Vec3::new(side, settings.agent_height * 0.5 + 0.1, side)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{flat_tile_blob, small_params};
    use tilenav_mesh::{STRAIGHTPATH_END, STRAIGHTPATH_START};

    fn corridor() -> NavMesh {
        let mut nav = NavMesh::new(small_params()).unwrap();
        for tx in 0..4 {
            nav.add_or_replace_tile(tx, 0, flat_tile_blob(tx, 0)).unwrap();
        }
        nav
    }

    #[test]
    fn test_extents_follow_agent() {
        let nav = corridor();
        let settings = GenerationSettings::default();
        let query = PathQuery::new(&nav, &settings, &PathQueryConfig::default());
        assert!(query.extents().abs_diff_eq(Vec3::new(2.5, 1.1, 2.5), 1e-5));
    }

    #[test]
    fn test_straight_corridor() -> Result<()> {
        let nav = corridor();
        let query = PathQuery::new(&nav, &GenerationSettings::default(), &PathQueryConfig::default());
        let points = query.find_straight_path(Vec3::new(0.5, 0.0, 2.0), Vec3::new(15.5, 0.0, 2.0))?;
        assert!(points.len() >= 2);
        assert_ne!(points[0].flags & STRAIGHTPATH_START, 0);
        assert_ne!(points[points.len() - 1].flags & STRAIGHTPATH_END, 0);
        assert!(points[points.len() - 1].pos.abs_diff_eq(Vec3::new(15.5, 0.0, 2.0), 1e-3));
        Ok(())
    }

    #[test]
    fn test_min_edge_keeps_endpoints() -> Result<()> {
        let nav = corridor();
        let query = PathQuery::new(&nav, &GenerationSettings::default(), &PathQueryConfig::default())
            .with_min_edge(100.0);
        let path = query.find_path(Vec3::new(0.5, 0.0, 0.5), Vec3::new(15.0, 0.0, 3.5))?;
        assert_eq!(path.len(), 2);
        Ok(())
    }

    #[test]
    fn test_off_mesh_start_is_an_error() {
        let nav = corridor();
        let query = PathQuery::new(&nav, &GenerationSettings::default(), &PathQueryConfig::default());
        let result = query.find_path(Vec3::new(50.0, 0.0, 50.0), Vec3::new(1.0, 0.0, 1.0));
        assert!(matches!(result, Err(Error::Pathfinding(_))));
    }

    #[test]
    fn test_excluded_flags_find_nothing() {
        let nav = corridor();
        let config = PathQueryConfig {
            exclude_flags: tilenav_mesh::POLY_FLAG_WALK,
            ..Default::default()
        };
        let query = PathQuery::new(&nav, &GenerationSettings::default(), &config);
        assert!(query.find_path(Vec3::new(1.0, 0.0, 1.0), Vec3::new(2.0, 0.0, 2.0)).is_err());
    }
}
