//! Multi-tile adjacency and offmesh traversal tests

#[cfg(test)]
mod tests {
    use glam::Vec3;
    use tilenav_common::Result;

    use crate::mesher::ConnectorSegment;
    use crate::nav_mesh_query::{STRAIGHTPATH_END, STRAIGHTPATH_OFFMESH_CONNECTION};
    use crate::test_mesh_helpers::{build_flat_tile, build_flat_tile_data, test_params};
    use crate::{nav_area, NavMesh, NavMeshQuery, PolyType, QueryFilter};

    fn border_edge_count(nav: &NavMesh) -> usize {
        let mut count = 0;
        for tile in nav.tiles() {
            for (pi, poly) in tile.data.polys.iter().enumerate() {
                if poly.poly_type != PolyType::Ground {
                    continue;
                }
                let r = crate::PolyRef::new(tile.id, pi as u32);
                count += (0..poly.vert_count as usize)
                    .filter(|&e| nav.is_border_edge(r, e))
                    .count();
            }
        }
        count
    }

    #[test]
    fn test_adjacent_tiles_are_stitched() -> Result<()> {
        let mut nav = NavMesh::new(test_params(4.0))?;
        nav.add_or_replace_tile(0, 0, build_flat_tile(0, 0, 4.0, 1))?;
        // Single 4x4 quad: 4 outer edges
        assert_eq!(border_edge_count(&nav), 4);

        nav.add_or_replace_tile(1, 0, build_flat_tile(1, 0, 4.0, 1))?;
        // Two quads side by side: the shared edge is no longer a border
        assert_eq!(border_edge_count(&nav), 6);
        Ok(())
    }

    #[test]
    fn test_removing_tile_reopens_border() -> Result<()> {
        let mut nav = NavMesh::new(test_params(4.0))?;
        nav.add_or_replace_tile(0, 0, build_flat_tile(0, 0, 4.0, 1))?;
        nav.add_or_replace_tile(1, 0, build_flat_tile(1, 0, 4.0, 1))?;
        nav.remove_tile(1, 0);
        assert_eq!(border_edge_count(&nav), 4);
        Ok(())
    }

    #[test]
    fn test_path_through_offmesh_connection() -> Result<()> {
        let link = ConnectorSegment {
            start: Vec3::new(3.5, 0.0, 2.0),
            end: Vec3::new(8.5, 0.0, 2.0),
            radius: 0.5,
            bidirectional: true,
            area: nav_area::JUMP,
            flags: 1,
            user_id: 7,
        };
        let mut nav = NavMesh::new(test_params(4.0))?;
        nav.add_or_replace_tile(0, 0, build_flat_tile_data(0, 0, 4.0, 2, &[link]).to_bytes()?)?;
        nav.add_or_replace_tile(2, 0, build_flat_tile(2, 0, 4.0, 2))?;

        let query = NavMeshQuery::new(&nav);
        let filter = QueryFilter::default();
        let ext = Vec3::new(0.5, 1.0, 0.5);
        let (s, sp) = query
            .find_nearest_poly(Vec3::new(1.0, 0.0, 1.0), ext, &filter)
            .unwrap();
        let (e, ep) = query
            .find_nearest_poly(Vec3::new(10.0, 0.0, 1.0), ext, &filter)
            .unwrap();

        let path = query.find_path(s, e, sp, ep, &filter)?;
        assert_eq!(path.last(), Some(&e));
        let crosses_link = path.iter().any(|&r| {
            nav.poly(r)
                .map_or(false, |(_, p)| p.poly_type == PolyType::OffMeshConnection)
        });
        assert!(crosses_link);

        let straight = query.find_straight_path(sp, ep, &path)?;
        assert!(straight
            .iter()
            .any(|p| p.flags & STRAIGHTPATH_OFFMESH_CONNECTION != 0));
        assert_ne!(straight.last().unwrap().flags & STRAIGHTPATH_END, 0);

        // The return trip works too since the link is bidirectional
        let back = query.find_path(e, s, ep, sp, &filter)?;
        assert_eq!(back.last(), Some(&s));
        Ok(())
    }

    #[test]
    fn test_one_way_connection_is_not_walked_backwards() -> Result<()> {
        let link = ConnectorSegment {
            start: Vec3::new(3.5, 0.0, 2.0),
            end: Vec3::new(8.5, 0.0, 2.0),
            radius: 0.5,
            bidirectional: false,
            area: nav_area::DROP,
            flags: 1,
            user_id: 8,
        };
        let mut nav = NavMesh::new(test_params(4.0))?;
        nav.add_or_replace_tile(0, 0, build_flat_tile_data(0, 0, 4.0, 2, &[link]).to_bytes()?)?;
        nav.add_or_replace_tile(2, 0, build_flat_tile(2, 0, 4.0, 2))?;

        let query = NavMeshQuery::new(&nav);
        let filter = QueryFilter::default();
        let ext = Vec3::new(0.5, 1.0, 0.5);
        let (s, sp) = query.find_nearest_poly(Vec3::new(10.0, 0.0, 1.0), ext, &filter).unwrap();
        let (e, ep) = query.find_nearest_poly(Vec3::new(1.0, 0.0, 1.0), ext, &filter).unwrap();

        // Unreachable: partial path stays on the far tile
        let path = query.find_path(s, e, sp, ep, &filter)?;
        assert_ne!(path.last(), Some(&e));
        assert!(path.iter().all(|r| r.tile == s.tile));
        Ok(())
    }
}
