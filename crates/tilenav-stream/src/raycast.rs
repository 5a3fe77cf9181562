use glam::Vec3;
use tilenav_common::{intersect_segment_triangle, triangle_normal, Bounds, TriMesh};

/// Result of a segment cast against world triangles
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// Segment parameter of the hit in `[0, 1]`
    pub t: f32,
    /// The world position of the hit
    pub position: Vec3,
    /// Unit triangle normal, oriented against the segment direction
    pub normal: Vec3,
    pub triangle: u32,
}

/// Triangle soup copy of the world with a uniform XZ grid for segment casts.
///
/// Cells are walked with the Fast Voxel Traversal Algorithm by John Amanatides and
/// Andrew Woo, so a cast only tests triangles in cells the segment crosses.
#[derive(Debug, Clone)]
pub struct RaycastMesh {
    tris: Vec<[Vec3; 3]>,
    bounds: Bounds,
    cell_size: f32,
    cells_x: i32,
    cells_z: i32,
    cells: Vec<Vec<u32>>,
}

impl RaycastMesh {
    pub const DEFAULT_CELL_SIZE: f32 = 4.0;
    const MAX_CELLS: i64 = 1 << 20;

    pub fn new(mesh: &TriMesh) -> Self {
        Self::with_cell_size(mesh, Self::DEFAULT_CELL_SIZE)
    }

    pub fn with_cell_size(mesh: &TriMesh, cell_size: f32) -> Self {
        let tris: Vec<[Vec3; 3]> = (0..mesh.tri_count()).map(|t| mesh.triangle(t)).collect();
        let bounds = mesh.calculate_bounds();
        let size = bounds.size();

        let mut cell_size = if cell_size > 0.0 { cell_size } else { Self::DEFAULT_CELL_SIZE };
        let count = |cs: f32| {
            (
                ((size.x / cs).ceil() as i64).max(1),
                ((size.z / cs).ceil() as i64).max(1),
            )
        };
        while {
            let (x, z) = count(cell_size);
            x * z > Self::MAX_CELLS
        } {
            cell_size *= 2.0;
        }
        let (cells_x, cells_z) = count(cell_size);

        let mut grid = Self {
            tris,
            bounds,
            cell_size,
            cells_x: cells_x as i32,
            cells_z: cells_z as i32,
            cells: vec![Vec::new(); (cells_x * cells_z) as usize],
        };
        for (index, tri) in grid.tris.iter().enumerate() {
            let tb = Bounds::from_points(tri.iter());
            let (x0, z0) = grid.cell_of(tb.min);
            let (x1, z1) = grid.cell_of(tb.max);
            for z in z0..=z1 {
                for x in x0..=x1 {
                    let cell = (z * grid.cells_x + x) as usize;
                    grid.cells[cell].push(index as u32);
                }
            }
        }
        grid
    }

    pub fn tri_count(&self) -> usize {
        self.tris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tris.is_empty()
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// First triangle hit along `start -> end`.
    pub fn raycast(&self, start: Vec3, end: Vec3) -> Option<RayHit> {
        if self.tris.is_empty() {
            return None;
        }
        let dir = end - start;
        let (t_enter, t_leave) = self.clip_xz(start, dir)?;

        let (mut cx, mut cz) = self.cell_of(start + dir * t_enter);
        let (ex, ez) = self.cell_of(start + dir * t_leave);

        let step_x = if dir.x < 0.0 { -1 } else { 1 };
        let step_z = if dir.z < 0.0 { -1 } else { 1 };

        let boundary = |cell: i32, step: i32, origin: f32| {
            origin + (cell + if step > 0 { 1 } else { 0 }) as f32 * self.cell_size
        };
        let mut t_max_x = if dir.x != 0.0 {
            (boundary(cx, step_x, self.bounds.min.x) - start.x) / dir.x
        } else {
            f32::INFINITY
        };
        let mut t_max_z = if dir.z != 0.0 {
            (boundary(cz, step_z, self.bounds.min.z) - start.z) / dir.z
        } else {
            f32::INFINITY
        };
        let t_delta_x = if dir.x != 0.0 {
            self.cell_size / dir.x.abs()
        } else {
            f32::INFINITY
        };
        let t_delta_z = if dir.z != 0.0 {
            self.cell_size / dir.z.abs()
        } else {
            f32::INFINITY
        };

        let mut best: Option<RayHit> = None;
        let max_steps = (ex - cx).abs() + (ez - cz).abs() + 1;
        for _ in 0..=max_steps {
            let cell_exit = t_max_x.min(t_max_z).min(1.0);
            self.test_cell(cx, cz, start, end, &mut best);

            // Anything hit before leaving this cell cannot be beaten by later cells
            if best.is_some_and(|hit| hit.t <= cell_exit) {
                break;
            }
            if cx == ex && cz == ez {
                break;
            }

            if t_max_x < t_max_z {
                t_max_x += t_delta_x;
                cx += step_x;
            } else {
                t_max_z += t_delta_z;
                cz += step_z;
            }
        }

        best
    }

    /// True when nothing blocks the segment `a -> b`.
    pub fn is_segment_clear(&self, a: Vec3, b: Vec3) -> bool {
        self.raycast(a, b).is_none()
    }

    fn test_cell(&self, cx: i32, cz: i32, start: Vec3, end: Vec3, best: &mut Option<RayHit>) {
        if cx < 0 || cz < 0 || cx >= self.cells_x || cz >= self.cells_z {
            return;
        }
        let dir = end - start;
        for &index in &self.cells[(cz * self.cells_x + cx) as usize] {
            let [a, b, c] = self.tris[index as usize];
            let Some(t) = intersect_segment_triangle(start, end, a, b, c) else {
                continue;
            };
            if best.is_some_and(|hit| hit.t <= t) {
                continue;
            }
            let mut normal = triangle_normal(a, b, c);
            if normal.dot(dir) > 0.0 {
                normal = -normal;
            }
            *best = Some(RayHit {
                t,
                position: start + dir * t,
                normal,
                triangle: index,
            });
        }
    }

    /// Clamped grid cell containing `p` on XZ.
    fn cell_of(&self, p: Vec3) -> (i32, i32) {
        let x = ((p.x - self.bounds.min.x) / self.cell_size).floor() as i32;
        let z = ((p.z - self.bounds.min.z) / self.cell_size).floor() as i32;
        (x.clamp(0, self.cells_x - 1), z.clamp(0, self.cells_z - 1))
    }

    /// Parameter range of the segment inside the grid's XZ rectangle.
    fn clip_xz(&self, start: Vec3, dir: Vec3) -> Option<(f32, f32)> {
        let mut t0 = 0.0f32;
        let mut t1 = 1.0f32;
        for (s, d, lo, hi) in [
            (start.x, dir.x, self.bounds.min.x, self.bounds.max.x),
            (start.z, dir.z, self.bounds.min.z, self.bounds.max.z),
        ] {
            if d.abs() < 1e-12 {
                if s < lo || s > hi {
                    return None;
                }
                continue;
            }
            let (mut a, mut b) = ((lo - s) / d, (hi - s) / d);
            if a > b {
                std::mem::swap(&mut a, &mut b);
            }
            t0 = t0.max(a);
            t1 = t1.min(b);
            if t0 > t1 {
                return None;
            }
        }
        Some((t0, t1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floor_and_wall() -> TriMesh {
        let mut mesh = TriMesh::new();
        // Floor 0..20 at y = 0
        let a = mesh.push_vertex(Vec3::new(0.0, 0.0, 0.0));
        let b = mesh.push_vertex(Vec3::new(20.0, 0.0, 0.0));
        let c = mesh.push_vertex(Vec3::new(20.0, 0.0, 20.0));
        let d = mesh.push_vertex(Vec3::new(0.0, 0.0, 20.0));
        mesh.push_triangle(a, c, b);
        mesh.push_triangle(a, d, c);
        // Wall at x = 10, 0..3 high, z 5..15
        let e = mesh.push_vertex(Vec3::new(10.0, 0.0, 5.0));
        let f = mesh.push_vertex(Vec3::new(10.0, 3.0, 5.0));
        let g = mesh.push_vertex(Vec3::new(10.0, 3.0, 15.0));
        let h = mesh.push_vertex(Vec3::new(10.0, 0.0, 15.0));
        mesh.push_triangle(e, f, g);
        mesh.push_triangle(e, g, h);
        mesh
    }

    #[test]
    fn test_downward_ray_hits_floor() {
        let grid = RaycastMesh::with_cell_size(&floor_and_wall(), 2.0);
        let hit = grid
            .raycast(Vec3::new(3.0, 5.0, 3.0), Vec3::new(3.0, -5.0, 3.0))
            .unwrap();
        assert!((hit.t - 0.5).abs() < 1e-5);
        assert!(hit.position.abs_diff_eq(Vec3::new(3.0, 0.0, 3.0), 1e-4));
        assert!(hit.normal.abs_diff_eq(Vec3::Y, 1e-5));
    }

    #[test]
    fn test_horizontal_ray_hits_wall_first() {
        let grid = RaycastMesh::with_cell_size(&floor_and_wall(), 2.0);
        let hit = grid
            .raycast(Vec3::new(2.0, 1.0, 10.0), Vec3::new(18.0, 1.0, 10.0))
            .unwrap();
        assert!((hit.position.x - 10.0).abs() < 1e-4);
        assert!(hit.normal.abs_diff_eq(Vec3::NEG_X, 1e-5));

        let back = grid
            .raycast(Vec3::new(18.0, 1.0, 10.0), Vec3::new(2.0, 1.0, 10.0))
            .unwrap();
        assert!(back.normal.abs_diff_eq(Vec3::X, 1e-5));
    }

    #[test]
    fn test_clear_segments() {
        let grid = RaycastMesh::with_cell_size(&floor_and_wall(), 2.0);
        // Passes over the wall
        assert!(grid.is_segment_clear(Vec3::new(2.0, 4.0, 10.0), Vec3::new(18.0, 4.0, 10.0)));
        // Beside the wall
        assert!(grid.is_segment_clear(Vec3::new(2.0, 1.0, 18.0), Vec3::new(18.0, 1.0, 18.0)));
        // Entirely outside the mesh
        assert!(grid.is_segment_clear(Vec3::new(-10.0, 1.0, -10.0), Vec3::new(-5.0, 1.0, -10.0)));
        assert!(!grid.is_segment_clear(Vec3::new(2.0, 1.0, 10.0), Vec3::new(18.0, 1.0, 10.0)));
    }

    #[test]
    fn test_matches_brute_force() {
        let mesh = floor_and_wall();
        let grid = RaycastMesh::with_cell_size(&mesh, 1.5);
        let cases = [
            (Vec3::new(-3.0, 2.0, 7.0), Vec3::new(25.0, -1.0, 12.0)),
            (Vec3::new(19.0, 6.0, 1.0), Vec3::new(1.0, -2.0, 19.0)),
            (Vec3::new(12.0, 0.5, -4.0), Vec3::new(8.0, 0.5, 24.0)),
        ];
        for (a, b) in cases {
            let expected = (0..mesh.tri_count())
                .filter_map(|t| {
                    let [p, q, r] = mesh.triangle(t);
                    intersect_segment_triangle(a, b, p, q, r)
                })
                .fold(None, |best: Option<f32>, t| Some(best.map_or(t, |b| b.min(t))));
            let got = grid.raycast(a, b).map(|h| h.t);
            match (expected, got) {
                (Some(e), Some(g)) => assert!((e - g).abs() < 1e-5, "{a} -> {b}"),
                (None, None) => {}
                other => panic!("{a} -> {b}: {other:?}"),
            }
        }
    }
}
