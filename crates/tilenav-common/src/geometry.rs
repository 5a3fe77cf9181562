//! Geometry operations for tile planning, link generation and queries
//!
//! Most 2D operations work on the XZ plane (Y-up coordinate system).

use glam::Vec3;

/// Axis-aligned bounding box in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bounds {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// An inverted box that any point expands into.
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Vec3>) -> Self {
        let mut b = Self::empty();
        for p in points {
            b.expand_point(*p);
        }
        b
    }

    /// True once at least one point has been added.
    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    pub fn expand_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Grows the box by `amount` on X and Z only.
    pub fn expanded_xz(&self, amount: f32) -> Bounds {
        Bounds {
            min: Vec3::new(self.min.x - amount, self.min.y, self.min.z - amount),
            max: Vec3::new(self.max.x + amount, self.max.y, self.max.z + amount),
        }
    }

    pub fn overlaps(&self, other: &Bounds) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    pub fn overlaps_xz(&self, other: &Bounds) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    pub fn contains_xz(&self, p: Vec3) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.z >= self.min.z && p.z <= self.max.z
    }

    /// Component-wise comparison with tolerance `eps`.
    pub fn approx_eq(&self, other: &Bounds, eps: f32) -> bool {
        self.min.abs_diff_eq(other.min, eps) && self.max.abs_diff_eq(other.max, eps)
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Vec3::ZERO)
    }
}

/// Calculate twice the signed area of a triangle on the XZ plane.
///
/// Positive for clockwise winding when looking down the Y axis.
#[inline]
pub fn tri_area_2d(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let abx = b.x - a.x;
    let abz = b.z - a.z;
    let acx = c.x - a.x;
    let acz = c.z - a.z;
    acx * abz - abx * acz
}

#[inline]
pub fn dist_sqr_2d(a: Vec3, b: Vec3) -> f32 {
    let dx = b.x - a.x;
    let dz = b.z - a.z;
    dx * dx + dz * dz
}

#[inline]
pub fn dist_2d(a: Vec3, b: Vec3) -> f32 {
    dist_sqr_2d(a, b).sqrt()
}

/// Squared XZ distance from `p` to segment `a-b`, with the segment parameter of the closest point.
pub fn dist_point_segment_sqr_2d(p: Vec3, a: Vec3, b: Vec3) -> (f32, f32) {
    let dx = b.x - a.x;
    let dz = b.z - a.z;
    let d = dx * dx + dz * dz;
    let mut t = dx * (p.x - a.x) + dz * (p.z - a.z);
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);
    let cx = a.x + t * dx - p.x;
    let cz = a.z + t * dz - p.z;
    (cx * cx + cz * cz, t)
}

/// Closest point on segment `a-b` to `p`, measured on XZ with Y interpolated along the segment.
pub fn closest_point_on_segment_2d(p: Vec3, a: Vec3, b: Vec3) -> Vec3 {
    let (_, t) = dist_point_segment_sqr_2d(p, a, b);
    a.lerp(b, t)
}

/// Even-odd point in polygon test on the XZ plane.
pub fn point_in_polygon_2d(p: Vec3, verts: &[Vec3]) -> bool {
    let n = verts.len();
    let mut inside = false;
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let vi = verts[i];
        let vj = verts[j];
        if ((vi.z > p.z) != (vj.z > p.z))
            && (p.x < (vj.x - vi.x) * (p.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Height of triangle `a,b,c` below or above `p`, if `p` projects inside it on XZ.
pub fn closest_height_on_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    const EPS: f32 = 1e-6;
    let v0 = c - a;
    let v1 = b - a;
    let v2 = p - a;

    let denom = v0.x * v1.z - v0.z * v1.x;
    if denom.abs() < EPS {
        return None;
    }

    let u = (v1.z * v2.x - v1.x * v2.z) / denom;
    let v = (v0.x * v2.z - v0.z * v2.x) / denom;

    const EDGE_EPS: f32 = 1e-4;
    if u >= -EDGE_EPS && v >= -EDGE_EPS && (u + v) <= 1.0 + EDGE_EPS {
        Some(a.y + v0.y * u + v1.y * v)
    } else {
        None
    }
}

/// Unit normal of triangle `a,b,c`, or zero for a degenerate triangle.
pub fn triangle_normal(a: Vec3, b: Vec3, c: Vec3) -> Vec3 {
    (b - a).cross(c - a).normalize_or_zero()
}

/// Intersects segment `sp-sq` with triangle `a,b,c`.
///
/// Returns the segment parameter in `[0, 1]` of the hit. Both faces count.
pub fn intersect_segment_triangle(sp: Vec3, sq: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    // Möller–Trumbore on the segment direction
    let dir = sq - sp;
    let edge1 = b - a;
    let edge2 = c - a;

    let h = dir.cross(edge2);
    let det = edge1.dot(h);
    if det.abs() < 1e-9 {
        return None;
    }

    let f = 1.0 / det;
    let s = sp - a;
    let u = f * s.dot(h);
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = s.cross(edge1);
    let v = f * dir.dot(q);
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = f * edge2.dot(q);
    if (0.0..=1.0).contains(&t) {
        Some(t)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_union_and_overlap() {
        let a = Bounds::new(Vec3::ZERO, Vec3::ONE);
        let b = Bounds::new(Vec3::splat(2.0), Vec3::splat(3.0));
        assert!(!a.overlaps(&b));
        let u = a.union(&b);
        assert_eq!(u.min, Vec3::ZERO);
        assert_eq!(u.max, Vec3::splat(3.0));
        assert!(u.overlaps(&a) && u.overlaps(&b));
    }

    #[test]
    fn test_empty_bounds_expand() {
        let mut b = Bounds::empty();
        assert!(!b.is_valid());
        b.expand_point(Vec3::new(1.0, 2.0, 3.0));
        assert!(b.is_valid());
        assert_eq!(b.min, b.max);
    }

    #[test]
    fn test_expanded_xz_keeps_y() {
        let b = Bounds::new(Vec3::ZERO, Vec3::ONE).expanded_xz(0.5);
        assert_eq!(b.min, Vec3::new(-0.5, 0.0, -0.5));
        assert_eq!(b.max, Vec3::new(1.5, 1.0, 1.5));
    }

    #[test]
    fn test_point_in_polygon_2d() {
        let square = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 0.0),
        ];
        assert!(point_in_polygon_2d(Vec3::new(1.0, 5.0, 1.0), &square));
        assert!(!point_in_polygon_2d(Vec3::new(3.0, 0.0, 1.0), &square));
    }

    #[test]
    fn test_closest_height_on_sloped_triangle() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(0.0, 0.0, 2.0);
        let c = Vec3::new(2.0, 2.0, 0.0);
        let h = closest_height_on_triangle(Vec3::new(1.0, 10.0, 0.5), a, b, c).unwrap();
        assert!((h - 1.0).abs() < 1e-4);
        assert!(closest_height_on_triangle(Vec3::new(5.0, 0.0, 5.0), a, b, c).is_none());
    }

    #[test]
    fn test_segment_triangle_hits_both_faces() {
        let a = Vec3::new(-1.0, 0.0, -1.0);
        let b = Vec3::new(-1.0, 0.0, 1.0);
        let c = Vec3::new(1.0, 0.0, 0.0);
        let down = intersect_segment_triangle(Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, -1.0, 0.0), a, b, c);
        let up = intersect_segment_triangle(Vec3::new(0.0, -1.0, 0.0), Vec3::new(0.0, 1.0, 0.0), a, b, c);
        assert!((down.unwrap() - 0.5).abs() < 1e-5);
        assert!((up.unwrap() - 0.5).abs() < 1e-5);
        assert!(intersect_segment_triangle(Vec3::new(0.0, 2.0, 0.0), Vec3::new(0.0, 1.0, 0.0), a, b, c).is_none());
    }

    #[test]
    fn test_dist_point_segment() {
        let (d, t) = dist_point_segment_sqr_2d(
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
        );
        assert!((d - 1.0).abs() < 1e-6);
        assert!((t - 0.5).abs() < 1e-6);
    }
}
