//! Triangle mesh buffers used as world geometry input

use crate::{Bounds, Error, Result};
use glam::Vec3;

/// A simple triangle mesh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriMesh {
    /// The vertices of the mesh as a flat array of [x, y, z] coordinates
    pub vertices: Vec<f32>,
    /// The indices of the mesh, 3 per triangle
    pub indices: Vec<u32>,
}

impl TriMesh {
    /// Creates a new empty triangle mesh
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a mesh from flat buffers, validating index ranges.
    pub fn from_buffers(vertices: Vec<f32>, indices: Vec<u32>) -> Result<Self> {
        if vertices.len() % 3 != 0 {
            return Err(Error::InvalidMesh(format!(
                "vertex buffer length {} is not a multiple of 3",
                vertices.len()
            )));
        }
        if indices.len() % 3 != 0 {
            return Err(Error::InvalidMesh(format!(
                "index buffer length {} is not a multiple of 3",
                indices.len()
            )));
        }
        let vert_count = vertices.len() / 3;
        if let Some(bad) = indices.iter().find(|&&i| i as usize >= vert_count) {
            return Err(Error::InvalidMesh(format!(
                "index {bad} out of range for {vert_count} vertices"
            )));
        }
        Ok(Self { vertices, indices })
    }

    pub fn vert_count(&self) -> usize {
        self.vertices.len() / 3
    }

    pub fn tri_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    #[inline]
    pub fn vertex(&self, i: usize) -> Vec3 {
        Vec3::new(
            self.vertices[i * 3],
            self.vertices[i * 3 + 1],
            self.vertices[i * 3 + 2],
        )
    }

    /// Vertex indices of triangle `t`.
    #[inline]
    pub fn tri_indices(&self, t: usize) -> [u32; 3] {
        [
            self.indices[t * 3],
            self.indices[t * 3 + 1],
            self.indices[t * 3 + 2],
        ]
    }

    /// Corner positions of triangle `t`.
    #[inline]
    pub fn triangle(&self, t: usize) -> [Vec3; 3] {
        let [a, b, c] = self.tri_indices(t);
        [
            self.vertex(a as usize),
            self.vertex(b as usize),
            self.vertex(c as usize),
        ]
    }

    pub fn push_vertex(&mut self, v: Vec3) -> u32 {
        let index = self.vert_count() as u32;
        self.vertices.extend_from_slice(&[v.x, v.y, v.z]);
        index
    }

    pub fn push_triangle(&mut self, a: u32, b: u32, c: u32) {
        self.indices.extend_from_slice(&[a, b, c]);
    }

    /// Appends `other` with every vertex mapped through `transform`.
    pub fn append_transformed(&mut self, other: &TriMesh, transform: impl Fn(Vec3) -> Vec3) {
        let base = self.vert_count() as u32;
        self.vertices.reserve(other.vertices.len());
        for i in 0..other.vert_count() {
            let v = transform(other.vertex(i));
            self.vertices.extend_from_slice(&[v.x, v.y, v.z]);
        }
        self.indices.extend(other.indices.iter().map(|i| i + base));
    }

    /// Calculates the axis-aligned bounding box of the mesh
    pub fn calculate_bounds(&self) -> Bounds {
        if self.vert_count() == 0 {
            return Bounds::default();
        }

        let mut bounds = Bounds::empty();
        for i in 0..self.vert_count() {
            bounds.expand_point(self.vertex(i));
        }
        bounds
    }

    /// Bounds of triangle `t`.
    pub fn triangle_bounds(&self, t: usize) -> Bounds {
        Bounds::from_points(self.triangle(t).iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> TriMesh {
        TriMesh::from_buffers(
            vec![
                0.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, //
                1.0, 0.0, 1.0, //
                1.0, 0.0, 0.0,
            ],
            vec![0, 1, 2, 0, 2, 3],
        )
        .unwrap()
    }

    #[test]
    fn test_counts_and_bounds() {
        let mesh = quad();
        assert_eq!(mesh.vert_count(), 4);
        assert_eq!(mesh.tri_count(), 2);
        let b = mesh.calculate_bounds();
        assert_eq!(b.min, Vec3::ZERO);
        assert_eq!(b.max, Vec3::new(1.0, 0.0, 1.0));
    }

    #[test]
    fn test_from_buffers_rejects_bad_index() {
        let result = TriMesh::from_buffers(vec![0.0; 9], vec![0, 1, 3]);
        assert!(matches!(result, Err(Error::InvalidMesh(_))));
    }

    #[test]
    fn test_from_buffers_rejects_ragged_vertices() {
        assert!(TriMesh::from_buffers(vec![0.0; 8], vec![]).is_err());
    }

    #[test]
    fn test_append_transformed_offsets_indices() {
        let mut combined = quad();
        combined.append_transformed(&quad(), |v| v + Vec3::new(10.0, 0.0, 0.0));
        assert_eq!(combined.vert_count(), 8);
        assert_eq!(combined.tri_indices(2), [4, 5, 6]);
        assert_eq!(combined.vertex(7), Vec3::new(11.0, 0.0, 0.0));
    }
}
