//! Named geometry instances and the combined world mesh built from them

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use glam::{Mat3, Vec3};
use tilenav_common::{deg_to_rad, Bounds, Error, Result, TriMesh};

/// Rotation for Euler angles in degrees: `Ry(z) * Rx(x) * Rz(y)`, each angle taken
/// modulo 360.
pub fn rotation_matrix(rotation_deg: Vec3) -> Mat3 {
    let rx = deg_to_rad(rotation_deg.x % 360.0);
    let ry = deg_to_rad(rotation_deg.y % 360.0);
    let rz = deg_to_rad(rotation_deg.z % 360.0);
    Mat3::from_rotation_y(rz) * Mat3::from_rotation_x(rx) * Mat3::from_rotation_z(ry)
}

/// A placed copy of a source mesh
#[derive(Debug, Clone)]
pub struct GeometryInstance {
    pub id: String,
    source: Arc<TriMesh>,
    position: Vec3,
    rotation: Vec3,
    world_bounds: Bounds,
}

impl GeometryInstance {
    pub fn new(
        id: impl Into<String>,
        source: Arc<TriMesh>,
        position: Vec3,
        rotation: Vec3,
    ) -> Result<Self> {
        if !position.is_finite() || !rotation.is_finite() {
            return Err(Error::InvalidMesh(
                "instance transform must be finite".to_string(),
            ));
        }
        let mut instance = Self {
            id: id.into(),
            source,
            position,
            rotation,
            world_bounds: Bounds::default(),
        };
        instance.world_bounds = instance.compute_world_bounds();
        Ok(instance)
    }

    pub fn source(&self) -> &Arc<TriMesh> {
        &self.source
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Euler angles in degrees
    pub fn rotation(&self) -> Vec3 {
        self.rotation
    }

    pub fn world_bounds(&self) -> Bounds {
        self.world_bounds
    }

    /// Identity of the shared source buffer, stable while the `Arc` lives.
    pub fn source_id(&self) -> usize {
        Arc::as_ptr(&self.source) as usize
    }

    pub fn vertex_count(&self) -> usize {
        self.source.vert_count()
    }

    pub fn index_count(&self) -> usize {
        self.source.indices.len()
    }

    pub fn set_transform(&mut self, position: Vec3, rotation: Vec3) -> Result<()> {
        if !position.is_finite() || !rotation.is_finite() {
            return Err(Error::InvalidMesh(
                "instance transform must be finite".to_string(),
            ));
        }
        self.position = position;
        self.rotation = rotation;
        self.world_bounds = self.compute_world_bounds();
        Ok(())
    }

    fn compute_world_bounds(&self) -> Bounds {
        if self.source.vert_count() == 0 {
            return Bounds::new(self.position, self.position);
        }
        let rot = rotation_matrix(self.rotation);
        let mut bounds = Bounds::empty();
        for i in 0..self.source.vert_count() {
            bounds.expand_point(rot * self.source.vertex(i) + self.position);
        }
        bounds
    }
}

/// Every instance of the world, ordered by id
#[derive(Debug, Clone, Default)]
pub struct GeometrySet {
    instances: BTreeMap<String, GeometryInstance>,
}

impl GeometrySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Inserts or replaces the instance with the same id, returning the old one.
    pub fn insert(&mut self, instance: GeometryInstance) -> Option<GeometryInstance> {
        self.instances.insert(instance.id.clone(), instance)
    }

    pub fn update_transform(&mut self, id: &str, position: Vec3, rotation: Vec3) -> Result<()> {
        let instance = self
            .instances
            .get_mut(id)
            .ok_or_else(|| Error::InvalidMesh(format!("unknown instance '{id}'")))?;
        instance.set_transform(position, rotation)
    }

    pub fn remove(&mut self, id: &str) -> Option<GeometryInstance> {
        self.instances.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&GeometryInstance> {
        self.instances.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GeometryInstance> {
        self.instances.values()
    }

    pub fn clear(&mut self) {
        self.instances.clear();
    }

    /// Union of every instance's world bounds.
    pub fn world_bounds(&self) -> Option<Bounds> {
        self.instances
            .values()
            .map(|i| i.world_bounds())
            .reduce(|a, b| a.union(&b))
    }

    /// Concatenates every instance in world space.
    ///
    /// With `clip`, only triangles whose bounds overlap the box are kept and vertices
    /// no kept triangle uses are dropped.
    pub fn combine(&self, clip: Option<&Bounds>) -> TriMesh {
        let mut combined = TriMesh::new();
        for instance in self.instances.values() {
            if let Some(clip) = clip {
                if !instance.world_bounds().overlaps(clip) {
                    continue;
                }
            }
            let rot = rotation_matrix(instance.rotation);
            combined.append_transformed(&instance.source, |v| rot * v + instance.position);
        }

        match clip {
            Some(clip) => clip_mesh(&combined, clip),
            None => combined,
        }
    }
}

fn clip_mesh(mesh: &TriMesh, clip: &Bounds) -> TriMesh {
    let mut out = TriMesh::new();
    let mut remap: HashMap<u32, u32> = HashMap::new();
    for t in 0..mesh.tri_count() {
        if !mesh.triangle_bounds(t).overlaps(clip) {
            continue;
        }
        let [a, b, c] = mesh.tri_indices(t).map(|v| {
            *remap
                .entry(v)
                .or_insert_with(|| out.push_vertex(mesh.vertex(v as usize)))
        });
        out.push_triangle(a, b, c);
    }
    out
}
