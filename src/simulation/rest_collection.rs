use std::collections::{HashMap, HashSet};

use crate::{floating_type_mod::FT, vec3f, SolverError, V3};

pub const MASS_ATTRIBUTE: &str = "mass";
pub const DAMPING_ATTRIBUTE: &str = "damping";
pub const STIFFNESS_ATTRIBUTE: &str = "stiffness";

/** Vertices driven by one bone. Bound vertices become kinematic particles. */
#[derive(Debug, Clone, PartialEq)]
pub struct KinematicBinding {
    pub bone_index: i32,
    pub vertices: Vec<usize>,
    pub weights: Vec<FT>,
}

/**
 * Pulls the weighted sum of the source vertices toward the weighted sum of the
 * target vertices. With no target vertices the goal is `target_position`
 * (world space), which an input buffer can override every frame.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct PositionTarget {
    pub source_indices: Vec<usize>,
    pub source_weights: Vec<FT>,
    pub target_indices: Vec<usize>,
    pub target_weights: Vec<FT>,
    pub stiffness: FT,
    pub target_position: Option<V3>,
}

/** Immutable rest description of one simulated body. */
#[derive(Debug, Clone, Default)]
pub struct RestCollection {
    pub vertices: Vec<V3>,
    pub attributes: HashMap<String, Vec<FT>>,
    pub edges: Vec<[usize; 2]>,
    pub triangles: Vec<[usize; 3]>,
    pub tetrahedra: Vec<[usize; 4]>,
    pub kinematic_bindings: Vec<KinematicBinding>,
    // (bone, weight) pairs per vertex, used for skinning kinematic particles
    pub vertex_bone_weights: Option<Vec<Vec<(i32, FT)>>>,
    pub position_targets: Vec<PositionTarget>,
}

impl RestCollection {
    pub fn new(vertices: Vec<V3>) -> Self {
        RestCollection {
            vertices,
            ..Default::default()
        }
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn attribute(&self, name: &str) -> Option<&[FT]> {
        self.attributes.get(name).map(|v| v.as_slice())
    }

    pub fn set_attribute(&mut self, name: &str, values: Vec<FT>) {
        self.attributes.insert(name.to_string(), values);
    }

    /** Binds every listed vertex to `bone_index` with unit weight. */
    pub fn bind_kinematic(&mut self, bone_index: i32, vertices: Vec<usize>) {
        let weights = vec![1.; vertices.len()];
        self.kinematic_bindings.push(KinematicBinding {
            bone_index,
            vertices,
            weights,
        });
    }

    pub fn kinematic_vertices(&self) -> impl Iterator<Item = usize> + '_ {
        self.kinematic_bindings.iter().flat_map(|b| b.vertices.iter().cloned())
    }

    pub fn validate(&self) -> Result<(), SolverError> {
        let n = self.vertices.len();
        let check = |family: &'static str, i: usize| {
            if i < n {
                Ok(())
            } else {
                Err(SolverError::IndexOutOfRange {
                    family,
                    index: i,
                    count: n,
                })
            }
        };

        for (name, values) in &self.attributes {
            if values.len() != n {
                return Err(SolverError::MalformedRestData(format!(
                    "attribute '{}' has {} entries for {} vertices",
                    name,
                    values.len(),
                    n
                )));
            }
        }
        for e in &self.edges {
            e.iter().try_for_each(|&i| check("edges", i))?;
        }
        for t in &self.triangles {
            t.iter().try_for_each(|&i| check("triangles", i))?;
        }
        for t in &self.tetrahedra {
            t.iter().try_for_each(|&i| check("tetrahedra", i))?;
        }
        for b in &self.kinematic_bindings {
            if b.vertices.len() != b.weights.len() {
                return Err(SolverError::MalformedRestData(format!(
                    "kinematic binding of bone {} has {} vertices but {} weights",
                    b.bone_index,
                    b.vertices.len(),
                    b.weights.len()
                )));
            }
            b.vertices.iter().try_for_each(|&i| check("kinematic bindings", i))?;
        }
        if let Some(weights) = &self.vertex_bone_weights {
            if weights.len() != n {
                return Err(SolverError::MalformedRestData(format!(
                    "{} bone weight lists for {} vertices",
                    weights.len(),
                    n
                )));
            }
        }
        for t in &self.position_targets {
            if t.source_indices.len() != t.source_weights.len() || t.target_indices.len() != t.target_weights.len() {
                return Err(SolverError::MalformedRestData(
                    "position target index and weight lists differ in length".to_string(),
                ));
            }
            t.source_indices.iter().try_for_each(|&i| check("position targets", i))?;
            t.target_indices.iter().try_for_each(|&i| check("position targets", i))?;
        }
        Ok(())
    }

    /** Explicit edges plus every triangle and tetrahedron edge, deduplicated and sorted. */
    pub fn unique_edges(&self) -> Vec<[usize; 2]> {
        let mut set: HashSet<[usize; 2]> = HashSet::new();
        let mut add = |a: usize, b: usize| {
            if a != b {
                set.insert([a.min(b), a.max(b)]);
            }
        };
        for e in &self.edges {
            add(e[0], e[1]);
        }
        for t in &self.triangles {
            add(t[0], t[1]);
            add(t[1], t[2]);
            add(t[2], t[0]);
        }
        for t in &self.tetrahedra {
            for a in 0..4 {
                for b in (a + 1)..4 {
                    add(t[a], t[b]);
                }
            }
        }
        let mut edges: Vec<_> = set.into_iter().collect();
        edges.sort();
        edges
    }

    /**
     * For every pair of triangles sharing an edge, the two vertices opposite
     * that edge. Springs between them resist bending.
     */
    pub fn bending_pairs(&self) -> Vec<[usize; 2]> {
        let mut opposite: HashMap<[usize; 2], Vec<usize>> = HashMap::new();
        for t in &self.triangles {
            for k in 0..3 {
                let a = t[k];
                let b = t[(k + 1) % 3];
                let c = t[(k + 2) % 3];
                opposite.entry([a.min(b), a.max(b)]).or_default().push(c);
            }
        }
        let mut pairs: Vec<[usize; 2]> = opposite
            .values()
            .filter(|v| v.len() == 2 && v[0] != v[1])
            .map(|v| [v[0].min(v[1]), v[0].max(v[1])])
            .collect();
        pairs.sort();
        pairs.dedup();
        pairs
    }

    /** Faces referenced by exactly one tetrahedron. */
    pub fn surface_from_tetrahedra(&self) -> Vec<[usize; 3]> {
        let mut count: HashMap<[usize; 3], ([usize; 3], usize)> = HashMap::new();
        for t in &self.tetrahedra {
            for face in [[t[0], t[2], t[1]], [t[0], t[1], t[3]], [t[1], t[2], t[3]], [t[0], t[3], t[2]]] {
                let mut key = face;
                key.sort();
                count.entry(key).or_insert((face, 0)).1 += 1;
            }
        }
        let mut faces: Vec<[usize; 3]> = count.into_values().filter(|(_, c)| *c == 1).map(|(f, _)| f).collect();
        faces.sort();
        faces
    }

    /**
     * A cloth patch of `nx * ny` vertices in the xy-plane, starting at the
     * origin. Vertex `i + j * nx` sits at `(i, j) * spacing`.
     */
    pub fn cloth_grid(nx: usize, ny: usize, spacing: FT) -> Self {
        assert!(nx >= 2 && ny >= 2, "cloth grid needs at least 2x2 vertices");
        let mut vertices = Vec::with_capacity(nx * ny);
        for j in 0..ny {
            for i in 0..nx {
                vertices.push(vec3f(i as FT * spacing, j as FT * spacing, 0.));
            }
        }
        let mut triangles = Vec::new();
        for j in 0..ny - 1 {
            for i in 0..nx - 1 {
                let a = i + j * nx;
                let b = a + 1;
                let c = a + nx;
                let d = c + 1;
                triangles.push([a, b, d]);
                triangles.push([a, d, c]);
            }
        }
        RestCollection {
            vertices,
            triangles,
            ..Default::default()
        }
    }

    /**
     * A box of `nx * ny * nz` cells, each split into six tetrahedra along its
     * main diagonal. The boundary faces become the surface triangles.
     */
    pub fn tet_box(nx: usize, ny: usize, nz: usize, spacing: FT) -> Self {
        assert!(nx >= 1 && ny >= 1 && nz >= 1);
        let vx = nx + 1;
        let vy = ny + 1;
        let vz = nz + 1;
        let index = |i: usize, j: usize, k: usize| i + j * vx + k * vx * vy;

        let mut vertices = Vec::with_capacity(vx * vy * vz);
        for k in 0..vz {
            for j in 0..vy {
                for i in 0..vx {
                    vertices.push(vec3f(i as FT * spacing, j as FT * spacing, k as FT * spacing));
                }
            }
        }

        // corner c of a cell has offset (c & 1, (c >> 1) & 1, (c >> 2) & 1)
        const CELL_TETS: [[usize; 4]; 6] = [
            [0, 1, 3, 7],
            [0, 5, 1, 7],
            [0, 3, 2, 7],
            [0, 2, 6, 7],
            [0, 4, 5, 7],
            [0, 6, 4, 7],
        ];
        let mut tetrahedra = Vec::with_capacity(nx * ny * nz * 6);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let corner = |c: usize| index(i + (c & 1), j + ((c >> 1) & 1), k + ((c >> 2) & 1));
                    for t in CELL_TETS.iter() {
                        tetrahedra.push([corner(t[0]), corner(t[1]), corner(t[2]), corner(t[3])]);
                    }
                }
            }
        }

        let mut rest = RestCollection {
            vertices,
            tetrahedra,
            ..Default::default()
        };
        rest.triangles = rest.surface_from_tetrahedra();
        rest
    }
}
