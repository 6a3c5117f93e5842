use std::collections::HashSet;

use rstar::{
    primitives::{GeomWithData, Rectangle},
    RTree, AABB,
};

use super::{check_local_indices, check_range, ConstraintRule, FamilyContext};
use crate::{floating_type_mod::FT, particles::ParticleRange, particles::ParticleVec, SolverError, V3};

type TriangleBounds = GeomWithData<Rectangle<[FT; 3]>, usize>;

const MIN_NORMAL_LENGTH: FT = 1e-12;

/** Barycentric weights of the point on triangle `abc` closest to `p`. */
pub(super) fn closest_barycentric(p: V3, a: V3, b: V3, c: V3) -> V3 {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;
    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0. && d2 <= 0. {
        return V3::new(1., 0., 0.);
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0. && d4 <= d3 {
        return V3::new(0., 1., 0.);
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0. && d1 >= 0. && d3 <= 0. {
        let v = d1 / (d1 - d3);
        return V3::new(1. - v, v, 0.);
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0. && d5 <= d6 {
        return V3::new(0., 0., 1.);
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0. && d2 >= 0. && d6 <= 0. {
        let w = d2 / (d2 - d6);
        return V3::new(1. - w, 0., w);
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0. && (d4 - d3) >= 0. && (d5 - d6) >= 0. {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return V3::new(0., 1. - w, w);
    }

    let denom = 1. / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    V3::new(1. - v - w, v, w)
}

fn unit_normal(a: V3, b: V3, c: V3) -> Option<V3> {
    let n = (b - a).cross(&(c - a));
    let len = n.norm();
    if len < MIN_NORMAL_LENGTH {
        None
    } else {
        Some(n / len)
    }
}

fn swept_bounds(points: impl IntoIterator<Item = V3>, margin: FT) -> AABB<[FT; 3]> {
    let mut lower = V3::repeat(FT::MAX);
    let mut upper = V3::repeat(FT::MIN);
    for q in points {
        lower = lower.inf(&q);
        upper = upper.sup(&q);
    }
    let margin = V3::repeat(margin);
    AABB::from_corners((lower - margin).into(), (upper + margin).into())
}

/** Candidate pair found in `init`, resolved against current positions in `apply`. */
#[derive(Debug, Clone, Copy)]
struct Contact {
    particle: usize,
    triangle: [usize; 3],
    // side of the triangle the particle was on at the start of the sub-step
    side: FT,
}

/**
 * Particle versus triangle self-collision over every registered surface. The
 * R-tree of swept triangle bounds is rebuilt once per sub-step in `init`;
 * `apply` pushes each candidate particle to `thickness` on the side it started
 * the sub-step on. Pairs of vertices sharing a triangle never collide.
 */
pub struct SelfCollisionConstraints {
    generation: u64,
    meshes: Vec<(ParticleRange, Vec<[usize; 3]>)>,
    // global vertex pairs of adjacent geometry, stored as (min, max)
    disabled_pairs: HashSet<(usize, usize)>,
    thickness: FT,
    stiffness: FT,
    friction: FT,
    iterations: usize,
    contacts: Vec<Contact>,
}

impl SelfCollisionConstraints {
    pub fn new(
        generation: u64,
        meshes: Vec<(ParticleRange, Vec<[usize; 3]>)>,
        thickness: FT,
        stiffness: FT,
        friction: FT,
        iterations: usize,
    ) -> Result<Self, SolverError> {
        let mut disabled_pairs = HashSet::new();
        for (range, triangles) in &meshes {
            check_local_indices("self_collision", *range, triangles.iter().flat_map(|t| t.iter().cloned()))?;
            for t in triangles {
                for a in 0..3 {
                    // (i, i) is disabled as well
                    for b in a..3 {
                        let (i, j) = (range.start + t[a], range.start + t[b]);
                        disabled_pairs.insert((i.min(j), i.max(j)));
                    }
                }
            }
        }

        Ok(SelfCollisionConstraints {
            generation,
            meshes,
            disabled_pairs,
            thickness,
            stiffness,
            friction,
            iterations: iterations.max(1),
            contacts: Vec::new(),
        })
    }

    pub fn is_disabled(&self, i: usize, j: usize) -> bool {
        self.disabled_pairs.contains(&(i.min(j), i.max(j)))
    }

    pub fn num_contacts(&self) -> usize {
        self.contacts.len()
    }

    fn collides_with(&self, particle: usize, triangle: &[usize; 3]) -> bool {
        triangle.iter().all(|&t| !self.is_disabled(particle, t))
    }

    fn project_contact(&self, particles: &mut ParticleVec, contact: &Contact) {
        let [a, b, c] = contact.triangle;
        let i = contact.particle;
        let p = &particles.p;
        let n = match unit_normal(p[a], p[b], p[c]) {
            Some(n) => n * contact.side,
            None => return,
        };
        let bary = closest_barycentric(p[i], p[a], p[b], p[c]);
        let q = p[a] * bary.x + p[b] * bary.y + p[c] * bary.z;

        let offset = p[i] - q;
        let depth = offset.dot(&n);
        let lateral = (offset - n * depth).norm();
        if depth >= self.thickness || lateral > self.thickness {
            return;
        }

        let w = &particles.inv_m;
        let w_sum = w[i] + w[a] * bary.x * bary.x + w[b] * bary.y * bary.y + w[c] * bary.z * bary.z;
        if w_sum == 0. {
            return;
        }

        let penetration = self.thickness - depth;
        let dl = self.stiffness * penetration / w_sum;
        let mut push = n * dl;

        if self.friction > 0. {
            let x = &particles.x;
            let relative = (p[i] - x[i]) - ((p[a] - x[a]) * bary.x + (p[b] - x[b]) * bary.y + (p[c] - x[c]) * bary.z);
            let tangential = relative - n * relative.dot(&n);
            let tangential_len = tangential.norm();
            if tangential_len > 0. {
                let limit = self.friction * penetration;
                let scale = if tangential_len <= limit { 1. } else { limit / tangential_len };
                push -= tangential * (scale / w_sum);
            }
        }

        let p = &mut particles.p;
        p[i] += push * w[i];
        p[a] -= push * (w[a] * bary.x);
        p[b] -= push * (w[b] * bary.y);
        p[c] -= push * (w[c] * bary.z);
    }
}

impl ConstraintRule for SelfCollisionConstraints {
    fn name(&self) -> &'static str {
        "self_collision"
    }

    fn built_generation(&self) -> u64 {
        self.generation
    }

    fn init(&mut self, particles: &mut ParticleVec, _dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
        for (range, _) in &self.meshes {
            check_range(self.name(), *range, particles)?;
        }

        let x = &particles.x;
        let p = &particles.p;
        let search = 2. * self.thickness;

        let triangles: Vec<[usize; 3]> = self
            .meshes
            .iter()
            .flat_map(|(range, triangles)| triangles.iter().map(move |t| t.map(|i| range.start + i)))
            .collect();

        let elems: Vec<TriangleBounds> = triangles
            .iter()
            .enumerate()
            .map(|(k, t)| {
                let bounds = swept_bounds(t.iter().flat_map(|&i| [x[i], p[i]]), search);
                TriangleBounds::new(Rectangle::from_aabb(bounds), k)
            })
            .collect();
        let rtree = RTree::bulk_load(elems);

        let mut contacts = Vec::new();
        let vertices = self.meshes.iter().flat_map(|(range, _)| range.indices());

        for i in vertices {
            let query = swept_bounds([x[i], p[i]], 0.);
            for candidate in rtree.locate_in_envelope_intersecting(&query) {
                let triangle = triangles[candidate.data];
                if !self.collides_with(i, &triangle) {
                    continue;
                }
                let [a, b, c] = triangle;
                let normal = match unit_normal(x[a], x[b], x[c]) {
                    Some(n) => n,
                    None => continue,
                };
                let bary = closest_barycentric(x[i], x[a], x[b], x[c]);
                let q = x[a] * bary.x + x[b] * bary.y + x[c] * bary.z;
                let side = if (x[i] - q).dot(&normal) < 0. { -1. } else { 1. };

                contacts.push(Contact {
                    particle: i,
                    triangle,
                    side,
                });
            }
        }
        self.contacts = contacts;
        Ok(())
    }

    fn apply(&mut self, particles: &mut ParticleVec, _dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
        for _ in 0..self.iterations {
            for contact in &self.contacts {
                self.project_contact(particles, contact);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vec3f;

    #[test]
    fn closest_point_regions() {
        let (a, b, c) = (vec3f(0., 0., 0.), vec3f(1., 0., 0.), vec3f(0., 1., 0.));
        approx::assert_relative_eq!(closest_barycentric(vec3f(0.25, 0.25, 1.), a, b, c), vec3f(0.5, 0.25, 0.25));
        approx::assert_relative_eq!(closest_barycentric(vec3f(-1., -1., 0.), a, b, c), vec3f(1., 0., 0.));
        approx::assert_relative_eq!(closest_barycentric(vec3f(0.5, -1., 0.), a, b, c), vec3f(0.5, 0.5, 0.));
    }

    #[test]
    fn shared_triangle_vertices_are_disabled() {
        let range = ParticleRange { start: 10, count: 4 };
        let collision = SelfCollisionConstraints::new(0, vec![(range, vec![[0, 1, 2]])], 0.01, 1., 0., 1).unwrap();
        assert!(collision.is_disabled(10, 10));
        assert!(collision.is_disabled(12, 10));
        assert!(!collision.is_disabled(10, 13));
    }

    #[test]
    fn particle_is_pushed_out_to_thickness() {
        // kinematic triangle plus one dynamic particle sinking through it
        let mut particles = ParticleVec::default(4);
        let tri = [vec3f(-1., -1., 0.), vec3f(2., -1., 0.), vec3f(-1., 2., 0.)];
        for k in 0..3 {
            particles.x[k] = tri[k];
            particles.p[k] = tri[k];
        }
        particles.x[3] = vec3f(0.2, 0.2, 0.05);
        particles.p[3] = vec3f(0.2, 0.2, -0.03);
        particles.inv_m[3] = 1.;

        let meshes = vec![
            (ParticleRange { start: 0, count: 3 }, vec![[0, 1, 2]]),
            (ParticleRange { start: 3, count: 1 }, Vec::new()),
        ];
        let mut collision = SelfCollisionConstraints::new(0, meshes, 0.01, 1., 0., 2).unwrap();
        let ctx = FamilyContext::new(0, None);
        collision.init(&mut particles, 0.01, &ctx).unwrap();
        assert_eq!(collision.num_contacts(), 1);

        collision.apply(&mut particles, 0.01, &ctx).unwrap();
        approx::assert_relative_eq!(particles.p[3].z, 0.01, epsilon = 1e-5);
        assert_eq!(particles.p[0], tri[0]);
    }
}
