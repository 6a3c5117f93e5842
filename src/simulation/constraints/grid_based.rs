use std::collections::HashMap;

use super::{
    check_local_indices, check_range,
    corotated::{project_tet, TetCompliance, TetRest},
    ConstraintRule, FamilyContext,
};
use crate::{
    concurrency::par_iter_mut2, floating_type_mod::FT, particles::ParticleRange, particles::ParticleVec, SolverError,
    IT, V3, VI,
};

/** Tetrahedra of one proxy with their per-element Lamé parameters. */
pub struct GridMesh {
    pub range: ParticleRange,
    pub tets: Vec<[usize; 4]>,
    pub lame: Vec<(FT, FT)>,
    pub rest_positions: Vec<V3>,
}

struct GridElement {
    // global particle indices, resolved against `generation`
    particles: [usize; 4],
    rest: TetRest,
    mu: FT,
    lambda: FT,
}

/**
 * Corotated elasticity for dense volumetric bodies, solved with Jacobi
 * iterations so every element projects in parallel. Particles are binned into
 * a uniform grid of spacing `dx` at the start of each sub-step, and the
 * postprocessing pass relaxes the implied particle velocities toward the mean
 * velocity of their grid cell.
 */
pub struct GridBasedCorotatedConstraints {
    generation: u64,
    ranges: Vec<ParticleRange>,
    elements: Vec<GridElement>,
    lambdas: Vec<[FT; 2]>,
    corrections: Vec<[V3; 4]>,
    cells: HashMap<VI<3>, Vec<usize>>,
    dx: FT,
    jacobi_ratio: FT,
    velocity_smoothing: FT,
    iterations: usize,
}

impl GridBasedCorotatedConstraints {
    pub fn new(
        generation: u64,
        meshes: Vec<GridMesh>,
        dx: FT,
        jacobi_ratio: FT,
        velocity_smoothing: FT,
        iterations: usize,
    ) -> Result<Self, SolverError> {
        if dx <= 0. {
            return Err(SolverError::MalformedRestData(format!("grid spacing must be positive, got {}", dx)));
        }

        let mut elements = Vec::new();
        let mut ranges = Vec::new();
        for mesh in meshes {
            check_local_indices("grid_based", mesh.range, mesh.tets.iter().flat_map(|t| t.iter().cloned()))?;
            if mesh.lame.len() != mesh.tets.len() {
                return Err(SolverError::MalformedRestData(format!(
                    "{} material entries for {} tetrahedra",
                    mesh.lame.len(),
                    mesh.tets.len()
                )));
            }

            for (e, (t, &(mu, lambda))) in mesh.tets.iter().zip(mesh.lame.iter()).enumerate() {
                let rest = TetRest::new(t.map(|i| mesh.rest_positions[i]))
                    .ok_or_else(|| SolverError::MalformedRestData(format!("tetrahedron {} has no rest volume", e)))?;
                elements.push(GridElement {
                    particles: t.map(|i| mesh.range.start + i),
                    rest,
                    mu,
                    lambda,
                });
            }
            ranges.push(mesh.range);
        }

        let n = elements.len();
        Ok(GridBasedCorotatedConstraints {
            generation,
            ranges,
            elements,
            lambdas: vec![[0.; 2]; n],
            corrections: vec![[V3::zeros(); 4]; n],
            cells: HashMap::new(),
            dx,
            jacobi_ratio,
            velocity_smoothing,
            iterations: iterations.max(1),
        })
    }

    fn cell_of(&self, p: &V3) -> VI<3> {
        (p / self.dx).map(|c| c.floor() as IT)
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }
}

impl ConstraintRule for GridBasedCorotatedConstraints {
    fn name(&self) -> &'static str {
        "grid_based"
    }

    fn built_generation(&self) -> u64 {
        self.generation
    }

    fn init(&mut self, particles: &mut ParticleVec, _dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
        for range in &self.ranges {
            check_range(self.name(), *range, particles)?;
        }

        let mut cells: HashMap<VI<3>, Vec<usize>> = HashMap::new();
        for range in &self.ranges {
            for i in range.indices() {
                cells.entry(self.cell_of(&particles.p[i])).or_default().push(i);
            }
        }
        self.cells = cells;
        self.lambdas.iter_mut().for_each(|l| *l = [0.; 2]);
        Ok(())
    }

    fn apply(&mut self, particles: &mut ParticleVec, dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
        for range in &self.ranges {
            check_range(self.name(), *range, particles)?;
        }

        let mut counts = vec![0usize; particles.len()];
        for element in &self.elements {
            for &i in &element.particles {
                counts[i] += 1;
            }
        }

        for _ in 0..self.iterations {
            let elements = &self.elements;
            let p = &particles.p;
            let inv_m = &particles.inv_m;

            par_iter_mut2(&mut self.corrections, &mut self.lambdas, |e, correction, lambdas| {
                let element = &elements[e];
                let w = element.particles.map(|i| inv_m[i]);
                let start = element.particles.map(|i| p[i]);
                let mut projected = start;
                if w.iter().any(|&w| w > 0.) {
                    let compliance = TetCompliance::new(element.mu, element.lambda, element.rest.volume, dt);
                    project_tet(&mut projected, &w, &element.rest, &compliance, lambdas);
                }
                for k in 0..4 {
                    correction[k] = projected[k] - start[k];
                }
            });

            let mut delta = vec![V3::zeros(); particles.len()];
            for (element, correction) in self.elements.iter().zip(self.corrections.iter()) {
                for k in 0..4 {
                    delta[element.particles[k]] += correction[k];
                }
            }
            for (i, d) in delta.iter().enumerate() {
                if counts[i] > 0 {
                    particles.p[i] += d * (self.jacobi_ratio / counts[i] as FT);
                }
            }
        }
        Ok(())
    }

    fn postprocess(&mut self, particles: &mut ParticleVec, dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
        if self.velocity_smoothing <= 0. || dt <= 0. {
            return Ok(());
        }

        for members in self.cells.values() {
            let mut momentum = V3::zeros();
            let mut mass = 0.;
            for &i in members {
                momentum += (particles.p[i] - particles.x[i]) / dt * particles.m[i];
                mass += particles.m[i];
            }
            if mass <= 0. {
                continue;
            }
            let cell_velocity = momentum / mass;

            for &i in members {
                if particles.is_kinematic(i) {
                    continue;
                }
                let v = (particles.p[i] - particles.x[i]) / dt;
                let smoothed = v * (1. - self.velocity_smoothing) + cell_velocity * self.velocity_smoothing;
                particles.p[i] = particles.x[i] + smoothed * dt;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vec3f;

    fn unit_tet() -> Vec<V3> {
        vec![
            vec3f(0., 0., 0.),
            vec3f(1., 0., 0.),
            vec3f(0., 1., 0.),
            vec3f(0., 0., 1.),
        ]
    }

    fn grid_family(smoothing: FT) -> GridBasedCorotatedConstraints {
        let mesh = GridMesh {
            range: ParticleRange { start: 0, count: 4 },
            tets: vec![[0, 1, 2, 3]],
            lame: vec![(1e5, 1e5)],
            rest_positions: unit_tet(),
        };
        GridBasedCorotatedConstraints::new(0, vec![mesh], 10., 1., smoothing, 5).unwrap()
    }

    fn particles_at(positions: &[V3]) -> ParticleVec {
        let mut particles = ParticleVec::default(positions.len());
        for (i, p) in positions.iter().enumerate() {
            particles.x[i] = *p;
            particles.p[i] = *p;
            particles.m[i] = 1.;
            particles.inv_m[i] = 1.;
        }
        particles
    }

    #[test]
    fn stretched_tet_contracts() {
        let mut family = grid_family(0.);
        let mut stretched = unit_tet();
        stretched[1] = vec3f(2., 0., 0.);
        let mut particles = particles_at(&stretched);
        let ctx = FamilyContext::new(0, None);

        family.init(&mut particles, 0.01, &ctx).unwrap();
        family.apply(&mut particles, 0.01, &ctx).unwrap();

        let edge = (particles.p[1] - particles.p[0]).norm();
        assert!(edge < 1.9, "edge length {} did not contract", edge);
    }

    #[test]
    fn postprocess_blends_toward_cell_velocity() {
        let mut family = grid_family(1.);
        let mut particles = particles_at(&unit_tet());
        particles.p[0] = particles.x[0] + vec3f(0., 0., 0.4);
        let ctx = FamilyContext::new(0, None);

        family.init(&mut particles, 0.1, &ctx).unwrap();
        assert_eq!(family.num_cells(), 1);
        family.postprocess(&mut particles, 0.1, &ctx).unwrap();

        for i in 0..4 {
            approx::assert_relative_eq!(particles.p[i] - particles.x[i], vec3f(0., 0., 0.1), epsilon = 1e-5);
        }
    }

    #[test]
    fn non_positive_spacing_is_rejected() {
        let result = GridBasedCorotatedConstraints::new(0, Vec::new(), 0., 1., 0., 1);
        assert!(matches!(result, Err(SolverError::MalformedRestData(_))));
    }
}
