use super::{check_local_indices, check_range, color_elements, ConstraintRule, FamilyContext};
use crate::{
    concurrency::par_for_each_index, floating_type_mod::FT, particles::ParticleRange, particles::ParticleVec,
    thread_safe_ptr::ThreadSafeMutPtr, SolverError, M3, V3,
};

const MIN_REST_VOLUME: FT = 1e-12;
const MIN_GRADIENT: FT = 1e-9;
const SVD_MAX_ITERATIONS: usize = 200;

/**
 * Rotation part of the polar decomposition `F = R S`. Reflections are removed
 * by flipping the singular direction of the smallest singular value, so the
 * result always satisfies `det R = 1`. Falls back to the identity for a
 * non-finite `f` or if the SVD does not converge.
 */
pub fn polar_rotation(f: M3) -> M3 {
    if f.iter().any(|x| !x.is_finite()) {
        return M3::identity();
    }
    let svd = match f.try_svd(true, true, FT::EPSILON, SVD_MAX_ITERATIONS) {
        Some(svd) => svd,
        None => return M3::identity(),
    };
    let (mut u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return M3::identity(),
    };

    let mut r = u * v_t;
    if r.determinant() < 0. {
        let smallest = svd.singular_values.imin();
        let mut column = u.column_mut(smallest);
        column *= -1.;
        r = u * v_t;
    }
    r
}

/** Inverse rest shape matrix and rest volume of one tetrahedron. */
#[derive(Debug, Clone, Copy)]
pub(super) struct TetRest {
    pub dm_inv: M3,
    pub volume: FT,
}

impl TetRest {
    pub fn new(x: [V3; 4]) -> Option<Self> {
        let dm = M3::from_columns(&[x[1] - x[0], x[2] - x[0], x[3] - x[0]]);
        let volume = dm.determinant().abs() / 6.;
        if volume < MIN_REST_VOLUME {
            return None;
        }
        dm.try_inverse().map(|dm_inv| TetRest { dm_inv, volume })
    }
}

/** Compliances of the deviatoric and the volume term of one element. */
#[derive(Debug, Clone, Copy)]
pub(super) struct TetCompliance {
    // `None` for a material without shear resistance (mu == 0)
    pub deviatoric: Option<FT>,
    // `None` for incompressibility off (lambda == 0)
    pub volume: Option<FT>,
}

impl TetCompliance {
    pub fn new(mu: FT, lambda: FT, rest_volume: FT, dt: FT) -> Self {
        let dt2 = dt * dt;
        TetCompliance {
            deviatoric: if mu > 0. {
                Some(1. / (2. * mu * rest_volume * dt2))
            } else {
                None
            },
            volume: if lambda > 0. {
                Some(1. / (lambda * rest_volume * dt2))
            } else {
                None
            },
        }
    }
}

fn deformation_gradient(p: &[V3; 4], rest: &TetRest) -> M3 {
    M3::from_columns(&[p[1] - p[0], p[2] - p[0], p[3] - p[0]]) * rest.dm_inv
}

/**
 * One XPBD step for a constraint with value `c` and gradient `grad_f` with
 * respect to the deformation gradient. Moves `p` in place and returns the
 * multiplier increment.
 */
fn xpbd_step(p: &mut [V3; 4], w: &[FT; 4], rest: &TetRest, c: FT, grad_f: M3, alpha: FT, lambda: FT) -> FT {
    let g = grad_f * rest.dm_inv.transpose();
    let mut grads = [V3::zeros(); 4];
    for k in 0..3 {
        grads[k + 1] = g.column(k).into_owned();
    }
    grads[0] = -(grads[1] + grads[2] + grads[3]);

    let denom: FT = (0..4).map(|k| w[k] * grads[k].norm_squared()).sum::<FT>() + alpha;
    if denom < MIN_GRADIENT {
        return 0.;
    }
    let dl = (-c - alpha * lambda) / denom;
    for k in 0..4 {
        p[k] += grads[k] * (w[k] * dl);
    }
    dl
}

/**
 * Projects one element: deviatoric term `|F - R|` first, volume term
 * `det F - 1` second. `lambdas` holds both accumulated multipliers.
 */
pub(super) fn project_tet(p: &mut [V3; 4], w: &[FT; 4], rest: &TetRest, compliance: &TetCompliance, lambdas: &mut [FT; 2]) {
    if let Some(alpha) = compliance.deviatoric {
        let f = deformation_gradient(p, rest);
        let r = polar_rotation(f);
        let diff = f - r;
        let c = diff.norm();
        if c > MIN_GRADIENT {
            lambdas[0] += xpbd_step(p, w, rest, c, diff / c, alpha, lambdas[0]);
        }
    }

    if let Some(alpha) = compliance.volume {
        let f = deformation_gradient(p, rest);
        let c = f.determinant() - 1.;
        let (f0, f1, f2) = (f.column(0), f.column(1), f.column(2));
        let cofactor = M3::from_columns(&[f1.cross(&f2), f2.cross(&f0), f0.cross(&f1)]);
        lambdas[1] += xpbd_step(p, w, rest, c, cofactor, alpha, lambdas[1]);
    }
}

/**
 * Corotated linear elasticity on the tetrahedra of one proxy, solved with
 * XPBD. Every element carries its own Lamé parameters.
 */
pub struct CorotatedConstraints {
    range: ParticleRange,
    generation: u64,
    tets: Vec<[usize; 4]>,
    rest: Vec<TetRest>,
    // (mu, lambda) per element
    lame: Vec<(FT, FT)>,
    lambdas: Vec<[FT; 2]>,
    colors: Vec<Vec<usize>>,
    iterations: usize,
}

impl CorotatedConstraints {
    pub fn new(
        range: ParticleRange,
        generation: u64,
        rest_positions: &[V3],
        tets: Vec<[usize; 4]>,
        lame: Vec<(FT, FT)>,
        iterations: usize,
    ) -> Result<Self, SolverError> {
        check_local_indices("corotated", range, tets.iter().flat_map(|t| t.iter().cloned()))?;
        if lame.len() != tets.len() {
            return Err(SolverError::MalformedRestData(format!(
                "{} material entries for {} tetrahedra",
                lame.len(),
                tets.len()
            )));
        }

        let rest = tets
            .iter()
            .enumerate()
            .map(|(e, t)| {
                TetRest::new([
                    rest_positions[t[0]],
                    rest_positions[t[1]],
                    rest_positions[t[2]],
                    rest_positions[t[3]],
                ])
                .ok_or_else(|| SolverError::MalformedRestData(format!("tetrahedron {} has no rest volume", e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let colors = color_elements(&tets);
        let lambdas = vec![[0.; 2]; tets.len()];

        Ok(CorotatedConstraints {
            range,
            generation,
            tets,
            rest,
            lame,
            lambdas,
            colors,
            iterations: iterations.max(1),
        })
    }

    pub fn num_elements(&self) -> usize {
        self.tets.len()
    }
}

impl ConstraintRule for CorotatedConstraints {
    fn name(&self) -> &'static str {
        "corotated"
    }

    fn built_generation(&self) -> u64 {
        self.generation
    }

    fn init(&mut self, _particles: &mut ParticleVec, _dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
        self.lambdas.iter_mut().for_each(|l| *l = [0.; 2]);
        Ok(())
    }

    fn apply(&mut self, particles: &mut ParticleVec, dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
        check_range(self.name(), self.range, particles)?;

        let base = self.range.start;
        let tets = &self.tets;
        let rest = &self.rest;
        let lame = &self.lame;
        let inv_m = &particles.inv_m;
        let p_ptr = ThreadSafeMutPtr::new(particles.p.as_mut_ptr());
        let lambda_ptr = ThreadSafeMutPtr::new(self.lambdas.as_mut_ptr());

        for _ in 0..self.iterations {
            for color in &self.colors {
                par_for_each_index(color, |e| {
                    let idx = tets[e].map(|i| base + i);
                    let w = idx.map(|i| inv_m[i]);
                    if w.iter().all(|&w| w == 0.) {
                        return;
                    }

                    // SAFETY: elements inside one color share no particle and own their multipliers
                    let lambdas = unsafe { lambda_ptr.get_mut(e) };
                    let mut p = idx.map(|i| unsafe { *p_ptr.get_mut(i) });

                    let (mu, lambda) = lame[e];
                    let compliance = TetCompliance::new(mu, lambda, rest[e].volume, dt);
                    project_tet(&mut p, &w, &rest[e], &compliance, lambdas);

                    for k in 0..4 {
                        unsafe {
                            *p_ptr.get_mut(idx[k]) = p[k];
                        }
                    }
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vec3f;
    use nalgebra::{Rotation3, Vector3};

    fn unit_tet() -> [V3; 4] {
        [
            vec3f(0., 0., 0.),
            vec3f(1., 0., 0.),
            vec3f(0., 1., 0.),
            vec3f(0., 0., 1.),
        ]
    }

    fn tet_particles(p: [V3; 4]) -> ParticleVec {
        let mut particles = ParticleVec::default(4);
        for k in 0..4 {
            particles.x[k] = p[k];
            particles.p[k] = p[k];
            particles.inv_m[k] = 1.;
        }
        particles
    }

    #[test]
    fn polar_rotation_recovers_rotation() {
        let rot = Rotation3::from_axis_angle(&Vector3::z_axis(), 0.7).into_inner();
        let stretch = M3::from_diagonal(&vec3f(1.5, 0.8, 1.1));
        let r = polar_rotation(rot * stretch);
        approx::assert_relative_eq!(r, rot, epsilon = 1e-4);
    }

    #[test]
    fn polar_rotation_never_reflects() {
        let reflection = M3::from_diagonal(&vec3f(1., 1., -1.));
        let r = polar_rotation(reflection);
        approx::assert_relative_eq!(r.determinant(), 1., epsilon = 1e-4);
    }

    #[test]
    fn polar_rotation_of_non_finite_gradient_is_identity() {
        assert_eq!(polar_rotation(M3::from_element(FT::NAN)), M3::identity());
        assert_eq!(polar_rotation(M3::from_element(FT::INFINITY)), M3::identity());
    }

    #[test]
    fn zero_lame_parameters_leave_the_element_untouched() {
        let rest = unit_tet();
        let mut stretched = rest;
        stretched[1] = vec3f(1.5, 0., 0.);
        let mut particles = tet_particles(stretched);
        let range = ParticleRange { start: 0, count: 4 };
        let mut family = CorotatedConstraints::new(range, 0, &rest, vec![[0, 1, 2, 3]], vec![(0., 0.)], 4).unwrap();

        family.apply(&mut particles, 0.01, &FamilyContext::new(0, None)).unwrap();

        for k in 0..4 {
            assert_eq!(particles.p[k], stretched[k]);
        }
    }

    #[test]
    fn rest_shape_is_a_fixed_point() {
        let rest = unit_tet();
        let mut particles = tet_particles(rest);
        let range = ParticleRange { start: 0, count: 4 };
        let mut family = CorotatedConstraints::new(range, 0, &rest, vec![[0, 1, 2, 3]], vec![(1000., 1000.)], 2).unwrap();

        family.apply(&mut particles, 0.01, &FamilyContext::new(0, None)).unwrap();

        for k in 0..4 {
            approx::assert_relative_eq!(particles.p[k], rest[k], epsilon = 1e-5);
        }
    }

    #[test]
    fn squashed_tet_regains_volume() {
        let rest = unit_tet();
        let mut squashed = rest;
        squashed[3] = vec3f(0., 0., 0.4);
        let mut particles = tet_particles(squashed);
        let range = ParticleRange { start: 0, count: 4 };
        let mut family = CorotatedConstraints::new(range, 0, &rest, vec![[0, 1, 2, 3]], vec![(1e6, 1e6)], 10).unwrap();

        family.apply(&mut particles, 0.01, &FamilyContext::new(0, None)).unwrap();

        let p = &particles.p;
        let volume = (p[1] - p[0]).cross(&(p[2] - p[0])).dot(&(p[3] - p[0])) / 6.;
        assert!(volume > 0.4 / 6. * 1.5, "volume {} did not recover", volume);
    }

    #[test]
    fn degenerate_rest_shape_is_rejected() {
        let flat = [
            vec3f(0., 0., 0.),
            vec3f(1., 0., 0.),
            vec3f(0., 1., 0.),
            vec3f(1., 1., 0.),
        ];
        let range = ParticleRange { start: 0, count: 4 };
        let result = CorotatedConstraints::new(range, 0, &flat, vec![[0, 1, 2, 3]], vec![(1., 1.)], 1);
        assert!(matches!(result, Err(SolverError::MalformedRestData(_))));
    }
}
