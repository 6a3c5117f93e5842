use super::{check_local_indices, check_range, color_elements, ConstraintRule, FamilyContext};
use crate::{
    concurrency::par_for_each_index, floating_type_mod::FT, particles::ParticleRange, particles::ParticleVec,
    thread_safe_ptr::ThreadSafeMutPtr, SolverError, V3,
};

const MIN_SPRING_LENGTH: FT = 1e-7;

/**
 * Distance springs between particle pairs of one proxy. Used for edge springs
 * and for bending springs across triangle pairs.
 *
 * With `xpbd` unset `stiffness` is the PBD stiffness in (0, 1]. Otherwise it is
 * a spring constant and every spring accumulates a Lagrange multiplier which is
 * reset in `init`.
 */
pub struct SpringConstraints {
    name: &'static str,
    range: ParticleRange,
    generation: u64,
    // local indices into `range`
    springs: Vec<[usize; 2]>,
    rest_lengths: Vec<FT>,
    stiffness: FT,
    xpbd: bool,
    lambdas: Vec<FT>,
    colors: Vec<Vec<usize>>,
    iterations: usize,
}

impl SpringConstraints {
    pub fn new(
        name: &'static str,
        range: ParticleRange,
        generation: u64,
        rest_positions: &[V3],
        springs: Vec<[usize; 2]>,
        stiffness: FT,
        xpbd: bool,
        iterations: usize,
    ) -> Result<Self, SolverError> {
        check_local_indices(name, range, springs.iter().flat_map(|s| s.iter().cloned()))?;
        let rest_lengths = springs
            .iter()
            .map(|&[i, j]| (rest_positions[j] - rest_positions[i]).norm())
            .collect();
        let colors = color_elements(&springs);
        let lambdas = vec![0.; springs.len()];

        Ok(SpringConstraints {
            name,
            range,
            generation,
            springs,
            rest_lengths,
            stiffness,
            xpbd,
            lambdas,
            colors,
            iterations: iterations.max(1),
        })
    }

    pub fn num_springs(&self) -> usize {
        self.springs.len()
    }
}

impl ConstraintRule for SpringConstraints {
    fn name(&self) -> &'static str {
        self.name
    }

    fn built_generation(&self) -> u64 {
        self.generation
    }

    fn init(&mut self, _particles: &mut ParticleVec, _dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
        self.lambdas.iter_mut().for_each(|l| *l = 0.);
        Ok(())
    }

    fn apply(&mut self, particles: &mut ParticleVec, dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
        check_range(self.name, self.range, particles)?;

        let stiffness = self.stiffness;
        let alpha = if self.xpbd { 1. / (stiffness * dt * dt) } else { 0. };
        // a zero spring constant has infinite compliance
        if stiffness <= 0. || !alpha.is_finite() {
            return Ok(());
        }

        let base = self.range.start;
        let springs = &self.springs;
        let rest_lengths = &self.rest_lengths;
        let xpbd = self.xpbd;
        let inv_m = &particles.inv_m;
        let p_ptr = ThreadSafeMutPtr::new(particles.p.as_mut_ptr());
        let lambda_ptr = ThreadSafeMutPtr::new(self.lambdas.as_mut_ptr());

        for _ in 0..self.iterations {
            for color in &self.colors {
                par_for_each_index(color, |s| {
                    let i = base + springs[s][0];
                    let j = base + springs[s][1];
                    let wi = inv_m[i];
                    let wj = inv_m[j];
                    let w_sum = wi + wj;
                    if w_sum == 0. {
                        return;
                    }

                    // SAFETY: springs inside one color share no particle and own their multiplier
                    let (pi, pj, lambda) = unsafe { (p_ptr.get_mut(i), p_ptr.get_mut(j), lambda_ptr.get_mut(s)) };
                    let d = *pj - *pi;
                    let len = d.norm();
                    if len < MIN_SPRING_LENGTH {
                        return;
                    }
                    let n = d / len;
                    let c = len - rest_lengths[s];

                    let dl = if xpbd {
                        let dl = (-c - alpha * *lambda) / (w_sum + alpha);
                        *lambda += dl;
                        dl
                    } else {
                        -stiffness * c / w_sum
                    };

                    *pi -= n * (wi * dl);
                    *pj += n * (wj * dl);
                });
            }
        }
        Ok(())
    }
}
