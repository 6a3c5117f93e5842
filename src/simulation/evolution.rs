use crate::{
    concurrency::par_iter_mut2,
    constraint_registry::ConstraintRegistry,
    constraints::FamilyContext,
    floating_type_mod::FT,
    instrumentation::{PerformanceCounters, ValueCounters},
    kinematics::kinematic_update,
    package::InputHistory,
    particles::{ParticleStore, ParticleVec},
    proxy::ActiveProxy,
    solver_parameters::SolverParams,
    SolverError, V3,
};

/** Sub-steps shorter than this are treated as a zero time step. */
pub const MIN_SUB_STEP: FT = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvolutionState {
    Idle,
    ReclaimRemoved,
    MaterializeAdded,
    SubStep(usize),
    Finalize,
}

/** Explicit prediction of every particle. Kinematic particles extrapolate until they are pinned. */
pub fn predict(particles: &mut ParticleVec, dt: FT, gravity: V3) {
    let x = &particles.x;
    let inv_m = &particles.inv_m;
    let damping = &particles.damping;
    let gravity_scale = &particles.gravity_scale;

    par_iter_mut2(&mut particles.p, &mut particles.v, |i, p, v| {
        if inv_m[i] > 0. {
            *v += gravity * (gravity_scale[i] * dt);
            *v *= (1. - damping[i] * dt).max(0.);
        }
        *p = x[i] + *v * dt;
    });
}

/** Derives velocities from the projected positions and commits them. */
pub fn commit(particles: &mut ParticleVec, dt: FT, quasistatic: bool) {
    let p = &particles.p;
    par_iter_mut2(&mut particles.x, &mut particles.v, |i, x, v| {
        *v = if quasistatic { V3::zeros() } else { (p[i] - *x) / dt };
        *x = p[i];
    });
}

/** Discards every projection of the running sub-step. */
pub fn roll_back(particles: &mut ParticleVec) {
    let x = &particles.x;
    particles.p.iter_mut().zip(x.iter()).for_each(|(p, x)| *p = *x);
}

/**
 * Time integration of the particle store. Keeps the frame and time counters
 * and the solver's instrumentation.
 */
pub struct Evolution {
    state: EvolutionState,
    frame: u64,
    time: FT,
    pub pcounters: PerformanceCounters,
    pub vcounters: ValueCounters,
}

impl Evolution {
    pub fn new(counters_enabled: bool) -> Self {
        Evolution {
            state: EvolutionState::Idle,
            frame: 0,
            time: 0.,
            pcounters: PerformanceCounters::new(counters_enabled),
            vcounters: ValueCounters::new(counters_enabled),
        }
    }

    pub fn state(&self) -> EvolutionState {
        self.state
    }

    pub fn set_state(&mut self, state: EvolutionState) {
        log::trace!("evolution {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn time(&self) -> FT {
        self.time
    }

    pub fn reset(&mut self, counters_enabled: bool) {
        *self = Evolution::new(counters_enabled);
    }

    /** Length and number of the sub-steps `dt` is split into. */
    pub fn sub_steps(dt: FT, params: &SolverParams) -> (FT, usize) {
        let n = params.sub_steps();
        let dt = if params.fix_time_step { params.time_step_size } else { dt };
        (dt / n as FT, n)
    }

    /**
     * Runs every sub-step of one `simulate` call. Returns the number of
     * sub-steps taken, zero for a degenerate time step. On error the failing
     * sub-step is rolled back and the state returns to `Idle`.
     */
    pub fn advance_dt(
        &mut self,
        dt: FT,
        store: &mut ParticleStore,
        registry: &mut ConstraintRegistry,
        proxies: &[ActiveProxy],
        inputs: &InputHistory,
        params: &SolverParams,
    ) -> Result<usize, SolverError> {
        let (sub_dt, n) = Self::sub_steps(dt, params);
        let requested = dt / n as FT;
        if requested.is_nan() || requested < MIN_SUB_STEP || sub_dt.is_nan() || sub_dt < MIN_SUB_STEP {
            log::debug!("skipping integration for degenerate time step {}", dt);
            return Ok(0);
        }

        self.vcounters.add_value("particle-count", store.len() as FT);
        self.vcounters.add_value("constraint-families", registry.num_families() as FT);

        for i in 0..n {
            self.set_state(EvolutionState::SubStep(i));
            self.pcounters.begin("sub-step");
            let result = self.sub_step(i, n, sub_dt, store, registry, proxies, inputs, params);
            self.pcounters.end("sub-step");

            if let Err(err) = result {
                roll_back(&mut store.particles);
                self.set_state(EvolutionState::Idle);
                return Err(err);
            }
            self.time += sub_dt;
        }
        self.frame += 1;
        Ok(n)
    }

    #[allow(clippy::too_many_arguments)]
    fn sub_step(
        &mut self,
        i: usize,
        n: usize,
        dt: FT,
        store: &mut ParticleStore,
        registry: &mut ConstraintRegistry,
        proxies: &[ActiveProxy],
        inputs: &InputHistory,
        params: &SolverParams,
    ) -> Result<(), SolverError> {
        let ctx = FamilyContext::new(store.generation(), inputs.current());
        let particles = &mut store.particles;

        predict(particles, dt, params.gravity_vector());

        self.pcounters.begin("constraint-inits");
        registry.run_inits(particles, dt, &ctx)?;
        self.pcounters.end("constraint-inits");

        if params.enable_kinematics {
            // the last sub-step lands exactly on the current drive buffer
            let ratio = (i + 1) as FT / n as FT;
            kinematic_update(particles, proxies, inputs, ratio);
        }

        self.pcounters.begin("constraint-apply");
        registry.run_apply(particles, dt, &ctx)?;
        registry.run_postprocessing(particles, dt, &ctx)?;
        self.pcounters.end("constraint-apply");

        commit(particles, dt, params.do_quasistatics);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vec3f;

    #[test]
    fn prediction_skips_gravity_for_kinematic_particles() {
        let mut particles = ParticleVec::default(2);
        particles.inv_m[0] = 1.;

        predict(&mut particles, 0.5, vec3f(0., 0., -10.));

        assert_eq!(particles.v[0], vec3f(0., 0., -5.));
        assert_eq!(particles.p[0], vec3f(0., 0., -2.5));
        assert_eq!(particles.p[1], V3::zeros());
    }

    #[test]
    fn damping_never_reverses_velocity() {
        let mut particles = ParticleVec::default(1);
        particles.inv_m[0] = 1.;
        particles.v[0] = vec3f(1., 0., 0.);
        particles.damping[0] = 100.;

        predict(&mut particles, 0.1, V3::zeros());

        assert_eq!(particles.v[0], V3::zeros());
    }

    #[test]
    fn commit_derives_velocity() {
        let mut particles = ParticleVec::default(1);
        particles.p[0] = vec3f(0., 1., 0.);

        commit(&mut particles, 0.5, false);
        assert_eq!(particles.v[0], vec3f(0., 2., 0.));
        assert_eq!(particles.x[0], vec3f(0., 1., 0.));

        particles.p[0] = vec3f(0., 2., 0.);
        commit(&mut particles, 0.5, true);
        assert_eq!(particles.v[0], V3::zeros());
    }

    #[test]
    fn fixed_time_step_overrides_dt() {
        let params = SolverParams {
            fix_time_step: true,
            time_step_size: 0.1,
            num_solver_sub_steps: 4,
            ..Default::default()
        };
        let (sub_dt, n) = Evolution::sub_steps(1.0, &params);
        assert_eq!(n, 4);
        approx::assert_relative_eq!(sub_dt, 0.025);
    }

    #[test]
    fn zero_dt_takes_no_sub_step() {
        let mut evolution = Evolution::new(false);
        let mut store = ParticleStore::new();
        store.add_range(3).unwrap();
        let taken = evolution
            .advance_dt(
                0.,
                &mut store,
                &mut ConstraintRegistry::new(),
                &[],
                &InputHistory::default(),
                &SolverParams::default(),
            )
            .unwrap();
        assert_eq!(taken, 0);
        assert_eq!(evolution.frame(), 0);
    }
}
