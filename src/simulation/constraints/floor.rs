use super::{ConstraintRule, FamilyContext};
use crate::{concurrency::par_iter_mut2, floating_type_mod::FT, particles::ParticleVec, SolverError};

/** Keeps every dynamic particle above the plane `z = height`. */
pub struct FloorConstraint {
    generation: u64,
    height: FT,
}

impl FloorConstraint {
    pub fn new(generation: u64, height: FT) -> Self {
        FloorConstraint { generation, height }
    }
}

impl ConstraintRule for FloorConstraint {
    fn name(&self) -> &'static str {
        "floor"
    }

    fn built_generation(&self) -> u64 {
        self.generation
    }

    fn apply(&mut self, particles: &mut ParticleVec, _dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
        let height = self.height;
        par_iter_mut2(&mut particles.p, &mut particles.inv_m, |_, p, inv_m| {
            if *inv_m > 0. && p.z < height {
                p.z = height;
            }
        });
        Ok(())
    }
}
