use crate::{
    floating_type_mod::FT, package::InputPackage, particles::ParticleRange, particles::ParticleVec, SolverError,
};

mod coloring;
mod corotated;
mod floor;
mod grid_based;
mod self_collision;
mod springs;
mod weak;

use enum_dispatch::enum_dispatch;
pub use coloring::color_elements;
pub use corotated::{polar_rotation, CorotatedConstraints};
pub use floor::FloorConstraint;
pub use grid_based::{GridBasedCorotatedConstraints, GridMesh};
pub use self_collision::SelfCollisionConstraints;
pub use springs::SpringConstraints;
pub use weak::WeakConstraints;

/** What a family may read besides particle memory. */
pub struct FamilyContext<'a> {
    pub generation: u64,
    pub input: Option<&'a InputPackage>,
}

impl<'a> FamilyContext<'a> {
    pub fn new(generation: u64, input: Option<&'a InputPackage>) -> Self {
        FamilyContext { generation, input }
    }
}

/**
 * One constraint family instance. `init` runs once per sub-step before any
 * `apply`, `postprocess` once after the last `apply` of a sub-step. A family is
 * only invoked for the phases it was registered for.
 */
#[enum_dispatch]
#[allow(unused_variables)]
pub trait ConstraintRule {
    fn name(&self) -> &'static str;

    /** Particle store generation the family's indices were resolved against. */
    fn built_generation(&self) -> u64;

    fn init(&mut self, particles: &mut ParticleVec, dt: FT, ctx: &FamilyContext) -> Result<(), SolverError> {
        Ok(())
    }

    fn apply(&mut self, particles: &mut ParticleVec, dt: FT, ctx: &FamilyContext) -> Result<(), SolverError>;

    fn postprocess(&mut self, particles: &mut ParticleVec, dt: FT, ctx: &FamilyContext) -> Result<(), SolverError> {
        Ok(())
    }
}

/**
 * Rule supplied from outside the crate, for families that are not built in
 * (backstops, animation drives, ...). It is invoked in registration order like
 * every other family.
 */
pub struct ExternalConstraint {
    rule: Box<dyn ConstraintRule + Send>,
}

impl ExternalConstraint {
    pub fn new(rule: impl ConstraintRule + Send + 'static) -> Self {
        ExternalConstraint { rule: Box::new(rule) }
    }
}

impl ConstraintRule for ExternalConstraint {
    fn name(&self) -> &'static str {
        self.rule.name()
    }

    fn built_generation(&self) -> u64 {
        self.rule.built_generation()
    }

    fn init(&mut self, particles: &mut ParticleVec, dt: FT, ctx: &FamilyContext) -> Result<(), SolverError> {
        self.rule.init(particles, dt, ctx)
    }

    fn apply(&mut self, particles: &mut ParticleVec, dt: FT, ctx: &FamilyContext) -> Result<(), SolverError> {
        self.rule.apply(particles, dt, ctx)
    }

    fn postprocess(&mut self, particles: &mut ParticleVec, dt: FT, ctx: &FamilyContext) -> Result<(), SolverError> {
        self.rule.postprocess(particles, dt, ctx)
    }
}

#[enum_dispatch(ConstraintRule)]
pub enum ConstraintFamily {
    SpringConstraints(SpringConstraints),
    CorotatedConstraints(CorotatedConstraints),
    WeakConstraints(WeakConstraints),
    SelfCollisionConstraints(SelfCollisionConstraints),
    GridBasedCorotatedConstraints(GridBasedCorotatedConstraints),
    FloorConstraint(FloorConstraint),
    ExternalConstraint(ExternalConstraint),
}

/** Fails unless every local index fits into `range`. */
pub fn check_local_indices(
    family: &'static str,
    range: ParticleRange,
    indices: impl IntoIterator<Item = usize>,
) -> Result<(), SolverError> {
    for index in indices {
        if index >= range.count {
            return Err(SolverError::IndexOutOfRange {
                family,
                index,
                count: range.count,
            });
        }
    }
    Ok(())
}

/** Fails if `range` no longer lies inside the particle arrays. */
pub fn check_range(family: &'static str, range: ParticleRange, particles: &ParticleVec) -> Result<(), SolverError> {
    if range.end() > particles.len() {
        return Err(SolverError::IndexOutOfRange {
            family,
            index: range.end() - 1,
            count: particles.len(),
        });
    }
    Ok(())
}
