use super::{check_local_indices, check_range, ConstraintRule, FamilyContext};
use crate::{
    floating_type_mod::FT, particles::ParticleRange, particles::ParticleVec, proxy::ProxyId, rest_collection::PositionTarget,
    SolverError, V3,
};

const MIN_DISTANCE: FT = 1e-9;

struct WeakTarget {
    sources: Vec<(usize, FT)>,
    targets: Vec<(usize, FT)>,
    goal: Option<V3>,
    compliance: FT,
    lambda: FT,
}

impl WeakTarget {
    fn weighted_sum(p: &[V3], base: usize, entries: &[(usize, FT)]) -> V3 {
        entries.iter().fold(V3::zeros(), |acc, &(i, w)| acc + p[base + i] * w)
    }

    fn inverse_mass_sum(inv_m: &[FT], base: usize, entries: &[(usize, FT)]) -> FT {
        entries.iter().map(|&(i, w)| inv_m[base + i] * w * w).sum()
    }
}

/**
 * Soft position targets of one proxy. Each target pulls the weighted sum of its
 * source particles toward the weighted sum of its target particles, or toward a
 * world space goal when it has no target particles. Goals are refreshed from the
 * proxy's input buffer at the start of every sub-step.
 */
pub struct WeakConstraints {
    owner: ProxyId,
    range: ParticleRange,
    generation: u64,
    constraints: Vec<WeakTarget>,
    stiffness_multiplier: FT,
}

impl WeakConstraints {
    pub fn new(
        owner: ProxyId,
        range: ParticleRange,
        generation: u64,
        targets: &[PositionTarget],
        stiffness_multiplier: FT,
    ) -> Result<Self, SolverError> {
        let mut constraints = Vec::with_capacity(targets.len());
        for (k, target) in targets.iter().enumerate() {
            check_local_indices(
                "weak",
                range,
                target.source_indices.iter().chain(target.target_indices.iter()).cloned(),
            )?;
            if target.source_indices.len() != target.source_weights.len()
                || target.target_indices.len() != target.target_weights.len()
            {
                return Err(SolverError::MalformedRestData(format!(
                    "position target {} has mismatching index and weight counts",
                    k
                )));
            }
            if target.target_indices.is_empty() && target.target_position.is_none() {
                log::debug!("position target {} of {} has no goal yet", k, owner);
            }

            constraints.push(WeakTarget {
                sources: target.source_indices.iter().cloned().zip(target.source_weights.iter().cloned()).collect(),
                targets: target.target_indices.iter().cloned().zip(target.target_weights.iter().cloned()).collect(),
                goal: target.target_position,
                compliance: target.stiffness,
                lambda: 0.,
            });
        }

        Ok(WeakConstraints {
            owner,
            range,
            generation,
            constraints,
            stiffness_multiplier,
        })
    }

    pub fn goal(&self, target: usize) -> Option<V3> {
        self.constraints.get(target).and_then(|c| c.goal)
    }
}

impl ConstraintRule for WeakConstraints {
    fn name(&self) -> &'static str {
        "weak"
    }

    fn built_generation(&self) -> u64 {
        self.generation
    }

    fn init(&mut self, _particles: &mut ParticleVec, _dt: FT, ctx: &FamilyContext) -> Result<(), SolverError> {
        let goals = ctx
            .input
            .and_then(|package| package.objects.get(&self.owner))
            .map(|buffer| buffer.position_targets.as_slice())
            .unwrap_or(&[]);

        for (k, constraint) in self.constraints.iter_mut().enumerate() {
            constraint.lambda = 0.;
            if constraint.targets.is_empty() {
                if let Some(Some(goal)) = goals.get(k) {
                    constraint.goal = Some(*goal);
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, particles: &mut ParticleVec, dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
        check_range(self.name(), self.range, particles)?;

        let base = self.range.start;
        for constraint in self.constraints.iter_mut() {
            let stiffness = constraint.compliance * self.stiffness_multiplier;
            let alpha = 1. / (stiffness * dt * dt);
            if stiffness <= 0. || !alpha.is_finite() {
                continue;
            }

            let source = WeakTarget::weighted_sum(&particles.p, base, &constraint.sources);
            let (target, w_target) = if constraint.targets.is_empty() {
                match constraint.goal {
                    Some(goal) => (goal, 0.),
                    None => continue,
                }
            } else {
                (
                    WeakTarget::weighted_sum(&particles.p, base, &constraint.targets),
                    WeakTarget::inverse_mass_sum(&particles.inv_m, base, &constraint.targets),
                )
            };
            let w_source = WeakTarget::inverse_mass_sum(&particles.inv_m, base, &constraint.sources);

            let d = target - source;
            let c = d.norm();
            if c < MIN_DISTANCE || w_source + w_target == 0. {
                continue;
            }
            let n = d / c;
            let dl = (c - alpha * constraint.lambda) / (w_source + w_target + alpha);
            constraint.lambda += dl;

            for &(i, w) in &constraint.sources {
                let i = base + i;
                particles.p[i] += n * (particles.inv_m[i] * w * dl);
            }
            for &(j, w) in &constraint.targets {
                let j = base + j;
                particles.p[j] -= n * (particles.inv_m[j] * w * dl);
            }
        }
        Ok(())
    }
}
