use crate::{
    constraints::{ConstraintFamily, ConstraintRule, FamilyContext},
    floating_type_mod::FT,
    particles::ParticleVec,
    SolverError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Init,
    Apply,
    Postprocessing,
}

/** Stable slot address. Valid until the next `clear`. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub phase: Phase,
    pub index: usize,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    family: usize,
    enabled: bool,
}

/**
 * Owns every constraint family instance and three append-only, ordered slot
 * sequences referring to them: inits, applies and postprocessings. Slots run in
 * registration order; disabling a slot only skips it.
 */
#[derive(Default)]
pub struct ConstraintRegistry {
    families: Vec<ConstraintFamily>,
    inits: Vec<Slot>,
    applies: Vec<Slot>,
    postprocessings: Vec<Slot>,
}

impl ConstraintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_families(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /** Stores a family without registering any slot for it yet. Returns its arena index. */
    pub fn add_family(&mut self, family: ConstraintFamily) -> usize {
        self.families.push(family);
        self.families.len() - 1
    }

    fn slots_mut(&mut self, phase: Phase) -> &mut Vec<Slot> {
        match phase {
            Phase::Init => &mut self.inits,
            Phase::Apply => &mut self.applies,
            Phase::Postprocessing => &mut self.postprocessings,
        }
    }

    fn slot_list(&self, phase: Phase) -> &[Slot] {
        match phase {
            Phase::Init => &self.inits,
            Phase::Apply => &self.applies,
            Phase::Postprocessing => &self.postprocessings,
        }
    }

    fn push_slot(&mut self, phase: Phase, family: usize) -> SlotId {
        let slots = self.slots_mut(phase);
        slots.push(Slot { family, enabled: true });
        SlotId {
            phase,
            index: slots.len() - 1,
        }
    }

    pub fn register_init(&mut self, family: usize) -> SlotId {
        self.push_slot(Phase::Init, family)
    }

    pub fn register_apply(&mut self, family: usize) -> SlotId {
        self.push_slot(Phase::Apply, family)
    }

    pub fn register_postprocessing(&mut self, family: usize) -> SlotId {
        self.push_slot(Phase::Postprocessing, family)
    }

    /** Adds `family` and registers one slot per listed phase, in the given order. */
    pub fn register(&mut self, family: ConstraintFamily, phases: &[Phase]) -> Vec<SlotId> {
        let family = self.add_family(family);
        phases.iter().map(|&phase| self.push_slot(phase, family)).collect()
    }

    /**
     * Registers init, apply and postprocessing slots for a family. Families
     * without work in a phase rely on the trait's no-op default there.
     */
    pub fn register_family(&mut self, family: ConstraintFamily) -> Vec<SlotId> {
        self.register(family, &[Phase::Init, Phase::Apply, Phase::Postprocessing])
    }

    /** Returns false for an unknown slot. */
    pub fn set_enabled(&mut self, slot: SlotId, enabled: bool) -> bool {
        match self.slots_mut(slot.phase).get_mut(slot.index) {
            Some(s) => {
                s.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, slot: SlotId) -> Option<bool> {
        self.slot_list(slot.phase).get(slot.index).map(|s| s.enabled)
    }

    /** `(slot, family name, enabled)` in execution order. */
    pub fn slots(&self, phase: Phase) -> Vec<(SlotId, &'static str, bool)> {
        self.slot_list(phase)
            .iter()
            .enumerate()
            .map(|(index, s)| (SlotId { phase, index }, self.families[s.family].name(), s.enabled))
            .collect()
    }

    fn run(&mut self, phase: Phase, particles: &mut ParticleVec, dt: FT, ctx: &FamilyContext) -> Result<(), SolverError> {
        let slots = match phase {
            Phase::Init => &self.inits,
            Phase::Apply => &self.applies,
            Phase::Postprocessing => &self.postprocessings,
        };
        let families = &mut self.families;

        for slot in slots.iter().filter(|s| s.enabled) {
            let family = &mut families[slot.family];
            let built = family.built_generation();
            if built != ctx.generation {
                return Err(SolverError::StaleParticleRange {
                    family: family.name(),
                    built,
                    current: ctx.generation,
                });
            }
            match phase {
                Phase::Init => family.init(particles, dt, ctx)?,
                Phase::Apply => family.apply(particles, dt, ctx)?,
                Phase::Postprocessing => family.postprocess(particles, dt, ctx)?,
            }
            if phase != Phase::Init && !particles.p.iter().all(|p| p.iter().all(|c| c.is_finite())) {
                return Err(SolverError::NonFinite { family: family.name() });
            }
        }
        Ok(())
    }

    pub fn run_inits(&mut self, particles: &mut ParticleVec, dt: FT, ctx: &FamilyContext) -> Result<(), SolverError> {
        self.run(Phase::Init, particles, dt, ctx)
    }

    pub fn run_apply(&mut self, particles: &mut ParticleVec, dt: FT, ctx: &FamilyContext) -> Result<(), SolverError> {
        self.run(Phase::Apply, particles, dt, ctx)
    }

    pub fn run_postprocessing(
        &mut self,
        particles: &mut ParticleVec,
        dt: FT,
        ctx: &FamilyContext,
    ) -> Result<(), SolverError> {
        self.run(Phase::Postprocessing, particles, dt, ctx)
    }

    pub fn clear(&mut self) {
        self.families.clear();
        self.inits.clear();
        self.applies.clear();
        self.postprocessings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::{ExternalConstraint, FloorConstraint};
    use std::sync::{Arc, Mutex};

    struct Recorder {
        name: &'static str,
        generation: u64,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ConstraintRule for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn built_generation(&self) -> u64 {
            self.generation
        }

        fn init(&mut self, _particles: &mut ParticleVec, _dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
            self.log.lock().unwrap().push(format!("init {}", self.name));
            Ok(())
        }

        fn apply(&mut self, _particles: &mut ParticleVec, _dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
            self.log.lock().unwrap().push(format!("apply {}", self.name));
            Ok(())
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> ConstraintFamily {
        ExternalConstraint::new(Recorder {
            name,
            generation: 0,
            log: log.clone(),
        })
        .into()
    }

    #[test]
    fn disabled_slots_are_skipped_in_place() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ConstraintRegistry::new();
        registry.register(recorder("a", &log), &[Phase::Apply]);
        let b = registry.register(recorder("b", &log), &[Phase::Apply])[0];
        registry.register(recorder("c", &log), &[Phase::Apply]);

        let mut particles = ParticleVec::default(0);
        let ctx = FamilyContext::new(0, None);
        registry.set_enabled(b, false);
        registry.run_apply(&mut particles, 0.1, &ctx).unwrap();
        registry.set_enabled(b, true);
        registry.run_apply(&mut particles, 0.1, &ctx).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["apply a", "apply c", "apply a", "apply b", "apply c"]);
        assert_eq!(registry.is_enabled(b), Some(true));
    }

    #[test]
    fn phases_only_run_registered_slots() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ConstraintRegistry::new();
        registry.register(recorder("a", &log), &[Phase::Apply]);
        registry.register(recorder("b", &log), &[Phase::Init, Phase::Apply]);

        let mut particles = ParticleVec::default(0);
        let ctx = FamilyContext::new(0, None);
        registry.run_inits(&mut particles, 0.1, &ctx).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["init b"]);
    }

    #[test]
    fn stale_family_is_fatal() {
        let mut registry = ConstraintRegistry::new();
        registry.register(FloorConstraint::new(3, 0.).into(), &[Phase::Apply]);

        let mut particles = ParticleVec::default(1);
        let result = registry.run_apply(&mut particles, 0.1, &FamilyContext::new(4, None));
        assert_eq!(
            result,
            Err(SolverError::StaleParticleRange {
                family: "floor",
                built: 3,
                current: 4
            })
        );
    }

    #[test]
    fn unknown_slot_cannot_be_toggled() {
        let mut registry = ConstraintRegistry::new();
        assert!(!registry.set_enabled(SlotId { phase: Phase::Init, index: 0 }, false));
        assert_eq!(registry.is_enabled(SlotId { phase: Phase::Init, index: 0 }), None);
    }
}
