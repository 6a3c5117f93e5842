use std::sync::{Arc, Mutex};

use deformable_solver::{
    floating_type_mod::FT, particles::ParticleVec, proxy::ActiveProxy, ConstraintFamily, ConstraintRule,
    DeformableSolver, ExternalConstraint, FamilyContext, ParticleStore, Phase, Proxy, RestCollection, SolverError,
    SolverParams, Transform,
};

type Log = Arc<Mutex<Vec<String>>>;

struct Recorder {
    name: &'static str,
    generation: u64,
    log: Log,
}

impl Recorder {
    fn record(&self, phase: &str) {
        self.log.lock().unwrap().push(format!("{} {}", phase, self.name));
    }
}

impl ConstraintRule for Recorder {
    fn name(&self) -> &'static str {
        self.name
    }

    fn built_generation(&self) -> u64 {
        self.generation
    }

    fn init(&mut self, _particles: &mut ParticleVec, _dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
        self.record("init");
        Ok(())
    }

    fn apply(&mut self, _particles: &mut ParticleVec, _dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
        self.record("apply");
        Ok(())
    }

    fn postprocess(&mut self, _particles: &mut ParticleVec, _dt: FT, _ctx: &FamilyContext) -> Result<(), SolverError> {
        self.record("post");
        Ok(())
    }
}

fn bare_params() -> SolverParams {
    SolverParams {
        num_solver_sub_steps: 1,
        enable_edge_springs: false,
        enable_bending_springs: false,
        enable_corotated_constraints: false,
        ..Default::default()
    }
}

fn solver_with_recorders(log: &Log, stale: bool) -> DeformableSolver {
    let mut solver = DeformableSolver::new(bare_params());
    let log = log.clone();
    solver.add_constraint_builder(Box::new(
        move |_active: &ActiveProxy, store: &ParticleStore| -> Result<Vec<ConstraintFamily>, SolverError> {
            let generation = if stale { store.generation() + 1 } else { store.generation() };
            Ok(["f1", "f2", "f3"]
                .iter()
                .map(|&name| {
                    ExternalConstraint::new(Recorder {
                        name,
                        generation,
                        log: log.clone(),
                    })
                    .into()
                })
                .collect())
        },
    ));
    solver.handle().add_proxy(Proxy::new(
        Arc::new(RestCollection::cloth_grid(2, 2, 0.1)),
        Transform::identity(),
    ));
    solver
}

fn drain(log: &Log) -> Vec<String> {
    std::mem::take(&mut *log.lock().unwrap())
}

#[test]
fn builder_families_run_in_registration_order() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut solver = solver_with_recorders(&log, false);

    solver.simulate(1. / 60.).unwrap();

    assert_eq!(
        drain(&log),
        vec![
            "init f1", "init f2", "init f3", "apply f1", "apply f2", "apply f3", "post f1", "post f2", "post f3"
        ]
    );
}

#[test]
fn disabled_slot_is_skipped_until_enabled_again() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut solver = solver_with_recorders(&log, false);
    solver.simulate(1. / 60.).unwrap();
    drain(&log);

    let f2 = solver
        .registry()
        .slots(Phase::Apply)
        .into_iter()
        .find(|(_, name, _)| *name == "f2")
        .map(|(slot, _, _)| slot)
        .unwrap();

    assert!(solver.registry_mut().set_enabled(f2, false));
    solver.simulate(1. / 60.).unwrap();
    let applies: Vec<String> = drain(&log).into_iter().filter(|e| e.starts_with("apply")).collect();
    assert_eq!(applies, vec!["apply f1", "apply f3"]);

    assert!(solver.registry_mut().set_enabled(f2, true));
    solver.simulate(1. / 60.).unwrap();
    let applies: Vec<String> = drain(&log).into_iter().filter(|e| e.starts_with("apply")).collect();
    assert_eq!(applies, vec!["apply f1", "apply f2", "apply f3"]);
}

#[test]
fn stale_family_disables_the_solver() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut solver = solver_with_recorders(&log, true);
    let handle = solver.handle();

    let result = solver.simulate(1. / 60.);

    assert!(matches!(result, Err(SolverError::StaleParticleRange { family: "f1", .. })));
    assert!(!handle.is_enabled());
    assert!(handle.pull_output_package().is_none());
    assert!(drain(&log).is_empty());

    // a disabled solver leaves everything untouched
    solver.simulate(1. / 60.).unwrap();
    assert!(handle.pull_output_package().is_none());
}
