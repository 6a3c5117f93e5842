use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    constraint_registry::ConstraintRegistry,
    evolution::{Evolution, EvolutionState},
    floating_type_mod::FT,
    instrumentation::write_statistics,
    package::{InputHistory, InputPackage, InputSlot, OutputPackage, OutputQueue},
    particles::ParticleStore,
    proxy::{ActiveProxy, Proxy, ProxyId},
    proxy_manager::{ConstraintBuilder, LifecycleQueues, ProxyManager},
    solver_parameters::SolverParams,
    SolverError,
};

/** Callback receiving the `dt` of the running `simulate` call. */
pub type SolverHook = Box<dyn FnMut(FT) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct SharedState {
    lifecycle: LifecycleQueues,
    package_input: Mutex<InputSlot>,
    package_output: Mutex<OutputQueue>,
    enabled: Mutex<bool>,
}

/**
 * Thread-safe access to a running solver. Owner threads add and remove proxies,
 * push drive data and pull results through clones of this handle while the
 * simulation thread owns the `DeformableSolver`.
 */
#[derive(Debug, Clone)]
pub struct SolverHandle {
    shared: Arc<SharedState>,
}

impl SolverHandle {
    /** Queues a proxy for materialization. Returns false if it is already known. */
    pub fn add_proxy(&self, proxy: Proxy) -> bool {
        self.shared.lifecycle.enqueue(proxy)
    }

    /** Removes a pending proxy or marks an active one for removal. Idempotent. */
    pub fn remove_proxy(&self, id: ProxyId) -> bool {
        self.shared.lifecycle.dequeue(id)
    }

    pub fn push_input_package(&self, package: InputPackage) {
        lock(&self.shared.package_input).push(package);
    }

    pub fn pull_output_package(&self) -> Option<OutputPackage> {
        lock(&self.shared.package_output).pop()
    }

    pub fn set_enabled(&self, enabled: bool) {
        *lock(&self.shared.enabled) = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        *lock(&self.shared.enabled)
    }

    pub fn is_pending_add(&self, id: ProxyId) -> bool {
        self.shared.lifecycle.is_pending_add(id)
    }

    pub fn is_active(&self, id: ProxyId) -> bool {
        self.shared.lifecycle.is_active(id)
    }

    pub fn is_pending_remove(&self, id: ProxyId) -> bool {
        self.shared.lifecycle.is_pending_remove(id)
    }

    /** Number of (pending-add, active, pending-remove) proxies. */
    pub fn proxy_counts(&self) -> (usize, usize, usize) {
        self.shared.lifecycle.counts()
    }
}

/**
 * Deformable body solver. Lives on the simulation thread; every `simulate`
 * call reclaims removed proxies, consumes the newest input package,
 * materializes added proxies, integrates and publishes an output package.
 */
pub struct DeformableSolver {
    params: SolverParams,
    shared: Arc<SharedState>,
    store: ParticleStore,
    registry: ConstraintRegistry,
    manager: ProxyManager,
    inputs: InputHistory,
    evolution: Evolution,
    needs_rebuild: bool,
    pre_solve: Vec<SolverHook>,
    post_solve: Vec<SolverHook>,
    pre_buffer: Vec<SolverHook>,
}

impl DeformableSolver {
    pub fn new(params: SolverParams) -> Self {
        let shared = SharedState {
            lifecycle: LifecycleQueues::default(),
            package_input: Mutex::new(InputSlot::default()),
            package_output: Mutex::new(OutputQueue::new(params.max_buffered_output_packages)),
            enabled: Mutex::new(true),
        };

        DeformableSolver {
            params,
            shared: Arc::new(shared),
            store: ParticleStore::new(),
            registry: ConstraintRegistry::new(),
            manager: ProxyManager::new(),
            inputs: InputHistory::default(),
            evolution: Evolution::new(params.counters_enabled),
            needs_rebuild: false,
            pre_solve: Vec::new(),
            post_solve: Vec::new(),
            pre_buffer: Vec::new(),
        }
    }

    pub fn handle(&self) -> SolverHandle {
        SolverHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn params(&self) -> &SolverParams {
        &self.params
    }

    /**
     * Applies a new configuration. Every active proxy goes back to pending-add
     * and is materialized again, with its constraints, by the next `simulate`.
     */
    pub fn reset(&mut self, params: SolverParams) {
        log::info!("resetting solver with {} active proxies", self.manager.active().len());
        self.params = params;
        self.manager.requeue_all(&self.shared.lifecycle, &mut self.store);
        self.registry.clear();
        self.inputs.clear();
        self.evolution.reset(params.counters_enabled);
        lock(&self.shared.package_output).set_capacity(params.max_buffered_output_packages);
        self.needs_rebuild = true;
    }

    /** Registers extra families for every proxy; takes effect at the next rebuild. */
    pub fn add_constraint_builder(&mut self, builder: ConstraintBuilder) {
        self.manager.add_constraint_builder(builder);
        self.needs_rebuild = true;
    }

    pub fn on_pre_solve(&mut self, hook: SolverHook) {
        self.pre_solve.push(hook);
    }

    pub fn on_post_solve(&mut self, hook: SolverHook) {
        self.post_solve.push(hook);
    }

    pub fn on_pre_buffer(&mut self, hook: SolverHook) {
        self.pre_buffer.push(hook);
    }

    pub fn store(&self) -> &ParticleStore {
        &self.store
    }

    pub fn registry(&self) -> &ConstraintRegistry {
        &self.registry
    }

    /** Slot toggling. Slots are renumbered by the next add or remove event. */
    pub fn registry_mut(&mut self) -> &mut ConstraintRegistry {
        &mut self.registry
    }

    pub fn active_proxies(&self) -> &[ActiveProxy] {
        self.manager.active()
    }

    pub fn state(&self) -> EvolutionState {
        self.evolution.state()
    }

    pub fn frame(&self) -> u64 {
        self.evolution.frame()
    }

    pub fn time(&self) -> FT {
        self.evolution.time()
    }

    pub fn statistics(&self) -> String {
        write_statistics(&self.evolution.pcounters, &self.evolution.vcounters)
    }

    /**
     * Advances the simulation by `dt`. A fatal error rolls back the running
     * sub-step, publishes no output package and disables the solver until
     * `SolverHandle::set_enabled(true)`.
     */
    pub fn simulate(&mut self, dt: FT) -> Result<(), SolverError> {
        if self.params.num_solver_iterations == 0 || !*lock(&self.shared.enabled) {
            return Ok(());
        }

        self.evolution.pcounters.begin("simulate");
        let result = self.simulate_frame(dt);
        self.evolution.pcounters.end("simulate");

        if let Err(err) = &result {
            log::error!("simulation of frame {} failed: {}", self.evolution.frame(), err);
            *lock(&self.shared.enabled) = false;
        }
        self.evolution.set_state(EvolutionState::Idle);
        result
    }

    fn simulate_frame(&mut self, dt: FT) -> Result<(), SolverError> {
        self.evolution.set_state(EvolutionState::ReclaimRemoved);
        // the active set may change below; a failed frame rebuilds on the next one
        let (pending_add, _, pending_remove) = self.shared.lifecycle.counts();
        if pending_add > 0 || pending_remove > 0 {
            self.needs_rebuild = true;
        }
        let reclaimed = self.manager.reclaim_pending(&self.shared.lifecycle, &mut self.store)?;

        let newest = lock(&self.shared.package_input).take();
        self.inputs.advance(newest);
        self.manager.apply_frame_input(&mut self.store, &self.inputs);

        self.evolution.set_state(EvolutionState::MaterializeAdded);
        let materialized =
            self.manager
                .materialize_pending(&self.shared.lifecycle, &mut self.store, &self.inputs, &self.params)?;

        if reclaimed > 0 || materialized > 0 || self.needs_rebuild {
            self.needs_rebuild = true;
            self.manager
                .rebuild_constraints(&self.store, &mut self.registry, &self.inputs, &self.params)?;
            self.needs_rebuild = false;
        }

        for hook in self.pre_solve.iter_mut() {
            hook(dt);
        }
        self.evolution.advance_dt(
            dt,
            &mut self.store,
            &mut self.registry,
            self.manager.active(),
            &self.inputs,
            &self.params,
        )?;
        for hook in self.post_solve.iter_mut() {
            hook(dt);
        }

        self.evolution.set_state(EvolutionState::Finalize);
        let output = self.manager.finalize(&self.store, self.evolution.frame());
        for hook in self.pre_buffer.iter_mut() {
            hook(dt);
        }
        lock(&self.shared.package_output).push(output);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}
    fn assert_send<T: Send>() {}

    #[test]
    fn handle_crosses_threads() {
        assert_send_sync::<SolverHandle>();
        assert_send::<DeformableSolver>();
    }

    #[test]
    fn zero_iterations_make_simulate_a_no_op() {
        let mut solver = DeformableSolver::new(SolverParams {
            num_solver_iterations: 0,
            ..Default::default()
        });
        solver.simulate(0.1).unwrap();
        assert!(solver.handle().pull_output_package().is_none());
        assert_eq!(solver.frame(), 0);
    }

    #[test]
    fn hooks_run_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut solver = DeformableSolver::new(SolverParams::default());
        for name in ["pre_solve", "post_solve", "pre_buffer"] {
            let calls = calls.clone();
            let hook: SolverHook = Box::new(move |_dt| calls.lock().unwrap().push(name));
            match name {
                "pre_solve" => solver.on_pre_solve(hook),
                "post_solve" => solver.on_post_solve(hook),
                _ => solver.on_pre_buffer(hook),
            }
        }

        solver.simulate(0.1).unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["pre_solve", "post_solve", "pre_buffer"]);
        assert!(solver.handle().pull_output_package().is_some());
    }

    #[test]
    fn disabled_solver_does_nothing() {
        let mut solver = DeformableSolver::new(SolverParams::default());
        let handle = solver.handle();
        handle.set_enabled(false);
        solver.simulate(0.1).unwrap();
        assert!(handle.pull_output_package().is_none());
    }
}
