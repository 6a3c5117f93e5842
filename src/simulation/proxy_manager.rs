use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    constraint_registry::{ConstraintRegistry, Phase},
    constraints::{
        ConstraintFamily, CorotatedConstraints, FloorConstraint, GridBasedCorotatedConstraints, GridMesh,
        SelfCollisionConstraints, SpringConstraints, WeakConstraints,
    },
    floating_type_mod::FT,
    package::{InputHistory, OutputPackage},
    particles::{ParticleRange, ParticleStore},
    proxy::{ActiveProxy, InputBuffer, OutputBuffer, Proxy, ProxyId},
    rest_collection::{DAMPING_ATTRIBUTE, MASS_ATTRIBUTE, STIFFNESS_ATTRIBUTE},
    solver_parameters::SolverParams,
    SolverError,
};

const MIN_PARTICLE_MASS: FT = 1e-12;

/** Builds additional families for one active proxy during every constraint rebuild. */
pub type ConstraintBuilder =
    Box<dyn Fn(&ActiveProxy, &ParticleStore) -> Result<Vec<ConstraintFamily>, SolverError> + Send>;

#[derive(Debug, Default)]
pub struct InitializationState {
    pub pending_add: Vec<Proxy>,
    pub active_ids: HashSet<ProxyId>,
}

/**
 * The add and remove queues shared between owner threads and the simulation
 * thread. Whoever needs both locks takes `removal` first.
 */
#[derive(Debug, Default)]
pub struct LifecycleQueues {
    initialization: Mutex<InitializationState>,
    removal: Mutex<Vec<ProxyId>>,
}

impl LifecycleQueues {
    pub fn lock_initialization(&self) -> MutexGuard<'_, InitializationState> {
        self.initialization.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_removal(&self) -> MutexGuard<'_, Vec<ProxyId>> {
        self.removal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /** Returns false if the proxy is already pending or active. */
    pub fn enqueue(&self, proxy: Proxy) -> bool {
        let mut init = self.lock_initialization();
        let id = proxy.id();
        if init.active_ids.contains(&id) || init.pending_add.iter().any(|p| p.id() == id) {
            return false;
        }
        log::debug!("{} queued for materialization", id);
        init.pending_add.push(proxy);
        true
    }

    /**
     * Drops a pending proxy right away and marks an active one for reclaim.
     * Returns false when nothing changed.
     */
    pub fn dequeue(&self, id: ProxyId) -> bool {
        let mut removal = self.lock_removal();
        let mut init = self.lock_initialization();

        if let Some(pos) = init.pending_add.iter().position(|p| p.id() == id) {
            init.pending_add.remove(pos);
            log::debug!("{} removed before materialization", id);
            return true;
        }
        if init.active_ids.contains(&id) && !removal.contains(&id) {
            removal.push(id);
            log::debug!("{} queued for reclaim", id);
            return true;
        }
        false
    }

    pub fn is_pending_add(&self, id: ProxyId) -> bool {
        self.lock_initialization().pending_add.iter().any(|p| p.id() == id)
    }

    pub fn is_active(&self, id: ProxyId) -> bool {
        self.lock_initialization().active_ids.contains(&id)
    }

    pub fn is_pending_remove(&self, id: ProxyId) -> bool {
        self.lock_removal().contains(&id)
    }

    /** Number of (pending-add, active, pending-remove) proxies. */
    pub fn counts(&self) -> (usize, usize, usize) {
        let removal = self.lock_removal();
        let init = self.lock_initialization();
        (init.pending_add.len(), init.active_ids.len(), removal.len())
    }
}

fn frame_multipliers(buffer: Option<&InputBuffer>) -> (FT, FT, FT) {
    buffer
        .map(|b| (b.mass_multiplier, b.damping_multiplier, b.stiffness_multiplier))
        .unwrap_or((1., 1., 1.))
}

fn gravity_scale(buffer: Option<&InputBuffer>) -> FT {
    match buffer {
        Some(b) if !b.enable_gravity => 0.,
        _ => 1.,
    }
}

/**
 * Simulation-thread side of the proxy lifecycle: owns the active proxies (in
 * ascending order of their particle ranges) and rebuilds every constraint
 * family whenever the set changes.
 */
#[derive(Default)]
pub struct ProxyManager {
    active: Vec<ActiveProxy>,
    builders: Vec<ConstraintBuilder>,
}

impl ProxyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> &[ActiveProxy] {
        &self.active
    }

    pub fn add_constraint_builder(&mut self, builder: ConstraintBuilder) {
        self.builders.push(builder);
    }

    /**
     * Allocates particles for every pending proxy and moves it to the active
     * set. The initialization lock is held throughout so a concurrent dequeue
     * sees the proxy either pending or active. Rest data of the whole batch is
     * validated before anything is allocated; on failure the proxies that were
     * not materialized stay pending. Returns the number of proxies materialized.
     */
    pub fn materialize_pending(
        &mut self,
        queues: &LifecycleQueues,
        store: &mut ParticleStore,
        inputs: &InputHistory,
        params: &SolverParams,
    ) -> Result<usize, SolverError> {
        let mut init = queues.lock_initialization();
        for proxy in &init.pending_add {
            if let Err(err) = proxy.rest().validate() {
                log::warn!("{} has malformed rest data and stays pending", proxy.id());
                return Err(err);
            }
        }

        let pending: Vec<Proxy> = init.pending_add.drain(..).collect();
        let mut materialized = 0;
        let mut remaining = pending.into_iter();
        while let Some(proxy) = remaining.next() {
            let id = proxy.id();
            if let Err(err) = self.materialize(&proxy, store, inputs.current_buffer(id), params) {
                init.pending_add.push(proxy);
                init.pending_add.extend(remaining);
                return Err(err);
            }
            init.active_ids.insert(id);
            materialized += 1;
        }
        Ok(materialized)
    }

    fn materialize(
        &mut self,
        proxy: &Proxy,
        store: &mut ParticleStore,
        buffer: Option<&InputBuffer>,
        params: &SolverParams,
    ) -> Result<(), SolverError> {
        let rest = proxy.rest();
        let n = rest.num_vertices();
        let start = store.add_range(n)?;
        let range = ParticleRange { start, count: n };
        let (mass_multiplier, damping_multiplier, _) = frame_multipliers(buffer);
        let masses = rest.attribute(MASS_ATTRIBUTE);
        let dampings = rest.attribute(DAMPING_ATTRIBUTE);
        let default_mass = params.default_object_mass / n.max(1) as FT;
        let gravity = gravity_scale(buffer);

        let particles = &mut store.particles;
        for k in 0..n {
            let i = start + k;
            let x = proxy.initial_transform().transform_point(&rest.vertices[k].into()).coords;
            let m = masses.map(|m| m[k]).unwrap_or(default_mass) * mass_multiplier;

            particles.x[i] = x;
            particles.p[i] = x;
            particles.v[i] = nalgebra::zero();
            particles.m[i] = m;
            particles.inv_m[i] = if m > MIN_PARTICLE_MASS { 1. / m } else { 0. };
            particles.damping[i] = dampings.map(|d| d[k]).unwrap_or(params.damping) * damping_multiplier;
            particles.gravity_scale[i] = gravity;
            particles.owner[i] = Some(proxy.id());
        }
        if params.enable_kinematics {
            for k in rest.kinematic_vertices() {
                particles.inv_m[start + k] = 0.;
            }
        }

        let current_shape = particles.x[range.indices()].to_vec();
        log::debug!("{} materialized with particles {:?}", proxy.id(), range.indices());
        self.active.push(ActiveProxy {
            proxy: proxy.clone(),
            range,
            current_shape,
        });
        Ok(())
    }

    /**
     * Frees the particle ranges of every proxy marked for removal and compacts
     * the ranges of the remaining ones. Returns the number of proxies reclaimed.
     */
    pub fn reclaim_pending(&mut self, queues: &LifecycleQueues, store: &mut ParticleStore) -> Result<usize, SolverError> {
        let mut removal = queues.lock_removal();
        if removal.is_empty() {
            return Ok(0);
        }
        let mut init = queues.lock_initialization();

        let mut reclaimed = 0;
        for id in removal.drain(..) {
            init.active_ids.remove(&id);
            let pos = match self.active.iter().position(|a| a.id() == id) {
                Some(pos) => pos,
                None => continue,
            };
            let removed = self.active.remove(pos);
            let remaps = store.remove_range(removed.range.start, removed.range.count)?;
            for active in self.active.iter_mut() {
                if let Some(remap) = remaps.iter().find(|r| r.old_start == active.range.start) {
                    active.range.start = remap.new_start;
                }
            }
            log::debug!("{} reclaimed, {} ranges shifted", id, remaps.len());
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    /** Moves every active proxy back to pending-add and frees all particles. */
    pub fn requeue_all(&mut self, queues: &LifecycleQueues, store: &mut ParticleStore) {
        let mut removal = queues.lock_removal();
        let mut init = queues.lock_initialization();

        let removed: HashSet<ProxyId> = removal.drain(..).collect();
        let mut requeued: Vec<Proxy> = self
            .active
            .drain(..)
            .map(|a| a.proxy)
            .filter(|p| !removed.contains(&p.id()))
            .collect();
        init.active_ids.clear();
        requeued.append(&mut init.pending_add);
        init.pending_add = requeued;
        store.clear();
    }

    /** Refreshes per-frame particle state that is not baked at materialization. */
    pub fn apply_frame_input(&self, store: &mut ParticleStore, inputs: &InputHistory) {
        for active in &self.active {
            let gravity = gravity_scale(inputs.current_buffer(active.id()));
            for i in active.range.indices() {
                store.particles.gravity_scale[i] = gravity;
            }
        }
    }

    /**
     * Clears the registry and registers every family again: per proxy in range
     * order (edge springs, bending springs, position targets, tetrahedra, then
     * the families of every constraint builder), followed by the families
     * spanning all proxies (grid elasticity, self-collision, floor).
     */
    pub fn rebuild_constraints(
        &self,
        store: &ParticleStore,
        registry: &mut ConstraintRegistry,
        inputs: &InputHistory,
        params: &SolverParams,
    ) -> Result<(), SolverError> {
        registry.clear();
        let generation = store.generation();
        let iterations = params.num_solver_iterations;

        for active in &self.active {
            let rest = active.rest();
            let range = active.range;
            let (_, _, stiffness_multiplier) = frame_multipliers(inputs.current_buffer(active.id()));
            let spring_stiffness = |k: FT| {
                if params.use_xpbd_springs {
                    k * stiffness_multiplier
                } else {
                    (k * stiffness_multiplier).min(1.)
                }
            };

            if params.enable_edge_springs {
                let edges = rest.unique_edges();
                if !edges.is_empty() {
                    let springs = SpringConstraints::new(
                        "edge_springs",
                        range,
                        generation,
                        &rest.vertices,
                        edges,
                        spring_stiffness(params.edge_spring_stiffness),
                        params.use_xpbd_springs,
                        iterations,
                    )?;
                    registry.register(springs.into(), &[Phase::Init, Phase::Apply]);
                }
            }

            if params.enable_bending_springs {
                let pairs = rest.bending_pairs();
                if !pairs.is_empty() {
                    let springs = SpringConstraints::new(
                        "bending_springs",
                        range,
                        generation,
                        &rest.vertices,
                        pairs,
                        spring_stiffness(params.bending_spring_stiffness),
                        params.use_xpbd_springs,
                        iterations,
                    )?;
                    registry.register(springs.into(), &[Phase::Init, Phase::Apply]);
                }
            }

            if params.enable_position_targets && !rest.position_targets.is_empty() {
                let weak = WeakConstraints::new(
                    active.id(),
                    range,
                    generation,
                    &rest.position_targets,
                    stiffness_multiplier,
                )?;
                registry.register(weak.into(), &[Phase::Init, Phase::Apply]);
            }

            if params.enable_corotated_constraints && !params.use_grid_based_constraints && !rest.tetrahedra.is_empty() {
                let lame = element_lame_parameters(active, stiffness_multiplier, params);
                let corotated = CorotatedConstraints::new(
                    range,
                    generation,
                    &rest.vertices,
                    rest.tetrahedra.clone(),
                    lame,
                    iterations,
                )?;
                registry.register(corotated.into(), &[Phase::Init, Phase::Apply]);
            }

            for builder in &self.builders {
                for family in builder(active, store)? {
                    registry.register_family(family);
                }
            }
        }

        if params.use_grid_based_constraints {
            let meshes: Vec<GridMesh> = self
                .active
                .iter()
                .filter(|a| !a.rest().tetrahedra.is_empty())
                .map(|a| {
                    let (_, _, stiffness_multiplier) = frame_multipliers(inputs.current_buffer(a.id()));
                    GridMesh {
                        range: a.range,
                        tets: a.rest().tetrahedra.clone(),
                        lame: element_lame_parameters(a, stiffness_multiplier, params),
                        rest_positions: a.rest().vertices.clone(),
                    }
                })
                .collect();
            if !meshes.is_empty() {
                let grid = GridBasedCorotatedConstraints::new(
                    generation,
                    meshes,
                    params.grid_dx,
                    params.grid_jacobi_ratio,
                    params.grid_velocity_smoothing,
                    iterations,
                )?;
                registry.register_family(grid.into());
            }
        }

        if params.do_self_collision {
            let meshes: Vec<(ParticleRange, Vec<[usize; 3]>)> = self
                .active
                .iter()
                .map(|a| {
                    let rest = a.rest();
                    let triangles = if rest.triangles.is_empty() {
                        rest.surface_from_tetrahedra()
                    } else {
                        rest.triangles.clone()
                    };
                    (a.range, triangles)
                })
                .collect();
            let collision = SelfCollisionConstraints::new(
                generation,
                meshes,
                params.self_collision_thickness,
                params.self_collision_stiffness,
                params.self_collision_friction,
                iterations,
            )?;
            registry.register(collision.into(), &[Phase::Init, Phase::Apply]);
        }

        if params.use_floor {
            registry.register(FloorConstraint::new(generation, 0.).into(), &[Phase::Apply]);
        }

        log::debug!(
            "registered {} constraint families for {} proxies",
            registry.num_families(),
            self.active.len()
        );
        Ok(())
    }

    /**
     * Copies every proxy's committed positions into its current shape and
     * collects them into an output package.
     */
    pub fn finalize(&mut self, store: &ParticleStore, frame: u64) -> OutputPackage {
        let mut package = OutputPackage::new(frame);
        for active in self.active.iter_mut() {
            active.current_shape.clear();
            active
                .current_shape
                .extend_from_slice(&store.particles.x[active.range.indices()]);
            package.objects.insert(active.id(), OutputBuffer::new(active));
        }
        package
    }
}

/**
 * Lamé parameters per tetrahedron: Young's modulus is the mean "stiffness"
 * attribute of the four vertices, or the global one.
 */
fn element_lame_parameters(active: &ActiveProxy, stiffness_multiplier: FT, params: &SolverParams) -> Vec<(FT, FT)> {
    let rest = active.rest();
    let stiffness = rest.attribute(STIFFNESS_ATTRIBUTE);
    rest.tetrahedra
        .iter()
        .map(|t| {
            let youngs = match stiffness {
                Some(s) => t.iter().map(|&i| s[i]).sum::<FT>() / 4.,
                None => params.e_mesh,
            };
            params.lame_parameters(youngs * stiffness_multiplier)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rest_collection::RestCollection, Transform};
    use std::sync::Arc;

    fn cloth_proxy(n: usize) -> Proxy {
        Proxy::new(Arc::new(RestCollection::cloth_grid(n, n, 0.1)), Transform::identity())
    }

    #[test]
    fn enqueue_is_idempotent() {
        let queues = LifecycleQueues::default();
        let proxy = cloth_proxy(2);
        assert!(queues.enqueue(proxy.clone()));
        assert!(!queues.enqueue(proxy));
        assert_eq!(queues.counts(), (1, 0, 0));
    }

    #[test]
    fn dequeue_of_pending_proxy_drops_it() {
        let queues = LifecycleQueues::default();
        let proxy = cloth_proxy(2);
        let id = proxy.id();
        queues.enqueue(proxy);
        assert!(queues.dequeue(id));
        assert!(!queues.dequeue(id));
        assert_eq!(queues.counts(), (0, 0, 0));
    }

    #[test]
    fn default_mass_is_split_evenly() {
        let queues = LifecycleQueues::default();
        let mut store = ParticleStore::new();
        let mut manager = ProxyManager::new();
        let params = SolverParams::default();
        queues.enqueue(cloth_proxy(2));

        let count = manager
            .materialize_pending(&queues, &mut store, &InputHistory::default(), &params)
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(store.len(), 4);
        for i in 0..4 {
            approx::assert_relative_eq!(store.particles.m[i], params.default_object_mass / 4.);
        }
    }

    #[test]
    fn malformed_proxy_keeps_whole_batch_pending() {
        let queues = LifecycleQueues::default();
        let mut store = ParticleStore::new();
        let mut manager = ProxyManager::new();
        let mut broken = RestCollection::cloth_grid(2, 2, 0.1);
        broken.edges = vec![[0, 99]];
        queues.enqueue(cloth_proxy(3));
        queues.enqueue(Proxy::new(Arc::new(broken), Transform::identity()));

        let result = manager.materialize_pending(&queues, &mut store, &InputHistory::default(), &SolverParams::default());

        assert!(matches!(
            result,
            Err(SolverError::IndexOutOfRange {
                family: "edges",
                index: 99,
                ..
            })
        ));
        assert_eq!(queues.counts(), (2, 0, 0));
        assert!(manager.active().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn reclaim_compacts_remaining_ranges() {
        let queues = LifecycleQueues::default();
        let mut store = ParticleStore::new();
        let mut manager = ProxyManager::new();
        let params = SolverParams::default();
        let first = cloth_proxy(2);
        let second = cloth_proxy(3);
        let (first_id, second_id) = (first.id(), second.id());
        queues.enqueue(first);
        queues.enqueue(second);
        manager
            .materialize_pending(&queues, &mut store, &InputHistory::default(), &params)
            .unwrap();

        assert!(queues.dequeue(first_id));
        assert!(queues.is_pending_remove(first_id));
        assert_eq!(manager.reclaim_pending(&queues, &mut store).unwrap(), 1);

        assert_eq!(manager.active().len(), 1);
        assert_eq!(manager.active()[0].id(), second_id);
        assert_eq!(manager.active()[0].range, ParticleRange { start: 0, count: 9 });
        assert_eq!(store.particles.owner[0], Some(second_id));
        assert!(!queues.is_active(first_id));
    }
}
