use std::{
    fmt::Display,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{floating_type_mod::FT, particles::ParticleRange, rest_collection::RestCollection, Transform, V3};

static NEXT_PROXY_ID: AtomicU64 = AtomicU64::new(1);

/** Identity of a simulated body, shared between its owner and the solver. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyId(u64);

impl ProxyId {
    pub fn next() -> Self {
        ProxyId(NEXT_PROXY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ProxyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proxy#{}", self.0)
    }
}

/**
 * Solver-side handle of one simulated body. The owner creates it, hands it to
 * `SolverHandle::add_proxy` and keeps only the `ProxyId` afterwards.
 */
#[derive(Debug, Clone)]
pub struct Proxy {
    id: ProxyId,
    rest: Arc<RestCollection>,
    initial_transform: Transform,
}

impl Proxy {
    pub fn new(rest: Arc<RestCollection>, initial_transform: Transform) -> Self {
        Proxy {
            id: ProxyId::next(),
            rest,
            initial_transform,
        }
    }

    pub fn id(&self) -> ProxyId {
        self.id
    }

    pub fn rest(&self) -> &RestCollection {
        &self.rest
    }

    pub fn initial_transform(&self) -> &Transform {
        &self.initial_transform
    }

    pub fn num_vertices(&self) -> usize {
        self.rest.vertices.len()
    }
}

/** A proxy that owns a particle range. Only the simulation thread sees these. */
#[derive(Debug)]
pub struct ActiveProxy {
    pub proxy: Proxy,
    pub range: ParticleRange,
    // latest simulated shape, written back after every `simulate`
    pub current_shape: Vec<V3>,
}

impl ActiveProxy {
    pub fn id(&self) -> ProxyId {
        self.proxy.id()
    }

    pub fn rest(&self) -> &RestCollection {
        self.proxy.rest()
    }
}

/** Per-frame drive data of one proxy. */
#[derive(Debug, Clone)]
pub struct InputBuffer {
    pub global_transform: Transform,
    // component space rest pose of every bone
    pub rest_transforms: Vec<Transform>,
    // component space pose of every bone at this frame
    pub transforms: Vec<Transform>,
    pub mass_multiplier: FT,
    pub damping_multiplier: FT,
    pub stiffness_multiplier: FT,
    pub enable_gravity: bool,
    // world space goals for position targets without target particles, by target index
    pub position_targets: Vec<Option<V3>>,
}

impl Default for InputBuffer {
    fn default() -> Self {
        InputBuffer {
            global_transform: Transform::identity(),
            rest_transforms: Vec::new(),
            transforms: Vec::new(),
            mass_multiplier: 1.,
            damping_multiplier: 1.,
            stiffness_multiplier: 1.,
            enable_gravity: true,
            position_targets: Vec::new(),
        }
    }
}

impl InputBuffer {
    pub fn with_transform(global_transform: Transform) -> Self {
        InputBuffer {
            global_transform,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputBuffer {
    pub positions: Vec<V3>,
}

impl OutputBuffer {
    pub fn new(active: &ActiveProxy) -> Self {
        OutputBuffer {
            positions: active.current_shape.clone(),
        }
    }
}
