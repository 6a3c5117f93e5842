pub mod concurrency;
pub mod constraint_registry;
pub mod constraints;
pub mod error;
pub mod evolution;
pub mod instrumentation;
pub mod kinematics;
pub mod package;
pub mod particles;
pub mod proxy;
pub mod proxy_manager;
pub mod rest_collection;
pub mod scene;
pub mod solver;
pub mod solver_parameters;
pub mod thread_safe_ptr;

pub type IT = i32;

#[cfg(feature = "double-precision")]
pub mod floating_type_mod {
    pub type FT = f64;
}

#[cfg(not(feature = "double-precision"))]
pub mod floating_type_mod {
    pub type FT = f32;
}

use floating_type_mod::FT;

use nalgebra::{Isometry3, SMatrix, SVector};

#[allow(dead_code)]
pub type V<FT, const D: usize> = SVector<FT, D>;
pub type M<FT, const D: usize> = SMatrix<FT, D, D>;

pub type VI<const D: usize> = V<IT, D>;

pub type V3 = V<FT, 3>;
pub type M3 = M<FT, 3>;

/** Rigid world/bone transform used by every drive buffer. */
pub type Transform = Isometry3<FT>;

pub fn vec3f(x: FT, y: FT, z: FT) -> V<FT, 3> {
    [x, y, z].into()
}

pub use constraint_registry::{ConstraintRegistry, Phase, SlotId};
pub use constraints::{ConstraintFamily, ConstraintRule, ExternalConstraint, FamilyContext};
pub use error::SolverError;
pub use package::{InputPackage, OutputPackage, Package};
pub use particles::{ParticleRange, ParticleStore, RangeRemap};
pub use proxy::{InputBuffer, OutputBuffer, Proxy, ProxyId};
pub use rest_collection::{KinematicBinding, PositionTarget, RestCollection};
pub use scene::{build_scene, SceneConfig};
pub use solver::{DeformableSolver, SolverHandle};
pub use solver_parameters::SolverParams;
