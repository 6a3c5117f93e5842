use crate::{floating_type_mod::FT, vec3f, V3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverParams {
    // relaxation passes each family performs inside one apply; zero turns `simulate` into a no-op
    pub num_solver_iterations: usize,
    pub num_solver_sub_steps: usize,

    pub fix_time_step: bool,
    pub time_step_size: FT,

    // velocity damping rate in 1/s
    pub damping: FT,
    pub gravity: V3,
    pub enable_gravity: bool,

    // split evenly over the vertices of an object without a "mass" attribute
    pub default_object_mass: FT,

    pub enable_kinematics: bool,
    pub enable_position_targets: bool,
    pub enable_corotated_constraints: bool,
    pub enable_edge_springs: bool,
    pub enable_bending_springs: bool,
    pub use_xpbd_springs: bool,
    pub do_self_collision: bool,
    pub use_grid_based_constraints: bool,
    pub use_floor: bool,
    pub do_quasistatics: bool,

    // PBD stiffness in (0, 1], or spring constant when `use_xpbd_springs` is set
    pub edge_spring_stiffness: FT,
    pub bending_spring_stiffness: FT,

    // Young's modulus and Poisson ratio of the tetrahedral mesh
    pub e_mesh: FT,
    pub nu_mesh: FT,

    pub self_collision_thickness: FT,
    pub self_collision_friction: FT,
    pub self_collision_stiffness: FT,

    // only used with `use_grid_based_constraints`
    pub grid_dx: FT,
    pub grid_jacobi_ratio: FT,
    pub grid_velocity_smoothing: FT,

    pub max_buffered_output_packages: usize,
    pub counters_enabled: bool,
}

impl Default for SolverParams {
    fn default() -> Self {
        SolverParams {
            num_solver_iterations: 5,
            num_solver_sub_steps: 2,
            fix_time_step: false,
            time_step_size: 1. / 30.,
            damping: 0.01,
            gravity: vec3f(0., 0., -9.81),
            enable_gravity: true,
            default_object_mass: 100.,
            enable_kinematics: true,
            enable_position_targets: true,
            enable_corotated_constraints: true,
            enable_edge_springs: true,
            enable_bending_springs: false,
            use_xpbd_springs: false,
            do_self_collision: false,
            use_grid_based_constraints: false,
            use_floor: false,
            do_quasistatics: false,
            edge_spring_stiffness: 1.,
            bending_spring_stiffness: 0.5,
            e_mesh: 100000.,
            nu_mesh: 0.3,
            self_collision_thickness: 0.01,
            self_collision_friction: 0.,
            self_collision_stiffness: 1.,
            grid_dx: 0.1,
            grid_jacobi_ratio: 0.4,
            grid_velocity_smoothing: 0.1,
            max_buffered_output_packages: 8,
            counters_enabled: false,
        }
    }
}

impl SolverParams {
    pub fn sub_steps(&self) -> usize {
        self.num_solver_sub_steps.max(1)
    }

    /** Lamé parameters (mu, lambda) for a given Young's modulus. */
    pub fn lame_parameters(&self, youngs_modulus: FT) -> (FT, FT) {
        let nu = self.nu_mesh;
        let mu = youngs_modulus / (2. * (1. + nu));
        let lambda = youngs_modulus * nu / ((1. + nu) * (1. - 2. * nu));
        (mu, lambda)
    }

    pub fn gravity_vector(&self) -> V3 {
        if self.enable_gravity {
            self.gravity
        } else {
            V3::zeros()
        }
    }
}
