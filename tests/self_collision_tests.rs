use std::sync::Arc;

use deformable_solver::{
    floating_type_mod::FT, DeformableSolver, InputBuffer, InputPackage, Proxy, RestCollection, SolverParams, Transform,
};

const THICKNESS: FT = 0.02;
const SPACING: FT = 0.1;
// the driven patch moves this far per frame, a quarter of the thickness per sub-step
const DESCENT_PER_FRAME: FT = 0.05;

fn collision_params() -> SolverParams {
    SolverParams {
        enable_gravity: false,
        do_self_collision: true,
        self_collision_thickness: THICKNESS,
        num_solver_sub_steps: 10,
        ..Default::default()
    }
}

fn driven_patch() -> RestCollection {
    let mut rest = RestCollection::cloth_grid(4, 4, SPACING);
    let all: Vec<usize> = (0..rest.num_vertices()).collect();
    rest.bind_kinematic(-1, all);
    rest
}

#[test]
fn driven_patch_pushes_free_patch_ahead_of_it() {
    let mut solver = DeformableSolver::new(collision_params());
    let handle = solver.handle();

    let offset = SPACING / 2.;
    let start_height = 0.1;
    let driven = Proxy::new(Arc::new(driven_patch()), Transform::translation(offset, offset, start_height));
    let free = Proxy::new(Arc::new(RestCollection::cloth_grid(4, 4, SPACING)), Transform::identity());
    let (driven_id, free_id) = (driven.id(), free.id());
    handle.add_proxy(driven);
    handle.add_proxy(free);

    for frame in 0..8 {
        let height = start_height - DESCENT_PER_FRAME * frame as FT;
        let mut input = InputPackage::new(frame);
        input
            .objects
            .insert(driven_id, InputBuffer::with_transform(Transform::translation(offset, offset, height)));
        handle.push_input_package(input);

        solver.simulate(1. / 60.).unwrap();
        let output = handle.pull_output_package().unwrap();

        for p in &output.get(driven_id).unwrap().positions {
            approx::assert_relative_eq!(p.z, height, epsilon = 1e-5);
        }

        // no particle of one patch comes within the collision thickness of the other
        for a in &output.get(driven_id).unwrap().positions {
            for b in &output.get(free_id).unwrap().positions {
                let distance = (a - b).norm();
                assert!(
                    distance >= 0.8 * THICKNESS,
                    "frame {}: particles {:?} and {:?} are {} apart",
                    frame,
                    a,
                    b,
                    distance
                );
            }
        }

        // free vertices under the interior of the driven patch stay below it
        let footprint = offset + 1e-3..offset + 3. * SPACING - 1e-3;
        for p in &output.get(free_id).unwrap().positions {
            if footprint.contains(&p.x) && footprint.contains(&p.y) {
                assert!(
                    p.z <= height - 0.8 * THICKNESS,
                    "frame {}: free vertex {:?} passed the driven patch at {}",
                    frame,
                    p,
                    height
                );
            }
        }
    }

    // the free patch was carried along
    let lowest = solver.store().particles.x.iter().map(|p| p.z).fold(FT::MAX, FT::min);
    assert!(lowest < -0.1);
}

#[test]
fn collision_is_inactive_when_disabled() {
    let params = SolverParams {
        do_self_collision: false,
        ..collision_params()
    };
    let mut solver = DeformableSolver::new(params);
    let handle = solver.handle();
    let driven = Proxy::new(Arc::new(driven_patch()), Transform::translation(0.05, 0.05, 0.1));
    let free = Proxy::new(Arc::new(RestCollection::cloth_grid(4, 4, SPACING)), Transform::identity());
    let (driven_id, free_id) = (driven.id(), free.id());
    handle.add_proxy(driven);
    handle.add_proxy(free);

    for frame in 0..8 {
        let mut input = InputPackage::new(frame);
        input.objects.insert(
            driven_id,
            InputBuffer::with_transform(Transform::translation(0.05, 0.05, 0.1 - DESCENT_PER_FRAME * frame as FT)),
        );
        handle.push_input_package(input);
        solver.simulate(1. / 60.).unwrap();

        let output = handle.pull_output_package().unwrap();
        for p in &output.get(free_id).unwrap().positions {
            approx::assert_relative_eq!(p.z, 0., epsilon = 1e-6);
        }
    }
}
