use nalgebra::Point3;

use crate::{
    floating_type_mod::FT,
    package::InputHistory,
    particles::ParticleVec,
    proxy::{ActiveProxy, InputBuffer},
    rest_collection::RestCollection,
    Transform, V3,
};

const MIN_BONE_WEIGHT: FT = 1e-8;
const SLERP_EPSILON: FT = 1e-6;

/** Interpolates translation linearly and rotation spherically. */
pub fn blend_transforms(from: &Transform, to: &Transform, t: FT) -> Transform {
    let translation = from.translation.vector.lerp(&to.translation.vector, t);
    let rotation = from
        .rotation
        .try_slerp(&to.rotation, t, SLERP_EPSILON)
        .unwrap_or(to.rotation);
    Transform::from_parts(translation.into(), rotation)
}

/**
 * Linear blend skinning of a rest position in component space. Bones missing
 * from the buffer are skipped; `None` if no listed bone could be resolved.
 */
pub fn skin(rest: &V3, bones: &[(i32, FT)], buffer: &InputBuffer) -> Option<V3> {
    let rest = Point3::from(*rest);
    let mut sum = V3::zeros();
    let mut weight_sum = 0.;
    for &(bone, weight) in bones {
        if bone < 0 || weight.abs() < MIN_BONE_WEIGHT {
            continue;
        }
        let bone = bone as usize;
        if let (Some(rest_transform), Some(transform)) = (buffer.rest_transforms.get(bone), buffer.transforms.get(bone)) {
            let skinned = transform * rest_transform.inverse() * rest;
            sum += skinned.coords * weight;
            weight_sum += weight;
        }
    }
    if weight_sum > 0. {
        Some(sum / weight_sum)
    } else {
        None
    }
}

/** Bones influencing a kinematic vertex: its skinning weights, or else its binding's bone. */
fn vertex_bones(rest: &RestCollection, vertex: usize, binding_bone: i32, binding_weight: FT) -> Vec<(i32, FT)> {
    match rest.vertex_bone_weights.as_ref().and_then(|w| w.get(vertex)) {
        Some(weights) if !weights.is_empty() => weights.clone(),
        _ => vec![(binding_bone, binding_weight)],
    }
}

/**
 * World position of a kinematic vertex at sub-step ratio `ratio` between the
 * previous (0) and the current (1) drive buffer. Without a drive buffer the
 * proxy's initial transform is used; without resolvable bones only the global
 * transform is applied to the rest position.
 */
pub fn kinematic_target(
    rest_position: &V3,
    bones: &[(i32, FT)],
    current: Option<&InputBuffer>,
    previous: Option<&InputBuffer>,
    initial_transform: &Transform,
    ratio: FT,
) -> V3 {
    let current_global = current.map(|b| b.global_transform).unwrap_or(*initial_transform);
    let previous_global = previous.map(|b| b.global_transform).unwrap_or(current_global);
    let global = blend_transforms(&previous_global, &current_global, ratio);

    let local = match current.and_then(|b| skin(rest_position, bones, b)) {
        Some(local_current) => {
            let local_previous = previous
                .and_then(|b| skin(rest_position, bones, b))
                .unwrap_or(local_current);
            local_previous.lerp(&local_current, ratio)
        }
        None => *rest_position,
    };

    (global * Point3::from(local)).coords
}

/**
 * Overwrites the predicted position of every kinematic particle of every active
 * proxy. Runs once per sub-step, after the constraint inits.
 */
pub fn kinematic_update(particles: &mut ParticleVec, proxies: &[ActiveProxy], inputs: &InputHistory, ratio: FT) {
    for active in proxies {
        let rest = active.rest();
        let current = inputs.current_buffer(active.id());
        let previous = inputs.previous_buffer(active.id());

        for binding in &rest.kinematic_bindings {
            for (&vertex, &weight) in binding.vertices.iter().zip(binding.weights.iter()) {
                let i = active.range.start + vertex;
                if !particles.is_kinematic(i) {
                    continue;
                }
                let bones = vertex_bones(rest, vertex, binding.bone_index, weight);
                particles.p[i] = kinematic_target(
                    &rest.vertices[vertex],
                    &bones,
                    current,
                    previous,
                    active.proxy.initial_transform(),
                    ratio,
                );
            }
        }
    }
}
