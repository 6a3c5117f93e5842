use std::sync::Arc;

use nalgebra::{Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};

use crate::{
    floating_type_mod::FT,
    package::InputPackage,
    proxy::{InputBuffer, Proxy},
    rest_collection::{RestCollection, MASS_ATTRIBUTE, STIFFNESS_ATTRIBUTE},
    SolverError, Transform, V3,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneShape {
    ClothGrid { nx: usize, ny: usize, spacing: FT },
    TetBox { nx: usize, ny: usize, nz: usize, spacing: FT },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneBody {
    shape: SceneShape,
    #[serde(default)]
    position: Vec<FT>,
    // scaled rotation axis
    #[serde(default)]
    rotation: Vec<FT>,
    // vertices bound to the body transform
    #[serde(default)]
    pinned: Vec<usize>,
    // constant velocity of the body transform
    #[serde(default)]
    velocity: Vec<FT>,
    #[serde(default)]
    total_mass: Option<FT>,
    #[serde(default)]
    stiffness: Option<FT>,
    #[serde(default = "default_true")]
    gravity: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    pub bodies: Vec<SceneBody>,
    #[serde(default = "default_frame_dt")]
    pub frame_dt: FT,
}

fn default_frame_dt() -> FT {
    1. / 60.
}

fn vec3_from(values: &[FT], name: &str) -> Result<V3, SolverError> {
    match values.len() {
        0 => Ok(V3::zeros()),
        3 => Ok(V3::new(values[0], values[1], values[2])),
        n => Err(SolverError::MalformedRestData(format!("'{}' needs 3 components, got {}", name, n))),
    }
}

/** A proxy built from a scene body plus the rigid motion driving it. */
#[derive(Debug, Clone)]
pub struct ScenePiece {
    pub proxy: Proxy,
    pub velocity: V3,
    pub gravity: bool,
}

impl ScenePiece {
    /** World transform of the body after `time` seconds of linear motion. */
    pub fn transform_at(&self, time: FT) -> Transform {
        let initial = self.proxy.initial_transform();
        Transform::from_parts(
            Translation3::from(initial.translation.vector + self.velocity * time),
            initial.rotation,
        )
    }

    pub fn input_buffer(&self, time: FT) -> InputBuffer {
        InputBuffer {
            enable_gravity: self.gravity,
            ..InputBuffer::with_transform(self.transform_at(time))
        }
    }
}

pub fn build_scene(config: &SceneConfig) -> Result<Vec<ScenePiece>, SolverError> {
    let mut pieces = Vec::with_capacity(config.bodies.len());

    for body in &config.bodies {
        let mut rest = match body.shape {
            SceneShape::ClothGrid { nx, ny, spacing } if nx >= 2 && ny >= 2 => RestCollection::cloth_grid(nx, ny, spacing),
            SceneShape::TetBox { nx, ny, nz, spacing } if nx >= 1 && ny >= 1 && nz >= 1 => {
                RestCollection::tet_box(nx, ny, nz, spacing)
            }
            ref shape => return Err(SolverError::MalformedRestData(format!("degenerate scene shape {:?}", shape))),
        };

        let n = rest.num_vertices();
        if let Some(total_mass) = body.total_mass {
            rest.set_attribute(MASS_ATTRIBUTE, vec![total_mass / n as FT; n]);
        }
        if let Some(stiffness) = body.stiffness {
            rest.set_attribute(STIFFNESS_ATTRIBUTE, vec![stiffness; n]);
        }
        if !body.pinned.is_empty() {
            rest.bind_kinematic(-1, body.pinned.clone());
        }
        rest.validate()?;

        let transform = Transform::from_parts(
            Translation3::from(vec3_from(&body.position, "position")?),
            UnitQuaternion::from_scaled_axis(vec3_from(&body.rotation, "rotation")?),
        );
        pieces.push(ScenePiece {
            proxy: Proxy::new(Arc::new(rest), transform),
            velocity: vec3_from(&body.velocity, "velocity")?,
            gravity: body.gravity,
        });
    }

    Ok(pieces)
}

/** Drive data of every scene piece at `time`. */
pub fn scene_input_package(pieces: &[ScenePiece], frame: u64, time: FT) -> InputPackage {
    let mut package = InputPackage::new(frame);
    for piece in pieces {
        package.objects.insert(piece.proxy.id(), piece.input_buffer(time));
    }
    package
}
