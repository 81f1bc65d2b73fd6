//! Fixed-shape observation record produced by the physics engine.
use serde::{Deserialize, Serialize};

/// One snapshot of a simulated body system.
///
/// Produced once per physics step and read-only downstream. Array lengths are
/// fixed by the environment model: `xpos` holds 3 values per body, `xquat` 4
/// per body, `actions` one per actuator.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Observation {
    /// World position of the root body.
    pub body_pos: [f32; 3],

    /// Generalized positions.
    pub qpos: Vec<f32>,

    /// Generalized velocities.
    pub qvel: Vec<f32>,

    /// Cartesian body positions, 3 per body.
    pub xpos: Vec<f32>,

    /// Body orientations as quaternions, 4 per body.
    pub xquat: Vec<f32>,

    /// Simulation time.
    pub time: f32,

    /// Last applied control vector.
    pub actions: Vec<f32>,
}

impl Observation {
    /// Flattens the observation into a state vector of exactly `dim` entries.
    ///
    /// The layout is `qpos ++ qvel ++ actions`, truncated or zero-padded to
    /// the requested dimension so the policy network input shape never
    /// depends on the environment model.
    pub fn state_vector(&self, dim: usize) -> Vec<f32> {
        let mut v = Vec::with_capacity(dim);
        for x in self
            .qpos
            .iter()
            .chain(self.qvel.iter())
            .chain(self.actions.iter())
        {
            if v.len() == dim {
                break;
            }
            v.push(if x.is_finite() { *x } else { 0.0 });
        }
        v.resize(dim, 0.0);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs() -> Observation {
        Observation {
            qpos: vec![1.0, 2.0],
            qvel: vec![3.0],
            actions: vec![4.0],
            ..Default::default()
        }
    }

    #[test]
    fn state_vector_pads_with_zeros() {
        assert_eq!(obs().state_vector(6), vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.0]);
    }

    #[test]
    fn state_vector_truncates() {
        assert_eq!(obs().state_vector(3), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn state_vector_zeroes_non_finite_entries() {
        let mut o = obs();
        o.qvel[0] = f32::NAN;
        assert_eq!(o.state_vector(4), vec![1.0, 2.0, 0.0, 4.0]);
    }
}
