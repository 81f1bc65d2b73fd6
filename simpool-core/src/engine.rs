//! Contract the orchestrator uses to talk to a physics engine.
//!
//! The engine's internal numerical integration is out of scope; only the
//! surface a simulation unit drives is specified here. [`SpringMass`] is a
//! small built-in implementation used by tests and demos.
mod spring_mass;

pub use spring_mass::{SpringMass, SpringMassConfig};

use crate::{Observation, SimPoolError};
use std::sync::Arc;

/// One simulated body system.
///
/// A unit owns exactly one instance per hosted environment and drives it
/// serially. Mutable array accessors mirror the engine contract: generalized
/// coordinates `qpos`/`qvel`, actuator commands `ctrl`, per-body Cartesian
/// poses `xpos`/`xquat`, and an external-force array with 6 lanes per body
/// (force + torque).
pub trait PhysicsEngine: Send {
    /// Number of generalized coordinates.
    fn nq(&self) -> usize;

    /// Number of generalized velocities.
    fn nv(&self) -> usize;

    /// Number of actuators.
    fn nu(&self) -> usize;

    /// Number of bodies.
    fn nbody(&self) -> usize;

    /// Advances the simulation by one internal timestep.
    fn step(&mut self) -> Result<(), SimPoolError>;

    /// Restores the initial state.
    fn reset_data(&mut self);

    /// Recomputes derived quantities (`xpos`, `xquat`) from `qpos`.
    fn forward(&mut self);

    /// Generalized positions.
    fn qpos(&self) -> &[f32];

    /// Generalized velocities.
    fn qvel(&self) -> &[f32];

    /// Actuator commands.
    fn ctrl(&self) -> &[f32];

    /// Actuator commands, written before [`step`](Self::step).
    fn ctrl_mut(&mut self) -> &mut [f32];

    /// Cartesian body positions, 3 per body.
    fn xpos(&self) -> &[f32];

    /// Body orientations, 4 per body.
    fn xquat(&self) -> &[f32];

    /// External forces, 6 lanes per body; consumed by the next step.
    fn xfrc_applied_mut(&mut self) -> &mut [f32];

    /// Simulation time.
    fn time(&self) -> f32;

    /// Shaped per-step reward of the environment model.
    fn reward(&self) -> f32 {
        0.0
    }

    /// Whether the model reached a terminal condition on its own.
    fn terminated(&self) -> bool {
        false
    }

    /// Builds the observation record for the current state.
    fn observation(&self) -> Observation {
        let xpos = self.xpos();
        let body_pos = if xpos.len() >= 3 {
            [xpos[0], xpos[1], xpos[2]]
        } else {
            [0.0; 3]
        };
        Observation {
            body_pos,
            qpos: self.qpos().to_vec(),
            qvel: self.qvel().to_vec(),
            xpos: xpos.to_vec(),
            xquat: self.xquat().to_vec(),
            time: self.time(),
            actions: self.ctrl().to_vec(),
        }
    }
}

/// Builds engine instances from an environment type name.
///
/// Units hold one factory and call it once per hosted environment during
/// `Init`.
pub type EngineFactory =
    Arc<dyn Fn(&str, crate::EnvId) -> Result<Box<dyn PhysicsEngine>, SimPoolError> + Send + Sync>;

/// Factory covering the built-in models.
///
/// Currently `"spring_mass"` is the only built-in environment type.
pub fn builtin_factory() -> EngineFactory {
    Arc::new(|env_type, env_id| match env_type {
        "spring_mass" => Ok(Box::new(SpringMass::new(SpringMassConfig::default(), env_id as u64))),
        other => Err(SimPoolError::InitializationFailure {
            env_id,
            reason: format!("unknown environment type {:?}", other),
        }),
    })
}
