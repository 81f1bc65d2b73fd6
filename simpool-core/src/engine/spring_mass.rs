//! Built-in reference engine: damped point masses on springs.
//!
//! Cheap enough to step thousands of times in a unit test, yet exercising the
//! whole engine contract (generalized coordinates, actuators, external
//! forces, instability faults).
use super::PhysicsEngine;
use crate::SimPoolError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Parameters of the [`SpringMass`] model.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SpringMassConfig {
    /// Number of point masses.
    pub nbody: usize,

    /// Integration timestep.
    pub dt: f32,

    /// Mass per body.
    pub mass: f32,

    /// Spring stiffness pulling each body toward its rest position.
    pub stiffness: f32,

    /// Velocity damping coefficient.
    pub damping: f32,

    /// Force produced by a saturated actuator command.
    pub ctrl_gain: f32,

    /// Displacement beyond which the episode terminates.
    pub bound: f32,
}

impl Default for SpringMassConfig {
    fn default() -> Self {
        Self {
            nbody: 3,
            dt: 0.01,
            mass: 1.0,
            stiffness: 10.0,
            damping: 0.5,
            ctrl_gain: 5.0,
            bound: 50.0,
        }
    }
}

impl SpringMassConfig {
    /// Constructs [`SpringMassConfig`] from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let config = serde_yaml::from_reader(rdr)?;
        Ok(config)
    }

    /// Saves the configuration as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

/// Damped spring-mass system with one 3-DOF point mass per body.
///
/// Each body is tethered to a rest position along the x axis. Actuators apply
/// a per-DOF force clipped to `[-1, 1]` times the gain; the external-force
/// array contributes its force lanes directly.
pub struct SpringMass {
    config: SpringMassConfig,
    seed: u64,
    time: f32,
    qpos: Vec<f32>,
    qvel: Vec<f32>,
    ctrl: Vec<f32>,
    xpos: Vec<f32>,
    xquat: Vec<f32>,
    xfrc_applied: Vec<f32>,
    rest: Vec<f32>,
}

impl SpringMass {
    /// Builds the model and seeds the initial perturbation.
    pub fn new(config: SpringMassConfig, seed: u64) -> Self {
        let n = config.nbody;
        let mut rest = vec![0.0; 3 * n];
        for i in 0..n {
            rest[3 * i] = i as f32;
        }
        let mut engine = Self {
            config,
            seed,
            time: 0.0,
            qpos: vec![0.0; 3 * n],
            qvel: vec![0.0; 3 * n],
            ctrl: vec![0.0; 3 * n],
            xpos: vec![0.0; 3 * n],
            xquat: vec![0.0; 4 * n],
            xfrc_applied: vec![0.0; 6 * n],
            rest,
        };
        engine.reset_data();
        engine
    }

    fn displacement(&self) -> f32 {
        self.qpos
            .iter()
            .zip(self.rest.iter())
            .map(|(q, r)| (q - r).abs())
            .fold(0.0f32, f32::max)
    }
}

impl PhysicsEngine for SpringMass {
    fn nq(&self) -> usize {
        3 * self.config.nbody
    }

    fn nv(&self) -> usize {
        3 * self.config.nbody
    }

    fn nu(&self) -> usize {
        3 * self.config.nbody
    }

    fn nbody(&self) -> usize {
        self.config.nbody
    }

    fn step(&mut self) -> Result<(), SimPoolError> {
        let dt = self.config.dt;
        let inv_m = 1.0 / self.config.mass;

        // Semi-implicit Euler over every DOF.
        for i in 0..self.qpos.len() {
            let body = i / 3;
            let lane = i % 3;
            let spring = -self.config.stiffness * (self.qpos[i] - self.rest[i]);
            let damp = -self.config.damping * self.qvel[i];
            let ctrl = self.ctrl[i].clamp(-1.0, 1.0) * self.config.ctrl_gain;
            let external = self.xfrc_applied[6 * body + lane];
            let force = spring + damp + ctrl + external;
            self.qvel[i] += dt * force * inv_m;
            self.qpos[i] += dt * self.qvel[i];
        }
        self.time += dt;
        self.forward();

        if self.qpos.iter().any(|q| !q.is_finite()) {
            return Err(SimPoolError::SimulationFault {
                env_id: 0,
                message: "non-finite state after integration".into(),
                stack: None,
            });
        }
        Ok(())
    }

    fn reset_data(&mut self) {
        let rng = fastrand::Rng::with_seed(self.seed);
        for (q, r) in self.qpos.iter_mut().zip(self.rest.iter()) {
            *q = r + 0.1 * (rng.f32() - 0.5);
        }
        self.qvel.iter_mut().for_each(|v| *v = 0.0);
        self.ctrl.iter_mut().for_each(|c| *c = 0.0);
        self.xfrc_applied.iter_mut().for_each(|f| *f = 0.0);
        self.time = 0.0;
        self.forward();
    }

    fn forward(&mut self) {
        self.xpos.copy_from_slice(&self.qpos);
        for i in 0..self.config.nbody {
            self.xquat[4 * i] = 1.0;
            self.xquat[4 * i + 1] = 0.0;
            self.xquat[4 * i + 2] = 0.0;
            self.xquat[4 * i + 3] = 0.0;
        }
    }

    fn qpos(&self) -> &[f32] {
        &self.qpos
    }

    fn qvel(&self) -> &[f32] {
        &self.qvel
    }

    fn ctrl(&self) -> &[f32] {
        &self.ctrl
    }

    fn ctrl_mut(&mut self) -> &mut [f32] {
        &mut self.ctrl
    }

    fn xpos(&self) -> &[f32] {
        &self.xpos
    }

    fn xquat(&self) -> &[f32] {
        &self.xquat
    }

    fn xfrc_applied_mut(&mut self) -> &mut [f32] {
        &mut self.xfrc_applied
    }

    fn time(&self) -> f32 {
        self.time
    }

    fn reward(&self) -> f32 {
        let vel: f32 = self.qvel.iter().map(|v| v * v).sum::<f32>().sqrt();
        1.0 - 0.1 * self.displacement() - 0.01 * vel
    }

    fn terminated(&self) -> bool {
        self.displacement() > self.config.bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn config_round_trips_through_yaml() {
        let config = SpringMassConfig {
            nbody: 5,
            dt: 0.002,
            ..Default::default()
        };
        let dir = TempDir::new("spring_mass").unwrap();
        let path = dir.path().join("spring_mass.yaml");
        config.save(&path).unwrap();
        assert_eq!(SpringMassConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn settles_toward_rest_without_control() {
        let mut engine = SpringMass::new(SpringMassConfig::default(), 7);
        let start = engine.displacement();
        for _ in 0..2000 {
            engine.step().unwrap();
        }
        assert!(engine.displacement() < start);
        assert!(engine.displacement() < 1e-2);
    }

    #[test]
    fn reset_data_restores_seeded_state() {
        let mut engine = SpringMass::new(SpringMassConfig::default(), 7);
        let initial = engine.qpos().to_vec();
        for _ in 0..50 {
            engine.step().unwrap();
        }
        engine.reset_data();
        assert_eq!(engine.qpos(), initial.as_slice());
        assert_eq!(engine.time(), 0.0);
    }

    #[test]
    fn external_force_moves_the_body() {
        let mut engine = SpringMass::new(SpringMassConfig::default(), 7);
        let before = engine.qvel()[0];
        engine.xfrc_applied_mut()[0] = 100.0;
        engine.step().unwrap();
        assert!(engine.qvel()[0] > before);
    }

    #[test]
    fn observation_has_contract_shapes() {
        let engine = SpringMass::new(SpringMassConfig::default(), 7);
        let obs = engine.observation();
        assert_eq!(obs.qpos.len(), 9);
        assert_eq!(obs.xpos.len(), 9);
        assert_eq!(obs.xquat.len(), 12);
        assert_eq!(obs.actions.len(), 9);
    }
}
