//! The two periodic loops decoupling physics from consumption.
use crate::Orchestrator;
use anyhow::Result;
use crossbeam_channel::tick;
use log::{error, warn};
use serde::{Deserialize, Serialize};
use simpool_core::{Controller, EnvState, Reply};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::Duration,
};

/// Configuration of [`Scheduler`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SchedulerConfig {
    /// Physics tick frequency in Hz.
    pub physics_rate: f64,

    /// Consumption tick frequency in Hz; typically well below the physics
    /// rate.
    pub render_rate: f64,

    /// Length of the action vector sent to every environment.
    pub action_dim: usize,

    /// Standard deviation of the exploration noise added to policy actions.
    pub explore_std: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            physics_rate: 60.0,
            render_rate: 20.0,
            action_dim: 9,
            explore_std: 0.1,
        }
    }
}

impl SchedulerConfig {
    /// Sets the physics tick frequency.
    pub fn physics_rate(mut self, v: f64) -> Self {
        self.physics_rate = v;
        self
    }

    /// Sets the consumption tick frequency.
    pub fn render_rate(mut self, v: f64) -> Self {
        self.render_rate = v;
        self
    }

    /// Sets the action vector length.
    pub fn action_dim(mut self, v: usize) -> Self {
        self.action_dim = v;
        self
    }

    /// Sets the exploration noise scale.
    pub fn explore_std(mut self, v: f32) -> Self {
        self.explore_std = v;
        self
    }

    /// Constructs [`SchedulerConfig`] from a YAML file.
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

/// Snapshot callback invoked by the consumption loop after each applied step.
pub type UpdateCallback = Box<dyn Fn(&EnvState) + Send>;

/// Runs the physics loop and the consumption loop on their own threads.
///
/// The physics loop fires one `Step` per environment per tick and never
/// waits for replies; the consumption loop drains the buffered results,
/// applies them to the environment table in drain order and auto-resets
/// finished episodes. Stopping the scheduler is one of the two cancellation
/// primitives (the other being unit termination).
pub struct Scheduler {
    stop: Arc<Mutex<bool>>,
    threads: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Starts both loops.
    ///
    /// `controller` proposes actions and consumes snapshots; `on_update` is
    /// an optional extra observer of applied step results.
    pub fn start(
        orchestrator: Arc<Orchestrator>,
        controller: Arc<Mutex<dyn Controller>>,
        on_update: Option<UpdateCallback>,
        config: SchedulerConfig,
    ) -> Self {
        let stop = Arc::new(Mutex::new(false));
        let mut threads = Vec::with_capacity(2);

        {
            let orchestrator = orchestrator.clone();
            let controller = controller.clone();
            let stop = stop.clone();
            let config = config.clone();
            threads.push(std::thread::spawn(move || {
                Self::run_physics_loop(orchestrator, controller, stop, config);
            }));
        }
        {
            let stop = stop.clone();
            threads.push(std::thread::spawn(move || {
                Self::run_consumption_loop(orchestrator, controller, on_update, stop, config);
            }));
        }

        Self { stop, threads }
    }

    /// Signals both loops to stop after their current tick.
    pub fn stop(&self) {
        *self.stop.lock().unwrap() = true;
    }

    /// Stops and joins both loops.
    pub fn stop_and_join(mut self) {
        self.stop();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }

    /// Selects the next action for one environment by priority: queued
    /// single-use action, then policy output with exploration noise, then
    /// uniform random.
    fn select_action(
        orchestrator: &Orchestrator,
        controller: &Mutex<dyn Controller>,
        env: &EnvState,
        config: &SchedulerConfig,
    ) -> Vec<f32> {
        if let Some(action) = orchestrator.take_queued_action(env.id) {
            return action;
        }

        if let Some(mut action) = controller.lock().unwrap().action(env) {
            for a in action.iter_mut() {
                *a = (*a + config.explore_std * gaussian()).clamp(-1.0, 1.0);
            }
            action.resize(config.action_dim, 0.0);
            return action;
        }

        (0..config.action_dim)
            .map(|_| fastrand::f32() * 2.0 - 1.0)
            .collect()
    }

    fn run_physics_loop(
        orchestrator: Arc<Orchestrator>,
        controller: Arc<Mutex<dyn Controller>>,
        stop: Arc<Mutex<bool>>,
        config: SchedulerConfig,
    ) {
        let ticker = tick(Duration::from_secs_f64(1.0 / config.physics_rate));
        loop {
            let _ = ticker.recv();
            if *stop.lock().unwrap() {
                break;
            }

            for env_id in orchestrator.env_ids() {
                let env = match orchestrator.env_state(env_id) {
                    Ok(env) => env,
                    Err(_) => continue,
                };
                let action = Self::select_action(&orchestrator, &controller, &env, &config);
                // Fire-and-forget; the tick never blocks on unit replies.
                if let Err(e) = orchestrator.step_env(env_id, action) {
                    warn!("environment {}: step not sent: {}", env_id, e);
                }
            }
        }
    }

    fn run_consumption_loop(
        orchestrator: Arc<Orchestrator>,
        controller: Arc<Mutex<dyn Controller>>,
        on_update: Option<UpdateCallback>,
        stop: Arc<Mutex<bool>>,
        config: SchedulerConfig,
    ) {
        let ticker = tick(Duration::from_secs_f64(1.0 / config.render_rate));
        let step_results = orchestrator.step_results();
        let resets = orchestrator.resets();
        let errors = orchestrator.errors();
        let envs = orchestrator.envs_handle();

        loop {
            let _ = ticker.recv();
            if *stop.lock().unwrap() {
                break;
            }

            // Swap out everything buffered up to now and apply it in drain
            // order. Ordering across environments is unspecified.
            let mut finished = Vec::new();
            for envelope in step_results.try_iter() {
                if let Reply::StepResult {
                    env_id,
                    observation,
                    reward,
                    done,
                    ..
                } = envelope.msg
                {
                    let snapshot = {
                        let mut envs = envs.lock().unwrap();
                        match envs.get_mut(&env_id) {
                            Some(env) => {
                                env.apply_step(observation, reward, done);
                                Some(env.clone())
                            }
                            None => None,
                        }
                    };
                    if let Some(snapshot) = snapshot {
                        controller.lock().unwrap().observe(&snapshot);
                        if let Some(cb) = on_update.as_ref() {
                            cb(&snapshot);
                        }
                        if done {
                            finished.push(env_id);
                        }
                    }
                }
            }

            for env_id in finished {
                {
                    let mut envs = envs.lock().unwrap();
                    if let Some(env) = envs.get_mut(&env_id) {
                        env.clear_episode();
                    }
                }
                if let Err(e) = orchestrator.reset_async(env_id) {
                    warn!("environment {}: auto-reset not sent: {}", env_id, e);
                }
            }

            for envelope in resets.try_iter() {
                if let Reply::Reset {
                    env_id,
                    observation,
                } = envelope.msg
                {
                    let mut envs = envs.lock().unwrap();
                    if let Some(env) = envs.get_mut(&env_id) {
                        env.last_observation = observation;
                        env.done = false;
                    }
                }
            }

            for envelope in errors.try_iter() {
                if let Reply::Error { env_id, error, .. } = envelope.msg {
                    // The environment keeps its last-known state; it stays
                    // enumerable until explicitly reset or torn down.
                    error!("environment {}: simulation fault: {}", env_id, error);
                }
            }
        }
    }
}

/// Standard normal sample via Box–Muller over `fastrand`.
fn gaussian() -> f32 {
    let u1 = fastrand::f32().max(1e-7);
    let u2 = fastrand::f32();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}
