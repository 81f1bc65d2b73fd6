//! Owns the unit pool and exposes the uniform command surface.
use crate::{router::MessageRouter, unit};
use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver};
use log::info;
use serde::{Deserialize, Serialize};
use simpool_core::engine::EngineFactory;
use simpool_core::{
    Command, EnvId, EnvState, Envelope, Observation, Reply, ReplyKind, SimPoolError, UnitId,
};
use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, Write},
    path::Path,
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::Duration,
};

/// Configuration of [`Orchestrator`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrchestratorConfig {
    /// Number of environments.
    pub num_envs: usize,

    /// Number of simulation units; must not exceed `num_envs`.
    pub num_units: usize,

    /// Environment type passed to the engine factory.
    pub env_type: String,

    /// Unit-side step budget per episode.
    pub episode_limit: u64,

    /// Deadline of every request/response exchange, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            num_envs: 4,
            num_units: 2,
            env_type: "spring_mass".into(),
            episode_limit: 1000,
            request_timeout_ms: 5000,
        }
    }
}

impl OrchestratorConfig {
    /// Sets the number of environments.
    pub fn num_envs(mut self, v: usize) -> Self {
        self.num_envs = v;
        self
    }

    /// Sets the number of units.
    pub fn num_units(mut self, v: usize) -> Self {
        self.num_units = v;
        self
    }

    /// Sets the environment type.
    pub fn env_type(mut self, v: impl Into<String>) -> Self {
        self.env_type = v.into();
        self
    }

    /// Sets the per-episode step budget.
    pub fn episode_limit(mut self, v: u64) -> Self {
        self.episode_limit = v;
        self
    }

    /// Sets the request deadline in milliseconds.
    pub fn request_timeout_ms(mut self, v: u64) -> Self {
        self.request_timeout_ms = v;
        self
    }

    /// Constructs [`OrchestratorConfig`] from a YAML file.
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

/// Deterministic environment → unit partition.
///
/// Blocks of `ceil(num_envs / num_units)` consecutive environment ids map to
/// the same unit. The mapping is a pure function of the three arguments, so
/// it is stable for the orchestrator's lifetime.
pub fn unit_for_env(env_id: EnvId, num_envs: usize, num_units: usize) -> UnitId {
    let per_unit = (num_envs + num_units - 1) / num_units;
    (env_id as usize / per_unit) as UnitId
}

/// Coordinates a fixed pool of isolated simulation units.
///
/// The orchestrator never blocks inside the physics tick; it blocks only in
/// the request/response calls (`initialize`, `reset`, `apply_force`,
/// `query_observation`) through the router's deadline mechanism.
pub struct Orchestrator {
    config: OrchestratorConfig,
    router: Arc<MessageRouter>,
    units: Mutex<Vec<unit::UnitHandle>>,
    envs: Arc<Mutex<HashMap<EnvId, EnvState>>>,
    queued_actions: Mutex<HashMap<EnvId, Vec<f32>>>,
    step_results: Receiver<Envelope<Reply>>,
    resets: Receiver<Envelope<Reply>>,
    errors: Receiver<Envelope<Reply>>,
    reply_pump: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Spawns the unit pool and the reply pump.
    ///
    /// Environments do not exist until [`initialize`](Self::initialize) ran.
    pub fn build(config: OrchestratorConfig, factory: EngineFactory) -> Result<Self> {
        anyhow::ensure!(config.num_units > 0, "need at least one unit");
        anyhow::ensure!(
            config.num_units <= config.num_envs,
            "more units than environments"
        );

        let router = Arc::new(MessageRouter::new(Duration::from_millis(
            config.request_timeout_ms,
        )));

        let (reply_tx, reply_rx) = unbounded::<Envelope<Reply>>();
        let mut units = Vec::with_capacity(config.num_units);
        for unit_id in 0..config.num_units as UnitId {
            let (cmd_tx, cmd_rx) = unbounded();
            let thread = unit::spawn(
                unit_id,
                factory.clone(),
                config.episode_limit,
                cmd_rx,
                reply_tx.clone(),
            );
            units.push(unit::UnitHandle {
                id: unit_id,
                cmd_tx,
                thread: Some(thread),
            });
        }
        // Units hold the only reply senders; the pump exits when the last
        // unit is gone.
        drop(reply_tx);

        let (step_tx, step_results) = unbounded();
        let (reset_tx, resets) = unbounded();
        let (error_tx, errors) = unbounded();
        router.route_unmatched(ReplyKind::StepResult, step_tx);
        router.route_unmatched(ReplyKind::Reset, reset_tx);
        router.route_unmatched(ReplyKind::Error, error_tx);

        let reply_pump = {
            let router = router.clone();
            std::thread::spawn(move || {
                for envelope in reply_rx.iter() {
                    router.dispatch(envelope);
                }
                info!("reply pump stopped");
            })
        };

        info!(
            "orchestrator up: {} environment(s) across {} unit(s)",
            config.num_envs, config.num_units
        );
        Ok(Self {
            config,
            router,
            units: Mutex::new(units),
            envs: Arc::new(Mutex::new(HashMap::new())),
            queued_actions: Mutex::new(HashMap::new()),
            step_results,
            resets,
            errors,
            reply_pump: Mutex::new(Some(reply_pump)),
        })
    }

    /// Creates every environment and waits for all `Initialized` acks.
    ///
    /// Resolves only once each environment's own-id ack arrived; fails if any
    /// unit reports an error for its environment or a request times out.
    pub fn initialize(&self) -> Result<(), SimPoolError> {
        let mut awaiting = Vec::with_capacity(self.config.num_envs);
        for env_id in 0..self.config.num_envs as EnvId {
            let (id, rx) = self.router.register();
            self.send_to_unit(
                env_id,
                Envelope::tagged(
                    id,
                    Command::Init {
                        env_type: self.config.env_type.clone(),
                        env_id,
                    },
                ),
            )?;
            awaiting.push((env_id, rx));
        }

        for (env_id, rx) in awaiting {
            let reply = rx
                .recv()
                .map_err(|_| SimPoolError::ChannelClosed("init reply"))?;
            match reply {
                Ok(Reply::Initialized { env_id: ack }) if ack == env_id => {
                    let unit_id =
                        unit_for_env(env_id, self.config.num_envs, self.config.num_units);
                    self.envs
                        .lock()
                        .unwrap()
                        .insert(env_id, EnvState::new(env_id, unit_id));
                }
                Ok(other) => {
                    return Err(SimPoolError::InitializationFailure {
                        env_id,
                        reason: format!("unexpected ack {:?}", other.kind()),
                    })
                }
                Err(e) => {
                    return Err(SimPoolError::InitializationFailure {
                        env_id,
                        reason: e.to_string(),
                    })
                }
            }
        }
        info!("{} environment(s) initialized", self.config.num_envs);
        Ok(())
    }

    /// Fire-and-forget step of one environment.
    pub fn step_env(&self, env_id: EnvId, actions: Vec<f32>) -> Result<(), SimPoolError> {
        self.send_to_unit(env_id, Envelope::untagged(Command::Step { env_id, actions }))
    }

    /// Fire-and-forget step of every environment.
    ///
    /// Each environment steps with its queued single-use action if one is
    /// pending, otherwise with its actuator commands left as they are.
    /// Results arrive later on the step-result channel and are applied by the
    /// consumption loop.
    pub fn step(&self) -> Result<(), SimPoolError> {
        for env_id in self.env_ids() {
            let actions = self.take_queued_action(env_id).unwrap_or_default();
            self.step_env(env_id, actions)?;
        }
        Ok(())
    }

    /// Resets an environment and returns its fresh observation.
    ///
    /// Bookkeeping is zeroed once the unit confirmed the reset.
    pub fn reset(&self, env_id: EnvId) -> Result<Observation, SimPoolError> {
        self.ensure_known(env_id)?;
        let (id, rx) = self.router.register();
        self.send_to_unit(env_id, Envelope::tagged(id, Command::Reset { env_id }))?;
        let reply = rx
            .recv()
            .map_err(|_| SimPoolError::ChannelClosed("reset reply"))??;
        match reply {
            Reply::Reset { observation, .. } => {
                let mut envs = self.envs.lock().unwrap();
                if let Some(env) = envs.get_mut(&env_id) {
                    env.clear_episode();
                    env.last_observation = observation.clone();
                }
                Ok(observation)
            }
            other => Err(SimPoolError::SimulationFault {
                env_id,
                message: format!("unexpected reset reply {:?}", other.kind()),
                stack: None,
            }),
        }
    }

    /// Records a pending external force on a body of an environment.
    ///
    /// A zero `force` clears the pending force; a non-zero force overwrites
    /// any previous one until the next step consumes and auto-clears it.
    pub fn apply_force(
        &self,
        env_id: EnvId,
        body_id: usize,
        force: [f32; 3],
        point: [f32; 3],
    ) -> Result<bool, SimPoolError> {
        self.ensure_known(env_id)?;
        let (id, rx) = self.router.register();
        self.send_to_unit(
            env_id,
            Envelope::tagged(
                id,
                Command::ApplyForce {
                    env_id,
                    body_id,
                    force,
                    point,
                },
            ),
        )?;
        let reply = rx
            .recv()
            .map_err(|_| SimPoolError::ChannelClosed("apply_force reply"))??;
        match reply {
            Reply::ForceApplied { active, .. } => Ok(active),
            other => Err(SimPoolError::SimulationFault {
                env_id,
                message: format!("unexpected apply_force reply {:?}", other.kind()),
                stack: None,
            }),
        }
    }

    /// Queries the unit-side observation of an environment.
    pub fn query_observation(&self, env_id: EnvId) -> Result<Observation, SimPoolError> {
        self.ensure_known(env_id)?;
        let (id, rx) = self.router.register();
        self.send_to_unit(env_id, Envelope::tagged(id, Command::GetState { env_id }))?;
        let reply = rx
            .recv()
            .map_err(|_| SimPoolError::ChannelClosed("get_state reply"))??;
        match reply {
            Reply::State { observation, .. } => Ok(observation),
            other => Err(SimPoolError::SimulationFault {
                env_id,
                message: format!("unexpected get_state reply {:?}", other.kind()),
                stack: None,
            }),
        }
    }

    /// Zeroes the actuator commands of an environment.
    pub fn clear_actuators(&self, env_id: EnvId) -> Result<(), SimPoolError> {
        self.send_to_unit(env_id, Envelope::untagged(Command::ClearActuators { env_id }))
    }

    /// Snapshot of an environment's coordinator-side state.
    pub fn env_state(&self, env_id: EnvId) -> Result<EnvState, SimPoolError> {
        self.envs
            .lock()
            .unwrap()
            .get(&env_id)
            .cloned()
            .ok_or(SimPoolError::UnknownEnvironment(env_id))
    }

    /// All environment ids, ascending.
    pub fn env_ids(&self) -> Vec<EnvId> {
        let mut ids: Vec<EnvId> = self.envs.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Queues a single-use action, consumed by exactly one physics tick.
    pub fn set_action(&self, env_id: EnvId, action: Vec<f32>) -> Result<(), SimPoolError> {
        self.ensure_known(env_id)?;
        self.queued_actions.lock().unwrap().insert(env_id, action);
        Ok(())
    }

    /// Takes the queued action, if any, consuming it.
    pub fn take_queued_action(&self, env_id: EnvId) -> Option<Vec<f32>> {
        self.queued_actions.lock().unwrap().remove(&env_id)
    }

    /// Channel carrying unsolicited step results, drained by the consumption
    /// loop.
    pub fn step_results(&self) -> Receiver<Envelope<Reply>> {
        self.step_results.clone()
    }

    /// Channel carrying unsolicited reset confirmations.
    pub fn resets(&self) -> Receiver<Envelope<Reply>> {
        self.resets.clone()
    }

    /// Channel carrying unsolicited unit error reports.
    pub fn errors(&self) -> Receiver<Envelope<Reply>> {
        self.errors.clone()
    }

    /// The configuration this orchestrator was built with.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub(crate) fn envs_handle(&self) -> Arc<Mutex<HashMap<EnvId, EnvState>>> {
        self.envs.clone()
    }

    /// Fire-and-forget reset used by the consumption loop's auto-reset path.
    pub(crate) fn reset_async(&self, env_id: EnvId) -> Result<(), SimPoolError> {
        self.send_to_unit(env_id, Envelope::untagged(Command::Reset { env_id }))
    }

    /// Hard-terminates every unit, discarding in-flight work.
    pub fn terminate(&self) {
        info!("terminating orchestrator");
        let mut units = self.units.lock().unwrap();
        for handle in units.drain(..) {
            drop(handle.cmd_tx);
            if let Some(thread) = handle.thread {
                let _ = thread.join();
            }
            info!("unit {} terminated", handle.id);
        }
        drop(units);
        if let Some(pump) = self.reply_pump.lock().unwrap().take() {
            let _ = pump.join();
        }
        self.router.shutdown();
        self.envs.lock().unwrap().clear();
    }

    fn ensure_known(&self, env_id: EnvId) -> Result<(), SimPoolError> {
        if self.envs.lock().unwrap().contains_key(&env_id) {
            Ok(())
        } else {
            Err(SimPoolError::UnknownEnvironment(env_id))
        }
    }

    fn send_to_unit(&self, env_id: EnvId, envelope: Envelope<Command>) -> Result<(), SimPoolError> {
        let unit_id = unit_for_env(env_id, self.config.num_envs, self.config.num_units) as usize;
        let units = self.units.lock().unwrap();
        let handle = units
            .get(unit_id)
            .ok_or(SimPoolError::UnknownEnvironment(env_id))?;
        handle
            .cmd_tx
            .send(envelope)
            .map_err(|_| SimPoolError::ChannelClosed("unit command channel"))
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if !self.units.lock().unwrap().is_empty() {
            self.terminate();
        }
    }
}
