//! Simulation unit: one thread, one engine instance per hosted environment.
use crossbeam_channel::{Receiver, Sender};
use log::{error, info};
use simpool_core::engine::{EngineFactory, PhysicsEngine};
use simpool_core::{Command, EnvId, Envelope, Reply, SimPoolError, StepInfo, UnitId};
use std::{collections::HashMap, thread::JoinHandle};

/// A running unit thread plus its command channel.
pub(crate) struct UnitHandle {
    pub id: UnitId,
    pub cmd_tx: Sender<Envelope<Command>>,
    pub thread: Option<JoinHandle<()>>,
}

/// Spawns a unit thread draining `cmd_rx` until the channel closes.
pub(crate) fn spawn(
    id: UnitId,
    factory: EngineFactory,
    episode_limit: u64,
    cmd_rx: Receiver<Envelope<Command>>,
    reply_tx: Sender<Envelope<Reply>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        Unit::new(id, factory, episode_limit).run(cmd_rx, reply_tx);
    })
}

struct HostedEnv {
    engine: Box<dyn PhysicsEngine>,
    step_count: u64,
    /// Pending external forces keyed by body, applied at the next step and
    /// auto-cleared afterwards.
    pending_forces: HashMap<usize, ([f32; 3], [f32; 3])>,
}

/// One isolated execution context.
///
/// Commands are processed strictly serially; two environments hosted on the
/// same unit never simulate concurrently. The unit shares no memory with the
/// coordinator — everything crossing the boundary is an owned message.
pub(crate) struct Unit {
    id: UnitId,
    factory: EngineFactory,
    episode_limit: u64,
    envs: HashMap<EnvId, HostedEnv>,
}

impl Unit {
    pub(crate) fn new(id: UnitId, factory: EngineFactory, episode_limit: u64) -> Self {
        Self {
            id,
            factory,
            episode_limit,
            envs: HashMap::new(),
        }
    }

    fn run(mut self, cmd_rx: Receiver<Envelope<Command>>, reply_tx: Sender<Envelope<Reply>>) {
        info!("unit {} started", self.id);
        for envelope in cmd_rx.iter() {
            let id = envelope.id;
            if let Some(reply) = self.handle(envelope.msg) {
                if reply_tx.send(Envelope { id, msg: reply }).is_err() {
                    // Coordinator is gone; nothing left to do.
                    break;
                }
            }
        }
        info!("unit {} stopped, {} environment(s) discarded", self.id, self.envs.len());
    }

    /// Handles one command, returning the reply to send (if any).
    ///
    /// Faults never leave this function as anything but [`Reply::Error`]; a
    /// fault in one environment must not take down the unit or its siblings.
    pub(crate) fn handle(&mut self, cmd: Command) -> Option<Reply> {
        let env_id = cmd.env_id();
        match self.try_handle(cmd) {
            Ok(reply) => reply,
            Err(e) => {
                error!("unit {}: fault in environment {}: {}", self.id, env_id, e);
                Some(Reply::Error {
                    env_id,
                    error: e.to_string(),
                    stack: None,
                })
            }
        }
    }

    fn try_handle(&mut self, cmd: Command) -> Result<Option<Reply>, SimPoolError> {
        match cmd {
            Command::Init { env_type, env_id } => {
                let engine = (self.factory)(&env_type, env_id)?;
                self.envs.insert(
                    env_id,
                    HostedEnv {
                        engine,
                        step_count: 0,
                        pending_forces: HashMap::new(),
                    },
                );
                Ok(Some(Reply::Initialized { env_id }))
            }

            Command::Step { env_id, actions } => {
                let limit = self.episode_limit;
                let env = self.hosted(env_id)?;

                {
                    let ctrl = env.engine.ctrl_mut();
                    let n = ctrl.len().min(actions.len());
                    ctrl[..n].copy_from_slice(&actions[..n]);
                }

                // Pending forces are consumed by exactly one step.
                for (body_id, (force, _point)) in env.pending_forces.iter() {
                    let xfrc = env.engine.xfrc_applied_mut();
                    if 6 * body_id + 3 <= xfrc.len() {
                        xfrc[6 * body_id..6 * body_id + 3].copy_from_slice(force);
                    }
                }

                let step_outcome = env.engine.step();

                let xfrc = env.engine.xfrc_applied_mut();
                xfrc.iter_mut().for_each(|f| *f = 0.0);
                env.pending_forces.clear();

                step_outcome?;
                env.step_count += 1;
                let done = env.engine.terminated() || env.step_count >= limit;
                Ok(Some(Reply::StepResult {
                    env_id,
                    observation: env.engine.observation(),
                    reward: env.engine.reward(),
                    done,
                    info: StepInfo {
                        sim_time: env.engine.time(),
                        unit_step: env.step_count,
                    },
                }))
            }

            Command::Reset { env_id } => {
                let env = self.hosted(env_id)?;
                env.engine.reset_data();
                env.engine.forward();
                env.step_count = 0;
                env.pending_forces.clear();
                Ok(Some(Reply::Reset {
                    env_id,
                    observation: env.engine.observation(),
                }))
            }

            Command::ApplyForce {
                env_id,
                body_id,
                force,
                point,
            } => {
                let env = self.hosted(env_id)?;
                let active = force != [0.0; 3];
                if active {
                    env.pending_forces.insert(body_id, (force, point));
                } else {
                    env.pending_forces.remove(&body_id);
                    let xfrc = env.engine.xfrc_applied_mut();
                    if 6 * body_id + 3 <= xfrc.len() {
                        xfrc[6 * body_id..6 * body_id + 3].copy_from_slice(&[0.0; 3]);
                    }
                }
                Ok(Some(Reply::ForceApplied {
                    body_id,
                    force,
                    active,
                }))
            }

            Command::ClearActuators { env_id } => {
                let env = self.hosted(env_id)?;
                env.engine.ctrl_mut().iter_mut().for_each(|c| *c = 0.0);
                Ok(None)
            }

            Command::GetState { env_id } => {
                let env = self.hosted(env_id)?;
                Ok(Some(Reply::State {
                    env_id,
                    observation: env.engine.observation(),
                }))
            }
        }
    }

    fn hosted(&mut self, env_id: EnvId) -> Result<&mut HostedEnv, SimPoolError> {
        self.envs
            .get_mut(&env_id)
            .ok_or(SimPoolError::UnknownEnvironment(env_id))
    }

    #[cfg(test)]
    fn pending_force_count(&self, env_id: EnvId) -> usize {
        self.envs
            .get(&env_id)
            .map(|e| e.pending_forces.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simpool_core::engine::builtin_factory;

    fn unit_with_env(env_id: EnvId) -> Unit {
        let mut unit = Unit::new(0, builtin_factory(), 1000);
        let reply = unit
            .handle(Command::Init {
                env_type: "spring_mass".into(),
                env_id,
            })
            .unwrap();
        assert!(matches!(reply, Reply::Initialized { env_id: e } if e == env_id));
        unit
    }

    fn step(unit: &mut Unit, env_id: EnvId) -> Reply {
        unit.handle(Command::Step {
            env_id,
            actions: vec![0.0; 9],
        })
        .unwrap()
    }

    #[test]
    fn unknown_environment_yields_error_reply() {
        let mut unit = Unit::new(0, builtin_factory(), 1000);
        match unit.handle(Command::Reset { env_id: 9 }) {
            Some(Reply::Error { env_id, .. }) => assert_eq!(env_id, 9),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unknown_env_type_fails_init() {
        let mut unit = Unit::new(0, builtin_factory(), 1000);
        match unit.handle(Command::Init {
            env_type: "hexapod".into(),
            env_id: 0,
        }) {
            Some(Reply::Error { env_id, .. }) => assert_eq!(env_id, 0),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn step_counts_and_reports_done_at_episode_limit() {
        let mut unit = Unit::new(0, builtin_factory(), 3);
        unit.handle(Command::Init {
            env_type: "spring_mass".into(),
            env_id: 0,
        });
        for expected_done in [false, false, true] {
            match step(&mut unit, 0) {
                Reply::StepResult { done, .. } => assert_eq!(done, expected_done),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn pending_force_is_consumed_by_exactly_one_step() {
        let mut unit = unit_with_env(0);
        unit.handle(Command::ApplyForce {
            env_id: 0,
            body_id: 1,
            force: [5.0, 0.0, 0.0],
            point: [0.0; 3],
        });
        assert_eq!(unit.pending_force_count(0), 1);
        step(&mut unit, 0);
        // Consumed and auto-cleared; the next step sees no residual force.
        assert_eq!(unit.pending_force_count(0), 0);
    }

    #[test]
    fn zero_force_clears_the_pending_entry() {
        let mut unit = unit_with_env(0);
        unit.handle(Command::ApplyForce {
            env_id: 0,
            body_id: 1,
            force: [5.0, 0.0, 0.0],
            point: [0.0; 3],
        });
        match unit.handle(Command::ApplyForce {
            env_id: 0,
            body_id: 1,
            force: [0.0; 3],
            point: [0.0; 3],
        }) {
            Some(Reply::ForceApplied { active, .. }) => assert!(!active),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(unit.pending_force_count(0), 0);
        // One tick later nothing is recorded for the body either.
        step(&mut unit, 0);
        assert_eq!(unit.pending_force_count(0), 0);
    }

    #[test]
    fn non_zero_force_overwrites_the_previous_one() {
        let mut unit = unit_with_env(0);
        for force in [[1.0, 0.0, 0.0], [2.0, 0.0, 0.0]] {
            unit.handle(Command::ApplyForce {
                env_id: 0,
                body_id: 1,
                force,
                point: [0.0; 3],
            });
        }
        assert_eq!(unit.pending_force_count(0), 1);
    }

    #[test]
    fn reset_zeroes_the_unit_side_counters() {
        let mut unit = unit_with_env(0);
        for _ in 0..5 {
            step(&mut unit, 0);
        }
        match unit.handle(Command::Reset { env_id: 0 }).unwrap() {
            Reply::Reset { env_id, .. } => assert_eq!(env_id, 0),
            other => panic!("unexpected: {:?}", other),
        }
        match step(&mut unit, 0) {
            Reply::StepResult { info, .. } => assert_eq!(info.unit_step, 1),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn clear_actuators_has_no_reply() {
        let mut unit = unit_with_env(0);
        assert!(unit.handle(Command::ClearActuators { env_id: 0 }).is_none());
    }
}
