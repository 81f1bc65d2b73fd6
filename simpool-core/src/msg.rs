//! Message contract between the orchestrator and its simulation units.
//!
//! Both directions use [`Envelope`], which optionally carries a correlation
//! id. Requests expecting a reply are tagged with an id issued by the router;
//! fire-and-forget commands and unsolicited replies travel untagged.
use crate::Observation;
use serde::{Deserialize, Serialize};

/// Identifies one environment for the lifetime of the orchestrator.
pub type EnvId = u32;

/// Identifies one simulation unit.
pub type UnitId = u32;

/// Pairs an outgoing request with its eventual asynchronous reply.
pub type CorrelationId = u64;

/// A message plus an optional correlation id.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Envelope<T> {
    /// Correlation id, present iff the sender expects a matched reply.
    pub id: Option<CorrelationId>,

    /// Payload.
    pub msg: T,
}

impl<T> Envelope<T> {
    /// Wraps a message that expects a matched reply.
    pub fn tagged(id: CorrelationId, msg: T) -> Self {
        Self { id: Some(id), msg }
    }

    /// Wraps a fire-and-forget message.
    pub fn untagged(msg: T) -> Self {
        Self { id: None, msg }
    }
}

/// Commands a simulation unit accepts.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Command {
    /// Creates the physics-engine instance for an environment.
    Init {
        /// Which environment model to build.
        env_type: String,
        /// Target environment.
        env_id: EnvId,
    },

    /// Advances an environment by one physics step.
    Step {
        /// Target environment.
        env_id: EnvId,
        /// Actuator command vector, one entry per actuator.
        actions: Vec<f32>,
    },

    /// Resets an environment to its initial state.
    Reset {
        /// Target environment.
        env_id: EnvId,
    },

    /// Records a pending external force on a body, consumed at the next step.
    ///
    /// A zero `force` vector clears any pending force for the body.
    ApplyForce {
        /// Target environment.
        env_id: EnvId,
        /// Body index within the environment's model.
        body_id: usize,
        /// Force vector `[fx, fy, fz]`.
        force: [f32; 3],
        /// Application point `[x, y, z]`.
        point: [f32; 3],
    },

    /// Zeroes all actuator commands of an environment.
    ClearActuators {
        /// Target environment.
        env_id: EnvId,
    },

    /// Requests the current observation of an environment.
    GetState {
        /// Target environment.
        env_id: EnvId,
    },
}

impl Command {
    /// The environment this command addresses.
    pub fn env_id(&self) -> EnvId {
        match self {
            Command::Init { env_id, .. }
            | Command::Step { env_id, .. }
            | Command::Reset { env_id }
            | Command::ApplyForce { env_id, .. }
            | Command::ClearActuators { env_id }
            | Command::GetState { env_id } => *env_id,
        }
    }
}

/// Extra per-step information reported alongside an observation.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StepInfo {
    /// Simulation time of the environment after the step.
    pub sim_time: f32,

    /// Steps taken since the last reset, counted unit-side.
    pub unit_step: u64,
}

/// Replies a simulation unit emits.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Reply {
    /// Acknowledges `Init` for the named environment.
    Initialized {
        /// Environment that finished initializing.
        env_id: EnvId,
    },

    /// Outcome of one `Step`.
    StepResult {
        /// Environment that was stepped.
        env_id: EnvId,
        /// Observation after the step.
        observation: Observation,
        /// Unit-side shaped reward for the step.
        reward: f32,
        /// Whether the episode reached a terminal condition.
        done: bool,
        /// Additional step information.
        info: StepInfo,
    },

    /// Outcome of one `Reset`.
    Reset {
        /// Environment that was reset.
        env_id: EnvId,
        /// Observation of the freshly reset environment.
        observation: Observation,
    },

    /// Acknowledges `ApplyForce`.
    ForceApplied {
        /// Body the force was recorded for.
        body_id: usize,
        /// The recorded force vector.
        force: [f32; 3],
        /// `false` when a zero vector cleared the pending force.
        active: bool,
    },

    /// Current observation, in response to `GetState`.
    State {
        /// Queried environment.
        env_id: EnvId,
        /// Its current observation.
        observation: Observation,
    },

    /// A fault raised while handling a command.
    Error {
        /// Environment the fault belongs to.
        env_id: EnvId,
        /// Human-readable fault description.
        error: String,
        /// Backtrace-like context, when available.
        stack: Option<String>,
    },
}

/// Discriminant of [`Reply`], used to key general handlers for replies that
/// match no pending request.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ReplyKind {
    /// [`Reply::Initialized`]
    Initialized,
    /// [`Reply::StepResult`]
    StepResult,
    /// [`Reply::Reset`]
    Reset,
    /// [`Reply::ForceApplied`]
    ForceApplied,
    /// [`Reply::State`]
    State,
    /// [`Reply::Error`]
    Error,
}

impl Reply {
    /// Discriminant of this reply.
    pub fn kind(&self) -> ReplyKind {
        match self {
            Reply::Initialized { .. } => ReplyKind::Initialized,
            Reply::StepResult { .. } => ReplyKind::StepResult,
            Reply::Reset { .. } => ReplyKind::Reset,
            Reply::ForceApplied { .. } => ReplyKind::ForceApplied,
            Reply::State { .. } => ReplyKind::State,
            Reply::Error { .. } => ReplyKind::Error,
        }
    }

    /// The environment this reply concerns, if any.
    pub fn env_id(&self) -> Option<EnvId> {
        match self {
            Reply::Initialized { env_id }
            | Reply::StepResult { env_id, .. }
            | Reply::Reset { env_id, .. }
            | Reply::State { env_id, .. }
            | Reply::Error { env_id, .. } => Some(*env_id),
            Reply::ForceApplied { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_env_id_covers_all_variants() {
        let cmds = vec![
            Command::Init {
                env_type: "spring_mass".into(),
                env_id: 3,
            },
            Command::Step {
                env_id: 3,
                actions: vec![0.0],
            },
            Command::Reset { env_id: 3 },
            Command::ApplyForce {
                env_id: 3,
                body_id: 0,
                force: [1.0, 0.0, 0.0],
                point: [0.0; 3],
            },
            Command::ClearActuators { env_id: 3 },
            Command::GetState { env_id: 3 },
        ];
        for cmd in cmds {
            assert_eq!(cmd.env_id(), 3);
        }
    }

    #[test]
    fn reply_kind_matches_variant() {
        let reply = Reply::Error {
            env_id: 1,
            error: "boom".into(),
            stack: None,
        };
        assert_eq!(reply.kind(), ReplyKind::Error);
        assert_eq!(reply.env_id(), Some(1));

        let reply = Reply::ForceApplied {
            body_id: 2,
            force: [0.0; 3],
            active: false,
        };
        assert_eq!(reply.kind(), ReplyKind::ForceApplied);
        assert_eq!(reply.env_id(), None);
    }
}
