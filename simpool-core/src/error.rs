//! Error taxonomy of the simulation pool.
use crate::{CorrelationId, EnvId};
use thiserror::Error;

/// Faults raised by the orchestrator, its units and the trainers.
///
/// Every variant is local to one environment or one request; none of them
/// aborts the periodic loops for other environments.
#[derive(Debug, Error)]
pub enum SimPoolError {
    /// A unit never acknowledged `Init` for an environment.
    #[error("environment {env_id} failed to initialize: {reason}")]
    InitializationFailure {
        /// Environment that failed to come up.
        env_id: EnvId,
        /// Unit-reported reason, or the timeout description.
        reason: String,
    },

    /// No reply arrived within the request deadline.
    #[error("request {id} timed out after {timeout_ms} ms")]
    CommandTimeout {
        /// Correlation id of the expired request.
        id: CorrelationId,
        /// Deadline that was exceeded.
        timeout_ms: u64,
    },

    /// A unit faulted while handling step/reset/force.
    #[error("simulation fault in environment {env_id}: {message}")]
    SimulationFault {
        /// Environment the fault belongs to.
        env_id: EnvId,
        /// Unit-reported message.
        message: String,
        /// Backtrace-like context, when the unit could capture one.
        stack: Option<String>,
    },

    /// The external reward function panicked, errored or returned a
    /// non-finite value.
    #[error("reward function fault: {0}")]
    RewardFunctionFault(String),

    /// Non-finite values were found in policy parameters.
    #[error("policy diverged: {0} non-finite parameter(s)")]
    PolicyDivergence(usize),

    /// A command addressed an environment the receiver does not host.
    #[error("unknown environment {0}")]
    UnknownEnvironment(EnvId),

    /// A channel endpoint disappeared, typically during teardown.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}
