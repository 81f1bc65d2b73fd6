#![warn(missing_docs)]
//! Core types for running many isolated physics simulations in parallel and
//! training control policies against them.
//!
//! This crate holds everything shared between the orchestrator side
//! (`simpool-orchestrator`) and the trainer side (`simpool-agent`): the
//! closed message contract spoken between the coordinator and its simulation
//! units, the physics-engine interface, per-environment bookkeeping, the
//! rollout buffer used by on-policy training, and the error taxonomy.
pub mod engine;
pub mod error;
pub mod record;

mod control;
mod env_state;
mod msg;
mod observation;
mod reward;
mod rollout;

pub use control::Controller;
pub use env_state::EnvState;
pub use error::SimPoolError;
pub use msg::{Command, CorrelationId, EnvId, Envelope, Reply, ReplyKind, StepInfo, UnitId};
pub use observation::Observation;
pub use reward::{evaluate_reward, RewardFn, RewardSignal};
pub use rollout::{RolloutBuffer, Transition};
