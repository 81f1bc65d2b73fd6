#![warn(missing_docs)]
//! Trainers for the simulation pool.
//!
//! The policy/value math runs on a deliberately small no-backend stack
//! ([`Mat`], [`Mlp`], [`Adam`]); both trainers talk to the pool exclusively
//! through the [`Controller`](simpool_core::Controller) seam and the
//! orchestrator's snapshot/`set_action` surface.
mod evolution;
mod mat;
mod mlp;
mod opt;
mod policy;
mod ppo;

pub use evolution::{EvolutionConfig, PopulationTrainer};
pub use mat::Mat;
pub use mlp::{Mlp, MlpCache, MlpGrads};
pub use opt::Adam;
pub use policy::GaussianPolicy;
pub use ppo::{clipped_objective, Phase, PpoAgent, PpoConfig};
