#![warn(missing_docs)]
//! Coordination core: isolated simulation units behind an asynchronous
//! message router, plus the periodic loops that drive them.
//!
//! # Structure
//!
//! * [`MessageRouter`] pairs outgoing requests with their asynchronous
//!   replies via correlation ids and per-request deadlines.
//! * Each simulation unit is an OS thread owning one physics-engine instance
//!   per hosted environment; the only channel across the boundary is
//!   message passing with owned payloads.
//! * [`Orchestrator`] owns the unit pool, the router and the environment
//!   table, and exposes the uniform command surface.
//! * [`Scheduler`] runs the high-rate physics tick and the lower-rate
//!   consumption tick as independent periodic loops.
mod orchestrator;
mod router;
mod scheduler;
mod unit;

pub use orchestrator::{unit_for_env, Orchestrator, OrchestratorConfig};
pub use router::MessageRouter;
pub use scheduler::{Scheduler, SchedulerConfig};
