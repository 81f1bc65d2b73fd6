//! Seam between the scheduler and whatever chooses actions.
use crate::EnvState;

/// Chooses actions for environments and consumes their step snapshots.
///
/// The physics loop asks a controller for an action each tick; the
/// consumption loop hands every applied step result back as a snapshot.
/// Trainers implement this trait without seeing the orchestrator's internals,
/// and the scheduler falls back to uniform-random actions whenever
/// [`action`](Self::action) declines.
pub trait Controller: Send {
    /// Proposes an action for the environment, or `None` to let the caller
    /// fall back to its default.
    fn action(&mut self, env: &EnvState) -> Option<Vec<f32>>;

    /// Consumes a post-step snapshot. Default: ignore.
    fn observe(&mut self, env: &EnvState) {
        let _ = env;
    }
}
