//! Per-environment bookkeeping owned by the consumption loop.
use crate::{EnvId, Observation, UnitId};

/// Mutable state of one environment, as seen by the coordinator.
///
/// Created at `initialize`, mutated only by the consumption loop and the
/// auto-reset path, and removed at teardown. Trainers read clones of this
/// struct; they never touch the unit-side state directly.
#[derive(Clone, Debug)]
pub struct EnvState {
    /// Environment id.
    pub id: EnvId,

    /// Unit hosting this environment, fixed for the orchestrator's lifetime.
    pub unit_id: UnitId,

    /// Most recent observation, stale until the first step result arrives.
    pub last_observation: Observation,

    /// Reward of the most recent step.
    pub last_reward: f32,

    /// Whether the current episode reached a terminal condition.
    pub done: bool,

    /// Steps applied in the current episode.
    pub step_count: u64,

    /// Sum of rewards over the current episode.
    pub episode_reward: f32,
}

impl EnvState {
    /// Fresh bookkeeping for an environment hosted on `unit_id`.
    pub fn new(id: EnvId, unit_id: UnitId) -> Self {
        Self {
            id,
            unit_id,
            last_observation: Observation::default(),
            last_reward: 0.0,
            done: false,
            step_count: 0,
            episode_reward: 0.0,
        }
    }

    /// Applies one step result.
    ///
    /// Non-finite rewards are coerced to 0 so episode accumulators stay
    /// finite no matter what the unit reported.
    pub fn apply_step(&mut self, observation: Observation, reward: f32, done: bool) {
        let reward = if reward.is_finite() { reward } else { 0.0 };
        self.last_observation = observation;
        self.last_reward = reward;
        self.done = done;
        self.step_count += 1;
        self.episode_reward += reward;
    }

    /// Zeroes the episode counters, keeping the observation until the reset
    /// reply overwrites it.
    pub fn clear_episode(&mut self) {
        self.last_reward = 0.0;
        self.done = false;
        self.step_count = 0;
        self.episode_reward = 0.0;
    }
}
