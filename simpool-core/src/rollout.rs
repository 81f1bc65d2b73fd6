//! Rollout buffer for on-policy training.
use serde::{Deserialize, Serialize};

/// One environment transition.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Transition {
    /// State the action was taken in.
    pub state: Vec<f32>,

    /// Action taken.
    pub action: Vec<f32>,

    /// Reward observed after executing the action.
    pub reward: f32,

    /// State after executing the action.
    pub next_state: Vec<f32>,

    /// Whether the episode ended at this transition.
    pub done: bool,

    /// Log-probability of the action under the policy that produced it.
    pub log_prob: f32,

    /// GAE advantage, filled in by [`RolloutBuffer::compute_gae`].
    pub advantage: Option<f32>,

    /// Value regression target, filled in by [`RolloutBuffer::compute_gae`].
    pub value_target: Option<f32>,
}

/// Accumulates transitions for one training iteration.
///
/// The buffer is filled during rollout collection, annotated in one GAE pass,
/// consumed whole by the policy update and then cleared. It is never
/// partially consumed across two updates.
#[derive(Debug, Default)]
pub struct RolloutBuffer {
    transitions: Vec<Transition>,
}

impl RolloutBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a transition, coercing a non-finite reward to 0.
    pub fn push(&mut self, mut t: Transition) {
        if !t.reward.is_finite() {
            t.reward = 0.0;
        }
        self.transitions.push(t);
    }

    /// Number of buffered transitions.
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Buffered transitions in collection order.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Drops all transitions.
    pub fn clear(&mut self) {
        self.transitions.clear();
    }

    /// Annotates every transition with its GAE advantage and value target.
    ///
    /// `values[t]` is the critic's estimate of the state at `t` and must have
    /// the buffer's length; `bootstrap` estimates the state after the last
    /// transition. For `t = T-1 .. 0`:
    ///
    /// ```text
    /// delta_t = r_t + gamma * V(s_{t+1}) * (1 - done_t) - V(s_t)
    /// A_t     = delta_t + gamma * lambda * A_{t+1} * (1 - done_t)
    /// G_t     = A_t + V(s_t)
    /// ```
    pub fn compute_gae(&mut self, values: &[f32], bootstrap: f32, gamma: f32, lambda: f32) {
        assert_eq!(values.len(), self.transitions.len());
        let mut next_advantage = 0.0;
        for t in (0..self.transitions.len()).rev() {
            let not_done = if self.transitions[t].done { 0.0 } else { 1.0 };
            let next_value = if t + 1 < values.len() {
                values[t + 1]
            } else {
                bootstrap
            };
            let delta =
                self.transitions[t].reward + gamma * next_value * not_done - values[t];
            let advantage = delta + gamma * lambda * next_advantage * not_done;
            self.transitions[t].advantage = Some(advantage);
            self.transitions[t].value_target = Some(advantage + values[t]);
            next_advantage = advantage;
        }
    }

    /// Standardizes advantages to zero mean and unit variance over the whole
    /// buffer, stabilized by `eps`.
    pub fn standardize_advantages(&mut self, eps: f32) {
        let advantages: Vec<f32> = self
            .transitions
            .iter()
            .filter_map(|t| t.advantage)
            .collect();
        if advantages.is_empty() {
            return;
        }
        let n = advantages.len() as f32;
        let mean = advantages.iter().sum::<f32>() / n;
        let var = advantages.iter().map(|a| (a - mean) * (a - mean)).sum::<f32>() / n;
        let std = (var + eps).sqrt();
        for t in self.transitions.iter_mut() {
            if let Some(a) = t.advantage {
                t.advantage = Some((a - mean) / std);
            }
        }
    }
}
