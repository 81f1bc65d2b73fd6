//! External reward collaborator.
//!
//! The reward function is user-supplied and not trusted to be pure,
//! exception-free or even panic-free. [`evaluate_reward`] isolates every
//! fault: panics and errors are caught, non-finite rewards are coerced to 0,
//! and the episode continues regardless.
use anyhow::Result;
use log::warn;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// What a reward function reports for one `(state, action)` pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RewardSignal {
    /// Reward for the pair.
    pub reward: f32,

    /// Terminal flag, when the reward function also decides termination.
    pub done: Option<bool>,
}

impl From<f32> for RewardSignal {
    fn from(reward: f32) -> Self {
        Self { reward, done: None }
    }
}

/// User-supplied reward function over normalized state/action vectors.
pub type RewardFn = Box<dyn FnMut(&[f32], &[f32]) -> Result<RewardSignal> + Send>;

/// Calls the reward function, containing every possible fault.
///
/// Returns a signal with reward 0 and no terminal flag if the function
/// panics, returns an error, or produces a non-finite reward.
pub fn evaluate_reward(f: &mut RewardFn, state: &[f32], action: &[f32]) -> RewardSignal {
    let outcome = catch_unwind(AssertUnwindSafe(|| f(state, action)));
    match outcome {
        Ok(Ok(signal)) if signal.reward.is_finite() => signal,
        Ok(Ok(signal)) => {
            warn!("reward function returned non-finite reward, coerced to 0");
            RewardSignal {
                reward: 0.0,
                done: signal.done,
            }
        }
        Ok(Err(e)) => {
            warn!("reward function error: {}", e);
            RewardSignal {
                reward: 0.0,
                done: None,
            }
        }
        Err(_) => {
            warn!("reward function panicked");
            RewardSignal {
                reward: 0.0,
                done: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_reward_passes_through() {
        let mut f: RewardFn = Box::new(|s, _a| Ok(RewardSignal::from(s[0] * 2.0)));
        let signal = evaluate_reward(&mut f, &[1.5], &[]);
        assert_eq!(signal.reward, 3.0);
        assert_eq!(signal.done, None);
    }

    #[test]
    fn panicking_reward_is_coerced_to_zero() {
        let mut f: RewardFn = Box::new(|_s, _a| panic!("bad reward"));
        let signal = evaluate_reward(&mut f, &[0.0], &[]);
        assert_eq!(signal.reward, 0.0);
        assert_eq!(signal.done, None);
    }

    #[test]
    fn erroring_reward_is_coerced_to_zero() {
        let mut f: RewardFn = Box::new(|_s, _a| anyhow::bail!("unavailable"));
        assert_eq!(evaluate_reward(&mut f, &[], &[]).reward, 0.0);
    }

    #[test]
    fn nan_reward_is_coerced_but_done_survives() {
        let mut f: RewardFn = Box::new(|_s, _a| {
            Ok(RewardSignal {
                reward: f32::NAN,
                done: Some(true),
            })
        });
        let signal = evaluate_reward(&mut f, &[], &[]);
        assert_eq!(signal.reward, 0.0);
        assert_eq!(signal.done, Some(true));
    }
}
