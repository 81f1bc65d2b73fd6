//! Diagonal Gaussian policy with a bounded mean.
use crate::mat::gaussian;
use crate::{Mat, Mlp, MlpCache};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Clamp range of the learnable log standard deviation.
pub(crate) const LOG_STD_MIN: f32 = -3.0;
pub(crate) const LOG_STD_MAX: f32 = 1.0;

const HALF_LN_2PI: f32 = 0.918_938_5;

/// Gaussian policy `a ~ N(tanh(net(s)), exp(log_std)^2)`.
///
/// The mean is bounded by a tanh head so the policy cannot command actuator
/// values outside `[-1, 1]` in expectation; the per-dimension log standard
/// deviation is a learned parameter clamped to a sane range before use.
#[derive(Clone, Debug)]
pub struct GaussianPolicy {
    net: Mlp,
    log_std: Vec<f32>,
    rng: fastrand::Rng,
}

/// Serialized form of a policy: everything but the sampling rng.
#[derive(Deserialize, Serialize)]
struct PolicyParams {
    net: Mlp,
    log_std: Vec<f32>,
}

/// Cached forward state needed to differentiate a log-probability.
pub(crate) struct PolicyForward {
    pub cache: MlpCache,
    /// Bounded mean `tanh(z)`.
    pub mean: Vec<f32>,
}

impl GaussianPolicy {
    /// Builds the policy network `[state_dim, hidden.., action_dim]`.
    pub fn new(state_dim: usize, hidden: &[usize], action_dim: usize, log_std_init: f32, seed: u64) -> Self {
        let mut dims = Vec::with_capacity(hidden.len() + 2);
        dims.push(state_dim);
        dims.extend_from_slice(hidden);
        dims.push(action_dim);
        Self {
            net: Mlp::new(&dims, seed),
            log_std: vec![log_std_init; action_dim],
            rng: fastrand::Rng::with_seed(seed ^ 0x5eed),
        }
    }

    /// Action dimension.
    pub fn action_dim(&self) -> usize {
        self.net.output_dim()
    }

    /// The underlying mean network.
    pub fn net(&self) -> &Mlp {
        &self.net
    }

    /// Mutable access for optimizer updates.
    pub fn net_mut(&mut self) -> &mut Mlp {
        &mut self.net
    }

    /// Learned log standard deviations (unclamped storage).
    pub fn log_std(&self) -> &[f32] {
        &self.log_std
    }

    /// Mutable log standard deviations.
    pub fn log_std_mut(&mut self) -> &mut [f32] {
        &mut self.log_std
    }

    /// Per-dimension standard deviation after clamping.
    pub fn std(&self) -> Vec<f32> {
        self.log_std
            .iter()
            .map(|l| l.clamp(LOG_STD_MIN, LOG_STD_MAX).exp())
            .collect()
    }

    /// Number of non-finite values across all parameters.
    pub fn count_non_finite(&self) -> usize {
        self.net.count_non_finite()
            + self.log_std.iter().filter(|v| !v.is_finite()).count()
    }

    pub(crate) fn forward(&self, state: &[f32]) -> PolicyForward {
        let (z, cache) = self.net.forward_cached(&Mat::from(state.to_vec()));
        PolicyForward {
            cache,
            mean: z.data.iter().map(|v| v.tanh()).collect(),
        }
    }

    /// Samples an action and its log-probability.
    ///
    /// In deterministic mode the bounded mean is returned unchanged, with the
    /// log-probability of the mean itself.
    pub fn sample(&mut self, state: &[f32], deterministic: bool) -> (Vec<f32>, f32) {
        let fwd = self.forward(state);
        let std = self.std();
        let action: Vec<f32> = if deterministic {
            fwd.mean.clone()
        } else {
            fwd.mean
                .iter()
                .zip(std.iter())
                .map(|(m, s)| m + s * gaussian(&self.rng))
                .collect()
        };
        let log_prob = log_prob_of(&fwd.mean, &std, &action);
        (action, log_prob)
    }

    /// Writes the network and log standard deviations as a bincode file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let params = PolicyParams {
            net: self.net.clone(),
            log_std: self.log_std.clone(),
        };
        fs::write(path, bincode::serialize(&params)?)?;
        Ok(())
    }

    /// Reads a policy back from a bincode file, reseeding the sampler.
    pub fn load(path: impl AsRef<Path>, seed: u64) -> Result<Self> {
        let buf = fs::read(path)?;
        let params: PolicyParams = bincode::deserialize(&buf[..])?;
        anyhow::ensure!(
            params.log_std.len() == params.net.output_dim(),
            "log_std length {} does not match action dimension {}",
            params.log_std.len(),
            params.net.output_dim()
        );
        Ok(Self {
            net: params.net,
            log_std: params.log_std,
            rng: fastrand::Rng::with_seed(seed ^ 0x5eed),
        })
    }
}

/// Log-density of a diagonal Gaussian.
pub(crate) fn log_prob_of(mean: &[f32], std: &[f32], action: &[f32]) -> f32 {
    mean.iter()
        .zip(std.iter())
        .zip(action.iter())
        .map(|((m, s), a)| {
            let z = (a - m) / s;
            -0.5 * z * z - s.ln() - HALF_LN_2PI
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_prob_matches_manual_density() {
        // Standard normal at its mean: -0.5*ln(2*pi) per dimension.
        let lp = log_prob_of(&[0.0, 0.0], &[1.0, 1.0], &[0.0, 0.0]);
        assert!((lp + 2.0 * HALF_LN_2PI).abs() < 1e-5);

        // One-dimensional, one sigma away.
        let lp = log_prob_of(&[1.0], &[0.5], &[1.5]);
        let expected = -0.5 - (0.5f32).ln() - HALF_LN_2PI;
        assert!((lp - expected).abs() < 1e-5);
    }

    #[test]
    fn deterministic_sample_is_the_bounded_mean() {
        let mut policy = GaussianPolicy::new(4, &[8], 2, -0.5, 3);
        let state = vec![0.3, -0.1, 0.7, 0.0];
        let (a1, _) = policy.sample(&state, true);
        let (a2, _) = policy.sample(&state, true);
        assert_eq!(a1, a2);
        assert!(a1.iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn stochastic_samples_differ() {
        let mut policy = GaussianPolicy::new(4, &[8], 2, -0.5, 3);
        let state = vec![0.3, -0.1, 0.7, 0.0];
        let (a1, lp1) = policy.sample(&state, false);
        let (a2, _) = policy.sample(&state, false);
        assert_ne!(a1, a2);
        assert!(lp1.is_finite());
    }

    #[test]
    fn policy_round_trips_through_bincode() {
        let mut policy = GaussianPolicy::new(4, &[8], 2, -0.5, 3);
        policy.log_std_mut()[1] = -1.25;
        let dir = tempdir::TempDir::new("policy").unwrap();
        let path = dir.path().join("actor.bincode");
        policy.save(&path).unwrap();

        let loaded = GaussianPolicy::load(&path, 3).unwrap();
        assert_eq!(loaded.net().params(), policy.net().params());
        assert_eq!(loaded.log_std(), policy.log_std());
        let state = vec![0.3, -0.1, 0.7, 0.0];
        assert_eq!(
            loaded.clone().sample(&state, true),
            policy.sample(&state, true)
        );
    }

    #[test]
    fn log_std_is_clamped_before_use() {
        let mut policy = GaussianPolicy::new(2, &[4], 1, 0.0, 0);
        policy.log_std_mut()[0] = 100.0;
        assert!((policy.std()[0] - LOG_STD_MAX.exp()).abs() < 1e-5);
    }
}
