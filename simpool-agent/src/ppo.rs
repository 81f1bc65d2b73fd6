//! Proximal policy optimization with generalized advantage estimation.
use crate::policy::{log_prob_of, LOG_STD_MAX, LOG_STD_MIN};
use crate::{Adam, GaussianPolicy, Mat, Mlp, MlpGrads};
use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use simpool_core::record::{Record, RecordValue};
use simpool_core::{evaluate_reward, Controller, EnvId, EnvState, RewardFn, RolloutBuffer, Transition};
use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

/// Configuration of [`PpoAgent`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PpoConfig {
    /// Fixed policy input dimension; observations are padded/truncated to it.
    pub state_dim: usize,

    /// Action dimension.
    pub action_dim: usize,

    /// Hidden layer sizes of both networks.
    pub hidden: Vec<usize>,

    /// Discount factor.
    pub gamma: f32,

    /// GAE lambda.
    pub lambda: f32,

    /// Clip range of the surrogate ratio.
    pub clip_eps: f32,

    /// Optimization epochs per update.
    pub epochs: usize,

    /// Actor learning rate.
    pub lr_actor: f32,

    /// Critic learning rate.
    pub lr_critic: f32,

    /// Transitions collected before each update.
    pub rollout_len: usize,

    /// Stabilizer for advantage standardization.
    pub adv_eps: f32,

    /// Initial log standard deviation of the policy.
    pub log_std_init: f32,

    /// Seed for network initialization and action sampling.
    pub seed: u64,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            state_dim: 24,
            action_dim: 9,
            hidden: vec![64, 64],
            gamma: 0.99,
            lambda: 0.95,
            clip_eps: 0.2,
            epochs: 4,
            lr_actor: 3e-4,
            lr_critic: 1e-3,
            rollout_len: 256,
            adv_eps: 1e-8,
            log_std_init: -0.5,
            seed: 0,
        }
    }
}

impl PpoConfig {
    /// Sets the state dimension.
    pub fn state_dim(mut self, v: usize) -> Self {
        self.state_dim = v;
        self
    }

    /// Sets the action dimension.
    pub fn action_dim(mut self, v: usize) -> Self {
        self.action_dim = v;
        self
    }

    /// Sets the hidden layer sizes.
    pub fn hidden(mut self, v: Vec<usize>) -> Self {
        self.hidden = v;
        self
    }

    /// Sets the rollout length.
    pub fn rollout_len(mut self, v: usize) -> Self {
        self.rollout_len = v;
        self
    }

    /// Sets the update epoch count.
    pub fn epochs(mut self, v: usize) -> Self {
        self.epochs = v;
        self
    }

    /// Sets the seed.
    pub fn seed(mut self, v: u64) -> Self {
        self.seed = v;
        self
    }

    /// Constructs [`PpoConfig`] from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let config = serde_yaml::from_reader(rdr)?;
        Ok(config)
    }

    /// Saves the configuration as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

/// Where the agent currently is in its cyclic training loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Buffering transitions.
    CollectingRollout,

    /// Running the GAE pass.
    ComputingAdvantages,

    /// Running clipped-surrogate / value-regression epochs.
    UpdatingPolicy,
}

/// The clipped surrogate objective for a single ratio/advantage pair.
///
/// `min(ratio * A, clamp(ratio, 1-eps, 1+eps) * A)`; the PPO actor loss is
/// the negated mean of this over the batch.
pub fn clipped_objective(ratio: f32, advantage: f32, eps: f32) -> f32 {
    let unclipped = ratio * advantage;
    let clipped = ratio.clamp(1.0 - eps, 1.0 + eps) * advantage;
    unclipped.min(clipped)
}

struct PendingStep {
    state: Vec<f32>,
    action: Vec<f32>,
    log_prob: f32,
}

/// On-policy PPO trainer driving environments through the controller seam.
///
/// The cycle is [`Phase::CollectingRollout`] →
/// [`Phase::ComputingAdvantages`] → [`Phase::UpdatingPolicy`] and back; the
/// buffered transitions are consumed whole by each update, never split across
/// two. Each environment collects into its own rollout buffer, since the GAE
/// recursion runs along one trajectory; buffers are concatenated only after
/// every advantage is annotated. Rewards pair the state/action taken at `t`
/// with the reward observed after `t` executed, since that value only exists
/// one step later.
pub struct PpoAgent {
    config: PpoConfig,
    actor: GaussianPolicy,
    critic: Mlp,
    opt_actor: Adam,
    opt_critic: Adam,
    buffers: HashMap<EnvId, RolloutBuffer>,
    reward_fn: RewardFn,
    pending: HashMap<EnvId, PendingStep>,
    phase: Phase,
    train_mode: bool,
    updates: usize,
    reinits: usize,
    last_record: Record,
}

impl PpoAgent {
    /// Builds actor, critic and their optimizers.
    pub fn new(config: PpoConfig, reward_fn: RewardFn) -> Self {
        let actor = GaussianPolicy::new(
            config.state_dim,
            &config.hidden,
            config.action_dim,
            config.log_std_init,
            config.seed,
        );
        let critic = Self::build_critic(&config);
        let n_actor = actor.net().n_params() + config.action_dim;
        let n_critic = critic.n_params();
        Self {
            opt_actor: Adam::new(n_actor, config.lr_actor),
            opt_critic: Adam::new(n_critic, config.lr_critic),
            actor,
            critic,
            buffers: HashMap::new(),
            reward_fn,
            pending: HashMap::new(),
            phase: Phase::CollectingRollout,
            train_mode: true,
            updates: 0,
            reinits: 0,
            last_record: Record::empty(),
            config,
        }
    }

    fn build_critic(config: &PpoConfig) -> Mlp {
        let mut dims = Vec::with_capacity(config.hidden.len() + 2);
        dims.push(config.state_dim);
        dims.extend_from_slice(&config.hidden);
        dims.push(1);
        Mlp::new(&dims, config.seed.wrapping_add(1))
    }

    /// Switches to training mode (stochastic actions, updates enabled).
    pub fn train(&mut self) {
        self.train_mode = true;
    }

    /// Switches to evaluation mode (deterministic mean, no updates).
    pub fn eval(&mut self) {
        self.train_mode = false;
    }

    /// Whether the agent is in training mode.
    pub fn is_train(&self) -> bool {
        self.train_mode
    }

    /// Current phase of the training cycle.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Completed optimization updates.
    pub fn updates(&self) -> usize {
        self.updates
    }

    /// How often the actor was rebuilt after divergence.
    pub fn reinits(&self) -> usize {
        self.reinits
    }

    /// Number of buffered transitions across all environments.
    pub fn buffer_len(&self) -> usize {
        self.buffers.values().map(RolloutBuffer::len).sum()
    }

    /// Metrics of the most recent update.
    pub fn last_record(&self) -> &Record {
        &self.last_record
    }

    fn flat_actor_params(&self) -> Vec<f32> {
        let mut flat = self.actor.net().params();
        flat.extend_from_slice(self.actor.log_std());
        flat
    }

    fn set_flat_actor_params(&mut self, flat: &[f32]) {
        let n_net = self.actor.net().n_params();
        self.actor.net_mut().set_params(&flat[..n_net]);
        self.actor
            .log_std_mut()
            .copy_from_slice(&flat[n_net..]);
    }

    /// Rebuilds the actor and its optimizer from scratch.
    ///
    /// Non-finite parameters would otherwise poison every subsequent action
    /// sample and update.
    fn reinit_actor(&mut self) {
        self.reinits += 1;
        let seed = self
            .config
            .seed
            .wrapping_add(1000)
            .wrapping_add(self.reinits as u64);
        warn!(
            "policy diverged ({} non-finite values), reinitializing actor",
            self.actor.count_non_finite()
        );
        self.actor = GaussianPolicy::new(
            self.config.state_dim,
            &self.config.hidden,
            self.config.action_dim,
            self.config.log_std_init,
            seed,
        );
        self.opt_actor.reset();
        self.pending.clear();
        self.buffers.clear();
    }

    /// Writes the actor and critic weights under `dir`.
    pub fn save_params(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let actor_path = dir.join("actor.bincode");
        let critic_path = dir.join("critic.bincode");
        self.actor.save(&actor_path)?;
        self.critic.save(&critic_path)?;
        info!("saved model parameters under {}", dir.display());
        Ok(vec![actor_path, critic_path])
    }

    /// Loads pretrained actor and critic weights from `dir`.
    ///
    /// The stored architectures must match the configured ones. Optimizer
    /// moments are dropped, as they belong to the discarded parameters.
    pub fn load_params(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let actor = GaussianPolicy::load(dir.join("actor.bincode"), self.config.seed)?;
        let critic = Mlp::load(dir.join("critic.bincode"))?;
        anyhow::ensure!(
            actor.net().dims() == self.actor.net().dims(),
            "actor architecture mismatch: stored {:?}, configured {:?}",
            actor.net().dims(),
            self.actor.net().dims()
        );
        anyhow::ensure!(
            critic.dims() == self.critic.dims(),
            "critic architecture mismatch: stored {:?}, configured {:?}",
            critic.dims(),
            self.critic.dims()
        );
        self.actor = actor;
        self.critic = critic;
        self.opt_actor.reset();
        self.opt_critic.reset();
        info!("loaded model parameters from {}", dir.display());
        Ok(())
    }

    /// Squashes each component into `(-1, 1)` for the reward collaborator.
    fn normalize(v: &[f32]) -> Vec<f32> {
        v.iter().map(|x| x / (1.0 + x.abs())).collect()
    }

    /// Runs the GAE pass within each environment's buffer, then concatenates
    /// the annotated trajectories into one batch, environments in ascending
    /// id order.
    fn gae_batch(&mut self) -> RolloutBuffer {
        let mut per_env: Vec<(EnvId, RolloutBuffer)> = self.buffers.drain().collect();
        per_env.sort_unstable_by_key(|(env_id, _)| *env_id);

        let mut batch = RolloutBuffer::new();
        for (_, buffer) in per_env.iter_mut() {
            let values: Vec<f32> = buffer
                .transitions()
                .iter()
                .map(|t| self.critic.forward(&Mat::from(t.state.clone())).data[0])
                .collect();
            let bootstrap = match buffer.transitions().last() {
                Some(t) if !t.done => {
                    self.critic.forward(&Mat::from(t.next_state.clone())).data[0]
                }
                _ => 0.0,
            };
            buffer.compute_gae(&values, bootstrap, self.config.gamma, self.config.lambda);
            for t in buffer.transitions() {
                batch.push(t.clone());
            }
        }
        batch
    }

    /// One full update: per-environment GAE pass, standardization over the
    /// whole batch, then clipped-surrogate and value-regression epochs.
    /// `gae_batch` drains the per-environment buffers.
    fn update(&mut self) {
        self.phase = Phase::ComputingAdvantages;
        let mut batch = self.gae_batch();
        batch.standardize_advantages(self.config.adv_eps);

        self.phase = Phase::UpdatingPolicy;
        let mut actor_loss = 0.0;
        let mut critic_loss = 0.0;
        for _ in 0..self.config.epochs {
            actor_loss = self.actor_epoch(&batch);
            critic_loss = self.critic_epoch(&batch);
        }

        self.updates += 1;
        self.phase = Phase::CollectingRollout;

        let mut record = Record::from_scalar("actor_loss", actor_loss);
        record.insert("critic_loss", RecordValue::Scalar(critic_loss));
        record.insert("opt_steps", RecordValue::Scalar(self.updates as f32));
        info!(
            "ppo update {}: actor_loss {:.4}, critic_loss {:.4}",
            self.updates, actor_loss, critic_loss
        );
        self.last_record = record;
    }

    /// One clipped-surrogate epoch over the batch; returns the loss.
    fn actor_epoch(&mut self, batch: &RolloutBuffer) -> f32 {
        let n = batch.len() as f32;
        let mut net_grads = MlpGrads::zeros_like(self.actor.net());
        let mut log_std_grads = vec![0.0f32; self.config.action_dim];
        let mut loss = 0.0;
        let std = self.actor.std();
        let eps = self.config.clip_eps;

        for t in batch.transitions() {
            let advantage = t.advantage.unwrap_or(0.0);
            let fwd = self.actor.forward(&t.state);
            let new_log_prob = log_prob_of(&fwd.mean, &std, &t.action);
            let ratio = (new_log_prob - t.log_prob).exp();
            loss += -clipped_objective(ratio, advantage, eps) / n;

            // Outside the clip region the objective is flat in the
            // parameters; the gradient contribution is zero.
            let clipped_out = (advantage >= 0.0 && ratio > 1.0 + eps)
                || (advantage < 0.0 && ratio < 1.0 - eps);
            if clipped_out || !ratio.is_finite() {
                continue;
            }
            let d_log_prob = -advantage * ratio / n;

            let mut grad_z = Vec::with_capacity(self.config.action_dim);
            for k in 0..self.config.action_dim {
                let zk = (t.action[k] - fwd.mean[k]) / std[k];
                // d logp / d mean, chained through the tanh bound.
                let d_mean = zk / std[k];
                grad_z.push(d_log_prob * d_mean * (1.0 - fwd.mean[k] * fwd.mean[k]));
                // d logp / d log_std, gated by the clamp.
                let raw = self.actor.log_std()[k];
                if (LOG_STD_MIN..=LOG_STD_MAX).contains(&raw) {
                    log_std_grads[k] += d_log_prob * (zk * zk - 1.0);
                }
            }
            let grads = self.actor.net().backward(&fwd.cache, &Mat::from(grad_z));
            net_grads.add_scaled(&grads, 1.0);
        }

        let mut flat = self.flat_actor_params();
        let mut flat_grads = net_grads.flat();
        flat_grads.extend_from_slice(&log_std_grads);
        self.opt_actor.step(&mut flat, &flat_grads);
        self.set_flat_actor_params(&flat);
        loss
    }

    /// One value-regression epoch over the batch; returns the MSE loss.
    fn critic_epoch(&mut self, batch: &RolloutBuffer) -> f32 {
        let n = batch.len() as f32;
        let mut grads = MlpGrads::zeros_like(&self.critic);
        let mut loss = 0.0;

        for t in batch.transitions() {
            let target = t.value_target.unwrap_or(0.0);
            let (out, cache) = self.critic.forward_cached(&Mat::from(t.state.clone()));
            let v = out.data[0];
            loss += (v - target) * (v - target) / n;
            let d_v = 2.0 * (v - target) / n;
            let g = self.critic.backward(&cache, &Mat::from(vec![d_v]));
            grads.add_scaled(&g, 1.0);
        }

        let mut flat = self.critic.params();
        self.opt_critic.step(&mut flat, &grads.flat());
        self.critic.set_params(&flat);
        loss
    }
}

impl Controller for PpoAgent {
    fn action(&mut self, env: &EnvState) -> Option<Vec<f32>> {
        // Numerical safety: never sample from a diverged policy.
        if self.actor.count_non_finite() > 0 {
            self.reinit_actor();
        }

        let state = env.last_observation.state_vector(self.config.state_dim);
        let (action, log_prob) = self.actor.sample(&state, !self.train_mode);
        self.pending.insert(
            env.id,
            PendingStep {
                state,
                action: action.clone(),
                log_prob,
            },
        );
        Some(action)
    }

    fn observe(&mut self, env: &EnvState) {
        let pending = match self.pending.remove(&env.id) {
            Some(p) => p,
            None => return,
        };
        // Evaluation runs collect nothing; buffering here would grow without
        // bound since no update ever drains it.
        if !self.train_mode {
            return;
        }

        let next_state = env.last_observation.state_vector(self.config.state_dim);
        let signal = evaluate_reward(
            &mut self.reward_fn,
            &Self::normalize(&next_state),
            &Self::normalize(&pending.action),
        );
        let done = env.done || signal.done.unwrap_or(false);

        self.buffers.entry(env.id).or_default().push(Transition {
            state: pending.state,
            action: pending.action,
            reward: signal.reward,
            next_state,
            done,
            log_prob: pending.log_prob,
            advantage: None,
            value_target: None,
        });

        if self.buffer_len() >= self.config.rollout_len {
            self.update();
        }
    }
}
