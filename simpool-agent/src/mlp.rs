//! Multilayer perceptron with a manual backward pass.
use crate::Mat;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// ReLU-activated MLP with a linear output layer.
///
/// Small enough that a hand-written backward pass beats dragging in a tensor
/// backend; the flat parameter view doubles as the genome representation for
/// the population-search trainer.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Mlp {
    dims: Vec<usize>,
    ws: Vec<Mat>,
    bs: Vec<Mat>,
}

/// Per-layer activations recorded by [`Mlp::forward_cached`].
pub struct MlpCache {
    /// Input plus the post-activation output of every layer.
    activations: Vec<Mat>,
}

/// Parameter gradients produced by [`Mlp::backward`].
pub struct MlpGrads {
    /// Weight gradients, one per layer.
    pub ws: Vec<Mat>,

    /// Bias gradients, one per layer.
    pub bs: Vec<Mat>,
}

impl MlpGrads {
    /// Zero gradients shaped like `mlp`.
    pub fn zeros_like(mlp: &Mlp) -> Self {
        Self {
            ws: mlp.ws.iter().map(|w| Mat::zeros(w.rows(), w.cols())).collect(),
            bs: mlp.bs.iter().map(|b| Mat::zeros(b.rows(), b.cols())).collect(),
        }
    }

    /// Accumulates another gradient, scaled.
    pub fn add_scaled(&mut self, other: &MlpGrads, s: f32) {
        for (a, b) in self.ws.iter_mut().zip(other.ws.iter()) {
            a.add_scaled(b, s);
        }
        for (a, b) in self.bs.iter_mut().zip(other.bs.iter()) {
            a.add_scaled(b, s);
        }
    }

    /// Flattens in the same order as [`Mlp::params`].
    pub fn flat(&self) -> Vec<f32> {
        let mut out = Vec::new();
        for (w, b) in self.ws.iter().zip(self.bs.iter()) {
            out.extend_from_slice(&w.data);
            out.extend_from_slice(&b.data);
        }
        out
    }
}

impl Mlp {
    /// Builds a network with layer sizes `dims`, He-initialized.
    ///
    /// `dims` runs `[input, hidden.., output]` and needs at least two
    /// entries.
    pub fn new(dims: &[usize], seed: u64) -> Self {
        assert!(dims.len() >= 2, "an MLP needs input and output dims");
        let rng = fastrand::Rng::with_seed(seed);
        let mut ws = Vec::with_capacity(dims.len() - 1);
        let mut bs = Vec::with_capacity(dims.len() - 1);
        for pair in dims.windows(2) {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let std = (2.0 / fan_in as f32).sqrt();
            ws.push(Mat::randn(fan_out, fan_in, std, &rng));
            bs.push(Mat::zeros(fan_out, 1));
        }
        Self {
            dims: dims.to_vec(),
            ws,
            bs,
        }
    }

    /// Input dimension.
    pub fn input_dim(&self) -> usize {
        self.dims[0]
    }

    /// Output dimension.
    pub fn output_dim(&self) -> usize {
        *self.dims.last().unwrap()
    }

    /// Layer sizes.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Forward pass on a column vector.
    pub fn forward(&self, x: &Mat) -> Mat {
        let n_layers = self.ws.len();
        let mut x = x.clone();
        for i in 0..n_layers {
            x = self.ws[i].matmul(&x).add(&self.bs[i]);
            if i != n_layers - 1 {
                x = x.relu();
            }
        }
        x
    }

    /// Forward pass recording the activations the backward pass needs.
    pub fn forward_cached(&self, x: &Mat) -> (Mat, MlpCache) {
        let n_layers = self.ws.len();
        let mut activations = Vec::with_capacity(n_layers + 1);
        activations.push(x.clone());
        let mut x = x.clone();
        for i in 0..n_layers {
            x = self.ws[i].matmul(&x).add(&self.bs[i]);
            if i != n_layers - 1 {
                x = x.relu();
            }
            activations.push(x.clone());
        }
        let out = x;
        (out, MlpCache { activations })
    }

    /// Backward pass from `grad_out` (gradient w.r.t. the linear output).
    pub fn backward(&self, cache: &MlpCache, grad_out: &Mat) -> MlpGrads {
        let n_layers = self.ws.len();
        let mut grads = MlpGrads::zeros_like(self);
        let mut delta = grad_out.clone();

        for i in (0..n_layers).rev() {
            // For hidden layers the cached activation is post-ReLU; its
            // derivative is 1 where the activation is positive.
            if i != n_layers - 1 {
                let post = &cache.activations[i + 1];
                let mask = post.map_relu_mask();
                delta = delta.hadamard(&mask);
            }
            let input = &cache.activations[i];
            grads.ws[i] = delta.matmul(&input.transpose());
            grads.bs[i] = delta.clone();
            if i > 0 {
                delta = self.ws[i].transpose().matmul(&delta);
            }
        }
        grads
    }

    /// Applies a gradient step `params -= lr * grads` elementwise; used only
    /// by tests, real updates go through the optimizer on the flat view.
    pub fn apply_grads(&mut self, grads: &MlpGrads, lr: f32) {
        for (w, g) in self.ws.iter_mut().zip(grads.ws.iter()) {
            w.add_scaled(g, -lr);
        }
        for (b, g) in self.bs.iter_mut().zip(grads.bs.iter()) {
            b.add_scaled(g, -lr);
        }
    }

    /// Total parameter count.
    pub fn n_params(&self) -> usize {
        self.ws.iter().map(|w| w.data.len()).sum::<usize>()
            + self.bs.iter().map(|b| b.data.len()).sum::<usize>()
    }

    /// Flat parameter view, layer by layer, weights before biases.
    pub fn params(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.n_params());
        for (w, b) in self.ws.iter().zip(self.bs.iter()) {
            out.extend_from_slice(&w.data);
            out.extend_from_slice(&b.data);
        }
        out
    }

    /// Overwrites all parameters from a flat slice.
    pub fn set_params(&mut self, flat: &[f32]) {
        assert_eq!(flat.len(), self.n_params(), "parameter count mismatch");
        let mut offset = 0;
        for (w, b) in self.ws.iter_mut().zip(self.bs.iter_mut()) {
            let nw = w.data.len();
            w.data.copy_from_slice(&flat[offset..offset + nw]);
            offset += nw;
            let nb = b.data.len();
            b.data.copy_from_slice(&flat[offset..offset + nb]);
            offset += nb;
        }
    }

    /// Writes the network (architecture and parameters) as a bincode file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, bincode::serialize(self)?)?;
        Ok(())
    }

    /// Reads a network back from a bincode file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let buf = fs::read(path)?;
        let mlp = bincode::deserialize(&buf[..])?;
        Ok(mlp)
    }

    /// Number of non-finite parameters.
    pub fn count_non_finite(&self) -> usize {
        self.ws
            .iter()
            .chain(self.bs.iter())
            .flat_map(|m| m.data.iter())
            .filter(|v| !v.is_finite())
            .count()
    }
}

impl Mat {
    /// 1 where the entry is positive, 0 elsewhere.
    fn map_relu_mask(&self) -> Mat {
        Mat {
            data: self
                .data
                .iter()
                .map(|a| if *a > 0.0 { 1.0 } else { 0.0 })
                .collect(),
            shape: self.shape,
        }
    }
}
