//! Minimal dense matrix, enough for small policy networks.
use serde::{Deserialize, Serialize};

/// A row-major dense matrix of `f32`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Mat {
    /// Elements, row-major.
    pub data: Vec<f32>,

    /// `[rows, cols]`.
    pub shape: [usize; 2],
}

impl Mat {
    /// A `rows x cols` matrix of zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            shape: [rows, cols],
        }
    }

    /// A matrix with entries drawn from `N(0, std^2)`.
    pub fn randn(rows: usize, cols: usize, std: f32, rng: &fastrand::Rng) -> Self {
        let data = (0..rows * cols).map(|_| std * gaussian(rng)).collect();
        Self {
            data,
            shape: [rows, cols],
        }
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.shape[1]
    }

    /// Matrix product `self * x`.
    pub fn matmul(&self, x: &Mat) -> Self {
        assert_eq!(
            self.cols(),
            x.rows(),
            "matmul shape mismatch: {:?} x {:?}",
            self.shape,
            x.shape
        );
        let (m, l, n) = (self.rows(), self.cols(), x.cols());
        let mut data = vec![0.0f32; m * n];
        for i in 0..m {
            for k in 0..l {
                let a = self.data[i * l + k];
                for j in 0..n {
                    data[i * n + j] += a * x.data[k * n + j];
                }
            }
        }
        Self {
            data,
            shape: [m, n],
        }
    }

    /// Elementwise sum.
    pub fn add(&self, x: &Mat) -> Self {
        assert_eq!(self.shape, x.shape, "add shape mismatch");
        self.zip(x, |a, b| a + b)
    }

    /// Elementwise (Hadamard) product.
    pub fn hadamard(&self, x: &Mat) -> Self {
        assert_eq!(self.shape, x.shape, "hadamard shape mismatch");
        self.zip(x, |a, b| a * b)
    }

    /// Rectified linear unit.
    pub fn relu(&self) -> Self {
        self.map(|a| if a < 0.0 { 0.0 } else { a })
    }

    /// Transpose.
    pub fn transpose(&self) -> Self {
        let (m, n) = (self.rows(), self.cols());
        let mut data = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                data[j * m + i] = self.data[i * n + j];
            }
        }
        Self {
            data,
            shape: [n, m],
        }
    }

    /// Accumulates `x` scaled by `s` into `self`.
    pub fn add_scaled(&mut self, x: &Mat, s: f32) {
        assert_eq!(self.shape, x.shape, "add_scaled shape mismatch");
        for (a, b) in self.data.iter_mut().zip(x.data.iter()) {
            *a += s * b;
        }
    }

    fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            data: self.data.iter().map(|a| f(*a)).collect(),
            shape: self.shape,
        }
    }

    fn zip(&self, x: &Mat, f: impl Fn(f32, f32) -> f32) -> Self {
        Self {
            data: self
                .data
                .iter()
                .zip(x.data.iter())
                .map(|(a, b)| f(*a, *b))
                .collect(),
            shape: self.shape,
        }
    }
}

impl From<Vec<f32>> for Mat {
    /// A column vector.
    fn from(x: Vec<f32>) -> Self {
        let shape = [x.len(), 1];
        Self { data: x, shape }
    }
}

/// Standard normal sample via Box–Muller.
pub(crate) fn gaussian(rng: &fastrand::Rng) -> f32 {
    let u1 = rng.f32().max(1e-7);
    let u2 = rng.f32();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_known_values() {
        let a = Mat {
            data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            shape: [2, 3],
        };
        let x = Mat::from(vec![1.0, 0.0, -1.0]);
        let y = a.matmul(&x);
        assert_eq!(y.shape, [2, 1]);
        assert_eq!(y.data, vec![-2.0, -2.0]);
    }

    #[test]
    fn transpose_round_trips() {
        let a = Mat {
            data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            shape: [2, 3],
        };
        assert_eq!(a.transpose().transpose(), a);
        assert_eq!(a.transpose().shape, [3, 2]);
    }

    #[test]
    fn relu_clamps_negatives() {
        let a = Mat::from(vec![-1.0, 0.0, 2.0]);
        assert_eq!(a.relu().data, vec![0.0, 0.0, 2.0]);
    }

    #[test]
    #[should_panic(expected = "matmul shape mismatch")]
    fn mismatched_matmul_panics() {
        let a = Mat::zeros(2, 3);
        let b = Mat::zeros(2, 3);
        let _ = a.matmul(&b);
    }
}
