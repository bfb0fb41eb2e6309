//! Finite-difference Jacobians: the fallback for residuals with no closed
//! form, and the reference every hand-derived gradient is validated against.

use std::sync::Arc;

use crate::residuals::Residual;

/// Default central-difference step.
pub const DEFAULT_FD_EPSILON: f64 = 1e-6;

type ResidualFn = dyn Fn(&[f64], &mut Vec<f64>) + Send + Sync;

/// Wraps an arbitrary residual function into a block whose Jacobian is
/// computed by central differences.
///
/// The closure receives the block's local variable values (in `indices`
/// order) and must push exactly `dim` residuals.
#[derive(Clone)]
pub struct ExternalBlock {
    pub name: String,
    pub indices: Vec<usize>,
    pub dim: usize,
    pub epsilon: f64,
    function: Arc<ResidualFn>,
}

impl std::fmt::Debug for ExternalBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalBlock")
            .field("name", &self.name)
            .field("indices", &self.indices)
            .field("dim", &self.dim)
            .field("epsilon", &self.epsilon)
            .finish_non_exhaustive()
    }
}

impl ExternalBlock {
    pub fn new(
        name: impl Into<String>,
        indices: Vec<usize>,
        dim: usize,
        function: impl Fn(&[f64], &mut Vec<f64>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            indices,
            dim,
            epsilon: DEFAULT_FD_EPSILON,
            function: Arc::new(function),
        }
    }

    fn locals(&self, x: &[f64]) -> Vec<f64> {
        self.indices.iter().map(|&i| x[i]).collect()
    }

    pub(crate) fn residual(&self, x: &[f64], out: &mut Vec<f64>) {
        let locals = self.locals(x);
        (self.function)(&locals, out);
        debug_assert_eq!(
            out.len(),
            self.dim,
            "external residual {} should push {} values but pushed {}",
            self.name,
            self.dim,
            out.len(),
        );
    }

    pub(crate) fn jacobian(&self, x: &[f64], out: &mut [f64], width: usize) {
        let mut locals = self.locals(x);
        let mut plus = Vec::with_capacity(self.dim);
        let mut minus = Vec::with_capacity(self.dim);
        for col in 0..width {
            let saved = locals[col];
            locals[col] = saved + self.epsilon;
            plus.clear();
            (self.function)(&locals, &mut plus);
            locals[col] = saved - self.epsilon;
            minus.clear();
            (self.function)(&locals, &mut minus);
            locals[col] = saved;
            for row in 0..self.dim {
                let derivative = (plus[row] - minus[row]) / (2.0 * self.epsilon);
                out[row * width + col] = if derivative.is_finite() {
                    derivative
                } else {
                    0.0
                };
            }
        }
    }
}

impl Residual {
    /// Wrap an arbitrary residual function as a block with a
    /// finite-difference Jacobian.
    pub fn external(
        name: impl Into<String>,
        indices: Vec<usize>,
        dim: usize,
        function: impl Fn(&[f64], &mut Vec<f64>) + Send + Sync + 'static,
    ) -> Self {
        Residual::External(ExternalBlock::new(name, indices, dim, function))
    }
}

/// Central-difference Jacobian of any block, row-major `dim x k`.
///
/// Used by the gradient-validation tests to cross-check every analytical
/// Jacobian in the catalog.
pub fn central_difference_jacobian(block: &Residual, x: &[f64], epsilon: f64) -> Vec<f64> {
    let vars = block.variables();
    let dim = block.residual_dim();
    let width = vars.len();
    let mut out = vec![0.0; dim * width];

    let mut scratch = x.to_vec();
    let mut plus = Vec::with_capacity(dim);
    let mut minus = Vec::with_capacity(dim);
    for (col, &index) in vars.iter().enumerate() {
        let saved = scratch[index];
        scratch[index] = saved + epsilon;
        block.residual(&scratch, &mut plus);
        scratch[index] = saved - epsilon;
        block.residual(&scratch, &mut minus);
        scratch[index] = saved;
        for row in 0..dim {
            let derivative = (plus[row] - minus[row]) / (2.0 * epsilon);
            out[row * width + col] = if derivative.is_finite() {
                derivative
            } else {
                0.0
            };
        }
    }
    out
}
