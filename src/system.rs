//! The least-squares system: an ordered list of residual blocks over a flat
//! parameter vector, with the residual, cost, and Jacobian evaluations the
//! solvers need.

use faer::Mat;

use crate::Error;
use crate::residuals::Residual;
use crate::sparse::CsrMatrix;

/// Holds the blocks and the cached block-to-row-offset mapping. The mapping
/// is rebuilt whenever the block list changes, so residual rows and Jacobian
/// rows always appear in block-insertion order.
#[derive(Debug, Default)]
pub struct LeastSquaresSystem {
    blocks: Vec<Residual>,
    row_offsets: Vec<usize>,
    residual_len: usize,
    num_variables: usize,
}

impl LeastSquaresSystem {
    pub fn new(num_variables: usize) -> Self {
        Self {
            blocks: Vec::new(),
            row_offsets: Vec::new(),
            residual_len: 0,
            num_variables,
        }
    }

    pub fn with_blocks(num_variables: usize, blocks: Vec<Residual>) -> Result<Self, Error> {
        let mut system = Self::new(num_variables);
        for block in blocks {
            system.push(block)?;
        }
        Ok(system)
    }

    /// Append a block. Every variable index it references must already be a
    /// valid index into the parameter vector.
    pub fn push(&mut self, block: Residual) -> Result<(), Error> {
        for index in block.variables() {
            if index >= self.num_variables {
                return Err(Error::InvalidConstruction(format!(
                    "{} block references variable {index} but the system has only {} variables",
                    block.kind(),
                    self.num_variables,
                )));
            }
        }
        self.row_offsets.push(self.residual_len);
        self.residual_len += block.residual_dim();
        self.blocks.push(block);
        Ok(())
    }

    pub fn blocks(&self) -> &[Residual] {
        &self.blocks
    }

    /// Row offset of each block within the concatenated residual vector.
    pub fn row_offsets(&self) -> &[usize] {
        &self.row_offsets
    }

    pub fn residual_len(&self) -> usize {
        self.residual_len
    }

    pub fn num_variables(&self) -> usize {
        self.num_variables
    }

    fn check_variables(&self, x: &[f64]) -> Result<(), Error> {
        if x.len() != self.num_variables {
            return Err(Error::DimensionMismatch {
                expected: self.num_variables,
                actual: x.len(),
            });
        }
        Ok(())
    }

    /// Every block's residuals, concatenated in insertion order.
    pub fn residual_vector(&self, x: &[f64]) -> Result<Vec<f64>, Error> {
        self.check_variables(x)?;
        let mut out = Vec::with_capacity(self.residual_len);
        let mut scratch = Vec::new();
        for block in &self.blocks {
            block.residual(x, &mut scratch);
            debug_assert_eq!(
                scratch.len(),
                block.residual_dim(),
                "{} block promised {} residuals but produced {}",
                block.kind(),
                block.residual_dim(),
                scratch.len(),
            );
            out.extend_from_slice(&scratch);
        }
        Ok(out)
    }

    /// ½ ‖r‖²
    pub fn cost(&self, x: &[f64]) -> Result<f64, Error> {
        let r = self.residual_vector(x)?;
        Ok(0.5 * r.iter().map(|v| v * v).sum::<f64>())
    }

    /// √(‖r‖² / rows)
    pub fn rms(&self, x: &[f64]) -> Result<f64, Error> {
        let r = self.residual_vector(x)?;
        if r.is_empty() {
            return Ok(0.0);
        }
        Ok((r.iter().map(|v| v * v).sum::<f64>() / r.len() as f64).sqrt())
    }

    /// Dense Jacobian, used by the reference solver and the test suite.
    /// Repeated variable references within one block accumulate.
    pub fn dense_jacobian(&self, x: &[f64]) -> Result<Mat<f64>, Error> {
        self.check_variables(x)?;
        let mut jac = Mat::zeros(self.residual_len, self.num_variables);
        let mut scratch = Vec::new();
        for (block, &offset) in self.blocks.iter().zip(&self.row_offsets) {
            let vars = block.variables();
            block.jacobian(x, &mut scratch);
            for row in 0..block.residual_dim() {
                for (col, &var) in vars.iter().enumerate() {
                    jac[(offset + row, var)] += scratch[row * vars.len() + col];
                }
            }
        }
        Ok(jac)
    }

    /// Sparse Jacobian, rebuilt from block triplets each call.
    pub fn sparse_jacobian(&self, x: &[f64]) -> Result<CsrMatrix, Error> {
        self.check_variables(x)?;
        let mut triplets = Vec::new();
        let mut scratch = Vec::new();
        for (block, &offset) in self.blocks.iter().zip(&self.row_offsets) {
            let vars = block.variables();
            block.jacobian(x, &mut scratch);
            for row in 0..block.residual_dim() {
                for (col, &var) in vars.iter().enumerate() {
                    let value = scratch[row * vars.len() + col];
                    if value != 0.0 {
                        triplets.push((offset + row, var, value));
                    }
                }
            }
        }
        CsrMatrix::from_triplets(self.residual_len, self.num_variables, triplets)
    }
}
