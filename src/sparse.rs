//! Compressed sparse row storage for the solver's Jacobian and normal
//! equations.

use crate::Error;

/// Entries whose absolute value is below this are dropped during assembly.
/// They carry no useful gradient and would only bloat the structure.
const ASSEMBLY_EPSILON: f64 = 1e-15;

/// A sparse matrix in compressed sparse row format.
///
/// Three arrays: `row_pointers` (length rows + 1, monotone non-decreasing),
/// `col_indices` and `values` (length nnz). Row i's entries live at indices
/// `row_pointers[i]..row_pointers[i + 1]`, with column indices strictly
/// increasing inside each row.
#[derive(Clone, Debug, PartialEq)]
pub struct CsrMatrix {
    rows: usize,
    cols: usize,
    row_pointers: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<f64>,
}

impl CsrMatrix {
    /// Build from coordinate triplets. Duplicates are coalesced by summing,
    /// then near-zero sums are elided.
    pub fn from_triplets(
        rows: usize,
        cols: usize,
        mut triplets: Vec<(usize, usize, f64)>,
    ) -> Result<Self, Error> {
        for &(r, c, _) in &triplets {
            if r >= rows || c >= cols {
                return Err(Error::InvalidConstruction(format!(
                    "triplet ({r}, {c}) is outside a {rows}x{cols} matrix"
                )));
            }
        }
        triplets.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut row_pointers = Vec::with_capacity(rows + 1);
        let mut col_indices = Vec::with_capacity(triplets.len());
        let mut values = Vec::with_capacity(triplets.len());
        row_pointers.push(0);

        let mut current_row = 0;
        let mut i = 0;
        while i < triplets.len() {
            let (r, c, _) = triplets[i];
            // Coalesce every triplet that shares this (row, col).
            let mut sum = 0.0;
            while i < triplets.len() && triplets[i].0 == r && triplets[i].1 == c {
                sum += triplets[i].2;
                i += 1;
            }
            if sum.abs() < ASSEMBLY_EPSILON {
                continue;
            }
            while current_row < r {
                row_pointers.push(col_indices.len());
                current_row += 1;
            }
            col_indices.push(c);
            values.push(sum);
        }
        while current_row < rows {
            row_pointers.push(col_indices.len());
            current_row += 1;
        }

        Ok(Self {
            rows,
            cols,
            row_pointers,
            col_indices,
            values,
        })
    }

    /// An all-zero matrix with no stored entries.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            row_pointers: vec![0; rows + 1],
            col_indices: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of stored (structurally nonzero) entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// y = A·x
    pub fn mul_vec(&self, x: &[f64]) -> Result<Vec<f64>, Error> {
        if x.len() != self.cols {
            return Err(Error::DimensionMismatch {
                expected: self.cols,
                actual: x.len(),
            });
        }
        let mut y = vec![0.0; self.rows];
        for (i, out) in y.iter_mut().enumerate() {
            let mut acc = 0.0;
            for k in self.row_pointers[i]..self.row_pointers[i + 1] {
                acc += self.values[k] * x[self.col_indices[k]];
            }
            *out = acc;
        }
        Ok(y)
    }

    /// y = Aᵀ·x, scattered row by row into the output.
    pub fn transpose_mul_vec(&self, x: &[f64]) -> Result<Vec<f64>, Error> {
        if x.len() != self.rows {
            return Err(Error::DimensionMismatch {
                expected: self.rows,
                actual: x.len(),
            });
        }
        let mut y = vec![0.0; self.cols];
        for i in 0..self.rows {
            let xi = x[i];
            if xi == 0.0 {
                continue;
            }
            for k in self.row_pointers[i]..self.row_pointers[i + 1] {
                y[self.col_indices[k]] += self.values[k] * xi;
            }
        }
        Ok(y)
    }

    /// JᵀJ of this matrix, as a symmetric CSR.
    ///
    /// Both triangles are assembled by walking every ordered pair of stored
    /// entries inside each row of J and accumulating their product at
    /// (col_a, col_b) and, when the columns differ, at (col_b, col_a).
    pub fn normal_matrix(&self) -> Result<CsrMatrix, Error> {
        let mut triplets = Vec::with_capacity(self.nnz() * 4);
        for i in 0..self.rows {
            let range = self.row_pointers[i]..self.row_pointers[i + 1];
            for ka in range.clone() {
                let (ca, va) = (self.col_indices[ka], self.values[ka]);
                for kb in ka..range.end {
                    let (cb, vb) = (self.col_indices[kb], self.values[kb]);
                    let product = va * vb;
                    triplets.push((ca, cb, product));
                    if ca != cb {
                        triplets.push((cb, ca, product));
                    }
                }
            }
        }
        CsrMatrix::from_triplets(self.cols, self.cols, triplets)
    }

    /// A new matrix equal to this one with `lambda` added to every
    /// in-range diagonal entry.
    pub fn add_diagonal(&self, lambda: f64) -> Result<CsrMatrix, Error> {
        let mut triplets = self.to_triplets();
        for i in 0..self.rows.min(self.cols) {
            triplets.push((i, i, lambda));
        }
        CsrMatrix::from_triplets(self.rows, self.cols, triplets)
    }

    /// Value at (i, j), via binary search within row i. Zero if absent.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        if i >= self.rows || j >= self.cols {
            return 0.0;
        }
        let row = &self.col_indices[self.row_pointers[i]..self.row_pointers[i + 1]];
        match row.binary_search(&j) {
            Ok(pos) => self.values[self.row_pointers[i] + pos],
            Err(_) => 0.0,
        }
    }

    /// The diagonal as a dense array of length min(rows, cols).
    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.rows.min(self.cols)).map(|i| self.get(i, i)).collect()
    }

    fn to_triplets(&self) -> Vec<(usize, usize, f64)> {
        let mut out = Vec::with_capacity(self.nnz());
        for i in 0..self.rows {
            for k in self.row_pointers[i]..self.row_pointers[i + 1] {
                out.push((i, self.col_indices[k], self.values[k]));
            }
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn to_dense(&self) -> Vec<Vec<f64>> {
        let mut out = vec![vec![0.0; self.cols]; self.rows];
        for i in 0..self.rows {
            for k in self.row_pointers[i]..self.row_pointers[i + 1] {
                out[i][self.col_indices[k]] = self.values[k];
            }
        }
        out
    }
}

/// Incremental CSR construction.
///
/// Entries must arrive in strictly increasing column order within a row, and
/// rows must never go backwards. Anything else is a caller bug and is
/// rejected.
pub struct CsrBuilder {
    rows: usize,
    cols: usize,
    row_pointers: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<f64>,
    current_row: usize,
}

impl CsrBuilder {
    pub fn new(rows: usize, cols: usize) -> Self {
        let mut row_pointers = Vec::with_capacity(rows + 1);
        row_pointers.push(0);
        Self {
            rows,
            cols,
            row_pointers,
            col_indices: Vec::new(),
            values: Vec::new(),
            current_row: 0,
        }
    }

    /// Append one entry. Near-zero values are elided.
    pub fn push(&mut self, row: usize, col: usize, value: f64) -> Result<(), Error> {
        if row >= self.rows || col >= self.cols {
            return Err(Error::InvalidConstruction(format!(
                "entry ({row}, {col}) is outside a {}x{} matrix",
                self.rows, self.cols
            )));
        }
        if row < self.current_row {
            return Err(Error::InvalidConstruction(format!(
                "row {row} pushed after row {}",
                self.current_row
            )));
        }
        while self.current_row < row {
            self.row_pointers.push(self.col_indices.len());
            self.current_row += 1;
        }
        if let Some(&last_col) = self
            .col_indices
            .get(self.row_pointers[self.current_row]..)
            .and_then(|cols_in_row| cols_in_row.last())
            && col <= last_col
        {
            return Err(Error::InvalidConstruction(format!(
                "column {col} pushed after column {last_col} in row {row}"
            )));
        }
        if value.abs() >= ASSEMBLY_EPSILON {
            self.col_indices.push(col);
            self.values.push(value);
        }
        Ok(())
    }

    pub fn finish(mut self) -> CsrMatrix {
        while self.row_pointers.len() < self.rows + 1 {
            self.row_pointers.push(self.col_indices.len());
        }
        CsrMatrix {
            rows: self.rows,
            cols: self.cols,
            row_pointers: self.row_pointers,
            col_indices: self.col_indices,
            values: self.values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> CsrMatrix {
        // [ 1 0 2 ]
        // [ 0 3 0 ]
        CsrMatrix::from_triplets(2, 3, vec![(0, 0, 1.0), (0, 2, 2.0), (1, 1, 3.0)]).unwrap()
    }

    #[test]
    fn triplets_coalesce_and_elide() {
        let m = CsrMatrix::from_triplets(
            2,
            2,
            vec![(0, 0, 1.0), (0, 0, 2.0), (1, 1, 1e-20), (1, 0, 4.0)],
        )
        .unwrap();
        assert_eq!(m.nnz(), 2);
        assert_relative_eq!(m.get(0, 0), 3.0);
        assert_relative_eq!(m.get(1, 0), 4.0);
        // The near-zero sum was dropped entirely.
        assert_relative_eq!(m.get(1, 1), 0.0);
    }

    #[test]
    fn triplets_reject_out_of_range() {
        let err = CsrMatrix::from_triplets(2, 2, vec![(2, 0, 1.0)]).unwrap_err();
        assert!(matches!(err, Error::InvalidConstruction(_)));
    }

    #[test]
    fn mul_vec_matches_dense() {
        let m = sample();
        let y = m.mul_vec(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(y, vec![7.0, 6.0]);
    }

    #[test]
    fn mul_vec_rejects_bad_length() {
        let err = sample().mul_vec(&[1.0]).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 3,
                actual: 1
            }
        ));
    }

    #[test]
    fn transpose_mul_vec_matches_dense() {
        let m = sample();
        let y = m.transpose_mul_vec(&[1.0, 2.0]).unwrap();
        assert_eq!(y, vec![1.0, 6.0, 2.0]);
    }

    #[test]
    fn normal_matrix_is_symmetric_and_correct() {
        let m = sample();
        let jtj = m.normal_matrix().unwrap();
        assert_eq!(jtj.rows(), 3);
        assert_eq!(jtj.cols(), 3);
        // Dense reference: JᵀJ = [[1,0,2],[0,9,0],[2,0,4]]
        assert_relative_eq!(jtj.get(0, 0), 1.0);
        assert_relative_eq!(jtj.get(1, 1), 9.0);
        assert_relative_eq!(jtj.get(2, 2), 4.0);
        assert_relative_eq!(jtj.get(0, 2), 2.0);
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(jtj.get(i, j), jtj.get(j, i));
            }
        }
    }

    #[test]
    fn add_diagonal_inserts_missing_entries() {
        let m = CsrMatrix::from_triplets(2, 2, vec![(0, 1, 5.0)]).unwrap();
        let damped = m.add_diagonal(0.5).unwrap();
        assert_relative_eq!(damped.get(0, 0), 0.5);
        assert_relative_eq!(damped.get(1, 1), 0.5);
        assert_relative_eq!(damped.get(0, 1), 5.0);
    }

    #[test]
    fn diagonal_extraction() {
        let m = sample();
        let d = m.diagonal();
        assert_eq!(d, vec![1.0, 3.0]);
    }

    #[test]
    fn builder_happy_path() {
        let mut b = CsrBuilder::new(3, 3);
        b.push(0, 0, 1.0).unwrap();
        b.push(0, 2, 2.0).unwrap();
        b.push(2, 1, 3.0).unwrap();
        let m = b.finish();
        assert_eq!(m.nnz(), 3);
        assert_relative_eq!(m.get(0, 2), 2.0);
        assert_relative_eq!(m.get(2, 1), 3.0);
        assert_relative_eq!(m.get(1, 1), 0.0);
    }

    #[test]
    fn builder_rejects_backwards_row() {
        let mut b = CsrBuilder::new(3, 3);
        b.push(1, 0, 1.0).unwrap();
        let err = b.push(0, 0, 1.0).unwrap_err();
        assert!(matches!(err, Error::InvalidConstruction(_)));
    }

    #[test]
    fn builder_rejects_backwards_column() {
        let mut b = CsrBuilder::new(3, 3);
        b.push(0, 1, 1.0).unwrap();
        let err = b.push(0, 1, 2.0).unwrap_err();
        assert!(matches!(err, Error::InvalidConstruction(_)));
    }

    #[test]
    fn empty_rows_have_consistent_pointers() {
        let m = CsrMatrix::from_triplets(4, 4, vec![(3, 3, 1.0)]).unwrap();
        assert_eq!(m.mul_vec(&[1.0; 4]).unwrap(), vec![0.0, 0.0, 0.0, 1.0]);
    }
}
