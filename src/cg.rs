//! Conjugate-gradient solvers for the symmetric positive-definite systems the
//! outer Levenberg-Marquardt loop produces.

use crate::{Error, sparse::CsrMatrix};

/// The iteration aborts if pᵀAp falls below this.
const BREAKDOWN_EPSILON: f64 = 1e-30;

/// Diagonal preconditioner entries smaller than this are treated as 1.
const PRECONDITIONER_EPSILON: f64 = 1e-15;

/// What a conjugate-gradient run produced.
#[derive(Clone, Debug)]
pub struct CgOutcome {
    /// The final solution estimate.
    pub values: Vec<f64>,
    /// How many iterations ran.
    pub iterations: usize,
    /// Residual norm ‖b − Ax‖ at exit.
    pub residual_norm: f64,
    /// Whether the tolerance was reached before the iteration cap.
    pub converged: bool,
}

/// Classical conjugate gradient on an SPD system A x = b.
///
/// `initial` defaults to zero, `max_iterations` to 2n, `tolerance` to 1e-10.
pub fn solve(
    a: &CsrMatrix,
    b: &[f64],
    initial: Option<&[f64]>,
    max_iterations: Option<usize>,
    tolerance: Option<f64>,
) -> Result<CgOutcome, Error> {
    solve_inner(a, b, initial, max_iterations, tolerance, None)
}

/// Jacobi-preconditioned conjugate gradient: precondition with M = diag(A).
pub fn solve_preconditioned(
    a: &CsrMatrix,
    b: &[f64],
    initial: Option<&[f64]>,
    max_iterations: Option<usize>,
    tolerance: Option<f64>,
) -> Result<CgOutcome, Error> {
    let mut inverse_diagonal = a.diagonal();
    for d in &mut inverse_diagonal {
        *d = if d.abs() < PRECONDITIONER_EPSILON {
            1.0
        } else {
            1.0 / *d
        };
    }
    solve_inner(a, b, initial, max_iterations, tolerance, Some(inverse_diagonal))
}

/// Solve (A + λI) x = b with Jacobi-preconditioned CG.
pub fn solve_damped(
    a: &CsrMatrix,
    b: &[f64],
    lambda: f64,
    initial: Option<&[f64]>,
    max_iterations: Option<usize>,
    tolerance: Option<f64>,
) -> Result<CgOutcome, Error> {
    let damped = a.add_diagonal(lambda)?;
    solve_preconditioned(&damped, b, initial, max_iterations, tolerance)
}

fn solve_inner(
    a: &CsrMatrix,
    b: &[f64],
    initial: Option<&[f64]>,
    max_iterations: Option<usize>,
    tolerance: Option<f64>,
    inverse_diagonal: Option<Vec<f64>>,
) -> Result<CgOutcome, Error> {
    let n = a.cols();
    if a.rows() != n {
        return Err(Error::InvalidConstruction(format!(
            "conjugate gradient needs a square matrix, got {}x{}",
            a.rows(),
            n
        )));
    }
    if b.len() != n {
        return Err(Error::DimensionMismatch {
            expected: n,
            actual: b.len(),
        });
    }
    let max_iterations = max_iterations.unwrap_or(2 * n);
    let tolerance = tolerance.unwrap_or(1e-10);

    let mut x = match initial {
        Some(x0) => {
            if x0.len() != n {
                return Err(Error::DimensionMismatch {
                    expected: n,
                    actual: x0.len(),
                });
            }
            x0.to_vec()
        }
        None => vec![0.0; n],
    };

    // r = b − Ax
    let ax = a.mul_vec(&x)?;
    let mut r: Vec<f64> = b.iter().zip(&ax).map(|(bi, axi)| bi - axi).collect();

    let apply_preconditioner = |r: &[f64]| -> Vec<f64> {
        match &inverse_diagonal {
            Some(inv) => r.iter().zip(inv).map(|(ri, mi)| ri * mi).collect(),
            None => r.to_vec(),
        }
    };

    let mut z = apply_preconditioner(&r);
    let mut p = z.clone();
    let mut rz_old = dot(&r, &z);

    let mut iterations = 0;
    let mut converged = norm(&r) < tolerance;

    while iterations < max_iterations && !converged {
        let ap = a.mul_vec(&p)?;
        let p_ap = dot(&p, &ap);
        if p_ap.abs() < BREAKDOWN_EPSILON {
            // Direction collapsed; further progress is numerically meaningless.
            break;
        }
        let alpha = rz_old / p_ap;
        for i in 0..n {
            x[i] += alpha * p[i];
            r[i] -= alpha * ap[i];
        }
        iterations += 1;

        if norm(&r) < tolerance {
            converged = true;
            break;
        }

        z = apply_preconditioner(&r);
        let rz_new = dot(&r, &z);
        let beta = rz_new / rz_old;
        for i in 0..n {
            p[i] = z[i] + beta * p[i];
        }
        rz_old = rz_new;
    }

    let residual_norm = norm(&r);
    Ok(CgOutcome {
        values: x,
        iterations,
        residual_norm,
        converged,
    })
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(v: &[f64]) -> f64 {
    dot(v, v).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spd_2x2() -> CsrMatrix {
        // [ 4 1 ]
        // [ 1 3 ]
        CsrMatrix::from_triplets(2, 2, vec![(0, 0, 4.0), (0, 1, 1.0), (1, 0, 1.0), (1, 1, 3.0)])
            .unwrap()
    }

    #[test]
    fn solves_small_spd_system() {
        let outcome = solve(&spd_2x2(), &[1.0, 2.0], None, None, None).unwrap();
        assert!(outcome.converged);
        // Exact solution of [[4,1],[1,3]] x = [1,2] is (1/11, 7/11).
        assert_relative_eq!(outcome.values[0], 1.0 / 11.0, epsilon = 1e-8);
        assert_relative_eq!(outcome.values[1], 7.0 / 11.0, epsilon = 1e-8);
    }

    #[test]
    fn identity_converges_immediately() {
        let eye = CsrMatrix::from_triplets(3, 3, vec![(0, 0, 1.0), (1, 1, 1.0), (2, 2, 1.0)])
            .unwrap();
        let outcome = solve(&eye, &[5.0, -2.0, 0.5], None, None, None).unwrap();
        assert!(outcome.converged);
        assert!(outcome.iterations <= 1);
        assert_relative_eq!(outcome.values[0], 5.0, epsilon = 1e-10);
    }

    #[test]
    fn preconditioned_matches_plain() {
        // Badly scaled diagonal, where Jacobi preconditioning earns its keep.
        let a = CsrMatrix::from_triplets(
            3,
            3,
            vec![
                (0, 0, 100.0),
                (0, 1, 1.0),
                (1, 0, 1.0),
                (1, 1, 0.05),
                (2, 2, 5.0),
            ],
        )
        .unwrap();
        let b = [1.0, 2.0, 3.0];
        let plain = solve(&a, &b, None, Some(1000), Some(1e-12)).unwrap();
        let jacobi = solve_preconditioned(&a, &b, None, Some(1000), Some(1e-12)).unwrap();
        assert!(jacobi.converged);
        for (p, j) in plain.values.iter().zip(&jacobi.values) {
            assert_relative_eq!(p, j, epsilon = 1e-6);
        }
    }

    #[test]
    fn damped_solve_shifts_the_diagonal() {
        // Singular matrix; damping makes it solvable.
        let a = CsrMatrix::from_triplets(2, 2, vec![(0, 0, 1.0)]).unwrap();
        let outcome = solve_damped(&a, &[1.0, 1.0], 0.5, None, None, None).unwrap();
        assert!(outcome.converged);
        assert_relative_eq!(outcome.values[0], 1.0 / 1.5, epsilon = 1e-8);
        assert_relative_eq!(outcome.values[1], 2.0, epsilon = 1e-8);
    }

    #[test]
    fn respects_iteration_cap() {
        let a = CsrMatrix::from_triplets(
            2,
            2,
            vec![(0, 0, 4.0), (0, 1, 1.0), (1, 0, 1.0), (1, 1, 3.0)],
        )
        .unwrap();
        let outcome = solve(&a, &[1.0, 2.0], None, Some(0), None).unwrap();
        assert_eq!(outcome.iterations, 0);
        assert!(!outcome.converged);
    }

    #[test]
    fn rejects_dimension_mismatch() {
        let err = solve(&spd_2x2(), &[1.0], None, None, None).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn rejects_non_square() {
        let a = CsrMatrix::from_triplets(2, 3, vec![(0, 0, 1.0)]).unwrap();
        let err = solve(&a, &[1.0, 1.0], None, None, None).unwrap_err();
        assert!(matches!(err, Error::InvalidConstruction(_)));
    }
}
