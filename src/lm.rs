//! The Levenberg-Marquardt outer loops: a dense reference implementation and
//! the sparse production solver.

pub(crate) mod dense;
pub(crate) mod sparse;

pub use dense::solve_dense;
pub use sparse::solve_sparse;

/// How many times one outer iteration may retry with increased damping
/// before the solve is declared stalled.
pub(crate) const MAX_STEP_RETRIES: usize = 10;

/// Tuning for a Levenberg-Marquardt run.
#[derive(Clone, Copy, Debug)]
pub struct LmOptions {
    pub max_iterations: usize,
    /// Cost / step convergence tolerance.
    pub tolerance: f64,
    /// Convergence threshold on ‖Jᵀr‖.
    pub gradient_tolerance: f64,
    pub initial_damping: f64,
    /// Factor applied to λ when a step is rejected.
    pub damping_increase: f64,
    /// Factor applied to λ when a step is accepted.
    pub damping_decrease: f64,
    pub min_damping: f64,
    pub max_damping: f64,
    /// Iteration cap for the inner conjugate-gradient solve; 0 means 2n.
    pub cg_max_iterations: usize,
    /// Gradient norms beyond this are unrecoverable; the solve bails out.
    pub gradient_bailout: f64,
    /// Gradient norms beyond this are rescaled down to it so the inner
    /// conjugate-gradient solve stays well conditioned.
    pub gradient_rescale: f64,
    /// Log per-iteration diagnostics at info instead of debug.
    pub verbose: bool,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            initial_damping: 1e-3,
            damping_increase: 10.0,
            damping_decrease: 0.1,
            min_damping: 1e-10,
            max_damping: 1e10,
            cg_max_iterations: 0,
            gradient_bailout: 1e12,
            gradient_rescale: 1e6,
            verbose: false,
        }
    }
}

/// What a Levenberg-Marquardt run produced.
#[derive(Clone, Debug)]
pub struct LmOutcome {
    pub converged: bool,
    /// Outer iterations performed.
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// The final parameter vector.
    pub values: Vec<f64>,
}

pub(crate) fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

macro_rules! iteration_log {
    ($options:expr, $($arg:tt)*) => {
        if $options.verbose {
            log::info!($($arg)*);
        } else {
            log::debug!($($arg)*);
        }
    };
}
pub(crate) use iteration_log;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residuals::Residual;
    use crate::system::LeastSquaresSystem;
    use approx::assert_relative_eq;

    /// r = (x0 - 3, x1 - 4) with identity Jacobian.
    fn quadratic_system() -> LeastSquaresSystem {
        LeastSquaresSystem::with_blocks(
            2,
            vec![Residual::external("quadratic", vec![0, 1], 2, |vars, out| {
                out.push(vars[0] - 3.0);
                out.push(vars[1] - 4.0);
            })],
        )
        .unwrap()
    }

    /// The Rosenbrock function in least-squares form:
    /// r = (1 - x, 10 (y - x²)).
    fn rosenbrock_system() -> LeastSquaresSystem {
        LeastSquaresSystem::with_blocks(
            2,
            vec![Residual::external("rosenbrock", vec![0, 1], 2, |vars, out| {
                out.push(1.0 - vars[0]);
                out.push(10.0 * (vars[1] - vars[0] * vars[0]));
            })],
        )
        .unwrap()
    }

    /// Circle fit: center (vars 0, 1) and radius (var 2) against eight
    /// points sampled on a circle of radius 3 around (5, 5).
    fn circle_system() -> LeastSquaresSystem {
        let mut blocks = Vec::new();
        for i in 0..8 {
            let theta = std::f64::consts::TAU * i as f64 / 8.0;
            let px = 5.0 + 3.0 * theta.cos();
            let py = 5.0 + 3.0 * theta.sin();
            blocks.push(Residual::external(
                format!("circle point {i}"),
                vec![0, 1, 2],
                1,
                move |vars, out| {
                    let dx = px - vars[0];
                    let dy = py - vars[1];
                    out.push((dx * dx + dy * dy).sqrt() - vars[2]);
                },
            ));
        }
        LeastSquaresSystem::with_blocks(3, blocks).unwrap()
    }

    #[test]
    fn dense_solves_the_quadratic() {
        let system = quadratic_system();
        let outcome = solve_dense(&system, &[0.0, 0.0], &LmOptions::default()).unwrap();
        assert!(outcome.converged);
        assert!(outcome.iterations <= 5);
        assert!(outcome.final_cost < 1e-10);
        assert_relative_eq!(outcome.values[0], 3.0, epsilon = 1e-5);
        assert_relative_eq!(outcome.values[1], 4.0, epsilon = 1e-5);
    }

    #[test]
    fn sparse_solves_the_quadratic() {
        let system = quadratic_system();
        let outcome = solve_sparse(&system, &[0.0, 0.0], &LmOptions::default()).unwrap();
        assert!(outcome.converged);
        assert!(outcome.iterations <= 5);
        assert!(outcome.final_cost < 1e-10);
        assert_relative_eq!(outcome.values[0], 3.0, epsilon = 1e-5);
        assert_relative_eq!(outcome.values[1], 4.0, epsilon = 1e-5);
    }

    #[test]
    fn dense_solves_rosenbrock() {
        let system = rosenbrock_system();
        let outcome = solve_dense(&system, &[-1.0, 1.0], &LmOptions::default()).unwrap();
        assert!(outcome.converged);
        assert_relative_eq!(outcome.values[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(outcome.values[1], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn sparse_solves_rosenbrock() {
        let system = rosenbrock_system();
        let outcome = solve_sparse(&system, &[-1.0, 1.0], &LmOptions::default()).unwrap();
        assert!(outcome.converged);
        assert_relative_eq!(outcome.values[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(outcome.values[1], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn both_solvers_fit_the_circle() {
        let system = circle_system();
        let dense = solve_dense(&system, &[0.0, 0.0, 1.0], &LmOptions::default()).unwrap();
        let sparse = solve_sparse(&system, &[0.0, 0.0, 1.0], &LmOptions::default()).unwrap();

        for outcome in [&dense, &sparse] {
            assert!(outcome.converged);
            assert!(outcome.iterations < 50);
            assert_relative_eq!(outcome.values[0], 5.0, epsilon = 1e-4);
            assert_relative_eq!(outcome.values[1], 5.0, epsilon = 1e-4);
            assert_relative_eq!(outcome.values[2], 3.0, epsilon = 1e-4);
        }

        // Dense and sparse agree on the final cost. Both can drive an exact
        // fit arbitrarily close to zero, so tiny absolute gaps also count as
        // agreement.
        let diff = (dense.final_cost - sparse.final_cost).abs();
        let reference = dense.final_cost.max(sparse.final_cost);
        assert!(diff < 1e-12 || diff / reference < 1e-3);
    }

    #[test]
    fn zero_cost_problem_is_idempotent() {
        let system = quadratic_system();
        let start = [3.0, 4.0];
        for outcome in [
            solve_dense(&system, &start, &LmOptions::default()).unwrap(),
            solve_sparse(&system, &start, &LmOptions::default()).unwrap(),
        ] {
            assert!(outcome.converged);
            assert!(outcome.iterations <= 1);
            assert_relative_eq!(outcome.values[0], 3.0, epsilon = 1e-12);
            assert_relative_eq!(outcome.values[1], 4.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn cost_never_increases() {
        let system = circle_system();
        let outcome = solve_sparse(&system, &[0.0, 0.0, 1.0], &LmOptions::default()).unwrap();
        assert!(outcome.final_cost <= outcome.initial_cost);
    }

    #[test]
    fn iteration_cap_is_respected() {
        let system = rosenbrock_system();
        let options = LmOptions {
            max_iterations: 1,
            ..Default::default()
        };
        let outcome = solve_sparse(&system, &[-1.0, 1.0], &options).unwrap();
        assert!(outcome.iterations <= 1);
    }
}
