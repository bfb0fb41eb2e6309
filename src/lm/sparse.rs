//! Sparse Levenberg-Marquardt: the production solver. The Jacobian is
//! rebuilt as CSR each iteration and the damped normal equations are solved
//! with Jacobi-preconditioned conjugate gradient.

use crate::Error;
use crate::cg;
use crate::lm::{LmOptions, LmOutcome, MAX_STEP_RETRIES, iteration_log, norm};
use crate::system::LeastSquaresSystem;

pub fn solve_sparse(
    system: &LeastSquaresSystem,
    initial: &[f64],
    options: &LmOptions,
) -> Result<LmOutcome, Error> {
    let n = system.num_variables();
    if initial.len() != n {
        return Err(Error::DimensionMismatch {
            expected: n,
            actual: initial.len(),
        });
    }

    let mut x = initial.to_vec();
    let mut cost = system.cost(&x)?;
    let initial_cost = cost;
    let mut lambda = options.initial_damping;
    let mut converged = false;
    let mut iterations = 0;

    let cg_max_iterations = if options.cg_max_iterations == 0 {
        2 * n
    } else {
        options.cg_max_iterations
    };

    for iteration in 0..options.max_iterations {
        let residuals = system.residual_vector(&x)?;
        let jacobian = system.sparse_jacobian(&x)?;
        let normal = jacobian.normal_matrix()?;
        let mut gradient = jacobian.transpose_mul_vec(&residuals)?;

        let gradient_norm = norm(&gradient);
        if gradient_norm < options.gradient_tolerance {
            converged = true;
            break;
        }
        if gradient_norm > options.gradient_bailout {
            // Numbers this large cannot be walked back by damping.
            return Err(Error::NumericalDivergence(format!(
                "gradient norm {gradient_norm:.3e} exceeds the bail-out threshold"
            )));
        }
        if gradient_norm > options.gradient_rescale {
            let scale = options.gradient_rescale / gradient_norm;
            for g in &mut gradient {
                *g *= scale;
            }
        }

        iteration_log!(
            options,
            "sparse lm iteration {iteration}: cost {cost:.6e}, gradient {gradient_norm:.3e}, damping {lambda:.3e}, nnz {}",
            jacobian.nnz(),
        );

        let negated: Vec<f64> = gradient.iter().map(|g| -g).collect();
        let mut accepted = false;
        for _retry in 0..MAX_STEP_RETRIES {
            let solution = cg::solve_damped(
                &normal,
                &negated,
                lambda,
                None,
                Some(cg_max_iterations),
                None,
            )?;
            let step = solution.values;

            if norm(&step) < options.tolerance {
                converged = true;
                break;
            }

            let trial: Vec<f64> = x.iter().zip(&step).map(|(v, s)| v + s).collect();
            let trial_cost = system.cost(&trial)?;

            if trial_cost < cost {
                x = trial;
                cost = trial_cost;
                lambda = (lambda * options.damping_decrease).max(options.min_damping);
                accepted = true;
                if cost < options.tolerance * options.tolerance {
                    converged = true;
                }
                break;
            }
            lambda = (lambda * options.damping_increase).min(options.max_damping);
        }

        iterations = iteration + 1;
        if converged {
            break;
        }
        if !accepted {
            log::warn!(
                "sparse lm stalled after {MAX_STEP_RETRIES} rejected steps at iteration {iteration}"
            );
            break;
        }
    }

    Ok(LmOutcome {
        converged,
        iterations,
        initial_cost,
        final_cost: cost,
        values: x,
    })
}
