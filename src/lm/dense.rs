//! Dense Levenberg-Marquardt, the reference implementation the sparse solver
//! is validated against. The normal equations are factorized with faer's
//! Cholesky.

use faer::{Mat, Side, prelude::Solve};

use crate::Error;
use crate::lm::{LmOptions, LmOutcome, MAX_STEP_RETRIES, iteration_log, norm};
use crate::system::LeastSquaresSystem;

pub fn solve_dense(
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

    for iteration in 0..options.max_iterations {
        let residuals = system.residual_vector(&x)?;
        let jacobian = system.dense_jacobian(&x)?;
        let r = Mat::from_fn(residuals.len(), 1, |i, _| residuals[i]);

        let jtj = jacobian.as_ref().transpose() * jacobian.as_ref();
        let gradient = jacobian.as_ref().transpose() * r.as_ref();
        let gradient_norm = norm_of_column(&gradient);

        if gradient_norm < options.gradient_tolerance {
            converged = true;
            break;
        }

        iteration_log!(
            options,
            "dense lm iteration {iteration}: cost {cost:.6e}, gradient {gradient_norm:.3e}, damping {lambda:.3e}"
        );

        let mut accepted = false;
        for _retry in 0..MAX_STEP_RETRIES {
            let mut damped = jtj.clone();
            for i in 0..n {
                damped[(i, i)] += lambda;
            }

            let Ok(cholesky) = damped.llt(Side::Lower) else {
                // Not positive definite at this damping. More damping makes
                // the system more diagonal; at the ceiling there is nothing
                // left to try.
                if lambda >= options.max_damping {
                    return Err(Error::NumericalDivergence(
                        "Cholesky factorization failed at maximum damping".to_owned(),
                    ));
                }
                lambda = (lambda * options.damping_increase).min(options.max_damping);
                continue;
            };

            let rhs = Mat::from_fn(n, 1, |i, _| -gradient[(i, 0)]);
            let step = cholesky.solve(rhs.as_ref());

            let trial: Vec<f64> = x.iter().enumerate().map(|(i, &v)| v + step[(i, 0)]).collect();
            let trial_cost = system.cost(&trial)?;

            if trial_cost < cost {
                if cost - trial_cost < options.tolerance * cost {
                    converged = true;
                }
                x = trial;
                cost = trial_cost;
                lambda = (lambda * options.damping_decrease).max(options.min_damping);
                accepted = true;
                break;
            }
            lambda = (lambda * options.damping_increase).min(options.max_damping);
        }

        iterations = iteration + 1;
        if converged {
            break;
        }
        if !accepted {
            log::warn!("dense lm stalled after {MAX_STEP_RETRIES} rejected steps at iteration {iteration}");
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

fn norm_of_column(column: &Mat<f64>) -> f64 {
    let values: Vec<f64> = (0..column.nrows()).map(|i| column[(i, 0)]).collect();
    norm(&values)
}
