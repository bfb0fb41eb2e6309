#![doc = include_str!("../README.md")]

pub use crate::adapter::{DampingOptions, OptimizeOptions, OptimizeReport};
pub use crate::error::Error;
pub use crate::export::{OptimizationExport, export_to_optimization_dto};
pub use crate::readiness::{ReadinessReport, ReadinessStatus};

use crate::entities::Project;

mod adapter;
/// Conjugate-gradient solvers for the damped normal equations.
pub mod cg;
/// Domain entities and the arena-style project container.
pub mod entities;
mod error;
/// The self-contained export record for CLI tooling.
pub mod export;
/// Mapping of entities onto the flat parameter vector.
pub mod layout;
/// Levenberg-Marquardt outer loops, dense and sparse.
pub mod lm;
/// Pre-flight validation before a solve.
pub mod readiness;
/// The residual-block catalog.
pub mod residuals;
/// Compressed sparse row matrices.
pub mod sparse;
/// The least-squares system container.
pub mod system;
mod vector;

/// Run the full optimization pipeline over a project: lay out variables,
/// emit residual blocks, solve with sparse Levenberg-Marquardt, and write
/// the refined coordinates, camera poses, and focal lengths back into the
/// entities.
///
/// Entities are only mutated when the solve converged or strictly reduced
/// the cost; a diverged solve reports `converged = false` with
/// `final_cost == initial_cost` and leaves the project untouched.
///
/// ```
/// use scenefit::entities::{ConstraintKind, Project};
/// use scenefit::{OptimizeOptions, optimize};
///
/// let mut project = Project::new();
/// let origin = project.add_locked_point("origin", [0.0, 0.0, 0.0], [true, true, true]);
/// let corner = project.add_point("corner", [0.9, 0.1, 0.0]);
/// project.add_constraint(ConstraintKind::Distance {
///     a: origin,
///     b: corner,
///     target: 1.0,
/// });
///
/// let report = optimize(&mut project, &OptimizeOptions::default()).unwrap();
/// assert!(report.converged);
///
/// let solved = project.point(corner).unwrap().effective_optimized();
/// let distance = (solved[0].powi(2) + solved[1].powi(2) + solved[2].powi(2)).sqrt();
/// assert!((distance - 1.0).abs() < 1e-6);
/// ```
pub fn optimize(project: &mut Project, options: &OptimizeOptions) -> Result<OptimizeReport, Error> {
    adapter::optimize_project(project, options)
}

/// Classify a project before solving: `Empty`, `Warning`, `Error`, or
/// `Ready`, with one actionable message per issue found.
///
/// ```
/// use scenefit::entities::Project;
/// use scenefit::{ReadinessStatus, check_readiness};
///
/// let report = check_readiness(&Project::new());
/// assert_eq!(report.status, ReadinessStatus::Empty);
/// ```
pub fn check_readiness(project: &Project) -> ReadinessReport {
    readiness::check(project)
}
