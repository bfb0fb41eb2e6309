//! Binds domain entities to the least-squares machinery: walks the project,
//! lays out variables, emits residual blocks, runs the sparse solver, and
//! writes the result back into the entities.
//!
//! A malformed reference (a line whose endpoint was deleted, an observation
//! pointing at a missing camera) never aborts the solve; the offending block
//! is skipped with a warning.

use serde::Deserialize;

use crate::Error;
use crate::entities::{ConstraintKind, EntityId, Project};
use crate::layout::VariableLayout;
use crate::lm::{self, LmOptions};
use crate::residuals::camera::{ReprojectionBlock, VanishingBlock};
use crate::residuals::Residual;
use crate::system::LeastSquaresSystem;
use crate::vector::Quat;

/// Damping schedule for the Levenberg-Marquardt loop.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DampingOptions {
    pub initial: f64,
    pub increase: f64,
    pub decrease: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for DampingOptions {
    fn default() -> Self {
        Self {
            initial: 1e-3,
            increase: 10.0,
            decrease: 0.1,
            min: 1e-10,
            max: 1e10,
        }
    }
}

/// Options for a full optimization run. Unrecognized fields in a
/// deserialized options record are rejected.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OptimizeOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub gradient_tolerance: f64,
    /// Refine camera poses (positions and orientations).
    pub optimize_pose: bool,
    /// Refine focal lengths.
    pub optimize_intrinsics: bool,
    pub verbose: bool,
    pub damping: DampingOptions,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            optimize_pose: true,
            optimize_intrinsics: false,
            verbose: false,
            damping: DampingOptions::default(),
        }
    }
}

impl OptimizeOptions {
    fn lm_options(&self) -> LmOptions {
        LmOptions {
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            gradient_tolerance: self.gradient_tolerance,
            initial_damping: self.damping.initial,
            damping_increase: self.damping.increase,
            damping_decrease: self.damping.decrease,
            min_damping: self.damping.min,
            max_damping: self.damping.max,
            verbose: self.verbose,
            ..LmOptions::default()
        }
    }
}

/// What an optimization run reports back to the caller.
#[derive(Clone, Copy, Debug)]
pub struct OptimizeReport {
    pub converged: bool,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
}

pub(crate) fn optimize_project(
    project: &mut Project,
    options: &OptimizeOptions,
) -> Result<OptimizeReport, Error> {
    // Layout pass.
    let mut layout = VariableLayout::new();
    for point in project.points() {
        layout.add_point(point);
    }
    for camera in project.cameras() {
        layout.add_camera(camera, options.optimize_pose, options.optimize_intrinsics);
    }

    // Provider pass. Blocks are emitted in a fixed entity order so residual
    // rows are stable across runs.
    let mut blocks = Vec::new();
    collect_line_blocks(project, &mut layout, &mut blocks);
    collect_quat_norm_blocks(project, &layout, &mut blocks);
    collect_observation_blocks(project, &mut layout, &mut blocks);
    collect_constraint_blocks(project, &mut layout, &mut blocks);
    collect_vanishing_blocks(project, &mut layout, &mut blocks);

    // Pin every constant slot the passes above allocated.
    for &(index, target) in layout.constant_slots() {
        blocks.push(Residual::FixedValue { index, target });
    }

    let system = LeastSquaresSystem::with_blocks(layout.num_variables(), blocks)?;

    // Solve pass.
    let outcome = match lm::solve_sparse(&system, layout.initial_values(), &options.lm_options()) {
        Ok(outcome) => outcome,
        Err(Error::NumericalDivergence(message)) => {
            // Leave every entity untouched and report the failed solve.
            log::warn!("optimization diverged: {message}");
            let cost = system.cost(layout.initial_values())?;
            return Ok(OptimizeReport {
                converged: false,
                iterations: 0,
                initial_cost: cost,
                final_cost: cost,
            });
        }
        Err(other) => return Err(other),
    };

    let improved = outcome.converged || outcome.final_cost < outcome.initial_cost;
    if improved {
        write_back(project, &layout, &outcome.values, options);
    }

    Ok(OptimizeReport {
        converged: outcome.converged,
        iterations: outcome.iterations,
        initial_cost: outcome.initial_cost,
        final_cost: if improved {
            outcome.final_cost
        } else {
            outcome.initial_cost
        },
    })
}

fn point_triple(
    layout: &mut VariableLayout,
    point: EntityId,
    context: &str,
) -> Option<[usize; 3]> {
    match layout.point_indices(point) {
        Ok(triple) => Some(triple),
        Err(error) => {
            log::warn!("skipping {context}: {error}");
            None
        }
    }
}

fn collect_line_blocks(project: &Project, layout: &mut VariableLayout, blocks: &mut Vec<Residual>) {
    for line in project.lines() {
        let Some(a) = point_triple(layout, line.a, "line direction/length") else {
            continue;
        };
        let Some(b) = point_triple(layout, line.b, "line direction/length") else {
            continue;
        };
        if let Some(target) = line.direction.target() {
            blocks.push(Residual::LineDirection { a, b, target });
        }
        if let Some(target) = line.target_length {
            blocks.push(Residual::LineLength { a, b, target });
        }
        for &coincident in &line.coincident {
            let Some(p) = point_triple(layout, coincident, "coincident point") else {
                continue;
            };
            blocks.push(Residual::PointOnLine { a, b, p });
        }
    }
}

fn collect_quat_norm_blocks(
    project: &Project,
    layout: &VariableLayout,
    blocks: &mut Vec<Residual>,
) {
    for camera in project.cameras() {
        let Some(slots) = layout.camera_slots(camera.id) else {
            continue;
        };
        if let Some(start) = slots.rotation {
            blocks.push(Residual::QuatNorm {
                q: [start, start + 1, start + 2, start + 3],
            });
        }
    }
}

fn collect_observation_blocks(
    project: &Project,
    layout: &mut VariableLayout,
    blocks: &mut Vec<Residual>,
) {
    for observation in project.image_points() {
        if !observation.visible {
            continue;
        }
        let Some(camera) = project.camera(observation.camera) else {
            log::warn!(
                "skipping observation {}: camera {} does not exist",
                observation.id,
                observation.camera,
            );
            continue;
        };
        let Some(point) = point_triple(layout, observation.point, "observation") else {
            continue;
        };
        let Ok((camera_position, rotation)) = layout.camera_pose_indices(camera.id) else {
            log::warn!(
                "skipping observation {}: camera {} was never laid out",
                observation.id,
                camera.id,
            );
            continue;
        };
        let focal = layout.camera_slots(camera.id).and_then(|slots| slots.focal);
        blocks.push(Residual::Reprojection(ReprojectionBlock {
            point,
            camera_position,
            rotation,
            focal,
            intrinsics: camera.intrinsics,
            z_reflected: camera.z_reflected,
            observed_u: observation.u,
            observed_v: observation.v,
        }));
    }
}

fn collect_constraint_blocks(
    project: &Project,
    layout: &mut VariableLayout,
    blocks: &mut Vec<Residual>,
) {
    for constraint in project.constraints() {
        if !constraint.enabled {
            continue;
        }
        let context = "constraint";
        let block = match &constraint.kind {
            ConstraintKind::Distance { a, b, target } => {
                let (Some(a), Some(b)) = (
                    point_triple(layout, *a, context),
                    point_triple(layout, *b, context),
                ) else {
                    continue;
                };
                Residual::Distance {
                    a,
                    b,
                    target: *target,
                }
            }
            ConstraintKind::Angle {
                a,
                vertex,
                c,
                target,
            } => {
                let (Some(a), Some(vertex), Some(c)) = (
                    point_triple(layout, *a, context),
                    point_triple(layout, *vertex, context),
                    point_triple(layout, *c, context),
                ) else {
                    continue;
                };
                Residual::Angle {
                    a,
                    vertex,
                    c,
                    target: *target,
                }
            }
            ConstraintKind::Collinear { points } => {
                let Some(points) = triple_array(layout, points, context) else {
                    continue;
                };
                Residual::Collinear { points }
            }
            ConstraintKind::Coplanar { points } => {
                let Some(points) = triple_array(layout, points, context) else {
                    continue;
                };
                Residual::Coplanar { points }
            }
            ConstraintKind::ParallelLines { lines } => {
                let Some([a1, b1, a2, b2]) = line_endpoints(project, layout, lines) else {
                    continue;
                };
                Residual::ParallelLines { a1, b1, a2, b2 }
            }
            ConstraintKind::PerpendicularLines { lines } => {
                let Some([a1, b1, a2, b2]) = line_endpoints(project, layout, lines) else {
                    continue;
                };
                Residual::PerpendicularLines { a1, b1, a2, b2 }
            }
            ConstraintKind::EqualDistances { pairs } => {
                if pairs.len() < 2 {
                    log::warn!(
                        "skipping equal-distance constraint {}: needs at least two pairs",
                        constraint.id,
                    );
                    continue;
                }
                let mut resolved = Vec::with_capacity(pairs.len());
                for (a, b) in pairs {
                    let (Some(a), Some(b)) = (
                        point_triple(layout, *a, context),
                        point_triple(layout, *b, context),
                    ) else {
                        break;
                    };
                    resolved.push((a, b));
                }
                if resolved.len() != pairs.len() {
                    continue;
                }
                Residual::EqualDistances { pairs: resolved }
            }
            ConstraintKind::EqualAngles { triplets } => {
                if triplets.len() < 2 {
                    log::warn!(
                        "skipping equal-angle constraint {}: needs at least two triplets",
                        constraint.id,
                    );
                    continue;
                }
                let mut resolved = Vec::with_capacity(triplets.len());
                for [a, v, c] in triplets {
                    let (Some(a), Some(v), Some(c)) = (
                        point_triple(layout, *a, context),
                        point_triple(layout, *v, context),
                        point_triple(layout, *c, context),
                    ) else {
                        break;
                    };
                    resolved.push([a, v, c]);
                }
                if resolved.len() != triplets.len() {
                    continue;
                }
                Residual::EqualAngles { triplets: resolved }
            }
            ConstraintKind::FixedPoint { point, target } => {
                let Some(p) = point_triple(layout, *point, context) else {
                    continue;
                };
                Residual::FixedPoint { p, target: *target }
            }
        };
        blocks.push(block);
    }
}

fn triple_array<const N: usize>(
    layout: &mut VariableLayout,
    points: &[EntityId; N],
    context: &str,
) -> Option<[[usize; 3]; N]> {
    let mut out = [[0usize; 3]; N];
    for (slot, &point) in out.iter_mut().zip(points) {
        *slot = point_triple(layout, point, context)?;
    }
    Some(out)
}

/// Resolve two line ids into their four endpoint triples.
fn line_endpoints(
    project: &Project,
    layout: &mut VariableLayout,
    lines: &[EntityId; 2],
) -> Option<[[usize; 3]; 4]> {
    let mut out = [[0usize; 3]; 4];
    for (i, &line_id) in lines.iter().enumerate() {
        let Some(line) = project.line(line_id) else {
            log::warn!("skipping line-pair constraint: line {line_id} does not exist");
            return None;
        };
        out[i * 2] = point_triple(layout, line.a, "line-pair constraint")?;
        out[i * 2 + 1] = point_triple(layout, line.b, "line-pair constraint")?;
    }
    Some(out)
}

fn collect_vanishing_blocks(
    project: &Project,
    layout: &mut VariableLayout,
    blocks: &mut Vec<Residual>,
) {
    for observation in project.vanishing_observations() {
        let Some(camera) = project.camera(observation.camera) else {
            log::warn!(
                "skipping vanishing observation {}: camera {} does not exist",
                observation.id,
                observation.camera,
            );
            continue;
        };
        let Ok((_, rotation)) = layout.camera_pose_indices(camera.id) else {
            log::warn!(
                "skipping vanishing observation {}: camera {} was never laid out",
                observation.id,
                camera.id,
            );
            continue;
        };
        let focal = layout.camera_slots(camera.id).and_then(|slots| slots.focal);
        blocks.push(Residual::VanishingDirection(VanishingBlock {
            rotation,
            focal,
            axis: observation.axis,
            intrinsics: camera.intrinsics,
            z_reflected: camera.z_reflected,
            observed_u: observation.u,
            observed_v: observation.v,
            weight: observation.weight,
        }));
    }
}

/// Copy the solved values back into the entities: free axes from the
/// parameter vector, locked axes verbatim from the entity, camera poses with
/// a renormalized quaternion, and the focal length when it was optimized.
fn write_back(
    project: &mut Project,
    layout: &VariableLayout,
    values: &[f64],
    options: &OptimizeOptions,
) {
    for point in project.points_mut() {
        let mut optimized = [0.0; 3];
        for axis in 0..3 {
            optimized[axis] = match layout.point_axis_index(point.id, axis) {
                Some(index) => values[index],
                None => point.position[axis],
            };
        }
        point.optimized = Some(optimized);
    }

    for camera in project.cameras_mut() {
        let Some(slots) = layout.camera_slots(camera.id) else {
            continue;
        };
        if let Some(start) = slots.position {
            camera.position = [values[start], values[start + 1], values[start + 2]];
        }
        if let Some(start) = slots.rotation {
            let q = Quat::new(
                values[start],
                values[start + 1],
                values[start + 2],
                values[start + 3],
            )
            .normalized();
            camera.rotation = [q.w, q.x, q.y, q.z];
        }
        if options.optimize_intrinsics
            && let Some(index) = slots.focal
        {
            camera.intrinsics.focal_length = values[index];
        }
    }
}
