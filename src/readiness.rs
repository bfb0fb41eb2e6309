//! Pre-flight validation: classifies a project before a solve is attempted,
//! so the host can tell the user what is missing instead of burning
//! iterations on an unsolvable setup.

use std::collections::HashMap;

use crate::Error;
use crate::entities::{EntityId, Project};

/// Overall verdict of the readiness check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadinessStatus {
    /// Nothing to optimize at all.
    Empty,
    /// Solvable, but results may be poor.
    Warning,
    /// Not solvable until the listed errors are fixed.
    Error,
    /// Good to go.
    Ready,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IssueSeverity {
    Warning,
    Error,
}

/// One finding, in terms a user can act on.
#[derive(Clone, Debug)]
pub struct ReadinessIssue {
    pub severity: IssueSeverity,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct ReadinessReport {
    pub status: ReadinessStatus,
    pub issues: Vec<ReadinessIssue>,
}

impl ReadinessReport {
    /// For hosts that want to fail a solve pipeline instead of rendering
    /// the report: an unsolvable project as the matching error kind.
    pub fn to_error(&self) -> Option<Error> {
        match self.status {
            ReadinessStatus::Empty => {
                Some(Error::DegenerateProblem("the project is empty".to_owned()))
            }
            ReadinessStatus::Error => {
                let messages: Vec<&str> = self
                    .issues
                    .iter()
                    .filter(|issue| issue.severity == IssueSeverity::Error)
                    .map(|issue| issue.message.as_str())
                    .collect();
                Some(Error::DegenerateProblem(messages.join("; ")))
            }
            ReadinessStatus::Warning | ReadinessStatus::Ready => None,
        }
    }

    fn classify(issues: Vec<ReadinessIssue>) -> Self {
        let status = if issues.iter().any(|i| i.severity == IssueSeverity::Error) {
            ReadinessStatus::Error
        } else if issues.is_empty() {
            ReadinessStatus::Ready
        } else {
            ReadinessStatus::Warning
        };
        Self { status, issues }
    }
}

/// Check whether a project is worth handing to the optimizer.
pub fn check(project: &Project) -> ReadinessReport {
    if project.is_empty() {
        return ReadinessReport {
            status: ReadinessStatus::Empty,
            issues: Vec::new(),
        };
    }

    let mut issues = Vec::new();

    let has_camera = project.cameras().next().is_some();
    let has_observations = project.image_points().next().is_some();
    if !has_camera && has_observations {
        issues.push(ReadinessIssue {
            severity: IssueSeverity::Error,
            message: "image observations exist but the project has no cameras".to_owned(),
        });
    }

    // Locked axes must carry finite values.
    for point in project.points() {
        for axis in 0..3 {
            if point.locked[axis] && !point.position[axis].is_finite() {
                issues.push(ReadinessIssue {
                    severity: IssueSeverity::Error,
                    message: format!(
                        "point '{}' locks axis {axis} to a non-finite value",
                        point.name
                    ),
                });
            }
        }
    }

    let all_points_locked = project
        .points()
        .all(|point| point.locked.iter().all(|&locked| locked));
    let any_free_camera = project.cameras().any(|camera| !camera.pose_locked);
    if project.points().next().is_some() && all_points_locked && !any_free_camera {
        issues.push(ReadinessIssue {
            severity: IssueSeverity::Error,
            message: "every point axis and every camera pose is locked; nothing can move"
                .to_owned(),
        });
    }

    // Dangling references are solve bugs waiting to happen; the adapter
    // skips them, but the user should know.
    for line in project.lines() {
        for endpoint in [line.a, line.b] {
            if project.point(endpoint).is_none() {
                issues.push(ReadinessIssue {
                    severity: IssueSeverity::Error,
                    message: format!("line {} references deleted point {endpoint}", line.id),
                });
            }
        }
        for &coincident in &line.coincident {
            if project.point(coincident).is_none() {
                issues.push(ReadinessIssue {
                    severity: IssueSeverity::Error,
                    message: format!(
                        "line {} lists deleted coincident point {coincident}",
                        line.id
                    ),
                });
            }
        }
    }
    for constraint in project.constraints() {
        for point in constraint.kind.referenced_points() {
            if project.point(point).is_none() {
                issues.push(ReadinessIssue {
                    severity: IssueSeverity::Error,
                    message: format!(
                        "constraint {} references deleted point {point}",
                        constraint.id
                    ),
                });
            }
        }
        for line in constraint.kind.referenced_lines() {
            if project.line(line).is_none() {
                issues.push(ReadinessIssue {
                    severity: IssueSeverity::Error,
                    message: format!(
                        "constraint {} references deleted line {line}",
                        constraint.id
                    ),
                });
            }
        }
    }
    for observation in project.image_points() {
        if project.camera(observation.camera).is_none() {
            issues.push(ReadinessIssue {
                severity: IssueSeverity::Error,
                message: format!(
                    "observation {} references deleted camera {}",
                    observation.id, observation.camera
                ),
            });
        }
        if project.point(observation.point).is_none() {
            issues.push(ReadinessIssue {
                severity: IssueSeverity::Error,
                message: format!(
                    "observation {} references deleted point {}",
                    observation.id, observation.point
                ),
            });
        }
    }

    // A free point seen by fewer than two cameras is poorly determined
    // unless something else constrains it.
    if has_observations {
        let mut observation_counts: HashMap<EntityId, usize> = HashMap::new();
        for observation in project.image_points().filter(|o| o.visible) {
            *observation_counts.entry(observation.point).or_default() += 1;
        }
        for point in project.points() {
            let free = point.locked.iter().any(|&locked| !locked);
            if !free {
                continue;
            }
            let seen = observation_counts.get(&point.id).copied().unwrap_or(0);
            let otherwise_constrained = !project.constraints_of_point(point.id).is_empty()
                || !project.lines_of_point(point.id).is_empty();
            if seen < 2 && !otherwise_constrained {
                issues.push(ReadinessIssue {
                    severity: IssueSeverity::Warning,
                    message: format!(
                        "point '{}' has {seen} observation(s); at least two views are needed to \
                         determine it",
                        point.name
                    ),
                });
            }
        }
    }

    ReadinessReport::classify(issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{CameraIntrinsics, ConstraintKind};

    #[test]
    fn empty_project_is_empty() {
        let report = check(&Project::new());
        assert_eq!(report.status, ReadinessStatus::Empty);
        assert!(report.issues.is_empty());
        assert!(matches!(
            report.to_error(),
            Some(crate::Error::DegenerateProblem(_))
        ));
    }

    #[test]
    fn well_formed_project_is_ready() {
        let mut project = Project::new();
        let a = project.add_locked_point("a", [0.0; 3], [true; 3]);
        let b = project.add_point("b", [1.0, 0.0, 0.0]);
        project.add_constraint(ConstraintKind::Distance { a, b, target: 1.0 });
        let report = check(&project);
        assert_eq!(report.status, ReadinessStatus::Ready);
    }

    #[test]
    fn observations_without_cameras_are_an_error() {
        let mut project = Project::new();
        let p = project.add_point("p", [0.0; 3]);
        project.add_image_point(42, p, 100.0, 100.0);
        let report = check(&project);
        assert_eq!(report.status, ReadinessStatus::Error);
    }

    #[test]
    fn non_finite_lock_is_an_error() {
        let mut project = Project::new();
        project.add_locked_point("bad", [f64::NAN, 0.0, 0.0], [true, false, false]);
        let report = check(&project);
        assert_eq!(report.status, ReadinessStatus::Error);
    }

    #[test]
    fn under_observed_point_is_a_warning() {
        let mut project = Project::new();
        let cam = project.add_camera(
            "cam",
            1920,
            1080,
            CameraIntrinsics::with_focal(1000.0, 1920, 1080),
        );
        let p = project.add_point("p", [0.0, 0.0, 5.0]);
        project.add_image_point(cam, p, 960.0, 540.0);
        let report = check(&project);
        assert_eq!(report.status, ReadinessStatus::Warning);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].severity, IssueSeverity::Warning);
    }

    #[test]
    fn dangling_line_endpoint_is_an_error() {
        let mut project = Project::new();
        let a = project.add_point("a", [0.0; 3]);
        let b = project.add_point("b", [1.0, 0.0, 0.0]);
        project.add_line(a, b);
        project.remove_point(b);
        let report = check(&project);
        assert_eq!(report.status, ReadinessStatus::Error);
    }

    #[test]
    fn fully_locked_project_is_an_error() {
        let mut project = Project::new();
        project.add_locked_point("a", [0.0; 3], [true; 3]);
        let cam = project.add_camera(
            "cam",
            640,
            480,
            CameraIntrinsics::with_focal(500.0, 640, 480),
        );
        project.camera_mut(cam).unwrap().pose_locked = true;
        let report = check(&project);
        assert_eq!(report.status, ReadinessStatus::Error);
    }
}
