//! The self-contained export record handed to CLI tooling and other
//! collaborators: everything the optimization core needs to reproduce a
//! solve, and nothing tied to the editor's in-memory representation.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::entities::{Axis, CameraIntrinsics, ConstraintKind, DirectionLock, EntityId, Project};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizationExport {
    /// Version of the core that wrote this record.
    pub version: String,
    /// RFC 3339 export timestamp.
    pub exported_at: String,
    pub points: Vec<PointDto>,
    pub lines: Vec<LineDto>,
    pub cameras: Vec<CameraDto>,
    /// Observations grouped per camera, in first-seen order.
    pub image_points: Vec<CameraObservationsDto>,
    pub constraints: Vec<ConstraintDto>,
    pub vanishing_observations: Vec<VanishingDto>,
    pub statistics: ExportStatistics,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PointDto {
    pub id: EntityId,
    pub name: String,
    /// Locked coordinate values; `null` in the slots of free axes.
    pub xyz: [Option<f64>; 3],
    pub color: [u8; 3],
    pub visible: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LineDto {
    pub id: EntityId,
    pub a: EntityId,
    pub b: EntityId,
    pub direction: DirectionLock,
    pub target_length: Option<f64>,
    pub tolerance: f64,
    pub coincident: Vec<EntityId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraDto {
    pub id: EntityId,
    pub name: String,
    pub image_width: u32,
    pub image_height: u32,
    pub intrinsics: CameraIntrinsics,
    pub position: [f64; 3],
    pub rotation: [f64; 4],
    pub z_reflected: bool,
    pub pose_locked: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraObservationsDto {
    pub camera: EntityId,
    pub observations: Vec<ObservationDto>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObservationDto {
    pub point: EntityId,
    pub u: f64,
    pub v: f64,
    pub visible: bool,
    pub weight: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConstraintDto {
    pub id: EntityId,
    pub enabled: bool,
    #[serde(flatten)]
    pub constraint: ConstraintKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VanishingDto {
    pub id: EntityId,
    pub camera: EntityId,
    pub axis: Axis,
    pub u: f64,
    pub v: f64,
    pub weight: f64,
}

impl OptimizationExport {
    /// The record as pretty-printed JSON, the format the CLI tooling reads.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ExportStatistics {
    pub num_points: usize,
    pub num_lines: usize,
    pub num_cameras: usize,
    pub num_image_points: usize,
    pub num_constraints: usize,
    pub num_vanishing_observations: usize,
}

/// Serialize a project into the optimization export record.
pub fn export_to_optimization_dto(project: &Project) -> OptimizationExport {
    let points = project
        .points()
        .map(|point| {
            let mut xyz = [None; 3];
            for axis in 0..3 {
                if point.locked[axis] {
                    xyz[axis] = Some(point.position[axis]);
                }
            }
            PointDto {
                id: point.id,
                name: point.name.clone(),
                xyz,
                color: point.color,
                visible: point.visible,
            }
        })
        .collect();

    let lines = project
        .lines()
        .map(|line| LineDto {
            id: line.id,
            a: line.a,
            b: line.b,
            direction: line.direction,
            target_length: line.target_length,
            tolerance: line.length_tolerance,
            coincident: line.coincident.clone(),
        })
        .collect();

    let cameras = project
        .cameras()
        .map(|camera| CameraDto {
            id: camera.id,
            name: camera.name.clone(),
            image_width: camera.image_width,
            image_height: camera.image_height,
            intrinsics: camera.intrinsics,
            position: camera.position,
            rotation: camera.rotation,
            z_reflected: camera.z_reflected,
            pose_locked: camera.pose_locked,
        })
        .collect();

    let mut grouped: IndexMap<EntityId, Vec<ObservationDto>> = IndexMap::new();
    for observation in project.image_points() {
        grouped
            .entry(observation.camera)
            .or_default()
            .push(ObservationDto {
                point: observation.point,
                u: observation.u,
                v: observation.v,
                visible: observation.visible,
                weight: observation.weight,
            });
    }
    let image_points = grouped
        .into_iter()
        .map(|(camera, observations)| CameraObservationsDto {
            camera,
            observations,
        })
        .collect();

    let constraints = project
        .constraints()
        .map(|constraint| ConstraintDto {
            id: constraint.id,
            enabled: constraint.enabled,
            constraint: constraint.kind.clone(),
        })
        .collect();

    let vanishing_observations = project
        .vanishing_observations()
        .map(|observation| VanishingDto {
            id: observation.id,
            camera: observation.camera,
            axis: observation.axis,
            u: observation.u,
            v: observation.v,
            weight: observation.weight,
        })
        .collect();

    OptimizationExport {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        exported_at: chrono::Utc::now().to_rfc3339(),
        statistics: ExportStatistics {
            num_points: project.points().count(),
            num_lines: project.lines().count(),
            num_cameras: project.cameras().count(),
            num_image_points: project.image_points().count(),
            num_constraints: project.constraints().count(),
            num_vanishing_observations: project.vanishing_observations().count(),
        },
        points,
        lines,
        cameras,
        image_points,
        constraints,
        vanishing_observations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_project() -> Project {
        let mut project = Project::new();
        let a = project.add_locked_point("origin", [0.0, 0.0, 0.0], [true, true, true]);
        let b = project.add_locked_point("corner", [4.0, 0.0, 1.5], [false, true, false]);
        let line = project.add_line(a, b);
        project.line_mut(line).unwrap().target_length = Some(4.3);
        let cam = project.add_camera(
            "front",
            1920,
            1080,
            CameraIntrinsics::with_focal(1200.0, 1920, 1080),
        );
        project.add_image_point(cam, a, 930.0, 551.0);
        project.add_image_point(cam, b, 1410.0, 505.0);
        project.add_constraint(ConstraintKind::Distance { a, b, target: 4.3 });
        project.add_vanishing_observation(cam, Axis::Z, 960.0, -2400.0);
        project
    }

    #[test]
    fn free_axes_export_as_null() {
        let dto = export_to_optimization_dto(&sample_project());
        assert_eq!(dto.points[0].xyz, [Some(0.0), Some(0.0), Some(0.0)]);
        assert_eq!(dto.points[1].xyz, [None, Some(0.0), None]);

        let json = serde_json::to_value(&dto).unwrap();
        assert!(json["points"][1]["xyz"][0].is_null());
        assert_eq!(json["points"][1]["xyz"][1], 0.0);
    }

    #[test]
    fn observations_group_by_camera() {
        let dto = export_to_optimization_dto(&sample_project());
        assert_eq!(dto.image_points.len(), 1);
        assert_eq!(dto.image_points[0].observations.len(), 2);
        assert_eq!(dto.image_points[0].observations[1].u, 1410.0);
    }

    #[test]
    fn constraints_serialize_tagged_by_kind() {
        let dto = export_to_optimization_dto(&sample_project());
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["constraints"][0]["kind"], "distance");
        assert_eq!(json["constraints"][0]["target"], 4.3);
        assert_eq!(json["constraints"][0]["enabled"], true);
    }

    #[test]
    fn statistics_count_entities() {
        let dto = export_to_optimization_dto(&sample_project());
        assert_eq!(dto.statistics.num_points, 2);
        assert_eq!(dto.statistics.num_lines, 1);
        assert_eq!(dto.statistics.num_cameras, 1);
        assert_eq!(dto.statistics.num_image_points, 2);
        assert_eq!(dto.statistics.num_constraints, 1);
        assert_eq!(dto.statistics.num_vanishing_observations, 1);
        assert_eq!(dto.version, env!("CARGO_PKG_VERSION"));
        assert!(!dto.exported_at.is_empty());
    }

    #[test]
    fn export_round_trips_through_json() {
        let dto = export_to_optimization_dto(&sample_project());
        let json = dto.to_json().unwrap();
        let parsed: OptimizationExport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.points.len(), dto.points.len());
        assert_eq!(parsed.lines[0].target_length, Some(4.3));
    }
}
