//! Domain entities the optimization core reads and writes back, plus the
//! arena-style project container that owns them.
//!
//! Entities live in arenas keyed by stable integer ids. Relationships that
//! would otherwise be cyclic (points know their lines, lines know their
//! endpoints) are kept as side-index maps on the project, maintained on
//! insert and removal.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::residuals::DirectionTarget;
use crate::vector::V3;

/// Stable id of an entity within its arena.
pub type EntityId = u32;

/// Generates an incrementing sequence of entity ids starting from 1.
#[derive(Debug, Default, Clone)]
pub struct IdGenerator {
    next: EntityId,
}

impl IdGenerator {
    pub fn next_id(&mut self) -> EntityId {
        self.next += 1;
        self.next
    }
}

/// A principal world axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub(crate) fn unit(self) -> V3 {
        match self {
            Axis::X => V3::new(1.0, 0.0, 0.0),
            Axis::Y => V3::new(0.0, 1.0, 0.0),
            Axis::Z => V3::new(0.0, 0.0, 1.0),
        }
    }
}

/// A 3D point being reconstructed.
#[derive(Clone, Debug)]
pub struct WorldPoint {
    pub id: EntityId,
    pub name: String,
    /// The effective coordinates: user-supplied lock values where locked,
    /// otherwise the best current estimate for seeding a solve.
    pub position: [f64; 3],
    /// Per-axis lock flags. A locked axis holds its `position` value exactly.
    pub locked: [bool; 3],
    /// Mirrors the latest solver estimate. `None` until the first
    /// successful solve.
    pub optimized: Option<[f64; 3]>,
    pub color: [u8; 3],
    pub visible: bool,
}

impl WorldPoint {
    /// The value a solve should start this axis from: the previously
    /// optimized coordinate when there is one, else the effective value.
    pub(crate) fn initial_axis_value(&self, axis: usize) -> f64 {
        match self.optimized {
            Some(optimized) => optimized[axis],
            None => self.position[axis],
        }
    }

    /// The coordinates the rest of the editor should display.
    pub fn effective_optimized(&self) -> [f64; 3] {
        self.optimized.unwrap_or(self.position)
    }
}

/// Direction constraint a line can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionLock {
    #[default]
    Free,
    X,
    Y,
    Z,
    Xy,
    Xz,
    Yz,
}

impl DirectionLock {
    /// The residual target this lock maps to; `None` for a free line.
    pub(crate) fn target(self) -> Option<DirectionTarget> {
        match self {
            DirectionLock::Free => None,
            DirectionLock::X => Some(DirectionTarget::AxisX),
            DirectionLock::Y => Some(DirectionTarget::AxisY),
            DirectionLock::Z => Some(DirectionTarget::AxisZ),
            DirectionLock::Xy => Some(DirectionTarget::PlaneXy),
            DirectionLock::Xz => Some(DirectionTarget::PlaneXz),
            DirectionLock::Yz => Some(DirectionTarget::PlaneYz),
        }
    }
}

/// A line between two world points, with optional direction and length
/// constraints and any number of additional points required to lie on it.
#[derive(Clone, Debug)]
pub struct Line {
    pub id: EntityId,
    pub a: EntityId,
    pub b: EntityId,
    pub direction: DirectionLock,
    pub target_length: Option<f64>,
    pub length_tolerance: f64,
    /// World points that must lie on the infinite line through a and b.
    pub coincident: Vec<EntityId>,
    pub color: [u8; 3],
    pub visible: bool,
}

/// Pinhole intrinsics with polynomial radial and tangential distortion.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub focal_length: f64,
    pub aspect_ratio: f64,
    pub principal_x: f64,
    pub principal_y: f64,
    pub skew: f64,
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub p1: f64,
    pub p2: f64,
}

impl CameraIntrinsics {
    /// Undistorted intrinsics with the principal point at the image center.
    pub fn with_focal(focal_length: f64, width: u32, height: u32) -> Self {
        Self {
            focal_length,
            aspect_ratio: 1.0,
            principal_x: f64::from(width) / 2.0,
            principal_y: f64::from(height) / 2.0,
            skew: 0.0,
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            p1: 0.0,
            p2: 0.0,
        }
    }
}

/// A camera viewpoint: intrinsics plus a world pose.
#[derive(Clone, Debug)]
pub struct Camera {
    pub id: EntityId,
    pub name: String,
    pub image_width: u32,
    pub image_height: u32,
    pub intrinsics: CameraIntrinsics,
    pub position: [f64; 3],
    /// Orientation quaternion, (w, x, y, z), unit-norm between solves.
    pub rotation: [f64; 4],
    /// Mirror-Z convention: camera-space axes are negated after rotation.
    pub z_reflected: bool,
    /// A locked pose is never optimized regardless of solve options.
    pub pose_locked: bool,
}

/// One 2D observation of a world point in one camera's image.
#[derive(Clone, Debug)]
pub struct ImagePoint {
    pub id: EntityId,
    pub camera: EntityId,
    pub point: EntityId,
    pub u: f64,
    pub v: f64,
    pub visible: bool,
    /// Confidence in [0, 1]. Carried on the entity and exported; the
    /// residual itself is unweighted.
    pub weight: f64,
}

/// A standalone geometric constraint between world points or lines.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintKind {
    Distance {
        a: EntityId,
        b: EntityId,
        target: f64,
    },
    Angle {
        a: EntityId,
        vertex: EntityId,
        c: EntityId,
        /// Target angle in radians.
        target: f64,
    },
    Collinear {
        points: [EntityId; 3],
    },
    Coplanar {
        points: [EntityId; 4],
    },
    ParallelLines {
        lines: [EntityId; 2],
    },
    PerpendicularLines {
        lines: [EntityId; 2],
    },
    EqualDistances {
        pairs: Vec<(EntityId, EntityId)>,
    },
    EqualAngles {
        triplets: Vec<[EntityId; 3]>,
    },
    FixedPoint {
        point: EntityId,
        target: [f64; 3],
    },
}

impl ConstraintKind {
    /// Every world point this constraint references directly.
    pub fn referenced_points(&self) -> Vec<EntityId> {
        match self {
            ConstraintKind::Distance { a, b, .. } => vec![*a, *b],
            ConstraintKind::Angle { a, vertex, c, .. } => vec![*a, *vertex, *c],
            ConstraintKind::Collinear { points } => points.to_vec(),
            ConstraintKind::Coplanar { points } => points.to_vec(),
            ConstraintKind::ParallelLines { .. } | ConstraintKind::PerpendicularLines { .. } => {
                Vec::new()
            }
            ConstraintKind::EqualDistances { pairs } => {
                pairs.iter().flat_map(|(a, b)| [*a, *b]).collect()
            }
            ConstraintKind::EqualAngles { triplets } => {
                triplets.iter().flatten().copied().collect()
            }
            ConstraintKind::FixedPoint { point, .. } => vec![*point],
        }
    }

    /// Every line this constraint references.
    pub fn referenced_lines(&self) -> Vec<EntityId> {
        match self {
            ConstraintKind::ParallelLines { lines }
            | ConstraintKind::PerpendicularLines { lines } => lines.to_vec(),
            _ => Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Constraint {
    pub id: EntityId,
    pub kind: ConstraintKind,
    pub enabled: bool,
}

/// An observed vanishing point for one principal axis in one camera.
#[derive(Clone, Debug)]
pub struct VanishingObservation {
    pub id: EntityId,
    pub camera: EntityId,
    pub axis: Axis,
    pub u: f64,
    pub v: f64,
    pub weight: f64,
}

/// Everything one reconstruction works on. Entity arenas keyed by id, plus
/// the side indices that make point-centric iteration cheap.
#[derive(Debug, Default, Clone)]
pub struct Project {
    points: IndexMap<EntityId, WorldPoint>,
    lines: IndexMap<EntityId, Line>,
    cameras: IndexMap<EntityId, Camera>,
    image_points: IndexMap<EntityId, ImagePoint>,
    constraints: IndexMap<EntityId, Constraint>,
    vanishing: IndexMap<EntityId, VanishingObservation>,
    point_lines: IndexMap<EntityId, Vec<EntityId>>,
    point_constraints: IndexMap<EntityId, Vec<EntityId>>,
    ids: IdGenerator,
}

impl Project {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_point(&mut self, name: impl Into<String>, position: [f64; 3]) -> EntityId {
        self.add_locked_point(name, position, [false; 3])
    }

    pub fn add_locked_point(
        &mut self,
        name: impl Into<String>,
        position: [f64; 3],
        locked: [bool; 3],
    ) -> EntityId {
        let id = self.ids.next_id();
        self.points.insert(
            id,
            WorldPoint {
                id,
                name: name.into(),
                position,
                locked,
                optimized: None,
                color: [255, 255, 255],
                visible: true,
            },
        );
        id
    }

    pub fn add_line(&mut self, a: EntityId, b: EntityId) -> EntityId {
        let id = self.ids.next_id();
        self.lines.insert(
            id,
            Line {
                id,
                a,
                b,
                direction: DirectionLock::Free,
                target_length: None,
                length_tolerance: 1e-4,
                coincident: Vec::new(),
                color: [255, 255, 255],
                visible: true,
            },
        );
        self.point_lines.entry(a).or_default().push(id);
        self.point_lines.entry(b).or_default().push(id);
        id
    }

    pub fn add_camera(
        &mut self,
        name: impl Into<String>,
        image_width: u32,
        image_height: u32,
        intrinsics: CameraIntrinsics,
    ) -> EntityId {
        let id = self.ids.next_id();
        self.cameras.insert(
            id,
            Camera {
                id,
                name: name.into(),
                image_width,
                image_height,
                intrinsics,
                position: [0.0; 3],
                rotation: [1.0, 0.0, 0.0, 0.0],
                z_reflected: false,
                pose_locked: false,
            },
        );
        id
    }

    pub fn add_image_point(
        &mut self,
        camera: EntityId,
        point: EntityId,
        u: f64,
        v: f64,
    ) -> EntityId {
        let id = self.ids.next_id();
        self.image_points.insert(
            id,
            ImagePoint {
                id,
                camera,
                point,
                u,
                v,
                visible: true,
                weight: 1.0,
            },
        );
        id
    }

    pub fn add_constraint(&mut self, kind: ConstraintKind) -> EntityId {
        let id = self.ids.next_id();
        for point in kind.referenced_points() {
            self.point_constraints.entry(point).or_default().push(id);
        }
        self.constraints.insert(
            id,
            Constraint {
                id,
                kind,
                enabled: true,
            },
        );
        id
    }

    pub fn add_vanishing_observation(
        &mut self,
        camera: EntityId,
        axis: Axis,
        u: f64,
        v: f64,
    ) -> EntityId {
        let id = self.ids.next_id();
        self.vanishing.insert(
            id,
            VanishingObservation {
                id,
                camera,
                axis,
                u,
                v,
                weight: crate::residuals::camera::DEFAULT_VANISHING_WEIGHT,
            },
        );
        id
    }

    pub fn remove_point(&mut self, id: EntityId) {
        self.points.shift_remove(&id);
        self.point_lines.shift_remove(&id);
        self.point_constraints.shift_remove(&id);
    }

    pub fn remove_line(&mut self, id: EntityId) {
        let Some(line) = self.lines.shift_remove(&id) else {
            return;
        };
        for endpoint in [line.a, line.b] {
            if let Some(lines) = self.point_lines.get_mut(&endpoint) {
                lines.retain(|&l| l != id);
            }
        }
    }

    pub fn remove_constraint(&mut self, id: EntityId) {
        let Some(constraint) = self.constraints.shift_remove(&id) else {
            return;
        };
        for point in constraint.kind.referenced_points() {
            if let Some(constraints) = self.point_constraints.get_mut(&point) {
                constraints.retain(|&c| c != id);
            }
        }
    }

    pub fn point(&self, id: EntityId) -> Option<&WorldPoint> {
        self.points.get(&id)
    }

    pub fn point_mut(&mut self, id: EntityId) -> Option<&mut WorldPoint> {
        self.points.get_mut(&id)
    }

    pub fn line(&self, id: EntityId) -> Option<&Line> {
        self.lines.get(&id)
    }

    pub fn line_mut(&mut self, id: EntityId) -> Option<&mut Line> {
        self.lines.get_mut(&id)
    }

    pub fn camera(&self, id: EntityId) -> Option<&Camera> {
        self.cameras.get(&id)
    }

    pub fn camera_mut(&mut self, id: EntityId) -> Option<&mut Camera> {
        self.cameras.get_mut(&id)
    }

    pub fn points(&self) -> impl Iterator<Item = &WorldPoint> {
        self.points.values()
    }

    pub fn points_mut(&mut self) -> impl Iterator<Item = &mut WorldPoint> {
        self.points.values_mut()
    }

    pub fn lines(&self) -> impl Iterator<Item = &Line> {
        self.lines.values()
    }

    pub fn cameras(&self) -> impl Iterator<Item = &Camera> {
        self.cameras.values()
    }

    pub fn cameras_mut(&mut self) -> impl Iterator<Item = &mut Camera> {
        self.cameras.values_mut()
    }

    pub fn image_points(&self) -> impl Iterator<Item = &ImagePoint> {
        self.image_points.values()
    }

    pub fn constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.values()
    }

    pub fn constraints_mut(&mut self) -> impl Iterator<Item = &mut Constraint> {
        self.constraints.values_mut()
    }

    pub fn vanishing_observations(&self) -> impl Iterator<Item = &VanishingObservation> {
        self.vanishing.values()
    }

    /// Lines incident on a point, in insertion order.
    pub fn lines_of_point(&self, point: EntityId) -> &[EntityId] {
        self.point_lines.get(&point).map_or(&[], Vec::as_slice)
    }

    /// Constraints referencing a point, in insertion order.
    pub fn constraints_of_point(&self, point: EntityId) -> &[EntityId] {
        self.point_constraints
            .get(&point)
            .map_or(&[], Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
            && self.lines.is_empty()
            && self.cameras.is_empty()
            && self.image_points.is_empty()
            && self.constraints.is_empty()
            && self.vanishing.is_empty()
    }
}
