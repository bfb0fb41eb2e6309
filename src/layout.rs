//! Maps heterogeneous entities (world points with per-axis locks, cameras
//! with optional pose/intrinsics optimization) onto a flat parameter vector.
//!
//! Free coordinates get parameter indices in insertion order. Locked axes are
//! not part of the parameter vector at first; when a residual block needs a
//! full (x, y, z) triple for a partially locked point, the layout allocates a
//! constant slot at the tail of the vector, seeded with the locked value.
//! The adapter pins those slots with value residuals so they stay put.

use indexmap::IndexMap;

use crate::Error;
use crate::entities::{Camera, EntityId, WorldPoint};

/// Where one axis of a world point lives.
#[derive(Clone, Copy, Debug)]
enum AxisSlot {
    /// A free parameter at this index.
    Free(usize),
    /// Locked to a value; `constant` is the tail slot allocated on demand.
    Locked { value: f64, constant: Option<usize> },
}

/// Parameter indices assigned to one camera's free variables.
#[derive(Clone, Copy, Debug, Default)]
pub struct CameraSlots {
    /// Start of 3 consecutive position components, when the pose is free.
    pub position: Option<usize>,
    /// Start of 4 consecutive quaternion components (w, x, y, z), when the
    /// pose is free.
    pub rotation: Option<usize>,
    /// Focal length, when intrinsics are optimized.
    pub focal: Option<usize>,
}

/// Where a camera's pose lives: free parameters, or held values that get
/// constant tail slots when a residual block needs to reference them.
#[derive(Clone, Debug)]
enum PoseSlot {
    Free {
        position: usize,
        rotation: usize,
    },
    Held {
        position: [f64; 3],
        rotation: [f64; 4],
        constant: Option<([usize; 3], [usize; 4])>,
    },
}

#[derive(Clone, Debug)]
struct CameraEntry {
    pose: PoseSlot,
    focal: Option<usize>,
}

#[derive(Debug, Default)]
pub struct VariableLayout {
    initial_values: Vec<f64>,
    points: IndexMap<EntityId, [AxisSlot; 3]>,
    cameras: IndexMap<EntityId, CameraEntry>,
    constant_slots: Vec<(usize, f64)>,
}

impl VariableLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a world point. Free axes are assigned parameter indices in
    /// (x, y, z) order, seeded from the previously optimized coordinate when
    /// one exists.
    pub fn add_point(&mut self, point: &WorldPoint) {
        let mut slots = [AxisSlot::Free(0); 3];
        for axis in 0..3 {
            slots[axis] = if point.locked[axis] {
                AxisSlot::Locked {
                    value: point.position[axis],
                    constant: None,
                }
            } else {
                let index = self.initial_values.len();
                self.initial_values.push(point.initial_axis_value(axis));
                AxisSlot::Free(index)
            };
        }
        self.points.insert(point.id, slots);
    }

    /// Register a camera. Pose slots (3 position + 4 quaternion) are
    /// assigned when the pose is optimized and not locked; otherwise the
    /// pose values are held for constant slots. A focal slot is assigned
    /// when intrinsics are optimized.
    pub fn add_camera(&mut self, camera: &Camera, optimize_pose: bool, optimize_intrinsics: bool) {
        let pose = if optimize_pose && !camera.pose_locked {
            let position = self.initial_values.len();
            self.initial_values.extend(camera.position);
            let rotation = self.initial_values.len();
            self.initial_values.extend(camera.rotation);
            PoseSlot::Free { position, rotation }
        } else {
            PoseSlot::Held {
                position: camera.position,
                rotation: camera.rotation,
                constant: None,
            }
        };
        let focal = optimize_intrinsics.then(|| {
            let index = self.initial_values.len();
            self.initial_values.push(camera.intrinsics.focal_length);
            index
        });
        self.cameras.insert(camera.id, CameraEntry { pose, focal });
    }

    /// The parameter index of one free axis, `None` if that axis is locked
    /// or the point is unknown.
    pub fn point_axis_index(&self, point: EntityId, axis: usize) -> Option<usize> {
        match self.points.get(&point)?[axis] {
            AxisSlot::Free(index) => Some(index),
            AxisSlot::Locked { .. } => None,
        }
    }

    /// A full (x, y, z) index triple for a point, allocating constant tail
    /// slots for locked axes on first use.
    pub fn point_indices(&mut self, point: EntityId) -> Result<[usize; 3], Error> {
        let slots = self.points.get_mut(&point).ok_or_else(|| {
            Error::InvalidConstruction(format!("world point {point} was never laid out"))
        })?;
        let mut out = [0usize; 3];
        for axis in 0..3 {
            out[axis] = match &mut slots[axis] {
                AxisSlot::Free(index) => *index,
                AxisSlot::Locked {
                    constant: Some(index),
                    ..
                } => *index,
                AxisSlot::Locked { value, constant } => {
                    let index = self.initial_values.len();
                    self.initial_values.push(*value);
                    self.constant_slots.push((index, *value));
                    *constant = Some(index);
                    index
                }
            };
        }
        Ok(out)
    }

    /// The free-variable slots assigned to a camera, if it was laid out.
    /// Position and rotation are `None` when the pose is held.
    pub fn camera_slots(&self, camera: EntityId) -> Option<CameraSlots> {
        let entry = self.cameras.get(&camera)?;
        let mut slots = CameraSlots {
            focal: entry.focal,
            ..CameraSlots::default()
        };
        if let PoseSlot::Free { position, rotation } = &entry.pose {
            slots.position = Some(*position);
            slots.rotation = Some(*rotation);
        }
        Some(slots)
    }

    /// Position and rotation index groups for a camera, allocating pinned
    /// constant tail slots when the pose is held, the same way locked point
    /// axes get theirs.
    pub fn camera_pose_indices(
        &mut self,
        camera: EntityId,
    ) -> Result<([usize; 3], [usize; 4]), Error> {
        let entry = self.cameras.get_mut(&camera).ok_or_else(|| {
            Error::InvalidConstruction(format!("camera {camera} was never laid out"))
        })?;
        match &mut entry.pose {
            PoseSlot::Free { position, rotation } => {
                let p = *position;
                let r = *rotation;
                Ok(([p, p + 1, p + 2], [r, r + 1, r + 2, r + 3]))
            }
            PoseSlot::Held {
                constant: Some(indices),
                ..
            } => Ok(*indices),
            PoseSlot::Held {
                position,
                rotation,
                constant,
            } => {
                let p = self.initial_values.len();
                for (offset, value) in position.iter().enumerate() {
                    self.initial_values.push(*value);
                    self.constant_slots.push((p + offset, *value));
                }
                let r = self.initial_values.len();
                for (offset, value) in rotation.iter().enumerate() {
                    self.initial_values.push(*value);
                    self.constant_slots.push((r + offset, *value));
                }
                let indices = ([p, p + 1, p + 2], [r, r + 1, r + 2, r + 3]);
                *constant = Some(indices);
                Ok(indices)
            }
        }
    }

    /// Constant tail slots allocated so far, as (index, pinned value).
    pub fn constant_slots(&self) -> &[(usize, f64)] {
        &self.constant_slots
    }

    pub fn initial_values(&self) -> &[f64] {
        &self.initial_values
    }

    pub fn num_variables(&self) -> usize {
        self.initial_values.len()
    }
}
