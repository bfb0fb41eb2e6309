//! Residual blocks that look through a camera: reprojection of a world point
//! onto its observed pixel, and alignment of a rotated world axis with an
//! observed vanishing point.

use crate::entities::{Axis, CameraIntrinsics};
use crate::residuals::{DEGENERATE_EPSILON, point, skew};
use crate::vector::{Quat, V3};

/// Both reprojection residuals take this value when the point sits behind
/// the camera, giving the solver a flat, finite cliff instead of a pole.
pub(crate) const BEHIND_CAMERA_PENALTY: f64 = 1000.0;

/// Step used for the reprojection block's central-difference Jacobian.
const REPROJECTION_FD_EPSILON: f64 = 1e-6;

/// Default pull of a vanishing-direction observation relative to
/// pixel-scale reprojection residuals.
pub const DEFAULT_VANISHING_WEIGHT: f64 = 0.02;

/// Projects a world point through a camera and compares against an observed
/// pixel. Two residual rows: (u - observed_u, v - observed_v).
///
/// The Jacobian is evaluated by central differences. The closed form chains
/// through the camera-space coordinates and is notoriously easy to get wrong
/// around the quaternion rotation; finite differences on a 10-or-11 column
/// block are cheap and exact enough.
#[derive(Clone, Debug)]
pub struct ReprojectionBlock {
    /// The observed world point, (x, y, z) parameter indices.
    pub point: [usize; 3],
    /// Camera position parameter indices.
    pub camera_position: [usize; 3],
    /// Camera orientation quaternion indices, (w, x, y, z).
    pub rotation: [usize; 4],
    /// When present, the focal length is itself being optimized and lives at
    /// this parameter index; otherwise it is read from `intrinsics`.
    pub focal: Option<usize>,
    pub intrinsics: CameraIntrinsics,
    /// Mirror-Z convention: negate all camera-space axes after rotation.
    pub z_reflected: bool,
    pub observed_u: f64,
    pub observed_v: f64,
}

impl ReprojectionBlock {
    pub(crate) fn variables(&self, out: &mut Vec<usize>) {
        out.extend(self.point);
        out.extend(self.camera_position);
        out.extend(self.rotation);
        if let Some(focal) = self.focal {
            out.push(focal);
        }
    }

    fn focal_length(&self, x: &[f64]) -> f64 {
        match self.focal {
            Some(index) => x[index],
            None => self.intrinsics.focal_length,
        }
    }

    /// Project the current world-point estimate into pixel coordinates.
    /// `None` when the point is on or behind the camera plane.
    fn project(&self, x: &[f64]) -> Option<(f64, f64)> {
        let p = point(x, &self.point);
        let c = point(x, &self.camera_position);
        let q = Quat::from_slice(&[
            x[self.rotation[0]],
            x[self.rotation[1]],
            x[self.rotation[2]],
            x[self.rotation[3]],
        ]);
        let mut cam = q.rotate(p - c);
        if self.z_reflected {
            cam = -cam;
        }
        if cam.z <= 0.0 {
            return None;
        }

        let i = &self.intrinsics;
        let fx = self.focal_length(x);
        let fy = fx * i.aspect_ratio;

        let nx = cam.x / cam.z;
        let ny = cam.y / cam.z;
        let r2 = nx * nx + ny * ny;
        let radial = 1.0 + i.k1 * r2 + i.k2 * r2 * r2 + i.k3 * r2 * r2 * r2;
        let tang_x = 2.0 * i.p1 * nx * ny + i.p2 * (r2 + 2.0 * nx * nx);
        let tang_y = i.p1 * (r2 + 2.0 * ny * ny) + 2.0 * i.p2 * nx * ny;
        let dx = nx * radial + tang_x;
        let dy = ny * radial + tang_y;

        let u = fx * dx + i.principal_x;
        // Image y grows downward, so the vertical axis is flipped.
        let v = i.principal_y - fy * dy;
        Some((u, v))
    }

    pub(crate) fn residual(&self, x: &[f64], out: &mut Vec<f64>) {
        match self.project(x) {
            Some((u, v)) => {
                out.push(u - self.observed_u);
                out.push(v - self.observed_v);
            }
            None => {
                out.push(BEHIND_CAMERA_PENALTY);
                out.push(BEHIND_CAMERA_PENALTY);
            }
        }
    }

    pub(crate) fn jacobian(&self, x: &[f64], out: &mut [f64]) {
        // Behind the camera the residual is a constant plateau.
        if self.project(x).is_none() {
            return;
        }
        let mut vars = Vec::new();
        self.variables(&mut vars);
        let width = vars.len();

        let mut scratch = x.to_vec();
        let mut plus = Vec::with_capacity(2);
        let mut minus = Vec::with_capacity(2);
        for (col, &index) in vars.iter().enumerate() {
            let saved = scratch[index];
            scratch[index] = saved + REPROJECTION_FD_EPSILON;
            plus.clear();
            self.residual(&scratch, &mut plus);
            scratch[index] = saved - REPROJECTION_FD_EPSILON;
            minus.clear();
            self.residual(&scratch, &mut minus);
            scratch[index] = saved;
            for row in 0..2 {
                let derivative = (plus[row] - minus[row]) / (2.0 * REPROJECTION_FD_EPSILON);
                out[row * width + col] = if derivative.is_finite() {
                    derivative
                } else {
                    0.0
                };
            }
        }
    }
}

/// Aligns a world axis, rotated into the camera frame, with the direction an
/// observed vanishing point implies. One residual row:
/// weight * (1 - cos(angle between them)).
#[derive(Clone, Debug)]
pub struct VanishingBlock {
    /// Camera orientation quaternion indices, (w, x, y, z).
    pub rotation: [usize; 4],
    /// When present, the focal length is being optimized and the observed
    /// direction depends on it.
    pub focal: Option<usize>,
    /// Which principal world axis vanishes at the observed point.
    pub axis: Axis,
    pub intrinsics: CameraIntrinsics,
    pub z_reflected: bool,
    /// Observed vanishing point, in pixels.
    pub observed_u: f64,
    pub observed_v: f64,
    pub weight: f64,
}

impl VanishingBlock {
    pub(crate) fn variables(&self, out: &mut Vec<usize>) {
        out.extend(self.rotation);
        if let Some(focal) = self.focal {
            out.push(focal);
        }
    }

    fn focal_length(&self, x: &[f64]) -> f64 {
        match self.focal {
            Some(index) => x[index],
            None => self.intrinsics.focal_length,
        }
    }

    /// The camera-space direction the vanishing point implies. Not
    /// normalized; the cosine below divides by its norm.
    fn observed_direction(&self, x: &[f64]) -> V3 {
        let fx = self.focal_length(x);
        let fy = fx * self.intrinsics.aspect_ratio;
        V3::new(
            (self.observed_u - self.intrinsics.principal_x) / fx,
            (self.intrinsics.principal_y - self.observed_v) / fy,
            1.0,
        )
    }

    /// The world axis rotated into the camera frame, mirrored when the
    /// camera uses the reflected-Z convention.
    fn predicted_direction(&self, q: Quat) -> V3 {
        let rotated = q.rotate(self.axis.unit());
        if self.z_reflected { -rotated } else { rotated }
    }

    pub(crate) fn residual(&self, x: &[f64], out: &mut Vec<f64>) {
        let q = Quat::from_slice(&[
            x[self.rotation[0]],
            x[self.rotation[1]],
            x[self.rotation[2]],
            x[self.rotation[3]],
        ]);
        let a = self.predicted_direction(q);
        let d = self.observed_direction(x);
        let (na, nd) = (a.magnitude(), d.magnitude());
        if na < DEGENERATE_EPSILON || nd < DEGENERATE_EPSILON {
            out.push(0.0);
            return;
        }
        let cos = a.dot(&d) / (na * nd);
        let value = self.weight * (1.0 - cos);
        out.push(if value.is_finite() { value } else { 0.0 });
    }

    pub(crate) fn jacobian(&self, x: &[f64], out: &mut [f64], width: usize) {
        // R = weight (1 - cos), cos = a . d / (|a||d|),
        // a = σ R(q) e, d fixed by the pixel unless the focal is optimized.
        //
        // ∂cos/∂a = d/(|a||d|) - cos a/|a|²
        // ∂a/∂w   = 2σ (qv x e)
        // ∂a/∂qv  = σ (-2w skew(e) - 2 skew(qv x e) - 2 skew(qv) skew(e))
        // ∂cos/∂d = a/(|a||d|) - cos d/|d|²
        // ∂d/∂f   = (-d_x/f, -d_y/f, 0)
        let q = Quat::from_slice(&[
            x[self.rotation[0]],
            x[self.rotation[1]],
            x[self.rotation[2]],
            x[self.rotation[3]],
        ]);
        let e = self.axis.unit();
        let a = self.predicted_direction(q);
        let d = self.observed_direction(x);
        let (na, nd) = (a.magnitude(), d.magnitude());
        if na < DEGENERATE_EPSILON || nd < DEGENERATE_EPSILON {
            return;
        }
        let cos = a.dot(&d) / (na * nd);
        let sigma = if self.z_reflected { -1.0 } else { 1.0 };

        let grad_a = d * (1.0 / (na * nd)) - a * (cos / (na * na));

        let qv = q.vector_part();
        let qv_cross_e = qv.cross(&e);
        // ∂a/∂w as a vector.
        let da_dw = qv_cross_e * (2.0 * sigma);
        // ∂a/∂qv as a 3x3 matrix.
        let sk_e = skew(e);
        let sk_qve = skew(qv_cross_e);
        let sk_qv = skew(qv);
        let mut da_dqv = [[0.0; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                let product: f64 = (0..3).map(|k| sk_qv[i][k] * sk_e[k][j]).sum();
                da_dqv[i][j] =
                    sigma * (-2.0 * q.w * sk_e[i][j] - 2.0 * sk_qve[i][j] - 2.0 * product);
            }
        }

        let grad_a_arr = grad_a.to_array();
        let mut partials = [0.0; 5];
        partials[0] = -self.weight * grad_a.dot(&da_dw);
        for j in 0..3 {
            let column_dot: f64 = (0..3).map(|i| grad_a_arr[i] * da_dqv[i][j]).sum();
            partials[1 + j] = -self.weight * column_dot;
        }

        if self.focal.is_some() {
            let f = self.focal_length(x);
            let grad_d = a * (1.0 / (na * nd)) - d * (cos / (nd * nd));
            let dd_df = V3::new(-d.x / f, -d.y / f, 0.0);
            partials[4] = -self.weight * grad_d.dot(&dd_df);
        }

        for (col, partial) in partials.iter().take(width).enumerate() {
            out[col] = if partial.is_finite() { *partial } else { 0.0 };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residuals::Residual;
    use crate::residuals::numeric::central_difference_jacobian;
    use approx::assert_relative_eq;

    fn plain_intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            focal_length: 1000.0,
            aspect_ratio: 1.0,
            principal_x: 960.0,
            principal_y: 540.0,
            skew: 0.0,
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            p1: 0.0,
            p2: 0.0,
        }
    }

    /// Point on the optical axis of an identity camera lands on the
    /// principal point exactly.
    #[test]
    fn identity_camera_projects_to_principal_point() {
        let block = Residual::Reprojection(ReprojectionBlock {
            point: [0, 1, 2],
            camera_position: [3, 4, 5],
            rotation: [6, 7, 8, 9],
            focal: None,
            intrinsics: plain_intrinsics(),
            z_reflected: false,
            observed_u: 960.0,
            observed_v: 540.0,
        });
        let x = [
            0.0, 0.0, 10.0, // world point
            0.0, 0.0, 0.0, // camera at origin
            1.0, 0.0, 0.0, 0.0, // identity quaternion
        ];
        let mut r = Vec::new();
        block.residual(&x, &mut r);
        assert_relative_eq!(r[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(r[1], 0.0, epsilon = 1e-12);

        // The block's own finite-difference Jacobian must agree with an
        // independent central difference over the whole residual.
        let mut jac = Vec::new();
        block.jacobian(&x, &mut jac);
        let reference = central_difference_jacobian(&block, &x, 1e-5);
        for (a, b) in jac.iter().zip(&reference) {
            assert_relative_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn vertical_axis_is_flipped() {
        let block = ReprojectionBlock {
            point: [0, 1, 2],
            camera_position: [3, 4, 5],
            rotation: [6, 7, 8, 9],
            focal: None,
            intrinsics: plain_intrinsics(),
            z_reflected: false,
            observed_u: 0.0,
            observed_v: 0.0,
        };
        let x = [
            0.0, 1.0, 10.0, //
            0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, 0.0,
        ];
        let (u, v) = block.project(&x).unwrap();
        assert_relative_eq!(u, 960.0, epsilon = 1e-9);
        // dy = 0.1, v = 540 - 1000 * 0.1
        assert_relative_eq!(v, 440.0, epsilon = 1e-9);
    }

    #[test]
    fn behind_camera_emits_penalty_and_zero_jacobian() {
        let block = Residual::Reprojection(ReprojectionBlock {
            point: [0, 1, 2],
            camera_position: [3, 4, 5],
            rotation: [6, 7, 8, 9],
            focal: None,
            intrinsics: plain_intrinsics(),
            z_reflected: false,
            observed_u: 960.0,
            observed_v: 540.0,
        });
        let x = [
            0.0, 0.0, -5.0, //
            0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, 0.0,
        ];
        let mut r = Vec::new();
        block.residual(&x, &mut r);
        assert_eq!(r, vec![BEHIND_CAMERA_PENALTY, BEHIND_CAMERA_PENALTY]);
        let mut jac = Vec::new();
        block.jacobian(&x, &mut jac);
        assert!(jac.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn z_reflected_camera_sees_negative_z() {
        let block = ReprojectionBlock {
            point: [0, 1, 2],
            camera_position: [3, 4, 5],
            rotation: [6, 7, 8, 9],
            focal: None,
            intrinsics: plain_intrinsics(),
            z_reflected: true,
            observed_u: 0.0,
            observed_v: 0.0,
        };
        let x = [
            0.0, 0.0, -10.0, //
            0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, 0.0,
        ];
        assert!(block.project(&x).is_some());
    }

    #[test]
    fn distortion_moves_the_projection_outward() {
        let mut intrinsics = plain_intrinsics();
        intrinsics.k1 = 0.1;
        let block = ReprojectionBlock {
            point: [0, 1, 2],
            camera_position: [3, 4, 5],
            rotation: [6, 7, 8, 9],
            focal: None,
            intrinsics,
            z_reflected: false,
            observed_u: 0.0,
            observed_v: 0.0,
        };
        let x = [
            1.0, 0.0, 10.0, //
            0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, 0.0,
        ];
        let (u, _) = block.project(&x).unwrap();
        // nx = 0.1, r² = 0.01, radial = 1.001, u = 960 + 1000*0.1*1.001
        assert_relative_eq!(u, 960.0 + 100.1, epsilon = 1e-9);
    }

    #[test]
    fn optimized_focal_adds_a_column() {
        let block = Residual::Reprojection(ReprojectionBlock {
            point: [0, 1, 2],
            camera_position: [3, 4, 5],
            rotation: [6, 7, 8, 9],
            focal: Some(10),
            intrinsics: plain_intrinsics(),
            z_reflected: false,
            observed_u: 1060.0,
            observed_v: 540.0,
        });
        let x = [
            1.0, 0.0, 10.0, //
            0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, 0.0, //
            1000.0, // focal variable
        ];
        assert_eq!(block.variables().len(), 11);
        let mut r = Vec::new();
        block.residual(&x, &mut r);
        assert_relative_eq!(r[0], 0.0, epsilon = 1e-9);
        let mut jac = Vec::new();
        block.jacobian(&x, &mut jac);
        // ∂u/∂f = nx = 0.1
        assert_relative_eq!(jac[10], 0.1, epsilon = 1e-5);
    }

    #[test]
    fn vanishing_gradient_matches_numerical() {
        let block = Residual::VanishingDirection(VanishingBlock {
            rotation: [0, 1, 2, 3],
            focal: None,
            axis: Axis::X,
            intrinsics: plain_intrinsics(),
            z_reflected: false,
            observed_u: 1400.0,
            observed_v: 300.0,
            weight: DEFAULT_VANISHING_WEIGHT,
        });
        // A non-trivial, non-unit quaternion: the block must not assume
        // normalization mid-iteration.
        let x = [0.9, 0.11, -0.23, 0.41];
        let mut analytical = Vec::new();
        block.jacobian(&x, &mut analytical);
        let numerical = central_difference_jacobian(&block, &x, 1e-6);
        for (a, n) in analytical.iter().zip(&numerical) {
            let diff = (a - n).abs();
            assert!(
                diff < 1e-6 || diff / a.abs().max(n.abs()) < 1e-4,
                "analytical {a} vs numerical {n}"
            );
        }
    }

    #[test]
    fn vanishing_gradient_with_focal_matches_numerical() {
        let block = Residual::VanishingDirection(VanishingBlock {
            rotation: [0, 1, 2, 3],
            focal: Some(4),
            axis: Axis::Z,
            intrinsics: plain_intrinsics(),
            z_reflected: true,
            observed_u: 700.0,
            observed_v: 800.0,
            weight: DEFAULT_VANISHING_WEIGHT,
        });
        let x = [0.8, -0.1, 0.3, 0.2, 1200.0];
        let mut analytical = Vec::new();
        block.jacobian(&x, &mut analytical);
        let numerical = central_difference_jacobian(&block, &x, 1e-6);
        assert_eq!(analytical.len(), 5);
        for (a, n) in analytical.iter().zip(&numerical) {
            let diff = (a - n).abs();
            assert!(
                diff < 1e-6 || diff / a.abs().max(n.abs()) < 1e-4,
                "analytical {a} vs numerical {n}"
            );
        }
    }

    #[test]
    fn aligned_vanishing_direction_has_zero_residual() {
        // Identity rotation, X axis, vanishing point far along +u: the
        // observed direction approaches +X as the pixel goes to infinity, so
        // pick the pixel that makes the direction exactly diagonal and
        // verify the residual equals the expected 1 - cos.
        let block = VanishingBlock {
            rotation: [0, 1, 2, 3],
            focal: None,
            axis: Axis::X,
            intrinsics: plain_intrinsics(),
            z_reflected: false,
            observed_u: 960.0 + 1000.0,
            observed_v: 540.0,
            weight: 1.0,
        };
        let x = [1.0, 0.0, 0.0, 0.0];
        let mut r = Vec::new();
        block.residual(&x, &mut r);
        // Observed direction is (1, 0, 1)/√2, predicted is (1, 0, 0).
        let expected = 1.0 - 1.0 / 2.0_f64.sqrt();
        assert_relative_eq!(r[0], expected, epsilon = 1e-12);
    }
}
