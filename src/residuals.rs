//! Each kind of residual block the optimizer supports.
//!
//! A block owns its slice of the global residual vector: it knows which
//! parameter-vector entries it reads (`variables`), how many residual rows it
//! produces (`residual_dim`), and how to evaluate those rows and their local
//! Jacobian at the current parameter values. Blocks never fail: degenerate or
//! non-finite configurations produce zero rows so the outer solver can keep
//! going.

use crate::vector::V3;

pub(crate) mod camera;
pub(crate) mod numeric;

pub use camera::{DEFAULT_VANISHING_WEIGHT, ReprojectionBlock, VanishingBlock};
pub use numeric::ExternalBlock;

/// Direction and length residuals are scaled so a unit violation pulls about
/// as hard as a 100-pixel reprojection error.
pub(crate) const DIRECTION_SCALE: f64 = 100.0;
pub(crate) const LENGTH_SCALE: f64 = 100.0;
/// Collinearity-style cross products get a milder scale.
pub(crate) const COLLINEARITY_SCALE: f64 = 10.0;

/// Configurations closer to degenerate than this get zero gradient rows.
pub(crate) const DEGENERATE_EPSILON: f64 = 1e-12;

/// Which world axis or plane a line direction is constrained to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectionTarget {
    /// Parallel to the X axis: the Y and Z components of the unit direction
    /// must vanish (two residual rows).
    AxisX,
    /// Parallel to the Y axis.
    AxisY,
    /// Parallel to the Z axis.
    AxisZ,
    /// Inside the XY plane: the Z component must vanish (one row).
    PlaneXy,
    /// Inside the XZ plane.
    PlaneXz,
    /// Inside the YZ plane.
    PlaneYz,
}

/// One residual block. Variables are indices into the flat parameter vector;
/// point variables are (x, y, z) index triples assigned by the layout.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Residual {
    /// Two points should be a given distance apart.
    Distance {
        a: [usize; 3],
        b: [usize; 3],
        target: f64,
    },
    /// A point pinned to a target position, one row per component.
    FixedPoint {
        p: [usize; 3],
        target: [f64; 3],
    },
    /// A single parameter pinned to a value. Used to hold the constant
    /// slots the layout allocates for locked axes.
    FixedValue {
        index: usize,
        target: f64,
    },
    /// A line's endpoints should be a given distance apart.
    LineLength {
        a: [usize; 3],
        b: [usize; 3],
        target: f64,
    },
    /// A line's unit direction should align with an axis or lie in a plane.
    LineDirection {
        a: [usize; 3],
        b: [usize; 3],
        target: DirectionTarget,
    },
    /// A third point should lie on the infinite line through two endpoints.
    PointOnLine {
        a: [usize; 3],
        b: [usize; 3],
        p: [usize; 3],
    },
    /// Three points should be collinear.
    Collinear {
        points: [[usize; 3]; 3],
    },
    /// Four points should be coplanar.
    Coplanar {
        points: [[usize; 3]; 4],
    },
    /// The angle at `vertex` between `a` and `c` should equal a target.
    Angle {
        a: [usize; 3],
        vertex: [usize; 3],
        c: [usize; 3],
        target: f64,
    },
    /// Two lines should be parallel.
    ParallelLines {
        a1: [usize; 3],
        b1: [usize; 3],
        a2: [usize; 3],
        b2: [usize; 3],
    },
    /// Two lines should be perpendicular.
    PerpendicularLines {
        a1: [usize; 3],
        b1: [usize; 3],
        a2: [usize; 3],
        b2: [usize; 3],
    },
    /// All point pairs should be the same distance apart as the first pair.
    EqualDistances {
        pairs: Vec<([usize; 3], [usize; 3])>,
    },
    /// All (a, vertex, c) triplets should subtend the same angle as the
    /// first triplet.
    EqualAngles {
        triplets: Vec<[[usize; 3]; 3]>,
    },
    /// A rotation quaternion should stay unit-norm.
    QuatNorm {
        q: [usize; 4],
    },
    /// A world point's projection should land on its observed pixel.
    Reprojection(ReprojectionBlock),
    /// A world axis rotated into the camera should point at an observed
    /// vanishing point.
    VanishingDirection(VanishingBlock),
    /// An arbitrary residual function differentiated by finite differences.
    External(ExternalBlock),
}

impl Residual {
    /// How many rows of the global residual vector this block owns.
    pub fn residual_dim(&self) -> usize {
        match self {
            Residual::Distance { .. } => 1,
            Residual::FixedPoint { .. } => 3,
            Residual::FixedValue { .. } => 1,
            Residual::LineLength { .. } => 1,
            Residual::LineDirection { target, .. } => match target {
                DirectionTarget::AxisX | DirectionTarget::AxisY | DirectionTarget::AxisZ => 2,
                DirectionTarget::PlaneXy | DirectionTarget::PlaneXz | DirectionTarget::PlaneYz => 1,
            },
            Residual::PointOnLine { .. } => 3,
            Residual::Collinear { .. } => 3,
            Residual::Coplanar { .. } => 1,
            Residual::Angle { .. } => 1,
            Residual::ParallelLines { .. } => 3,
            Residual::PerpendicularLines { .. } => 1,
            Residual::EqualDistances { pairs } => pairs.len().saturating_sub(1),
            Residual::EqualAngles { triplets } => triplets.len().saturating_sub(1),
            Residual::QuatNorm { .. } => 1,
            Residual::Reprojection(_) => 2,
            Residual::VanishingDirection(_) => 1,
            Residual::External(block) => block.dim,
        }
    }

    /// The parameter-vector indices this block reads, in column order of its
    /// local Jacobian.
    pub fn variables(&self) -> Vec<usize> {
        let mut out = Vec::new();
        match self {
            Residual::Distance { a, b, .. } | Residual::LineLength { a, b, .. } => {
                out.extend(a);
                out.extend(b);
            }
            Residual::FixedPoint { p, .. } => out.extend(p),
            Residual::FixedValue { index, .. } => out.push(*index),
            Residual::LineDirection { a, b, .. } => {
                out.extend(a);
                out.extend(b);
            }
            Residual::PointOnLine { a, b, p } => {
                out.extend(a);
                out.extend(b);
                out.extend(p);
            }
            Residual::Collinear { points } => {
                for p in points {
                    out.extend(p);
                }
            }
            Residual::Coplanar { points } => {
                for p in points {
                    out.extend(p);
                }
            }
            Residual::Angle { a, vertex, c, .. } => {
                out.extend(a);
                out.extend(vertex);
                out.extend(c);
            }
            Residual::ParallelLines { a1, b1, a2, b2 }
            | Residual::PerpendicularLines { a1, b1, a2, b2 } => {
                out.extend(a1);
                out.extend(b1);
                out.extend(a2);
                out.extend(b2);
            }
            Residual::EqualDistances { pairs } => {
                for (a, b) in pairs {
                    out.extend(a);
                    out.extend(b);
                }
            }
            Residual::EqualAngles { triplets } => {
                for [a, v, c] in triplets {
                    out.extend(a);
                    out.extend(v);
                    out.extend(c);
                }
            }
            Residual::QuatNorm { q } => out.extend(q),
            Residual::Reprojection(block) => block.variables(&mut out),
            Residual::VanishingDirection(block) => block.variables(&mut out),
            Residual::External(block) => out.extend(&block.indices),
        }
        out
    }

    /// Human-readable block name, useful for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Residual::Distance { .. } => "Distance",
            Residual::FixedPoint { .. } => "FixedPoint",
            Residual::FixedValue { .. } => "FixedValue",
            Residual::LineLength { .. } => "LineLength",
            Residual::LineDirection { .. } => "LineDirection",
            Residual::PointOnLine { .. } => "PointOnLine",
            Residual::Collinear { .. } => "Collinear",
            Residual::Coplanar { .. } => "Coplanar",
            Residual::Angle { .. } => "Angle",
            Residual::ParallelLines { .. } => "ParallelLines",
            Residual::PerpendicularLines { .. } => "PerpendicularLines",
            Residual::EqualDistances { .. } => "EqualDistances",
            Residual::EqualAngles { .. } => "EqualAngles",
            Residual::QuatNorm { .. } => "QuatNorm",
            Residual::Reprojection(_) => "Reprojection",
            Residual::VanishingDirection(_) => "VanishingDirection",
            Residual::External(_) => "External",
        }
    }

    /// Evaluate this block's residual rows at the current parameter values.
    /// Clears `out` and pushes exactly `residual_dim()` values.
    pub fn residual(&self, x: &[f64], out: &mut Vec<f64>) {
        out.clear();
        match self {
            Residual::Distance { a, b, target } => {
                let d = point(x, b) - point(x, a);
                out.push(finite_or(d.magnitude() - target, -target));
            }
            Residual::FixedPoint { p, target } => {
                let p = point(x, p);
                out.push(p.x - target[0]);
                out.push(p.y - target[1]);
                out.push(p.z - target[2]);
            }
            Residual::FixedValue { index, target } => {
                out.push(x[*index] - target);
            }
            Residual::LineLength { a, b, target } => {
                let d = point(x, b) - point(x, a);
                out.push(finite_or(d.magnitude() - target, -target) * LENGTH_SCALE);
            }
            Residual::LineDirection { a, b, target } => {
                let d = point(x, b) - point(x, a);
                let len = d.magnitude();
                if len < DEGENERATE_EPSILON {
                    for _ in 0..self.residual_dim() {
                        out.push(0.0);
                    }
                    return;
                }
                let n = d * (1.0 / len);
                for c in target.off_components() {
                    out.push(n.component(c) * DIRECTION_SCALE);
                }
            }
            Residual::PointOnLine { a, b, p } => {
                let a = point(x, a);
                let cross = (point(x, p) - a).cross(&(point(x, b) - a));
                push_v3(out, cross * COLLINEARITY_SCALE);
            }
            Residual::Collinear { points } => {
                let p0 = point(x, &points[0]);
                let cross = (point(x, &points[1]) - p0).cross(&(point(x, &points[2]) - p0));
                push_v3(out, cross * COLLINEARITY_SCALE);
            }
            Residual::Coplanar { points } => {
                let p0 = point(x, &points[0]);
                let v1 = point(x, &points[1]) - p0;
                let v2 = point(x, &points[2]) - p0;
                let v3 = point(x, &points[3]) - p0;
                let denom = v1.magnitude() * v2.magnitude() * v3.magnitude();
                if denom < DEGENERATE_EPSILON {
                    out.push(0.0);
                    return;
                }
                out.push(finite_or(v1.dot(&v2.cross(&v3)) / denom, 0.0));
            }
            Residual::Angle {
                a,
                vertex,
                c,
                target,
            } => {
                let vert = point(x, vertex);
                let u = point(x, a) - vert;
                let w = point(x, c) - vert;
                if u.magnitude() < DEGENERATE_EPSILON || w.magnitude() < DEGENERATE_EPSILON {
                    out.push(0.0);
                    return;
                }
                out.push(angle_between(u, w) - target);
            }
            Residual::ParallelLines { a1, b1, a2, b2 } => {
                let u = point(x, b1) - point(x, a1);
                let v = point(x, b2) - point(x, a2);
                let denom = u.magnitude() * v.magnitude();
                if u.magnitude() < DEGENERATE_EPSILON || v.magnitude() < DEGENERATE_EPSILON {
                    push_v3(out, V3::default());
                    return;
                }
                push_v3(out, u.cross(&v) * (1.0 / denom));
            }
            Residual::PerpendicularLines { a1, b1, a2, b2 } => {
                let u = point(x, b1) - point(x, a1);
                let v = point(x, b2) - point(x, a2);
                let denom = u.magnitude() * v.magnitude();
                if denom < DEGENERATE_EPSILON {
                    out.push(0.0);
                    return;
                }
                out.push(u.dot(&v) / denom);
            }
            Residual::EqualDistances { pairs } => {
                if pairs.len() < 2 {
                    return;
                }
                let dist =
                    |(a, b): &([usize; 3], [usize; 3])| point(x, b).euclidean_distance(point(x, a));
                let reference = dist(&pairs[0]);
                for pair in &pairs[1..] {
                    out.push(dist(pair) - reference);
                }
            }
            Residual::EqualAngles { triplets } => {
                if triplets.len() < 2 {
                    return;
                }
                let angle = |[a, v, c]: &[[usize; 3]; 3]| {
                    let vert = point(x, v);
                    angle_between(point(x, a) - vert, point(x, c) - vert)
                };
                let reference = angle(&triplets[0]);
                for triplet in &triplets[1..] {
                    out.push(angle(triplet) - reference);
                }
            }
            Residual::QuatNorm { q } => {
                let norm_sq: f64 = q.iter().map(|&i| x[i] * x[i]).sum();
                out.push(norm_sq - 1.0);
            }
            Residual::Reprojection(block) => block.residual(x, out),
            Residual::VanishingDirection(block) => block.residual(x, out),
            Residual::External(block) => block.residual(x, out),
        }
    }

    /// Evaluate this block's local Jacobian at the current parameter values.
    ///
    /// Clears `out` and fills it with a row-major `residual_dim() x k` matrix
    /// where k is `variables().len()`. Rows that would contain a non-finite
    /// entry are zeroed instead.
    pub fn jacobian(&self, x: &[f64], out: &mut Vec<f64>) {
        let width = self.variables().len();
        out.clear();
        out.resize(self.residual_dim() * width, 0.0);
        match self {
            Residual::Distance { a, b, .. } => {
                // R = |b - a| - target
                // ∂R/∂b = (b - a) / |b - a|, ∂R/∂a = -(b - a) / |b - a|
                let d = point(x, b) - point(x, a);
                let len = d.magnitude();
                if len < DEGENERATE_EPSILON {
                    return;
                }
                let g = d * (1.0 / len);
                put_point(out, width, 0, 0, -g);
                put_point(out, width, 0, 3, g);
            }
            Residual::FixedPoint { .. } => {
                // One row per component, identity.
                for i in 0..3 {
                    out[i * width + i] = 1.0;
                }
            }
            Residual::FixedValue { .. } => {
                out[0] = 1.0;
            }
            Residual::LineLength { a, b, .. } => {
                let d = point(x, b) - point(x, a);
                let len = d.magnitude();
                if len < DEGENERATE_EPSILON {
                    return;
                }
                let g = d * (LENGTH_SCALE / len);
                put_point(out, width, 0, 0, -g);
                put_point(out, width, 0, 3, g);
            }
            Residual::LineDirection { a, b, target } => {
                // n = (b - a) / |b - a|
                // ∂n_c/∂b_j = (δ_cj - n_c n_j) / |b - a|, ∂n_c/∂a_j = -that
                let d = point(x, b) - point(x, a);
                let len = d.magnitude();
                if len < DEGENERATE_EPSILON {
                    return;
                }
                let n = d * (1.0 / len);
                for (row, c) in target.off_components().into_iter().enumerate() {
                    let nc = n.component(c);
                    for j in 0..3 {
                        let delta = if c == j { 1.0 } else { 0.0 };
                        let partial = (delta - nc * n.component(j)) / len * DIRECTION_SCALE;
                        out[row * width + j] = -partial;
                        out[row * width + 3 + j] = partial;
                    }
                }
            }
            Residual::PointOnLine { a, b, p } => {
                // R = (p - a) x (b - a), scaled.
                // With u = p - a and v = b - a:
                // ∂R/∂p = -skew(v), ∂R/∂b = skew(u), ∂R/∂a = skew(v) - skew(u)
                let a_val = point(x, a);
                let u = point(x, p) - a_val;
                let v = point(x, b) - a_val;
                let sk_u = skew(u);
                let sk_v = skew(v);
                for row in 0..3 {
                    for j in 0..3 {
                        out[row * width + j] = (sk_v[row][j] - sk_u[row][j]) * COLLINEARITY_SCALE;
                        out[row * width + 3 + j] = sk_u[row][j] * COLLINEARITY_SCALE;
                        out[row * width + 6 + j] = -sk_v[row][j] * COLLINEARITY_SCALE;
                    }
                }
            }
            Residual::Collinear { points } => {
                // Same cross-product partials as PointOnLine with
                // u = p1 - p0, v = p2 - p0.
                let p0 = point(x, &points[0]);
                let u = point(x, &points[1]) - p0;
                let v = point(x, &points[2]) - p0;
                let sk_u = skew(u);
                let sk_v = skew(v);
                for row in 0..3 {
                    for j in 0..3 {
                        out[row * width + j] = (sk_v[row][j] - sk_u[row][j]) * COLLINEARITY_SCALE;
                        out[row * width + 3 + j] = -sk_v[row][j] * COLLINEARITY_SCALE;
                        out[row * width + 6 + j] = sk_u[row][j] * COLLINEARITY_SCALE;
                    }
                }
            }
            Residual::Coplanar { points } => {
                // R = v1 . (v2 x v3) / (|v1||v2||v3|), v_i = p_i - p0.
                // ∂det/∂v1 = v2 x v3, ∂det/∂v2 = v3 x v1, ∂det/∂v3 = v1 x v2;
                // the normalization contributes -R v_i / |v_i|² per vector.
                let p0 = point(x, &points[0]);
                let v1 = point(x, &points[1]) - p0;
                let v2 = point(x, &points[2]) - p0;
                let v3 = point(x, &points[3]) - p0;
                let (n1, n2, n3) = (v1.magnitude(), v2.magnitude(), v3.magnitude());
                let denom = n1 * n2 * n3;
                if denom < DEGENERATE_EPSILON {
                    return;
                }
                let r = v1.dot(&v2.cross(&v3)) / denom;
                let g1 = v2.cross(&v3) * (1.0 / denom) - v1 * (r / (n1 * n1));
                let g2 = v3.cross(&v1) * (1.0 / denom) - v2 * (r / (n2 * n2));
                let g3 = v1.cross(&v2) * (1.0 / denom) - v3 * (r / (n3 * n3));
                let g0 = -(g1 + g2 + g3);
                if !(g0.is_finite() && g1.is_finite() && g2.is_finite() && g3.is_finite()) {
                    out.iter_mut().for_each(|v| *v = 0.0);
                    return;
                }
                put_point(out, width, 0, 0, g0);
                put_point(out, width, 0, 3, g1);
                put_point(out, width, 0, 6, g2);
                put_point(out, width, 0, 9, g3);
            }
            Residual::Angle { a, vertex, c, .. } => {
                let vert = point(x, vertex);
                let u = point(x, a) - vert;
                let w = point(x, c) - vert;
                let Some((grad_u, grad_w)) = angle_gradient(u, w) else {
                    return;
                };
                put_point(out, width, 0, 0, grad_u);
                put_point(out, width, 0, 3, -(grad_u + grad_w));
                put_point(out, width, 0, 6, grad_w);
            }
            Residual::ParallelLines { a1, b1, a2, b2 } => {
                // R = (u x v) / (|u||v|), u = b1 - a1, v = b2 - a2.
                // ∂R/∂u = -skew(v)/D - (u x v) uᵀ / (|u|² D)
                // ∂R/∂v =  skew(u)/D - (u x v) vᵀ / (|v|² D)
                let u = point(x, b1) - point(x, a1);
                let v = point(x, b2) - point(x, a2);
                let (nu, nv) = (u.magnitude(), v.magnitude());
                if nu < DEGENERATE_EPSILON || nv < DEGENERATE_EPSILON {
                    return;
                }
                let denom = nu * nv;
                let n = u.cross(&v);
                let sk_u = skew(u);
                let sk_v = skew(v);
                let n_arr = n.to_array();
                let u_arr = u.to_array();
                let v_arr = v.to_array();
                for row in 0..3 {
                    for j in 0..3 {
                        let du = -sk_v[row][j] / denom - n_arr[row] * u_arr[j] / (nu * nu * denom);
                        let dv = sk_u[row][j] / denom - n_arr[row] * v_arr[j] / (nv * nv * denom);
                        out[row * width + j] = -du;
                        out[row * width + 3 + j] = du;
                        out[row * width + 6 + j] = -dv;
                        out[row * width + 9 + j] = dv;
                    }
                }
            }
            Residual::PerpendicularLines { a1, b1, a2, b2 } => {
                // R = (u . v) / (|u||v|)
                // ∂R/∂u = v/D - (u . v) u / (|u|² D), and symmetrically for v.
                let u = point(x, b1) - point(x, a1);
                let v = point(x, b2) - point(x, a2);
                let (nu, nv) = (u.magnitude(), v.magnitude());
                if nu < DEGENERATE_EPSILON || nv < DEGENERATE_EPSILON {
                    return;
                }
                let denom = nu * nv;
                let dot = u.dot(&v);
                let du = v * (1.0 / denom) - u * (dot / (nu * nu * denom));
                let dv = u * (1.0 / denom) - v * (dot / (nv * nv * denom));
                put_point(out, width, 0, 0, -du);
                put_point(out, width, 0, 3, du);
                put_point(out, width, 0, 6, -dv);
                put_point(out, width, 0, 9, dv);
            }
            Residual::EqualDistances { pairs } => {
                // Row i: dist(pair i+1) - dist(pair 0). Each distance
                // contributes the usual unit-direction partials.
                if pairs.len() < 2 {
                    return;
                }
                let gradient = |(a, b): &([usize; 3], [usize; 3])| {
                    let d = point(x, b) - point(x, a);
                    let len = d.magnitude();
                    if len < DEGENERATE_EPSILON {
                        V3::default()
                    } else {
                        d * (1.0 / len)
                    }
                };
                let reference = gradient(&pairs[0]);
                for (row, pair) in pairs[1..].iter().enumerate() {
                    let g = gradient(pair);
                    // Pair 0 occupies the first 6 columns.
                    put_point(out, width, row, 0, reference);
                    put_point(out, width, row, 3, -reference);
                    let offset = 6 * (row + 1);
                    put_point(out, width, row, offset, -g);
                    put_point(out, width, row, offset + 3, g);
                }
            }
            Residual::EqualAngles { triplets } => {
                if triplets.len() < 2 {
                    return;
                }
                let gradient = |[a, v, c]: &[[usize; 3]; 3]| {
                    let vert = point(x, v);
                    angle_gradient(point(x, a) - vert, point(x, c) - vert)
                };
                let reference = gradient(&triplets[0]);
                for (row, triplet) in triplets[1..].iter().enumerate() {
                    if let Some((gu, gw)) = reference {
                        put_point(out, width, row, 0, -gu);
                        put_point(out, width, row, 3, gu + gw);
                        put_point(out, width, row, 6, -gw);
                    }
                    if let Some((gu, gw)) = gradient(triplet) {
                        let offset = 9 * (row + 1);
                        put_point(out, width, row, offset, gu);
                        put_point(out, width, row, offset + 3, -(gu + gw));
                        put_point(out, width, row, offset + 6, gw);
                    }
                }
            }
            Residual::QuatNorm { q } => {
                // R = |q|² - 1, ∂R/∂q_i = 2 q_i
                for (col, &i) in q.iter().enumerate() {
                    out[col] = 2.0 * x[i];
                }
            }
            Residual::Reprojection(block) => block.jacobian(x, out),
            Residual::VanishingDirection(block) => block.jacobian(x, out, width),
            Residual::External(block) => block.jacobian(x, out, width),
        }
    }
}

impl DirectionTarget {
    /// The unit-direction components that must vanish for this target.
    pub(crate) fn off_components(self) -> Vec<usize> {
        match self {
            DirectionTarget::AxisX => vec![1, 2],
            DirectionTarget::AxisY => vec![0, 2],
            DirectionTarget::AxisZ => vec![0, 1],
            DirectionTarget::PlaneXy => vec![2],
            DirectionTarget::PlaneXz => vec![1],
            DirectionTarget::PlaneYz => vec![0],
        }
    }
}

#[inline(always)]
pub(crate) fn point(x: &[f64], indices: &[usize; 3]) -> V3 {
    V3::new(x[indices[0]], x[indices[1]], x[indices[2]])
}

fn push_v3(out: &mut Vec<f64>, v: V3) {
    out.push(v.x);
    out.push(v.y);
    out.push(v.z);
}

/// Write a 3-wide gradient into row `row` of a row-major matrix, starting at
/// column `col`.
fn put_point(out: &mut [f64], width: usize, row: usize, col: usize, g: V3) {
    out[row * width + col] += g.x;
    out[row * width + col + 1] += g.y;
    out[row * width + col + 2] += g.z;
}

/// The cross-product matrix: skew(w) v = w x v.
pub(crate) fn skew(w: V3) -> [[f64; 3]; 3] {
    [
        [0.0, -w.z, w.y],
        [w.z, 0.0, -w.x],
        [-w.y, w.x, 0.0],
    ]
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() { value } else { fallback }
}

/// Angle between two vectors via atan2(|u x w|, u . w): stable near 0 and π.
pub(crate) fn angle_between(u: V3, w: V3) -> f64 {
    libm::atan2(u.cross(&w).magnitude(), u.dot(&w))
}

/// Gradients of the angle with respect to `u` and `w`. None when the
/// configuration is degenerate (zero-length arm or collinear arms), where the
/// angle has no well-defined gradient.
///
/// With n = u x w, s = |n|, c = u . w, the identity s² + c² = |u|²|w|² gives
///   ∇u θ = (c (w x n)/s - s w) / (|u|²|w|²)
///   ∇w θ = (-c (u x n)/s - s u) / (|u|²|w|²)
fn angle_gradient(u: V3, w: V3) -> Option<(V3, V3)> {
    let nu_sq = u.magnitude_squared();
    let nw_sq = w.magnitude_squared();
    if nu_sq < DEGENERATE_EPSILON || nw_sq < DEGENERATE_EPSILON {
        return None;
    }
    let n = u.cross(&w);
    let s = n.magnitude();
    if s < DEGENERATE_EPSILON {
        return None;
    }
    let c = u.dot(&w);
    let denom = nu_sq * nw_sq;
    let grad_u = (w.cross(&n) * (c / s) - w * s) * (1.0 / denom);
    let grad_w = (u.cross(&n) * (-c / s) - u * s) * (1.0 / denom);
    if !(grad_u.is_finite() && grad_w.is_finite()) {
        return None;
    }
    Some((grad_u, grad_w))
}
