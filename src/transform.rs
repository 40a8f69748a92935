//! Rigid-transform helpers shared by the tracker, coregistration and robot code.
//!
//! Euler conventions follow the classic `transformations` axis strings: the first
//! letter is `s` (static frame) or `r` (rotating frame), followed by the axis order.
//! Trackers report orientations in `rzyx`; image-space poses use `sxyz`.

use crate::types::RawPoseSample;
use nalgebra::{Matrix3, Matrix4, Quaternion, UnitQuaternion, Vector3, Vector4};

const EPS: f64 = f64::EPSILON * 4.0;
const NEXT_AXIS: [usize; 4] = [1, 2, 0, 1];

/// Supported Euler axis sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axes {
    Sxyz,
    Rzyx,
    Rxyz,
}

impl Axes {
    /// (first axis, parity, frame). None of the supported sequences repeat an axis.
    fn tuple(self) -> (usize, usize, bool) {
        match self {
            Axes::Sxyz => (0, 0, false),
            Axes::Rzyx => (0, 0, true),
            Axes::Rxyz => (2, 1, true),
        }
    }

    fn indices(self) -> (usize, usize, usize, usize, bool) {
        let (i, parity, frame) = self.tuple();
        let j = NEXT_AXIS[i + parity];
        let k = NEXT_AXIS[i + 1 - parity];
        (i, j, k, parity, frame)
    }
}

/// Homogeneous rotation from Euler angles in radians.
pub fn euler_matrix(ai: f64, aj: f64, ak: f64, axes: Axes) -> Matrix4<f64> {
    let (i, j, k, parity, frame) = axes.indices();
    let (mut ai, mut aj, mut ak) = (ai, aj, ak);
    if frame {
        std::mem::swap(&mut ai, &mut ak);
    }
    if parity == 1 {
        ai = -ai;
        aj = -aj;
        ak = -ak;
    }

    let (si, sj, sk) = (ai.sin(), aj.sin(), ak.sin());
    let (ci, cj, ck) = (ai.cos(), aj.cos(), ak.cos());
    let (cc, cs) = (ci * ck, ci * sk);
    let (sc, ss) = (si * ck, si * sk);

    let mut m = Matrix4::identity();
    m[(i, i)] = cj * ck;
    m[(i, j)] = sj * sc - cs;
    m[(i, k)] = sj * cc + ss;
    m[(j, i)] = cj * sk;
    m[(j, j)] = sj * ss + cc;
    m[(j, k)] = sj * cs - sc;
    m[(k, i)] = -sj;
    m[(k, j)] = cj * si;
    m[(k, k)] = cj * ci;
    m
}

/// Euler angles in radians from the rotation part of `m`.
pub fn euler_from_matrix(m: &Matrix4<f64>, axes: Axes) -> [f64; 3] {
    let (i, j, k, parity, frame) = axes.indices();

    let cy = (m[(i, i)] * m[(i, i)] + m[(j, i)] * m[(j, i)]).sqrt();
    let (mut ax, mut ay, mut az) = if cy > EPS {
        (
            m[(k, j)].atan2(m[(k, k)]),
            (-m[(k, i)]).atan2(cy),
            m[(j, i)].atan2(m[(i, i)]),
        )
    } else {
        ((-m[(j, k)]).atan2(m[(j, j)]), (-m[(k, i)]).atan2(cy), 0.0)
    };

    if parity == 1 {
        ax = -ax;
        ay = -ay;
        az = -az;
    }
    if frame {
        std::mem::swap(&mut ax, &mut az);
    }
    [ax, ay, az]
}

/// Euler angles in radians from a `[w, x, y, z]` quaternion. Degenerate quaternions
/// map to identity.
pub fn euler_from_quaternion(q: [f64; 4], axes: Axes) -> [f64; 3] {
    let quat = Quaternion::new(q[0], q[1], q[2], q[3]);
    let m = if quat.norm() < EPS {
        Matrix4::identity()
    } else {
        UnitQuaternion::from_quaternion(quat).to_homogeneous()
    };
    euler_from_matrix(&m, axes)
}

pub fn translation_matrix(position: [f64; 3]) -> Matrix4<f64> {
    Matrix4::new_translation(&Vector3::from(position))
}

/// Compose translation and rotation (Euler angles in degrees) into one 4x4 transform.
pub fn coordinates_to_matrix(
    position: [f64; 3],
    orientation_deg: [f64; 3],
    axes: Axes,
) -> Matrix4<f64> {
    let [a, b, g] = orientation_deg.map(f64::to_radians);
    translation_matrix(position) * euler_matrix(a, b, g, axes)
}

/// Inverse of [`coordinates_to_matrix`] for the same `axes`. Angles are returned in degrees.
pub fn matrix_to_coordinates(m: &Matrix4<f64>, axes: Axes) -> ([f64; 3], [f64; 3]) {
    let angles = euler_from_matrix(m, axes).map(f64::to_degrees);
    ([m[(0, 3)], m[(1, 3)], m[(2, 3)]], angles)
}

/// Inverse of a rigid transform without a general matrix inversion.
pub fn rigid_inverse(m: &Matrix4<f64>) -> Matrix4<f64> {
    let r: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
    let t: Vector3<f64> = m.fixed_view::<3, 1>(0, 3).into_owned();
    let rt = r.transpose();
    let mut inv = Matrix4::identity();
    inv.fixed_view_mut::<3, 3>(0, 0).copy_from(&rt);
    inv.fixed_view_mut::<3, 1>(0, 3).copy_from(&(-(rt * t)));
    inv
}

/// 4x4 transform of one tracked body in tracker space (`rzyx` orientation).
pub fn marker_transformation(sample: &RawPoseSample) -> Matrix4<f64> {
    coordinates_to_matrix(sample.position, sample.orientation, Axes::Rzyx)
}

/// Probe position expressed in the reference body frame, z negated for the image convention.
///
/// Orientation is passed through from the probe.
pub fn dynamic_reference(probe: &RawPoseSample, reference: &RawPoseSample) -> [f64; 6] {
    let m_ref = marker_transformation(reference);
    let p = Vector4::new(probe.position[0], probe.position[1], probe.position[2], 1.0);
    let rel = rigid_inverse(&m_ref) * p;
    let [a, b, g] = probe.orientation;
    [rel[0], rel[1], -rel[2], a, b, g]
}

pub fn matrix_to_rows(m: &Matrix4<f64>) -> [[f64; 4]; 4] {
    let mut rows = [[0.0; 4]; 4];
    for (r, row) in rows.iter_mut().enumerate() {
        for (c, value) in row.iter_mut().enumerate() {
            *value = m[(r, c)];
        }
    }
    rows
}

pub fn matrix_from_rows(rows: &[[f64; 4]; 4]) -> Matrix4<f64> {
    Matrix4::from_fn(|r, c| rows[r][c])
}

/// Median of a non-empty set of values, averaging the middle pair for even counts.
pub fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Element-wise median over equally sized rows.
pub fn median_rows<const N: usize>(rows: &[[f64; N]]) -> [f64; N] {
    let mut out = [f64::NAN; N];
    let mut column = Vec::with_capacity(rows.len());
    for (c, value) in out.iter_mut().enumerate() {
        column.clear();
        column.extend(rows.iter().map(|row| row[c]));
        *value = median(&mut column);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_euler_round_trip_rzyx() {
        let angles = [0.3, -0.4, 1.1];
        let m = euler_matrix(angles[0], angles[1], angles[2], Axes::Rzyx);
        let back = euler_from_matrix(&m, Axes::Rzyx);
        for (a, b) in angles.iter().zip(back.iter()) {
            assert_close(*a, *b);
        }
    }

    #[test]
    fn test_rzyx_first_angle_rotates_about_z() {
        let m = euler_matrix(std::f64::consts::FRAC_PI_2, 0.0, 0.0, Axes::Rzyx);
        let v = m * Vector4::new(1.0, 0.0, 0.0, 0.0);
        assert_close(v[0], 0.0);
        assert_close(v[1], 1.0);
    }

    #[test]
    fn test_rigid_inverse_matches_general_inverse() {
        let m = coordinates_to_matrix([10.0, -5.0, 3.0], [20.0, 35.0, -60.0], Axes::Sxyz);
        let inv = rigid_inverse(&m);
        let expected = m.try_inverse().unwrap();
        assert!((inv - expected).norm() < 1e-9);
    }

    #[test]
    fn test_dynamic_reference_with_identity_reference() {
        let probe = RawPoseSample::new([1.0, 2.0, 3.0], [10.0, 20.0, 30.0]);
        let reference = RawPoseSample::new([0.0; 3], [0.0; 3]);
        let coord = dynamic_reference(&probe, &reference);
        assert_eq!(coord, [1.0, 2.0, -3.0, 10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_close(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_close(median(&mut [4.0, 1.0, 2.0, 3.0]), 2.5);
    }

    #[test]
    fn test_identity_quaternion_has_zero_angles() {
        let angles = euler_from_quaternion([1.0, 0.0, 0.0, 0.0], Axes::Rzyx);
        for a in angles {
            assert_close(a, 0.0);
        }
    }
}
