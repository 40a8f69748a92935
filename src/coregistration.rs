//! Tracker-to-image registration algebra.
//!
//! Conventions: tracker poses use `rzyx` Euler angles, image poses `sxyz`,
//! all in degrees. Tracker positions carry a z flip before they are mapped
//! into image space.

use crate::transform::{self, Axes};
use crate::types::{RefMode, PROBE, REFERENCE};
use crate::{NavError, Result};
use nalgebra::{Matrix3, Matrix4, Point3, Vector3, Vector4};

/// Stylus orientation used when none was recorded: a flip over the image x axis.
pub fn default_stylus() -> Matrix3<f64> {
    let mut r = Matrix3::identity();
    r[(0, 0)] = -1.0;
    r
}

/// Least-squares rigid transform (no scale) taking `source` onto `target`.
pub fn rigid_fit(source: &[Point3<f64>], target: &[Point3<f64>]) -> Result<Matrix4<f64>> {
    if source.len() != target.len() || source.len() < 3 {
        return Err(NavError::State(format!(
            "rigid fit needs at least 3 paired points, got {} and {}",
            source.len(),
            target.len()
        )));
    }
    let n = source.len() as f64;
    let src_c = source.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;
    let dst_c = target.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;

    let mut h = Matrix3::zeros();
    for (s, d) in source.iter().zip(target.iter()) {
        h += (s.coords - src_c) * (d.coords - dst_c).transpose();
    }

    let svd = h.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(NavError::State("SVD did not converge".into()));
    };
    let mut v = v_t.transpose();
    let mut r = v * u.transpose();
    if r.determinant() < 0.0 {
        v.column_mut(2).neg_mut();
        r = v * u.transpose();
    }
    let t = dst_c - r * src_c;

    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
    m.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);
    Ok(m)
}

/// `m_change`: rigid map from the tracker fiducials onto the image fiducials.
pub fn fiducial_transform(
    image_fiducials: &[[f64; 3]; 3],
    tracker_fiducials: &[[f64; 3]; 3],
) -> Result<Matrix4<f64>> {
    if image_fiducials
        .iter()
        .chain(tracker_fiducials.iter())
        .flatten()
        .any(|v| v.is_nan())
    {
        return Err(NavError::State("all fiducials must be set before registration".into()));
    }
    let src: Vec<Point3<f64>> = tracker_fiducials.iter().map(|p| Point3::from(*p)).collect();
    let dst: Vec<Point3<f64>> = image_fiducials.iter().map(|p| Point3::from(*p)).collect();
    rigid_fit(&src, &dst)
}

/// sqrt(sum(d_i^2) / n) over paired points.
pub fn rms_error(errors: &[f64]) -> f64 {
    if errors.is_empty() {
        return 0.0;
    }
    (errors.iter().map(|d| d * d).sum::<f64>() / errors.len() as f64).sqrt()
}

/// Probe transform in the frame used for registration: relative to the reference
/// body in dynamic mode, z flipped in both modes.
pub fn probe_in_reference(coord_raw: &[[f64; 6]], ref_mode: RefMode) -> Matrix4<f64> {
    let m_probe = marker_matrix(coord_raw, PROBE);
    let mut m = match ref_mode {
        RefMode::Dynamic => {
            transform::rigid_inverse(&marker_matrix(coord_raw, REFERENCE)) * m_probe
        }
        RefMode::Static => m_probe,
    };
    m[(2, 3)] = -m[(2, 3)];
    m
}

fn marker_matrix(coord_raw: &[[f64; 6]], body: usize) -> Matrix4<f64> {
    let row = coord_raw.get(body).copied().unwrap_or([0.0; 6]);
    transform::coordinates_to_matrix([row[0], row[1], row[2]], [row[3], row[4], row[5]], Axes::Rzyx)
}

/// Fiducial registration error.
///
/// Each tracker fiducial is rebuilt from its raw probe/reference rows, mapped
/// through `m_change` (and `m_icp` when given) and compared with its image fiducial.
pub fn calculate_fre(
    tracker_fiducials_raw: &[[f64; 6]; 6],
    image_fiducials: &[[f64; 3]; 3],
    ref_mode: RefMode,
    m_change: &Matrix4<f64>,
    m_icp: Option<&Matrix4<f64>>,
) -> f64 {
    let distances: Vec<f64> = (0..3)
        .map(|i| {
            let rows = [tracker_fiducials_raw[2 * i], tracker_fiducials_raw[2 * i + 1]];
            let m_img = apply_icp(m_change * probe_in_reference(&rows, ref_mode), m_icp);
            let p = Vector3::new(m_img[(0, 3)], m_img[(1, 3)], m_img[(2, 3)]);
            (p - Vector3::from(image_fiducials[i])).norm()
        })
        .collect();
    rms_error(&distances)
}

/// Move the translation of `m_img` through `m_icp`. The y axis is mirrored around the map.
pub fn transform_icp(mut m_img: Matrix4<f64>, m_icp: &Matrix4<f64>) -> Matrix4<f64> {
    let coord = Vector4::new(m_img[(0, 3)], -m_img[(1, 3)], m_img[(2, 3)], 1.0);
    let moved = m_icp * coord;
    m_img[(0, 3)] = moved[0];
    m_img[(1, 3)] = -moved[1];
    m_img[(2, 3)] = moved[2];
    m_img
}

pub fn inverse_transform_icp(m_img: Matrix4<f64>, m_icp: &Matrix4<f64>) -> Matrix4<f64> {
    transform_icp(m_img, &transform::rigid_inverse(m_icp))
}

pub fn apply_icp(m_img: Matrix4<f64>, m_icp: Option<&Matrix4<f64>>) -> Matrix4<f64> {
    match m_icp {
        Some(m_icp) => transform_icp(m_img, m_icp),
        None => m_img,
    }
}

/// Stylus pose in image space, as `[x, y, z, a, b, g]` (`sxyz`, degrees) and as a matrix.
pub fn corregistrate_probe(
    m_change: &Matrix4<f64>,
    r_stylus: Option<&Matrix3<f64>>,
    coord_raw: &[[f64; 6]],
    ref_mode: RefMode,
    m_icp: Option<&Matrix4<f64>>,
) -> ([f64; 6], Matrix4<f64>) {
    let r_stylus = r_stylus.copied().unwrap_or_else(default_stylus);
    let m_probe_ref = probe_in_reference(coord_raw, ref_mode);
    let mut m_img = apply_icp(m_change * m_probe_ref, m_icp);

    // Tracker stylus points along x, image stylus along y.
    let r = transform::euler_matrix(0.0, 0.0, (-90f64).to_radians(), Axes::Rxyz)
        .fixed_view::<3, 3>(0, 0)
        .into_owned();
    let r_probe: Matrix3<f64> = m_probe_ref.fixed_view::<3, 3>(0, 0).into_owned();
    let r_img = r_stylus * r * r_probe * r.transpose();
    m_img.fixed_view_mut::<3, 3>(0, 0).copy_from(&r_img);

    (pose_of(&m_img), m_img)
}

fn pose_of(m: &Matrix4<f64>) -> [f64; 6] {
    let (p, a) = transform::matrix_to_coordinates(m, Axes::Sxyz);
    [p[0], p[1], p[2], a[0], a[1], a[2]]
}

/// Coil registration: how the coil marker relates to the coil center and its 3-D model.
#[derive(Debug, Clone, PartialEq)]
pub struct CoilRegistration {
    /// Body index of the coil marker in a frame.
    pub obj_id: usize,
    pub t_obj_raw: Matrix4<f64>,
    pub s0_raw: Matrix4<f64>,
    pub r_s0_raw: Matrix4<f64>,
    pub s0_dyn: Matrix4<f64>,
    pub m_obj_raw: Matrix4<f64>,
    pub r_obj_img: Matrix4<f64>,
}

impl CoilRegistration {
    /// Coil marker coincides with the coil center.
    pub fn identity(obj_id: usize) -> Self {
        Self {
            obj_id,
            t_obj_raw: Matrix4::identity(),
            s0_raw: Matrix4::identity(),
            r_s0_raw: Matrix4::identity(),
            s0_dyn: Matrix4::identity(),
            m_obj_raw: Matrix4::identity(),
            r_obj_img: Matrix4::identity(),
        }
    }
}

fn inverse(m: &Matrix4<f64>) -> Result<Matrix4<f64>> {
    m.try_inverse()
        .ok_or_else(|| NavError::State("singular registration matrix".into()))
}

/// Tracker-space coil pose that puts the coil on an image-space `target`.
///
/// `target` is `[x, y, z, a, b, g]` (`sxyz`, degrees). Rotation follows the coil
/// registration; translation goes through `m_change` and the reference body.
pub fn image_to_tracker(
    m_change: &Matrix4<f64>,
    coord_raw: &[[f64; 6]],
    target: &[f64; 6],
    m_icp: Option<&Matrix4<f64>>,
    coil: &CoilRegistration,
) -> Result<Matrix4<f64>> {
    let mut m_target_in_image = transform::coordinates_to_matrix(
        [target[0], target[1], target[2]],
        [target[3], target[4], target[5]],
        Axes::Sxyz,
    );
    if let Some(m_icp) = m_icp {
        m_target_in_image = inverse_transform_icp(m_target_in_image, m_icp);
    }

    let mut m_trk = inverse(m_change)? * m_target_in_image;
    m_trk[(2, 3)] = -m_trk[(2, 3)];
    let m_probe_ref = coil.s0_dyn
        * coil.m_obj_raw
        * inverse(&coil.r_obj_img)?
        * m_target_in_image
        * inverse(&coil.m_obj_raw)?;
    m_trk
        .fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&m_probe_ref.fixed_view::<3, 3>(0, 0));

    let m_probe = marker_matrix(coord_raw, REFERENCE) * m_trk;
    let mut t_probe = Matrix4::identity();
    t_probe.set_column(3, &m_probe.column(3));
    let mut r_probe = Matrix4::identity();
    r_probe
        .fixed_view_mut::<4, 3>(0, 0)
        .copy_from(&m_probe.fixed_view::<4, 3>(0, 0));

    let t_offset_aux = inverse(&coil.r_s0_raw)? * r_probe * coil.t_obj_raw;
    let mut t_offset = Matrix4::identity();
    t_offset.set_column(3, &t_offset_aux.column(3));
    let t_probe_raw = coil.s0_raw * inverse(&t_offset)? * inverse(&coil.s0_raw)? * t_probe;

    let mut m_target_in_tracker = Matrix4::identity();
    m_target_in_tracker.set_column(3, &t_probe_raw.column(3));
    m_target_in_tracker
        .fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&r_probe.fixed_view::<3, 3>(0, 0));
    Ok(m_target_in_tracker)
}

/// Pose of `image` in the frame of `target`, both `sxyz` in degrees.
pub fn relative_distance_to_target(target: &[f64; 6], image: &[f64; 6]) -> [f64; 6] {
    let m_target = transform::coordinates_to_matrix(
        [target[0], target[1], target[2]],
        [target[3], target[4], target[5]],
        Axes::Sxyz,
    );
    let m_img = transform::coordinates_to_matrix(
        [image[0], image[1], image[2]],
        [image[3], image[4], image[5]],
        Axes::Sxyz,
    );
    pose_of(&(transform::rigid_inverse(&m_target) * m_img))
}
