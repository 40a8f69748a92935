use crate::coregistration::{self, rigid_fit, rms_error};
use crate::session::SessionStore;
use crate::tracker::Tracker;
use crate::transform::{matrix_from_rows, matrix_to_rows};
use crate::types::RefMode;
use crate::{NavError, Result};
use nalgebra::{Matrix4, Point3};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const ICP_STATE_KEY: &str = "icp";

/// Digitized points further than this from the surface are discarded, in mm.
pub const MAX_POINT_DISTANCE: f64 = 20.0;
/// Fewer digitized points than this leave the rigid fit under-constrained.
pub const MIN_ICP_POINTS: usize = 5;
/// Mean pairwise distance below which the digitized cloud is considered too clustered.
pub const MIN_POINT_SPREAD: f64 = 25.0;

/// Registration target: the head surface, in image space with y mirrored.
///
/// This is the frame `transform_icp` applies the refinement in, so digitized
/// points are mirrored into it before they are kept.
pub trait SurfaceMesh: Send + Sync {
    fn closest_point(&self, point: &Point3<f64>) -> Point3<f64>;
    fn centroid(&self) -> Point3<f64>;

    fn distance(&self, point: &Point3<f64>) -> f64 {
        (self.closest_point(point) - point).norm()
    }
}

/// Pauses the real-time navigation consumer while ICP owns the probe.
#[cfg_attr(test, mockall::automock)]
pub trait NavigationControl {
    fn stop_navigation(&self);
    fn start_navigation(&self);
}

/// Interactive side of ICP: confirmation, point collection and result reporting.
pub trait IcpDialog {
    /// Ask whether to refine a registration with the given FRE.
    fn confirm(&mut self, fre: f64) -> bool;
    /// Collect points through `digitizer`. `false` aborts.
    fn digitize(&mut self, digitizer: &mut Digitizer<'_>) -> bool;
    fn report(&mut self, _result: &IcpResult) {}
    /// The digitized cloud was too clustered for a reliable fit.
    fn report_distribution(&mut self) {}
}

/// Source of the live probe tip in image space.
pub trait ProbeSource {
    /// `None` while the probe or the head marker is hidden.
    fn probe_in_image(&self) -> Option<[f64; 3]>;
}

/// Probe tip from the tracker, mapped through the fiducial registration.
pub struct RegisteredProbe<'a> {
    pub tracker: &'a Tracker,
    pub m_change: Matrix4<f64>,
    pub ref_mode: RefMode,
}

impl ProbeSource for RegisteredProbe<'_> {
    fn probe_in_image(&self) -> Option<[f64; 3]> {
        let reading = self.tracker.current_coordinates(self.ref_mode);
        if !(reading.probe_visible() && reading.head_visible()) {
            return None;
        }
        let (coord, _) = coregistration::corregistrate_probe(
            &self.m_change,
            None,
            &reading.raw,
            self.ref_mode,
            None,
        );
        Some([coord[0], coord[1], coord[2]])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    Added,
    MarkersHidden,
    /// Point rejected for lying further than [`MAX_POINT_DISTANCE`] from the surface.
    OffSurface,
}

/// Accumulates probe points on the surface for one ICP run.
pub struct Digitizer<'a> {
    source: &'a dyn ProbeSource,
    mesh: &'a dyn SurfaceMesh,
    points: Vec<Point3<f64>>,
}

impl<'a> Digitizer<'a> {
    pub fn new(source: &'a dyn ProbeSource, mesh: &'a dyn SurfaceMesh) -> Self {
        Self {
            source,
            mesh,
            points: Vec::new(),
        }
    }

    pub fn capture(&mut self) -> Capture {
        let Some(p) = self.source.probe_in_image() else {
            return Capture::MarkersHidden;
        };
        let p = Point3::new(p[0], -p[1], p[2]);
        if self.mesh.distance(&p) >= MAX_POINT_DISTANCE {
            log::debug!("Discarding ICP point {:?}: off surface", p);
            return Capture::OffSurface;
        }
        self.points.push(p);
        Capture::Added
    }

    pub fn undo_last(&mut self) -> Option<Point3<f64>> {
        self.points.pop()
    }

    pub fn reset(&mut self) {
        self.points.clear();
    }

    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    fn into_points(self) -> Vec<Point3<f64>> {
        self.points
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IcpParams {
    pub max_iterations: usize,
    pub start_by_matching_centroids: bool,
    /// Stop once the mean distance changes by less than this between iterations.
    pub min_mean_distance_change: f64,
    /// Stop once the mean distance falls below this.
    pub max_mean_distance: f64,
}

impl Default for IcpParams {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            start_by_matching_centroids: true,
            min_mean_distance_change: 1e-6,
            max_mean_distance: 0.01,
        }
    }
}

/// Outcome of one accepted ICP run.
#[derive(Debug, Clone, PartialEq)]
pub struct IcpResult {
    pub m_icp: Matrix4<f64>,
    pub prev_error: f64,
    pub final_error: f64,
    pub points: Vec<Point3<f64>>,
    pub transformed: Vec<Point3<f64>>,
}

fn transform_point(m: &Matrix4<f64>, p: &Point3<f64>) -> Point3<f64> {
    Point3::from_homogeneous(m * p.to_homogeneous()).unwrap_or(*p)
}

fn surface_rms(mesh: &dyn SurfaceMesh, points: &[Point3<f64>]) -> f64 {
    let distances: Vec<f64> = points.iter().map(|p| mesh.distance(p)).collect();
    rms_error(&distances)
}

fn mean_pairwise_distance(points: &[Point3<f64>]) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for (i, a) in points.iter().enumerate() {
        for b in &points[i + 1..] {
            total += (a - b).norm();
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

/// Rigid point-to-surface ICP. Returns the accumulated transform.
pub fn fit_to_surface(
    points: &[Point3<f64>],
    mesh: &dyn SurfaceMesh,
    params: &IcpParams,
) -> Result<Matrix4<f64>> {
    if points.len() < MIN_ICP_POINTS {
        return Err(NavError::State(format!(
            "ICP needs at least {} points, got {}",
            MIN_ICP_POINTS,
            points.len()
        )));
    }

    let mut m = Matrix4::identity();
    if params.start_by_matching_centroids {
        let n = points.len() as f64;
        let centroid = points.iter().fold(nalgebra::Vector3::zeros(), |acc, p| acc + p.coords) / n;
        m = Matrix4::new_translation(&(mesh.centroid().coords - centroid));
    }

    let mut current: Vec<Point3<f64>> = points.iter().map(|p| transform_point(&m, p)).collect();
    let mut prev_mean = f64::INFINITY;
    for iteration in 0..params.max_iterations {
        let closest: Vec<Point3<f64>> = current.iter().map(|p| mesh.closest_point(p)).collect();
        let step = rigid_fit(&current, &closest)?;
        m = step * m;
        current = points.iter().map(|p| transform_point(&m, p)).collect();

        let mean = current.iter().map(|p| mesh.distance(p)).sum::<f64>() / current.len() as f64;
        if mean < params.max_mean_distance
            || (prev_mean - mean).abs() < params.min_mean_distance_change
        {
            log::debug!("ICP converged after {} iterations (mean {:.4})", iteration + 1, mean);
            break;
        }
        prev_mean = mean;
    }
    Ok(m)
}

/// Everything a run needs from the current registration.
pub struct IcpContext<'a> {
    pub tracker: &'a Tracker,
    pub mesh: &'a dyn SurfaceMesh,
    pub m_change: Matrix4<f64>,
    pub ref_mode: RefMode,
    pub image_fiducials: [[f64; 3]; 3],
    /// Current fiducial registration error.
    pub fre: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IcpState {
    use_icp: bool,
    m_icp: Option<[[f64; 4]; 4]>,
    icp_fre: Option<f64>,
}

/// Optional ICP refinement on top of the fiducial registration.
pub struct IterativeClosestPoint {
    session: Arc<dyn SessionStore>,
    params: IcpParams,
    pub use_icp: bool,
    pub m_icp: Option<Matrix4<f64>>,
    pub icp_fre: Option<f64>,
}

impl IterativeClosestPoint {
    pub fn new(session: Arc<dyn SessionStore>) -> Self {
        let mut icp = Self {
            session,
            params: IcpParams::default(),
            use_icp: false,
            m_icp: None,
            icp_fre: None,
        };
        if let Err(e) = icp.load_state() {
            log::warn!("Discarding stored ICP state: {}", e);
            icp.use_icp = false;
            icp.m_icp = None;
            icp.icp_fre = None;
        }
        icp
    }

    pub fn with_params(mut self, params: IcpParams) -> Self {
        self.params = params;
        self
    }

    /// Transform to compose during coregistration, if ICP is active.
    pub fn active_transform(&self) -> Option<&Matrix4<f64>> {
        self.m_icp.as_ref().filter(|_| self.use_icp)
    }

    /// Confirm with the user, pause navigation, refine, resume.
    ///
    /// Does nothing while ICP is already in use. An aborted run keeps the prior registration.
    pub fn start_icp(
        &mut self,
        navigation: &dyn NavigationControl,
        dialog: &mut dyn IcpDialog,
        ctx: &IcpContext<'_>,
    ) -> Result<Option<IcpResult>> {
        if self.use_icp || !dialog.confirm(ctx.fre) {
            return Ok(None);
        }

        navigation.stop_navigation();
        let outcome = self.on_icp(dialog, ctx);
        let applied = match outcome {
            Ok(Some(result)) => {
                let (_, raw) = ctx.tracker.get_tracker_fiducials();
                self.m_icp = Some(result.m_icp);
                self.icp_fre = Some(coregistration::calculate_fre(
                    raw,
                    &ctx.image_fiducials,
                    ctx.ref_mode,
                    &ctx.m_change,
                    Some(&result.m_icp),
                ));
                self.set_icp(true).map(|_| Some(result))
            }
            Ok(None) => {
                log::info!("ICP cancelled");
                Ok(None)
            }
            Err(e) => Err(e),
        };
        navigation.start_navigation();
        applied
    }

    /// Digitize points and fit them to the surface. `None` on abort.
    pub fn on_icp(
        &self,
        dialog: &mut dyn IcpDialog,
        ctx: &IcpContext<'_>,
    ) -> Result<Option<IcpResult>> {
        let probe = RegisteredProbe {
            tracker: ctx.tracker,
            m_change: ctx.m_change,
            ref_mode: ctx.ref_mode,
        };
        let mut digitizer = Digitizer::new(&probe, ctx.mesh);
        if !dialog.digitize(&mut digitizer) {
            return Ok(None);
        }
        let points = digitizer.into_points();
        let result = self.refine(&points, ctx.mesh)?;
        if mean_pairwise_distance(&result.transformed) <= MIN_POINT_SPREAD {
            dialog.report_distribution();
        }
        dialog.report(&result);
        Ok(Some(result))
    }

    pub fn refine(&self, points: &[Point3<f64>], mesh: &dyn SurfaceMesh) -> Result<IcpResult> {
        let m_icp = fit_to_surface(points, mesh, &self.params)?;
        let transformed: Vec<Point3<f64>> =
            points.iter().map(|p| transform_point(&m_icp, p)).collect();
        let result = IcpResult {
            m_icp,
            prev_error: surface_rms(mesh, points),
            final_error: surface_rms(mesh, &transformed),
            points: points.to_vec(),
            transformed,
        };
        log::info!(
            "ICP error {:.3} -> {:.3} over {} points",
            result.prev_error,
            result.final_error,
            result.points.len()
        );
        Ok(result)
    }

    pub fn set_icp(&mut self, use_icp: bool) -> Result<()> {
        self.use_icp = use_icp;
        self.save_state()
    }

    pub fn reset_icp(&mut self) -> Result<()> {
        self.use_icp = false;
        self.m_icp = None;
        self.icp_fre = None;
        self.save_state()
    }

    pub fn fre_for_ui(&self) -> String {
        match self.icp_fre {
            Some(fre) if fre != 0.0 => format!("{:.2}", fre),
            _ => String::new(),
        }
    }

    pub fn save_state(&self) -> Result<()> {
        let state = IcpState {
            use_icp: self.use_icp,
            m_icp: self.m_icp.as_ref().map(matrix_to_rows),
            icp_fre: self.icp_fre,
        };
        self.session.set_state(ICP_STATE_KEY, serde_json::to_value(state)?)
    }

    pub fn load_state(&mut self) -> Result<()> {
        let Some(value) = self.session.get_state(ICP_STATE_KEY) else {
            return Ok(());
        };
        let state: IcpState = serde_json::from_value(value)?;
        self.use_icp = state.use_icp;
        self.m_icp = state.m_icp.as_ref().map(matrix_from_rows);
        self.icp_fre = state.icp_fre;
        Ok(())
    }
}
