//! Robot positioning: the control worker and its session-side coordinator.
//!
//! The real-time loop feeds two bounded queues (`target` and `coil at target`);
//! the worker drains them, and while the objective is to track the target it
//! maps the tracker-space target into robot space and asks the controller to move.

use crate::connection::RobotConnector;
use crate::coregistration::{self, CoilRegistration};
use crate::elfin::{Elfin, ElfinServer, MotionType, RobotApi, DEFAULT_PORT};
use crate::session::{self, SessionStore};
use crate::tracker::Tracker;
use crate::transform::{self, matrix_from_rows, matrix_to_rows, Axes};
use crate::worker::{self, CancelHandle, CancelToken};
use crate::{NavError, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub const ROBOT_CONFIG_KEY: &str = "robot";
/// Depth of each real-time queue. Updates beyond it are dropped.
pub const QUEUE_CAPACITY: usize = 1;
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(100);
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RobotObjective {
    #[default]
    None = 0,
    TrackTarget = 1,
    MoveAwayFromHead = 2,
}

impl RobotObjective {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::TrackTarget,
            2 => Self::MoveAwayFromHead,
            _ => Self::None,
        }
    }
}

/// Opens a controller session for an IP. Runs on the worker thread.
pub type RobotApiFactory = Arc<dyn Fn(&str) -> Result<Box<dyn RobotApi>> + Send + Sync>;

pub fn elfin_factory() -> RobotApiFactory {
    Arc::new(|ip: &str| -> Result<Box<dyn RobotApi>> {
        Ok(Box::new(Elfin::connect(ip, DEFAULT_PORT)?))
    })
}

/// Robot state shared between the worker and its owner.
#[derive(Debug, Default)]
struct Shared {
    objective: AtomicU8,
    connected: AtomicBool,
    tracker_to_robot: Mutex<Option<Matrix4<f64>>>,
}

/// Robot pose for a tracker-space target: `[x, y, z, rx, ry, rz]`, `sxyz` degrees.
pub fn robot_pose(tracker_to_robot: &Matrix4<f64>, m_target: &Matrix4<f64>) -> [f64; 6] {
    let (p, a) = transform::matrix_to_coordinates(&(tracker_to_robot * m_target), Axes::Sxyz);
    [p[0], p[1], p[2], a[0], a[1], a[2]]
}

/// Background robot-control worker.
pub struct RobotBridge {
    cancel: CancelHandle,
    thread: Option<JoinHandle<()>>,
    target_tx: Sender<Option<Matrix4<f64>>>,
    /// Producer-side handle on the target queue, used to discard a stale update.
    target_drain: Receiver<Option<Matrix4<f64>>>,
    at_target_tx: Sender<bool>,
    shared: Arc<Shared>,
}

impl RobotBridge {
    /// Spawn the worker; it connects to `robot_ip` through `factory` before looping.
    pub fn start(
        factory: RobotApiFactory,
        robot_ip: &str,
        tracker_to_robot: Option<Matrix4<f64>>,
        period: Duration,
    ) -> Result<RobotBridge> {
        let (cancel, token) = worker::cancellation();
        let (target_tx, target_rx) = bounded(QUEUE_CAPACITY);
        let (at_target_tx, at_target_rx) = bounded(QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            tracker_to_robot: Mutex::new(tracker_to_robot),
            ..Shared::default()
        });

        let target_drain = target_rx.clone();
        let worker_shared = shared.clone();
        let ip = robot_ip.to_string();
        let thread = std::thread::Builder::new()
            .name("neuronav-robot".into())
            .spawn(move || {
                let api = match factory(&ip) {
                    Ok(api) => api,
                    Err(e) => {
                        log::warn!("Could not connect to robot at {}: {}", ip, e);
                        return;
                    }
                };
                worker_shared.connected.store(true, Ordering::SeqCst);
                let queues = Queues {
                    target: target_rx,
                    at_target: at_target_rx,
                };
                control_loop(ElfinServer::new(api), queues, &worker_shared, token, period);
                worker_shared.connected.store(false, Ordering::SeqCst);
            })
            .map_err(|e| NavError::State(format!("Failed to spawn robot thread: {}", e)))?;

        Ok(RobotBridge {
            cancel,
            thread: Some(thread),
            target_tx,
            target_drain,
            at_target_tx,
            shared,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Queue a new tracker-space target. Returns false if dropped; use
    /// [`clear_target`](Self::clear_target) to forget the target.
    pub fn push_target(&self, target: Option<Matrix4<f64>>) -> bool {
        try_push(&self.target_tx, target, "target")
    }

    /// Replace any queued target with a clear. Unlike updates, a clear is never dropped
    /// for a full queue.
    pub fn clear_target(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        while self.target_drain.try_recv().is_ok() {}
        match self.target_tx.try_send(None) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                // A concurrent update got in first.
                while self.target_drain.try_recv().is_ok() {}
                self.target_tx.try_send(None).is_ok()
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Queue the coil-at-target flag. Returns false if dropped.
    pub fn push_at_target(&self, at_target: bool) -> bool {
        try_push(&self.at_target_tx, at_target, "coil at target")
    }

    pub fn set_objective(&self, objective: RobotObjective) {
        self.shared.objective.store(objective as u8, Ordering::SeqCst);
    }

    pub fn set_tracker_to_robot(&self, matrix: Matrix4<f64>) {
        if let Ok(mut slot) = self.shared.tracker_to_robot.lock() {
            *slot = Some(matrix);
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            worker::join_with_timeout(thread, JOIN_TIMEOUT);
        }
    }
}

impl Drop for RobotBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn try_push<T>(tx: &Sender<T>, value: T, queue: &str) -> bool {
    match tx.try_send(value) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            log::trace!("Robot {} queue full, dropping update", queue);
            false
        }
        Err(TrySendError::Disconnected(_)) => {
            log::trace!("Robot worker gone, dropping {} update", queue);
            false
        }
    }
}

struct Queues {
    target: Receiver<Option<Matrix4<f64>>>,
    at_target: Receiver<bool>,
}

fn control_loop<A: RobotApi>(
    mut server: ElfinServer<A>,
    queues: Queues,
    shared: &Shared,
    token: CancelToken,
    period: Duration,
) {
    let mut target: Option<Matrix4<f64>> = None;
    let mut at_target = false;
    log::info!("Robot worker started");

    loop {
        if token.is_cancelled() {
            break;
        }

        loop {
            match queues.target.try_recv() {
                Ok(update) => target = update,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        while let Ok(flag) = queues.at_target.try_recv() {
            at_target = flag;
        }

        let objective = RobotObjective::from_u8(shared.objective.load(Ordering::SeqCst));
        let tracker_to_robot = shared.tracker_to_robot.lock().ok().and_then(|m| *m);
        if let (RobotObjective::TrackTarget, Some(m_target), Some(m_map), false) =
            (objective, target, tracker_to_robot, at_target)
        {
            match server.send_coordinates(robot_pose(&m_map, &m_target), MotionType::Normal) {
                Ok(_) => {}
                Err(NavError::Protocol { command, code }) => {
                    log::warn!("Robot rejected {}: {}", command, code);
                }
                Err(e) => {
                    log::warn!("Robot connection lost: {}", e);
                    break;
                }
            }
        }

        if token.sleep(period) {
            break;
        }
    }
    log::info!("Robot worker stopped");
}

/// Session config under `robot`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_to_robot: Option<[[f64; 4]; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_coil: Option<String>,
}

/// Messages raised by the tracker side of a robot connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RobotEvent {
    Connect(String),
    Disconnect,
}

/// [`RobotConnector`] that forwards to a [`Robot`] through a channel.
#[derive(Debug, Clone)]
pub struct RobotEvents {
    tx: Sender<RobotEvent>,
}

impl RobotEvents {
    pub fn channel() -> (RobotEvents, Receiver<RobotEvent>) {
        let (tx, rx) = bounded(8);
        (RobotEvents { tx }, rx)
    }
}

impl RobotConnector for RobotEvents {
    fn connect_robot(&self, robot_ip: &str) {
        if self.tx.try_send(RobotEvent::Connect(robot_ip.to_string())).is_err() {
            log::warn!("Robot event queue unavailable, connect to {} dropped", robot_ip);
        }
    }

    fn disconnect_robot(&self) {
        if self.tx.try_send(RobotEvent::Disconnect).is_err() {
            log::debug!("Robot event queue unavailable, disconnect dropped");
        }
    }
}

/// Registration data needed to express an image target in tracker space.
pub struct TargetRegistration<'a> {
    pub m_change: Option<Matrix4<f64>>,
    pub coils: &'a HashMap<String, CoilRegistration>,
    pub m_icp: Option<&'a Matrix4<f64>>,
}

/// Session-side robot state: configuration, objective and the current target.
pub struct Robot {
    session: Arc<dyn SessionStore>,
    factory: RobotApiFactory,
    period: Duration,
    config: RobotConfig,
    objective: RobotObjective,
    /// Image-space target with y flipped.
    target: Option<[f64; 6]>,
    bridge: Option<RobotBridge>,
}

impl Robot {
    pub fn new(session: Arc<dyn SessionStore>, factory: RobotApiFactory) -> Self {
        let period = session::read_env_u64("NEURONAV_ROBOT_PERIOD_MS")
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PERIOD);
        let mut robot = Self {
            session,
            factory,
            period,
            config: RobotConfig::default(),
            objective: RobotObjective::None,
            target: None,
            bridge: None,
        };
        robot.load_config();
        robot
    }

    /// True when both the IP and the tracker-to-robot matrix are known.
    pub fn load_config(&mut self) -> bool {
        self.config = self
            .session
            .get_config(ROBOT_CONFIG_KEY)
            .and_then(|value| match serde_json::from_value(value) {
                Ok(config) => Some(config),
                Err(e) => {
                    log::warn!("Ignoring malformed {} config: {}", ROBOT_CONFIG_KEY, e);
                    None
                }
            })
            .unwrap_or_default();
        self.config.robot_ip.is_some() && self.config.tracker_to_robot.is_some()
    }

    pub fn save_config(&self) -> Result<()> {
        self.session
            .set_config(ROBOT_CONFIG_KEY, serde_json::to_value(&self.config)?)
    }

    pub fn config(&self) -> &RobotConfig {
        &self.config
    }

    pub fn set_robot_ip(&mut self, ip: impl Into<String>) {
        self.config.robot_ip = Some(ip.into());
    }

    pub fn tracker_to_robot(&self) -> Option<Matrix4<f64>> {
        self.config.tracker_to_robot.as_ref().map(matrix_from_rows)
    }

    pub fn set_tracker_to_robot(&mut self, matrix: Matrix4<f64>) -> Result<()> {
        self.config.tracker_to_robot = Some(matrix_to_rows(&matrix));
        if let Some(bridge) = &self.bridge {
            bridge.set_tracker_to_robot(matrix);
        }
        self.save_config()
    }

    pub fn coil_name(&self) -> Option<&str> {
        self.config.robot_coil.as_deref()
    }

    pub fn set_coil_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.config.robot_coil = Some(name.into());
        self.save_config()
    }

    /// Start a worker for the configured IP, joining any previous one first.
    pub fn connect_to_robot(&mut self) -> Result<()> {
        let ip = self
            .config
            .robot_ip
            .clone()
            .ok_or_else(|| NavError::Configuration("robot IP not set".into()))?;
        self.disconnect_robot();
        let bridge = RobotBridge::start(
            self.factory.clone(),
            &ip,
            self.tracker_to_robot(),
            self.period,
        )?;
        bridge.set_objective(self.objective);
        self.bridge = Some(bridge);
        log::info!("Robot worker launched for {}", ip);
        Ok(())
    }

    pub fn disconnect_robot(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.stop();
        }
    }

    /// Apply events raised by a robot tracker connection.
    pub fn process_events(&mut self, events: &Receiver<RobotEvent>) -> Result<()> {
        while let Ok(event) = events.try_recv() {
            match event {
                RobotEvent::Connect(ip) => {
                    self.set_robot_ip(ip);
                    self.save_config()?;
                    self.connect_to_robot()?;
                }
                RobotEvent::Disconnect => self.disconnect_robot(),
            }
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.bridge.as_ref().is_some_and(RobotBridge::is_connected)
    }

    /// Connected, with a chosen coil that has a registration.
    pub fn is_ready(&self, coils: &HashMap<String, CoilRegistration>) -> bool {
        self.is_connected() && self.coil_name().is_some_and(|name| coils.contains_key(name))
    }

    pub fn objective(&self) -> RobotObjective {
        self.objective
    }

    pub fn set_objective(&mut self, objective: RobotObjective) {
        if self.objective == objective {
            return;
        }
        self.objective = objective;
        if let Some(bridge) = &self.bridge {
            bridge.set_objective(objective);
        }
        log::info!("Robot objective set to {:?}", objective);
    }

    pub fn target(&self) -> Option<[f64; 6]> {
        self.target
    }

    /// Take a marker pose in image space as the new target and forward it.
    pub fn set_target(
        &mut self,
        position: [f64; 3],
        orientation: [f64; 3],
        tracker: &Tracker,
        registration: &TargetRegistration<'_>,
    ) -> Result<bool> {
        let mut coord = [
            position[0],
            position[1],
            position[2],
            orientation[0],
            orientation[1],
            orientation[2],
        ];
        coord[1] = -coord[1];
        self.target = Some(coord);
        self.send_target_to_robot(tracker, registration)
    }

    pub fn unset_target(&mut self) {
        self.target = None;
        if let Some(bridge) = &self.bridge {
            if !bridge.clear_target() {
                log::warn!("Robot worker gone, target clear not delivered");
            }
        }
    }

    pub fn set_coil_at_target(&self, at_target: bool) -> bool {
        self.bridge
            .as_ref()
            .is_some_and(|bridge| bridge.push_at_target(at_target))
    }

    /// Express the target in tracker space and queue it for the worker.
    ///
    /// Returns false when no target, registration or coil is available, or when the
    /// update was dropped.
    pub fn send_target_to_robot(
        &self,
        tracker: &Tracker,
        registration: &TargetRegistration<'_>,
    ) -> Result<bool> {
        let Some(target) = self.target_in_tracker(tracker, registration)? else {
            return Ok(false);
        };
        Ok(self
            .bridge
            .as_ref()
            .is_some_and(|bridge| bridge.push_target(Some(target))))
    }

    pub fn target_in_tracker(
        &self,
        tracker: &Tracker,
        registration: &TargetRegistration<'_>,
    ) -> Result<Option<Matrix4<f64>>> {
        let Some(mut target) = self.target else {
            return Ok(None);
        };
        let (Some(m_change), Some(coil)) = (
            registration.m_change,
            self.coil_name().and_then(|name| registration.coils.get(name)),
        ) else {
            return Ok(None);
        };
        target[1] = -target[1];
        let coord_raw: Vec<[f64; 6]> = tracker
            .snapshot()
            .frame
            .bodies
            .iter()
            .map(|b| b.to_array())
            .collect();
        coregistration::image_to_tracker(&m_change, &coord_raw, &target, registration.m_icp, coil)
            .map(Some)
    }
}

impl Drop for Robot {
    fn drop(&mut self) {
        self.disconnect_robot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Collaborators;
    use crate::elfin::{MockRobotApi, MoveState};
    use crate::session::MemorySession;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn counting_factory(moves: Arc<AtomicUsize>) -> RobotApiFactory {
        Arc::new(move |_ip: &str| {
            let moves = moves.clone();
            let mut api = MockRobotApi::new();
            api.expect_read_move_state()
                .returning(|| Ok(MoveState::FreeToMove));
            api.expect_move_l().returning(move |_| {
                moves.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            });
            Ok(Box::new(api) as Box<dyn RobotApi>)
        })
    }

    #[test]
    fn test_queues_drop_when_full() {
        let (tx, rx) = bounded::<bool>(QUEUE_CAPACITY);
        assert!(try_push(&tx, true, "test"));
        assert!(!try_push(&tx, false, "test"));
        assert_eq!(rx.try_recv(), Ok(true));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_worker_moves_only_while_tracking() {
        let moves = Arc::new(AtomicUsize::new(0));
        let bridge = RobotBridge::start(
            counting_factory(moves.clone()),
            "127.0.0.1",
            Some(Matrix4::identity()),
            Duration::from_millis(2),
        )
        .unwrap();
        wait_for(|| bridge.is_connected());

        bridge.push_target(Some(Matrix4::new_translation(&nalgebra::Vector3::new(1.0, 2.0, 3.0))));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(moves.load(Ordering::SeqCst), 0);

        bridge.set_objective(RobotObjective::TrackTarget);
        wait_for(|| moves.load(Ordering::SeqCst) > 0);

        bridge.push_at_target(true);
        std::thread::sleep(Duration::from_millis(20));
        let settled = moves.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(moves.load(Ordering::SeqCst), settled);
        bridge.stop();
    }

    #[test]
    fn test_clear_behind_queued_target_stops_moves() {
        let moves = Arc::new(AtomicUsize::new(0));
        let bridge = RobotBridge::start(
            counting_factory(moves.clone()),
            "127.0.0.1",
            Some(Matrix4::identity()),
            Duration::from_millis(300),
        )
        .unwrap();
        wait_for(|| bridge.is_connected());
        // Let the worker finish its first pass and go to sleep.
        std::thread::sleep(Duration::from_millis(50));

        bridge.set_objective(RobotObjective::TrackTarget);
        assert!(bridge.push_target(Some(Matrix4::identity())));
        assert!(bridge.clear_target());
        std::thread::sleep(Duration::from_millis(700));
        assert_eq!(moves.load(Ordering::SeqCst), 0);
        bridge.stop();
    }

    #[test]
    fn test_socket_error_degrades_to_disconnected() {
        let factory: RobotApiFactory = Arc::new(|_ip: &str| {
            let mut api = MockRobotApi::new();
            api.expect_read_move_state().returning(|| {
                Err(NavError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset)))
            });
            Ok(Box::new(api) as Box<dyn RobotApi>)
        });
        let bridge = RobotBridge::start(
            factory,
            "127.0.0.1",
            Some(Matrix4::identity()),
            Duration::from_millis(2),
        )
        .unwrap();
        bridge.set_objective(RobotObjective::TrackTarget);
        bridge.push_target(Some(Matrix4::identity()));
        wait_for(|| !bridge.is_running());
        assert!(!bridge.is_connected());
    }

    #[test]
    fn test_unreachable_robot_never_connects() {
        let factory: RobotApiFactory =
            Arc::new(|ip: &str| Err(NavError::Configuration(format!("no route to {}", ip))));
        let bridge = RobotBridge::start(factory, "10.0.0.1", None, DEFAULT_PERIOD).unwrap();
        wait_for(|| !bridge.is_running());
        assert!(!bridge.is_connected());
    }

    #[test]
    fn test_robot_pose_maps_through_tracker_to_robot() {
        let m_map = Matrix4::new_translation(&nalgebra::Vector3::new(100.0, 0.0, 0.0));
        let pose = robot_pose(&m_map, &Matrix4::identity());
        assert!((pose[0] - 100.0).abs() < 1e-9);
        assert!(pose[3..].iter().all(|a| a.abs() < 1e-9));
    }

    #[test]
    fn test_config_round_trip_and_load_result() {
        let session: Arc<dyn SessionStore> = Arc::new(MemorySession::new());
        let mut robot = Robot::new(session.clone(), elfin_factory());
        assert!(!robot.load_config());

        robot.set_robot_ip("192.168.200.251");
        robot.set_tracker_to_robot(Matrix4::identity()).unwrap();
        robot.set_coil_name("coil-a").unwrap();

        let mut restored = Robot::new(session, elfin_factory());
        assert!(restored.load_config());
        assert_eq!(restored.config().robot_ip.as_deref(), Some("192.168.200.251"));
        assert_eq!(restored.coil_name(), Some("coil-a"));
        assert_eq!(restored.tracker_to_robot(), Some(Matrix4::identity()));
    }

    #[test]
    fn test_objective_and_target_flip() {
        let session: Arc<dyn SessionStore> = Arc::new(MemorySession::new());
        let tracker = Tracker::new(session.clone(), Collaborators::default());
        let mut robot = Robot::new(session, elfin_factory());
        robot.set_objective(RobotObjective::TrackTarget);
        robot.set_objective(RobotObjective::TrackTarget);
        assert_eq!(robot.objective(), RobotObjective::TrackTarget);

        let coils = HashMap::new();
        let registration = TargetRegistration {
            m_change: None,
            coils: &coils,
            m_icp: None,
        };
        let sent = robot
            .set_target([1.0, 2.0, 3.0], [0.0, 0.0, 0.0], &tracker, &registration)
            .unwrap();
        assert!(!sent);
        assert_eq!(robot.target(), Some([1.0, -2.0, 3.0, 0.0, 0.0, 0.0]));

        robot.unset_target();
        assert!(robot.target().is_none());
    }

    #[test]
    fn test_target_in_tracker_uses_coil_registration() {
        let session: Arc<dyn SessionStore> = Arc::new(MemorySession::new());
        let tracker = Tracker::new(session.clone(), Collaborators::default());
        let mut robot = Robot::new(session, elfin_factory());
        robot.set_coil_name("coil-a").unwrap();

        let mut coils = HashMap::new();
        coils.insert("coil-a".to_string(), CoilRegistration::identity(2));
        let registration = TargetRegistration {
            m_change: Some(Matrix4::identity()),
            coils: &coils,
            m_icp: None,
        };
        robot
            .set_target([10.0, 20.0, 30.0], [0.0; 3], &tracker, &registration)
            .unwrap();
        let m = robot.target_in_tracker(&tracker, &registration).unwrap().unwrap();
        assert!((m[(0, 3)] - 10.0).abs() < 1e-9);
        assert!((m[(1, 3)] - 20.0).abs() < 1e-9);
        assert!((m[(2, 3)] + 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_connector_events_reach_robot() {
        let (events, rx) = RobotEvents::channel();
        events.connect_robot("10.1.1.1");
        events.disconnect_robot();

        let session: Arc<dyn SessionStore> = Arc::new(MemorySession::new());
        let moves = Arc::new(AtomicUsize::new(0));
        let mut robot = Robot::new(session, counting_factory(moves));
        robot.process_events(&rx).unwrap();
        assert_eq!(robot.config().robot_ip.as_deref(), Some("10.1.1.1"));
        assert!(!robot.is_connected());
    }

    #[test]
    fn test_connector_survives_full_and_closed_queue() {
        let (events, rx) = RobotEvents::channel();
        for _ in 0..8 {
            events.disconnect_robot();
        }
        events.disconnect_robot();
        assert_eq!(rx.len(), 8);

        drop(rx);
        events.connect_robot("10.1.1.1");
        events.disconnect_robot();
    }
}
