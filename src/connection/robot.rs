use super::{create_connection, Collaborators, Connection, DeviceHandle, TrackerConnection};
use crate::types::{Configuration, ConnectionState, DeviceKind, LibMode};

/// Side effect run when a robot-proxy connection comes up or goes down.
#[cfg_attr(test, mockall::automock)]
pub trait RobotConnector: Send + Sync {
    fn connect_robot(&self, robot_ip: &str);
    fn disconnect_robot(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct NoRobot;

impl RobotConnector for NoRobot {
    fn connect_robot(&self, robot_ip: &str) {
        log::warn!("No robot connector installed, ignoring robot at {}", robot_ip);
    }

    fn disconnect_robot(&self) {}
}

/// Tracker connection used while a robot positions the coil.
///
/// Poses come from an inner connection of the user's choice. Lifecycle and read
/// calls forward to it; connecting also asks the robot connector to reach the
/// controller at the configured IP.
pub struct RobotConnection {
    configuration: Option<Configuration>,
    inner: Option<Box<Connection>>,
    state: ConnectionState,
    n_coils: usize,
    collab: Collaborators,
}

impl RobotConnection {
    pub fn new(n_coils: usize, collab: Collaborators) -> Self {
        Self {
            configuration: None,
            inner: None,
            state: ConnectionState::Unconfigured,
            n_coils,
            collab,
        }
    }

    pub fn robot_ip(&self) -> Option<&str> {
        match &self.configuration {
            Some(Configuration::Robot { robot_ip, .. }) => Some(robot_ip),
            _ => None,
        }
    }

    pub fn inner(&self) -> Option<&Connection> {
        self.inner.as_deref()
    }

    /// Build the inner connection described by the stored configuration, if not built yet.
    fn ensure_inner(&mut self) -> bool {
        if self.inner.is_some() {
            return true;
        }
        let Some(Configuration::Robot {
            tracker,
            tracker_configuration,
            ..
        }) = &self.configuration
        else {
            return false;
        };
        if *tracker == DeviceKind::Robot {
            log::warn!("Robot tracker cannot wrap another robot tracker");
            return false;
        }
        let mut inner = create_connection(*tracker, self.n_coils, &self.collab);
        inner.set_configuration(tracker_configuration.as_deref().cloned());
        self.inner = Some(Box::new(inner));
        true
    }
}

impl TrackerConnection for RobotConnection {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Robot
    }

    fn configure(&mut self) -> bool {
        if self.configuration.is_some() && self.ensure_inner() {
            return true;
        }
        let Some((tracker, robot_ip)) = self.collab.dialogs.robot() else {
            log::info!("Robot configuration cancelled");
            return false;
        };
        if tracker == DeviceKind::Robot {
            log::warn!("Robot tracker cannot wrap another robot tracker");
            return false;
        }

        let mut inner = create_connection(tracker, self.n_coils, &self.collab);
        if !inner.configure() {
            return false;
        }
        self.configuration = Some(Configuration::Robot {
            tracker,
            tracker_configuration: inner.configuration().map(Box::new),
            robot_ip,
        });
        self.inner = Some(Box::new(inner));
        self.state = ConnectionState::Configured;
        true
    }

    fn connect(&mut self) {
        if !self.ensure_inner() {
            log::warn!("Robot tracker is not configured");
            self.state = ConnectionState::Error;
            return;
        }
        let robot_ip = self.robot_ip().map(str::to_string);
        let Some(inner) = self.inner.as_mut() else {
            return;
        };

        inner.connect();
        if !inner.is_connected() {
            self.state = ConnectionState::Error;
            return;
        }
        if let Some(ip) = robot_ip {
            self.collab.robot.connect_robot(&ip);
        }
        self.state = ConnectionState::Connected;
    }

    fn disconnect(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.disconnect();
        }
        self.collab.robot.disconnect_robot();
        self.state = ConnectionState::Disconnected;
    }

    fn is_connected(&self) -> bool {
        self.inner.as_ref().is_some_and(|inner| inner.is_connected())
    }

    fn connection(&self) -> Option<DeviceHandle> {
        self.inner.as_ref().and_then(|inner| inner.connection())
    }

    fn configuration(&self) -> Option<Configuration> {
        self.configuration.clone()
    }

    fn set_configuration(&mut self, configuration: Option<Configuration>) {
        if configuration.is_some() && self.state == ConnectionState::Unconfigured {
            self.state = ConnectionState::Configured;
        }
        self.configuration = configuration;
        if !self.is_connected() {
            self.inner = None;
        }
    }

    fn lib_mode(&self) -> LibMode {
        self.inner
            .as_ref()
            .map(|inner| inner.lib_mode())
            .unwrap_or_default()
    }

    fn state(&self) -> ConnectionState {
        match (&self.inner, self.state) {
            (Some(inner), ConnectionState::Connected) => inner.state(),
            (_, state) => state,
        }
    }
}
