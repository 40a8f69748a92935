//! Client for the Elfin cobot controller's ASCII command protocol.
//!
//! Requests are `Command[,robot_id][,args...],;`. Replies are comma separated
//! with `OK` or `Fail` in field 1; a failure carries its code in field 2 and a
//! multi-value reply carries its values in fields `2..len-1`.

use crate::{NavError, Result};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 10003;
pub const MESSAGE_SIZE: usize = 1024;
pub const ROBOT_ID: u32 = 0;
const END_MSG: &str = ",;";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
/// Settle time after a group stop before the next command.
pub const STOP_SETTLE: Duration = Duration::from_millis(100);

/// Result of `ReadMoveState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveState {
    FreeToMove,
    InMotion,
    Waiting,
    Error,
    Other(i64),
}

impl MoveState {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::FreeToMove,
            1009 => Self::InMotion,
            1013 => Self::Waiting,
            1025 => Self::Error,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionType {
    #[default]
    Normal,
    LinearOut,
    Arc,
}

/// Build one request line.
pub fn format_request(command: &str, robot_id: Option<u32>, args: &[String]) -> String {
    let mut message = command.to_string();
    if let Some(id) = robot_id {
        message.push(',');
        message.push_str(&id.to_string());
    }
    for arg in args {
        message.push(',');
        message.push_str(arg);
    }
    message.push_str(END_MSG);
    message
}

/// Split a reply into its payload values, or a `Protocol` error for `Fail`.
pub fn parse_reply(command: &str, reply: &str) -> Result<Vec<String>> {
    let fields: Vec<&str> = reply.trim_end_matches(['\r', '\n', '\0']).split(',').collect();
    match fields.get(1).map(|s| s.trim()) {
        Some("OK") => {
            if fields.len() > 3 {
                Ok(fields[2..fields.len() - 1]
                    .iter()
                    .map(|s| s.trim().to_string())
                    .collect())
            } else {
                Ok(Vec::new())
            }
        }
        Some("Fail") => Err(NavError::Protocol {
            command: command.to_string(),
            code: fields.get(2).map(|s| s.trim().to_string()).unwrap_or_default(),
        }),
        _ => Err(NavError::Protocol {
            command: command.to_string(),
            code: format!("malformed reply {:?}", reply),
        }),
    }
}

/// Request/response channel to the controller.
#[cfg_attr(test, mockall::automock)]
pub trait ElfinLink: Send {
    fn request(&mut self, message: &str) -> Result<String>;
}

pub struct TcpLink {
    stream: TcpStream,
    message_size: usize,
}

impl TcpLink {
    pub fn connect(ip: &str, port: u16) -> Result<Self> {
        let addr = (ip, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                NavError::Configuration(format!("cannot resolve robot address {}", ip))
            })?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(REPLY_TIMEOUT))?;
        stream.set_nodelay(true)?;
        log::info!("Connected to robot controller at {}:{}", ip, port);
        Ok(Self {
            stream,
            message_size: MESSAGE_SIZE,
        })
    }
}

impl ElfinLink for TcpLink {
    fn request(&mut self, message: &str) -> Result<String> {
        self.stream.write_all(message.as_bytes())?;
        let mut buf = vec![0u8; self.message_size];
        let n = self.stream.read(&mut buf)?;
        if n == 0 {
            return Err(NavError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionAborted,
            )));
        }
        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    }
}

/// Controller operations used by the robot worker.
#[cfg_attr(test, mockall::automock)]
pub trait RobotApi: Send {
    fn read_move_state(&mut self) -> Result<MoveState>;
    fn move_l(&mut self, target: [f64; 6]) -> Result<bool>;
    fn move_c(&mut self, target: [f64; 6]) -> Result<bool>;
    fn grp_stop(&mut self) -> Result<bool>;
    fn read_pcs_actual_pos(&mut self) -> Result<Option<[f64; 6]>>;
}

impl<T: RobotApi + ?Sized> RobotApi for Box<T> {
    fn read_move_state(&mut self) -> Result<MoveState> {
        (**self).read_move_state()
    }

    fn move_l(&mut self, target: [f64; 6]) -> Result<bool> {
        (**self).move_l(target)
    }

    fn move_c(&mut self, target: [f64; 6]) -> Result<bool> {
        (**self).move_c(target)
    }

    fn grp_stop(&mut self) -> Result<bool> {
        (**self).grp_stop()
    }

    fn read_pcs_actual_pos(&mut self) -> Result<Option<[f64; 6]>> {
        (**self).read_pcs_actual_pos()
    }
}

/// Typed command set over an [`ElfinLink`].
pub struct Elfin<L: ElfinLink> {
    link: L,
    robot_id: u32,
}

impl Elfin<TcpLink> {
    pub fn connect(ip: &str, port: u16) -> Result<Self> {
        Ok(Self::new(TcpLink::connect(ip, port)?, ROBOT_ID))
    }
}

impl<L: ElfinLink> Elfin<L> {
    pub fn new(link: L, robot_id: u32) -> Self {
        Self { link, robot_id }
    }

    fn send(&mut self, command: &str, with_id: bool, args: &[String]) -> Result<Vec<String>> {
        let message = format_request(command, with_id.then_some(self.robot_id), args);
        log::trace!("robot <- {}", message);
        let reply = self.link.request(&message)?;
        log::trace!("robot -> {}", reply);
        parse_reply(command, &reply)
    }

    /// `Ok(false)` when the controller answers `Fail`; transport errors propagate.
    fn send_status(&mut self, command: &str, with_id: bool, args: &[String]) -> Result<bool> {
        match self.send(command, with_id, args) {
            Ok(_) => Ok(true),
            Err(NavError::Protocol { command, code }) => {
                log::warn!("Robot command {} failed with code {}", command, code);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Power up. Returns after about 44 s.
    pub fn electrify(&mut self) -> Result<bool> {
        self.send_status("Electrify", false, &[])
    }

    pub fn black_out(&mut self) -> Result<bool> {
        self.send_status("BlackOut", false, &[])
    }

    pub fn start_master(&mut self) -> Result<bool> {
        self.send_status("StartMaster", false, &[])
    }

    pub fn close_master(&mut self) -> Result<bool> {
        self.send_status("CloseMaster", false, &[])
    }

    pub fn grp_power_on(&mut self) -> Result<bool> {
        self.send_status("GrpPowerOn", true, &[])
    }

    pub fn grp_power_off(&mut self) -> Result<bool> {
        self.send_status("GrpPowerOff", true, &[])
    }

    /// Speed ratio in 0.01..=1.
    pub fn set_override(&mut self, ratio: f64) -> Result<bool> {
        self.send_status("SetOverride", true, &[ratio.clamp(0.01, 1.0).to_string()])
    }

    pub fn set_tool_coordinate_motion(&mut self, enabled: bool) -> Result<bool> {
        self.send_status("SetToolCoordinateMotion", true, &[u8::from(enabled).to_string()])
    }

    pub fn move_homing(&mut self) -> Result<bool> {
        self.send_status("MoveHoming", true, &[])
    }
}

fn pose_args(target: &[f64; 6]) -> Vec<String> {
    target.iter().map(f64::to_string).collect()
}

impl<L: ElfinLink> RobotApi for Elfin<L> {
    fn read_move_state(&mut self) -> Result<MoveState> {
        let values = self.send("ReadMoveState", true, &[])?;
        let code = values
            .first()
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| NavError::Protocol {
                command: "ReadMoveState".into(),
                code: "missing state".into(),
            })?;
        Ok(MoveState::from_code(code))
    }

    fn move_l(&mut self, target: [f64; 6]) -> Result<bool> {
        self.send_status("MoveL", true, &pose_args(&target))
    }

    fn move_c(&mut self, target: [f64; 6]) -> Result<bool> {
        self.send_status("MoveC", true, &pose_args(&target))
    }

    fn grp_stop(&mut self) -> Result<bool> {
        self.send_status("GrpStop", true, &[])
    }

    fn read_pcs_actual_pos(&mut self) -> Result<Option<[f64; 6]>> {
        let values = match self.send("ReadPcsActualPos", true, &[]) {
            Ok(values) => values,
            Err(NavError::Protocol { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if values.len() < 6 {
            return Ok(None);
        }
        let mut pose = [0.0; 6];
        for (slot, value) in pose.iter_mut().zip(values.iter()) {
            match value.parse::<f64>() {
                Ok(v) => *slot = v,
                Err(_) => return Ok(None),
            }
        }
        Ok(Some(pose))
    }
}

/// Motion gate in front of a [`RobotApi`]: a move is only issued while the arm is free.
pub struct ElfinServer<A: RobotApi> {
    api: A,
}

impl<A: RobotApi> ElfinServer<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    pub fn api_mut(&mut self) -> &mut A {
        &mut self.api
    }

    pub fn run(&mut self) -> Result<Option<[f64; 6]>> {
        self.api.read_pcs_actual_pos()
    }

    /// Issue a move when the arm is free; stop it if it reports an error.
    ///
    /// Returns whether a move command was accepted.
    pub fn send_coordinates(&mut self, target: [f64; 6], motion: MotionType) -> Result<bool> {
        match self.api.read_move_state()? {
            MoveState::FreeToMove => match motion {
                MotionType::Normal | MotionType::LinearOut => self.api.move_l(target),
                MotionType::Arc => self.api.move_c(target),
            },
            MoveState::Error => {
                log::warn!("Robot reports a motion error, stopping");
                self.stop_robot()?;
                Ok(false)
            }
            state => {
                log::trace!("Robot busy ({:?}), move skipped", state);
                Ok(false)
            }
        }
    }

    pub fn stop_robot(&mut self) -> Result<()> {
        self.api.grp_stop()?;
        std::thread::sleep(STOP_SETTLE);
        Ok(())
    }
}
