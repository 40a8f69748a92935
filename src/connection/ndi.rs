use super::{core_accessors, Collaborators, ConnectionCore, PoseReader, TrackerConnection};
use crate::protocol::{self, NDI_PVWR_CHUNK};
use crate::transport::{self, Transport};
use crate::types::{Configuration, DeviceKind, LibMode, PoseFrame, RawPoseSample};
use crate::{NavError, Result};
use std::time::Duration;

const NDI_REPLY_TIMEOUT: Duration = Duration::from_millis(1000);
/// INIT and TSTART take noticeably longer than tracking commands.
const NDI_SLOW_TIMEOUT: Duration = Duration::from_millis(3000);

/// NDI Polaris and Polaris P4 over the combined API serial protocol.
pub struct NdiConnection {
    core: ConnectionCore,
    collab: Collaborators,
}

impl NdiConnection {
    pub fn new(kind: DeviceKind, collab: Collaborators) -> Self {
        Self {
            core: ConnectionCore::new(kind),
            collab,
        }
    }

    /// COM port and tool definition files in body order (probe, reference, objects).
    fn session_parameters(&self) -> Result<(String, Vec<String>)> {
        match &self.core.configuration {
            Some(Configuration::Polaris {
                com_port,
                probe_dir,
                ref_dir,
                obj_dirs,
            }) => {
                let mut tools = vec![probe_dir.clone(), ref_dir.clone()];
                tools.extend(obj_dirs.iter().cloned());
                Ok((com_port.clone(), tools))
            }
            Some(Configuration::PolarisP4 {
                com_port,
                probe_dir,
                ref_dir,
                obj_dir,
            }) => Ok((
                com_port.clone(),
                vec![probe_dir.clone(), ref_dir.clone(), obj_dir.clone()],
            )),
            Some(other) => Err(NavError::Configuration(format!(
                "unexpected configuration for {}: {:?}",
                self.core.kind, other
            ))),
            None => Err(NavError::Configuration(format!(
                "{} is not configured",
                self.core.kind
            ))),
        }
    }

    fn open(&self) -> Result<Box<dyn PoseReader>> {
        let (com_port, tools) = self.session_parameters()?;
        let link = self
            .collab
            .transports
            .open_serial(&com_port, protocol::NDI_DEFAULT_BAUD_RATE)?;
        let mut session = NdiSession::new(link);

        session.command(protocol::NDI_CMD_INIT, NDI_SLOW_TIMEOUT)?;
        let mut handles = Vec::with_capacity(tools.len());
        for path in &tools {
            if path.is_empty() {
                handles.push(None);
                continue;
            }
            let rom = std::fs::read(path)?;
            handles.push(Some(session.load_tool(&rom)?));
        }
        session.command(protocol::NDI_CMD_TSTART, NDI_SLOW_TIMEOUT)?;
        log::info!(
            "{} tracking started with {} tool(s) on {}",
            self.core.kind,
            handles.iter().flatten().count(),
            com_port
        );

        Ok(Box::new(NdiReader { session, handles }))
    }
}

impl TrackerConnection for NdiConnection {
    core_accessors!();

    fn configure(&mut self) -> bool {
        if self.core.configuration.is_some() {
            return true;
        }
        match self.collab.dialogs.polaris(self.core.kind) {
            Some(configuration) => {
                self.core.set_configuration(Some(configuration));
                true
            }
            None => {
                log::info!("{} configuration cancelled", self.core.kind);
                false
            }
        }
    }

    fn connect(&mut self) {
        self.core.release();
        match self.open() {
            Ok(reader) => self.core.attach(reader, LibMode::Serial),
            Err(e) => {
                log::warn!("{}: {}", self.core.kind, e);
                self.core.fail();
            }
        }
    }
}

/// Command/reply exchange with an NDI system control unit.
struct NdiSession {
    link: Box<dyn Transport>,
}

impl NdiSession {
    fn new(link: Box<dyn Transport>) -> Self {
        Self { link }
    }

    fn command(&mut self, cmd: &str, timeout: Duration) -> Result<String> {
        let reply =
            transport::transaction(self.link.as_mut(), &protocol::ndi_command(cmd), timeout)?;
        let reply = String::from_utf8_lossy(&reply).into_owned();
        if !protocol::ndi_reply_ok(&reply) {
            let name = cmd.split_whitespace().next().unwrap_or(cmd);
            return Err(NavError::Protocol {
                command: name.to_string(),
                code: protocol::ndi_strip_crc(&reply).to_string(),
            });
        }
        Ok(reply)
    }

    /// Request a port handle, upload the tool definition and enable the tool.
    fn load_tool(&mut self, rom: &[u8]) -> Result<String> {
        let reply = self.command(protocol::NDI_CMD_PHRQ_PASSIVE, NDI_REPLY_TIMEOUT)?;
        let handle = reply
            .get(..2)
            .ok_or_else(|| NavError::TransientRead(format!("bad PHRQ reply {:?}", reply)))?
            .to_string();

        for (n, chunk) in rom.chunks(NDI_PVWR_CHUNK).enumerate() {
            let cmd = protocol::ndi_pvwr(&handle, n * NDI_PVWR_CHUNK, chunk);
            self.command(&cmd, NDI_REPLY_TIMEOUT)?;
        }
        self.command(&format!("PINIT {}", handle), NDI_REPLY_TIMEOUT)?;
        self.command(&format!("PENA {}D", handle), NDI_REPLY_TIMEOUT)?;
        Ok(handle)
    }

    fn close(&mut self) -> Result<()> {
        let stopped = self.command(protocol::NDI_CMD_TSTOP, NDI_REPLY_TIMEOUT);
        let closed = self.link.close();
        stopped?;
        closed
    }
}

struct NdiReader {
    session: NdiSession,
    /// Port handle per body slot; `None` for slots without a tool file.
    handles: Vec<Option<String>>,
}

impl PoseReader for NdiReader {
    fn read_frame(&mut self) -> Result<PoseFrame> {
        let reply = self.session.command(protocol::NDI_CMD_TX, NDI_REPLY_TIMEOUT)?;
        let tools = protocol::parse_ndi_tx(&reply)
            .ok_or_else(|| NavError::TransientRead(format!("bad TX reply {:?}", reply)))?;

        let bodies = self
            .handles
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .and_then(|handle| tools.iter().find(|(h, _)| h == handle))
                    .map(|(_, sample)| *sample)
                    .unwrap_or_else(RawPoseSample::hidden)
            })
            .collect();
        Ok(PoseFrame::new(bodies))
    }

    fn close(&mut self) -> Result<()> {
        self.session.close()
    }
}
