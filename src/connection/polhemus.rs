use super::vendor::WrapperReader;
use super::{core_accessors, Collaborators, ConnectionCore, PoseReader, TrackerConnection};
use crate::protocol::{self, CMD_POLL};
use crate::transport::{self, Transport, SERIAL_TIMEOUT, USB_TIMEOUT};
use crate::types::{Configuration, DeviceKind, LibMode, PoseFrame, Transports};
use crate::{NavError, Result};
use std::time::Duration;

const WRAPPER_WARMUP_PAUSE: Duration = Duration::from_millis(175);

/// Polhemus FASTRAK, ISOTRAK II and PATRIOT.
///
/// `connect` walks the fallback chain wrapper -> USB -> serial and keeps the first
/// transport that answers a poll.
pub struct PolhemusConnection {
    core: ConnectionCore,
    collab: Collaborators,
}

impl PolhemusConnection {
    pub fn new(kind: DeviceKind, collab: Collaborators) -> Self {
        Self {
            core: ConnectionCore::new(kind),
            collab,
        }
    }

    fn try_wrapper(&self) -> Result<Box<dyn PoseReader>> {
        let kind = self.core.kind;
        let mut lib = self
            .collab
            .wrappers
            .create(kind)
            .ok_or(NavError::LibraryMissing(kind))?;
        lib.initialize(self.core.configuration.clone())?;

        // The first frames after start-up are stale.
        for _ in 0..protocol::WRAPPER_WARMUP_READS {
            lib.run()?;
            std::thread::sleep(WRAPPER_WARMUP_PAUSE);
        }
        Ok(Box::new(WrapperReader::new(lib)))
    }

    fn try_usb(&self) -> Result<Box<dyn PoseReader>> {
        let kind = self.core.kind;
        let mut link = self
            .collab
            .transports
            .open_usb(protocol::POLHEMUS_VID, protocol::POLHEMUS_PID)?;
        for cmd in protocol::polhemus_usb_init(kind) {
            link.write(cmd)?;
        }
        let mut reader = PolhemusReader::new(link, protocol::polhemus_usb_scale(kind), USB_TIMEOUT);
        reader.probe()?;
        Ok(Box::new(reader))
    }

    fn try_serial(&mut self) -> Result<Box<dyn PoseReader>> {
        let kind = self.core.kind;
        if self.core.configuration.is_none() {
            let chosen = self.collab.dialogs.serial_port(kind);
            self.core.set_configuration(chosen);
        }
        let (com_port, baud_rate) = match &self.core.configuration {
            Some(Configuration::Serial {
                com_port,
                baud_rate,
            }) => (com_port.clone(), *baud_rate),
            Some(other) => match other.com_port() {
                Some(port) => (port.to_string(), protocol::POLHEMUS_BAUD_RATE),
                None => {
                    return Err(NavError::Configuration(format!(
                        "{} needs a COM port",
                        kind
                    )))
                }
            },
            None => return Err(NavError::Configuration("no COM port selected".into())),
        };

        let mut link = self.collab.transports.open_serial(&com_port, baud_rate)?;
        for cmd in protocol::polhemus_serial_init(kind) {
            link.write(cmd)?;
        }
        let mut reader =
            PolhemusReader::new(link, protocol::POLHEMUS_SERIAL_SCALE, SERIAL_TIMEOUT * 10);
        reader.probe()?;
        Ok(Box::new(reader))
    }
}

impl TrackerConnection for PolhemusConnection {
    core_accessors!();

    fn configure(&mut self) -> bool {
        // The COM port is asked for only if the serial step is reached.
        self.core.mark_configured();
        true
    }

    fn connect(&mut self) {
        self.core.release();
        let kind = self.core.kind;
        let transports = kind.transports();

        if transports.contains(Transports::WRAPPER) {
            match self.try_wrapper() {
                Ok(reader) => return self.core.attach(reader, LibMode::Wrapper),
                Err(e) => log::warn!("{}: wrapper connection failed: {}", kind, e),
            }
        }
        if transports.contains(Transports::USB) {
            match self.try_usb() {
                Ok(reader) => return self.core.attach(reader, LibMode::Usb),
                Err(e) => log::warn!("{}: USB connection failed: {}", kind, e),
            }
        }
        if transports.contains(Transports::SERIAL) {
            match self.try_serial() {
                Ok(reader) => return self.core.attach(reader, LibMode::Serial),
                Err(e) => log::warn!("{}: serial connection failed: {}", kind, e),
            }
        }
        self.core.fail();
    }
}

/// Polls a Polhemus device over USB or serial.
struct PolhemusReader {
    link: Box<dyn Transport>,
    scale: [f64; 3],
    timeout: Duration,
}

impl PolhemusReader {
    fn new(link: Box<dyn Transport>, scale: [f64; 3], timeout: Duration) -> Self {
        Self {
            link,
            scale,
            timeout,
        }
    }

    /// First poll after connecting; the device must answer with at least one record.
    fn probe(&mut self) -> Result<()> {
        let reply = transport::transaction(self.link.as_mut(), CMD_POLL, self.timeout)?;
        let text = String::from_utf8_lossy(&reply);
        if text.lines().all(|l| l.trim().is_empty()) {
            return Err(NavError::TransientRead("no answer to poll".into()));
        }
        Ok(())
    }
}

impl PoseReader for PolhemusReader {
    fn read_frame(&mut self) -> Result<PoseFrame> {
        let reply = transport::transaction(self.link.as_mut(), CMD_POLL, self.timeout)?;
        if reply.is_empty() {
            return Err(NavError::TransientRead("empty poll reply".into()));
        }
        let bodies = protocol::parse_polhemus_frame(&String::from_utf8_lossy(&reply), self.scale);
        if bodies.is_empty() {
            return Err(NavError::TransientRead("poll reply without records".into()));
        }
        Ok(PoseFrame::new(bodies))
    }

    fn close(&mut self) -> Result<()> {
        self.link.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConfigDialogs;
    use crate::transport::{MockTransport, MockTransportOpener};
    use crate::types::ConnectionState;
    use crate::wrapper::{MockWrapperLibrary, WrapperRegistry};
    use std::sync::Arc;

    fn answering_serial() -> Box<dyn Transport> {
        let mut link = MockTransport::new();
        link.expect_write().returning(|_| Ok(()));
        link.expect_read()
            .returning(|_| Ok(b"01  1.00  2.00  3.00  0.00  0.00  0.00\r\n".to_vec()));
        link.expect_close().returning(|| Ok(()));
        Box::new(link)
    }

    fn broken_wrappers(kind: DeviceKind) -> WrapperRegistry {
        let mut registry = WrapperRegistry::new();
        registry.register(kind, || {
            let mut lib = MockWrapperLibrary::new();
            lib.expect_initialize()
                .returning(|_| Err(NavError::Configuration("PDI driver missing".into())));
            Box::new(lib)
        });
        registry
    }

    fn collaborators(opener: MockTransportOpener, kind: DeviceKind) -> Collaborators {
        Collaborators {
            wrappers: broken_wrappers(kind),
            transports: Arc::new(opener),
            ..Collaborators::default()
        }
    }

    fn serial_config() -> Option<Configuration> {
        Some(Configuration::Serial {
            com_port: "COM4".into(),
            baud_rate: protocol::POLHEMUS_BAUD_RATE,
        })
    }

    #[test]
    fn test_falls_back_to_serial_when_wrapper_and_usb_fail() {
        let mut opener = MockTransportOpener::new();
        opener.expect_open_usb().times(1).returning(|vid, pid| {
            Err(NavError::DeviceNotFound { vid, pid })
        });
        opener
            .expect_open_serial()
            .times(1)
            .returning(|_, _| Ok(answering_serial()));

        let mut conn = PolhemusConnection::new(
            DeviceKind::Patriot,
            collaborators(opener, DeviceKind::Patriot),
        );
        conn.set_configuration(serial_config());
        conn.configure();
        conn.connect();

        assert_eq!(conn.lib_mode(), LibMode::Serial);
        assert!(conn.is_connected());
        let frame = conn.connection().unwrap().read_frame().unwrap();
        assert_eq!(frame.bodies[0].position, [10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_all_transports_failing_yields_error_mode() {
        let mut opener = MockTransportOpener::new();
        opener.expect_open_usb().returning(|vid, pid| {
            Err(NavError::DeviceNotFound { vid, pid })
        });
        opener.expect_open_serial().times(1).returning(|_, _| {
            Err(NavError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)))
        });

        let mut conn = PolhemusConnection::new(
            DeviceKind::Fastrak,
            collaborators(opener, DeviceKind::Fastrak),
        );
        conn.set_configuration(serial_config());
        conn.connect();

        assert_eq!(conn.lib_mode(), LibMode::Error);
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(!conn.is_connected());
        assert!(conn.connection().is_none());
    }

    #[test]
    fn test_serial_step_asks_for_port_without_configuration() {
        let mut opener = MockTransportOpener::new();
        opener.expect_open_usb().returning(|vid, pid| {
            Err(NavError::DeviceNotFound { vid, pid })
        });
        opener
            .expect_open_serial()
            .withf(|port, _| port == "/dev/ttyUSB0")
            .times(1)
            .returning(|_, _| Ok(answering_serial()));

        let mut dialogs = MockConfigDialogs::new();
        dialogs.expect_serial_port().times(1).returning(|_| {
            Some(Configuration::Serial {
                com_port: "/dev/ttyUSB0".into(),
                baud_rate: protocol::POLHEMUS_BAUD_RATE,
            })
        });

        let collab = Collaborators {
            dialogs: Arc::new(dialogs),
            ..collaborators(opener, DeviceKind::IsotrakII)
        };
        let mut conn = PolhemusConnection::new(DeviceKind::IsotrakII, collab);
        conn.connect();

        assert_eq!(conn.lib_mode(), LibMode::Serial);
        assert!(conn.configuration().is_some());
    }

    #[test]
    fn test_usb_used_when_wrapper_fails() {
        let mut opener = MockTransportOpener::new();
        opener.expect_open_usb().times(1).returning(|_, _| {
            let mut link = MockTransport::new();
            link.expect_write().returning(|_| Ok(()));
            link.expect_read()
                .returning(|_| Ok(b"01 1.0 1.0 1.0 0 0 0\r\n".to_vec()));
            link.expect_close().returning(|| Ok(()));
            Ok(Box::new(link) as Box<dyn Transport>)
        });
        opener.expect_open_serial().never();

        let mut conn = PolhemusConnection::new(
            DeviceKind::Fastrak,
            collaborators(opener, DeviceKind::Fastrak),
        );
        conn.connect();

        assert_eq!(conn.lib_mode(), LibMode::Usb);
        let frame = conn.connection().unwrap().read_frame().unwrap();
        assert_eq!(frame.bodies[0].position, [10.0, 10.0, -10.0]);
        conn.disconnect();
        assert_eq!(conn.lib_mode(), LibMode::Usb);
    }
}
