use crate::protocol;
use crate::{NavError, Result};
use rusb::{Direction, GlobalContext, TransferType};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

/// Settle time between a command write and reading its answer.
pub const COMMAND_SETTLE: Duration = Duration::from_millis(20);
pub const SERIAL_TIMEOUT: Duration = Duration::from_millis(30);
pub const USB_TIMEOUT: Duration = Duration::from_millis(500);

/// Byte channel to a tracking device.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever the device sends within `timeout`. An empty buffer means no answer.
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    fn close(&mut self) -> Result<()>;
}

/// Write `cmd`, wait for the device to process it, then read the reply.
pub fn transaction(
    transport: &mut dyn Transport,
    cmd: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    transport.write(cmd)?;
    std::thread::sleep(COMMAND_SETTLE);
    transport.read(timeout)
}

/// Opens transports by address. Connections get one of these so device discovery
/// can be replaced in tests.
#[cfg_attr(test, mockall::automock)]
pub trait TransportOpener: Send + Sync {
    fn open_usb(&self, vid: u16, pid: u16) -> Result<Box<dyn Transport>>;
    fn open_serial(&self, port: &str, baud_rate: u32) -> Result<Box<dyn Transport>>;
}

/// Opens real hardware through rusb and serialport.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTransports;

impl TransportOpener for SystemTransports {
    fn open_usb(&self, vid: u16, pid: u16) -> Result<Box<dyn Transport>> {
        Ok(Box::new(UsbTransport::open(vid, pid)?))
    }

    fn open_serial(&self, port: &str, baud_rate: u32) -> Result<Box<dyn Transport>> {
        Ok(Box::new(SerialTransport::open(port, baud_rate)?))
    }
}

/// Bulk-transfer USB channel.
pub struct UsbTransport {
    handle: rusb::DeviceHandle<GlobalContext>,
    interface: u8,
    in_endpoint: u8,
    out_endpoint: u8,
    max_packet_size: usize,
}

impl UsbTransport {
    pub fn open(vid: u16, pid: u16) -> Result<Self> {
        let handle = rusb::open_device_with_vid_pid(vid, pid)
            .ok_or(NavError::DeviceNotFound { vid, pid })?;
        let device = handle.device();
        let config = device.active_config_descriptor()?;

        let mut found = None;
        for interface in config.interfaces() {
            for descriptor in interface.descriptors() {
                for endpoint in descriptor.endpoint_descriptors() {
                    if endpoint.direction() == Direction::In
                        && endpoint.transfer_type() == TransferType::Bulk
                    {
                        found = Some((
                            descriptor.interface_number(),
                            endpoint.address(),
                            endpoint.max_packet_size() as usize,
                        ));
                    }
                }
            }
        }
        let (interface, in_endpoint, max_packet_size) =
            found.ok_or(NavError::DeviceNotFound { vid, pid })?;

        // Not supported on every platform.
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle.claim_interface(interface)?;

        log::info!(
            "USB device {:04X}:{:04X} opened (ep in 0x{:02X}, packet {} bytes)",
            vid,
            pid,
            in_endpoint,
            max_packet_size
        );

        Ok(Self {
            handle,
            interface,
            in_endpoint,
            out_endpoint: protocol::POLHEMUS_OUT_ENDPOINT,
            max_packet_size,
        })
    }
}

impl Transport for UsbTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.handle.write_bulk(self.out_endpoint, data, USB_TIMEOUT)?;
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.max_packet_size.max(64)];
        match self.handle.read_bulk(self.in_endpoint, &mut buf, timeout) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(rusb::Error::Timeout) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.handle.release_interface(self.interface)?;
        Ok(())
    }
}

/// Serial line channel.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(SERIAL_TIMEOUT)
            .open()?;
        log::info!("Serial port {} opened at {} baud", path, baud_rate);
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    /// Collects bytes until the line goes quiet after some data, or `timeout` passes.
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match self.port.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    if !out.is_empty() || Instant::now() >= deadline {
                        break;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    fn close(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }
}
