use crate::transform::{self, Axes};
use crate::types::{DeviceKind, RawPoseSample};

// -- Polhemus USB identifiers --
pub const POLHEMUS_VID: u16 = 0x0F44;
pub const POLHEMUS_PID: u16 = 0xEF12;
pub const POLHEMUS_OUT_ENDPOINT: u8 = 0x02;
pub const POLHEMUS_BAUD_RATE: u32 = 115_200;

// -- Polhemus ASCII commands --
/// Single-record poll.
pub const CMD_POLL: &[u8] = b"P";
/// Switch output units to metric.
pub const CMD_METRIC: &[u8] = b"u";
/// ASCII output format.
pub const CMD_ASCII: &[u8] = b"F";
/// Move the tracking point from the sensor centre to the stylus tip.
pub const CMD_TIP_OFFSET: &[u8] = b"Y";

/// Number of stale reads thrown away after a wrapper connection opens.
pub const WRAPPER_WARMUP_READS: usize = 5;

/// Init sequence sent over USB before the first poll.
pub fn polhemus_usb_init(kind: DeviceKind) -> &'static [&'static [u8]] {
    match kind {
        DeviceKind::Fastrak => &[CMD_METRIC, CMD_ASCII],
        _ => &[],
    }
}

/// Init sequence sent over a serial line before the first poll.
pub fn polhemus_serial_init(kind: DeviceKind) -> &'static [&'static [u8]] {
    match kind {
        DeviceKind::Fastrak => &[CMD_METRIC, CMD_ASCII],
        DeviceKind::IsotrakII => &[CMD_METRIC, CMD_ASCII, CMD_TIP_OFFSET],
        _ => &[],
    }
}

/// Position scale and z sign applied to USB records (inches or cm to mm).
pub fn polhemus_usb_scale(kind: DeviceKind) -> [f64; 3] {
    let s = if kind == DeviceKind::Fastrak { 10.0 } else { 25.4 };
    [s, s, -s]
}

pub const POLHEMUS_SERIAL_SCALE: [f64; 3] = [10.0, 10.0, 10.0];

/// Parse one Polhemus ASCII record: station id followed by x, y, z, azimuth, elevation, roll.
///
/// Values may be glued together by their minus signs (`"01  1.20-3.40"`), so a space is
/// inserted before every `-` before splitting.
pub fn parse_polhemus_record(record: &str) -> Option<[f64; 6]> {
    let spaced = record.replace('-', " -");
    let mut fields = spaced.split_whitespace();
    fields.next()?;

    let mut out = [0.0; 6];
    for slot in out.iter_mut() {
        *slot = fields.next()?.parse::<f64>().ok()?;
    }
    Some(out)
}

/// Parse a multi-station reply, one record per line, scaling positions.
///
/// Lines that fail to parse become hidden samples so body indices stay aligned.
pub fn parse_polhemus_frame(text: &str, scale: [f64; 3]) -> Vec<RawPoseSample> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| match parse_polhemus_record(line) {
            Some(v) => RawPoseSample::from_array(
                [
                    v[0] * scale[0],
                    v[1] * scale[1],
                    v[2] * scale[2],
                    v[3],
                    v[4],
                    v[5],
                ],
                true,
            ),
            None => RawPoseSample::hidden(),
        })
        .collect()
}

// -- NDI combined API (Polaris family) --
pub const NDI_DEFAULT_BAUD_RATE: u32 = 9_600;
pub const NDI_CMD_INIT: &str = "INIT ";
pub const NDI_CMD_TSTART: &str = "TSTART ";
pub const NDI_CMD_TSTOP: &str = "TSTOP ";
/// Tracking reply with transformation data only.
pub const NDI_CMD_TX: &str = "TX 0001";
/// Request a port handle for a passive (wireless) tool.
pub const NDI_CMD_PHRQ_PASSIVE: &str = "PHRQ *********1****";
/// SROM bytes written per PVWR command.
pub const NDI_PVWR_CHUNK: usize = 64;

const NDI_MISSING: &str = "MISSING";
const NDI_DISABLED: &str = "DISABLED";
const NDI_QUAT_WIDTH: usize = 6;
const NDI_TRANS_WIDTH: usize = 7;
const NDI_QUAT_SCALE: f64 = 0.0001;
const NDI_TRANS_SCALE: f64 = 0.01;

/// Terminate an NDI command with a carriage return.
pub fn ndi_command(cmd: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(cmd.len() + 1);
    out.extend_from_slice(cmd.as_bytes());
    out.push(b'\r');
    out
}

/// PVWR command writing one chunk of a tool definition file at `address`.
pub fn ndi_pvwr(handle: &str, address: usize, chunk: &[u8]) -> String {
    let mut padded = [0u8; NDI_PVWR_CHUNK];
    let len = chunk.len().min(NDI_PVWR_CHUNK);
    padded[..len].copy_from_slice(&chunk[..len]);
    let hex: String = padded.iter().map(|b| format!("{:02X}", b)).collect();
    format!("PVWR {}{:04X}{}", handle, address, hex)
}

pub fn ndi_reply_ok(reply: &str) -> bool {
    !reply.is_empty() && !reply.starts_with("ERROR")
}

/// Strip the trailing CRC16 (4 hex digits) and CR from an NDI reply.
pub fn ndi_strip_crc(reply: &str) -> &str {
    let trimmed = reply.trim_end_matches(['\r', '\n']);
    let split = trimmed.len().saturating_sub(4);
    // Corrupt serial input may put a multi-byte char across the split.
    let Some(crc) = trimmed.get(split..) else {
        return trimmed;
    };
    if crc.len() == 4 && crc.bytes().all(|b| b.is_ascii_hexdigit()) {
        &trimmed[..split]
    } else {
        trimmed
    }
}

fn fixed_field(data: &str, start: usize, width: usize, scale: f64) -> Option<f64> {
    let raw = data.get(start..start + width)?;
    raw.trim().parse::<i64>().ok().map(|v| v as f64 * scale)
}

/// Parse one tool record of a `TX 0001` reply (without its 2-char port handle).
///
/// Quaternion fields are 6 chars with 4 implied decimals, translations 7 chars with 2.
/// Missing or disabled tools, and records that fail to parse, become hidden samples.
pub fn parse_ndi_tool(data: &str) -> RawPoseSample {
    if data.starts_with(NDI_MISSING) || data.starts_with(NDI_DISABLED) {
        return RawPoseSample::hidden();
    }

    let mut q = [0.0; 4];
    for (n, slot) in q.iter_mut().enumerate() {
        match fixed_field(data, n * NDI_QUAT_WIDTH, NDI_QUAT_WIDTH, NDI_QUAT_SCALE) {
            Some(v) => *slot = v,
            None => return RawPoseSample::hidden(),
        }
    }

    let base = 4 * NDI_QUAT_WIDTH;
    let mut t = [0.0; 3];
    for (n, slot) in t.iter_mut().enumerate() {
        match fixed_field(data, base + n * NDI_TRANS_WIDTH, NDI_TRANS_WIDTH, NDI_TRANS_SCALE) {
            Some(v) => *slot = v,
            None => return RawPoseSample::hidden(),
        }
    }

    let angles = transform::euler_from_quaternion(q, Axes::Rzyx).map(f64::to_degrees);
    RawPoseSample::new(t, angles)
}

/// Parse a full `TX 0001` reply: handle count, then one LF-terminated record per handle.
/// Returns `(port handle, sample)` pairs in reply order.
pub fn parse_ndi_tx(reply: &str) -> Option<Vec<(String, RawPoseSample)>> {
    let body = ndi_strip_crc(reply);
    let count = usize::from_str_radix(body.get(..2)?, 16).ok()?;

    let records: Vec<(String, RawPoseSample)> = body[2..]
        .split('\n')
        .take(count)
        .filter_map(|record| {
            let handle = record.get(..2)?;
            Some((handle.to_string(), parse_ndi_tool(record.get(2..).unwrap_or(""))))
        })
        .collect();

    if records.len() < count {
        return None;
    }
    Some(records)
}
