//! Decoders for the reply shapes the engine understands.

use log::debug;
use smallvec::SmallVec;

/// Engine speed PID; also drives the engine-running flag
pub const RPM_PID: u8 = 0x0C;

/// Published to the DTC sink when the ECU reports nothing stored
pub const NO_FAULTS: &str = "no faults";

/// Minimum payload (in hex chars) after a raw-PID prefix before a reply is
/// considered complete.
pub const RAW_MIN_PAYLOAD: usize = 8;

/// Voltage readings outside `(0, VOLTAGE_LIMIT)` are treated as garbage.
pub const VOLTAGE_LIMIT: f64 = 20.0;

fn hex_byte(s: &str, offset: usize) -> Option<u8> {
    s.get(offset..offset + 2)
        .and_then(|b| u8::from_str_radix(b, 16).ok())
}

/// A decoded Mode 01 reply: `41 <pid> <A> [<B>]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode01Reply {
    pub pid: u8,
    pub a: u8,
    pub b: u8,
}

impl Mode01Reply {
    pub fn value(&self) -> f64 {
        pid_value(self.pid, self.a, self.b)
    }
}

/// Parse the first Mode 01 reply in a normalized string. `B` is zero when
/// the reply only carries one data byte.
pub fn parse_mode01(clean: &str) -> Option<Mode01Reply> {
    let data = &clean[clean.find("41")?..];
    if data.len() < 6 {
        return None;
    }
    let pid = hex_byte(data, 2)?;
    let a = hex_byte(data, 4)?;
    let b = hex_byte(data, 6).unwrap_or(0);
    Some(Mode01Reply { pid, a, b })
}

/// Standard SAE J1979 scaling for the supported PIDs; anything else is `A`.
pub fn pid_value(pid: u8, a: u8, b: u8) -> f64 {
    let a = f64::from(a);
    let b = f64::from(b);
    let word = a * 256.0 + b;
    match pid {
        0x04 | 0x11 | 0x2E | 0x2F => a * 100.0 / 255.0,
        0x05 | 0x0F | 0x46 | 0x5C => a - 40.0,
        0x0B | 0x0D | 0x33 => a,
        0x0C => word / 4.0,
        0x10 => word / 100.0,
        0x1F => word,
        0x42 => word / 1000.0,
        0x5E => word / 20.0,
        _ => {
            debug!("PID 0x{pid:02X}: generic A={a}");
            a
        }
    }
}

/// Decode one 4-hex-char DTC group, e.g. `0101` -> `P0101`.
///
/// Returns `None` when the group is not 4 chars or its first char is not hex.
pub fn decode_dtc(raw: &str) -> Option<String> {
    if raw.len() != 4 {
        return None;
    }
    let first = raw.chars().next()?;
    let Some(nibble) = first.to_digit(16) else {
        debug!("Skipping DTC group with non-hex lead {raw:?}");
        return None;
    };
    let category = match nibble {
        0x4..=0x5 => 'C',
        0x6..=0x7 => 'B',
        0x8..=0xB => 'U',
        _ => 'P',
    };
    let second = char::from(b'0' + (nibble % 4) as u8);
    Some(format!("{category}{second}{}", raw.get(1..)?))
}

/// Decode every code in a Mode 03 reply, skipping `0000` padding.
pub fn decode_dtc_list(clean: &str) -> Option<SmallVec<[String; 4]>> {
    let data = &clean[clean.find("43")?..];
    let mut codes = SmallVec::new();
    let mut i = 2;
    while let Some(group) = data.get(i..i + 4) {
        i += 4;
        if group == "0000" {
            continue;
        }
        if let Some(code) = decode_dtc(group) {
            codes.push(code);
        }
    }
    Some(codes)
}

/// Render a decoded DTC list for the text sink.
pub fn format_dtc_list(codes: &[String], no_faults: &str) -> String {
    if codes.is_empty() {
        no_faults.to_string()
    } else {
        codes.join(", ")
    }
}

/// Parse an `ATRV` reply such as `12.4V`.
///
/// Only digits and `.` are kept; a second decimal point ends the number.
/// Values outside `(0, 20)` are rejected.
pub fn parse_voltage(clean: &str) -> Option<f64> {
    let digits: String = clean
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let number = match digits.match_indices('.').nth(1) {
        Some((second_dot, _)) => &digits[..second_dot],
        None => &digits,
    };
    let volts: f64 = number.parse().ok()?;
    (volts > 0.0 && volts < VOLTAGE_LIMIT).then_some(volts)
}

/// Outcome of looking for a raw-PID prefix in a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawMatch<'a> {
    /// Prefix not present
    Miss,
    /// Prefix present but the payload is too short to be a whole reply
    Truncated(&'a str),
    /// The reply from the prefix onward
    Payload(&'a str),
}

/// Find `prefix` in `clean` and slice out the payload.
pub fn match_raw_prefix<'a>(clean: &'a str, prefix: &str) -> RawMatch<'a> {
    if prefix.is_empty() {
        return RawMatch::Miss;
    }
    match clean.find(prefix) {
        None => RawMatch::Miss,
        Some(pos) => {
            let data = &clean[pos..];
            if data.len() < prefix.len() + RAW_MIN_PAYLOAD {
                RawMatch::Truncated(data)
            } else {
                RawMatch::Payload(data)
            }
        }
    }
}
