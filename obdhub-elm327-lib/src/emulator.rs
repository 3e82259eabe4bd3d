//! ELM327 adapter emulator.
//!
//! Answers the subset of the AT/OBD2 command set the engine uses, with the
//! adapter's formatting flags (echo, linefeeds, spaces) honored. Backs the
//! mock server and the in-process loopback used by tests and dry runs.

use log::{debug, trace};

use crate::descriptor::EcuHeader;
use crate::error::TransportError;
use crate::transport::Transport;

/// ISO-TP single frames carry at most this many data bytes.
const SINGLE_FRAME_MAX: usize = 7;

/// Reported by `ATZ` and `ATI`.
const IDENTITY: &str = "ELM327 v1.5";

/// Adapter formatting and addressing state. Header display (`ATH1`) is not
/// emulated; replies always come without CAN ids.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    /// `ATE`: echo received characters
    pub echo_enabled: bool,
    /// `ATL`: linefeed after every carriage return
    pub linefeeds_enabled: bool,
    /// `ATS`: space between data bytes
    pub spaces_enabled: bool,
    /// `ATAL`/`ATNL`: replies longer than a single frame
    pub long_messages: bool,
    /// Target set with ATSH
    pub header: EcuHeader,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            echo_enabled: true,
            linefeeds_enabled: true,
            spaces_enabled: true,
            long_messages: false,
            header: EcuHeader::broadcast(),
        }
    }
}

impl AdapterSettings {
    pub fn line_ending(&self) -> &'static str {
        if self.linefeeds_enabled {
            "\r\n"
        } else {
            "\r"
        }
    }

    /// Hex dump of data bytes, spaced when `ATS1` is in effect.
    pub fn hex(&self, bytes: &[u8]) -> String {
        if !self.spaces_enabled {
            return hex::encode_upper(bytes);
        }
        bytes
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Render a positive reply: one line, or a length line followed by
    /// numbered segments when it does not fit a single frame.
    fn frame_lines(&self, payload: &[u8]) -> String {
        if payload.len() <= SINGLE_FRAME_MAX {
            return self.hex(payload);
        }
        let (first, rest) = payload.split_at(SINGLE_FRAME_MAX - 1);
        let mut lines = vec![
            format!("{:03X}", payload.len()),
            format!("0:{}", self.hex(first)),
        ];
        for (n, segment) in rest.chunks(SINGLE_FRAME_MAX).enumerate() {
            lines.push(format!("{:X}:{}", (n + 1) % 16, self.hex(segment)));
        }
        lines.join(self.line_ending())
    }
}

/// A manufacturer-specific (Mode 22) record served by one ECU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRecord {
    pub header: EcuHeader,
    pub pid: u16,
    pub data: Vec<u8>,
}

/// What the simulated vehicle reports.
#[derive(Debug, Clone)]
pub struct Vehicle {
    pub rpm: f64,
    pub speed_kmh: u8,
    pub coolant_c: i16,
    pub intake_c: i16,
    pub engine_load_pct: f64,
    pub throttle_pct: f64,
    pub fuel_level_pct: f64,
    pub battery_volts: f64,
    pub runtime_s: u16,
    /// Raw two-byte codes, e.g. `0x0101` for P0101
    pub dtcs: Vec<u16>,
    pub extended: Vec<ExtendedRecord>,
}

impl Default for Vehicle {
    fn default() -> Self {
        Self {
            rpm: 800.0,
            speed_kmh: 40,
            coolant_c: 39,
            intake_c: 16,
            engine_load_pct: 39.2,
            throttle_pct: 27.0,
            fuel_level_pct: 62.0,
            battery_volts: 12.4,
            runtime_s: 600,
            dtcs: Vec::new(),
            extended: Vec::new(),
        }
    }
}

fn percent_byte(pct: f64) -> u8 {
    (pct.clamp(0.0, 100.0) * 255.0 / 100.0).round() as u8
}

fn celsius_byte(c: i16) -> u8 {
    (c + 40).clamp(0, 255) as u8
}

impl Vehicle {
    /// Raw data bytes for a Mode 01 PID, `None` when unsupported.
    pub fn mode01(&self, pid: u8) -> Option<Vec<u8>> {
        let bytes = match pid {
            0x00 => vec![0xBE, 0x3F, 0xA8, 0x13],
            0x04 => vec![percent_byte(self.engine_load_pct)],
            0x05 => vec![celsius_byte(self.coolant_c)],
            0x0B => vec![101],
            0x0C => ((self.rpm.max(0.0) * 4.0) as u16).to_be_bytes().to_vec(),
            0x0D => vec![self.speed_kmh],
            0x0F => vec![celsius_byte(self.intake_c)],
            0x10 => 300u16.to_be_bytes().to_vec(),
            0x11 => vec![percent_byte(self.throttle_pct)],
            0x1F => self.runtime_s.to_be_bytes().to_vec(),
            0x20 => vec![0x80, 0x00, 0x00, 0x01],
            0x2F => vec![percent_byte(self.fuel_level_pct)],
            0x33 => vec![99],
            0x40 => vec![0xFE, 0xD0, 0x80, 0x00],
            0x42 => ((self.battery_volts * 1000.0) as u16).to_be_bytes().to_vec(),
            0x46 => vec![celsius_byte(18)],
            0x5C => vec![celsius_byte(self.coolant_c + 5)],
            0x5E => 100u16.to_be_bytes().to_vec(),
            _ => return None,
        };
        Some(bytes)
    }

    fn extended(&self, header: &EcuHeader, pid: u16) -> Option<&ExtendedRecord> {
        self.extended
            .iter()
            .find(|r| r.pid == pid && (&r.header == header || header.is_broadcast()))
    }
}

/// The emulated adapter.
#[derive(Debug, Default)]
pub struct Elm327Emulator {
    pub settings: AdapterSettings,
    pub vehicle: Vehicle,
    input: Vec<u8>,
}

impl Elm327Emulator {
    pub fn new(vehicle: Vehicle) -> Self {
        Self {
            settings: AdapterSettings::default(),
            vehicle,
            input: Vec::new(),
        }
    }

    /// Feed received bytes; returns everything the adapter prints in
    /// response (echo included). Commands end at `\r`; `\n` is ignored.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for &byte in bytes {
            if self.settings.echo_enabled {
                out.push(byte);
            }
            match byte {
                b'\r' => {
                    let command = String::from_utf8_lossy(&self.input).trim().to_uppercase();
                    self.input.clear();
                    if !command.is_empty() {
                        trace!("RX: {command}");
                        let reply = self.handle_command(&command);
                        trace!("TX: {}", reply.escape_debug());
                        out.extend_from_slice(reply.as_bytes());
                    }
                }
                b'\n' => {}
                _ => self.input.push(byte),
            }
        }
        out
    }

    /// Answer one command (without terminator). The reply ends with the prompt.
    pub fn handle_command(&mut self, command: &str) -> String {
        let command: String = command
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_uppercase();
        if command.starts_with("AT") {
            return self.handle_at_command(&command);
        }
        let le = self.settings.line_ending();
        let body = self.handle_obd_command(&command);
        format!("{body}{le}{le}>")
    }

    /// Answer an `AT` command. The reply uses the line ending in effect
    /// before the command, except after a reset.
    pub fn handle_at_command(&mut self, cmd: &str) -> String {
        let body = cmd.strip_prefix("AT").unwrap_or(cmd);
        if matches!(body, "Z" | "WS") {
            self.settings = AdapterSettings::default();
            let le = self.settings.line_ending();
            return format!("{le}{IDENTITY}{le}>");
        }
        let le = self.settings.line_ending();
        let text = self.at_reply(body).unwrap_or_else(|| "?".to_string());
        format!("{le}{text}{le}>")
    }

    /// Switch flags: a letter followed by `0` or `1`
    fn flag(&mut self, body: &str) -> Option<(&mut bool, bool)> {
        let on = match body.chars().last()? {
            '0' => false,
            '1' => true,
            _ => return None,
        };
        let flag = match &body[..body.len() - 1] {
            "E" => &mut self.settings.echo_enabled,
            "L" => &mut self.settings.linefeeds_enabled,
            "S" => &mut self.settings.spaces_enabled,
            _ => return None,
        };
        Some((flag, on))
    }

    /// `None` for commands the adapter does not know
    fn at_reply(&mut self, body: &str) -> Option<String> {
        if let Some((flag, on)) = self.flag(body) {
            *flag = on;
            return Some("OK".to_string());
        }
        let text = match body {
            "AL" | "NL" => {
                self.settings.long_messages = body == "AL";
                "OK".to_string()
            }
            "H0" => "OK".to_string(),
            "RV" => format!("{:.1}V", self.vehicle.battery_volts),
            "I" => IDENTITY.to_string(),
            "@1" => "OBDII to RS232 Interpreter".to_string(),
            _ => match body.strip_prefix("SH").filter(|addr| !addr.is_empty()) {
                Some(addr) => {
                    self.settings.header = EcuHeader::new(addr);
                    debug!("Header set to {}", self.settings.header);
                    "OK".to_string()
                }
                // Protocol and timing knobs have nothing to emulate
                None if ["SP", "ST", "AT"].iter().any(|p| body.starts_with(p)) => {
                    "OK".to_string()
                }
                None => return None,
            },
        };
        Some(text)
    }

    fn handle_obd_command(&self, cmd: &str) -> String {
        if !cmd.chars().all(|c| c.is_ascii_hexdigit()) || cmd.len() < 2 {
            return "?".to_string();
        }
        match &cmd[..2] {
            "03" => self.stored_dtcs(),
            "01" if cmd.len() >= 4 => self.current_data(&cmd[2..]),
            "22" if cmd.len() == 6 => match u16::from_str_radix(&cmd[2..], 16) {
                Ok(pid) => self.extended_data(pid),
                Err(_) => "?".to_string(),
            },
            _ => "NO DATA".to_string(),
        }
    }

    /// Mode 01, possibly several PIDs in one request
    fn current_data(&self, pids: &str) -> String {
        let mut payload = vec![0x41];
        let mut pairs = pids.as_bytes().chunks_exact(2);
        for pair in &mut pairs {
            let Some(pid) = std::str::from_utf8(pair)
                .ok()
                .and_then(|p| u8::from_str_radix(p, 16).ok())
            else {
                return "?".to_string();
            };
            let Some(data) = self.vehicle.mode01(pid) else {
                return "NO DATA".to_string();
            };
            payload.push(pid);
            payload.extend_from_slice(&data);
        }
        if !pairs.remainder().is_empty() {
            return "?".to_string();
        }
        self.settings.hex(&payload)
    }

    /// Mode 03; codes are padded to groups of three like pre-CAN adapters print them
    fn stored_dtcs(&self) -> String {
        let mut codes = self.vehicle.dtcs.clone();
        while codes.is_empty() || codes.len() % 3 != 0 {
            codes.push(0);
        }
        let le = self.settings.line_ending();
        codes
            .chunks(3)
            .map(|group| {
                let mut bytes = vec![0x43];
                bytes.extend(group.iter().flat_map(|c| c.to_be_bytes()));
                self.settings.hex(&bytes)
            })
            .collect::<Vec<_>>()
            .join(le)
    }

    /// Mode 22 against the ECU selected with ATSH
    fn extended_data(&self, pid: u16) -> String {
        let Some(record) = self.vehicle.extended(&self.settings.header, pid) else {
            return "NO DATA".to_string();
        };
        let mut payload = vec![0x62];
        payload.extend_from_slice(&pid.to_be_bytes());
        payload.extend_from_slice(&record.data);
        if payload.len() > SINGLE_FRAME_MAX && !self.settings.long_messages {
            return "BUFFER FULL".to_string();
        }
        self.settings.frame_lines(&payload)
    }
}

/// Transport that talks to an in-process emulator. Whatever the emulator
/// prints accumulates in `pending` until the caller delivers it.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    pub emulator: Elm327Emulator,
    pub pending: Vec<u8>,
    /// Every command written, for inspection
    pub sent: Vec<String>,
}

impl LoopbackTransport {
    pub fn new(emulator: Elm327Emulator) -> Self {
        Self {
            emulator,
            pending: Vec::new(),
            sent: Vec::new(),
        }
    }

    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.sent.push(String::from_utf8_lossy(bytes).into_owned());
        let out = self.emulator.feed(bytes);
        self.pending.extend_from_slice(&out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_emulator() -> Elm327Emulator {
        let mut emu = Elm327Emulator::default();
        for cmd in ["ATE0", "ATL0", "ATS0"] {
            emu.handle_command(cmd);
        }
        emu
    }

    #[test]
    fn test_default_settings() {
        let settings = AdapterSettings::default();
        assert!(settings.echo_enabled);
        assert!(settings.linefeeds_enabled);
        assert!(settings.spaces_enabled);
        assert!(settings.header.is_broadcast());
        assert_eq!(settings.line_ending(), "\r\n");
    }

    #[test]
    fn test_at_commands() {
        let mut emu = Elm327Emulator::default();

        let resp = emu.handle_command("ATE0");
        assert!(resp.contains("OK"));
        assert!(!emu.settings.echo_enabled);

        let resp = emu.handle_command("ATS0");
        assert!(resp.contains("OK"));
        assert!(!emu.settings.spaces_enabled);

        let resp = emu.handle_command("ATZ");
        assert!(resp.contains("ELM327"));
        assert!(emu.settings.echo_enabled);
        assert!(emu.settings.spaces_enabled);

        assert!(emu.handle_command("ATXYZ").contains('?'));
    }

    #[test]
    fn test_at_flags_and_knobs() {
        let mut emu = quiet_emulator();
        assert_eq!(emu.handle_command("ATAL"), "\rOK\r>");
        assert!(emu.settings.long_messages);
        assert_eq!(emu.handle_command("ATNL"), "\rOK\r>");
        assert!(!emu.settings.long_messages);
        assert_eq!(emu.handle_command("ATSP0"), "\rOK\r>");
        assert_eq!(emu.handle_command("ATST FF"), "\rOK\r>");
        assert_eq!(emu.handle_command("ATH0"), "\rOK\r>");
        assert_eq!(emu.handle_command("ATH1"), "\r?\r>");
        assert_eq!(emu.handle_command("ATSH"), "\r?\r>");
        assert!(!emu.settings.spaces_enabled);
        assert!(emu.handle_command("ATS1").contains("OK"));
        assert!(emu.settings.spaces_enabled);
    }

    #[test]
    fn test_spaced_bytes() {
        let mut settings = AdapterSettings::default();
        assert_eq!(settings.hex(&[0x41, 0x0C, 0x1A, 0xF8]), "41 0C 1A F8");
        settings.spaces_enabled = false;
        assert_eq!(settings.hex(&[0x41, 0x0C, 0x1A, 0xF8]), "410C1AF8");
    }

    #[test]
    fn test_spaces_leave_status_text_alone() {
        let mut emu = Elm327Emulator::default();
        emu.handle_command("ATE0");
        emu.vehicle.extended.push(ExtendedRecord {
            header: EcuHeader::broadcast(),
            pid: 0x0101,
            data: vec![0xEF, 0xFB, 0xE7, 0xED, 0x95, 0x00],
        });
        assert_eq!(emu.handle_command("220101"), "BUFFER FULL\r\n\r\n>");
        assert_eq!(emu.handle_command("03"), "43 00 00 00 00 00 00\r\n\r\n>");
    }

    #[test]
    fn test_echo_and_prompt() {
        let mut emu = Elm327Emulator::default();
        let out = emu.feed(b"010D\r");
        assert_eq!(out, b"010D\r41 0D 28\r\n\r\n>");
    }

    #[test]
    fn test_command_split_across_feeds() {
        let mut emu = quiet_emulator();
        assert!(emu.feed(b"01").is_empty());
        assert_eq!(emu.feed(b"0C\r"), b"410C0C80\r\r>");
    }

    #[test]
    fn test_voltage_and_unknown_pid() {
        let mut emu = quiet_emulator();
        assert_eq!(emu.handle_command("ATRV"), "\r12.4V\r>");
        assert_eq!(emu.handle_command("01A6"), "NO DATA\r\r>");
    }

    #[test]
    fn test_dtcs() {
        let mut emu = quiet_emulator();
        assert_eq!(emu.handle_command("03"), "43000000000000\r\r>");
        emu.vehicle.dtcs = vec![0x0101, 0x4123];
        assert_eq!(emu.handle_command("03"), "43010141230000\r\r>");
    }

    #[test]
    fn test_extended_needs_matching_header() {
        let mut emu = quiet_emulator();
        emu.vehicle.extended.push(ExtendedRecord {
            header: EcuHeader::new("7E4"),
            pid: 0x0101,
            data: vec![0xEF, 0xFB],
        });
        emu.handle_command("ATSH7E0");
        assert_eq!(emu.handle_command("220101"), "NO DATA\r\r>");
        emu.handle_command("ATSH7E4");
        assert_eq!(emu.handle_command("220101"), "620101EFFB\r\r>");
    }

    #[test]
    fn test_multi_frame_reply() {
        let mut emu = quiet_emulator();
        emu.vehicle.extended.push(ExtendedRecord {
            header: EcuHeader::new("7E4"),
            pid: 0x0101,
            data: vec![0xEF, 0xFB, 0xE7, 0xED, 0x95, 0x00, 0x00, 0x11],
        });
        emu.handle_command("ATSH7E4");
        assert_eq!(emu.handle_command("220101"), "BUFFER FULL\r\r>");
        emu.handle_command("ATAL");
        assert_eq!(
            emu.handle_command("220101"),
            "00B\r0:620101EFFBE7\r1:ED95000011\r\r>"
        );
    }
}
