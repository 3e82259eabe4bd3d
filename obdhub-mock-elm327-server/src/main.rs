//! Mock ELM327 OBD2 adapter for exercising the polling engine
//!
//! Usage: cargo run -p obdhub-mock-elm327-server -- [OPTIONS]
//! Then point `obdhub-poll` at 127.0.0.1:35000
//!
//! Replies are written in small chunks with a short pause in between, the
//! way a BLE adapter delivers them as notifications.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use obdhub_elm327_lib::emulator::{Elm327Emulator, ExtendedRecord, Vehicle};
use obdhub_elm327_lib::EcuHeader;

#[derive(Parser, Debug, Clone)]
#[command(name = "obdhub-mock-elm327")]
#[command(about = "Mock ELM327 adapter that answers in notification-sized chunks")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:35000")]
    listen: String,

    /// Largest chunk written at once (default BLE ATT payload)
    #[arg(short, long, default_value = "20")]
    chunk_size: usize,

    /// Pause between chunks in milliseconds
    #[arg(short = 'd', long, default_value = "5")]
    chunk_delay_ms: u64,

    /// Stored trouble code as 4 hex digits, e.g. 0101 for P0101 (repeatable)
    #[arg(long = "dtc")]
    dtcs: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let dtcs = args
        .dtcs
        .iter()
        .map(|code| u16::from_str_radix(code, 16).with_context(|| format!("invalid DTC {code:?}")))
        .collect::<Result<Vec<_>>>()?;

    info!("Mock ELM327 starting on {}...", args.listen);
    let listener = TcpListener::bind(&args.listen)
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("Mock ELM327 ready - waiting for connections...");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                info!("Client connected: {:?}", stream.peer_addr());
                let args = args.clone();
                let dtcs = dtcs.clone();
                thread::spawn(move || handle_client(stream, &args, dtcs));
            }
            Err(e) => error!("Connection error: {e}"),
        }
    }
    Ok(())
}

/// A demo vehicle: one battery-management ECU behind 7E4
fn demo_vehicle(dtcs: Vec<u16>) -> Vehicle {
    Vehicle {
        dtcs,
        extended: vec![ExtendedRecord {
            header: EcuHeader::new("7E4"),
            pid: 0x0101,
            data: vec![
                0xEF, 0xFB, 0xE7, 0xED, 0x95, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x10,
            ],
        }],
        ..Vehicle::default()
    }
}

fn handle_client(mut stream: TcpStream, args: &Args, dtcs: Vec<u16>) {
    let mut emulator = Elm327Emulator::new(demo_vehicle(dtcs));
    let mut byte = [0u8; 1];
    let start_time = Instant::now();

    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                info!("Client disconnected");
                break;
            }
            Ok(_) => {
                emulator.vehicle.rpm = rpm_at(start_time.elapsed());
                let out = emulator.feed(&byte);
                if out.is_empty() {
                    continue;
                }
                if let Err(e) = write_chunked(&mut stream, &out, args) {
                    warn!("Write error: {e}");
                    break;
                }
            }
            Err(e) => {
                warn!("Read error: {e}");
                break;
            }
        }
    }
}

fn write_chunked(stream: &mut TcpStream, out: &[u8], args: &Args) -> std::io::Result<()> {
    for chunk in out.chunks(args.chunk_size.max(1)) {
        stream.write_all(chunk)?;
        stream.flush()?;
        if args.chunk_delay_ms > 0 {
            thread::sleep(Duration::from_millis(args.chunk_delay_ms));
        }
    }
    Ok(())
}

/// Drive cycle as (seconds, rpm) keyframes; the last one closes the loop.
const DRIVE_CYCLE: [(f64, f64); 5] = [
    (0.0, 800.0),
    (4.0, 3500.0),
    (7.0, 3500.0),
    (11.0, 800.0),
    (14.0, 800.0),
];

/// Engine speed at `elapsed`, interpolated between keyframes.
fn rpm_at(elapsed: Duration) -> f64 {
    let cycle = DRIVE_CYCLE[DRIVE_CYCLE.len() - 1].0;
    let t = elapsed.as_secs_f64() % cycle;
    DRIVE_CYCLE
        .windows(2)
        .find(|w| t < w[1].0)
        .map_or(DRIVE_CYCLE[0].1, |w| {
            let ((t0, r0), (t1, r1)) = (w[0], w[1]);
            r0 + (r1 - r0) * (t - t0) / (t1 - t0)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpm_profile() {
        assert_eq!(rpm_at(Duration::ZERO), 800.0);
        assert_eq!(rpm_at(Duration::from_secs(2)), 2150.0);
        assert_eq!(rpm_at(Duration::from_secs(5)), 3500.0);
        assert_eq!(rpm_at(Duration::from_secs(9)), 2150.0);
        assert_eq!(rpm_at(Duration::from_secs(13)), 800.0);
        assert_eq!(rpm_at(Duration::from_secs(14)), 800.0);
    }

    #[test]
    fn test_demo_vehicle_serves_bms_block() {
        let mut emulator = Elm327Emulator::new(demo_vehicle(vec![0x0101]));
        for cmd in ["ATE0", "ATL0", "ATS0", "ATAL", "ATSH7E4"] {
            emulator.handle_command(cmd);
        }
        let reply = emulator.handle_command("220101");
        assert!(reply.starts_with("00F\r0:620101EFFBE7\r"));
        assert_eq!(emulator.handle_command("03"), "43010100000000\r\r>");
    }
}
