//! ELM327 polling client
//!
//! Connects the polling engine to an ELM327-compatible adapter reachable over
//! TCP (or to an in-process emulator), runs it for a while and logs every
//! value it publishes.
//!
//! Usage: cargo run -p obdhub-poller -- [OPTIONS]

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use indexmap::IndexMap;
use log::{debug, info, warn};
use obdhub_elm327_lib::emulator::{Elm327Emulator, LoopbackTransport};
use obdhub_elm327_lib::{
    Engine, HubConfig, LinkEvent, SinkId, Transport, TransportError, ValueSink,
};

#[derive(Parser, Debug)]
#[command(name = "obdhub-poll")]
#[command(about = "Poll an ELM327 adapter and log decoded values")]
struct Args {
    /// Adapter address to connect to
    #[arg(short, long, default_value = "127.0.0.1:35000")]
    address: String,

    /// JSON hub configuration (default: common preset sensors)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long to poll in seconds (0 = run forever)
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Engine tick period in milliseconds
    #[arg(short, long, default_value = "50")]
    tick_ms: u64,

    /// Talk to a built-in emulator instead of the network
    #[arg(short, long)]
    simulate: bool,

    /// Largest notification delivered to the engine in simulate mode
    #[arg(long, default_value = "20")]
    chunk_size: usize,
}

/// Display metadata for a sink
#[derive(Debug, Clone)]
struct SensorLabel {
    name: String,
    unit: String,
    accuracy: usize,
}

#[derive(Debug, Clone)]
enum Reading {
    Numeric(f64),
    Text(String),
    Boolean(bool),
}

struct Shown<'a>(&'a Reading, Option<&'a SensorLabel>);

impl fmt::Display for Shown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.0, self.1) {
            (Reading::Numeric(v), Some(label)) => {
                write!(f, "{v:.prec$} {}", label.unit, prec = label.accuracy)
            }
            (Reading::Numeric(v), None) => write!(f, "{v:.2}"),
            (Reading::Text(t), _) => write!(f, "{t}"),
            (Reading::Boolean(b), _) => write!(f, "{}", if *b { "on" } else { "off" }),
        }
    }
}

/// Sink that logs each value and keeps the latest one per id.
#[derive(Debug, Default)]
struct LogSink {
    labels: IndexMap<SinkId, SensorLabel>,
    latest: IndexMap<SinkId, Reading>,
    publications: u64,
}

impl LogSink {
    fn from_config(config: &HubConfig) -> Self {
        let labels = config
            .sensors
            .iter()
            .map(|s| {
                let label = SensorLabel {
                    name: s.display_name(),
                    unit: s.unit().to_string(),
                    accuracy: usize::from(s.accuracy()),
                };
                (s.id.clone(), label)
            })
            .collect();
        Self {
            labels,
            ..Self::default()
        }
    }

    fn record(&mut self, id: &SinkId, reading: Reading) {
        self.publications += 1;
        let label = self.labels.get(id);
        let name = label.map_or(id.as_str(), |l| l.name.as_str());
        info!("{name} = {}", Shown(&reading, label));
        self.latest.insert(id.clone(), reading);
    }

    fn print_summary(&self, elapsed: Duration) {
        println!("\n=== Poll Summary ===");
        println!("Run time:     {:.1}s", elapsed.as_secs_f64());
        println!("Publications: {}", self.publications);
        for (id, reading) in &self.latest {
            let label = self.labels.get(id);
            let name = label.map_or(id.as_str(), |l| l.name.as_str());
            println!("  {name:<28} {}", Shown(reading, label));
        }
    }
}

impl ValueSink for LogSink {
    fn publish_numeric(&mut self, id: &SinkId, value: f64) {
        self.record(id, Reading::Numeric(value));
    }

    fn publish_text(&mut self, id: &SinkId, value: &str) {
        self.record(id, Reading::Text(value.to_string()));
    }

    fn publish_boolean(&mut self, id: &SinkId, value: bool) {
        self.record(id, Reading::Boolean(value));
    }
}

/// Write half of a TCP link
struct TcpTransport {
    stream: TcpStream,
}

impl Transport for TcpTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        debug!("TX: {}", String::from_utf8_lossy(bytes).escape_debug());
        self.stream
            .write_all(bytes)
            .map_err(|e| TransportError::write_failed(&e))
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<HubConfig> {
    let Some(path) = path else {
        return Ok(HubConfig::with_default_sensors());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    HubConfig::from_json(&json).with_context(|| format!("failed to parse {}", path.display()))
}

/// Tick the engine until the deadline passes or `pump` reports the link gone.
fn drive<T: Transport>(
    engine: &mut Engine<T, LogSink>,
    args: &Args,
    mut pump: impl FnMut(&mut Engine<T, LogSink>) -> Result<bool>,
) -> Result<Duration> {
    let start = Instant::now();
    let deadline = (args.duration > 0).then(|| start + Duration::from_secs(args.duration));
    let period = Duration::from_millis(args.tick_ms.max(1));

    engine.handle_event(LinkEvent::Connected);
    engine.handle_event(LinkEvent::ReadyForTraffic);

    loop {
        if !pump(engine)? {
            break;
        }
        let now = Instant::now();
        engine.tick(now);
        if deadline.is_some_and(|d| now >= d) {
            break;
        }
        thread::sleep(period);
    }
    Ok(start.elapsed())
}

fn run_tcp(args: &Args, config: &HubConfig) -> Result<()> {
    info!("Connecting to {}...", args.address);
    let stream = TcpStream::connect(&args.address)
        .with_context(|| format!("failed to connect to {}", args.address))?;
    stream.set_nodelay(true)?;
    let mut reader = stream.try_clone()?;
    reader.set_nonblocking(true)?;

    let mut engine = Engine::new(
        config.build_registry()?,
        config.engine_settings(),
        TcpTransport { stream },
        LogSink::from_config(config),
    );
    engine.log_config();

    let mut buf = [0u8; 64];
    let elapsed = drive(&mut engine, args, |engine| loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                engine.handle_event(LinkEvent::Disconnected);
                return Ok(false);
            }
            Ok(n) => engine.handle_event(LinkEvent::Notification(&buf[..n])),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(true),
            Err(e) => {
                warn!("Read error: {e}");
                engine.handle_event(LinkEvent::Disconnected);
                return Ok(false);
            }
        }
    })?;

    engine.sink().print_summary(elapsed);
    Ok(())
}

fn run_simulated(args: &Args, config: &HubConfig) -> Result<()> {
    info!("Polling the built-in emulator");
    let mut engine = Engine::new(
        config.build_registry()?,
        config.engine_settings(),
        LoopbackTransport::new(Elm327Emulator::default()),
        LogSink::from_config(config),
    );
    engine.log_config();

    let chunk_size = args.chunk_size.max(1);
    let elapsed = drive(&mut engine, args, |engine| {
        let out = engine.transport_mut().take_pending();
        for chunk in out.chunks(chunk_size) {
            engine.handle_event(LinkEvent::Notification(chunk));
        }
        Ok(true)
    })?;

    engine.sink().print_summary(elapsed);
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    env_logger::Builder::new()
        .filter_level(config.log_level.as_level_filter())
        .parse_default_env()
        .init();

    if args.simulate {
        run_simulated(&args, &config)
    } else {
        run_tcp(&args, &config)
    }
}
