//! fidlink - talk to portable FID analyzers from the command line
//!
//! Connects over a serial port, a TCP bridge or an in-process simulator and
//! runs one operation per invocation.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fidlink_core::config::SessionConfig;
use fidlink_core::device::{Gen1Analyzer, Gen2Analyzer, LogTarget};
use fidlink_core::protocol::serial::open_port;
use fidlink_core::protocol::{CommunicationChannel, TcpChannel};
use fidlink_core::session::{EventBus, SessionEvent};
use fidlink_core::sim::{Gen1Sim, Gen2Sim, SimLink, SIM_PASSWORD};
use fidlink_core::sink::FileLogSink;
use fidlink_core::telemetry::RawSample;
use fidlink_core::transfer::{FlashTransfer, TransferReport, UpdateReport};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "fidlink")]
#[command(author, version, about = "Host tool for portable FID analyzers")]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port of the analyzer
    #[arg(long, env = "FIDLINK_PORT", conflicts_with_all = ["tcp", "demo"])]
    serial: Option<String>,

    /// Baud rate for --serial
    #[arg(long)]
    baud: Option<u32>,

    /// host:port of a serial-over-TCP bridge
    #[arg(long, conflicts_with = "demo")]
    tcp: Option<String>,

    /// Talk to a simulated analyzer instead of hardware
    #[arg(long, value_enum)]
    demo: Option<Generation>,

    /// Protocol generation of the connected analyzer
    #[arg(long, value_enum, default_value = "gen2")]
    generation: Generation,

    /// Session configuration (JSON)
    #[arg(short, long, env = "FIDLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the link read timeout from the config
    #[arg(long)]
    read_timeout_ms: Option<u64>,

    /// Override the telemetry polling interval from the config
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Generation {
    Gen1,
    Gen2,
}

#[derive(Subcommand)]
enum Commands {
    /// Firmware version and one reading
    Info,

    /// Stream telemetry as JSON lines
    Monitor {
        /// Stop after this many samples
        #[arg(long)]
        count: Option<usize>,

        /// Directory to write the CSV log into
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Log file name inside --log-dir; defaults to the session id
        #[arg(long)]
        log_name: Option<String>,
    },

    /// List calibration slots
    Calibrations,

    /// Read device flash
    FlashRead {
        /// Start address (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_address)]
        address: u32,

        /// Bytes to read; omit to use the stored length prefix
        length: Option<usize>,

        /// Write the bytes here instead of printing hex
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a file to device flash, verifying every chunk
    FlashWrite {
        #[arg(value_parser = parse_address)]
        address: u32,

        file: PathBuf,

        /// Prefix the data with its stored length
        #[arg(long)]
        stored_length: bool,
    },

    /// Replace the analyzer firmware
    Firmware {
        image: PathBuf,

        /// Update-mode password
        #[arg(long, value_parser = parse_address)]
        password: Option<u32>,
    },

    /// Download the stored device log (Gen2 only)
    Logs {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn parse_address(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{text}': {e}"))
}

/// A connected analyzer of either generation
enum Analyzer {
    Gen1(Gen1Analyzer),
    Gen2(Gen2Analyzer),
}

impl Analyzer {
    fn connect(cli: &Cli, config: SessionConfig) -> Result<Self> {
        let generation = cli.demo.unwrap_or(cli.generation);
        let channel: Box<dyn CommunicationChannel> = if let Some(demo) = cli.demo {
            match demo {
                Generation::Gen1 => Box::new(SimLink::new(Gen1Sim::new().with_noise(1))),
                Generation::Gen2 => Box::new(SimLink::new(Gen2Sim::new().with_noise(1))),
            }
        } else if let Some(addr) = &cli.tcp {
            Box::new(
                TcpChannel::connect(addr, config.read_timeout())
                    .with_context(|| format!("connecting to {addr}"))?,
            )
        } else if let Some(port) = &cli.serial {
            Box::new(
                open_port(port, cli.baud, config.read_timeout())
                    .with_context(|| format!("opening {port}"))?,
            )
        } else {
            bail!("no link given: use --serial, --tcp or --demo");
        };

        Ok(match generation {
            Generation::Gen1 => Analyzer::Gen1(Gen1Analyzer::connect(channel, config)?),
            Generation::Gen2 => Analyzer::Gen2(Gen2Analyzer::connect(channel, config)?),
        })
    }

    fn session_id(&self) -> Uuid {
        match self {
            Analyzer::Gen1(a) => a.session().id(),
            Analyzer::Gen2(a) => a.session().id(),
        }
    }

    fn events(&self) -> &EventBus {
        match self {
            Analyzer::Gen1(a) => a.session().events(),
            Analyzer::Gen2(a) => a.session().events(),
        }
    }

    fn read_version(&self) -> Result<String> {
        Ok(match self {
            Analyzer::Gen1(a) => a.read_version()?,
            Analyzer::Gen2(a) => a.read_version()?,
        })
    }

    fn read_sample(&self) -> Result<RawSample> {
        Ok(match self {
            Analyzer::Gen1(a) => a.read_status()?,
            Analyzer::Gen2(a) => a.read_readings()?,
        })
    }

    fn start_telemetry(&self, log: Option<LogTarget>) -> Result<()> {
        match self {
            Analyzer::Gen1(a) => a.start_telemetry(log)?,
            Analyzer::Gen2(a) => a.start_telemetry(log)?,
        }
        Ok(())
    }

    fn stop_telemetry(&self) {
        match self {
            Analyzer::Gen1(a) => a.stop_telemetry(),
            Analyzer::Gen2(a) => a.stop_telemetry(),
        }
    }

    fn calibrations(&self) -> Result<Vec<fidlink_core::device::CalibrationSlot>> {
        Ok(match self {
            Analyzer::Gen1(a) => a.calibration_slots()?,
            Analyzer::Gen2(a) => a.calibration_slots()?,
        })
    }

    fn flash_read(&self, address: u32, length: Option<usize>) -> Result<Vec<u8>> {
        fn read<A: fidlink_core::transfer::FlashAccess>(
            mut transfer: FlashTransfer<'_, A>,
            address: u32,
            length: Option<usize>,
        ) -> Result<Vec<u8>> {
            Ok(match length {
                Some(length) => transfer.read(address, length)?,
                None => transfer.read_with_stored_length(address)?,
            })
        }
        match self {
            Analyzer::Gen1(a) => read(a.flash(), address, length),
            Analyzer::Gen2(a) => read(a.flash(), address, length),
        }
    }

    fn flash_write(&self, address: u32, data: &[u8], stored_length: bool) -> Result<TransferReport> {
        fn write<A: fidlink_core::transfer::FlashAccess>(
            transfer: FlashTransfer<'_, A>,
            address: u32,
            data: &[u8],
            stored_length: bool,
        ) -> Result<TransferReport> {
            let mut transfer = transfer.on_progress(|p| eprint!("\rflash write {p:3}%"));
            let report = if stored_length {
                transfer.write_with_stored_length(address, data)?
            } else {
                transfer.write(address, data)?
            };
            eprintln!();
            Ok(report)
        }
        match self {
            Analyzer::Gen1(a) => write(a.flash(), address, data, stored_length),
            Analyzer::Gen2(a) => write(a.flash(), address, data, stored_length),
        }
    }

    fn update_firmware(&self, image: &[u8], password: u32) -> Result<UpdateReport> {
        Ok(match self {
            Analyzer::Gen1(a) => a.update_firmware(image, password)?,
            Analyzer::Gen2(a) => a.update_firmware(image, password)?,
        })
    }
}

fn monitor(analyzer: &Analyzer, count: Option<usize>, log: Option<LogTarget>) -> Result<()> {
    let events = analyzer.events().subscribe();
    analyzer.start_telemetry(log)?;

    let mut seen = 0;
    while count.map_or(true, |limit| seen < limit) {
        let event = match events.recv_timeout(Duration::from_secs(30)) {
            Ok(event) => event,
            Err(_) => {
                analyzer.stop_telemetry();
                bail!("no telemetry for 30s");
            }
        };
        match event {
            SessionEvent::Telemetry(sample) => {
                println!("{}", serde_json::to_string(&sample)?);
                seen += 1;
            }
            SessionEvent::ReconnectNeeded { reason } => {
                analyzer.stop_telemetry();
                bail!("link lost: {reason}");
            }
            SessionEvent::DeviceShutdown { reason } => {
                tracing::warn!("analyzer shutting down: {reason}");
                break;
            }
            other => tracing::info!("{other:?}"),
        }
    }
    analyzer.stop_telemetry();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(ms) = cli.read_timeout_ms {
        config.read_timeout_ms = ms;
    }
    if let Some(ms) = cli.poll_ms {
        config.telemetry.polling_interval_ms = ms;
    }
    config.validate().context("invalid configuration")?;
    let analyzer = Analyzer::connect(&cli, config)?;

    match &cli.command {
        Commands::Info => {
            println!("version: {}", analyzer.read_version()?);
            println!("{}", serde_json::to_string_pretty(&analyzer.read_sample()?)?);
        }

        Commands::Monitor {
            count,
            log_dir,
            log_name,
        } => {
            let log = match log_dir {
                Some(dir) => Some(LogTarget {
                    sink: Box::new(
                        FileLogSink::new(dir)
                            .with_context(|| format!("creating {}", dir.display()))?,
                    ),
                    name: log_name
                        .clone()
                        .unwrap_or_else(|| format!("{}.csv", analyzer.session_id())),
                }),
                None => None,
            };
            monitor(&analyzer, *count, log)?;
        }

        Commands::Calibrations => {
            for slot in analyzer.calibrations()? {
                println!("{}", serde_json::to_string(&slot)?);
            }
        }

        Commands::FlashRead {
            address,
            length,
            output,
        } => {
            let data = analyzer.flash_read(*address, *length)?;
            match output {
                Some(path) => std::fs::write(path, &data)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => {
                    for (i, chunk) in data.chunks(16).enumerate() {
                        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
                        println!("{:08x}  {}", *address as usize + i * 16, hex.join(" "));
                    }
                }
            }
        }

        Commands::FlashWrite {
            address,
            file,
            stored_length,
        } => {
            let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
            let report = analyzer.flash_write(*address, &data, *stored_length)?;
            println!(
                "wrote {} bytes in {} chunks ({} retries)",
                report.bytes, report.chunks, report.retries
            );
        }

        Commands::Firmware { image, password } => {
            let data = std::fs::read(image).with_context(|| format!("reading {}", image.display()))?;
            let password = match (password, cli.demo) {
                (Some(password), _) => *password,
                (None, Some(_)) => SIM_PASSWORD,
                (None, None) => bail!("--password is required for a real analyzer"),
            };
            let report = analyzer.update_firmware(&data, password)?;
            println!("installed {} blocks ({} restarts)", report.blocks, report.restarts);
        }

        Commands::Logs { output } => {
            let Analyzer::Gen2(gen2) = &analyzer else {
                bail!("log retrieval needs a Gen2 analyzer");
            };
            let log = gen2.retrieve_logs()?;
            match output {
                Some(path) => std::fs::write(path, &log)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{}", String::from_utf8_lossy(&log)),
            }
        }
    }

    Ok(())
}
