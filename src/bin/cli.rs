//! Heatlink CLI - diagnostic command-line interface
//!
//! Thin consumer of the core: list adapters, run element discovery, read and
//! write parameters, and watch bus traffic. Every command can run against a
//! recorded capture instead of a live adapter.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use heatlink_core::cli::{from_anyhow, install_panic_hook, print_exit_codes, ExitCodes, UsageError};
use heatlink_core::config::AppConfig;
use heatlink_core::core::client::{HeatPump, Param};
use heatlink_core::core::codec::{from_hex, Bitrate, Value, ValueFormat};
use heatlink_core::core::connection::Connection;
use heatlink_core::core::discovery::{CacheStatus, Discovery, DiscoveryCache, ElementRegistry, RegistrySource};
use heatlink_core::core::frame::split_id;
use heatlink_core::core::transport::{list_ports, FrameRecording, ReplayControl, ReplayTransport};
use heatlink_core::utils::logging;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::time::Instant;

/// CLI output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// Heatlink CLI
#[derive(Parser, Debug)]
#[command(name = "heatlink", version, about = "Heat pump CAN link diagnostics", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, env = "HEATLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port, overrides the config file
    #[arg(short, long, env = "HEATLINK_PORT")]
    port: Option<String>,

    /// Serial baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// CAN bitrate (10k, 20k, 50k, 100k, 125k, 250k, 500k, 800k, 1m)
    #[arg(long, value_parser = parse_bitrate)]
    bitrate: Option<Bitrate>,

    /// Replay a JSON frame recording instead of opening the adapter
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts,

    /// Learn the controller's element table
    Discover {
        /// Ignore a fresh cache and transfer the table
        #[arg(long)]
        force: bool,
    },

    /// Read a parameter (name, index or 0x-index)
    Read {
        /// Parameter
        param: String,

        /// Value format (temp, temp_half, temp_whole, i8..i64, u8..u64)
        #[arg(long, default_value = "temp")]
        value_format: ValueFormat,
    },

    /// Write a parameter
    Write {
        /// Parameter
        param: String,

        /// Raw payload as hex
        #[arg(long, conflicts_with = "value")]
        hex: Option<String>,

        /// Value, encoded with --value-format
        #[arg(long, allow_hyphen_values = true)]
        value: Option<f64>,

        /// Value format for --value
        #[arg(long, default_value = "temp")]
        value_format: ValueFormat,
    },

    /// Print received frames
    Monitor {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Save the traffic as a JSON recording
        #[arg(long)]
        record: Option<PathBuf>,
    },

    /// Show exit code table
    ExitCodes,
}

fn parse_bitrate(text: &str) -> Result<Bitrate, String> {
    serde_json::from_value(serde_json::Value::String(text.to_lowercase()))
        .map_err(|_| format!("unknown bitrate '{text}'"))
}

#[tokio::main]
async fn main() -> ExitCode {
    install_panic_hook();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(ExitCodes::INVALID_ARGS)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let result = from_anyhow(&err);
            eprintln!("error: {}", result.message().unwrap_or("unknown error"));
            result.to_exit_code()
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    if cli.replay.is_some() && matches!(cli.command, Commands::Discover { .. }) {
        // a recording cannot answer the table transfer requests
        return Err(UsageError::new("discover needs a live adapter; --replay recordings only carry broadcast traffic").into());
    }

    let mut app = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    if let Some(port) = &cli.port {
        app.adapter.port.clone_from(port);
    }
    if let Some(baud) = cli.baud {
        app.adapter.baud_rate = baud;
    }
    if let Some(bitrate) = cli.bitrate {
        app.adapter.bitrate = bitrate;
    }
    if cli.verbose {
        app.logging.level = "debug".into();
    } else if cli.quiet {
        app.logging.level = "error".into();
    }
    let _guard = logging::init(&app.logging)?;

    match &cli.command {
        Commands::ListPorts => show_ports(cli),
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(())
        }
        Commands::Discover { force } => {
            let (conn, _replay) = open(cli, &app).await?;
            let result = discover(cli, &app, &conn, *force).await;
            conn.manual_disconnect().await;
            result
        }
        Commands::Read { param, value_format } => {
            let (conn, _replay) = open(cli, &app).await?;
            let result = read(cli, &app, &conn, param, *value_format).await;
            conn.manual_disconnect().await;
            result
        }
        Commands::Write {
            param,
            hex,
            value,
            value_format,
        } => {
            let payload = match (hex, value) {
                (Some(hex), _) => from_hex(hex)?,
                (None, Some(value)) => value_format.encode(&to_value(*value, *value_format)?)?,
                (None, None) => return Err(UsageError::new("either --hex or --value is required").into()),
            };
            let (conn, _replay) = open(cli, &app).await?;
            let result = write(cli, &app, &conn, param, &payload).await;
            conn.manual_disconnect().await;
            result
        }
        Commands::Monitor { duration, record } => {
            let (conn, _replay) = open(cli, &app).await?;
            let result = monitor(cli, &app, &conn, duration.map(Duration::from_secs), record.as_deref()).await;
            conn.manual_disconnect().await;
            result
        }
    }
}

/// Interpret `--value` for a format; integer formats take whole numbers only
fn to_value(value: f64, format: ValueFormat) -> Result<Value, UsageError> {
    let integral = || {
        if value.is_finite() && value.fract() == 0.0 {
            Ok(value)
        } else {
            Err(UsageError::new(format!("--value {value} is not an integer, {format} needs one")))
        }
    };
    match format {
        ValueFormat::Int(_) => {
            let value = integral()?;
            if value < i64::MIN as f64 || value >= i64::MAX as f64 {
                return Err(UsageError::new(format!("--value {value} is out of range for {format}")));
            }
            Ok(Value::Signed(value as i64))
        }
        ValueFormat::UInt(_) => {
            let value = integral()?;
            if value < 0.0 || value >= u64::MAX as f64 {
                return Err(UsageError::new(format!("--value {value} is out of range for {format}")));
            }
            Ok(Value::Unsigned(value as u64))
        }
        _ => Ok(Value::Temperature(value)),
    }
}

async fn open(cli: &Cli, app: &AppConfig) -> anyhow::Result<(Connection, Option<ReplayControl>)> {
    let Some(path) = &cli.replay else {
        if !cli.quiet {
            eprintln!("Connecting to {} @ {} baud...", app.adapter.port, app.adapter.baud_rate);
        }
        let conn = Connection::connect_with_config(app.connection()).await?;
        return Ok((conn, None));
    };

    let recording =
        FrameRecording::load_json(path).with_context(|| format!("loading recording {}", path.display()))?;
    let control = ReplayControl::new();
    let transport = ReplayTransport::new(&path.display().to_string(), control.clone());
    let conn = Connection::with_transport(Box::new(transport), app.connection()).await?;
    let frames = control.schedule_recording(&recording)?;
    if !cli.quiet {
        eprintln!("Replaying {frames} frames from {}", path.display());
    }
    Ok((conn, Some(control)))
}

fn show_ports(cli: &Cli) -> anyhow::Result<()> {
    let ports = list_ports()?;
    match cli.format {
        OutputFormat::Json => {
            let json: Vec<_> = ports
                .iter()
                .map(|p| serde_json::json!({ "name": p.port_name, "type": format!("{:?}", p.port_type) }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text if ports.is_empty() => println!("No serial ports found."),
        OutputFormat::Text => {
            for port in &ports {
                println!("  {} [{:?}]", port.port_name, port.port_type);
            }
        }
    }
    Ok(())
}

async fn discover(cli: &Cli, app: &AppConfig, conn: &Connection, force: bool) -> anyhow::Result<()> {
    let registry = ElementRegistry::new();
    let outcome = Discovery::new(conn.clone(), registry.clone(), app.discovery())
        .run(force)
        .await?;
    let relocations = outcome.changes.iter().filter(|c| c.is_relocation()).count();

    match cli.format {
        OutputFormat::Json => {
            let elements: Vec<_> = registry
                .elements()
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "index": e.index,
                        "name": e.name,
                        "can_id": format!("{:08X}", e.response_id()),
                        "extid": e.extid_hex(),
                        "min": e.min,
                        "max": e.max,
                    })
                })
                .collect();
            let json = serde_json::json!({
                "source": outcome.source,
                "attempts": outcome.attempts,
                "bytes_received": outcome.bytes_received,
                "bytes_expected": outcome.bytes_expected,
                "index_changes": relocations,
                "extid_changes": outcome.changes.len() - relocations,
                "elements": elements,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!(
                "{} elements from {} ({}/{} bytes, {} attempts, {} index changes, {} extended id changes)",
                outcome.elements,
                outcome.source,
                outcome.bytes_received,
                outcome.bytes_expected,
                outcome.attempts,
                relocations,
                outcome.changes.len() - relocations
            );
            if !cli.quiet {
                for element in registry.elements() {
                    println!("  {element}");
                }
            }
        }
    }
    Ok(())
}

async fn client(app: &AppConfig, conn: &Connection) -> anyhow::Result<HeatPump> {
    let registry = ElementRegistry::new();
    Discovery::new(conn.clone(), registry.clone(), app.discovery())
        .run(false)
        .await
        .context("element registry unavailable")?;
    Ok(HeatPump::new(conn.clone(), registry, app.client()))
}

async fn read(cli: &Cli, app: &AppConfig, conn: &Connection, param: &str, format: ValueFormat) -> anyhow::Result<()> {
    let pump = client(app, conn).await?;
    let reading = pump.read_value(&Param::parse(param), format).await?;
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reading)?),
        OutputFormat::Text => println!("{} = {} ({})", reading.name, reading.value, reading.source),
    }
    Ok(())
}

async fn write(cli: &Cli, app: &AppConfig, conn: &Connection, param: &str, payload: &[u8]) -> anyhow::Result<()> {
    let pump = client(app, conn).await?;
    let ack = pump
        .write(&Param::parse(param), payload, Duration::from_millis(app.adapter.timeout_ms))
        .await?;
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&ack)?),
        OutputFormat::Text => println!("wrote {} to {:08X}", hex::encode_upper(&ack.payload), ack.can_id),
    }
    Ok(())
}

/// Names from the discovery cache, when one exists; the monitor never
/// transfers the table itself
fn cached_registry(app: &AppConfig) -> ElementRegistry {
    let registry = ElementRegistry::new();
    let cached = app.discovery().cache_path.map(|path| DiscoveryCache::load(&path));
    if let Some(CacheStatus::Valid(cache)) = cached {
        if let Ok(elements) = cache.to_elements() {
            registry.apply(elements, RegistrySource::Cache);
        }
    }
    registry
}

async fn monitor(
    cli: &Cli,
    app: &AppConfig,
    conn: &Connection,
    duration: Option<Duration>,
    record: Option<&Path>,
) -> anyhow::Result<()> {
    let registry = cached_registry(app);
    let mut recording = record.map(|_| FrameRecording::new(&format!("heatlink monitor on {}", conn.port())));
    let started = Instant::now();
    let deadline = duration.map(|d| started + d);
    let mut link = conn.lock()?;

    if !cli.quiet {
        eprintln!("Monitoring. Press Ctrl+C to stop.");
    }
    loop {
        let wait = match deadline {
            Some(deadline) if Instant::now() >= deadline => break,
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::from_secs(1),
        };
        let frame = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            frame = link.receive(wait) => frame?,
        };
        let Some(frame) = frame else { continue };

        if let Some(recording) = recording.as_mut() {
            recording.push(started.elapsed(), &frame);
        }
        let (base, index) = split_id(frame.id());
        let name = registry.lookup_by_index(index).map(|e| e.name).unwrap_or_default();
        match cli.format {
            OutputFormat::Json => println!(
                "{}",
                serde_json::json!({
                    "offset_ms": started.elapsed().as_millis() as u64,
                    "id": format!("{:08X}", frame.id()),
                    "base": format!("{base:08X}"),
                    "index": index,
                    "name": name,
                    "data": hex::encode_upper(frame.data()),
                })
            ),
            OutputFormat::Text => println!("{:>8.3}  {frame}  {name}", started.elapsed().as_secs_f64()),
        }
    }
    drop(link);

    if let (Some(recording), Some(path)) = (recording, record) {
        recording.save_json(path)?;
        if !cli.quiet {
            eprintln!("Saved {} frames to {}", recording.frames.len(), path.display());
        }
    }
    if let Some(stats) = conn.stats() {
        tracing::info!(
            frames_received = stats.frames_received,
            errors = stats.errors,
            "monitor finished"
        );
    }
    Ok(())
}
