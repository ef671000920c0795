//! timebatch CLI
//!
//! Insert into and read from configured streams in a local data directory:
//! - Insert datapoints
//! - Read index, time and "around time" ranges
//! - Inspect stream lengths and engine state
//! - Generate a default config file

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Mutex;
use timebatch::config::{generate_default_config, Config, LoggingConfig};
use timebatch::{DataRange, DataStream, Datapoint, StreamCatalog, StreamKey};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "timebatch")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Write-behind datapoint storage for time-series streams")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations, then built-in defaults)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Insert one datapoint
    Insert {
        /// Stream name from [[streams]]
        stream: String,
        /// JSON value
        value: String,
        /// Timestamp (default: now). Supports: "now", RFC 3339, Unix seconds
        #[arg(short, long)]
        time: Option<String>,
        #[arg(short, long)]
        substream: Option<String>,
        /// Recorded sender of the datapoint
        #[arg(long)]
        sender: Option<String>,
    },

    /// Print the number of datapoints in a stream
    Length {
        stream: String,
        #[arg(short, long)]
        substream: Option<String>,
    },

    /// Read an index range; negative indices count from the end
    Range {
        stream: String,
        #[arg(allow_hyphen_values = true, default_value = "0")]
        i1: i64,
        /// 0 reads to the end
        #[arg(allow_hyphen_values = true, default_value = "0")]
        i2: i64,
        #[arg(short, long)]
        substream: Option<String>,
    },

    /// Read datapoints with t1 < timestamp <= t2
    Trange {
        stream: String,
        t1: String,
        t2: Option<String>,
        #[arg(short, long)]
        limit: Option<u64>,
        #[arg(short, long)]
        substream: Option<String>,
    },

    /// Read datapoints around a time, starting `shift` points from it
    Around {
        stream: String,
        time: String,
        #[arg(allow_hyphen_values = true, default_value = "0")]
        shift: i64,
        /// Maximum datapoints to print
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
        #[arg(short, long)]
        substream: Option<String>,
    },

    /// Rebuild a segment after a crash left it corrupt
    Repair {
        stream: String,
        #[arg(short, long)]
        substream: Option<String>,
    },

    /// Show configured streams and engine state
    Stats,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let content = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("Config written to {}", path.display());
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    init_logging(&config.logging)?;

    let catalog = StreamCatalog::new(&config)?;
    let ds = DataStream::open(&config)?;

    let result = run(&cli, &catalog, &ds);

    // Commit whatever the command left pending
    ds.shutdown(None).await?;
    result
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("timebatch={}", config.level)));

    let writer = match &config.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(config.file.is_none());

    let result = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))
}

fn run(cli: &Cli, catalog: &StreamCatalog, ds: &DataStream) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Insert {
            stream,
            value,
            time,
            substream,
            sender,
        } => {
            let def = catalog.resolve(stream)?;
            let key = def.key(substream.as_deref());

            let data: serde_json::Value = serde_json::from_str(value)
                .with_context(|| format!("value {:?} is not valid JSON", value))?;
            let timestamp = match time {
                Some(t) => parse_time(t)?,
                None => now_seconds(),
            };
            let mut dp = Datapoint::new(timestamp, data);
            if let Some(sender) = sender {
                dp = dp.sender(sender.clone());
            }

            let length = ds.insert(&key, vec![dp], &def.insert_options())?;
            println!("Inserted into {} at {} (length {})", key, format_time(timestamp), length);
        }

        Commands::Length { stream, substream } => {
            let key = resolve_key(catalog, stream, substream)?;
            println!("{}", ds.stream_length(&key)?);
        }

        Commands::Range {
            stream,
            i1,
            i2,
            substream,
        } => {
            let key = resolve_key(catalog, stream, substream)?;
            let mut range = ds.irange(&key, *i1, *i2)?;
            print_range(range.as_mut(), usize::MAX, &cli.format)?;
        }

        Commands::Trange {
            stream,
            t1,
            t2,
            limit,
            substream,
        } => {
            let key = resolve_key(catalog, stream, substream)?;
            let t1 = parse_time(t1)?;
            let t2 = t2.as_deref().map(parse_time).transpose()?;
            let mut range = ds.trange(&key, t1, t2, *limit)?;
            print_range(range.as_mut(), usize::MAX, &cli.format)?;
        }

        Commands::Around {
            stream,
            time,
            shift,
            count,
            substream,
        } => {
            let key = resolve_key(catalog, stream, substream)?;
            let mut range = ds.time_plus_index_range(&key, parse_time(time)?, *shift, None)?;
            print_range(range.as_mut(), *count, &cli.format)?;
        }

        Commands::Repair { stream, substream } => {
            let key = resolve_key(catalog, stream, substream)?;
            let length = ds.repair(&key)?;
            println!("{} repaired, {} datapoints kept", key, length);
        }

        Commands::Stats => {
            let names = catalog.names()?;
            if cli.format == "json" {
                let mut streams = Vec::with_capacity(names.len());
                for name in &names {
                    let def = catalog.resolve(name)?;
                    streams.push(serde_json::json!({
                        "name": name,
                        "device": def.device,
                        "stream": def.stream,
                        "length": ds.stream_length(&def.key(None))?,
                    }));
                }
                let stats = ds.stats()?;
                let body = serde_json::json!({
                    "streams": streams,
                    "pending_points": stats.cache.pending_points,
                    "pending_bytes": stats.cache.pending_bytes,
                    "pending_batches": stats.cache.pending_batches(),
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else if names.is_empty() {
                println!("No streams configured.");
                println!();
                println!("Declare one in the [[streams]] table of your config:");
                println!("  timebatch config --output timebatch.toml");
            } else {
                println!("{:<32} {:>8} {:>8} {:>10}", "Stream", "Device", "ID", "Length");
                println!("{}", "-".repeat(62));
                for name in &names {
                    let def = catalog.resolve(name)?;
                    println!(
                        "{:<32} {:>8} {:>8} {:>10}",
                        name,
                        def.device,
                        def.stream,
                        ds.stream_length(&def.key(None))?
                    );
                }
                println!();
                println!("{}", ds.stats()?);
            }
        }

        Commands::Config { .. } => {}
    }

    Ok(())
}

fn resolve_key(
    catalog: &StreamCatalog,
    stream: &str,
    substream: &Option<String>,
) -> anyhow::Result<StreamKey> {
    Ok(catalog.resolve(stream)?.key(substream.as_deref()))
}

fn print_range(range: &mut dyn DataRange, max: usize, format: &str) -> anyhow::Result<()> {
    let first = range.index();
    let mut points = Vec::new();
    while points.len() < max {
        match range.next()? {
            Some(dp) => points.push(dp),
            None => break,
        }
    }
    range.close();

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&points)?);
        return Ok(());
    }

    if points.is_empty() {
        println!("No datapoints.");
        return Ok(());
    }
    for (i, dp) in points.iter().enumerate() {
        let sender = dp.sender.as_deref().unwrap_or("");
        println!(
            "{:>8}  {:<26} {} {}",
            first + i as u64,
            format_time(dp.timestamp),
            dp.data,
            sender
        );
    }
    Ok(())
}

fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// "now", RFC 3339 or Unix seconds
fn parse_time(s: &str) -> anyhow::Result<f64> {
    if s == "now" {
        return Ok(now_seconds());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_micros() as f64 / 1e6);
    }
    match s.parse::<f64>() {
        Ok(t) if t.is_finite() => Ok(t),
        _ => bail!("Invalid timestamp format: {}", s),
    }
}

fn format_time(t: f64) -> String {
    DateTime::<Utc>::from_timestamp_micros((t * 1e6).round() as i64)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| t.to_string())
}

