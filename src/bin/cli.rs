//! IgniteKV CLI
//!
//! Opens a data directory, runs one command against it, and closes it.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ignitekv::{Config, Engine, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// IgniteKV CLI
#[derive(Parser, Debug)]
#[command(name = "ignite-cli")]
#[command(about = "Inspect and modify an IgniteKV data directory")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./ignite_data")]
    data_dir: String,

    /// Segment rotation threshold in MB
    #[arg(short, long, default_value = "1024")]
    segment_mb: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Put {
        /// The key to set
        key: String,

        /// The value to set
        value: String,

        /// Expire the key after this many seconds
        #[arg(long)]
        ttl_secs: Option<u64>,
    },

    /// Delete a key
    #[command(visible_alias = "del")]
    Delete {
        /// The key to delete
        key: String,
    },

    /// List every key
    Keys,

    /// Merge sealed segments now
    Compact,

    /// Print engine statistics
    Stats,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ignitekv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // One-shot process: no background timer
    let config = Config::builder()
        .data_dir(&args.data_dir)
        .max_segment_size(args.segment_mb * 1024 * 1024)
        .compaction_interval(Duration::ZERO)
        .build();

    let engine = match Engine::open(config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Failed to open engine: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = execute(&engine, args.command);
    let closed = engine.close();

    let code = match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    };
    if let Err(e) = closed {
        eprintln!("error: failed to close engine: {}", e);
        return ExitCode::FAILURE;
    }
    code
}

fn execute(engine: &Engine, command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Get { key } => match engine.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => {
                println!("(nil)");
                return Ok(ExitCode::from(1));
            }
        },
        Commands::Put { key, value, ttl_secs } => {
            match ttl_secs {
                Some(secs) => engine.put_with_ttl(key.as_bytes(), value.as_bytes(), Duration::from_secs(secs))?,
                None => engine.put(key.as_bytes(), value.as_bytes())?,
            }
            engine.sync()?;
            println!("OK");
        }
        Commands::Delete { key } => {
            engine.delete(key.as_bytes())?;
            engine.sync()?;
            println!("OK");
        }
        Commands::Keys => {
            let mut keys = engine.keys();
            keys.sort();
            for key in keys {
                println!("{}", String::from_utf8_lossy(&key));
            }
        }
        Commands::Compact => {
            let report = engine.compact()?;
            if report.is_empty() {
                println!("nothing to compact");
            } else {
                println!(
                    "merged {:?} into {:?}: {} written, {} expired, {} bytes reclaimed in {:?}",
                    report.sources,
                    report.outputs,
                    report.keys_written,
                    report.keys_expired,
                    report.bytes_reclaimed,
                    report.duration
                );
            }
        }
        Commands::Stats => {
            let stats = engine.stats();
            println!("keys:              {}", stats.keys);
            println!("segments:          {}", stats.segment_count);
            println!("sealed segments:   {}", stats.sealed_segments);
            println!("active segment:    {} ({} bytes)", stats.active_segment_id, stats.active_segment_size);
            println!("total bytes:       {}", stats.total_bytes);
            println!("live bytes:        {}", stats.live_bytes);
            println!("retired segments:  {}", stats.retired_segments);
        }
    }
    Ok(ExitCode::SUCCESS)
}
