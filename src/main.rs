//! `lap-oxide` command-line front end
//!
//! ```bash
//! lap-oxide fetch cota 7 12
//! lap-oxide upload stint.csv.gz
//! lap-oxide downsample stint.csv --target 500 --channel throttle
//! lap-oxide cache stats
//! lap-oxide cache clear --track cota
//! ```
//!
//! Set `RUST_LOG=debug` for pool and worker logs.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use lap_oxide::constants;
use lap_oxide::data::{Channel, LapKey, LapMetadata, LapSource, LapTelemetry, SectorTiming};
use lap_oxide::perf::HttpFetcher;
use lap_oxide::{LapCache, LapLoader, PipelineConfig, PipelineError, Result, TaskCallbacks, WorkerPool};

#[derive(Parser)]
#[command(name = "lap-oxide")]
#[command(about = "Load, parse and downsample lap telemetry", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(short, long, default_value = constants::config::CONFIG_FILE)]
    config: PathBuf,

    /// Cache directory (overrides the config file)
    #[arg(long, env = "LAP_OXIDE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Telemetry base URL (overrides the config file)
    #[arg(long, env = "LAP_OXIDE_BASE_URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a lap (or serve it from the cache)
    Fetch {
        track: String,
        driver: u32,
        lap: u32,
        /// Write the points as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Parse an uploaded logger file
    Upload { path: PathBuf },
    /// Parse a file and downsample one channel
    Downsample {
        path: PathBuf,
        #[arg(long, default_value_t = constants::worker::DEFAULT_DOWNSAMPLE_TARGET)]
        target: usize,
        #[arg(long, default_value = "speed")]
        channel: String,
    },
    /// Inspect or clear the lap cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    Stats,
    Clear {
        /// Only laps of this track
        #[arg(long)]
        track: Option<String>,
    },
}

#[derive(Serialize)]
struct LapSummary<'a> {
    key: String,
    source: &'a LapSource,
    metadata: &'a LapMetadata,
    sectors: &'a [SectorTiming],
}

impl<'a> From<&'a LapTelemetry> for LapSummary<'a> {
    fn from(lap: &'a LapTelemetry) -> Self {
        Self {
            key: lap.key.to_string(),
            source: &lap.source,
            metadata: lap.metadata(),
            sectors: lap.sectors(),
        }
    }
}

#[derive(Serialize)]
struct DownsampleSummary {
    channel: Channel,
    input_points: usize,
    output_points: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", e.title(), e.user_message());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = PipelineConfig::load_or_default(&cli.config)?;
    if let Some(dir) = cli.cache_dir {
        config.cache.dir = Some(dir);
    }
    if let Some(url) = cli.base_url {
        config.source.base_url = url;
    }
    config.validate()?;

    match cli.command {
        Commands::Fetch {
            track,
            driver,
            lap,
            output,
        } => {
            let loader = build_loader(&config)?;
            let callbacks = TaskCallbacks::new().on_progress(|p| info!(progress = p, "loading"));
            let lap = loader.load(&LapKey::new(track, driver, lap), callbacks)?;
            if let Some(path) = output {
                std::fs::write(&path, serde_json::to_vec(lap.points())?)?;
                info!(path = %path.display(), "points written");
            }
            print_json(&LapSummary::from(&lap))
        }
        Commands::Upload { path } => {
            let loader = build_loader(&config)?;
            let lap = upload(&loader, &path)?;
            print_json(&LapSummary::from(&lap))
        }
        Commands::Downsample {
            path,
            target,
            channel,
        } => {
            let channel = Channel::from_name(&channel)
                .ok_or_else(|| PipelineError::Config(format!("unknown channel '{}'", channel)))?;
            let loader = build_loader(&config)?;
            let lap = upload(&loader, &path)?;
            let input_points = lap.points().len();
            let reduced = loader.downsample(lap.into_points(), target, channel)?;
            print_json(&DownsampleSummary {
                channel,
                input_points,
                output_points: reduced.len(),
            })
        }
        Commands::Cache { command } => {
            let cache = LapCache::from_config(&config.cache);
            match command {
                CacheCommands::Stats => print_json(&cache.stats()),
                CacheCommands::Clear { track: Some(track) } => {
                    let removed = cache.clear_track(&track);
                    info!(%track, removed, "cleared track");
                    print_json(&cache.stats())
                }
                CacheCommands::Clear { track: None } => {
                    cache.clear_all();
                    print_json(&cache.stats())
                }
            }
        }
    }
}

fn build_loader(config: &PipelineConfig) -> Result<LapLoader> {
    let fetcher = HttpFetcher::new(&config.fetch)?;
    let pool = WorkerPool::from_config(config, Arc::new(fetcher))?;
    let cache = LapCache::from_config(&config.cache);
    Ok(LapLoader::new(
        Arc::new(pool),
        Arc::new(cache),
        config.source.base_url.clone(),
    ))
}

fn upload(loader: &LapLoader, path: &Path) -> Result<LapTelemetry> {
    let data = std::fs::read(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    loader.load_upload(data, &filename, TaskCallbacks::new())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
