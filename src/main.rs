use anyhow::{anyhow, Context, Result};
use clap::Parser;
use compmon::metrics::generic::GenericSource;
use compmon::metrics::monitor::{FeedProvider, FileFeed, HardwareMonitor, JsonSensorDump, MonitorSource};
use compmon::metrics::{GpuSelection, MetricSource, SensorAggregator};
use compmon::transport::DEFAULT_PORT;
use compmon::{Collector, CollectorOptions, Destination, SavedTarget, Settings, StatusLine, StatusLog};
use env_logger::Env;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Sample host telemetry and send it to a receiver over UDP
#[derive(Parser, Debug)]
#[command(name = "compmon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Receiver IPv4 address (default: saved target, else broadcast)
    #[arg(short, long)]
    target: Option<String>,

    /// Receiver UDP port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds between cycles
    #[arg(short, long, default_value = "5")]
    interval: u64,

    /// Receive attempts after each send
    #[arg(long, default_value = "2")]
    max_retries: u32,

    /// Seconds to wait for each reply
    #[arg(long, default_value = "2")]
    receive_timeout: u64,

    /// Append status lines to this file
    #[arg(short = 'o', long)]
    log_file: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "compmon=trace" (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// File the last used target is saved to
    #[arg(long, default_value = "compmon.json")]
    settings: PathBuf,

    /// Diagnostics feed dump to read sensors from
    #[arg(long)]
    feed_file: Option<PathBuf>,

    /// JSON hardware sensor dump to fall back on
    #[arg(long)]
    hardware_file: Option<PathBuf>,

    /// Run one cycle and exit
    #[arg(long)]
    once: bool,
}

fn init_logging(filter: Option<&str>) {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    if let Some(filter) = filter {
        builder.parse_filters(filter);
    }
    builder.format_timestamp_secs();
    let _ = builder.try_init();
}

/// Hardware monitor first when configured, the generic backend always.
fn build_aggregator(
    target: Ipv4Addr,
    feed_file: Option<PathBuf>,
    hardware_file: Option<PathBuf>,
) -> SensorAggregator {
    let mut sources: Vec<Box<dyn MetricSource>> = Vec::new();
    if feed_file.is_some() || hardware_file.is_some() {
        let feed = feed_file.map(|path| Box::new(FileFeed::new(path)) as Box<dyn FeedProvider>);
        let hardware =
            hardware_file.map(|path| Box::new(JsonSensorDump::new(path)) as Box<dyn HardwareMonitor>);
        sources.push(Box::new(MonitorSource::new(feed, hardware)));
    }
    sources.push(Box::new(GenericSource::new()));
    SensorAggregator::new(sources, GpuSelection::detect(), target)
}

fn record(line: &StatusLine, file: Option<&mut StatusLog>) {
    println!("{}", line);
    if let Some(file) = file {
        if let Err(e) = file.log(line) {
            log::warn!("Status log error: {:#}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    let target = match args.target.clone() {
        Some(target) => target,
        None => SavedTarget::load(&args.settings)
            .unwrap_or_else(|e| {
                log::warn!("Could not read {}: {}", args.settings.display(), e);
                None
            })
            .map(|dest| dest.to_string())
            .unwrap_or_else(|| Ipv4Addr::BROADCAST.to_string()),
    };
    let destination = Destination::parse(&target)?;
    let settings = Settings::new(
        destination,
        args.port,
        args.interval,
        args.max_retries,
        args.receive_timeout,
    )?;

    let feed_file = args.feed_file.clone();
    let hardware_file = args.hardware_file.clone();
    let collector = Collector::new(CollectorOptions::from(&settings), move |target| {
        build_aggregator(target, feed_file, hardware_file)
    });

    let mut status_file = match &args.log_file {
        Some(path) => Some(StatusLog::new(path)?),
        None => None,
    };

    if args.once {
        let line = tokio::task::spawn_blocking(move || collector.run_once(&target)).await??;
        record(&line, status_file.as_mut());
        return Ok(());
    }

    let mut handle = collector.start(&target)?;
    if let Err(e) = SavedTarget::save(&args.settings, &destination) {
        log::warn!("Could not save target to {}: {}", args.settings.display(), e);
    }

    let statuses = handle
        .take_statuses()
        .context("Status channel already taken")?;
    let printer = tokio::task::spawn_blocking(move || {
        for line in statuses {
            record(&line, status_file.as_mut());
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Stop requested; waiting for the current cycle (up to {:?})", settings.max_reply_wait());
    handle.stop();

    tokio::task::spawn_blocking(move || handle.join())
        .await?
        .map_err(|_| anyhow!("Collector thread panicked"))?;
    printer.await?;

    if let Some(ref path) = args.log_file {
        log::info!("Status log written to: {}", path.display());
    }
    Ok(())
}
