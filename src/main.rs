use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peerlens::detect::NullDetector;
use peerlens::events::EventBus;
use peerlens::video::format::Resolution;
use peerlens::video::pipeline::{FramePipeline, PipelineConfig};
use peerlens::video::source::SyntheticSource;

/// Log level for the demo
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Pipeline smoke run: synthetic camera through the annotation pipeline
#[derive(Parser, Debug)]
#[command(name = "peerlens")]
#[command(version, about = "Annotated-video pipeline demo", long_about = None)]
struct CliArgs {
    /// Source width in pixels
    #[arg(long, default_value_t = 300)]
    width: u32,

    /// Source height in pixels
    #[arg(long, default_value_t = 300)]
    height: u32,

    /// Source frame rate
    #[arg(long, default_value_t = 30)]
    source_fps: u32,

    /// How long to run, in seconds
    #[arg(short = 't', long, default_value_t = 5)]
    duration: u64,

    /// Log level
    #[arg(short = 'l', long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level);

    tracing::info!("Starting PeerLens demo v{}", env!("CARGO_PKG_VERSION"));

    let resolution = Resolution::new(args.width, args.height);
    let source = Box::new(SyntheticSource::new(resolution, args.source_fps));
    let cancel = CancellationToken::new();

    let handle = FramePipeline::start(
        source,
        Arc::new(NullDetector),
        PipelineConfig::default(),
        cancel.clone(),
        Arc::new(EventBus::new()),
    )
    .await?;

    let mut frames = handle.subscribe();
    let counter_cancel = cancel.clone();
    let counter = tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        let mut received = 0u64;
        loop {
            tokio::select! {
                _ = counter_cancel.cancelled() => break,
                result = frames.recv() => match result {
                    Ok(_) => received += 1,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
            }
        }
        received
    });

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration)) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    cancel.cancel();
    let received = counter.await?;
    let stats = handle.stats();
    tracing::info!(
        "Pipeline run: {} frames drawn, {} captures emitted, {} received, {} detect runs ({} failed)",
        stats.frames_drawn,
        stats.captures,
        received,
        stats.detect_runs,
        stats.detect_failures,
    );

    Ok(())
}

fn init_logging(level: LogLevel) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.directive()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
