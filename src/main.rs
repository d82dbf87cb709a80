use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use stream_sentry::{
    config::{CONFIG_ENV_VAR, Config},
    errors::AppError,
    playlist::PlaylistLoader,
    services::{FfprobeProber, Mailer},
    supervisor::{RunOutcome, Supervisor},
};

/// Exit code for a SIGINT shutdown, matching shell convention.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "stream-sentry")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Unattended 24/7 playout supervisor for ffmpeg-based streaming")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path; falls back to $STREAM_SENTRY_CONFIG,
    /// then config.toml
    config: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_file = cli
        .config
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok())
        .unwrap_or_else(|| "config.toml".to_string());

    let config = match Config::load_from_file(&config_file) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("stream_sentry={}", config.misc.verbosity.as_filter()).into()
    });

    // Errors additionally land in the configured error log file.
    let error_log_layer = config.paths.error_log.as_ref().and_then(|path| {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .with_filter(tracing_subscriber::filter::LevelFilter::ERROR),
            ),
            Err(e) => {
                eprintln!("Could not open error log {}: {e}", path.display());
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(error_log_layer)
        .init();

    info!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {config_file}");

    match run(config).await {
        Ok(RunOutcome::Clean) => ExitCode::SUCCESS,
        Ok(RunOutcome::Interrupted) => ExitCode::from(EXIT_INTERRUPTED),
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Arc<Config>) -> Result<RunOutcome, AppError> {
    let loader = PlaylistLoader::new(&config);
    let playlist = loader.load(&config.paths.playlist)?;
    info!(
        "Loaded playlist {} ({} entries)",
        config.paths.playlist.display(),
        playlist.len()
    );

    let prober = Arc::new(FfprobeProber::new(config.paths.probe_binary.clone()));
    let (available, version) = prober.check_availability().await;
    if available {
        info!("ffprobe: available, version={version:?}");
    } else if config.paths.schedule_file.is_some() {
        return Err(AppError::configuration(format!(
            "probe binary '{}' is not runnable but a schedule file is configured",
            config.paths.probe_binary
        )));
    }

    let mailer = Mailer::new(&config.mail, config.upcoming_length_secs());

    let mut supervisor = Supervisor::new(config, playlist, prober, mailer)?;
    supervisor.run().await
}
