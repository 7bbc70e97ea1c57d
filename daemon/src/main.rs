mod buffer;
mod cli;
mod compositor;
mod config;
mod decoder;
mod image_source;
mod macros;
mod output;
mod reconciler;
mod wayland;

use anyhow::Result;
use common::ConfigSet;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[tokio::main]
async fn main() -> ExitCode {
    let invocation = match cli::parse() {
        Ok(invocation) => invocation,
        Err(e) => {
            let failed = e.use_stderr();
            let _ = e.print();
            return if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    // Read the file before logging starts so its log level applies
    let loaded = if invocation.cli.no_config {
        Ok(config::Config::default())
    } else {
        config::Config::load(invocation.cli.config.as_deref())
    };
    let log_level = match &loaded {
        Ok(cfg) => cfg.general.log_level.clone(),
        Err(_) => "info".to_string(),
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    log::info!("Starting backdrop v{}", env!("CARGO_PKG_VERSION"));

    let file_config = loaded.unwrap_or_else(|e| {
        log::warn!("Failed to load config: {:#}. Using command line only.", e);
        config::Config::default()
    });

    // Command line entries come last so they override the file
    let mut entries = file_config.entries();
    entries.extend(invocation.entries());

    let configs = match build_configs(entries) {
        Ok(configs) => configs,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("{}", cli::usage());
            return ExitCode::FAILURE;
        }
    };

    for config in configs.iter() {
        log::info!(
            "  {} -> {} ({})",
            config.selector,
            config.image.as_deref().unwrap_or("no image"),
            config.mode
        );
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_handler(shutdown.clone());

    match wayland::run(configs, shutdown).await {
        Ok(()) => {
            log::info!("backdrop shutting down");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn build_configs(entries: Vec<common::ConfigEntry>) -> Result<ConfigSet> {
    let mut configs = ConfigSet::from_entries(entries)?;
    configs.resolve_images(image_source::resolve_image_path)?;
    log::info!("Loaded {} output configuration(s)", configs.len());
    Ok(configs)
}

fn spawn_signal_handler(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    log::error!("Failed to set up signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM, shutting down...");
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT, shutting down...");
            }
        }

        shutdown.store(true, Ordering::Relaxed);
    });
}
