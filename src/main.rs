// MIT License - Copyright (c) 2026 Peter Wright
// NX-584 to Home Assistant MQTT bridge daemon

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rolling_file::{BasicRollingFileAppender, RollingConditionBasic};
use tokio::sync::watch;
use tokio_serial::SerialPortBuilderExt;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use caddx2mqtt::config::Config;
use caddx2mqtt::controller::{Controller, ControllerOptions};
use caddx2mqtt::frame::PanelLink;
use caddx2mqtt::mqtt::{self, HassBridge, Topics};
use caddx2mqtt::panel::PanelModel;

const LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const LOG_KEEP_FILES: usize = 5;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let _log_guard = match init_logging(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate().context("Invalid configuration")?;
    let panel_uid = config.panel_uid();
    info!("Starting caddx2mqtt for panel '{panel_uid}'");

    let stream = tokio_serial::new(&config.serial, config.baud)
        .timeout(Duration::from_millis(100))
        .open_native_async()
        .with_context(|| format!("Failed to open serial device {}", config.serial))?;
    info!("Opened serial connection at '{}'", config.serial);

    let topics = Topics::new(&config.topic_root, &panel_uid);
    let (publisher, requests, mqtt_task) = mqtt::connect(&config, topics.clone());
    let bridge = HassBridge::new(publisher.clone(), topics, config.panel_name.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx);

    let mut controller = Controller::new(
        PanelLink::new(stream),
        PanelModel::new(panel_uid),
        bridge,
        requests,
        ControllerOptions::from_config(&config)?,
        shutdown_rx,
    );
    let result = controller.run().await;

    // The availability topic goes offline on every exit path; the LWT
    // only covers losing the broker connection outright.
    controller.publish_offline().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    if let Err(e) = publisher.disconnect().await {
        warn!("Failed to disconnect MQTT client: {e}");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    mqtt_task.abort();

    result.context("Bridge terminated")
}

fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {e}");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received");
            }
        }
        let _ = shutdown_tx.send(true);
    });
}

fn init_logging(config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(config.log_level.to_lowercase())
        .with_context(|| format!("Invalid LOG_LEVEL '{}'", config.log_level))?;

    match &config.log_file {
        Some(path) => {
            let appender = BasicRollingFileAppender::new(
                path,
                RollingConditionBasic::new().max_size(LOG_ROTATE_BYTES),
                LOG_KEEP_FILES,
            )
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
            Ok(None)
        }
    }
}
