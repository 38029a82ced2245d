use std::{path::Path, process::Stdio, sync::Arc};

use relay_bus::Pipeline;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod handler;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("relay_bus", log::LevelFilter::Debug)
        .filter_module("lite_relay", log::LevelFilter::Debug)
        .filter_module("webrtc", log::LevelFilter::Warn)
        .filter_module("webrtc_ice", log::LevelFilter::Warn)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();
}

/// Checks that the JPEG encoder binary can run at all.
async fn preflight_encoder(bin: &Path) -> bool {
    match Command::new(bin)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) if status.success() => {
            log::info!("encoder {} is available", bin.display());
            true
        }
        Ok(status) => {
            log::error!(
                "encoder {} -version exited with {}, JPEG snapshots disabled",
                bin.display(),
                status
            );
            false
        }
        Err(e) => {
            log::error!(
                "encoder {} not found ({}), JPEG snapshots disabled",
                bin.display(),
                e
            );
            false
        }
    }
}

/// Starts on the first discovered source, if any.
async fn auto_start(pipeline: &Pipeline) {
    let sources = match pipeline.list_sources().await {
        Ok(sources) => sources,
        Err(e) => {
            log::warn!("source discovery failed: {:#}", e);
            return;
        }
    };
    let Some(first) = sources.into_iter().next() else {
        log::info!("no sources found, waiting for a start command");
        return;
    };
    log::info!("auto-starting on source {}", first.name);
    if let Err(e) = pipeline.start(Some(first.name)).await {
        log::error!("auto-start failed: {}", e);
    }
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::config();

    let with_encoder = preflight_encoder(config.ffmpeg_bin()).await;
    let pipeline = Pipeline::new(config.pipeline_config(with_encoder)).unwrap_or_else(|e| {
        eprintln!("Error creating pipeline: {:#}", e);
        std::process::exit(1);
    });
    let pipeline = Arc::new(pipeline);

    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    api::start_api_server(cancel_clone, Arc::clone(&pipeline), config.port());

    auto_start(&pipeline).await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    pipeline.shutdown().await;
    std::process::exit(0);
}
