use std::sync::Arc;

use frame_bus::{encoder::FfmpegLauncher, relay::Relay, sink::SinkOpener};
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod handler;

fn init_logging() {
    // RUST_LOG overrides these defaults
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("frame_bus", log::LevelFilter::Debug)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::init().unwrap_or_else(|e| {
        eprintln!("Error loading config: {:#}", e);
        std::process::exit(1);
    });
    frame_bus::init();

    let launcher = Arc::new(FfmpegLauncher::new(
        config.encoder_config(),
        config.queue_depth,
    ));
    let relay = Arc::new(
        Relay::new(
            config.geometry(),
            Arc::clone(&launcher) as Arc<dyn SinkOpener>,
        )
        .with_drain_timeout(config.drain_timeout()),
    );

    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    let server = api::start_api_server(cancel_clone, Arc::clone(&relay));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupt received, shutting down");
                cancel.cancel();
            },
        }
    }

    // a drain in progress must finish writing before the encoder can exit
    let timeout = config.drain_timeout();
    if !relay.shutdown(timeout).await {
        log::warn!("active session did not drain within {:?}", timeout);
    }
    if !launcher.wait(timeout).await {
        log::warn!("encoder did not exit within {:?}", timeout);
    }
    let _ = server.await;

    std::process::exit(0);
}
