use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use pcm_proxy::config::Args;
use pcm_proxy::decoder::DecoderSupervisor;
use pcm_proxy::server::{start_proxy_server, ProxyState};
use pcm_proxy::session::AudioStreamSession;

fn configure_logging() {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_line_number(true)
        .with_target(false)
        .with_file(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() {
    configure_logging();
    let args = Args::parse();

    let decoder_config = args.decoder_config();
    if !decoder_config.binary.is_file() {
        error!(
            "decoder not found at {}, local playback is unavailable",
            decoder_config.binary.display()
        );
        std::process::exit(1);
    }
    if decoder_config.credentials.is_none() {
        warn!("no decoder credentials configured, tracks will be requested anonymously");
    }
    if args.initial_volume.is_some() && args.volume_rpc_url.is_none() {
        warn!("--initial-volume is set but --volume-rpc-url is not, volume will not be changed");
    }

    let session = AudioStreamSession::with_track_uri_prefix(
        DecoderSupervisor::new(decoder_config),
        args.hooks(),
        args.track_uri_prefix.clone(),
    );
    let state = Arc::new(ProxyState {
        session: session.clone(),
        inter_track_delay: args.inter_track_delay(),
    });

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {e}");
        }
        info!("shutdown requested");
    };

    let (handle, server) = start_proxy_server(state, &args.bind, args.port, shutdown)
        .await
        .unwrap_or_else(|e| {
            error!("failed to bind to {}:{}: {e}", args.bind, args.port);
            std::process::exit(1);
        });
    info!("track URLs look like {}", handle.track_url("<track_id>", 0.0));

    let result = server.await;
    session.stop().await;

    match result {
        Ok(Ok(())) => info!("pcm-proxy stopped"),
        Ok(Err(e)) => {
            error!("server error: {e}");
            std::process::exit(1);
        }
        Err(e) => {
            error!("server task failed: {e}");
            std::process::exit(1);
        }
    }
}
