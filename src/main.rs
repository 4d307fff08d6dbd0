use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rover_relay::config::Settings;
use rover_relay::discovery::DiscoveryClient;
use rover_relay::model::media::TrackBinding;
use rover_relay::relay::{EventSinks, RelayService, Upstream};
use rover_relay::select_host_address;
use rover_relay::server;
use rover_relay::transport::RtcNegotiator;
use rover_relay::upstream::{InputForwarder, RtpIngest};

fn init_log() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let config = args.get(2).map(String::as_str);

    let result = match args.get(1).map(String::as_str) {
        Some("serve") => serve(config),
        Some("hosts") => hosts(config),
        _ => {
            print_usage();
            return;
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("Rover Relay");
    println!("Usage:");
    println!("  rover-relay serve [config.toml]  - Relay the application stream to viewers");
    println!("  rover-relay hosts [config.toml]  - List application hosts known to the directory");
}

fn load_settings(path: Option<&str>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load(path).with_context(|| format!("loading {path}")),
        None => Ok(Settings::default()),
    }
}

#[tokio::main]
async fn serve(config: Option<&str>) -> Result<()> {
    init_log();
    let settings = load_settings(config)?;

    let host_ip = settings
        .webrtc
        .host_ip
        .or_else(select_host_address)
        .context("no usable network interface for WebRTC")?;
    info!("Viewer transports bind on {host_ip}");

    let negotiator = Arc::new(RtcNegotiator::new(host_ip, settings.webrtc.public_ip));
    let discovery = DiscoveryClient::new(&settings.discovery_host, settings.discovery_timeout())?;

    let (media_tx, media_rx) = mpsc::channel(64);
    let ingest = RtpIngest::bind(settings.upstream.media_addr)
        .await
        .context("binding upstream media socket")?;
    tokio::spawn(async move {
        if let Err(e) = ingest.run(media_tx).await {
            error!("Upstream ingest failed: {e}");
        }
    });

    let (input_tx, input_rx) = mpsc::channel(256);
    let forwarder = InputForwarder::connect(settings.upstream.input_addr).await?;
    tokio::spawn(forwarder.run(input_rx));

    let (chat_tx, mut chat_rx) = mpsc::channel(64);

    let relay = RelayService::start(
        &settings,
        negotiator,
        Upstream {
            media: media_rx,
            binding: TrackBinding::new(settings.stream_id()),
        },
        EventSinks {
            input: input_tx,
            chat: chat_tx,
        },
        discovery,
    );

    // Chat goes back out to every viewer, sender included.
    let chat_relay = relay.clone();
    tokio::spawn(async move {
        while let Some(event) = chat_rx.recv().await {
            chat_relay.send_all(&event.packet);
        }
    });

    match settings.public_addr.clone() {
        Some(addr) => {
            let relay = relay.clone();
            tokio::spawn(async move {
                match relay.register(&addr).await {
                    Ok(()) => info!("Registered {addr} with the directory"),
                    Err(e) => warn!("Not discoverable, registration failed: {e}"),
                }
            });
        }
        None => info!("No public_addr configured, skipping directory registration"),
    }

    tokio::select! {
        served = server::serve(settings.listen_addr, relay.clone()) => served?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    relay.shutdown();
    Ok(())
}

#[tokio::main]
async fn hosts(config: Option<&str>) -> Result<()> {
    init_log();
    let settings = load_settings(config)?;

    let discovery = DiscoveryClient::new(&settings.discovery_host, settings.discovery_timeout())?;
    let hosts = discovery
        .list_hosts()
        .await
        .with_context(|| format!("querying {}", discovery.host()))?;

    if hosts.is_empty() {
        println!("No application hosts registered");
    }
    for host in hosts {
        println!("{}\t{}", host.app_name, host.addr);
    }

    Ok(())
}
