//! PicoNet CLI: chat, listen and send over a LAN mesh.

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use piconet_service::{
    handler, load_config, PicoNetService, ServiceConfig, ServiceError, ServiceEvent,
    ServiceResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Event name used by the chat command.
const MESSAGE_EVENT: &str = "MESSAGE_EVENT";

/// Time given to queued sends before `send` stops the service.
const FLUSH_DELAY: Duration = Duration::from_millis(300);

/// Filter in force until the configuration has been read.
const BOOTSTRAP_LEVEL: &str = "info";

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Trace to stderr before anything else runs.
///
/// Returns a handle for swapping in the configured level, or `None` when
/// `RUST_LOG` decides the filter.
fn init_tracing_stderr() -> Option<FilterHandle> {
    let from_env = EnvFilter::try_from_default_env().ok();
    let env_set = from_env.is_some();
    let (filter, handle) =
        reload::Layer::new(from_env.unwrap_or_else(|| EnvFilter::new(BOOTSTRAP_LEVEL)));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
    (!env_set).then_some(handle)
}

fn build_config(cli: &Cli) -> ServiceConfig {
    let mut config = load_config(cli.config.as_deref());
    if let Some(app_id) = &cli.app_id {
        config.application_id = app_id.clone();
    }
    if let Some(port) = cli.port {
        config.network_port = port;
    }
    if cli.ipv6 {
        config.ipv6_enabled = true;
    }
    config
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let filter = init_tracing_stderr();
    let config = build_config(&cli);
    if let Some(handle) = filter {
        if let Err(e) = handle.reload(EnvFilter::new(&config.log_level)) {
            warn!(error = %e, level = %config.log_level, "Failed to apply configured log level");
        }
    }

    if let Err(e) = run(cli.command, config).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: ServiceConfig) -> ServiceResult<()> {
    let service = PicoNetService::new(config)?;
    match command {
        Commands::Chat => cmd_chat(service).await,
        Commands::Listen { event } => cmd_listen(service, &event).await,
        Commands::Send {
            event,
            payload,
            wait_secs,
        } => cmd_send(service, &event, &payload, Duration::from_secs(wait_secs)).await,
    }
}

fn print_peer_changes(service: &PicoNetService) {
    service.observe(Arc::new(|event: &ServiceEvent| match event {
        ServiceEvent::PeerConnected(peer) => println!("* {} joined", peer.address()),
        ServiceEvent::PeerDisconnected(peer) => println!("* {} left", peer.address()),
        ServiceEvent::ConnectedPeersChanged(count) => println!("* peers: {count}"),
        ServiceEvent::Started | ServiceEvent::Stopped => {}
    }));
}

async fn cmd_chat(service: PicoNetService) -> ServiceResult<()> {
    print_peer_changes(&service);
    service.subscribe(
        MESSAGE_EVENT,
        handler(|message| println!("< {message}")),
    );
    service.start_service().await?;
    println!(
        "Chatting as `{}` on port {}. Type a line and press enter; Ctrl-C quits.",
        service.config().application_id,
        service.config().network_port
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(text)) => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    let sent = service.send_to_all(MESSAGE_EVENT, &text)?;
                    if sent == 0 {
                        println!("  (no peers yet)");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    service.shutdown().await;
    Ok(())
}

async fn cmd_listen(service: PicoNetService, event: &str) -> ServiceResult<()> {
    print_peer_changes(&service);
    let name = event.to_string();
    service.subscribe(event, handler(move |payload| println!("{name}: {payload}")));
    service.start_service().await?;
    println!("Listening for `{event}`. Ctrl-C quits.");

    let _ = tokio::signal::ctrl_c().await;
    service.shutdown().await;
    Ok(())
}

async fn cmd_send(
    service: PicoNetService,
    event: &str,
    payload: &str,
    wait: Duration,
) -> ServiceResult<()> {
    service.start_service().await?;

    let deadline = tokio::time::Instant::now() + wait;
    while service.connected_peer_count() == 0 {
        if tokio::time::Instant::now() >= deadline {
            service.shutdown().await;
            return Err(ServiceError::PeerNotConnected(format!(
                "no peer found within {}s",
                wait.as_secs()
            )));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let sent = service.send_to_all(event, payload)?;
    tokio::time::sleep(FLUSH_DELAY).await;
    println!("Sent `{event}` to {sent} peer(s)");
    service.shutdown().await;
    Ok(())
}
