use anyhow::{Context, Result};
use signal_hook::consts::SIGHUP;
use signal_hook_tokio::Signals;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{error, info};

use hr_border_routing::config::config_path;
use hr_border_routing::runtime;
use hr_border_routing::{BorderRoutingConfig, Command, PrefixWatch};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hr_netcore=info,hr_border_routing=info".parse().unwrap()),
        )
        .init();

    info!("hr-netcore starting...");

    let path = config_path();
    let config = BorderRoutingConfig::load_or_default(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    info!(
        "Config loaded: interface {}, border routing {}, DHCPv6-PD {}, NAT64 {}",
        config.infra_interface,
        if config.enabled { "enabled" } else { "disabled" },
        if config.dhcp6_pd_enabled { "enabled" } else { "disabled" },
        if config.nat64_enabled { "enabled" } else { "disabled" },
    );

    let handle = runtime::spawn(config)?;

    // Spawn SIGHUP handler for hot-reload
    let commands = handle.commands.clone();
    tokio::spawn(async move {
        if let Err(e) = handle_sighup(commands).await {
            error!("SIGHUP handler error: {}", e);
        }
    });

    tokio::spawn(log_delegated_prefix(handle.prefix.clone()));

    info!("hr-netcore started successfully");

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Shutting down...");
            if handle.commands.send(Command::Shutdown).await.is_err() {
                error!("Border routing task already stopped");
            }
        }
        _ = handle.commands.closed() => {}
    }

    match handle.task.await {
        Ok(Ok(())) => info!("Border routing stopped"),
        Ok(Err(e)) => error!("Border routing failed: {:#}", e),
        Err(e) => error!("Border routing task panicked: {}", e),
    }

    Ok(())
}

async fn handle_sighup(commands: mpsc::Sender<Command>) -> Result<()> {
    let mut signals = Signals::new([SIGHUP])?;

    while let Some(signal) = signals.next().await {
        if signal == SIGHUP {
            info!("Received SIGHUP, reloading config...");

            let path = config_path();
            match BorderRoutingConfig::load_from_file(&path) {
                Ok(new_config) => {
                    if commands.send(Command::Reload(new_config)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to reload config: {:#}", e);
                }
            }
        }
    }

    Ok(())
}

async fn log_delegated_prefix(mut prefix: PrefixWatch) {
    while prefix.changed().await.is_ok() {
        match *prefix.borrow_and_update() {
            Some(delegated) => info!(
                "Delegated prefix {} (valid {}s, preferred {}s)",
                delegated.prefix, delegated.valid_lifetime, delegated.preferred_lifetime
            ),
            None => info!("Delegated prefix withdrawn"),
        }
    }
}
