//! WiFi Device Manager - Main Entry Point

use std::{error::Error, pin::pin, sync::Arc};

use clap::Parser;
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wifi_device_manager::{
    ConnectTarget, SecurityType, WifiManager,
    backend::{DeviceBackend, MockDeviceBackend, WpaBackend},
    config::{CliArgs, Command, Settings},
};

// The device handle is bound to the thread that opens it, so everything runs
// on a single-threaded runtime.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wifi_device_manager=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = CliArgs::parse();
    let command = args.command.clone();
    let settings = Settings::from(args);
    info!(
        interface = %settings.interface,
        simulate = settings.simulate,
        "Starting WiFi device manager"
    );

    if settings.simulate {
        let backend = Arc::new(MockDeviceBackend::simulated());
        run(WifiManager::new(backend, settings), command).await
    } else {
        let backend = WpaBackend::new(settings.interface.clone(), &settings.ctrl_dir).await?;
        info!("wpa_supplicant backend initialized for interface: {}", settings.interface);
        run(WifiManager::new(Arc::new(backend), settings), command).await
    }
}

fn print_json(value: &impl Serialize) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct Status {
    interface: String,
    mac_address: String,
    #[serde(flatten)]
    state: wifi_device_manager::StateSnapshot,
}

async fn run<B: DeviceBackend>(
    manager: WifiManager<B>,
    command: Command,
) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Status => {
            let status = Status {
                interface: manager.interface_name().await?,
                mac_address: manager.mac_address().await?,
                state: manager.snapshot(),
            };
            print_json(&status)?;
        }
        Command::Activate => manager.activate().await?,
        Command::Deactivate => manager.deactivate().await?,
        Command::Scan => {
            manager.scan().await?;
            print_json(&manager.found_aps().await?)?;
        }
        Command::ScanAp { essid } => {
            manager.scan_specific_ap(&essid).await?;
            print_json(&manager.found_specific_aps().await?)?;
        }
        Command::BssidScan => {
            manager.bssid_scan().await?;
            print_json(&manager.found_bssids().await?)?;
        }
        Command::MultiScan { frequencies } => {
            manager.multi_scan(&frequencies).await?;
            print_json(&manager.found_aps().await?)?;
        }
        Command::Connect {
            essid,
            passphrase,
            hidden,
        } => {
            let mut target = match passphrase {
                Some(passphrase) => ConnectTarget::secured(essid, SecurityType::Wpa2Psk, passphrase),
                None => ConnectTarget::open(essid),
            };
            target.hidden = hidden;
            manager.connect(&target).await?;
            print_json(&manager.connected_ap().await?)?;
        }
        Command::Disconnect => manager.disconnect().await?,
        Command::Configs => print_json(&manager.configurations().await?)?,
        Command::Monitor => monitor(&manager).await?,
    }

    manager.shutdown();
    Ok(())
}

/// Print every event as a JSON line until SIGINT or SIGTERM
async fn monitor<B: DeviceBackend>(manager: &WifiManager<B>) -> Result<(), Box<dyn Error>> {
    manager.device_handle().await?;
    manager.on_event(|event| match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!("Failed to serialize event: {}", e),
    });

    let mut changes = pin!(manager.state_changes());
    let mut interrupt = pin!(tokio::signal::ctrl_c());
    let mut terminate = pin!(shutdown_signal());
    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("Received SIGINT (Ctrl+C), shutting down gracefully");
                break;
            }
            _ = &mut terminate => {
                info!("Received SIGTERM, shutting down gracefully");
                break;
            }
            Some(snapshot) = changes.next() => {
                debug!(?snapshot, "State changed");
            }
        }
    }

    manager.release_device_handle()?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await
}
