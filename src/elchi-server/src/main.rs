// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

mod config;
mod engine;
mod listener;
mod session_log;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use elchi_app::{init_logging, ConfigFile};
use elchi_backend::{register_builtin_backends_on, RegistrationContext};
use elchi_core::{DeviceKind, DynResult, EngineCommand, EngineEvent};

use config::{DeviceConfig, ServerConfig};
use engine::EngineConfig;

const PKG_DESCRIPTION: &str = concat!(env!("CARGO_PKG_NAME"), " - lab heater control daemon");
const ENGINE_CHANNEL_BUFFER: usize = 32;
const EVENT_CHANNEL_BUFFER: usize = 256;

#[derive(Debug, Parser)]
#[command(
    author = env!("CARGO_PKG_AUTHORS"),
    version = env!("CARGO_PKG_VERSION"),
    about = PKG_DESCRIPTION,
)]
struct Cli {
    /// Path to configuration file
    #[arg(long = "config", short = 'C', value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print example configuration and exit
    #[arg(long = "print-config")]
    print_config: bool,
    /// Controller model to connect on startup (e.g. "Resistive Heater Tenma")
    #[arg(short = 'c', long = "controller")]
    controller: Option<String>,
    /// Serial port of the controller
    #[arg(long = "controller-port", value_name = "PORT")]
    controller_port: Option<String>,
    /// Sensor model to connect on startup (e.g. "Thermolino")
    #[arg(short = 's', long = "sensor")]
    sensor: Option<String>,
    /// Serial port of the sensor
    #[arg(long = "sensor-port", value_name = "PORT")]
    sensor_port: Option<String>,
    /// IP address for the JSON TCP listener
    #[arg(short = 'l', long = "listen")]
    listen: Option<IpAddr>,
    /// Port for the JSON TCP listener
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,
}

/// Merge a device section with its CLI overrides into a connect command.
fn startup_connect(
    kind: DeviceKind,
    cfg: &DeviceConfig,
    model: Option<&String>,
    port: Option<&String>,
    registry: &RegistrationContext,
) -> DynResult<Option<EngineCommand>> {
    let Some(model) = model.or(cfg.model.as_ref()) else {
        return Ok(None);
    };
    if !registry.is_registered(kind, model) {
        return Err(format!(
            "Unknown {} model: {} (available: {})",
            kind,
            model,
            registry.registered(kind, None).join(", ")
        )
        .into());
    }
    Ok(Some(EngineCommand::Connect {
        kind,
        model: model.clone(),
        port: port.or(cfg.port.as_ref()).cloned(),
        baud: cfg.baud,
    }))
}

#[tokio::main]
async fn main() -> DynResult<()> {
    let cli = Cli::parse();

    if cli.print_config {
        println!("{}", ServerConfig::example_combined_toml());
        return Ok(());
    }

    let (cfg, config_path) = if let Some(ref path) = cli.config {
        let cfg = ServerConfig::load_from_file(path)?;
        (cfg, Some(path.clone()))
    } else {
        ServerConfig::load_from_default_paths()?
    };

    cfg.validate()
        .map_err(|e| format!("Invalid server configuration: {}", e))?;

    init_logging(cfg.general.log_level.as_deref());

    if let Some(ref path) = config_path {
        info!("Loaded configuration from {}", path.display());
    }

    let mut registry = RegistrationContext::new();
    register_builtin_backends_on(&mut registry, cfg.heater);

    let startup: Vec<EngineCommand> = [
        startup_connect(
            DeviceKind::Controller,
            &cfg.controller,
            cli.controller.as_ref(),
            cli.controller_port.as_ref(),
            &registry,
        )?,
        startup_connect(
            DeviceKind::Sensor,
            &cfg.sensor,
            cli.sensor.as_ref(),
            cli.sensor_port.as_ref(),
            &registry,
        )?,
    ]
    .into_iter()
    .flatten()
    .collect();

    info!(
        "Starting elchi-server ({} startup device(s), units {})",
        startup.len(),
        cfg.general.units.unit()
    );

    let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(ENGINE_CHANNEL_BUFFER);
    let (event_tx, _) = broadcast::channel::<EngineEvent>(EVENT_CHANNEL_BUFFER);
    let mut task_handles: Vec<JoinHandle<()>> = Vec::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine_config = EngineConfig {
        registry: Arc::new(registry),
        behavior: cfg.behavior.clone(),
        units: cfg.general.units,
        log: cfg.log.clone(),
        startup_program: cfg
            .program
            .autostart
            .then(|| cfg.program.segments.clone()),
    };
    task_handles.push(engine::spawn_engine(
        engine_config,
        cmd_rx,
        event_tx.clone(),
        shutdown_rx.clone(),
    ));

    if cfg.listen.enabled {
        let listen_ip = cli.listen.unwrap_or(cfg.listen.listen);
        let listen_port = cli.port.unwrap_or(cfg.listen.port);
        let listen_addr = SocketAddr::from((listen_ip, listen_port));
        let listener_tx = cmd_tx.clone();
        let listener_events = event_tx.clone();
        let listener_shutdown_rx = shutdown_rx.clone();
        task_handles.push(tokio::spawn(async move {
            if let Err(e) = listener::run_listener(
                listen_addr,
                listener_tx,
                listener_events,
                listener_shutdown_rx,
            )
            .await
            {
                error!("Listener error: {:?}", e);
            }
        }));
    }

    for cmd in startup {
        cmd_tx.send(cmd).await?;
    }

    signal::ctrl_c().await?;
    info!("Ctrl+C received, shutting down");
    let _ = shutdown_tx.send(true);
    drop(cmd_tx);
    tokio::time::sleep(Duration::from_millis(400)).await;

    for handle in &task_handles {
        if !handle.is_finished() {
            handle.abort();
        }
    }
    for handle in task_handles {
        let _ = handle.await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use elchi_backend::HeaterSettings;

    fn registry() -> RegistrationContext {
        let mut ctx = RegistrationContext::new();
        register_builtin_backends_on(&mut ctx, HeaterSettings::default());
        ctx
    }

    #[test]
    fn test_cli_overrides_config_device() {
        let cfg = DeviceConfig {
            model: Some("Test Controller".to_string()),
            port: Some("/dev/ttyUSB0".to_string()),
            baud: Some(19200),
        };
        let model = "nice test controller".to_string();
        let port = "/dev/ttyUSB1".to_string();
        let cmd = startup_connect(
            DeviceKind::Controller,
            &cfg,
            Some(&model),
            Some(&port),
            &registry(),
        )
        .unwrap();
        assert_eq!(
            cmd,
            Some(EngineCommand::Connect {
                kind: DeviceKind::Controller,
                model: "nice test controller".to_string(),
                port: Some("/dev/ttyUSB1".to_string()),
                baud: Some(19200),
            })
        );
    }

    #[test]
    fn test_no_model_means_no_startup_connect() {
        let cmd = startup_connect(
            DeviceKind::Sensor,
            &DeviceConfig::default(),
            None,
            None,
            &registry(),
        )
        .unwrap();
        assert!(cmd.is_none());
    }

    #[test]
    fn test_unknown_model_lists_available() {
        let cfg = DeviceConfig {
            model: Some("Pyrometer 3000".to_string()),
            ..DeviceConfig::default()
        };
        let err = startup_connect(DeviceKind::Sensor, &cfg, None, None, &registry())
            .unwrap_err()
            .to_string();
        assert!(err.starts_with("Unknown sensor model: Pyrometer 3000"));
        assert!(err.contains("Test Sensor"));
    }
}
