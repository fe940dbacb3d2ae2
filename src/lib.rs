// Module declarations for the bridge's core components
pub mod channels;    // Reporting-boundary broadcast channels
pub mod config;      // Configuration management
pub mod coordinator; // Command dispatch over the one session
pub mod discovery;   // UDP discovery and announce
pub mod error;       // Typed protocol error taxonomy
pub mod isolar;      // ISolar wire protocol: frames and sessions
pub mod options;     // Command line options parsing
pub mod prelude;     // Common imports and types
pub mod register;    // Register maps and value decoding
pub mod scheduler;   // Periodic poll driver
pub mod sensor;      // Sensor groups and typed readings
pub mod utils;       // Utility functions

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;
use crate::channels::ChannelData;
use crate::coordinator::Coordinator;
use crate::options::RunCommand;
use crate::scheduler::Scheduler;

use std::io::Write;
use std::sync::Arc;

fn init_logging(filter: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();
}

pub async fn app(options: Options) -> Result<()> {
    init_logging("info");

    info!("starting isolar-bridge {}", CARGO_PKG_VERSION);

    let config = ConfigWrapper::new(options.config_file.clone()).map_err(|err| {
        error!("failed to load config {}: {:?}", options.config_file, err);
        err
    })?;

    init_logging(&config.loglevel());

    let channels = Channels::new();
    let coordinator = Arc::new(Coordinator::new(config.clone(), channels.clone())?);

    match options.command.unwrap_or(RunCommand::Monitor) {
        RunCommand::Monitor => monitor(config, coordinator, channels).await,
        RunCommand::RegisterScan {
            start_register,
            register_count,
        } => register_scan(coordinator, start_register, register_count).await,
        RunCommand::DeviceScan { start_id, end_id } => {
            device_scan(coordinator, start_id, end_id).await
        }
    }
}

/// Long-running mode: poll on an interval, publish snapshots, print
/// stats on shutdown.
async fn monitor(
    config: ConfigWrapper,
    coordinator: Arc<Coordinator>,
    channels: Channels,
) -> Result<()> {
    if let Err(e) = coordinator.connect().await {
        warn!("initial connection failed, scheduler will retry: {}", e);
    }

    let scheduler = Scheduler::new(config, coordinator.clone(), channels.clone());
    let scheduler_handle = tokio::spawn(async move {
        if let Err(e) = scheduler.start().await {
            error!("scheduler task failed: {}", e);
        }
    });

    // stand-in for the home-automation layer: log what lands on the
    // reporting channel
    let mut reporting_rx = channels.to_reporting.subscribe();
    let reporting_handle = tokio::spawn(async move {
        loop {
            match reporting_rx.recv().await {
                Ok(ChannelData::Snapshot(snapshot)) => {
                    if let Some(battery) = &snapshot.battery {
                        info!(
                            "battery: {:.1}V {:.1}A {}W soc={}%",
                            battery.voltage, battery.current, battery.power, battery.soc
                        );
                    }
                    if let Some(system) = &snapshot.system {
                        info!("mode: {}", system.mode_name);
                    }
                }
                Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                Err(_) => {}
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    coordinator.stop().await;

    if let Err(e) = futures::try_join!(scheduler_handle, reporting_handle) {
        error!("error waiting for tasks: {}", e);
    }

    if let Ok(stats) = coordinator.shared_stats.lock() {
        stats.print_summary();
    }

    info!("shutdown complete");
    Ok(())
}

/// One-shot diagnostic: sweep a register range and emit JSON lines.
async fn register_scan(
    coordinator: Arc<Coordinator>,
    start_register: u16,
    register_count: u16,
) -> Result<()> {
    coordinator.connect().await?;

    let mut scan = coordinator.register_scan(start_register, register_count)?;
    while let Some(result) = scan.next().await {
        println!("{}", serde_json::to_string(&result)?);
    }

    coordinator.stop().await;
    Ok(())
}

/// One-shot diagnostic: probe device ids and report who answered.
async fn device_scan(coordinator: Arc<Coordinator>, start_id: u8, end_id: u8) -> Result<()> {
    coordinator.connect().await?;

    let mut confirmed = Vec::new();
    let mut scan = coordinator.device_scan(start_id, end_id)?;
    while let Some(probe) = scan.next().await {
        println!("{}", serde_json::to_string(&probe)?);
        if probe.responded {
            confirmed.push(probe.id);
        }
    }

    match confirmed.as_slice() {
        [] => info!("no device ids answered"),
        ids => info!("responding device ids: {:?}", ids),
    }

    coordinator.stop().await;
    Ok(())
}
