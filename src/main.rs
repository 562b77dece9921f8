use anyhow::{bail, Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use litimebms_lib::btleplug_transport::BtleplugTransport;
use litimebms_lib::config::{MetricsConfig, PollConfig, SessionConfig};
use litimebms_lib::metrics::{self, DerivedMetrics, Sample};
use litimebms_lib::protocol::{Command, SERVICE_UUID};
use litimebms_lib::session::{ConnectionSession, DeviceRegistry};
use litimebms_lib::transport::BleTransport;
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod devices;
mod mqtt;

use commandline::{CliArgs, CliCommands};
use devices::{DaemonConfig, DeviceConfig};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

pub fn print_metrics(metrics: &DerivedMetrics) {
    let status = &metrics.status;
    println!(
        "Voltage: {:.2} V, Current: {:.2} A, Power: {:.1} W",
        metrics.total_voltage, metrics.current, metrics.power
    );
    println!(
        "SOC: {}%, SOH: {}%, Capacity: {:.2}/{:.2} Ah, Cycles: {}, Total discharge: {:.1} Ah",
        status.soc_percent,
        status.soh_percent,
        metrics.remaining_capacity_ah,
        metrics.full_capacity_ah,
        status.discharge_cycles,
        metrics.total_discharge_ah
    );
    println!(
        "Temperatures: cell {} °C, MOSFET {} °C",
        status.cell_temperature_c, status.mosfet_temperature_c
    );
    println!("Cell voltages: {:?}", metrics.cell_voltages);
    if let (Some(min), Some(max), Some(delta)) = (
        metrics.min_cell_voltage_mv,
        metrics.max_cell_voltage_mv,
        metrics.delta_cell_voltage_mv,
    ) {
        println!("Cell range: {min}..{max} mV (delta {delta} mV)");
    }
    println!(
        "State: {:?}, charging: {}, discharging: {}, balancing: {:?}",
        status.battery_state(),
        metrics.charging,
        metrics.discharging,
        metrics.balancing_cells
    );
    println!(
        "Charge enabled: {}, Discharge enabled: {}",
        metrics.charge_enabled, metrics.discharge_enabled
    );
    println!("Protection: {}", metrics.protection.join(", "));
    println!("Failures: {}", metrics.failures.join(", "));
    match &metrics.estimate {
        Some(estimate) => println!(
            "{}% reached in {:.1} h at {}",
            estimate.target_soc,
            estimate.remaining_hours,
            estimate.reached_at.with_timezone(&chrono::Local).to_rfc3339()
        ),
        None => println!("Time estimate: unavailable"),
    }
}

fn single_address(args: &CliArgs) -> Result<&str> {
    match args.address.as_slice() {
        [address] => Ok(address),
        [] => bail!("No device address given, use --address"),
        _ => bail!("This command takes exactly one --address"),
    }
}

async fn open_session(args: &CliArgs) -> Result<ConnectionSession<BtleplugTransport>> {
    let address = single_address(args)?;
    let transport = BtleplugTransport::new()
        .await
        .with_context(|| "Cannot open Bluetooth adapter")?;
    let config = SessionConfig {
        connect_timeout: args.connect_timeout,
        response_timeout: args.timeout,
        ..SessionConfig::default()
    };
    let mut session = ConnectionSession::open(&DeviceRegistry::new(), address, transport, config)?;
    session
        .connect()
        .await
        .with_context(|| format!("Cannot connect to '{address}'"))?;
    Ok(session)
}

async fn send_command(args: &CliArgs, command: Command) -> Result<()> {
    let mut session = open_session(args).await?;
    let result = session
        .write_command(command)
        .await
        .with_context(|| format!("Cannot send {command}"));
    session.disconnect().await;
    result
}

fn metrics_config(args: &CliArgs) -> MetricsConfig {
    let config = MetricsConfig::default();
    match args.cells {
        Some(cells) => config.with_cell_count(cells).validated(),
        None => config,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    match &args.command {
        CliCommands::Scan { duration } => {
            let mut transport = BtleplugTransport::new()
                .await
                .with_context(|| "Cannot open Bluetooth adapter")?;
            let devices = transport
                .scan(SERVICE_UUID, *duration)
                .await
                .with_context(|| "Cannot scan for devices")?;
            if devices.is_empty() {
                println!("No devices found");
            }
            for device in devices {
                println!(
                    "{} {} (RSSI: {})",
                    device.address,
                    device.name.as_deref().unwrap_or("<unnamed>"),
                    device
                        .rssi
                        .map_or_else(|| "n/a".to_string(), |rssi| rssi.to_string())
                );
            }
        }
        CliCommands::Status { json } => {
            let mut session = open_session(&args).await?;
            let frame = session.query().await;
            session.disconnect().await;
            let frame = frame.with_context(|| "Cannot get status")?;
            let metrics = metrics::derive(&Sample::now(frame), None, &metrics_config(&args));
            if *json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            } else {
                print_metrics(&metrics);
            }
        }
        CliCommands::SetCharging { enable } => send_command(&args, Command::charge(*enable)).await?,
        CliCommands::SetDischarging { enable } => {
            send_command(&args, Command::discharge(*enable)).await?
        }
        CliCommands::Daemon {
            output,
            interval,
            devices_file,
        } => {
            let (devices, poll) = match devices_file {
                Some(devices_file) => {
                    let config = DaemonConfig::load(devices_file)?;
                    (config.devices, config.poll)
                }
                None => {
                    if args.address.is_empty() {
                        bail!("No device address given, use --address or --devices-file");
                    }
                    let devices = args
                        .address
                        .iter()
                        .map(|address| DeviceConfig::new(address, args.cells))
                        .collect();
                    let mut poll = PollConfig {
                        interval: *interval,
                        ..PollConfig::default()
                    };
                    poll.session.connect_timeout = args.connect_timeout;
                    poll.session.response_timeout = args.timeout;
                    (devices, poll)
                }
            };
            daemon::run(devices, poll, output.clone()).await?;
        }
    }

    Ok(())
}
