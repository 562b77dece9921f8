use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// List nearby devices advertising the BMS service
    Scan {
        /// How long to listen for advertisements (e.g., "5s", "30s")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        duration: Duration,
    },
    /// Query and print the current status: voltages, current, SOC, protection and failure flags
    Status {
        /// Print the status as JSON
        #[clap(long, short, action)]
        json: bool,
    },
    /// Enable or disable charging
    SetCharging {
        /// Enable charging. If this flag is not present, it will be disabled.
        #[clap(long, short, action)]
        enable: bool,
    },
    /// Enable or disable discharging
    SetDischarging {
        /// Enable discharging. If this flag is not present, it will be disabled.
        #[clap(long, short, action)]
        enable: bool,
    },
    /// Run in daemon mode, periodically polling one or more devices and outputting metrics
    Daemon {
        /// Output destination for metrics
        #[command(subcommand)]
        output: DaemonOutput,
        /// Interval for polling each device (e.g., "30s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "30s")]
        interval: Duration,
        /// YAML file listing the devices and poll settings. Replaces --address, --cells and --interval.
        #[clap(long)]
        devices_file: Option<String>,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously read metrics and print them to the standard output (console).
    Console,
    /// Continuously read metrics and publish them to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "litime bms bluetooth command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Bluetooth address of the BMS (e.g., C8:47:80:12:34:56). Daemon mode accepts a comma-separated list.
    #[arg(short, long, value_delimiter = ',')]
    pub address: Vec<String>,

    /// Number of battery cells (e.g., 4 for a 12V battery)
    #[arg(short, long)]
    pub cells: Option<usize>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for establishing the BLE connection (e.g., "20s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "20s")]
    pub connect_timeout: Duration,

    /// Timeout for a status response after a query (e.g., "10s", "5s 500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "10s")]
    pub timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_daemon() {
        let args = CliArgs::try_parse_from([
            "litimebms",
            "--address",
            "C8:47:80:00:00:01,C8:47:80:00:00:02",
            "--cells",
            "4",
            "daemon",
            "--interval",
            "1m",
            "console",
        ])
        .unwrap();
        assert_eq!(args.address.len(), 2);
        assert_eq!(args.cells, Some(4));
        assert_eq!(
            args.command,
            CliCommands::Daemon {
                output: DaemonOutput::Console,
                interval: Duration::from_secs(60),
                devices_file: None,
            }
        );
    }

    #[test]
    fn test_parse_set_charging() {
        let args =
            CliArgs::try_parse_from(["litimebms", "-a", "C8:47:80:00:00:01", "set-charging"])
                .unwrap();
        assert_eq!(args.command, CliCommands::SetCharging { enable: false });
        assert_eq!(args.timeout, Duration::from_secs(10));
    }
}
