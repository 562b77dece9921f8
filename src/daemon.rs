use anyhow::{Context, Result};
use litimebms_lib::btleplug_transport::BtleplugTransport;
use litimebms_lib::config::PollConfig;
use litimebms_lib::controller::{Fleet, PublishedState, Reading};
use log::{error, info, warn};
use serde_json::json;
use tokio::sync::mpsc;

use crate::devices::DeviceConfig;
use crate::{commandline, mqtt};

fn state_to_json(state: &PublishedState) -> serde_json::Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "online": state.online,
        "connection_enabled": state.connection_enabled,
        "stale": matches!(state.reading, Reading::Stale(_)),
        "metrics": state.reading.metrics()
    })
}

/// Flattens `value` into one `(topic, payload)` pair per leaf.
fn simple_format(base_topic: &str, value: &serde_json::Value) -> Vec<(String, String)> {
    fn flatten_recursive(topic: &str, val: &serde_json::Value, out: &mut Vec<(String, String)>) {
        match val {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    let sub_topic = format!("{topic}/{k}");
                    flatten_recursive(&sub_topic, v, out);
                }
            }
            serde_json::Value::Array(arr) => {
                for (i, v) in arr.iter().enumerate() {
                    let sub_topic = format!("{topic}/{i}");
                    flatten_recursive(&sub_topic, v, out);
                }
            }
            serde_json::Value::String(s) => out.push((topic.to_string(), s.clone())),
            serde_json::Value::Number(n) => out.push((topic.to_string(), n.to_string())),
            serde_json::Value::Bool(b) => out.push((topic.to_string(), b.to_string())),
            serde_json::Value::Null => {
                // Do not publish null values
            }
        }
    }
    let mut out = Vec::new();
    flatten_recursive(base_topic, value, &mut out);
    out
}

async fn output_state(
    output: &commandline::DaemonOutput,
    publisher: Option<&mqtt::MqttPublisher>,
    label: &str,
    state: &PublishedState,
) {
    match output {
        commandline::DaemonOutput::Console => {
            println!(
                "--- {label} at {} (online: {}) ---",
                chrono::Local::now().to_rfc3339(),
                state.online
            );
            match &state.reading {
                Reading::Unavailable => println!("No data received yet"),
                Reading::Fresh(metrics) => crate::print_metrics(metrics),
                Reading::Stale(metrics) => {
                    println!("Last known values ({} failed polls):", state.consecutive_failures);
                    crate::print_metrics(metrics);
                }
            }
            println!("--------------------------");
        }
        commandline::DaemonOutput::Mqtt { format, .. } => {
            let Some(publisher) = publisher else {
                warn!("MQTT output selected, but publisher is not initialized. Skipping publish.");
                return;
            };
            let topic = format!("{}/{label}", publisher.topic());
            let value = state_to_json(state);
            match format {
                commandline::MqttFormat::Json => match serde_json::to_string(&value) {
                    Ok(json_payload) => {
                        if let Err(e) = publisher.publish(&topic, &json_payload).await {
                            error!("Failed to publish data to MQTT: {e:?}");
                        }
                    }
                    Err(e) => error!("Failed to serialize data to JSON string: {e}"),
                },
                commandline::MqttFormat::Simple => {
                    for (sub_topic, payload) in simple_format(&topic, &value) {
                        if let Err(e) = publisher.publish(&sub_topic, &payload).await {
                            error!("Failed to publish message to topic {sub_topic}: {e}");
                        }
                    }
                }
            }
        }
    }
}

pub async fn run(
    devices: Vec<DeviceConfig>,
    poll: PollConfig,
    output: commandline::DaemonOutput,
) -> Result<()> {
    info!(
        "Starting daemon mode: output={output:?}, interval={:?}, devices={devices:?}",
        poll.interval
    );

    let mut mqtt_publisher: Option<mqtt::MqttPublisher> = None;
    if let commandline::DaemonOutput::Mqtt { config_file, .. } = &output {
        let config = mqtt::MqttConfig::load(config_file)
            .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
        info!("Successfully loaded MQTT config from {config_file}: {config:?}");
        let publisher = mqtt::MqttPublisher::new(config)
            .await
            .with_context(|| "Failed to create MQTT publisher")?;
        mqtt_publisher = Some(publisher);
    }

    let mut fleet = Fleet::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, PublishedState)>();
    for device in &devices {
        let transport = BtleplugTransport::new()
            .await
            .with_context(|| "Cannot open Bluetooth adapter")?;
        let handle = fleet
            .add(&device.address, transport, device.poll_config(&poll))
            .with_context(|| format!("Cannot start polling '{}'", device.address))?;
        let label = device.label();
        let mut updates = handle.subscribe();
        let tx = tx.clone();
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let state = updates.borrow_and_update().clone();
                if tx.send((label.clone(), state)).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some((label, state)) => {
                    output_state(&output, mqtt_publisher.as_ref(), &label, &state).await;
                }
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Cannot listen for shutdown signal: {e}");
                }
                info!("Shutting down");
                break;
            }
        }
    }

    fleet.shutdown().await;
    if let Some(publisher) = &mqtt_publisher {
        if let Err(e) = publisher.disconnect().await {
            error!("{e:?}");
        }
    }
    Ok(())
}
