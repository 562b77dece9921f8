use anyhow::{bail, Context, Result};
use litimebms_lib::config::PollConfig;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DeviceConfig {
    pub address: String,
    /// Used as MQTT sub topic and console label. Defaults to the address.
    pub name: Option<String>,
    /// Overrides `poll.metrics.cell_count` for this device.
    pub cell_count: Option<usize>,
}

impl DeviceConfig {
    pub fn new(address: &str, cell_count: Option<usize>) -> Self {
        Self {
            address: address.to_string(),
            name: None,
            cell_count,
        }
    }

    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.address.replace(':', "").to_ascii_lowercase(),
        }
    }

    /// The poll configuration for this device.
    pub fn poll_config(&self, base: &PollConfig) -> PollConfig {
        let mut config = base.clone();
        if let Some(cell_count) = self.cell_count {
            config.metrics = config.metrics.with_cell_count(cell_count);
        }
        config
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DaemonConfig {
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub poll: PollConfig,
}

impl DaemonConfig {
    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open device config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file).with_context(|| {
            format!("Cannot read device config from file: {config_file_path:?}")
        })?;
        if config.devices.is_empty() {
            bail!("No devices configured in {config_file_path:?}");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
devices:
  - address: C8:47:80:12:34:56
    name: house
    cell_count: 4
  - address: C8:47:80:AB:CD:EF
poll:
  interval: 1m
  session:
    response_timeout: 5s
"#
        )
        .unwrap();
        let config = DaemonConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.poll.interval, Duration::from_secs(60));
        assert_eq!(config.poll.session.response_timeout, Duration::from_secs(5));
        assert_eq!(config.poll.session.connect_timeout, Duration::from_secs(20));

        let house = &config.devices[0];
        assert_eq!(house.label(), "house");
        assert_eq!(house.poll_config(&config.poll).metrics.cell_count, 4);
        let other = &config.devices[1];
        assert_eq!(other.label(), "c84780abcdef");
        assert_eq!(other.poll_config(&config.poll).metrics.cell_count, 16);
    }

    #[test]
    fn test_load_requires_devices() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "devices: []").unwrap();
        assert!(DaemonConfig::load(file.path().to_str().unwrap()).is_err());
    }
}
