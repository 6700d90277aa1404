use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

fn default_address() -> String {
  "0.0.0.0".to_string()
}

fn default_queue_limit() -> usize {
  50
}

fn default_baud_rate() -> u32 {
  115_200
}

fn default_serial_delay_ms() -> u64 {
  100
}

fn default_liveness_period_ms() -> u64 {
  1000
}

fn default_swallow_realtime_ok() -> bool {
  true
}

fn default_command_timeout_ms() -> u64 {
  5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  pub port: u16,

  #[serde(default = "default_address")]
  pub address: String,

  #[serde(rename = "queue-limit", default = "default_queue_limit")]
  pub queue_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
  #[serde(rename = "usb-id", default)]
  pub usb_id: Option<String>,

  #[serde(rename = "dev-path", default)]
  pub dev_path: Option<String>,

  #[serde(rename = "baud-rate", default = "default_baud_rate")]
  pub baud_rate: u32,

  #[serde(rename = "serial-delay", default = "default_serial_delay_ms")]
  pub serial_delay: u64,

  #[serde(rename = "liveness-period", default = "default_liveness_period_ms")]
  pub liveness_period: u64,

  #[serde(rename = "swallow-realtime-ok", default = "default_swallow_realtime_ok")]
  pub swallow_realtime_ok: bool,

  /// Per-command response deadline, in milliseconds. Not part of the
  /// distilled configuration table (which only names the liveness period)
  /// but required by the concurrency model's timeout (a); see SPEC_FULL.md.
  #[serde(rename = "command-timeout", default = "default_command_timeout_ms")]
  pub command_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerKindConfig {
  #[serde(rename = "type")]
  pub kind: String,

  #[serde(rename = "match")]
  pub pattern: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
  pub id: String,
  pub trigger: TriggerKindConfig,
  pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  pub device: DeviceConfig,

  #[serde(rename = "custom-triggers", default)]
  pub custom_triggers: Vec<TriggerConfig>,
}

impl Config {
  /// Loads and validates configuration from a TOML file. Validation failures
  /// (missing/ambiguous device selection, duplicate trigger ids) are
  /// surfaced here so startup can abort before the listener binds; rule
  /// regex compilation is validated separately by `TriggerEngine::new`.
  pub fn load(path: &Path) -> Result<Self, Error> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| Error::ConfigInvalid(format!("could not read {}: {}", path.display(), e)))?;

    let config: Config = toml::from_str(&contents)
      .map_err(|e| Error::ConfigInvalid(format!("could not parse {}: {}", path.display(), e)))?;

    config.validate()?;

    Ok(config)
  }

  fn validate(&self) -> Result<(), Error> {
    match (&self.device.usb_id, &self.device.dev_path) {
      (Some(_), Some(_)) => {
        return Err(Error::ConfigInvalid(
          "device.usb-id and device.dev-path are mutually exclusive".to_string(),
        ))
      }
      (None, None) => {
        return Err(Error::ConfigInvalid(
          "exactly one of device.usb-id or device.dev-path is required".to_string(),
        ))
      }
      _ => {}
    }

    let mut seen = std::collections::HashSet::new();
    for trigger in &self.custom_triggers {
      if trigger.id.is_empty() {
        return Err(Error::ConfigInvalid("trigger rule is missing an 'id'".to_string()));
      }
      if !seen.insert(trigger.id.clone()) {
        return Err(Error::ConfigInvalid(format!("duplicate trigger id '{}'", trigger.id)));
      }
      if trigger.trigger.pattern.is_empty() {
        return Err(Error::ConfigInvalid(format!(
          "trigger '{}' is missing trigger.match",
          trigger.id
        )));
      }
      if trigger.command.is_empty() {
        return Err(Error::ConfigInvalid(format!("trigger '{}' is missing a command", trigger.id)));
      }
    }

    Ok(())
  }

  pub fn serial_delay(&self) -> Duration {
    Duration::from_millis(self.device.serial_delay)
  }

  pub fn liveness_period(&self) -> Option<Duration> {
    if self.device.liveness_period == 0 {
      None
    } else {
      Some(Duration::from_millis(self.device.liveness_period))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn minimal_toml() -> &'static str {
    r#"
      [server]
      port = 5555

      [device]
      dev-path = "/dev/ttyUSB0"
    "#
  }

  #[test]
  fn defaults_are_applied() {
    let config: Config = toml::from_str(minimal_toml()).unwrap();
    assert_eq!(config.server.address, "0.0.0.0");
    assert_eq!(config.server.queue_limit, 50);
    assert_eq!(config.device.baud_rate, 115_200);
    assert_eq!(config.device.serial_delay, 100);
    assert!(config.device.swallow_realtime_ok);
    assert_eq!(config.liveness_period(), Some(Duration::from_millis(1000)));
  }

  #[test]
  fn zero_liveness_period_disables_probing() {
    let mut config: Config = toml::from_str(minimal_toml()).unwrap();
    config.device.liveness_period = 0;
    assert_eq!(config.liveness_period(), None);
  }

  #[test]
  fn rejects_both_device_selectors() {
    let toml = r#"
      [server]
      port = 5555

      [device]
      usb-id = "303a:4001"
      dev-path = "/dev/ttyUSB0"
    "#;
    let config: Config = toml::from_str(toml).unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn rejects_neither_device_selector() {
    let toml = r#"
      [server]
      port = 5555

      [device]
    "#;
    let config: Config = toml::from_str(toml).unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn rejects_duplicate_trigger_ids() {
    let toml = r#"
      [server]
      port = 5555

      [device]
      dev-path = "/dev/ttyUSB0"

      [[custom-triggers]]
      id = "air-on"
      command = "true"
      [custom-triggers.trigger]
      type = "gcode"
      match = "^M8$"

      [[custom-triggers]]
      id = "air-on"
      command = "false"
      [custom-triggers.trigger]
      type = "gcode"
      match = "^M9$"
    "#;
    let config: Config = toml::from_str(toml).unwrap();
    assert!(config.validate().is_err());
  }
}
