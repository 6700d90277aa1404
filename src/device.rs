use std::path::Path;

use crate::config::DeviceConfig;
use crate::error::Error;

/// Resolves `device.usb-id`/`device.dev-path` into a concrete device node.
///
/// This is a thin, best-effort stand-in for the full USB enumeration layer
/// named out of scope by the proxy's design (configuration parsing and USB
/// enumeration are external collaborators): it looks up the udev-populated
/// `/dev/serial/by-id/` symlink tree rather than querying libusb directly.
pub fn resolve_device_path(config: &DeviceConfig) -> Result<String, Error> {
  if let Some(path) = &config.dev_path {
    return Ok(path.clone());
  }

  let usb_id = config
    .usb_id
    .as_ref()
    .ok_or_else(|| Error::ConfigInvalid("no device selector configured".to_string()))?;

  resolve_usb_id(usb_id, Path::new("/dev/serial/by-id"))
}

fn resolve_usb_id(usb_id: &str, by_id_dir: &Path) -> Result<String, Error> {
  let needle = usb_id.to_lowercase();

  let entries = std::fs::read_dir(by_id_dir).map_err(|e| {
    Error::ConfigInvalid(format!(
      "could not enumerate {} while resolving usb-id '{}': {}",
      by_id_dir.display(),
      usb_id,
      e
    ))
  })?;

  for entry in entries.flatten() {
    let name = entry.file_name().to_string_lossy().to_lowercase();
    if name.contains(&needle) {
      let resolved = std::fs::canonicalize(entry.path()).unwrap_or_else(|_| entry.path());
      return Ok(resolved.to_string_lossy().into_owned());
    }
  }

  Err(Error::ConfigInvalid(format!(
    "no serial device matching usb-id '{}' found under {}",
    usb_id,
    by_id_dir.display()
  )))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dev_path_bypasses_usb_resolution() {
    let config = DeviceConfig {
      usb_id: None,
      dev_path: Some("/dev/ttyUSB0".to_string()),
      baud_rate: 115_200,
      serial_delay: 100,
      liveness_period: 1000,
      swallow_realtime_ok: true,
      command_timeout_ms: 5000,
    };

    assert_eq!(resolve_device_path(&config).unwrap(), "/dev/ttyUSB0");
  }

  #[test]
  fn usb_id_without_matching_device_errors() {
    let tmp = std::env::temp_dir().join("gcode-serial-proxy-test-by-id-empty");
    let _ = std::fs::remove_dir_all(&tmp);
    std::fs::create_dir_all(&tmp).unwrap();

    let err = resolve_usb_id("303a:4001", &tmp).unwrap_err();
    assert!(matches!(err, Error::ConfigInvalid(_)));

    let _ = std::fs::remove_dir_all(&tmp);
  }
}
