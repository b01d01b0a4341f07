//! TOML config file loading and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::io::ErrorKind;
use tracing::warn;

use crate::device::DeviceId;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub devices: DevicesConfig,
    pub web: WebConfig,
    pub usage: UsageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Explicit port (`/dev/ttyUSB0`, `COM13`). When unset the port is
    /// discovered if `auto_detect` is on.
    pub port: Option<String>,
    pub baud_rate: u32,
    pub auto_detect: bool,
    /// Reader loop sleep between polls. Upper bound on reconnect and frame
    /// latency.
    pub poll_interval_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            auto_detect: true,
            poll_interval_ms: 50,
            read_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub motor: MotorConfig,
    pub light: LightConfig,
}

impl DevicesConfig {
    pub fn name(&self, device: DeviceId) -> &str {
        match device {
            DeviceId::Motor => &self.motor.name,
            DeviceId::Light => &self.light.name,
        }
    }

    pub fn power_watt(&self, device: DeviceId) -> f64 {
        match device {
            DeviceId::Motor => self.motor.power_watt,
            DeviceId::Light => self.light.power_watt,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    pub name: String,
    pub flow_rate_l_per_min: f64,
    pub power_watt: f64,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            name: "Bore Pump".into(),
            flow_rate_l_per_min: 20.0,
            power_watt: 750.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LightConfig {
    pub name: String,
    pub power_watt: f64,
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            name: "Grow Light".into(),
            power_watt: 100.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Trailing window for the status endpoint's totals.
    pub window_hours: u32,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self { window_hours: 24 }
    }
}

/// Longest poll interval that still keeps frame latency reasonable.
const MAX_POLL_INTERVAL_MS: u64 = 10_000;

/// A year; longer windows are almost certainly a unit mistake.
pub(crate) const MAX_WINDOW_HOURS: u32 = 24 * 366;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_serial(&mut errors);
        self.validate_devices(&mut errors);
        self.validate_web_and_usage(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_serial(&self, errors: &mut Vec<String>) {
        let s = &self.serial;

        match &s.port {
            Some(port) if port.trim().is_empty() => {
                errors.push("serial.port is empty".to_string());
            }
            None if !s.auto_detect => {
                errors.push("serial.port must be set when auto_detect is false".to_string());
            }
            _ => {}
        }

        if s.baud_rate == 0 {
            errors.push("serial.baud_rate must be positive".to_string());
        }
        if s.poll_interval_ms == 0 || s.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            errors.push(format!(
                "serial.poll_interval_ms {} out of range [1, {MAX_POLL_INTERVAL_MS}]",
                s.poll_interval_ms
            ));
        }
        if s.read_timeout_ms == 0 {
            errors.push("serial.read_timeout_ms must be positive".to_string());
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        for device in DeviceId::ALL {
            if self.devices.name(device).trim().is_empty() {
                errors.push(format!("devices.{device}.name is empty"));
            }
            let watt = self.devices.power_watt(device);
            if !watt.is_finite() || watt < 0.0 {
                errors.push(format!(
                    "devices.{device}.power_watt must be non-negative, got {watt}"
                ));
            }
        }

        let flow = self.devices.motor.flow_rate_l_per_min;
        if !flow.is_finite() || flow < 0.0 {
            errors.push(format!(
                "devices.motor.flow_rate_l_per_min must be non-negative, got {flow}"
            ));
        }
    }

    fn validate_web_and_usage(&self, errors: &mut Vec<String>) {
        if self.web.host.trim().is_empty() {
            errors.push("web.host is empty".to_string());
        }
        if self.usage.window_hours == 0 || self.usage.window_hours > MAX_WINDOW_HOURS {
            errors.push(format!(
                "usage.window_hours {} out of range [1, {MAX_WINDOW_HOURS}]",
                self.usage.window_hours
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults.
pub fn load(path: &str) -> Result<Config> {
    let config = match std::fs::read_to_string(path) {
        Ok(contents) => parse(&contents).with_context(|| format!("failed to parse config: {path}"))?,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(path, "config file not found; using defaults");
            Config::default()
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

fn parse(contents: &str) -> Result<Config> {
    Ok(toml::from_str(contents)?)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[serial]
port = "/dev/ttyUSB0"
baud_rate = 9600
auto_detect = false
poll_interval_ms = 20

[devices.motor]
name = "Well Pump"
flow_rate_l_per_min = 12.5
power_watt = 550.0

[devices.light]
name = "LED Bar"
power_watt = 60.0

[web]
host = "127.0.0.1"
port = 8080

[usage]
window_hours = 12
"#;
        let config = parse(toml_str).unwrap();
        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.serial.baud_rate, 9600);
        assert!(!config.serial.auto_detect);
        assert_eq!(config.serial.poll_interval_ms, 20);
        assert_eq!(config.serial.read_timeout_ms, 100);
        assert_eq!(config.devices.name(DeviceId::Motor), "Well Pump");
        assert_eq!(config.devices.motor.flow_rate_l_per_min, 12.5);
        assert_eq!(config.devices.power_watt(DeviceId::Light), 60.0);
        assert_eq!(config.web.port, 8080);
        assert_eq!(config.usage.window_hours, 12);
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config_gives_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.serial.port, None);
        assert_eq!(config.serial.baud_rate, 115_200);
        assert!(config.serial.auto_detect);
        assert_eq!(config.serial.poll_interval_ms, 50);
        assert_eq!(config.devices.name(DeviceId::Motor), "Bore Pump");
        assert_eq!(config.devices.name(DeviceId::Light), "Grow Light");
        assert_eq!(config.web.port, 5000);
        assert_eq!(config.usage.window_hours, 24);
    }

    #[test]
    fn parse_partial_section_keeps_other_defaults() {
        let config = parse("[devices.light]\nname = \"Veg Lamp\"\n").unwrap();
        assert_eq!(config.devices.light.name, "Veg Lamp");
        assert_eq!(config.devices.light.power_watt, 100.0);
        assert_eq!(config.devices.motor.name, "Bore Pump");
    }

    #[test]
    fn parse_rejects_wrong_types() {
        assert!(parse("[serial]\nbaud_rate = \"fast\"\n").is_err());
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let config = load("/nonexistent/smartfarm.toml").unwrap();
        assert_eq!(config.web.port, 5000);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn default_config_passes() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn empty_port_rejected() {
        let mut cfg = Config::default();
        cfg.serial.port = Some("  ".into());
        assert_validation_err(&cfg, "serial.port is empty");
    }

    #[test]
    fn no_port_without_auto_detect_rejected() {
        let mut cfg = Config::default();
        cfg.serial.auto_detect = false;
        assert_validation_err(&cfg, "must be set when auto_detect is false");
    }

    #[test]
    fn zero_baud_rejected() {
        let mut cfg = Config::default();
        cfg.serial.baud_rate = 0;
        assert_validation_err(&cfg, "baud_rate must be positive");
    }

    #[test]
    fn poll_interval_bounds() {
        let mut cfg = Config::default();
        cfg.serial.poll_interval_ms = 0;
        assert_validation_err(&cfg, "poll_interval_ms 0 out of range");

        cfg.serial.poll_interval_ms = 60_000;
        assert_validation_err(&cfg, "poll_interval_ms 60000 out of range");

        cfg.serial.poll_interval_ms = 1;
        cfg.validate().unwrap();
    }

    #[test]
    fn empty_device_name_rejected() {
        let mut cfg = Config::default();
        cfg.devices.light.name = "".into();
        assert_validation_err(&cfg, "devices.light.name is empty");
    }

    #[test]
    fn negative_power_rejected() {
        let mut cfg = Config::default();
        cfg.devices.motor.power_watt = -1.0;
        assert_validation_err(&cfg, "devices.motor.power_watt must be non-negative");
    }

    #[test]
    fn nan_flow_rate_rejected() {
        let mut cfg = Config::default();
        cfg.devices.motor.flow_rate_l_per_min = f64::NAN;
        assert_validation_err(&cfg, "flow_rate_l_per_min must be non-negative");
    }

    #[test]
    fn window_hours_bounds() {
        let mut cfg = Config::default();
        cfg.usage.window_hours = 0;
        assert_validation_err(&cfg, "usage.window_hours 0 out of range");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.serial.baud_rate = 0;
        cfg.devices.motor.name = "".into();
        cfg.web.host = "".into();
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "unexpected count in: {msg}");
        assert!(msg.contains("baud_rate"), "missing baud error in: {msg}");
        assert!(msg.contains("devices.motor.name"), "missing name error in: {msg}");
        assert!(msg.contains("web.host"), "missing host error in: {msg}");
    }
}
