//! Centralized configuration management
//!
//! Defaults are the firmware constants from `types`. Credentials and the
//! peripheral's identifiers are baked in at build time through environment
//! variables, e.g. `WIFI_SSID=... MQTT_URL=mqtt://10.0.0.2:1883 cargo build`.

use crate::types::*;
use embassy_time::Duration;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Service advertised by the target-weight peripheral.
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_0000_0000_0000_0000_0ffe);
/// The single readable/writable one-byte characteristic.
pub const DEFAULT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_0000_0000_0000_0000_0000_0000_ff11);

const LINK_TIMEOUT_MARGIN_MS: u64 = 1000;

#[derive(Debug)]
pub enum ConfigError {
    InvalidUuid { key: &'static str, value: String },
    InvalidNumber { key: &'static str, value: String },
    InvalidRange { min: i8, max: i8 },
    DefaultOutOfRange { value: i8, min: i8, max: i8 },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidUuid { key, value } => write!(f, "{}: invalid UUID '{}'", key, value),
            ConfigError::InvalidNumber { key, value } => write!(f, "{}: invalid number '{}'", key, value),
            ConfigError::InvalidRange { min, max } => {
                write!(f, "value range is empty ({} > {})", min, max)
            }
            ConfigError::DefaultOutOfRange { value, min, max } => {
                write!(f, "default value {} outside {}..={}", value, min, max)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub active: bool,
    pub interval: u16,
    pub window: u16,
    pub duration_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            active: true,
            interval: SCAN_INTERVAL,
            window: SCAN_WINDOW,
            duration_ms: SCAN_DURATION_MS,
        }
    }
}

impl ScanConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioConfig {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub scan: ScanConfig,
    /// Upper bound for connect and GATT discovery. The scan is bounded by its own window.
    pub operation_timeout_ms: u64,
    /// How long a producer may wait for a free command slot.
    pub submit_wait_ms: u64,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            service_uuid: DEFAULT_SERVICE_UUID,
            characteristic_uuid: DEFAULT_CHARACTERISTIC_UUID,
            scan: ScanConfig::default(),
            operation_timeout_ms: RADIO_OPERATION_TIMEOUT_MS,
            submit_wait_ms: SUBMIT_WAIT_MS,
        }
    }
}

impl RadioConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Deadline handed to the stack's own connect procedure. Shorter than
    /// `operation_timeout` so the stack gives up before the caller stops waiting.
    pub fn link_timeout(&self) -> Duration {
        let ms = self.operation_timeout_ms;
        Duration::from_millis(ms.saturating_sub(LINK_TIMEOUT_MARGIN_MS).max(ms / 2))
    }

    pub fn submit_wait(&self) -> Duration {
        Duration::from_millis(self.submit_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    pub debounce_ms: u64,
    pub default_value: i8,
    pub min_value: i8,
    pub max_value: i8,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEBOUNCE_QUIET_MS,
            default_value: DEFAULT_TARGET_WEIGHT,
            min_value: i8::MIN,
            max_value: i8::MAX,
        }
    }
}

impl InputConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationConfig {
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub discovery_prefix: String,
    pub device_id: String,
    pub presence_topic: String,
    pub loop_period_ms: u64,
    pub reconnect_backoff_ms: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://homeassistant.local:1883".to_string(),
            client_id: "shotstopper".to_string(),
            username: None,
            password: None,
            discovery_prefix: "homeassistant".to_string(),
            device_id: "linea_micra".to_string(),
            presence_topic: "shotstopper/status".to_string(),
            loop_period_ms: AUTOMATION_LOOP_PERIOD_MS,
            reconnect_backoff_ms: NETWORK_RECONNECT_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub ssid: String,
    pub password: String,
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            connect_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub radio: RadioConfig,
    pub input: InputConfig,
    pub automation: AutomationConfig,
    pub network: NetworkConfig,
}

impl ControllerConfig {
    /// Defaults overlaid with whatever was set in the build environment.
    pub fn from_build_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(build_env)
    }

    pub fn with_overrides<'a, F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        if let Some(value) = lookup("SHOTSTOPPER_SERVICE_UUID") {
            self.radio.service_uuid = parse_uuid("SHOTSTOPPER_SERVICE_UUID", value)?;
        }
        if let Some(value) = lookup("SHOTSTOPPER_CHAR_UUID") {
            self.radio.characteristic_uuid = parse_uuid("SHOTSTOPPER_CHAR_UUID", value)?;
        }
        if let Some(value) = lookup("SHOTSTOPPER_MIN_VALUE") {
            self.input.min_value = parse_i8("SHOTSTOPPER_MIN_VALUE", value)?;
        }
        if let Some(value) = lookup("SHOTSTOPPER_MAX_VALUE") {
            self.input.max_value = parse_i8("SHOTSTOPPER_MAX_VALUE", value)?;
        }
        if let Some(value) = lookup("WIFI_SSID") {
            self.network.ssid = value.to_string();
        }
        if let Some(value) = lookup("WIFI_PASSWORD") {
            self.network.password = value.to_string();
        }
        if let Some(value) = lookup("MQTT_URL") {
            self.automation.broker_url = value.to_string();
        }
        if let Some(value) = lookup("MQTT_USER") {
            self.automation.username = Some(value.to_string());
        }
        if let Some(value) = lookup("MQTT_PASSWORD") {
            self.automation.password = Some(value.to_string());
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let input = &self.input;
        if input.min_value > input.max_value {
            return Err(ConfigError::InvalidRange {
                min: input.min_value,
                max: input.max_value,
            });
        }
        if !(input.min_value..=input.max_value).contains(&input.default_value) {
            return Err(ConfigError::DefaultOutOfRange {
                value: input.default_value,
                min: input.min_value,
                max: input.max_value,
            });
        }
        Ok(())
    }
}

/// Read-only after boot; tasks keep a cloned handle.
pub struct ConfigManager {
    config: Arc<ControllerConfig>,
}

impl ConfigManager {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn load() -> Result<Self, ConfigError> {
        let config = ControllerConfig::from_build_env()?;
        info!(
            "Config: service {} characteristic {} broker {}",
            config.radio.service_uuid, config.radio.characteristic_uuid, config.automation.broker_url
        );
        Ok(Self::new(config))
    }

    pub fn get_handle(&self) -> Arc<ControllerConfig> {
        Arc::clone(&self.config)
    }
}

fn build_env(key: &str) -> Option<&'static str> {
    match key {
        "SHOTSTOPPER_SERVICE_UUID" => option_env!("SHOTSTOPPER_SERVICE_UUID"),
        "SHOTSTOPPER_CHAR_UUID" => option_env!("SHOTSTOPPER_CHAR_UUID"),
        "SHOTSTOPPER_MIN_VALUE" => option_env!("SHOTSTOPPER_MIN_VALUE"),
        "SHOTSTOPPER_MAX_VALUE" => option_env!("SHOTSTOPPER_MAX_VALUE"),
        "WIFI_SSID" => option_env!("WIFI_SSID"),
        "WIFI_PASSWORD" => option_env!("WIFI_PASSWORD"),
        "MQTT_URL" => option_env!("MQTT_URL"),
        "MQTT_USER" => option_env!("MQTT_USER"),
        "MQTT_PASSWORD" => option_env!("MQTT_PASSWORD"),
        _ => None,
    }
}

fn parse_uuid(key: &'static str, value: &str) -> Result<Uuid, ConfigError> {
    Uuid::parse_str(value.trim()).map_err(|_| ConfigError::InvalidUuid {
        key,
        value: value.to_string(),
    })
}

fn parse_i8(key: &'static str, value: &str) -> Result<i8, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        key,
        value: value.to_string(),
    })
}
