//! NVS persistence for the last confirmed target weight.
//!
//! Settings are a small JSON blob in the `shotstopper` namespace. Off-device, or
//! when the partition cannot be opened, the store runs in mock mode and keeps the
//! settings in memory only.

use crate::system::events::Notifier;
use crate::types::{LinkStatus, DEFAULT_TARGET_WEIGHT};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[cfg(target_os = "espidf")]
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

const SETTINGS_VERSION: u8 = 1;
const NVS_NAMESPACE: &str = "shotstopper";
const SETTINGS_KEY: &str = "settings";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u8,
    pub last_target: i8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            last_target: DEFAULT_TARGET_WEIGHT,
        }
    }
}

#[derive(Debug)]
pub enum StorageError {
    Serialize(serde_json::Error),
    #[cfg(target_os = "espidf")]
    Nvs(esp_idf_svc::sys::EspError),
    Poisoned,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Serialize(e) => write!(f, "Settings encoding failed: {}", e),
            #[cfg(target_os = "espidf")]
            StorageError::Nvs(e) => write!(f, "NVS error: {}", e),
            StorageError::Poisoned => write!(f, "Settings lock poisoned"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialize(e)
    }
}

#[cfg(target_os = "espidf")]
impl From<esp_idf_svc::sys::EspError> for StorageError {
    fn from(e: esp_idf_svc::sys::EspError) -> Self {
        StorageError::Nvs(e)
    }
}

pub struct SettingsStore {
    #[cfg(target_os = "espidf")]
    nvs: Option<Mutex<EspNvs<NvsDefault>>>,
    cached: Mutex<Settings>,
}

impl SettingsStore {
    /// In-memory only.
    pub fn mock() -> Self {
        info!("Settings store in mock mode");
        Self {
            #[cfg(target_os = "espidf")]
            nvs: None,
            cached: Mutex::new(Settings::default()),
        }
    }

    #[cfg(target_os = "espidf")]
    pub fn new(partition: EspDefaultNvsPartition) -> Self {
        match EspNvs::new(partition, NVS_NAMESPACE, true) {
            Ok(nvs) => {
                let store = Self {
                    nvs: Some(Mutex::new(nvs)),
                    cached: Mutex::new(Settings::default()),
                };
                if let Err(e) = store.load() {
                    warn!("Failed to load settings from NVS: {} - using defaults", e);
                }
                info!("✅ Settings store ready (namespace {})", NVS_NAMESPACE);
                store
            }
            Err(e) => {
                warn!("⚠️ NVS namespace unavailable: {:?} - using in-memory settings", e);
                Self::mock()
            }
        }
    }

    #[cfg(target_os = "espidf")]
    fn load(&self) -> Result<(), StorageError> {
        let Some(nvs) = self.nvs.as_ref() else {
            return Ok(());
        };
        let nvs = nvs.lock().map_err(|_| StorageError::Poisoned)?;
        let mut buffer = [0u8; 128];
        if let Some(data) = nvs.get_blob(SETTINGS_KEY, &mut buffer)? {
            let settings = decode(data)?;
            info!("📂 Loaded settings: last target {}g", settings.last_target);
            *self.cached.lock().map_err(|_| StorageError::Poisoned)? = settings;
        }
        Ok(())
    }

    pub fn is_mock(&self) -> bool {
        #[cfg(target_os = "espidf")]
        {
            self.nvs.is_none()
        }
        #[cfg(not(target_os = "espidf"))]
        {
            true
        }
    }

    pub fn settings(&self) -> Settings {
        self.cached
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn save_last_target(&self, value: i8) -> Result<(), StorageError> {
        let settings = {
            let mut cached = self.cached.lock().map_err(|_| StorageError::Poisoned)?;
            if cached.last_target == value {
                return Ok(());
            }
            cached.last_target = value;
            cached.clone()
        };
        let data = serde_json::to_vec(&settings)?;
        self.write_blob(&data)
    }

    #[cfg(target_os = "espidf")]
    fn write_blob(&self, data: &[u8]) -> Result<(), StorageError> {
        if let Some(nvs) = self.nvs.as_ref() {
            let mut nvs = nvs.lock().map_err(|_| StorageError::Poisoned)?;
            nvs.set_blob(SETTINGS_KEY, data)?;
            debug!("💾 Saved settings to NVS ({} bytes)", data.len());
        } else {
            debug!("📝 [MOCK] Would save settings ({} bytes)", data.len());
        }
        Ok(())
    }

    #[cfg(not(target_os = "espidf"))]
    fn write_blob(&self, data: &[u8]) -> Result<(), StorageError> {
        debug!("📝 [MOCK] Would save settings ({} bytes)", data.len());
        Ok(())
    }
}

/// Blobs from a newer layout are ignored rather than misread.
fn decode(data: &[u8]) -> Result<Settings, StorageError> {
    let settings: Settings = serde_json::from_slice(data)?;
    if settings.version != SETTINGS_VERSION {
        warn!(
            "Settings version {} != {}, ignoring stored blob",
            settings.version, SETTINGS_VERSION
        );
        return Ok(Settings::default());
    }
    Ok(settings)
}

/// Saves every value the peripheral confirms.
pub struct SettingsPersister {
    store: Arc<SettingsStore>,
}

impl SettingsPersister {
    pub fn new(store: Arc<SettingsStore>) -> Self {
        Self { store }
    }
}

impl Notifier for SettingsPersister {
    fn on_value_changed(&self, _value: i8) {}

    fn on_link_status_changed(&self, _status: LinkStatus) {}

    fn on_value_confirmed(&self, value: i8) {
        if let Err(e) = self.store.save_last_target(value) {
            warn!("Failed to persist target {}g: {}", value, e);
        }
    }

    fn on_confirmation_cleared(&self) {}
}
