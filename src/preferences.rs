use crate::error::ConfigError;
use rand::Rng;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Settings key of the URL measurements are uploaded to
pub const SYNC_ENDPOINT_URL_SETTINGS_KEY: &str = "sync.endpoint";
/// Settings key of the installation identifier used to group measurements per device
pub const DEVICE_IDENTIFIER_KEY: &str = "identifier.device";

/// String key-value settings store
pub trait Preferences: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;
    fn set_string(&self, key: &str, value: &str) -> Result<(), ConfigError>;
}

/// Return the stored device identifier, generating and storing one if absent
pub fn restore_or_create_device_id(prefs: &dyn Preferences) -> Result<String, ConfigError> {
    if let Some(id) = prefs.get_string(DEVICE_IDENTIFIER_KEY) {
        return Ok(id);
    }
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    let id: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    prefs.set_string(DEVICE_IDENTIFIER_KEY, &id)?;
    log::info!("Created device identifier {}", id);
    Ok(id)
}

#[derive(Default)]
pub struct MemoryPreferences {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value.to_string());
        }
        self
    }
}

impl Preferences for MemoryPreferences {
    fn get_string(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.values
            .lock()
            .map_err(|_| ConfigError::Poisoned)?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Preferences persisted as a flat JSON object; every write rewrites the file
pub struct JsonPreferences {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonPreferences {
    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        let values = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Map::new()
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }
}

impl Preferences for JsonPreferences {
    fn get_string(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .ok()?
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut values = self.values.lock().map_err(|_| ConfigError::Poisoned)?;
        values.insert(key.to_string(), Value::String(value.to_string()));
        let json = serde_json::to_string_pretty(&*values)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}
