use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;
use crate::pin;

pub const SOFT_SHUTDOWN_KEY: &str = "soft_shutdown";
pub const SHUTDOWN_BUTTON_KEY: &str = "shutdown_button";
pub const BOOT_OK_KEY: &str = "boot_ok";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub timeout: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GpioConfig {
    /// How long to retry setting the direction while udev sets up a new export.
    pub export_wait_ms: u64,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            export_wait_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ProbeConfig {
    pub command: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            command: "ls /sys/class/gpio/".to_string(),
            uid: Some(1000),
            gid: Some(1000),
        }
    }
}

fn default_pin_store() -> PathBuf {
    PathBuf::from("pins.json")
}

fn default_shutdown_command() -> Vec<String> {
    vec!["/sbin/shutdown".into(), "-h".into(), "now".into()]
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    #[serde(default = "default_pin_store")]
    pub pin_store: PathBuf,
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default = "default_shutdown_command")]
    pub shutdown_command: Vec<String>,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))
    }
}

/// Logical pin numbers for the three roles; 0 means unset.
#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct PinConfig {
    pub soft_shutdown: u32,
    pub shutdown_button: u32,
    pub boot_ok: u32,
}

/// Persisted pin assignments. Values are kept as the raw strings the
/// settings page sent and only parsed when a [`PinConfig`] is requested.
#[derive(Debug, Default)]
pub struct PinStore {
    path: Option<PathBuf>,
    values: Map<String, Value>,
}

impl PinStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read pin store {}: {e}", path.display()))
        })?;
        let values = match serde_json::from_str::<Value>(&contents)
            .map_err(|e| AppError::Config(format!("Invalid pin store json: {e}")))?
        {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => {
                return Err(AppError::Config(
                    "Pin store must be a JSON object".to_string(),
                ));
            }
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            values,
        })
    }

    /// Loads the store, or starts an empty one bound to `path` when the file
    /// does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_file(path)
        } else {
            Ok(Self {
                path: Some(path.to_path_buf()),
                values: Map::new(),
            })
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: Option<String>) {
        match value {
            Some(v) => self.values.insert(key.to_string(), Value::String(v)),
            None => self.values.insert(key.to_string(), Value::Null),
        };
    }

    pub fn save(&self) -> Result<(), AppError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = serde_json::to_string_pretty(&self.values)
            .map_err(|e| AppError::Config(format!("Failed to encode pin store: {e}")))?;
        fs::write(path, contents).map_err(|e| {
            AppError::Config(format!("Failed to write pin store {}: {e}", path.display()))
        })
    }

    pub fn pin_config(&self) -> PinConfig {
        PinConfig {
            soft_shutdown: pin::try_parse(self.get(SOFT_SHUTDOWN_KEY).as_deref(), 0),
            shutdown_button: pin::try_parse(self.get(SHUTDOWN_BUTTON_KEY).as_deref(), 0),
            boot_ok: pin::try_parse(self.get(BOOT_OK_KEY).as_deref(), 0),
        }
    }

    /// Writes a store with every role unset if the backing file is missing.
    /// Returns whether a file was created.
    pub fn ensure_defaults(&mut self) -> Result<bool, AppError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        if path.exists() {
            return Ok(false);
        }
        for key in [SOFT_SHUTDOWN_KEY, SHUTDOWN_BUTTON_KEY, BOOT_OK_KEY] {
            if !self.values.contains_key(key) {
                self.set(key, Some("0".to_string()));
            }
        }
        self.save()?;
        Ok(true)
    }
}
