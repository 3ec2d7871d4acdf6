use serde::Deserialize;
use std::env;

use crate::registry::MAX_DEVICES;
use crate::skyq::{DeviceEndpoint, DEFAULT_HTTP_PORT, DEFAULT_TCP_PORT};

#[derive(Debug, Clone)]
pub struct Config {
    pub poll_interval_secs: u64,
    pub devices: Vec<DeviceEndpoint>,
}

// Serde struct for parsing the devices JSON file
#[derive(Deserialize)]
struct RawDevice {
    host: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_http_port")]
    http_port: u16,
    #[serde(default = "default_tcp_port")]
    tcp_port: u16,
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let devices_file = env_or_default("SKYQ_DEVICES_FILE", "devices.json".to_string());
        let devices = load_devices(&devices_file)?;

        let config = Self {
            poll_interval_secs: env_or_default("SKYQ_POLL_INTERVAL_SECS", 30),
            devices,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.devices.is_empty() {
            return Err("No devices found in devices file".into());
        }
        if self.devices.len() > MAX_DEVICES {
            return Err(format!(
                "Too many devices configured ({}, registry holds at most {MAX_DEVICES})",
                self.devices.len()
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err("SKYQ_POLL_INTERVAL_SECS must be > 0".into());
        }
        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if device.host.is_empty() {
                return Err(format!("Device {} has an empty host", device.id));
            }
            if device.id.is_empty() {
                return Err(format!("Device at {} has an empty id", device.host));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(format!("Duplicate device id: {}", device.id));
            }
        }
        Ok(())
    }
}

fn load_devices(path: &str) -> Result<Vec<DeviceEndpoint>, String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read {path}: {e}"))?;

    let raw_devices: Vec<RawDevice> =
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse {path}: {e}"))?;

    Ok(raw_devices
        .into_iter()
        .map(|raw| {
            let name = raw.name.unwrap_or_else(|| raw.host.clone());
            let id = raw.id.unwrap_or_else(|| sanitize_id(&name));
            DeviceEndpoint {
                id,
                name,
                host: raw.host,
                http_port: raw.http_port,
                tcp_port: raw.tcp_port,
            }
        })
        .collect())
}

/// Convert a display name into a safe device id.
/// "Living Room" → "living_room"
fn sanitize_id(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}
