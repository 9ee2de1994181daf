use crate::infrastructure::bluetooth::connection::SessionConfig;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::subscription::DescriptorPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "gatt_session".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_service_uuid")]
    pub target_service_uuid: String,
    #[serde(default = "default_characteristic_uuid")]
    pub target_characteristic_uuid: String,
    #[serde(default)]
    pub descriptor_policy: DescriptorPolicy,
    #[serde(default)]
    pub known_addresses: Vec<String>,
    #[serde(default)]
    pub last_connected_address: Option<String>,
    #[serde(default = "default_scan_duration_secs")]
    pub scan_duration_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            target_service_uuid: default_service_uuid(),
            target_characteristic_uuid: default_characteristic_uuid(),
            descriptor_policy: DescriptorPolicy::default(),
            known_addresses: Vec::new(),
            last_connected_address: None,
            scan_duration_secs: default_scan_duration_secs(),
        }
    }
}

impl SessionSettings {
    /// Build the runtime session configuration, validating the UUIDs
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        Ok(SessionConfig {
            target_service: protocol::parse_uuid(&self.target_service_uuid)?,
            target_characteristic: protocol::parse_uuid(&self.target_characteristic_uuid)?,
            descriptor_policy: self.descriptor_policy,
        })
    }

    /// Address to use when no explicit address is given
    pub fn preferred_address(&self) -> Option<&str> {
        self.last_connected_address
            .as_deref()
            .or_else(|| self.known_addresses.first().map(String::as_str))
    }
}

fn default_service_uuid() -> String {
    protocol::DEFAULT_SERVICE_UUID.to_string()
}
fn default_characteristic_uuid() -> String {
    protocol::DEFAULT_CHARACTERISTIC_UUID.to_string()
}
fn default_scan_duration_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("GattSession");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Record a successfully connected address
    pub fn remember_address(&mut self, address: &str) -> anyhow::Result<()> {
        let session = &mut self.settings.session;
        if !session.known_addresses.iter().any(|a| a == address) {
            session.known_addresses.push(address.to_string());
        }
        session.last_connected_address = Some(address.to_string());
        self.save()
    }
}
