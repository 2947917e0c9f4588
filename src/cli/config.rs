//! Command-line interface configuration
//!
//! Settings may be stored in a `wledflasher.toml` file, looked up in the
//! current directory, its parent, and finally the user's configuration
//! directory. Command-line arguments always take precedence.

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::Error;

const CONFIG_FILE_NAME: &str = "wledflasher.toml";

/// A configured, known serial connection
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Name of the serial port used for communication
    pub serial: Option<String>,
}

/// Flashing defaults
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct FlashSettings {
    /// Baud rate to upload with
    pub upload_baud_rate: Option<u32>,
    /// ESP32 bootloader path template
    pub bootloader: Option<String>,
    /// ESP32 partition table
    pub partitions: Option<PathBuf>,
    /// ESP32 OTA data partition
    pub otadata: Option<PathBuf>,
    /// Directory holding `esp32.toml` and `esp8266.toml`
    pub stub_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub connection: Connection,
    #[serde(default)]
    pub flash: FlashSettings,
    /// Path the configuration was loaded from
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load the configuration file, if one exists
    pub fn load() -> Result<Self, Error> {
        match Self::find_config_path()? {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                debug!("No configuration file found");
                Ok(Config::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, Error> {
        let raw = read_to_string(path)
            .map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;

        let mut config = Self::parse(&raw)
            .map_err(|e| Error::InvalidConfig(path.display().to_string(), e))?;
        config.path = Some(path.to_path_buf());
        debug!("Config: {:#?}", &config);

        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| e.message().to_string())
    }

    fn find_config_path() -> Result<Option<PathBuf>, Error> {
        let current_dir = std::env::current_dir()?;

        let local_config = current_dir.join(CONFIG_FILE_NAME);
        if local_config.exists() {
            return Ok(Some(local_config));
        }
        if let Some(parent_folder) = current_dir.parent() {
            let workspace_config = parent_folder.join(CONFIG_FILE_NAME);
            if workspace_config.exists() {
                return Ok(Some(workspace_config));
            }
        }

        Ok(project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME)))
    }
}

/// Where stub loaders and companion files are kept when not configured
pub fn default_data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("me", "wled", "wledflasher")
}
