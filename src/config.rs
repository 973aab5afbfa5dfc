use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::TimerMode;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Remote backend; absent means local-only mode
  pub remote: Option<RemoteConfig>,
  /// Where the local database and logs live (defaults to $XDG_DATA_HOME/focusgrid)
  pub data_dir: Option<PathBuf>,
  /// Completed tasks older than this many days are deleted on reload
  pub retention_days: u32,
  pub modes: ModesConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      remote: None,
      data_dir: None,
      retention_days: 7,
      modes: ModesConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Project URL, e.g. https://example.supabase.co
  pub url: String,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
  #[serde(default = "default_refresh_timeout")]
  pub refresh_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
  8
}

fn default_refresh_timeout() -> u64 {
  5
}

impl RemoteConfig {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn refresh_timeout(&self) -> Duration {
    Duration::from_secs(self.refresh_timeout_secs)
  }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct ModeConfig {
  pub work: u32,
  #[serde(rename = "break")]
  pub break_minutes: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModesConfig {
  pub light: ModeConfig,
  pub deep: ModeConfig,
  pub custom: ModeConfig,
}

impl Default for ModesConfig {
  fn default() -> Self {
    Self {
      light: ModeConfig {
        work: 25,
        break_minutes: 5,
      },
      deep: ModeConfig {
        work: 50,
        break_minutes: 10,
      },
      custom: ModeConfig {
        work: 25,
        break_minutes: 5,
      },
    }
  }
}

impl ModesConfig {
  pub fn get(&self, mode: TimerMode) -> ModeConfig {
    match mode {
      TimerMode::Light => self.light,
      TimerMode::Deep => self.deep,
      TimerMode::Custom => self.custom,
    }
  }

  pub fn work_minutes(&self, mode: TimerMode) -> u32 {
    self.get(mode).work
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./focusgrid.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/focusgrid/config.yaml
  ///
  /// With no file at all the defaults apply, which means local-only mode.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("focusgrid.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("focusgrid").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Directory for the local database and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("focusgrid"))
  }

  pub fn retention(&self) -> chrono::Duration {
    chrono::Duration::days(i64::from(self.retention_days))
  }

  /// Get the backend API key from environment variables.
  pub fn get_api_key() -> Result<String> {
    std::env::var("FOCUSGRID_API_KEY")
      .map_err(|_| eyre!("Remote API key not found. Set the FOCUSGRID_API_KEY environment variable."))
  }

  /// Get the sign-in password from environment variables.
  pub fn get_password() -> Result<String> {
    std::env::var("FOCUSGRID_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set the FOCUSGRID_PASSWORD environment variable."))
  }
}
