use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Central server host name or address
  pub host: String,
  #[serde(default = "default_port")]
  pub port: u16,
  /// Talk https to the central server
  #[serde(default)]
  pub tls: bool,
}

fn default_port() -> u16 {
  8080
}

/// Gateway tunables. Every field has a default, so a config file only
/// names the ones it changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
  /// Hard timeout for live calls, in seconds
  pub request_timeout_secs: u64,
  /// Per-attempt timeout during reconciliation, in seconds
  pub sync_timeout_secs: u64,
  /// Period of the background reconciliation trigger, in seconds
  pub sync_interval_secs: u64,
  /// Queued requests attempted per reconciliation pass
  pub sync_batch_size: u32,
  /// Response bodies above this are never cached, in bytes
  pub cache_body_limit: usize,
  /// Response bodies above this are discarded mid-read, in bytes
  pub response_body_limit: usize,
  /// Row cap for the read-cache
  pub cache_max_entries: u32,
  /// Disable to run connectivity-only, with no queue or cache
  pub offline_support: bool,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      request_timeout_secs: 10,
      sync_timeout_secs: 5,
      sync_interval_secs: 30,
      sync_batch_size: 10,
      cache_body_limit: 1024 * 1024,
      response_body_limit: 5 * 1024 * 1024,
      cache_max_entries: 2048,
      offline_support: true,
    }
  }
}

impl GatewayConfig {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn sync_timeout(&self) -> Duration {
    Duration::from_secs(self.sync_timeout_secs)
  }

  pub fn sync_interval(&self) -> Duration {
    Duration::from_secs(self.sync_interval_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./lifeline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/lifeline/config.yaml
  /// 4. ~/.config/lifeline/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/lifeline/config.yaml\n\
                 with at least a server host."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("lifeline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("lifeline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }
}

/// Central-server base address, resolved once at startup and read-only
/// afterwards. The dispatcher uses it to complete relative URLs.
///
/// Layering, strongest last: config file, `LIFELINE_SERVER` environment
/// variable, `--server` command-line flag.
#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
  base_url: Url,
}

impl ResolvedServerConfig {
  pub fn resolve(
    file: &ServerConfig,
    env_override: Option<&str>,
    cli_override: Option<&str>,
  ) -> Result<Self> {
    let base_url = if let Some(raw) = cli_override.or(env_override) {
      Url::parse(raw).map_err(|e| eyre!("Invalid server address {}: {}", raw, e))?
    } else {
      let raw = format!(
        "{}://{}:{}/",
        if file.tls { "https" } else { "http" },
        file.host,
        file.port
      );
      Url::parse(&raw).map_err(|e| eyre!("Invalid server address {}: {}", raw, e))?
    };

    Ok(Self { base_url })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }
}
