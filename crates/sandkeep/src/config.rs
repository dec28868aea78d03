//! Configuration for the supervisor.
//!
//! Layered with the `config` crate: built-in defaults, then the TOML file,
//! then `SANDKEEP__SECTION__KEY` environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::gateway::{EnvMapping, HalfStartedPolicy, ProbeMode};
use crate::persist::TransferBackend;

pub const APP_NAME: &str = "sandkeep";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub gateway: GatewayConfig,
    pub readiness: ReadinessConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Remote bucket mount settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Bucket name.
    pub bucket: String,
    /// Local path the bucket is mounted at.
    pub mount_path: String,
    /// S3-compatible endpoint URL. Built from `account_id` when unset.
    pub endpoint: Option<String>,
    /// R2 account id, used to derive the endpoint.
    pub account_id: Option<String>,
    /// Environment variable holding the access key id.
    pub access_key_env: String,
    /// Environment variable holding the secret access key.
    pub secret_key_env: String,
    /// Mount tool binary.
    pub mount_binary: String,
    /// Extra `-o` options passed to the mount tool.
    pub mount_options: Vec<String>,
    /// Where the mount tool's credentials file is written.
    pub passwd_file: String,
    /// Abort boot when the bucket cannot be mounted.
    pub required: bool,
    pub mount_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "moltbot-data".to_string(),
            mount_path: "/data/moltbot".to_string(),
            endpoint: None,
            account_id: None,
            access_key_env: "R2_ACCESS_KEY_ID".to_string(),
            secret_key_env: "R2_SECRET_ACCESS_KEY".to_string(),
            mount_binary: "s3fs".to_string(),
            mount_options: vec!["use_path_request_style".to_string(), "nonempty".to_string()],
            passwd_file: "/etc/sandkeep/passwd-s3fs".to_string(),
            required: false,
            mount_timeout_secs: 60,
        }
    }
}

impl StorageConfig {
    /// Resolve the bucket endpoint, deriving the R2 URL from the account id.
    pub fn resolved_endpoint(&self) -> Option<String> {
        self.endpoint.clone().or_else(|| {
            self.account_id
                .as_ref()
                .map(|id| format!("https://{id}.r2.cloudflarestorage.com"))
        })
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs)
    }
}

/// Sync engine and restore policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Local state directory the gateway writes to.
    pub local_state_dir: String,
    /// Directory under the mount path mirroring the local state.
    pub remote_subdir: String,
    pub interval_secs: u64,
    pub backend: TransferBackend,
    pub rsync_binary: String,
    /// Compare file contents instead of size+mtime.
    pub checksum: bool,
    /// Glob patterns never transferred in either direction.
    pub exclude: Vec<String>,
    /// Files that must exist locally before a push is allowed.
    pub required_files: Vec<String>,
    pub marker_file: String,
    pub transfer_timeout_secs: u64,
    /// Run a final sync when the supervisor shuts down.
    pub on_shutdown: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_state_dir: "/root/.clawdbot".to_string(),
            remote_subdir: "clawdbot".to_string(),
            interval_secs: 300,
            backend: TransferBackend::Rsync,
            rsync_binary: "rsync".to_string(),
            checksum: true,
            exclude: vec![
                "*.lock".to_string(),
                "*.log".to_string(),
                "*.tmp".to_string(),
            ],
            required_files: vec!["clawdbot.json".to_string()],
            marker_file: ".last-sync".to_string(),
            transfer_timeout_secs: 600,
            on_shutdown: true,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// Exclusion patterns plus the marker file, which is written separately.
    pub fn transfer_excludes(&self) -> Vec<String> {
        let mut patterns = self.exclude.clone();
        if !patterns.iter().any(|p| p == &self.marker_file) {
            patterns.push(self.marker_file.clone());
        }
        patterns
    }
}

/// Gateway process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub binary: String,
    pub subcommand: String,
    pub port: u16,
    pub bind: String,
    pub extra_args: Vec<String>,
    pub working_dir: Option<String>,
    /// Literal environment entries applied after `env_map`.
    pub env: std::collections::BTreeMap<String, String>,
    pub env_map: Vec<EnvMapping>,
    /// Target variable whose value is also passed as `--token`.
    pub token_env: String,
    pub stale_lock_files: Vec<String>,
    pub half_started: HalfStartedPolicy,
    /// Lines of gateway output retained for diagnostics.
    pub output_lines: usize,
    pub cli_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            binary: "clawdbot".to_string(),
            subcommand: "gateway".to_string(),
            port: 18789,
            bind: "lan".to_string(),
            extra_args: vec!["--verbose".to_string(), "--allow-unconfigured".to_string()],
            working_dir: None,
            env: Default::default(),
            env_map: EnvMapping::defaults(),
            token_env: "CLAWDBOT_GATEWAY_TOKEN".to_string(),
            stale_lock_files: vec![
                "/tmp/clawdbot-gateway.lock".to_string(),
                "/root/.clawdbot/gateway.lock".to_string(),
            ],
            half_started: HalfStartedPolicy::Wait,
            output_lines: 500,
            cli_timeout_secs: 30,
        }
    }
}

/// Readiness waiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub mode: ProbeMode,
    pub timeout_secs: u64,
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// How long the lifecycle manager waits after starting the gateway.
    pub startup_timeout_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            mode: ProbeMode::Websocket,
            timeout_secs: 15,
            interval_ms: 250,
            probe_timeout_ms: 2000,
            startup_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub bind: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:18790".to_string(),
        }
    }
}

impl AppConfig {
    /// Resolve `~` and environment variables in path-valued settings.
    pub fn expand_paths(&mut self) -> Result<()> {
        self.storage.mount_path = expand_str(&self.storage.mount_path)?;
        self.storage.passwd_file = expand_str(&self.storage.passwd_file)?;
        self.sync.local_state_dir = expand_str(&self.sync.local_state_dir)?;
        if let Some(ref dir) = self.gateway.working_dir {
            self.gateway.working_dir = Some(expand_str(dir)?);
        }
        self.gateway.stale_lock_files = self
            .gateway
            .stale_lock_files
            .iter()
            .map(|p| expand_str(p))
            .collect::<Result<_>>()?;
        Ok(())
    }

    pub fn mount_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.mount_path)
    }

    pub fn local_state_dir(&self) -> PathBuf {
        PathBuf::from(&self.sync.local_state_dir)
    }

    /// Remote mirror of the local state directory.
    pub fn remote_state_dir(&self) -> PathBuf {
        self.mount_path().join(&self.sync.remote_subdir)
    }
}

/// Load the configuration, writing a default file when none exists.
pub fn load_or_init(config_file: &Path, write_default: bool) -> Result<AppConfig> {
    if !config_file.exists() && write_default {
        write_default_config(config_file)?;
    }

    let built = Config::builder()
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(&env_prefix()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;
    config.expand_paths()?;
    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = String::new();
    body.push_str("# Configuration for ");
    body.push_str(APP_NAME);
    body.push('\n');
    body.push_str("# File: ");
    body.push_str(&path.display().to_string());
    body.push_str("\n\n");
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

/// Resolve the config file path from an optional override.
pub fn resolve_config_file(override_path: Option<PathBuf>) -> Result<PathBuf> {
    let config_file = match override_path {
        Some(path) => {
            let expanded = expand_path(path)?;
            if expanded.is_dir() {
                expanded.join("config.toml")
            } else {
                expanded
            }
        }
        None => default_config_dir()?.join("config.toml"),
    };

    if config_file.parent().is_none() {
        return Err(anyhow!("invalid config file path: {config_file:?}"));
    }
    Ok(config_file)
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        Ok(PathBuf::from(expand_str(text)?))
    } else {
        Ok(path)
    }
}

fn expand_str(text: &str) -> Result<String> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(expanded.to_string())
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
