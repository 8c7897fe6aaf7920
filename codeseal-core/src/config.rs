//! Installation configuration
//!
//! Resolution order:
//! 1. Explicit config file path (CLI `--config`)
//! 2. `<server root>/config/codeseal.yml`
//! 3. `codeseal.yml` in the platform config directory
//! 4. Built-in defaults
//!
//! `CODESEAL_RELEASE_CHANNEL` and `CODESEAL_CHECK_DISABLED` override the
//! loaded values.

use crate::walker::absolute_path;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const CONFIG_FILE_NAME: &str = "codeseal.yml";

pub const ENV_RELEASE_CHANNEL: &str = "CODESEAL_RELEASE_CHANNEL";
pub const ENV_CHECK_DISABLED: &str = "CODESEAL_CHECK_DISABLED";

/// Default trust anchor bundle below the server root
pub const DEFAULT_TRUST_ANCHOR: &str = "resources/codesigning/root.crt";

/// Release channels built from source control; never signed
const UNSIGNED_CHANNELS: &[&str] = &["", "git"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Root directory of the platform installation
    pub server_root: PathBuf,

    /// Release channel of the installation (`stable`, `beta`, `daily`, `git`)
    pub release_channel: String,

    /// Skip enforcement regardless of channel
    pub check_disabled: bool,

    /// Directories holding installed apps; relative entries resolve against `server_root`
    pub app_roots: Vec<PathBuf>,

    /// Custom data directory, excluded from the core digest
    pub data_directory: Option<PathBuf>,

    /// PEM bundle of trusted root certificates
    pub trust_anchor: Option<PathBuf>,

    /// JSON file holding stored verification results
    pub result_store: Option<PathBuf>,

    /// Components treated as shipped in addition to `core/shipped.json`
    pub shipped_components: Vec<String>,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        IntegrityConfig {
            server_root: PathBuf::from("."),
            release_channel: "stable".to_string(),
            check_disabled: false,
            app_roots: vec![PathBuf::from("apps")],
            data_directory: None,
            trust_anchor: None,
            result_store: None,
            shipped_components: Vec::new(),
        }
    }
}

impl IntegrityConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: IntegrityConfig = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        debug!("Loaded integrity config from {:?}", path);
        Ok(config)
    }

    /// Locate and load the configuration, then apply environment overrides
    ///
    /// `server_root` from the command line wins over the file's value.
    pub fn discover(cli_config: Option<&Path>, server_root: Option<&Path>) -> Result<Self> {
        let mut config = match Self::find_config_file(cli_config, server_root)? {
            Some(path) => {
                info!("Using integrity config {:?}", path);
                Self::load(&path)?
            }
            None => {
                debug!("No integrity config found, using defaults");
                IntegrityConfig::default()
            }
        };

        if let Some(root) = server_root {
            config.server_root = root.to_path_buf();
        }
        config.resolve_server_root();
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Make `server_root` absolute
    ///
    /// Relative app roots, data directory, trust anchor and result store are
    /// joined onto the server root, so they become absolute as well and match
    /// the paths the tree walk yields.
    pub fn resolve_server_root(&mut self) {
        let resolved = absolute_path(&self.server_root);
        if resolved != self.server_root {
            debug!("Resolved server root {:?} to {:?}", self.server_root, resolved);
            self.server_root = resolved;
        }
    }

    fn find_config_file(cli_config: Option<&Path>, server_root: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = cli_config {
            if !path.exists() {
                return Err(anyhow::anyhow!("Config file does not exist: {}", path.display()));
            }
            return Ok(Some(path.to_path_buf()));
        }

        let root = server_root.unwrap_or_else(|| Path::new("."));
        let installation = root.join("config").join(CONFIG_FILE_NAME);
        if installation.exists() {
            return Ok(Some(installation));
        }

        if let Some(dirs) = ProjectDirs::from("", "", "codeseal") {
            let user = dirs.config_dir().join(CONFIG_FILE_NAME);
            if user.exists() {
                return Ok(Some(user));
            }
        }

        Ok(None)
    }

    /// Apply overrides from a variable lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(channel) = lookup(ENV_RELEASE_CHANNEL) {
            debug!("Release channel overridden by environment: {}", channel);
            self.release_channel = channel;
        }
        if let Some(raw) = lookup(ENV_CHECK_DISABLED) {
            match parse_flag(&raw) {
                Some(disabled) => self.check_disabled = disabled,
                None => warn!("Ignoring {}={}: expected a boolean", ENV_CHECK_DISABLED, raw),
            }
        }
    }

    pub fn policy(&self) -> EnforcementPolicy {
        EnforcementPolicy::new(self.release_channel.clone(), self.check_disabled)
    }

    pub fn app_roots(&self) -> Vec<PathBuf> {
        self.app_roots.iter().map(|p| self.resolve(p)).collect()
    }

    pub fn data_directory(&self) -> Option<PathBuf> {
        self.data_directory.as_deref().map(|p| self.resolve(p))
    }

    pub fn trust_anchor_path(&self) -> PathBuf {
        match &self.trust_anchor {
            Some(path) => self.resolve(path),
            None => self.server_root.join(DEFAULT_TRUST_ANCHOR),
        }
    }

    /// Result store file; defaults to the platform data directory
    pub fn result_store_path(&self) -> PathBuf {
        if let Some(path) = &self.result_store {
            return self.resolve(path);
        }
        match ProjectDirs::from("", "", "codeseal") {
            Some(dirs) => dirs.data_dir().join("results.json"),
            None => self.server_root.join("data").join("codeseal-results.json"),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.server_root.join(path)
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Whether integrity checks run on this installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforcementPolicy {
    pub release_channel: String,
    pub check_disabled: bool,
}

impl EnforcementPolicy {
    pub fn new(release_channel: impl Into<String>, check_disabled: bool) -> Self {
        EnforcementPolicy {
            release_channel: release_channel.into(),
            check_disabled,
        }
    }

    /// Source checkouts are unsigned, so the check is off for them
    pub fn is_enforced(&self) -> bool {
        !self.check_disabled && !UNSIGNED_CHANNELS.contains(&self.release_channel.as_str())
    }
}
