//! Configuration model and key store resolution.

use crate::error::{SopskeyError, SopskeyResult};
use directories_next::{BaseDirs, ProjectDirs};
use log::debug;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the tool configuration file location.
pub const CONFIG_ENV: &str = "SOPSKEY_CONFIG";
/// Exact key file override, shared with sops itself.
pub const KEY_FILE_ENV: &str = "SOPS_AGE_KEY_FILE";
const XDG_CONFIG_ENV: &str = "XDG_CONFIG_HOME";
const CONFIG_FILE_NAME: &str = "sopskey.toml";
const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "sopskey";
const APP_NAME: &str = "sopskey";

pub const DEFAULT_RELATIVE_KEY_PATH: &str = "sops/age/keys.txt";
pub const DEFAULT_POLICY_PATH: &str = ".sops.yaml";
pub const DEFAULT_PATH_REGEX: &str = r"kubernetes/secrets/.*\.(ya?ml)$";

/// Snapshot of the process environment relevant to key store resolution.
///
/// Captured once at the operator boundary and handed down explicitly so the
/// provisioning workflow never reads process-wide state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    pub xdg_config_home: Option<PathBuf>,
    pub home: Option<PathBuf>,
    pub sops_age_key_file: Option<PathBuf>,
}

impl Environment {
    pub fn capture() -> Self {
        Self {
            xdg_config_home: non_empty_env(XDG_CONFIG_ENV),
            home: BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf()),
            sops_age_key_file: non_empty_env(KEY_FILE_ENV),
        }
    }
}

fn non_empty_env(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Where the age identity file lives.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KeyStoreCfg {
    /// Exact key file path; takes precedence over every other setting.
    #[serde(default)]
    pub key_file: Option<String>,

    /// Base configuration directory; defaults to `$XDG_CONFIG_HOME` or `~/.config`.
    #[serde(default)]
    pub config_root: Option<String>,

    #[serde(default = "default_relative_path")]
    pub relative_path: String,
}

fn default_relative_path() -> String {
    DEFAULT_RELATIVE_KEY_PATH.to_string()
}

impl Default for KeyStoreCfg {
    fn default() -> Self {
        Self {
            key_file: None,
            config_root: None,
            relative_path: default_relative_path(),
        }
    }
}

/// How to reach the external `age-keygen` binary.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KeygenCfg {
    #[serde(default)]
    pub binary: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for KeygenCfg {
    fn default() -> Self {
        Self {
            binary: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Encryption-policy (`.sops.yaml`) bootstrap settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PolicyCfg {
    #[serde(default = "default_policy_enabled")]
    pub enabled: bool,

    #[serde(default = "default_policy_path")]
    pub path: String,

    #[serde(default = "default_path_regex")]
    pub path_regex: String,
}

fn default_policy_enabled() -> bool {
    true
}

fn default_policy_path() -> String {
    DEFAULT_POLICY_PATH.to_string()
}

fn default_path_regex() -> String {
    DEFAULT_PATH_REGEX.to_string()
}

impl Default for PolicyCfg {
    fn default() -> Self {
        Self {
            enabled: default_policy_enabled(),
            path: default_policy_path(),
            path_regex: default_path_regex(),
        }
    }
}

/// Top-level configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SopskeyConfig {
    #[serde(default)]
    pub keystore: KeyStoreCfg,

    #[serde(default)]
    pub keygen: KeygenCfg,

    #[serde(default)]
    pub policy: PolicyCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Format the configuration file was parsed from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

/// Which rule produced the key file path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationSource {
    ConfiguredKeyFile,
    KeyFileEnv,
    ConfiguredRoot,
    XdgConfigHome,
    HomeDefault,
}

impl LocationSource {
    pub fn describe(self) -> &'static str {
        match self {
            LocationSource::ConfiguredKeyFile => "keystore.key_file",
            LocationSource::KeyFileEnv => KEY_FILE_ENV,
            LocationSource::ConfiguredRoot => "keystore.config_root",
            LocationSource::XdgConfigHome => XDG_CONFIG_ENV,
            LocationSource::HomeDefault => "~/.config",
        }
    }
}

/// Resolved filesystem location of the age identity file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStoreLocation {
    pub key_path: PathBuf,
    pub source: LocationSource,
}

impl KeyStoreLocation {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: path.into(),
            source: LocationSource::ConfiguredKeyFile,
        }
    }

    /// Directory that must exist before the key file is written.
    pub fn parent(&self) -> &Path {
        self.key_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }
}

impl SopskeyConfig {
    /// Per-user location of the tool configuration file.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load configuration when the file exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> SopskeyResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        debug!(
            "no configuration at {}; using built-in defaults",
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            ..Self::default()
        })
    }

    /// Read a config file from disk, detecting TOML or YAML by extension.
    pub fn load<P: AsRef<Path>>(path: P) -> SopskeyResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml")
        );
        let mut cfg = if is_yaml {
            serde_yaml::from_str::<Self>(&contents)?
        } else {
            toml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_yaml {
            ConfigFormat::Yaml
        } else {
            ConfigFormat::Toml
        };

        if cfg.keygen.timeout_secs == 0 {
            return Err(SopskeyError::InvalidConfig(
                "keygen.timeout_secs must be at least 1".to_string(),
            ));
        }

        Ok(cfg)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        let relative = self.keystore.relative_path.trim();
        if relative.is_empty() {
            issues.push("keystore.relative_path must not be empty".to_string());
        } else if Path::new(relative).is_absolute() {
            issues.push(format!(
                "keystore.relative_path must be relative (got {relative}); use keystore.key_file for absolute paths"
            ));
        }

        if let Some(key_file) = non_blank(self.keystore.key_file.as_deref()) {
            if !Path::new(key_file).is_absolute() {
                issues.push(format!(
                    "keystore.key_file must be an absolute path (got {key_file})"
                ));
            }
        }

        if let Some(root) = non_blank(self.keystore.config_root.as_deref()) {
            if !Path::new(root).is_absolute() {
                issues.push(format!(
                    "keystore.config_root must be an absolute path (got {root})"
                ));
            }
        }

        if self.keygen.timeout_secs == 0 {
            issues.push("keygen.timeout_secs must be at least 1".to_string());
        }

        if let Some(binary) = non_blank(self.keygen.binary.as_deref()) {
            if !Path::new(binary).exists() {
                issues.push(format!("keygen.binary does not exist: {binary}"));
            }
        }

        if self.policy.path.trim().is_empty() {
            issues.push("policy.path must not be empty".to_string());
        }

        if let Err(err) = Regex::new(&self.policy.path_regex) {
            issues.push(format!("policy.path_regex is not a valid regex: {err}"));
        }

        issues
    }

    /// Resolve the key file location against the captured environment.
    pub fn keystore_location(&self, env: &Environment) -> SopskeyResult<KeyStoreLocation> {
        if let Some(key_file) = non_blank(self.keystore.key_file.as_deref()) {
            return Ok(KeyStoreLocation {
                key_path: PathBuf::from(key_file),
                source: LocationSource::ConfiguredKeyFile,
            });
        }

        if let Some(key_file) = &env.sops_age_key_file {
            return Ok(KeyStoreLocation {
                key_path: key_file.clone(),
                source: LocationSource::KeyFileEnv,
            });
        }

        let relative = self.keystore.relative_path.trim();
        if relative.is_empty() || Path::new(relative).is_absolute() {
            return Err(SopskeyError::InvalidConfig(format!(
                "keystore.relative_path must be a non-empty relative path (got `{relative}`)"
            )));
        }

        let (root, source) = if let Some(root) = non_blank(self.keystore.config_root.as_deref()) {
            (PathBuf::from(root), LocationSource::ConfiguredRoot)
        } else if let Some(xdg) = &env.xdg_config_home {
            (xdg.clone(), LocationSource::XdgConfigHome)
        } else if let Some(home) = &env.home {
            (home.join(".config"), LocationSource::HomeDefault)
        } else {
            return Err(SopskeyError::InvalidConfig(
                "unable to determine a configuration root; set XDG_CONFIG_HOME or keystore.config_root"
                    .to_string(),
            ));
        };

        Ok(KeyStoreLocation {
            key_path: root.join(relative),
            source,
        })
    }

    /// Translate the stored timeout into a `Duration`.
    pub fn keygen_timeout(&self) -> Duration {
        Duration::from_secs(self.keygen.timeout_secs.max(1))
    }

    /// Optional override for the `age-keygen` path.
    pub fn keygen_binary_path(&self) -> Option<PathBuf> {
        non_blank(self.keygen.binary.as_deref()).map(PathBuf::from)
    }

    /// Encryption-policy file path, relative paths resolved against `base`.
    pub fn policy_path(&self, base: &Path) -> PathBuf {
        let configured = Path::new(self.policy.path.trim());
        if configured.is_absolute() {
            configured.to_path_buf()
        } else {
            base.join(configured)
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Commented TOML template describing every setting with its default.
pub fn bootstrap_template() -> String {
    format!(
        "# sopskey configuration.\n\
         # Every setting is optional; the values below are the built-in defaults.\n\
         \n\
         [keystore]\n\
         # Exact key file path. When unset, SOPS_AGE_KEY_FILE is consulted next.\n\
         # key_file = \"/home/operator/.config/sops/age/keys.txt\"\n\
         # Base directory; defaults to $XDG_CONFIG_HOME, then ~/.config.\n\
         # config_root = \"/home/operator/.config\"\n\
         relative_path = \"{relative}\"\n\
         \n\
         [keygen]\n\
         # Path to age-keygen; defaults to the first match on PATH.\n\
         # binary = \"/usr/bin/age-keygen\"\n\
         timeout_secs = {timeout}\n\
         \n\
         [policy]\n\
         # Write a minimal .sops.yaml when none exists.\n\
         enabled = true\n\
         path = \"{policy}\"\n\
         path_regex = '{regex}'\n",
        relative = DEFAULT_RELATIVE_KEY_PATH,
        timeout = default_timeout_secs(),
        policy = DEFAULT_POLICY_PATH,
        regex = DEFAULT_PATH_REGEX,
    )
}
