use anyhow::{bail, Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Environment variable holding the current pepper.
pub const ENV_PEPPER: &str = "TD_PEPPER";

/// Environment variable holding the previous pepper (rotation grace period).
pub const ENV_PEPPER_PREV: &str = "TD_PEPPER_PREV";

/// Environment variable overriding the device database path.
pub const ENV_DB_PATH: &str = "TRUSTGATE_DB_PATH";

/// Upper bound, in days, for trust durations and retention windows.
pub const MAX_WINDOW_DAYS: u32 = 3650;

/// Top-level configuration (`~/.trustgate/config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    /// Trusted-device token policy and peppers.
    pub trusted_devices: TrustedDeviceConfig,
    /// Where device records live.
    pub storage: StorageConfig,
}

/// Trusted-device policy.
#[derive(Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TrustedDeviceConfig {
    /// HMAC key for new token hashes. Required to issue or rotate trust.
    pub pepper: Option<String>,
    /// Pepper accepted during rotation; matches under it are re-hashed.
    pub previous_pepper: Option<String>,
    /// Lifetime of a new trusted device, in days.
    pub default_duration_days: u32,
    /// Active devices allowed per user before the oldest is evicted.
    pub max_devices_per_user: usize,
    /// Days an expired device is kept before cleanup deletes it.
    pub expired_retention_days: u32,
    /// Days a revoked device is kept before cleanup deletes it.
    pub revoked_retention_days: u32,
}

impl Default for TrustedDeviceConfig {
    fn default() -> Self {
        Self {
            pepper: None,
            previous_pepper: None,
            default_duration_days: 7,
            max_devices_per_user: 10,
            expired_retention_days: 7,
            revoked_retention_days: 30,
        }
    }
}

// Peppers must never reach logs.
impl fmt::Debug for TrustedDeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(value: Option<&str>) -> &'static str {
            if value.is_some() {
                "<redacted>"
            } else {
                "<unset>"
            }
        }
        f.debug_struct("TrustedDeviceConfig")
            .field("pepper", &redact(self.current_pepper()))
            .field("previous_pepper", &redact(self.previous_pepper()))
            .field("default_duration_days", &self.default_duration_days)
            .field("max_devices_per_user", &self.max_devices_per_user)
            .field("expired_retention_days", &self.expired_retention_days)
            .field("revoked_retention_days", &self.revoked_retention_days)
            .finish()
    }
}

impl TrustedDeviceConfig {
    /// Default policy with the given peppers.
    pub fn with_peppers(current: &str, previous: Option<&str>) -> Self {
        Self {
            pepper: Some(current.to_string()),
            previous_pepper: previous.map(str::to_string),
            ..Self::default()
        }
    }

    /// Current pepper; empty strings count as unset.
    pub fn current_pepper(&self) -> Option<&str> {
        self.pepper.as_deref().filter(|p| !p.is_empty())
    }

    /// Previous pepper; empty strings count as unset.
    pub fn previous_pepper(&self) -> Option<&str> {
        self.previous_pepper.as_deref().filter(|p| !p.is_empty())
    }
}

/// Storage location.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path. `~` is expanded.
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "~/.trustgate/trusted_devices.db".into(),
        }
    }
}

impl StorageConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).into_owned())
    }
}

impl Config {
    /// `~/.trustgate/config.toml`, if a home directory can be found.
    pub fn default_path() -> Option<PathBuf> {
        directories::UserDirs::new()
            .map(|dirs| dirs.home_dir().join(".trustgate").join("config.toml"))
    }

    /// Load from `path` (or the default location), then apply environment
    /// overrides. A missing file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);

        let mut config = match path {
            Some(ref p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config: {}", p.display()))?;
                Self::from_toml_str(&raw)
                    .with_context(|| format!("Failed to parse config: {}", p.display()))?
            }
            _ => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Environment wins over the file for peppers and the database path.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(pepper) = lookup(ENV_PEPPER).filter(|v| !v.is_empty()) {
            self.trusted_devices.pepper = Some(pepper);
        }
        if let Some(prev) = lookup(ENV_PEPPER_PREV).filter(|v| !v.is_empty()) {
            self.trusted_devices.previous_pepper = Some(prev);
        }
        if let Some(db_path) = lookup(ENV_DB_PATH).filter(|v| !v.is_empty()) {
            self.storage.db_path = db_path;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let td = &self.trusted_devices;
        if td.max_devices_per_user == 0 {
            bail!("trusted_devices.max_devices_per_user must be at least 1");
        }
        if td.default_duration_days == 0 {
            bail!("trusted_devices.default_duration_days must be at least 1");
        }
        for (key, days) in [
            ("default_duration_days", td.default_duration_days),
            ("expired_retention_days", td.expired_retention_days),
            ("revoked_retention_days", td.revoked_retention_days),
        ] {
            if days > MAX_WINDOW_DAYS {
                bail!("trusted_devices.{key} must be at most {MAX_WINDOW_DAYS} (got {days})");
            }
        }
        if td.current_pepper().is_some() && td.current_pepper() == td.previous_pepper() {
            tracing::warn!("trusted_devices.previous_pepper equals the current pepper");
        }
        Ok(())
    }

    /// JSON Schema of the config file, pretty-printed.
    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_policy() {
        let config = Config::default();
        let td = &config.trusted_devices;
        assert_eq!(td.default_duration_days, 7);
        assert_eq!(td.max_devices_per_user, 10);
        assert_eq!(td.expired_retention_days, 7);
        assert_eq!(td.revoked_retention_days, 30);
        assert!(td.current_pepper().is_none());
    }

    #[test]
    fn parses_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [trusted_devices]
            pepper = "file-pepper"
            max_devices_per_user = 3

            [storage]
            db_path = "/var/lib/trustgate/devices.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.trusted_devices.current_pepper(), Some("file-pepper"));
        assert_eq!(config.trusted_devices.max_devices_per_user, 3);
        assert_eq!(config.trusted_devices.default_duration_days, 7);
        assert_eq!(
            config.storage.resolved_db_path(),
            PathBuf::from("/var/lib/trustgate/devices.db")
        );
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::from_toml_str(
            r#"
            [trusted_devices]
            pepper = "file-pepper"
            "#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_PEPPER, "env-pepper"),
            (ENV_PEPPER_PREV, "old-pepper"),
            (ENV_DB_PATH, "/tmp/devices.db"),
        ]);
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.trusted_devices.current_pepper(), Some("env-pepper"));
        assert_eq!(config.trusted_devices.previous_pepper(), Some("old-pepper"));
        assert_eq!(config.storage.db_path, "/tmp/devices.db");
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut config = Config::default();
        config.trusted_devices.pepper = Some("file-pepper".into());
        config.apply_overrides(|_| Some(String::new()));
        assert_eq!(config.trusted_devices.current_pepper(), Some("file-pepper"));
        assert!(config.trusted_devices.previous_pepper().is_none());
    }

    #[test]
    fn empty_pepper_counts_as_unset() {
        let td = TrustedDeviceConfig::with_peppers("", Some(""));
        assert!(td.current_pepper().is_none());
        assert!(td.previous_pepper().is_none());
    }

    #[test]
    fn debug_output_redacts_peppers() {
        let td = TrustedDeviceConfig::with_peppers("super-secret", Some("older-secret"));
        let rendered = format!("{td:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("older-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn validate_rejects_zero_cap() {
        let mut config = Config::default();
        config.trusted_devices.max_devices_per_user = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_devices_per_user"));
    }

    #[test]
    fn validate_bounds_day_windows() {
        let mut config = Config::default();
        config.trusted_devices.revoked_retention_days = u32::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("revoked_retention_days"));

        let mut config = Config::default();
        config.trusted_devices.default_duration_days = MAX_WINDOW_DAYS + 1;
        assert!(config.validate().is_err());

        config.trusted_devices.default_duration_days = MAX_WINDOW_DAYS;
        config.trusted_devices.expired_retention_days = MAX_WINDOW_DAYS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_rejects_oversized_window() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[trusted_devices]
expired_retention_days = 4000000000
").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn load_reads_explicit_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[trusted_devices]\ndefault_duration_days = 14\n",
        )
        .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.trusted_devices.default_duration_days, 14);
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load(Some(&tmp.path().join("absent.toml"))).unwrap();
        assert_eq!(config.trusted_devices.max_devices_per_user, 10);
    }

    #[test]
    fn load_rejects_malformed_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[trusted_devices\npepper = ").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn schema_mentions_policy_fields() {
        let schema = Config::json_schema().unwrap();
        assert!(schema.contains("max_devices_per_user"));
        assert!(schema.contains("revoked_retention_days"));
    }
}
