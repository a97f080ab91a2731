use crate::convert::FilamentProfile;
use crate::error::ConfigError;
use crate::session::SessionOptions;
use crate::socket::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "OCTOPRINT_BRIDGE_";
const APP_DIR: &str = "octoprint-bridge";
const MIN_RECONNECT_DELAY_MS: u64 = 100;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub octoprint: OctoPrintConfig,
    pub features: FeaturesConfig,
    pub filament: FilamentConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OctoPrintConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for OctoPrintConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5000".to_string(),
            api_key: None,
            timeout_secs: 15,
        }
    }
}

impl OctoPrintConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Layer counters and fan speed from the DisplayLayerProgress plugin.
    pub display_layer_progress: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FilamentConfig {
    pub thickness_mm: f64,
    pub density_g_cm3: f64,
}

impl Default for FilamentConfig {
    fn default() -> Self {
        let profile = FilamentProfile::default();
        Self {
            thickness_mm: profile.thickness_mm,
            density_g_cm3: profile.density_g_cm3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub fast_delay_ms: u64,
    pub slow_delay_ms: u64,
    pub fast_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            fast_delay_ms: 5000,
            slow_delay_ms: 15000,
            fast_attempts: 6,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            fast_delay: Duration::from_millis(self.fast_delay_ms),
            slow_delay: Duration::from_millis(self.slow_delay_ms),
            fast_attempts: self.fast_attempts,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match fs::read_to_string(active_config_path()) {
            Ok(raw) => toml::from_str::<Config>(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => return Err(err.into()),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| env::var(format!("{ENV_PREFIX}{name}")).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // OctoPrint settings
        if let Some(val) = lookup("URL") {
            self.octoprint.url = val;
        }
        if let Some(val) = lookup("API_KEY") {
            self.octoprint.api_key = Some(val);
        }
        if let Some(secs) = lookup("TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.octoprint.timeout_secs = secs;
        }

        // Feature flags
        if let Some(val) = lookup("DISPLAY_LAYER_PROGRESS") {
            self.features.display_layer_progress = val.parse().unwrap_or(false);
        }

        // Filament settings
        if let Some(mm) = lookup("FILAMENT_THICKNESS_MM").and_then(|v| v.parse().ok()) {
            self.filament.thickness_mm = mm;
        }
        if let Some(density) = lookup("FILAMENT_DENSITY").and_then(|v| v.parse().ok()) {
            self.filament.density_g_cm3 = density;
        }

        // Reconnect settings
        if let Some(ms) = lookup("RECONNECT_FAST_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.reconnect.fast_delay_ms = ms;
        }
        if let Some(ms) = lookup("RECONNECT_SLOW_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.reconnect.slow_delay_ms = ms;
        }
        if let Some(attempts) = lookup("RECONNECT_FAST_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.reconnect.fast_attempts = attempts;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.octoprint.url.trim();
        if url.is_empty() {
            return Err(invalid("octoprint.url must be set"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(invalid("octoprint.url must start with http:// or https://"));
        }
        if self
            .octoprint
            .api_key
            .as_deref()
            .is_some_and(|key| key.trim().is_empty())
        {
            return Err(invalid("octoprint.api_key must not be blank when set"));
        }
        if self.octoprint.timeout_secs == 0 {
            return Err(invalid("octoprint.timeout_secs must be non-zero"));
        }
        if !is_positive(self.filament.thickness_mm) {
            return Err(invalid("filament.thickness_mm must be > 0"));
        }
        if !is_positive(self.filament.density_g_cm3) {
            return Err(invalid("filament.density_g_cm3 must be > 0"));
        }
        if self.reconnect.fast_delay_ms < MIN_RECONNECT_DELAY_MS
            || self.reconnect.slow_delay_ms < MIN_RECONNECT_DELAY_MS
        {
            return Err(invalid("reconnect delays must be >= 100 ms"));
        }
        if self.reconnect.slow_delay_ms < self.reconnect.fast_delay_ms {
            return Err(invalid(
                "reconnect.slow_delay_ms must be >= reconnect.fast_delay_ms",
            ));
        }
        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            layer_progress: self.features.display_layer_progress,
            filament: FilamentProfile {
                thickness_mm: self.filament.thickness_mm,
                density_g_cm3: self.filament.density_g_cm3,
            },
        }
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        if path.as_ref().exists() {
            return Err(invalid(format!(
                "{} already exists",
                path.as_ref().display()
            )));
        }
        write_toml(path.as_ref(), &Config::default())
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.validate()?;
        write_toml(&active_config_path(), self)
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn write_toml(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let data = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, data)?;
    Ok(())
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{ENV_PREFIX}CONFIG_PATH")) {
        return PathBuf::from(path);
    }
    let base = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| env::var("HOME").map(|home| Path::new(&home).join(".config")))
        .unwrap_or_else(|_| PathBuf::from("."));
    base.join(APP_DIR).join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.octoprint.url, "http://localhost:5000");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [octoprint]
            url = "http://octopi.local"

            [features]
            display_layer_progress = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.octoprint.url, "http://octopi.local");
        assert_eq!(cfg.octoprint.timeout_secs, 15);
        assert!(cfg.session_options().layer_progress);
        assert_eq!(cfg.reconnect.policy(), BackoffPolicy::default());
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = Config::default();
        cfg.apply_overrides(overrides(&[
            ("URL", "https://printer.example.test"),
            ("API_KEY", "abc"),
            ("DISPLAY_LAYER_PROGRESS", "true"),
            ("FILAMENT_THICKNESS_MM", "2.85"),
            ("RECONNECT_FAST_ATTEMPTS", "3"),
            ("TIMEOUT_SECS", "not-a-number"),
        ]));
        assert_eq!(cfg.octoprint.url, "https://printer.example.test");
        assert_eq!(cfg.octoprint.api_key.as_deref(), Some("abc"));
        assert!(cfg.features.display_layer_progress);
        assert_eq!(cfg.filament.thickness_mm, 2.85);
        assert_eq!(cfg.reconnect.fast_attempts, 3);
        assert_eq!(cfg.octoprint.timeout_secs, 15);
    }

    #[test]
    fn validate_rejects_bad_url() {
        let mut cfg = Config::default();
        cfg.octoprint.url = "  ".to_string();
        assert!(cfg.validate().is_err());
        cfg.octoprint.url = "octopi.local:5000".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_api_key_and_zero_timeout() {
        let mut cfg = Config::default();
        cfg.octoprint.api_key = Some(" ".to_string());
        assert!(cfg.validate().is_err());
        cfg.octoprint.api_key = None;
        cfg.octoprint.timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_filament() {
        let mut cfg = Config::default();
        cfg.filament.thickness_mm = 0.0;
        assert!(cfg.validate().is_err());
        cfg.filament.thickness_mm = 1.75;
        cfg.filament.density_g_cm3 = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_reconnect_delays() {
        let mut cfg = Config::default();
        cfg.reconnect.fast_delay_ms = 50;
        assert!(cfg.validate().is_err());

        cfg.reconnect.fast_delay_ms = 5000;
        cfg.reconnect.slow_delay_ms = 1000;
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err}").contains("slow_delay_ms"));
    }

    #[test]
    fn write_default_refuses_to_overwrite() {
        let dir = env::temp_dir().join(format!("octoprint-bridge-test-{}", std::process::id()));
        let path = dir.join("config.toml");
        let _ = fs::remove_file(&path);

        Config::write_default(&path).unwrap();
        let written: Config = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        written.validate().unwrap();
        assert!(Config::write_default(&path).is_err());

        let _ = fs::remove_dir_all(&dir);
    }
}
