use serde::Deserialize;
use std::{fs, time::Duration};

pub const MIN_FORECAST_HOURS: u32 = 12;
pub const MAX_FORECAST_HOURS: u32 = 168;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct NedConfig {
    /// May be left empty in the file and supplied through `NED_API_KEY`.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_ned_base_url")]
    pub base_url: String,
    #[serde(default = "default_forecast_hours")]
    pub forecast_hours: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Retries after the first attempt, as for the QuestDB sink.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl NedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// An existing Home Assistant price sensor used as training target.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceSensorConfig {
    pub ha_base_url: String,
    /// Falls back to `HA_TOKEN` when empty.
    #[serde(default)]
    pub token: String,
    pub entity_id: String,
    #[serde(default = "default_price_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSourceConfig {
    pub http_bind_addr: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    pub auth_bearer_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Fallback formula: price [ct/kWh] = slope * residual load [GW] + intercept.
    #[serde(default = "default_fallback_slope")]
    pub fallback_slope: f64,
    #[serde(default = "default_fallback_intercept_ct")]
    pub fallback_intercept_ct: f64,
    /// Local wall-clock time of the nightly refit, `HH:MM`.
    #[serde(default = "default_autofit_time")]
    pub autofit_time: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_startup_delay_secs")]
    pub startup_delay_secs: u64,
    #[serde(default = "default_training_window_days")]
    pub training_window_days: u32,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default)]
    pub min_r_squared: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            fallback_slope: default_fallback_slope(),
            fallback_intercept_ct: default_fallback_intercept_ct(),
            autofit_time: default_autofit_time(),
            timezone: default_timezone(),
            startup_delay_secs: default_startup_delay_secs(),
            training_window_days: default_training_window_days(),
            min_samples: default_min_samples(),
            min_r_squared: 0.0,
        }
    }
}

impl ModelConfig {
    pub fn autofit_at(&self) -> Result<(u32, u32), ConfigError> {
        let invalid = || ConfigError::Invalid(format!("model.autofit_time '{}' is not HH:MM", self.autofit_time));

        let (h, m) = self.autofit_time.split_once(':').ok_or_else(invalid)?;
        let hour: u32 = h.trim().parse().map_err(|_| invalid())?;
        let minute: u32 = m.trim().parse().map_err(|_| invalid())?;
        if hour > 23 || minute > 59 {
            return Err(invalid());
        }
        Ok((hour, minute))
    }

    pub fn tz(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown time zone '{}'", self.timezone)))
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn training_window(&self) -> time::Duration {
        time::Duration::days(i64::from(self.training_window_days))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestDbConfig {
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Partial batches are written at least this often.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl SinkConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8088".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub ned: NedConfig,
    pub price_sensor: Option<PriceSensorConfig>,
    pub price_ingest: Option<HttpSourceConfig>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    pub questdb: Option<QuestDbConfig>,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("FORECAST_CONFIG").unwrap_or_else(|_| "forecast-config.toml".to_string());
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        let mut cfg = Self::from_toml_str(&contents)?;
        cfg.apply_env(|key| env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Fills secrets left empty in the file from the environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.ned.api_key.trim().is_empty() {
            if let Some(key) = lookup("NED_API_KEY") {
                self.ned.api_key = key;
            }
        }
        if let Some(ps) = self.price_sensor.as_mut() {
            if ps.token.trim().is_empty() {
                if let Some(token) = lookup("HA_TOKEN") {
                    ps.token = token;
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ned.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "ned.api_key is empty and NED_API_KEY is not set".to_string(),
            ));
        }

        if !(MIN_FORECAST_HOURS..=MAX_FORECAST_HOURS).contains(&self.ned.forecast_hours) {
            return Err(ConfigError::Invalid(format!(
                "ned.forecast_hours must be within {MIN_FORECAST_HOURS}..={MAX_FORECAST_HOURS}, got {}",
                self.ned.forecast_hours
            )));
        }

        if self.ned.poll_interval_secs < 60 {
            return Err(ConfigError::Invalid("ned.poll_interval_secs must be at least 60".to_string()));
        }

        if let Some(ps) = &self.price_sensor {
            if ps.entity_id.trim().is_empty() {
                return Err(ConfigError::Invalid("price_sensor.entity_id is empty".to_string()));
            }
            if ps.token.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "price_sensor.token is empty and HA_TOKEN is not set".to_string(),
                ));
            }
        }

        self.model.autofit_at()?;
        self.model.tz()?;

        if self.model.min_samples < 2 {
            return Err(ConfigError::Invalid("model.min_samples must be at least 2".to_string()));
        }

        if self.sink.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid("sink.flush_interval_ms must be positive".to_string()));
        }

        if self.sink.batch_size == 0 {
            return Err(ConfigError::Invalid("sink.batch_size must be positive".to_string()));
        }

        Ok(())
    }
}

fn default_ned_base_url() -> String {
    "https://api.ned.nl".to_string()
}

fn default_forecast_hours() -> u32 {
    144
}

fn default_poll_interval_secs() -> u64 {
    3600
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_price_poll_interval_secs() -> u64 {
    900
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_fallback_slope() -> f64 {
    1.27
}

fn default_fallback_intercept_ct() -> f64 {
    1.5
}

fn default_autofit_time() -> String {
    "02:07".to_string()
}

fn default_timezone() -> String {
    "Europe/Amsterdam".to_string()
}

fn default_startup_delay_secs() -> u64 {
    30
}

fn default_training_window_days() -> u32 {
    30
}

fn default_min_samples() -> usize {
    48
}

fn default_retention_days() -> u32 {
    60
}

fn default_max_connections() -> u32 {
    4
}

fn default_batch_size() -> usize {
    500
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [ned]
        api_key = "secret"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = AppConfig::from_toml_str(MINIMAL).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.ned.base_url, "https://api.ned.nl");
        assert_eq!(cfg.ned.forecast_hours, 144);
        assert_eq!(cfg.ned.poll_interval(), Duration::from_secs(3600));
        assert_eq!(cfg.model.autofit_at().unwrap(), (2, 7));
        assert_eq!(cfg.model.tz().unwrap(), chrono_tz::Europe::Amsterdam);
        assert_eq!(cfg.model.startup_delay(), Duration::from_secs(30));
        assert!(cfg.price_sensor.is_none());
        assert!(cfg.questdb.is_none());
        assert_eq!(cfg.api.bind_addr, "0.0.0.0:8088");
    }

    #[test]
    fn forecast_hours_outside_bounds_are_rejected() {
        for hours in [11, 169] {
            let toml = format!("[ned]\napi_key = \"k\"\nforecast_hours = {hours}\n");
            let cfg = AppConfig::from_toml_str(&toml).unwrap();
            assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))), "hours={hours}");
        }

        for hours in [12, 168] {
            let toml = format!("[ned]\napi_key = \"k\"\nforecast_hours = {hours}\n");
            let cfg = AppConfig::from_toml_str(&toml).unwrap();
            assert!(cfg.validate().is_ok(), "hours={hours}");
        }
    }

    #[test]
    fn api_key_can_come_from_environment() {
        let mut cfg = AppConfig::from_toml_str("[ned]\n").unwrap();
        assert!(cfg.validate().is_err());

        cfg.apply_env(|key| (key == "NED_API_KEY").then(|| "from-env".to_string()));
        assert_eq!(cfg.ned.api_key, "from-env");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn file_api_key_wins_over_environment() {
        let mut cfg = AppConfig::from_toml_str(MINIMAL).unwrap();
        cfg.apply_env(|_| Some("from-env".to_string()));
        assert_eq!(cfg.ned.api_key, "secret");
    }

    #[test]
    fn price_sensor_requires_token() {
        let toml = r#"
            [ned]
            api_key = "k"

            [price_sensor]
            ha_base_url = "http://homeassistant.local:8123"
            entity_id = "sensor.epex_price"
        "#;
        let mut cfg = AppConfig::from_toml_str(toml).unwrap();
        assert!(cfg.validate().is_err());

        cfg.apply_env(|key| (key == "HA_TOKEN").then(|| "t".to_string()));
        cfg.validate().unwrap();
        assert_eq!(cfg.price_sensor.unwrap().poll_interval_secs, 900);
    }

    #[test]
    fn malformed_autofit_time_and_timezone_are_rejected() {
        let mut cfg = AppConfig::from_toml_str(MINIMAL).unwrap();
        cfg.model.autofit_time = "25:00".to_string();
        assert!(cfg.validate().is_err());

        cfg.model.autofit_time = "0207".to_string();
        assert!(cfg.validate().is_err());

        cfg.model.autofit_time = "02:07".to_string();
        cfg.model.timezone = "Mars/Olympus".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_reads_file_named_by_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forecast.toml");
        fs::write(&path, MINIMAL).unwrap();

        std::env::set_var("FORECAST_CONFIG", &path);
        let cfg = AppConfig::load().unwrap();
        std::env::remove_var("FORECAST_CONFIG");

        assert_eq!(cfg.ned.api_key, "secret");
    }
}
