use serde::Deserialize;
use std::{fs, path::PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    pub base_url: String,
    pub token_path: PathBuf,
    #[serde(default = "default_power_table")]
    pub power_table: String,
    #[serde(default = "default_readings_table")]
    pub readings_table: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    pub base_url: String,
    pub api_key_path: PathBuf,
    #[serde(default = "default_latitude")]
    pub latitude: f64,
    #[serde(default = "default_longitude")]
    pub longitude: f64,
    #[serde(default = "default_call_ceiling")]
    pub call_ceiling: u32,
    #[serde(default = "default_forecast_table")]
    pub table: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherConfig {
    /// Directory scanned for dropped CSV exports; files gain an
    /// `.imported` suffix once merged.
    pub import_dir: PathBuf,
    #[serde(default = "default_filton_table")]
    pub filton_table: String,
    #[serde(default = "default_station_table")]
    pub station_table: String,
    /// Web form for fetching per-day Filton CSVs; absent means the
    /// web fetch is skipped.
    #[serde(default)]
    pub filton_form_url: Option<String>,
    #[serde(default)]
    pub filton_base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Irradiance (W/m2) above which zero generation is implausible.
    #[serde(default = "default_decent_irradiance")]
    pub decent_irradiance: f64,
    /// Generation meter codes to check for implausible zeros.
    #[serde(default)]
    pub generation_meters: Vec<String>,
    #[serde(default = "default_latitude")]
    pub latitude: f64,
    #[serde(default = "default_longitude")]
    pub longitude: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            decent_irradiance: default_decent_irradiance(),
            generation_meters: Vec::new(),
            latitude: default_latitude(),
            longitude: default_longitude(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub platform: PlatformConfig,
    pub forecast: Option<ForecastConfig>,
    pub weather: WeatherConfig,
    #[serde(default)]
    pub detector: Option<DetectorConfig>,
    #[serde(default)]
    pub sink: Option<SinkConfig>,
    pub metrics: Option<MetricsConfig>,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_report_log")]
    pub report_log_path: PathBuf,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("INGEST_CONFIG").unwrap_or_else(|_| "ingest-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        let cfg: AppConfig = toml::from_str(&contents)?;
        Ok(cfg)
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_power_table() -> String {
    "power".to_string()
}

fn default_readings_table() -> String {
    "readings".to_string()
}

fn default_latitude() -> f64 {
    51.459
}

fn default_longitude() -> f64 {
    -2.602
}

fn default_call_ceiling() -> u32 {
    1000
}

fn default_forecast_table() -> String {
    "weather_forecast".to_string()
}

fn default_filton_table() -> String {
    "weather_filton".to_string()
}

fn default_station_table() -> String {
    "weather_create_centre".to_string()
}

fn default_decent_irradiance() -> f64 {
    10.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_report_log() -> PathBuf {
    PathBuf::from("ingest-report.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let toml = r#"
            [database]
            uri = "postgres://localhost/bec"

            [platform]
            base_url = "https://platform.example/a"
            token_path = "/etc/bec/token"

            [weather]
            import_dir = "/var/lib/bec/incoming"
        "#;
        let cfg: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.database.max_connections, 5);
        assert_eq!(cfg.platform.power_table, "power");
        assert_eq!(cfg.weather.filton_table, "weather_filton");
        assert!(cfg.forecast.is_none());
        assert!(cfg.metrics.is_none());
        assert_eq!(cfg.http_timeout_secs, 30);
    }

    #[test]
    fn detector_defaults_match_the_site() {
        let toml = r#"
            decent_irradiance = 25.0
            generation_meters = ["pv2_gen", "hh1"]
        "#;
        let cfg: DetectorConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.decent_irradiance, 25.0);
        assert_eq!(cfg.latitude, 51.459);
    }
}
