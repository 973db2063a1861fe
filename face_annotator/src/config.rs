use face_inference::{DisplaySize, ModelConfig};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub models: ModelConfig,
    pub camera: CameraConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    /// Size of the overlay surface; the camera resolution when absent.
    #[serde(default)]
    pub display: Option<DisplaySize>,
    #[serde(default)]
    pub overlay: OverlayConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct CameraConfig {
    #[serde(default)]
    pub device_index: i32,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default = "default_first_frame_timeout_ms")]
    pub first_frame_timeout_ms: u64,
    #[serde(default = "default_stream_fps")]
    pub stream_fps: u64,
}

fn default_first_frame_timeout_ms() -> u64 {
    5000
}

fn default_stream_fps() -> u64 {
    30
}

fn fps_to_delay_ms(fps: u64) -> u64 {
    (1000.0 / fps.max(1) as f64).round() as u64
}

impl CameraConfig {
    pub fn get_stream_delay_ms(&self) -> u64 {
        fps_to_delay_ms(self.stream_fps)
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Halt detection after this many failing ticks in a row; 0 never halts.
    #[serde(default)]
    pub max_consecutive_failures: u64,
}

fn default_interval_ms() -> u64 {
    200
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_consecutive_failures: 0,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct OverlayConfig {
    #[serde(default = "default_min_expression_confidence")]
    pub min_expression_confidence: f32,
    #[serde(default = "default_line_width")]
    pub line_width: i32,
    #[serde(default = "default_font_scale")]
    pub font_scale: f64,
}

fn default_min_expression_confidence() -> f32 {
    0.1
}

fn default_line_width() -> i32 {
    2
}

fn default_font_scale() -> f64 {
    0.5
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            min_expression_confidence: default_min_expression_confidence(),
            line_width: default_line_width(),
            font_scale: default_font_scale(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {e}"))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("FA")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    if let Err(e) = config.models.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }
    if config.polling.interval_ms == 0 {
        return Err(config::ConfigError::Message(
            "polling.interval_ms must be positive".into(),
        ));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
server:
  host: 127.0.0.1
  port: 8080
log_level: Debug
models:
  base: ./models
camera:
  device_index: 1
"#;

    fn parse(yaml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let config = parse(BASE);

        assert_eq!(config.server.get_address(), "127.0.0.1:8080");
        assert_eq!(config.log_level.as_str(), "debug");
        assert_eq!(config.camera.device_index, 1);
        assert_eq!(config.camera.first_frame_timeout_ms, 5000);
        assert_eq!(config.polling.interval_ms, 200);
        assert_eq!(config.polling.max_consecutive_failures, 0);
        assert!(config.display.is_none());
        assert!((config.overlay.min_expression_confidence - 0.1).abs() < 1e-6);
        assert_eq!(config.models.detector_input_size, 416);
    }

    #[test]
    fn test_display_section() {
        let config = parse(&format!("{BASE}display:\n  width: 500\n  height: 400\n"));
        assert_eq!(config.display, Some(DisplaySize::new(500, 400)));
    }

    #[test]
    fn test_fps_to_delay_ms() {
        assert_eq!(fps_to_delay_ms(30), 33);
        assert_eq!(fps_to_delay_ms(60), 17);
        assert_eq!(fps_to_delay_ms(0), 1000);
    }

    #[test]
    fn test_log_level_parsing() {
        assert!(matches!(LogLevel::try_from("INFO".to_string()), Ok(LogLevel::Info)));
        assert!(LogLevel::try_from("trace".to_string()).is_err());
    }
}
