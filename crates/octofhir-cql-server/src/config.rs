use octofhir_cql_translator::OutputFormat;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "octofhir-cql.toml";

/// Prefix for environment overrides, e.g. `OCTOFHIR_CQL__SERVER__PORT=9090`.
pub const ENV_PREFIX: &str = "OCTOFHIR_CQL";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub translator: TranslatorSettings,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        self.translator.default_format()?;
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorSettings {
    /// Format produced for batch requests without an `X-TargetFormat` header
    #[serde(default = "default_target_format")]
    pub default_target_format: String,
}

impl Default for TranslatorSettings {
    fn default() -> Self {
        Self {
            default_target_format: default_target_format(),
        }
    }
}

impl TranslatorSettings {
    pub fn default_format(&self) -> Result<OutputFormat, String> {
        self.default_target_format
            .parse()
            .map_err(|_| {
                format!(
                    "translator.default_target_format must be an ELM media type, got '{}'",
                    self.default_target_format
                )
            })
    }
}

fn default_target_format() -> String {
    OutputFormat::ElmJson.media_type().to_string()
}

pub mod loader {
    use super::{AppConfig, DEFAULT_CONFIG_FILE, ENV_PREFIX};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Load from `path` (or the default file) plus environment overrides.
    ///
    /// A missing file is not an error; defaults and the environment apply.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
