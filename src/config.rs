//! Configuration management for tsbridge.
//!
//! Settings are layered from these sources, later ones overriding earlier:
//! 1. Default configuration (embedded in the binary)
//! 2. System-wide configuration file (`/etc/tsbridge/config.toml`)
//! 3. User-specified configuration file (`--config`)
//! 4. Environment variables (`TSBRIDGE_` prefix, `__` between nested keys,
//!    e.g. `TSBRIDGE_CONNECTIONS__LOCAL__DRIVER=rrd`)
//! 5. Command-line arguments
//!
//! # Credentials
//!
//! Credentials never come from configuration files. For a connection named
//! `influx` they are read from:
//! - `TSBRIDGE_INFLUX_USERNAME`
//! - `TSBRIDGE_INFLUX_PASSWORD`
//!
//! falling back to `--username`/`--password` for the selected connection.

use crate::error::{ClientError, Result};
use clap::Args;
use config::{Config, ConfigError};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use tsbridge_core::config::{ConnectionConfig, Credentials};

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const DEFAULT_CONFIG_PATH: &str = "/etc/tsbridge/config.toml";
const ENV_PREFIX: &str = "TSBRIDGE";

/// Global command-line options shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Named connection to use instead of the configured default
    #[arg(long, env = "TSBRIDGE_CONNECTION", global = true)]
    pub connection: Option<String>,

    /// Driver for the selected connection
    #[arg(long, global = true)]
    pub driver: Option<String>,

    /// Connection string (URL or directory) for the selected connection
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Driver options for the selected connection (key=value pairs)
    #[arg(long = "option", value_name = "KEY=VALUE", global = true)]
    pub options: Vec<String>,

    /// Username for the selected connection
    #[arg(long, global = true)]
    pub username: Option<String>,

    /// Password or token for the selected connection
    #[arg(long, global = true)]
    pub password: Option<String>,
}

/// Complete client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Connection used when none is named
    pub default: String,
    /// Named connections
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut connections = HashMap::new();
        connections.insert("local".to_string(), ConnectionConfig::new("null", ""));
        Self {
            default: "local".to_string(),
            connections,
        }
    }
}

fn parse_options(raw: &[String]) -> HashMap<String, String> {
    raw.iter()
        .filter_map(|opt| opt.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

impl Settings {
    /// Loads configuration from all available sources.
    pub fn new(cli: &CliArgs) -> std::result::Result<Self, ConfigError> {
        let mut builder = Config::builder();

        builder = builder.add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml));

        if let Ok(metadata) = std::fs::metadata(DEFAULT_CONFIG_PATH) {
            if metadata.is_file() {
                builder = builder.add_source(config::File::from(PathBuf::from(DEFAULT_CONFIG_PATH)));
            }
        }

        if let Some(ref config_path) = cli.config {
            builder = builder.add_source(config::File::from(config_path.clone()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

        if let Some(ref name) = cli.connection {
            builder = builder.set_override("default", name.as_str())?;
        }

        // Connection overrides need the resolved default name.
        let mut settings: Settings = builder.build()?.try_deserialize()?;
        let selected = settings.default.clone();

        if cli.driver.is_some() || cli.url.is_some() || !cli.options.is_empty() {
            let entry = settings
                .connections
                .entry(selected.clone())
                .or_insert_with(|| ConnectionConfig::new("", ""));
            if let Some(ref driver) = cli.driver {
                entry.driver = driver.clone();
            }
            if let Some(ref url) = cli.url {
                entry.connection = url.clone();
            }
            entry.options.extend(parse_options(&cli.options));
        }

        for (name, connection) in settings.connections.iter_mut() {
            connection.credentials = Self::load_credentials(name, (name == &selected).then_some(cli));
        }

        Ok(settings)
    }

    /// Credentials for connection `name`.
    /// Priority order (highest to lowest):
    /// 1. Environment variables
    /// 2. Command line arguments (selected connection only)
    fn load_credentials(name: &str, cli: Option<&CliArgs>) -> Option<Credentials> {
        let key = name.to_uppercase().replace(['-', '.'], "_");
        if let (Ok(username), Ok(password)) = (
            env::var(format!("{}_{}_USERNAME", ENV_PREFIX, key)),
            env::var(format!("{}_{}_PASSWORD", ENV_PREFIX, key)),
        ) {
            return Some(Credentials { username, password });
        }

        let cli = cli?;
        match (&cli.username, &cli.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            (None, Some(password)) => Some(Credentials {
                username: String::new(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig> {
        self.connections
            .get(name)
            .ok_or_else(|| ClientError::UnknownConnection(name.to_string()))
    }

    pub fn default_connection(&self) -> Result<&ConnectionConfig> {
        self.connection(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_embedded_defaults() {
        let settings = Settings::new(&CliArgs::default()).unwrap();
        assert_eq!(settings.default, "local");
        assert_eq!(settings.default_connection().unwrap().driver, "null");
    }

    #[test]
    fn test_user_file_and_cli_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[connections.influx]\ndriver = \"influxdb\"\nconnection = \"http://db:8086\"\n\
             options = {{ org = \"acme\", bucket = \"metrics\" }}"
        )
        .unwrap();

        let cli = CliArgs {
            config: Some(file.path().to_path_buf()),
            connection: Some("influx".to_string()),
            options: vec!["bucket=other".to_string(), "malformed".to_string()],
            password: Some("token".to_string()),
            ..CliArgs::default()
        };
        let settings = Settings::new(&cli).unwrap();
        let influx = settings.default_connection().unwrap();
        assert_eq!(influx.driver, "influxdb");
        assert_eq!(influx.option_str("org"), Some("acme"));
        assert_eq!(influx.option_str("bucket"), Some("other"));
        assert_eq!(influx.credentials.as_ref().map(|c| c.password.as_str()), Some("token"));
        assert!(settings.connection("local").unwrap().credentials.is_none());
    }

    #[test]
    fn test_adhoc_connection_from_cli() {
        let cli = CliArgs {
            connection: Some("scratch".to_string()),
            driver: Some("graphite".to_string()),
            url: Some("/tmp/graphite".to_string()),
            ..CliArgs::default()
        };
        let settings = Settings::new(&cli).unwrap();
        let scratch = settings.connection("scratch").unwrap();
        assert_eq!(scratch.driver, "graphite");
        assert_eq!(scratch.connection, "/tmp/graphite");
    }

    #[test]
    fn test_credentials_from_environment() {
        env::set_var("TSBRIDGE_ENV_CREDS_TEST_USERNAME", "reader");
        env::set_var("TSBRIDGE_ENV_CREDS_TEST_PASSWORD", "s3cret");
        let creds = Settings::load_credentials("env-creds-test", None).unwrap();
        assert_eq!(creds.username, "reader");
        assert_eq!(creds.password, "s3cret");
    }

    #[test]
    fn test_unknown_connection() {
        let settings = Settings::default();
        assert!(matches!(
            settings.connection("missing"),
            Err(ClientError::UnknownConnection(_))
        ));
    }
}
