//! Configuration of the holdings store.
//!
//! Values are read from a TOML file and overridden by `HOLDINGS_CONFIG_*` environment
//! variables, with `__` separating nested keys:
//!
//! ```toml
//! [db]
//! host = "localhost"
//! database = "filings"
//! user = "etl"
//! password = "..."
//!
//! [filter]
//! start = "Q2_2013"
//! end = "Q2_2025"
//! ```
//!
//! `HOLDINGS_CONFIG_DB__PASSWORD=...` overrides `db.password`.

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format as _, Toml},
};
use holdings_db::{
    ConnectOptions, FilterTables, IngestOptions, QuarterParseError, QuarterWindow,
    conn::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT},
};

mod redacted;

pub use self::redacted::Redacted;

/// Prefix of the environment variables overriding file values.
pub const ENV_PREFIX: &str = "HOLDINGS_CONFIG_";

/// Full configuration surface consumed by the store.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub tables: TablesConfig,
    #[serde(default)]
    pub filter: FilterWindowConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// Database connection settings.
///
/// `database`, `user` and `password` have no defaults; [`load`] rejects a configuration
/// missing any of them.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DbConfig {
    /// Database host (default: `localhost`)
    #[serde(default = "default_host")]
    pub host: String,
    /// Database port (default: 5432)
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<Redacted<String>>,
    /// Connect timeout in seconds (default: 5)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: None,
            user: None,
            password: None,
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl DbConfig {
    /// Names of the required settings that are absent or empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let present = |value: Option<&str>| value.is_some_and(|value| !value.is_empty());

        let mut missing = Vec::new();
        if !present(self.database.as_deref()) {
            missing.push("database");
        }
        if !present(self.user.as_deref()) {
            missing.push("user");
        }
        if !present(self.password.as_deref().map(String::as_str)) {
            missing.push("password");
        }
        missing
    }

    /// Connection parameters for [`holdings_db::HoldingsStore`].
    pub fn connect_options(&self) -> Result<ConnectOptions, ConfigError> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(ConfigError::MissingDbFields { fields: missing });
        }

        let options = ConnectOptions::new(
            self.host.as_str(),
            self.port,
            self.database.clone().unwrap_or_default(),
            self.user.clone().unwrap_or_default(),
            self.password
                .clone()
                .map(Redacted::into_inner)
                .unwrap_or_default(),
        );
        Ok(options.with_connect_timeout(Duration::from_secs(self.connect_timeout)))
    }
}

/// Names of the tables the store works on.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TablesConfig {
    /// Partitioned holdings table (default: `holdings`)
    #[serde(default = "default_holdings_table")]
    pub holdings: String,
    /// Ticker mapping table (default: `ticker_to_cusip`)
    #[serde(default = "default_ticker_mapping_table")]
    pub ticker_mapping: String,
    /// Filter run target (default: `holdings_filtered_new`)
    #[serde(default = "default_filtered_table")]
    pub filtered: String,
    /// Daily price table (default: `ticker_prices`)
    #[serde(default = "default_prices_table")]
    pub prices: String,
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            holdings: default_holdings_table(),
            ticker_mapping: default_ticker_mapping_table(),
            filtered: default_filtered_table(),
            prices: default_prices_table(),
        }
    }
}

impl TablesConfig {
    pub fn filter_tables(&self) -> FilterTables {
        FilterTables::new(&self.holdings, &self.ticker_mapping, &self.filtered)
    }
}

/// Inclusive quarter window of a filter run, as `Q{n}_{YYYY}` tokens.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct FilterWindowConfig {
    #[serde(default = "default_window_start")]
    pub start: String,
    #[serde(default = "default_window_end")]
    pub end: String,
}

impl Default for FilterWindowConfig {
    fn default() -> Self {
        Self {
            start: default_window_start(),
            end: default_window_end(),
        }
    }
}

impl FilterWindowConfig {
    pub fn window(&self) -> Result<QuarterWindow, ConfigError> {
        QuarterWindow::parse(&self.start, &self.end).map_err(|source| ConfigError::InvalidWindow {
            start: self.start.clone(),
            end: self.end.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct IngestConfig {
    /// Rewrite value per share with the quarter median after loading (default: false)
    #[serde(default)]
    pub median_value_correction: bool,
}

impl IngestConfig {
    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            median_value_correction: self.median_value_correction,
        }
    }
}

/// Errors that occur when loading the configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file or environment could not be read or has the wrong shape
    #[error("Failed to load configuration")]
    Figment(#[source] Box<figment::Error>),

    /// Required database settings are absent
    #[error("Missing required database settings: {}", fields.join(", "))]
    MissingDbFields { fields: Vec<&'static str> },

    /// The filter window bounds are not valid quarter tokens
    #[error("Invalid filter window '{start}'..'{end}'")]
    InvalidWindow {
        start: String,
        end: String,
        #[source]
        source: QuarterParseError,
    },
}

/// Loads the configuration from `config_path` (which may not exist) and the environment.
///
/// Environment variables take precedence over the file. Missing database settings are
/// reported together, and the filter window is checked to parse.
pub fn load(config_path: &Path) -> Result<Config, ConfigError> {
    let config: Config = Figment::new()
        .merge(Toml::file(config_path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|err| ConfigError::Figment(Box::new(err)))?;

    let missing = config.db.missing_fields();
    if !missing.is_empty() {
        return Err(ConfigError::MissingDbFields { fields: missing });
    }
    config.filter.window()?;

    Ok(config)
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_holdings_table() -> String {
    "holdings".to_string()
}

fn default_ticker_mapping_table() -> String {
    "ticker_to_cusip".to_string()
}

fn default_filtered_table() -> String {
    "holdings_filtered_new".to_string()
}

fn default_prices_table() -> String {
    "ticker_prices".to_string()
}

fn default_window_start() -> String {
    "Q2_2013".to_string()
}

fn default_window_end() -> String {
    "Q2_2025".to_string()
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn file_values_and_defaults_are_combined() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "holdings.toml",
                indoc::indoc! {r#"
                    [db]
                    host = "db.internal"
                    database = "filings"
                    user = "etl"
                    password = "secret"

                    [ingest]
                    median_value_correction = true
                    "#},
            )?;

            let config = load(Path::new("holdings.toml")).expect("valid config");

            assert_eq!(config.db.host, "db.internal");
            assert_eq!(config.db.port, 5432);
            assert_eq!(config.db.connect_timeout, 5);
            assert_eq!(config.tables.holdings, "holdings");
            assert_eq!(config.tables.ticker_mapping, "ticker_to_cusip");
            assert_eq!(config.tables.filtered, "holdings_filtered_new");
            assert_eq!(config.tables.prices, "ticker_prices");
            assert!(config.ingest.ingest_options().median_value_correction);

            let window = config.filter.window().expect("default window parses");
            assert_eq!(window.start().to_string(), "Q2_2013");
            assert_eq!(window.end().to_string(), "Q2_2025");
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "holdings.toml",
                indoc::indoc! {r#"
                    [db]
                    database = "filings"
                    user = "etl"
                    password = "from-file"
                    "#},
            )?;
            jail.set_env("HOLDINGS_CONFIG_DB__PASSWORD", "from-env");
            jail.set_env("HOLDINGS_CONFIG_DB__PORT", "6543");
            jail.set_env("HOLDINGS_CONFIG_FILTER__START", "Q1_2020");

            let config = load(Path::new("holdings.toml")).expect("valid config");
            let options = config.db.connect_options().expect("complete db settings");

            assert_eq!(options.password, "from-env");
            assert_eq!(options.port, 6543);
            assert_eq!(config.filter.start, "Q1_2020");
            Ok(())
        });
    }

    #[test]
    fn missing_db_settings_are_reported_together() {
        Jail::expect_with(|jail| {
            jail.create_file("holdings.toml", "[db]\nuser = \"etl\"\npassword = \"\"\n")?;

            let err = load(Path::new("holdings.toml")).expect_err("incomplete db settings");

            assert!(matches!(
                &err,
                ConfigError::MissingDbFields { fields } if fields == &["database", "password"]
            ));
            assert_eq!(
                err.to_string(),
                "Missing required database settings: database, password"
            );
            Ok(())
        });
    }

    #[test]
    fn invalid_window_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("HOLDINGS_CONFIG_DB__DATABASE", "filings");
            jail.set_env("HOLDINGS_CONFIG_DB__USER", "etl");
            jail.set_env("HOLDINGS_CONFIG_DB__PASSWORD", "secret");
            jail.set_env("HOLDINGS_CONFIG_FILTER__END", "Q5_2025");

            let err = load(Path::new("missing.toml")).expect_err("invalid quarter token");

            assert!(matches!(err, ConfigError::InvalidWindow { .. }));
            Ok(())
        });
    }

    #[test]
    fn debug_output_hides_password() {
        let db = DbConfig {
            password: Some(Redacted::from("hunter2".to_string())),
            ..DbConfig::default()
        };

        assert!(!format!("{db:?}").contains("hunter2"));
    }
}
