use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the server.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "callonce".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// A user record served by the simulated directory.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub email: String,
}

/// A team record served by the simulated directory.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TeamRecord {
    pub id: String,
    pub name: String,
    /// The email address of the team owner.
    pub owner: String,
    /// The user ids of all members, possibly with repetitions.
    pub members: Vec<String>,
}

/// Configuration of the simulated upstream directory.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// The time every single upstream fetch takes.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// All known users.
    pub users: Vec<UserRecord>,
    /// All known teams.
    pub teams: Vec<TeamRecord>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        let user = |id: &str, name: &str| UserRecord {
            id: id.into(),
            name: name.into(),
            email: format!("{}@example.com", name.to_lowercase()),
        };

        DirectoryConfig {
            latency: Duration::from_millis(50),
            users: vec![user("1", "Alice"), user("2", "Bob"), user("3", "Carol")],
            teams: vec![TeamRecord {
                id: "core".into(),
                name: "Core".into(),
                owner: "alice@example.com".into(),
                members: vec!["1".into(), "2".into(), "3".into(), "1".into()],
            }],
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The simulated upstream that request handlers load their data from.
    pub directory: DirectoryConfig,

    /// Log every cache hit, miss and dedup at debug level.
    pub log_cache_events: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "127.0.0.1:3021".to_owned(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            directory: DirectoryConfig::default(),
            log_cache_events: false,
        }
    }
}

impl Config {
    /// Return a deserialized [`Config`] from the given path.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3021");
        assert_eq!(cfg.directory.latency, Duration::from_millis(50));
        assert_eq!(cfg.directory.users.len(), 3);
        assert!(!cfg.log_cache_events);
    }

    #[test]
    fn test_partial_config() {
        // Setting individual values must not affect the defaults of sibling sections.
        let yaml = r#"
            bind: 0.0.0.0:8080
            logging:
              level: debug
              format: json
            directory:
              latency: 250ms
            log_cache_events: true
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.bind, "0.0.0.0:8080");
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.enable_backtraces);
        assert_eq!(cfg.directory.latency, Duration::from_millis(250));
        assert_eq!(cfg.directory.users, DirectoryConfig::default().users);
        assert!(cfg.log_cache_events);
    }

    #[test]
    fn test_directory_records() {
        let yaml = r#"
            directory:
              users:
                - id: "7"
                  name: Grace
                  email: grace@example.com
              teams:
                - id: ops
                  name: Operations
                  owner: grace@example.com
                  members: ["7"]
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.directory.users.len(), 1);
        assert_eq!(cfg.directory.teams[0].owner, "grace@example.com");
        assert_eq!(cfg.directory.teams[0].members, vec!["7".to_owned()]);
    }

    #[test]
    fn test_invalid_config() {
        assert!(Config::from_reader("   ".as_bytes()).is_err());

        let yaml = r#"
            logging:
              level: verbose
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }
}
