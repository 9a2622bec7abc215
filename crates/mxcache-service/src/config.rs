use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

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
    /// The log level for the proxy.
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
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: None,
            prefix: "mxcache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Errors in the proxy configuration that prevent it from serving requests.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for environment variable {name}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("upstream server required: set `upstream` or the MATRIX_SERVER environment variable")]
    MissingUpstream,

    #[error("upstream server URL {0} cannot be used as a base URL")]
    InvalidUpstream(Url),

    #[error(
        "access token required: set `access_token` or the MATRIX_ACCESS_TOKEN environment variable"
    )]
    MissingAccessToken,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Base URL of the homeserver all proxied requests are sent to.
    pub upstream: Option<Url>,

    /// The access token appended to every upstream request.
    pub access_token: Option<String>,

    /// How long a cacheable response is served from memory after it completed.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Timeout for establishing a connection to the upstream.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,

    /// Overall timeout for a single upstream request, including reading the body.
    ///
    /// There is no timeout by default: a hung upstream request keeps its cache entry pending,
    /// and all requests coalesced onto it wait with it.
    #[serde(with = "humantime_serde")]
    pub upstream_timeout: Option<Duration>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "0.0.0.0:9009".to_owned(),
            upstream: None,
            access_token: None,
            cache_ttl: Duration::from_secs(60),
            connect_timeout: None,
            upstream_timeout: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
        }
    }
}

impl Config {
    /// Loads the configuration file at `path`, or the defaults if no path is given, and applies
    /// overrides from the process environment.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            )?,
            None => Config::default(),
        };
        config.apply_env(|name| env::var(name).ok())?;
        Ok(config)
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

    /// Overrides settings from environment variables, as looked up by `lookup`.
    ///
    /// Recognized variables are `PORT`, `CACHE_TTL_SECONDS`, `MATRIX_SERVER`,
    /// `MATRIX_ACCESS_TOKEN` and `STATSD_SERVER`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("PORT") {
            let port: u16 = parse_env("PORT", value)?;
            self.bind = format!("0.0.0.0:{port}");
        }
        if let Some(value) = lookup("CACHE_TTL_SECONDS") {
            self.cache_ttl = Duration::from_secs(parse_env("CACHE_TTL_SECONDS", value)?);
        }
        if let Some(value) = lookup("MATRIX_SERVER") {
            self.upstream = Some(parse_env("MATRIX_SERVER", value)?);
        }
        if let Some(value) = lookup("MATRIX_ACCESS_TOKEN") {
            self.access_token = Some(value);
        }
        if let Some(value) = lookup("STATSD_SERVER") {
            self.metrics.statsd = Some(value);
        }
        Ok(())
    }

    /// Checks that the settings required to proxy requests are present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let upstream = self.upstream.as_ref().ok_or(ConfigError::MissingUpstream)?;
        if upstream.cannot_be_a_base() {
            return Err(ConfigError::InvalidUpstream(upstream.clone()));
        }
        match self.access_token.as_deref() {
            Some(token) if !token.is_empty() => Ok(()),
            _ => Err(ConfigError::MissingAccessToken),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    match value.trim().parse() {
        Ok(parsed) => Ok(parsed),
        Err(_) => Err(ConfigError::InvalidEnv { name, value }),
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
    use std::io::Write;

    use super::*;

    fn env_from<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.bind, "0.0.0.0:9009");
        assert_eq!(cfg.cache_ttl, Duration::from_secs(60));
        assert_eq!(cfg.upstream_timeout, None);
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
        assert_eq!(cfg.metrics.prefix, "mxcache");
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
            bind: 127.0.0.1:3000
            upstream: https://matrix.example.org
            access_token: secret
            cache_ttl: 5m
            upstream_timeout: 30s
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3000");
        assert_eq!(
            cfg.upstream.as_ref().map(Url::as_str),
            Some("https://matrix.example.org/")
        );
        assert_eq!(cfg.access_token.as_deref(), Some("secret"));
        assert_eq!(cfg.cache_ttl, Duration::from_secs(300));
        assert_eq!(cfg.upstream_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.connect_timeout, None);
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cache_ttl: 2s").unwrap();

        let cfg = Config::get(Some(file.path())).unwrap();
        assert_eq!(cfg.cache_ttl, Duration::from_secs(2));
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            homeserver:
              federation_port: 8448
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_level() {
        let yaml = r#"
            logging:
              level: chatty
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let yaml = r#"
            bind: 127.0.0.1:3000
            upstream: https://file.example.org
            cache_ttl: 5m
        "#;
        let mut cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        cfg.apply_env(env_from(&[
            ("PORT", "8080"),
            ("CACHE_TTL_SECONDS", "10"),
            ("MATRIX_SERVER", "https://env.example.org"),
            ("MATRIX_ACCESS_TOKEN", "from-env"),
            ("STATSD_SERVER", "127.0.0.1:8125"),
        ]))
        .unwrap();

        assert_eq!(cfg.bind, "0.0.0.0:8080");
        assert_eq!(cfg.cache_ttl, Duration::from_secs(10));
        assert_eq!(
            cfg.upstream.as_ref().map(Url::as_str),
            Some("https://env.example.org/")
        );
        assert_eq!(cfg.access_token.as_deref(), Some("from-env"));
        assert_eq!(cfg.metrics.statsd.as_deref(), Some("127.0.0.1:8125"));
    }

    #[test]
    fn test_env_invalid_value() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_env(env_from(&[("CACHE_TTL_SECONDS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                name: "CACHE_TTL_SECONDS",
                ..
            }
        ));
    }

    #[test]
    fn test_validate_missing_settings() {
        let mut cfg = Config::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingUpstream)));

        cfg.upstream = Some("https://matrix.example.org".parse().unwrap());
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingAccessToken)
        ));

        cfg.access_token = Some(String::new());
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingAccessToken)
        ));

        cfg.access_token = Some("secret".into());
        assert!(cfg.validate().is_ok());

        cfg.upstream = Some("mailto:admin@example.org".parse().unwrap());
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidUpstream(_))
        ));
    }
}
