//! Configuration loader with layered approach.
//!
//! This module provides the [`ConfigLoader`] for loading configuration from
//! multiple sources: defaults, files, and environment variables.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{ConfigError, IpamdConfig};

/// Default environment prefix.
pub const DEFAULT_ENV_PREFIX: &str = "IPAMD";

/// Configuration loader with layered approach.
///
/// Later layers override earlier ones:
/// 1. Default values
/// 2. Configuration file (TOML or JSON, by extension)
/// 3. Environment variables `PREFIX__SECTION__KEY`
///
/// # Example
///
/// ```no_run
/// use ipamd_config::ConfigLoader;
///
/// # fn main() -> Result<(), ipamd_config::ConfigError> {
/// let config = ConfigLoader::new()
///     .with_dotenv()?
///     .with_optional_file("ipamd.toml")?
///     .with_env_prefix("IPAMD")
///     .load()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConfigLoader {
    config: IpamdConfig,
    env_prefix: Option<String>,
    source: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a new loader starting from defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: IpamdConfig::default(),
            env_prefix: None,
            source: None,
        }
    }

    /// Start with the development preset.
    #[must_use]
    pub fn with_development(mut self) -> Self {
        self.config = IpamdConfig::development();
        self
    }

    /// Start with the production preset.
    #[must_use]
    pub fn with_production(mut self) -> Self {
        self.config = IpamdConfig::production();
        self
    }

    /// Load configuration from a file.
    ///
    /// The format is chosen by extension: `.toml` or `.json`. The file
    /// replaces the current layer; unset fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file is missing, unreadable, has an
    /// unsupported extension, or contains invalid or unknown fields.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::missing_file(path));
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::read(path, e))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        self.config = parse(&content, &extension)?;
        self.source = Some(path.to_path_buf());
        Ok(self)
    }

    /// Load configuration from a file if it exists.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file exists but cannot be loaded.
    pub fn with_optional_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    /// Load configuration from a string in `format` (`toml` or `json`).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if parsing fails.
    ///
    /// # Example
    ///
    /// ```
    /// use ipamd_config::ConfigLoader;
    ///
    /// let toml = r#"
    ///     [security]
    ///     public_operations = ["/ipam.service.v1.SystemService/GetStats"]
    /// "#;
    ///
    /// let config = ConfigLoader::new()
    ///     .with_string(toml, "toml")
    ///     .unwrap()
    ///     .load()
    ///     .unwrap();
    ///
    /// assert_eq!(config.security.public_operations.len(), 1);
    /// ```
    pub fn with_string(mut self, content: &str, format: &str) -> Result<Self, ConfigError> {
        self.config = parse(content, &format.to_lowercase())?;
        Ok(self)
    }

    /// Set the environment variable prefix for overrides.
    ///
    /// Variables use the format `PREFIX__SECTION__KEY`, for example
    /// `IPAMD__SERVER__CALL_TIMEOUT_MS=5000`. List values are comma
    /// separated.
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_uppercase());
        self
    }

    /// Load variables from a `.env` file in the current directory, if any.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Dotenv` if the file exists but is malformed.
    pub fn with_dotenv(self) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(_) => Ok(self),
            Err(e) if e.not_found() => Ok(self),
            Err(e) => Err(e.into()),
        }
    }

    /// Load variables from a specific `.env` file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Dotenv` if the file is missing or malformed.
    pub fn with_dotenv_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        dotenvy::from_path(path)?;
        Ok(self)
    }

    /// Returns the file the current layer came from.
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if an override cannot be parsed or validation
    /// fails.
    pub fn load(mut self) -> Result<IpamdConfig, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            let vars: HashMap<String, String> = env::vars()
                .filter(|(k, _)| k.starts_with(&prefix))
                .collect();
            for (key, value) in vars {
                self.apply_env_var(&key, &value, &prefix)?;
            }
        }

        self.config.validate()?;
        Ok(self.config)
    }

    /// Finalize without environment overrides or validation.
    #[must_use]
    pub fn load_unvalidated(self) -> IpamdConfig {
        self.config
    }

    fn apply_env_var(&mut self, key: &str, value: &str, prefix: &str) -> Result<(), ConfigError> {
        let Some(path) = key
            .strip_prefix(prefix)
            .and_then(|k| k.strip_prefix("__"))
        else {
            return Ok(());
        };

        let parts: Vec<&str> = path.split("__").collect();
        let config = &mut self.config;

        match parts.as_slice() {
            ["SERVER", "BIND_ADDRESS"] => config.server.bind_address = value.to_string(),
            ["SERVER", "CALL_TIMEOUT_MS"] => {
                config.server.call_timeout_ms = parse_u64(key, value)?;
            }

            ["TLS", "ENABLED"] => config.tls.enabled = parse_bool_var(key, value)?,
            ["TLS", "CERT_PATH"] => config.tls.cert_path = optional_path(value),
            ["TLS", "KEY_PATH"] => config.tls.key_path = optional_path(value),
            ["TLS", "CA_PATH"] => config.tls.ca_path = optional_path(value),

            ["SECURITY", "PUBLIC_OPERATIONS"] => {
                config.security.public_operations = parse_list(value);
            }
            ["SECURITY", "AUDIT_SKIP_OPERATIONS"] => {
                config.security.audit_skip_operations = parse_list(value);
            }
            ["SECURITY", "REQUIRE_MUTUAL_TLS"] => {
                config.security.require_mutual_tls = parse_bool_var(key, value)?;
            }

            ["AUDIT", "SERVICE_NAME"] => config.audit.service_name = value.to_string(),
            ["AUDIT", "WRITE_GRACE_MS"] => config.audit.write_grace_ms = parse_u64(key, value)?,

            ["TELEMETRY", "LOGGING", "ENABLED"] => {
                config.telemetry.logging.enabled = parse_bool_var(key, value)?;
            }
            ["TELEMETRY", "LOGGING", "LEVEL"] => {
                config.telemetry.logging.level = value.to_string();
            }
            ["TELEMETRY", "LOGGING", "FORMAT"] => {
                config.telemetry.logging.format = match value.to_lowercase().as_str() {
                    "json" => crate::LogFormat::Json,
                    "pretty" => crate::LogFormat::Pretty,
                    _ => {
                        return Err(ConfigError::env_override(
                            key,
                            "expected 'json' or 'pretty'",
                        ))
                    }
                };
            }
            ["TELEMETRY", "LOGGING", "INCLUDE_LOCATION"] => {
                config.telemetry.logging.include_location = parse_bool_var(key, value)?;
            }
            ["TELEMETRY", "METRICS", "ENABLED"] => {
                config.telemetry.metrics.enabled = parse_bool_var(key, value)?;
            }
            ["TELEMETRY", "METRICS", "ADDR"] => {
                config.telemetry.metrics.addr = value.to_string();
            }

            // Unrelated variables sharing the prefix.
            _ => {}
        }

        Ok(())
    }
}

fn parse(content: &str, format: &str) -> Result<IpamdConfig, ConfigError> {
    match format {
        "toml" => Ok(toml::from_str(content)?),
        "json" => Ok(serde_json::from_str(content)?),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

/// Parse a boolean from a string.
fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_bool_var(key: &str, value: &str) -> Result<bool, ConfigError> {
    parse_bool(value).ok_or_else(|| ConfigError::env_override(key, "expected boolean"))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::env_override(key, "expected integer"))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn optional_path(value: &str) -> Option<PathBuf> {
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_loader_defaults() {
        let config = ConfigLoader::new().load().unwrap();
        assert_eq!(config.server.bind_address, "0.0.0.0:9400");
        assert!(config.security.public_operations.is_empty());
    }

    #[test]
    fn test_loader_with_development() {
        let config = ConfigLoader::new().with_development().load().unwrap();
        assert_eq!(config.telemetry.logging.level, "debug");
        assert_eq!(config.telemetry.logging.format, crate::LogFormat::Pretty);
    }

    #[test]
    fn test_loader_with_string_json() {
        let json = r#"{"server": {"call_timeout_ms": 5000}, "tls": {"enabled": true}}"#;
        let config = ConfigLoader::new()
            .with_string(json, "json")
            .unwrap()
            .load()
            .unwrap();
        assert_eq!(config.server.call_timeout_ms, 5000);
        assert!(config.tls.enabled);
    }

    #[test]
    fn test_loader_rejects_unknown_section() {
        let toml = r#"
            [authorization]
            mode = "rbac"
        "#;
        let result = ConfigLoader::new().with_string(toml, "toml");
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_loader_rejects_unknown_format() {
        let result = ConfigLoader::new().with_string("", "yaml");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_loader_with_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [server]
            bind_address = "127.0.0.1:9500"

            [tls]
            enabled = true
            cert_path = "/etc/ipamd/tls/server.pem"
            key_path = "/etc/ipamd/tls/server.key"
            ca_path = "/etc/ipamd/tls/ca.pem"

            [security]
            public_operations = ["HealthCheck"]
            audit_skip_operations = ["HealthCheck"]

            [audit]
            service_name = "ipam-test"
            write_grace_ms = 250

            [telemetry.logging]
            level = "warn"
            format = "pretty"
            "#
        )
        .unwrap();

        let loader = ConfigLoader::new().with_file(file.path()).unwrap();
        assert_eq!(loader.source(), Some(file.path()));
        let config = loader.load().unwrap();

        assert_eq!(config.server.bind_address, "127.0.0.1:9500");
        assert_eq!(
            config.tls.ca_path.as_deref(),
            Some(Path::new("/etc/ipamd/tls/ca.pem"))
        );
        assert_eq!(config.public_operations(), ["HealthCheck".to_string()]);
        assert_eq!(config.audit.write_grace().as_millis(), 250);
        assert_eq!(config.telemetry.logging.format, crate::LogFormat::Pretty);
    }

    #[test]
    fn test_loader_with_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"audit": {{"service_name": "ipam-json"}}}}"#).unwrap();

        let config = ConfigLoader::new()
            .with_file(file.path())
            .unwrap()
            .load()
            .unwrap();
        assert_eq!(config.audit.service_name, "ipam-json");
    }

    #[test]
    fn test_loader_file_not_found() {
        let result = ConfigLoader::new().with_file("/nonexistent/ipamd.toml");
        assert!(matches!(result, Err(ConfigError::MissingFile { .. })));
    }

    #[test]
    fn test_loader_optional_file_not_found() {
        let config = ConfigLoader::new()
            .with_optional_file("/nonexistent/ipamd.toml")
            .unwrap()
            .load()
            .unwrap();
        assert_eq!(config, IpamdConfig::default());
    }

    #[test]
    fn test_loader_validates() {
        let result = ConfigLoader::new()
            .with_string("[server]\nbind_address = \"nowhere\"", "toml")
            .unwrap()
            .load();
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_dotenv_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "IPAMD_TEST_DOTENV_MARKER=loaded").unwrap();

        ConfigLoader::new().with_dotenv_file(file.path()).unwrap();
        assert_eq!(env::var("IPAMD_TEST_DOTENV_MARKER").unwrap(), "loaded");
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_apply_env_var_server() {
        let mut loader = ConfigLoader::new();
        loader
            .apply_env_var("TEST__SERVER__CALL_TIMEOUT_MS", "1500", "TEST")
            .unwrap();
        loader
            .apply_env_var("TEST__SERVER__BIND_ADDRESS", "10.0.0.5:9400", "TEST")
            .unwrap();
        assert_eq!(loader.config.server.call_timeout_ms, 1500);
        assert_eq!(loader.config.server.bind_address, "10.0.0.5:9400");
    }

    #[test]
    fn test_apply_env_var_lists() {
        let mut loader = ConfigLoader::new();
        loader
            .apply_env_var(
                "TEST__SECURITY__PUBLIC_OPERATIONS",
                "HealthCheck, /ipam.service.v1.SystemService/GetStats,,",
                "TEST",
            )
            .unwrap();
        assert_eq!(
            loader.config.security.public_operations,
            vec!["HealthCheck", "/ipam.service.v1.SystemService/GetStats"]
        );
    }

    #[test]
    fn test_apply_env_var_tls() {
        let mut loader = ConfigLoader::new();
        loader.apply_env_var("TEST__TLS__ENABLED", "yes", "TEST").unwrap();
        loader
            .apply_env_var("TEST__TLS__CA_PATH", "/etc/ipamd/ca.pem", "TEST")
            .unwrap();
        loader.apply_env_var("TEST__TLS__CERT_PATH", "", "TEST").unwrap();
        assert!(loader.config.tls.enabled);
        assert_eq!(
            loader.config.tls.ca_path,
            Some(PathBuf::from("/etc/ipamd/ca.pem"))
        );
        assert!(loader.config.tls.cert_path.is_none());
    }

    #[test]
    fn test_apply_env_var_invalid_values() {
        let mut loader = ConfigLoader::new();
        assert!(loader
            .apply_env_var("TEST__AUDIT__WRITE_GRACE_MS", "soon", "TEST")
            .is_err());
        assert!(loader
            .apply_env_var("TEST__SECURITY__REQUIRE_MUTUAL_TLS", "maybe", "TEST")
            .is_err());
        assert!(loader
            .apply_env_var("TEST__TELEMETRY__LOGGING__FORMAT", "xml", "TEST")
            .is_err());
    }

    #[test]
    fn test_apply_env_var_ignores_unrelated() {
        let mut loader = ConfigLoader::new();
        loader.apply_env_var("TESTING", "1", "TEST").unwrap();
        loader.apply_env_var("TEST__UNKNOWN__KEY", "1", "TEST").unwrap();
        assert_eq!(loader.config, IpamdConfig::default());
    }
}
