//! Configuration file loader.

use std::path::Path;

use super::BalancerConfig;
use crate::error::{ConfigError, ConfigResult};

/// Loads and validates [`BalancerConfig`] files.
#[derive(Debug, Default)]
pub struct ConfigLoader;

impl ConfigLoader {
    /// Create a new configuration loader.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Load configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the TOML is malformed,
    /// or validation fails.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> ConfigResult<BalancerConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.load_str(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or validation fails.
    pub fn load_str(&self, content: &str) -> ConfigResult<BalancerConfig> {
        let config: BalancerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return the defaults if the file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(&self, path: P) -> ConfigResult<BalancerConfig> {
        let path = path.as_ref();
        if path.exists() {
            self.load(path)
        } else {
            Ok(BalancerConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterMode;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_load_from_string() {
        let config = ConfigLoader::new()
            .load_str(
                r#"
            name = "lb-2"
            cluster_mode = "anycast"
            enable_health_checks = true

            [interfaces]
            inbound = "bond0"

            [health]
            interval = "2s"
            timeout = "250ms"

            [ipam]
            ranges = ["10.10.0.0/29", "10.20.0.0/30"]

            [firewall]
            snat_address = "172.16.0.1"
            "#,
            )
            .unwrap();

        assert_eq!(config.name, "lb-2");
        assert_eq!(config.cluster_mode, ClusterMode::Anycast);
        assert!(config.enable_health_checks);
        assert_eq!(config.interfaces.inbound, "bond0");
        assert_eq!(config.interfaces.outbound, "eth1");
        assert_eq!(config.health.timeout, Duration::from_millis(250));
        assert_eq!(config.ipam.ranges.len(), 2);
        assert!(config.firewall.snat_address.is_some());
    }

    #[test]
    fn test_invalid_toml() {
        let result = ConfigLoader::new().load_str("name = [");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_bad_range_rejected() {
        let result = ConfigLoader::new().load_str("[ipam]\nranges = [\"10.0.0.0/99\"]");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validation_runs_on_load() {
        let result = ConfigLoader::new().load_str("name = \"\"");
        assert!(matches!(result, Err(ConfigError::InvalidValue { field: "name", .. })));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = ConfigLoader::new()
            .load_or_default(dir.path().join("missing.toml"))
            .unwrap();
        assert_eq!(config.name, "meridian");
    }

    #[test]
    fn test_load_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meridian.toml");
        std::fs::write(&path, "name = \"from-file\"\n[election]\nlease = \"5s\"\n").unwrap();

        let config = ConfigLoader::new().load(&path).unwrap();
        assert_eq!(config.name, "from-file");
        assert_eq!(config.election.lease, Duration::from_secs(5));
    }
}
