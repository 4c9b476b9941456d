//! Pool definitions and the `tarn.toml` config model.
//!
//! A [`PoolDefinition`] carries every behaviour-affecting parameter of one
//! pool. Durations are stored as integer milliseconds so a TOML table can
//! specify them directly; the accessor methods hand out [`Duration`]s.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Configuration for a single connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolDefinition {
    /// Connection target, opaque to the pool and handed to the factory.
    pub url: String,
    /// Optional user name handed to the factory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Extra driver properties handed to the factory.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    /// Hard ceiling on live connections (default: 15).
    pub maximum_connection_count: usize,
    /// Connections the prototyper keeps alive even when idle (default: 0).
    pub minimum_connection_count: usize,
    /// Spare (available) connections the prototyper tries to keep (default: 0).
    pub prototype_count: usize,
    /// Maximum connections under construction at once (default: 10).
    pub simultaneous_build_throttle: usize,
    /// Age after which a connection is retired (default: 4h).
    pub maximum_connection_lifetime_ms: u64,
    /// Time a connection may stay checked out before it is killed (default: 5min).
    pub maximum_active_time_ms: u64,
    /// Interval between housekeeping sweeps (default: 30s).
    pub house_keeping_sleep_time_ms: u64,
    /// Active connections younger than this count as "recently started" (default: 40s).
    pub recently_started_threshold_ms: u64,
    /// How long a refusal keeps the pool in the overloaded state (default: 60s).
    pub overload_without_refusal_lifetime_ms: u64,
    /// Statement executed to validate idle connections during housekeeping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub house_keeping_test_sql: Option<String>,
    /// Validate a reused connection before handing it out.
    pub test_before_use: bool,
    /// Validate a released connection before making it available again.
    pub test_after_use: bool,
    /// Error message fragments that mark a connection as unusable.
    pub fatal_errors: Vec<String>,
    /// Log every executed command with its elapsed time.
    pub trace: bool,
    /// Log a summary after every housekeeping sweep at `info`.
    pub verbose: bool,
}

impl Default for PoolDefinition {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: None,
            properties: BTreeMap::new(),
            maximum_connection_count: 15,
            minimum_connection_count: 0,
            prototype_count: 0,
            simultaneous_build_throttle: 10,
            maximum_connection_lifetime_ms: 4 * 60 * 60 * 1000,
            maximum_active_time_ms: 5 * 60 * 1000,
            house_keeping_sleep_time_ms: 30_000,
            recently_started_threshold_ms: 40_000,
            overload_without_refusal_lifetime_ms: 60_000,
            house_keeping_test_sql: None,
            test_before_use: false,
            test_after_use: false,
            fatal_errors: Vec::new(),
            trace: false,
            verbose: false,
        }
    }
}

impl PoolDefinition {
    /// Create a definition for `url` with default limits.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }

    /// Set the minimum and maximum connection counts.
    pub fn with_counts(mut self, minimum: usize, maximum: usize) -> Self {
        self.minimum_connection_count = minimum;
        self.maximum_connection_count = maximum;
        self
    }

    /// Set the spare connection target.
    pub fn with_prototype_count(mut self, count: usize) -> Self {
        self.prototype_count = count;
        self
    }

    /// Set the validation statement used by housekeeping.
    pub fn with_test_sql(mut self, sql: &str) -> Self {
        self.house_keeping_test_sql = Some(sql.to_string());
        self
    }

    /// Add a fatal error fragment.
    pub fn with_fatal_error(mut self, fragment: &str) -> Self {
        self.fatal_errors.push(fragment.to_string());
        self
    }

    pub fn maximum_connection_lifetime(&self) -> Duration {
        Duration::from_millis(self.maximum_connection_lifetime_ms)
    }

    pub fn maximum_active_time(&self) -> Duration {
        Duration::from_millis(self.maximum_active_time_ms)
    }

    pub fn house_keeping_sleep_time(&self) -> Duration {
        Duration::from_millis(self.house_keeping_sleep_time_ms)
    }

    pub fn recently_started_threshold(&self) -> Duration {
        Duration::from_millis(self.recently_started_threshold_ms)
    }

    pub fn overload_without_refusal_lifetime(&self) -> Duration {
        Duration::from_millis(self.overload_without_refusal_lifetime_ms)
    }

    /// Return the first configured fatal fragment contained in `message`.
    pub fn fatal_match(&self, message: &str) -> Option<&str> {
        self.fatal_errors
            .iter()
            .map(String::as_str)
            .find(|fragment| !fragment.is_empty() && message.contains(fragment))
    }

    /// Check the definition for contradictory limits.
    pub fn validate(&self) -> PoolResult<()> {
        if self.maximum_connection_count == 0 {
            return Err(PoolError::InvalidDefinition(
                "maximum_connection_count must be greater than 0".to_string(),
            ));
        }
        if self.minimum_connection_count > self.maximum_connection_count {
            return Err(PoolError::InvalidDefinition(format!(
                "minimum_connection_count ({}) cannot exceed maximum_connection_count ({})",
                self.minimum_connection_count, self.maximum_connection_count
            )));
        }
        if self.prototype_count > self.maximum_connection_count {
            return Err(PoolError::InvalidDefinition(format!(
                "prototype_count ({}) cannot exceed maximum_connection_count ({})",
                self.prototype_count, self.maximum_connection_count
            )));
        }
        if self.simultaneous_build_throttle == 0 {
            return Err(PoolError::InvalidDefinition(
                "simultaneous_build_throttle must be greater than 0".to_string(),
            ));
        }
        if self.house_keeping_sleep_time_ms == 0 {
            return Err(PoolError::InvalidDefinition(
                "house_keeping_sleep_time_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// One `[[pool]]` entry of a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub alias: String,
    #[serde(flatten)]
    pub definition: PoolDefinition,
}

/// The `tarn.toml` file model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolsConfig {
    #[serde(default, rename = "pool")]
    pub pools: Vec<PoolEntry>,
}

impl PoolsConfig {
    pub fn from_file(path: &Path) -> PoolResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PoolError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a config document.
    pub fn from_toml_str(content: &str) -> PoolResult<Self> {
        let config: PoolsConfig =
            toml::from_str(content).map_err(|e| PoolError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> PoolResult<String> {
        toml::to_string_pretty(self).map_err(|e| PoolError::Config(e.to_string()))
    }

    fn validate(&self) -> PoolResult<()> {
        let mut seen = HashSet::new();
        for entry in &self.pools {
            if entry.alias.trim().is_empty() {
                return Err(PoolError::Config("pool alias must not be empty".to_string()));
            }
            if !seen.insert(entry.alias.as_str()) {
                return Err(PoolError::Config(format!(
                    "duplicate pool alias: {}",
                    entry.alias
                )));
            }
            entry.definition.validate().map_err(|e| {
                PoolError::Config(format!("pool {}: {e}", entry.alias))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_defaults() {
        let def = PoolDefinition::default();
        assert_eq!(def.maximum_connection_count, 15);
        assert_eq!(def.minimum_connection_count, 0);
        assert_eq!(def.simultaneous_build_throttle, 10);
        assert_eq!(def.house_keeping_sleep_time(), Duration::from_secs(30));
        assert_eq!(def.maximum_active_time(), Duration::from_secs(300));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_maximum() {
        let def = PoolDefinition::new("mem://db").with_counts(0, 0);
        assert!(matches!(def.validate(), Err(PoolError::InvalidDefinition(_))));
    }

    #[test]
    fn validate_rejects_minimum_above_maximum() {
        let def = PoolDefinition::new("mem://db").with_counts(5, 2);
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("cannot exceed"));
    }

    #[test]
    fn validate_rejects_prototype_above_maximum() {
        let def = PoolDefinition::new("mem://db")
            .with_counts(0, 2)
            .with_prototype_count(3);
        assert!(def.validate().is_err());
    }

    #[test]
    fn fatal_match_finds_fragment() {
        let def = PoolDefinition::new("mem://db")
            .with_fatal_error("connection reset")
            .with_fatal_error("");
        assert_eq!(
            def.fatal_match("io: connection reset by peer"),
            Some("connection reset")
        );
        assert_eq!(def.fatal_match("syntax error"), None);
    }

    #[test]
    fn parse_config_with_partial_tables() {
        let toml_str = r#"
[[pool]]
alias = "primary"
url = "postgres://db.local/app"
maximum_connection_count = 4
house_keeping_test_sql = "SELECT 1"

[[pool]]
alias = "reports"
url = "postgres://replica.local/app"
minimum_connection_count = 1
fatal_errors = ["terminating connection"]
"#;
        let config = PoolsConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.pools.len(), 2);
        assert_eq!(config.pools[0].alias, "primary");
        assert_eq!(config.pools[0].definition.maximum_connection_count, 4);
        assert_eq!(
            config.pools[0].definition.house_keeping_test_sql.as_deref(),
            Some("SELECT 1")
        );
        assert_eq!(config.pools[1].definition.maximum_connection_count, 15);
        assert_eq!(config.pools[1].definition.fatal_errors.len(), 1);
    }

    #[test]
    fn parse_config_rejects_duplicate_alias() {
        let toml_str = r#"
[[pool]]
alias = "primary"
url = "a"

[[pool]]
alias = "primary"
url = "b"
"#;
        let err = PoolsConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("duplicate pool alias"));
    }

    #[test]
    fn parse_config_rejects_invalid_definition() {
        let toml_str = r#"
[[pool]]
alias = "primary"
url = "a"
minimum_connection_count = 9
maximum_connection_count = 3
"#;
        assert!(matches!(
            PoolsConfig::from_toml_str(toml_str),
            Err(PoolError::Config(_))
        ));
    }

    #[test]
    fn config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tarn.toml");
        std::fs::write(&path, "[[pool]]\nalias = \"main\"\nurl = \"mem://x\"\n").unwrap();
        let config = PoolsConfig::from_file(&path).unwrap();
        assert_eq!(config.pools[0].alias, "main");
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = PoolsConfig {
            pools: vec![PoolEntry {
                alias: "main".to_string(),
                definition: PoolDefinition::new("mem://x").with_counts(1, 3),
            }],
        };
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("alias = \"main\""));
        assert_eq!(PoolsConfig::from_toml_str(&text).unwrap(), config);
    }
}
