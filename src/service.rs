//! Service descriptors and their classification.
//!
//! A `ServiceDescriptor` is what the configuration layer hands to the control
//! plane: a name, the command to supervise, its environment and whether it
//! is enabled. `DataServices` is the ordered allow-list of services that back
//! persistent state and therefore start first and stop last.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

/// Data-oriented services in declared order. Later entries are dependencies
/// of earlier ones, so startup walks this list in reverse.
pub const DEFAULT_DATA_SERVICES: &[&str] = &[
    "minio",
    "openldap",
    "gitaly",
    "praefect",
    "redis",
    "redis-cluster",
    "postgresql-geo",
    "postgresql",
    "clickhouse",
];

/// Specification for a service to be supervised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Directory name under `sv/` and `services/`.
    pub name: String,
    /// Shell command the `run` script execs.
    pub command: String,
    /// Environment exported before the command runs.
    pub env: BTreeMap<String, String>,
    /// Disabled services are not rendered and their links are pruned.
    pub enabled: bool,
    /// Printed once the service has been started.
    pub ready_message: Option<String>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            env: BTreeMap::new(),
            enabled: true,
            ready_message: None,
        }
    }

    /// Returns the first environment key that is not `^[A-Z_]+$`.
    pub fn invalid_env_key(&self) -> Option<&str> {
        self.env
            .keys()
            .find(|key| !is_valid_env_key(key))
            .map(String::as_str)
    }
}

pub fn is_valid_env_key(key: &str) -> bool {
    static ENV_KEY: OnceLock<Regex> = OnceLock::new();
    ENV_KEY
        .get_or_init(|| Regex::new(r"^[A-Z_]+$").expect("env key pattern is valid"))
        .is_match(key)
}

/// Ordered allow-list of data-oriented service names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataServices {
    names: Vec<String>,
}

impl Default for DataServices {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_SERVICES.iter().map(|name| name.to_string()))
    }
}

impl DataServices {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            names: names.into_iter().collect(),
        }
    }

    pub fn is_data_oriented(&self, name: &str) -> bool {
        self.names.iter().any(|candidate| candidate == name)
    }

    /// Allow-list entries present in `available`, in declared order.
    pub fn present<'a>(&'a self, available: &'a [String]) -> impl Iterator<Item = &'a str> + 'a {
        self.names
            .iter()
            .filter(move |name| available.iter().any(|have| have == *name))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_keys_must_be_upper_snake() {
        assert!(is_valid_env_key("PGHOST"));
        assert!(is_valid_env_key("RAILS_ENV"));
        assert!(!is_valid_env_key("pghost"));
        assert!(!is_valid_env_key("S3_BUCKET"));
        assert!(!is_valid_env_key("A-B"));
        assert!(!is_valid_env_key(""));
    }

    #[test]
    fn invalid_env_key_reports_offender() {
        let mut service = ServiceDescriptor::new("redis", "redis-server");
        service.env.insert("GOOD".into(), "1".into());
        assert_eq!(service.invalid_env_key(), None);
        service.env.insert("bad-key".into(), "2".into());
        assert_eq!(service.invalid_env_key(), Some("bad-key"));
    }

    #[test]
    fn present_keeps_declared_order() {
        let data = DataServices::default();
        let available = vec![
            "postgresql".to_string(),
            "rails-web".to_string(),
            "redis".to_string(),
        ];
        let present: Vec<&str> = data.present(&available).collect();
        assert_eq!(present, vec!["redis", "postgresql"]);
        assert!(data.is_data_oriented("postgresql"));
        assert!(!data.is_data_oriented("rails-web"));
    }
}
