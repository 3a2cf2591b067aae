//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 of the configuration, used as the run record's identity.
    /// Passwords and the signing key are not part of it.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r##"
source:
  name: source
  driver: sqlite
  database: /tmp/source.db
targets:
  - name: target
    driver: postgres
    host: localhost
    database: clone
    username: app
    password: secret
    extra_params:
      ssl_mode: require
options:
  synchronize_table_schema: DROP_CREATE
  keep_unknown_tables_on_target: false
  migration_table_name: migrations
  chunk_size: 2
  table_anonymization_options:
    users:
      column_mutations:
        - column_name: email
          strategy: MASK
          visible_chars: 2
          mask_char: "#"
run:
  workers: 2
  signing_key: audit-key
"##;

    #[test]
    fn test_load_applies_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.options.synchronize_table_schema, SchemaSyncMode::DropCreate);
        assert!(!config.options.keep_unknown_tables_on_target);
        assert!(!config.options.disable_foreign_key_constraints);
        assert!(config.options.is_migration_table("migrations"));
        assert_eq!(config.options.chunk_size, 2);
        assert!(config.options.table_options("users").is_some());

        assert_eq!(config.run.workers, 2);
        assert_eq!(config.run.retry_attempts, 2);
        assert_eq!(config.run.retry_policy().backoff.as_secs(), 30);
        assert_eq!(config.run.job_timeout().as_secs(), 3600);
        assert_eq!(config.targets[0].param("ssl_mode"), Some("require"));
    }

    #[test]
    fn test_defaults_without_options() {
        let options = SynchronizationOptions::default();
        assert_eq!(options.synchronize_table_schema, SchemaSyncMode::None);
        assert!(options.keep_unknown_tables_on_target);
        assert_eq!(options.chunk_size, 1000);
    }

    #[test]
    fn test_hash_ignores_secrets() {
        let a = Config::from_yaml(YAML).unwrap();
        let b = Config::from_yaml(&YAML.replace("password: secret", "password: other")).unwrap();
        let c = Config::from_yaml(&YAML.replace("chunk_size: 2", "chunk_size: 3")).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash().len(), 64);

        let serialized = serde_yaml::to_string(&a).unwrap();
        assert!(!serialized.contains("secret"));
        assert!(!serialized.contains("audit-key"));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("drop-create".parse::<SchemaSyncMode>().unwrap(), SchemaSyncMode::DropCreate);
        assert_eq!("truncate".parse::<SchemaSyncMode>().unwrap(), SchemaSyncMode::Truncate);
        assert!("merge".parse::<SchemaSyncMode>().is_err());
    }
}
