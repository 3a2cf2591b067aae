//! Configuration validation.

use std::collections::HashSet;

use super::Config;
use crate::anonymize::Mutation;
use crate::core::connection::ConnectionDescriptor;
use crate::error::{CloneError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_descriptor("source", &config.source)?;

    if config.targets.is_empty() {
        return Err(CloneError::Config("at least one target is required".into()));
    }
    let mut names = HashSet::from([config.source.name.as_str()]);
    for (i, target) in config.targets.iter().enumerate() {
        validate_descriptor(&format!("targets[{}]", i), target)?;
        if !names.insert(target.name.as_str()) {
            return Err(CloneError::Config(format!(
                "connection name '{}' is used more than once",
                target.name
            )));
        }
    }

    if config.options.chunk_size == 0 {
        return Err(CloneError::Config(
            "options.chunk_size must be at least 1".into(),
        ));
    }
    if config.run.workers == 0 {
        return Err(CloneError::Config("run.workers must be at least 1".into()));
    }
    if config.run.retry_attempts == 0 {
        return Err(CloneError::Config(
            "run.retry_attempts must be at least 1".into(),
        ));
    }
    if config.run.job_timeout_secs == 0 {
        return Err(CloneError::Config(
            "run.job_timeout_secs must be at least 1".into(),
        ));
    }

    for (table, options) in &config.options.table_anonymization_options {
        if let Some(selection) = &options.row_selection {
            if selection.limit == 0 {
                return Err(CloneError::Config(format!(
                    "row_selection.limit for {} must be at least 1",
                    table
                )));
            }
        }
        for m in &options.column_mutations {
            if m.column_name.is_empty() {
                return Err(CloneError::Config(format!(
                    "column mutation on {} has an empty column_name",
                    table
                )));
            }
            match &m.mutation {
                Mutation::Mask { mask_char, .. } if mask_char.chars().count() != 1 => {
                    return Err(CloneError::Config(format!(
                        "mask_char for {}.{} must be exactly one character",
                        table, m.column_name
                    )));
                }
                Mutation::Fake { category } if category.trim().is_empty() => {
                    return Err(CloneError::Config(format!(
                        "fake category for {}.{} is required",
                        table, m.column_name
                    )));
                }
                _ => {}
            }
        }
    }

    Ok(())
}

fn validate_descriptor(field: &str, descriptor: &ConnectionDescriptor) -> Result<()> {
    if descriptor.name.trim().is_empty() {
        return Err(CloneError::Config(format!("{}.name is required", field)));
    }
    if descriptor.driver_kind.is_networked() && descriptor.host.is_empty() {
        return Err(CloneError::Config(format!("{}.host is required", field)));
    }
    if descriptor.database.is_empty() {
        return Err(CloneError::Config(format!(
            "{}.database is required",
            field
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::Config;

    const BASE: &str = r#"
source:
  name: prod
  driver: mysql
  host: db.internal
  database: shop
  username: reader
  password: secret
targets:
  - name: staging
    driver: sqlite
    database: /tmp/staging.db
"#;

    fn with(extra: &str) -> String {
        format!("{}{}", BASE, extra)
    }

    #[test]
    fn test_minimal_config_is_valid() {
        assert!(Config::from_yaml(BASE).is_ok());
    }

    #[test]
    fn test_network_driver_requires_host() {
        let yaml = BASE.replace("  host: db.internal\n", "");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("source.host"));
    }

    #[test]
    fn test_names_must_be_unique() {
        let yaml = BASE.replace("name: staging", "name: prod");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_targets_required() {
        let yaml = BASE.split("targets:").next().unwrap().to_string() + "targets: []\n";
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_zero_chunk_size_and_workers_rejected() {
        assert!(Config::from_yaml(&with("options:\n  chunk_size: 0\n")).is_err());
        assert!(Config::from_yaml(&with("run:\n  workers: 0\n")).is_err());
    }

    #[test]
    fn test_mutation_options_checked() {
        let wide_mask = with(
            r###"options:
  table_anonymization_options:
    users:
      column_mutations:
        - column_name: email
          strategy: MASK
          mask_char: "##"
"###,
        );
        assert!(Config::from_yaml(&wide_mask).is_err());

        let zero_limit = with(
            r#"options:
  table_anonymization_options:
    users:
      row_selection:
        strategy: FIRST_X
        limit: 0
"#,
        );
        assert!(Config::from_yaml(&zero_limit).is_err());
    }
}
