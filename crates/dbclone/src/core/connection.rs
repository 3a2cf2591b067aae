//! Connection descriptors: immutable endpoint definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CloneError, Result};

/// Database driver named in a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Mysql,
    Mariadb,
    Postgres,
    Sqlserver,
    Sqlite,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Mysql => "mysql",
            DriverKind::Mariadb => "mariadb",
            DriverKind::Postgres => "postgres",
            DriverKind::Sqlserver => "sqlserver",
            DriverKind::Sqlite => "sqlite",
        }
    }

    /// SQL dialect spoken by this driver. MariaDB shares MySQL's.
    pub fn dialect(&self) -> Dialect {
        match self {
            DriverKind::Mysql | DriverKind::Mariadb => Dialect::Mysql,
            DriverKind::Postgres => Dialect::Postgres,
            DriverKind::Sqlserver => Dialect::SqlServer,
            DriverKind::Sqlite => Dialect::Sqlite,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            DriverKind::Mysql | DriverKind::Mariadb => 3306,
            DriverKind::Postgres => 5432,
            DriverKind::Sqlserver => 1433,
            DriverKind::Sqlite => 0,
        }
    }

    /// Whether the driver talks to a server over the network.
    pub fn is_networked(&self) -> bool {
        !matches!(self, DriverKind::Sqlite)
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DriverKind {
    type Err = CloneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mysql" => Ok(DriverKind::Mysql),
            "mariadb" => Ok(DriverKind::Mariadb),
            "postgres" | "postgresql" | "pgsql" => Ok(DriverKind::Postgres),
            "sqlserver" | "mssql" | "sqlsrv" => Ok(DriverKind::Sqlserver),
            "sqlite" => Ok(DriverKind::Sqlite),
            other => Err(CloneError::Config(format!(
                "Unknown driver '{}'. Valid values: mysql, mariadb, postgres, sqlserver, sqlite",
                other
            ))),
        }
    }
}

/// SQL dialect used for DDL and DML generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Mysql,
    Postgres,
    SqlServer,
    Sqlite,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Mysql => "MySQL",
            Dialect::Postgres => "PostgreSQL",
            Dialect::SqlServer => "SQL Server",
            Dialect::Sqlite => "SQLite",
        }
    }
}

impl std::str::FromStr for Dialect {
    type Err = CloneError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(s.parse::<DriverKind>()?.dialect())
    }
}

/// One database endpoint.
///
/// Descriptors are built once per run from configuration and never mutated.
/// For SQLite, `database` is the file path and `host`/`port` are ignored.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub name: String,

    #[serde(rename = "driver")]
    pub driver_kind: DriverKind,

    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub port: Option<u16>,

    pub database: String,

    #[serde(default)]
    pub username: String,

    #[serde(default, skip_serializing)]
    pub password: String,

    /// Driver-specific options: `ssl_mode`, `schema`, `encrypt`,
    /// `trust_server_cert`, `max_connections`.
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
}

impl ConnectionDescriptor {
    /// A SQLite descriptor pointing at a database file.
    pub fn sqlite(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver_kind: DriverKind::Sqlite,
            host: String::new(),
            port: None,
            database: path.into(),
            username: String::new(),
            password: String::new(),
            extra_params: BTreeMap::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.driver_kind.default_port())
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.extra_params.get(key).map(String::as_str)
    }

    pub fn max_connections(&self) -> u32 {
        self.param("max_connections")
            .and_then(|v| v.parse().ok())
            .unwrap_or(8)
    }

    /// Pool name unique to one run, so a pooled connection is never reused
    /// by a different run with different credentials.
    pub fn pool_key(&self, run_id: &str) -> String {
        format!("{}:{}:{}", run_id, self.name, self.driver_kind)
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("name", &self.name)
            .field("driver_kind", &self.driver_kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("extra_params", &self.extra_params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_parse_aliases() {
        assert_eq!("postgresql".parse::<DriverKind>().unwrap(), DriverKind::Postgres);
        assert_eq!("mssql".parse::<DriverKind>().unwrap(), DriverKind::Sqlserver);
        assert!("oracle".parse::<DriverKind>().is_err());
    }

    #[test]
    fn test_mariadb_speaks_mysql() {
        assert_eq!(DriverKind::Mariadb.dialect(), Dialect::Mysql);
        assert_eq!(DriverKind::Mariadb.default_port(), 3306);
    }

    #[test]
    fn test_pool_key_includes_run() {
        let desc = ConnectionDescriptor::sqlite("source", "/tmp/a.db");
        assert_eq!(desc.pool_key("run-1"), "run-1:source:sqlite");
        assert_ne!(desc.pool_key("run-1"), desc.pool_key("run-2"));
    }

    #[test]
    fn test_password_not_serialized() {
        let mut desc = ConnectionDescriptor::sqlite("t", "db.sqlite");
        desc.password = "secret".into();
        let yaml = serde_yaml::to_string(&desc).unwrap();
        assert!(!yaml.contains("secret"));
        assert!(!format!("{:?}", desc).contains("secret"));
    }
}
