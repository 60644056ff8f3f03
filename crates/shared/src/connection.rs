//! Data source configuration and the payload derived from it.

use serde::{Deserialize, Serialize};

/// How manual connection details are supplied
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// A single connection string
    #[default]
    Dsn,
    /// Discrete host/port/database/credential fields
    Manual,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SslMode {
    #[default]
    Require,
    Prefer,
    Disable,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Require => "require",
            SslMode::Prefer => "prefer",
            SslMode::Disable => "disable",
        }
    }
}

impl std::str::FromStr for SslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "require" => Ok(SslMode::Require),
            "prefer" => Ok(SslMode::Prefer),
            "disable" => Ok(SslMode::Disable),
            other => Err(format!("Unknown sslmode: {}. Valid values: require, prefer, disable", other)),
        }
    }
}

impl std::str::FromStr for ConnectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dsn" => Ok(ConnectionMode::Dsn),
            "manual" => Ok(ConnectionMode::Manual),
            other => Err(format!("Unknown connection mode: {}. Valid values: dsn, manual", other)),
        }
    }
}

/// Raw, user-editable connection fields.
///
/// Every field is kept as the user typed it (the port included); nothing is
/// derived or cached here. Call [`ConnectionConfig::resolve`] to get the
/// payload that is actually sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Defer to the service's own environment connection settings
    pub use_env: bool,
    pub mode: ConnectionMode,
    pub dsn: String,
    pub host: String,
    pub port: String,
    /// Database name
    pub name: String,
    pub user: String,
    pub password: String,
    pub sslmode: SslMode,
    /// Table to analyse, e.g. `public.employees`
    pub table: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            use_env: true,
            mode: ConnectionMode::Dsn,
            dsn: String::new(),
            host: String::new(),
            port: "6543".to_string(),
            name: "postgres".to_string(),
            user: String::new(),
            password: String::new(),
            sslmode: SslMode::Require,
            table: String::new(),
        }
    }
}

/// Connection fields as emitted on the wire.
///
/// Absent fields are skipped entirely so the service can tell "not given"
/// apart from "given as empty".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectionPayload {
    pub use_env: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sslmode: Option<String>,
    pub table: String,
}

impl ConnectionConfig {
    /// Derive the wire payload from the raw fields.
    ///
    /// Total and side-effect free. With `use_env` set, no manual field is
    /// emitted. Otherwise exactly one of the DSN or the discrete field group
    /// is emitted, picked by `mode`. The table is always carried.
    pub fn resolve(&self) -> ConnectionPayload {
        let mut payload = ConnectionPayload {
            use_env: self.use_env,
            table: self.table.clone(),
            ..Default::default()
        };

        if self.use_env {
            return payload;
        }

        match self.mode {
            ConnectionMode::Dsn => {
                payload.dsn = Some(self.dsn.clone());
            }
            ConnectionMode::Manual => {
                payload.host = Some(self.host.clone());
                payload.port = self.port.trim().parse::<u16>().ok();
                payload.name = Some(self.name.clone());
                payload.user = Some(self.user.clone());
                payload.password = Some(self.password.clone());
                payload.sslmode = Some(self.sslmode.as_str().to_string());
            }
        }

        payload
    }
}
