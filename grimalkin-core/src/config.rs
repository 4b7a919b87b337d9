//! Store configuration
//!
//! Built once at startup and injected into the connection pool. Sources,
//! highest priority first:
//! 1. an explicit TOML file (`--config`)
//! 2. process environment (`GRIMALKIN_*`)
//! 3. a `.env` file in the working directory (via dotenvy, never overrides)

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;

pub const ENV_STORE_URI: &str = "GRIMALKIN_STORE_URI";
pub const ENV_BEARER_TOKEN: &str = "GRIMALKIN_BEARER_TOKEN";
pub const ENV_KEYSPACE: &str = "GRIMALKIN_KEYSPACE";
pub const ENV_TLS: &str = "GRIMALKIN_TLS";
pub const ENV_CONNECT_TIMEOUT: &str = "GRIMALKIN_CONNECT_TIMEOUT_SECS";
pub const ENV_POOL_MAX_IDLE: &str = "GRIMALKIN_POOL_MAX_IDLE";
pub const ENV_FANOUT_REPAIR: &str = "GRIMALKIN_FANOUT_REPAIR";

const DEFAULT_KEYSPACE: &str = "main";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_IDLE: usize = 16;

/// What the answer workflow does when follower fan-out fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutRepair {
    /// Surface the failure; followers' feeds stay stale until reconciled.
    #[default]
    Report,
    /// Run one reconciliation pass before surfacing the failure.
    Reconcile,
}

impl FromStr for FanoutRepair {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "report" => Ok(Self::Report),
            "reconcile" => Ok(Self::Reconcile),
            other => Err(ConfigError::invalid(
                ENV_FANOUT_REPAIR,
                format!("expected 'report' or 'reconcile', got '{other}'"),
            )),
        }
    }
}

/// Connection and behaviour settings for the data-access core.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// `postgres://host/db` or `memory://name`
    pub uri: String,
    pub bearer_token: String,
    /// Namespace all tables live under
    pub keyspace: String,
    pub tls: bool,
    pub connect_timeout: Duration,
    /// Idle connections kept for reuse; dialing beyond this is still allowed
    pub max_idle: usize,
    pub fanout_repair: FanoutRepair,
}

impl StoreConfig {
    pub fn new(uri: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            bearer_token: bearer_token.into(),
            keyspace: DEFAULT_KEYSPACE.to_string(),
            tls: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_idle: DEFAULT_MAX_IDLE,
            fanout_repair: FanoutRepair::default(),
        }
    }

    /// Load `.env`, then the environment, then overlay `path` if given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(p) => debug!("Loaded .env from {}", p.display()),
            Err(_) => debug!("No .env file found, using environment only"),
        }

        let lookup = |key: &str| std::env::var(key).ok();
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                let file: FileConfig = toml::from_str(&content)?;
                Self::assemble(lookup, Some(file))
            }
            None => Self::assemble(lookup, None),
        }
    }

    /// Build from the process environment only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::assemble(|key| std::env::var(key).ok(), None)
    }

    /// Build from an arbitrary key lookup with an optional file overlay.
    pub fn assemble<F>(lookup: F, file: Option<FileConfig>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = file.unwrap_or_default();

        let uri = file
            .uri
            .or_else(|| lookup(ENV_STORE_URI))
            .ok_or(ConfigError::Missing { key: ENV_STORE_URI })?;
        let bearer_token = file
            .bearer_token
            .or_else(|| lookup(ENV_BEARER_TOKEN))
            .ok_or(ConfigError::Missing { key: ENV_BEARER_TOKEN })?;

        let mut config = Self::new(uri, bearer_token);

        if let Some(keyspace) = file.keyspace.or_else(|| lookup(ENV_KEYSPACE)) {
            config.keyspace = keyspace;
        }
        if !is_identifier(&config.keyspace) {
            return Err(ConfigError::invalid(
                ENV_KEYSPACE,
                "must be lowercase letters, digits or '_'",
            ));
        }

        if let Some(tls) = file.tls {
            config.tls = tls;
        } else if let Some(raw) = lookup(ENV_TLS) {
            config.tls = parse_bool(ENV_TLS, &raw)?;
        }

        if let Some(secs) = file.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(secs);
        } else if let Some(raw) = lookup(ENV_CONNECT_TIMEOUT) {
            let secs: u64 = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(ENV_CONNECT_TIMEOUT, "expected seconds"))?;
            config.connect_timeout = Duration::from_secs(secs);
        }

        if let Some(max_idle) = file.max_idle {
            config.max_idle = max_idle;
        } else if let Some(raw) = lookup(ENV_POOL_MAX_IDLE) {
            config.max_idle = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(ENV_POOL_MAX_IDLE, "expected a count"))?;
        }

        if let Some(policy) = file.fanout_repair {
            config.fanout_repair = policy;
        } else if let Some(raw) = lookup(ENV_FANOUT_REPAIR) {
            config.fanout_repair = raw.parse()?;
        }

        Ok(config)
    }

    /// URI scheme, lowercased (`postgres`, `memory`, ...).
    pub fn scheme(&self) -> String {
        self.uri
            .split_once("://")
            .map(|(s, _)| s.to_ascii_lowercase())
            .unwrap_or_default()
    }
}

// Token is a credential; keep it out of logs.
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("uri", &self.uri)
            .field("bearer_token", &"<redacted>")
            .field("keyspace", &self.keyspace)
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_idle", &self.max_idle)
            .field("fanout_repair", &self.fanout_repair)
            .finish()
    }
}

/// TOML file shape; every field optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub uri: Option<String>,
    pub bearer_token: Option<String>,
    pub keyspace: Option<String>,
    pub tls: Option<bool>,
    pub connect_timeout_secs: Option<u64>,
    pub max_idle: Option<usize>,
    pub fanout_repair: Option<FanoutRepair>,
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, "expected true or false")),
    }
}

/// True for names safe to use unquoted as a keyspace: lowercase letters,
/// digits and `_`, not starting with a digit.
pub fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn requires_uri_and_token() {
        let err = StoreConfig::assemble(env(&[]), None).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key: ENV_STORE_URI }));

        let err = StoreConfig::assemble(env(&[(ENV_STORE_URI, "memory://t")]), None).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key: ENV_BEARER_TOKEN }));
    }

    #[test]
    fn defaults_apply() {
        let cfg = StoreConfig::assemble(
            env(&[(ENV_STORE_URI, "postgres://db/app"), (ENV_BEARER_TOKEN, "tok")]),
            None,
        )
        .unwrap();
        assert_eq!(cfg.keyspace, "main");
        assert!(cfg.tls);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.fanout_repair, FanoutRepair::Report);
        assert_eq!(cfg.scheme(), "postgres");
    }

    #[test]
    fn env_overrides() {
        let cfg = StoreConfig::assemble(
            env(&[
                (ENV_STORE_URI, "memory://t"),
                (ENV_BEARER_TOKEN, "tok"),
                (ENV_KEYSPACE, "qa_test"),
                (ENV_TLS, "off"),
                (ENV_CONNECT_TIMEOUT, "3"),
                (ENV_POOL_MAX_IDLE, "2"),
                (ENV_FANOUT_REPAIR, "Reconcile"),
            ]),
            None,
        )
        .unwrap();
        assert_eq!(cfg.keyspace, "qa_test");
        assert!(!cfg.tls);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(3));
        assert_eq!(cfg.max_idle, 2);
        assert_eq!(cfg.fanout_repair, FanoutRepair::Reconcile);
    }

    #[test]
    fn rejects_bad_values() {
        let base = [(ENV_STORE_URI, "memory://t"), (ENV_BEARER_TOKEN, "tok")];

        let mut pairs = base.to_vec();
        pairs.push((ENV_KEYSPACE, "drop table;"));
        assert!(StoreConfig::assemble(env(&pairs), None).is_err());

        let mut pairs = base.to_vec();
        pairs.push((ENV_FANOUT_REPAIR, "retry-forever"));
        assert!(StoreConfig::assemble(env(&pairs), None).is_err());

        let mut pairs = base.to_vec();
        pairs.push((ENV_TLS, "maybe"));
        assert!(StoreConfig::assemble(env(&pairs), None).is_err());
    }

    #[test]
    fn file_wins_over_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "uri = \"memory://from-file\"\nbearer_token = \"file-token\"\nfanout_repair = \"reconcile\""
        )
        .unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        let parsed: FileConfig = toml::from_str(&content).unwrap();
        let cfg = StoreConfig::assemble(
            env(&[(ENV_STORE_URI, "postgres://env/db"), (ENV_BEARER_TOKEN, "env")]),
            Some(parsed),
        )
        .unwrap();
        assert_eq!(cfg.uri, "memory://from-file");
        assert_eq!(cfg.bearer_token, "file-token");
        assert_eq!(cfg.fanout_repair, FanoutRepair::Reconcile);
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let cfg = StoreConfig::new("POSTGRES://db/app", "tok");
        assert_eq!(cfg.scheme(), "postgres");
        assert_eq!(StoreConfig::new("Memory://t", "tok").scheme(), "memory");
        assert_eq!(StoreConfig::new("no-scheme", "tok").scheme(), "");
    }

    #[test]
    fn debug_redacts_token() {
        let cfg = StoreConfig::new("memory://t", "super-secret");
        assert!(!format!("{cfg:?}").contains("super-secret"));
    }
}
