// src/config.rs
use crate::error::{LedgerError, Result};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKind {
    Scylla,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub app_secret: String,
    /// Token lifetime in days.
    pub jwt_expires_in: i64,
    pub api_prefix: String,
    pub storage: StorageKind,
    pub scylla_node: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 5521,
            app_secret: "This is your responsibility!".to_string(),
            jwt_expires_in: 3,
            api_prefix: "api".to_string(),
            storage: StorageKind::Scylla,
            scylla_node: "127.0.0.1:9042".to_string(),
            log_level: "info".to_string(),
        }
    }
}

fn parse<T: FromStr>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T> {
    match vars.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| LedgerError::Validation(format!("invalid value for {}: {}", key, raw))),
        None => Ok(default),
    }
}

impl Config {
    /// Reads the process environment, loading `.env` first when present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(env::vars().collect())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        let defaults = Config::default();
        let storage = match vars.get("STORAGE").map(|s| s.to_lowercase()) {
            None => defaults.storage,
            Some(s) if s == "scylla" => StorageKind::Scylla,
            Some(s) if s == "memory" => StorageKind::Memory,
            Some(other) => {
                return Err(LedgerError::Validation(format!(
                    "invalid value for STORAGE: {}",
                    other
                )))
            }
        };
        let jwt_expires_in = parse(&vars, "JWT_EXPIRES_IN", defaults.jwt_expires_in)?;
        if jwt_expires_in <= 0 {
            return Err(LedgerError::Validation(
                "JWT_EXPIRES_IN must be a positive number of days".into(),
            ));
        }
        Ok(Config {
            port: parse(&vars, "PORT", defaults.port)?,
            app_secret: vars.get("APP_SECRET").cloned().unwrap_or(defaults.app_secret),
            jwt_expires_in,
            api_prefix: vars.get("API_PREFIX").cloned().unwrap_or(defaults.api_prefix),
            storage,
            scylla_node: vars.get("SCYLLA_NODE").cloned().unwrap_or(defaults.scylla_node),
            log_level: vars.get("LOG_LEVEL").cloned().unwrap_or(defaults.log_level),
        })
    }
}
