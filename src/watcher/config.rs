use super::reconnect::ReconnectPolicy;
use crate::error::{Result, WatchError};
use crate::source::ConnectOptions;
use crate::types::Namespace;
use std::time::Duration;

pub const ENV_URI: &str = "MONGODB_URI";
pub const ENV_DATABASE: &str = "DATABASE_NAME";
pub const ENV_COLLECTION: &str = "COLLECTION_NAME";

pub const DEFAULT_URI: &str = "mongodb://localhost:27017/?directConnection=true";
pub const DEFAULT_DATABASE: &str = "test";
pub const DEFAULT_COLLECTION: &str = "documents";

/// Watcher configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Data-source address.
    pub uri: String,

    /// Database holding the watched collection.
    pub database: String,

    /// Watched collection.
    pub collection: String,

    /// How long the source may take to find a usable server.
    pub server_selection_timeout: Duration,

    /// How long the source may take to connect.
    pub connect_timeout: Duration,

    /// Delay policy between reconnect attempts.
    pub reconnect: ReconnectPolicy,

    /// Buffer size for event channel subscriptions.
    pub event_buffer_size: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            server_selection_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            event_buffer_size: 1000,
        }
    }
}

impl WatcherConfig {
    /// Defaults overlaid with `MONGODB_URI`, `DATABASE_NAME` and
    /// `COLLECTION_NAME` from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`. Empty values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| {
            lookup(key)
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            uri: get(ENV_URI, DEFAULT_URI),
            database: get(ENV_DATABASE, DEFAULT_DATABASE),
            collection: get(ENV_COLLECTION, DEFAULT_COLLECTION),
            ..Default::default()
        }
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::new(&self.database, &self.collection)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            uri: self.uri.clone(),
            server_selection_timeout: self.server_selection_timeout,
            connect_timeout: self.connect_timeout,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.uri.trim().is_empty() {
            return Err(WatchError::InvalidConfig("uri must not be empty".to_string()));
        }
        if self.database.trim().is_empty() {
            return Err(WatchError::InvalidConfig(
                "database must not be empty".to_string(),
            ));
        }
        if self.collection.trim().is_empty() {
            return Err(WatchError::InvalidConfig(
                "collection must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
