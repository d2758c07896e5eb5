// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use journal::config::JournalConfig;
use std::env;
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 4003;
pub const DEFAULT_HTTP_PORT: u16 = 4004;
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone)]
pub struct Config {
    /// Websocket listener, serving both `/in` and the control channel.
    pub port: u16,
    /// Plain HTTP side channel.
    pub http_port: u16,
    pub log_level: String,
    pub journal: JournalConfig,
}

/// Reads `name`, parsing it when set and non-empty.
fn read_var<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {name}: {e}")),
        _ => Ok(None),
    }
}

fn read_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl Config {
    pub fn new() -> anyhow::Result<Config> {
        let defaults = JournalConfig::default();

        let port = read_var("JP_PORT")?.unwrap_or(DEFAULT_PORT);
        let http_port = read_var("JP_HTTP_PORT")?.unwrap_or(DEFAULT_HTTP_PORT);
        if port == http_port {
            return Err(anyhow::anyhow!(
                "JP_PORT and JP_HTTP_PORT must differ, both are {port}"
            ));
        }

        let journal = JournalConfig {
            max_entries_limit: read_var("JP_MAX_ENTRIES_LIMIT")?
                .unwrap_or(defaults.max_entries_limit),
            cache_entry_limit: read_var("JP_CACHE_ENTRY_LIMIT")?
                .unwrap_or(defaults.cache_entry_limit),
            cache_values_limit: read_var("JP_CACHE_VALUES_LIMIT")?
                .unwrap_or(defaults.cache_values_limit),
            database_address: read_string("JP_DATABASE_ADDRESS"),
            database_connections: read_var("JP_DATABASE_CONNECTIONS")?
                .unwrap_or(defaults.database_connections),
            database_user: read_string("JP_DATABASE_USER"),
            database_password: read_string("JP_DATABASE_PASSWORD"),
            ..defaults
        };

        Ok(Config {
            port,
            http_port,
            log_level: read_string("JP_LOG_LEVEL")
                .map(|level| level.to_lowercase())
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            journal,
        })
    }
}
