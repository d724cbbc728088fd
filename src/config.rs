//! Runtime configuration
//!
//! Read from the environment (after `.env` is loaded) with defaults for a
//! local single-node setup.
use crate::auth::StaticIdentity;
use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_DB_PATH: &str = "vinyl-exchange.db";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_LOG_FILTER: &str = "info,vinyl_exchange=debug";

#[derive(Debug, Clone)]
pub struct Config {
    /// sled database directory (`VINYL_DB_PATH`)
    pub db_path: PathBuf,
    /// `VINYL_HOST`
    pub host: String,
    /// `VINYL_PORT`
    pub port: u16,
    /// Bearer tokens accepted by the API (`VINYL_TOKENS`)
    pub identity: StaticIdentity,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, missing keys fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let db_path = lookup("VINYL_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_owned());
        let host = lookup("VINYL_HOST").unwrap_or_else(|| DEFAULT_HOST.to_owned());
        let port = match lookup("VINYL_PORT") {
            Some(port) => port
                .parse()
                .with_context(|| format!("VINYL_PORT must be a port number, got '{port}'"))?,
            None => DEFAULT_PORT,
        };
        let identity = StaticIdentity::parse(&lookup("VINYL_TOKENS").unwrap_or_default())
            .context("invalid VINYL_TOKENS")?;

        Ok(Self {
            db_path: PathBuf::from(db_path),
            host,
            port,
            identity,
        })
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}
