// src/error.rs
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("port {port}: unknown parser '{parser}' (known: {known})")]
    UnknownParser {
        port: u16,
        parser: String,
        known: String,
    },

    #[error("port {0} is configured more than once")]
    DuplicatePort(u16),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store connection #{shard} failed: {source}")]
    Connect {
        shard: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("tracker id {0} does not fit u32")]
    IdRange(i64),

    #[error("{field} = {value} does not fit a postgres integer")]
    IntRange { field: &'static str, value: u32 },

    #[error("store pool is empty")]
    EmptyPool,
}
