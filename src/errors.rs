// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::result::Result as StdResult;

use thiserror::Error as ThisError;

/// The error type for the consumer core.
///
/// `RetryTimeout` is the sole error that escapes the retry wrappers around
/// remote operations; every routine treats it as grounds for a clean exit so
/// the supervisor may restart the consumer. Protocol-level DCP outcomes are
/// never errors: they travel to the failover-log handler as data.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("remote operation failed after exhausting the retry budget")]
    RetryTimeout,
    #[error("invalid vbucket {0}")]
    InvalidVbucket(u16),
    #[error("dcp feeds have been closed")]
    FeedsClosed,
    #[error("consumer is terminating")]
    Terminating,
    #[error("cas mismatch on key {0:?}")]
    CasMismatch(String),
    #[error("key {0:?} missing from metadata bucket")]
    KeyMissing(String),
    #[error("failover log is empty for vb {0}")]
    EmptyFailoverLog(u16),
    #[error("no kv host serves vb {0}")]
    NoKvHost(u16),
    #[error("metadata store error {0}")]
    MetaStore(String),
    #[error("config store error {0}")]
    ConfigStore(String),
    #[error("dcp client error {0}")]
    Dcp(String),
    #[error("malformed json {0}")]
    Serde(#[from] serde_json::Error),
    #[error("channel {0} closed")]
    ChannelClosed(&'static str),
    #[error("other error {0}")]
    Other(String),
}

pub type Result<T> = StdResult<T, Error>;

impl Error {
    /// Log the error with the context it happened in. The error is consumed
    /// by reference so callers can keep propagating it.
    pub fn report(&self, context: impl std::fmt::Display) {
        warn!("consumer meet error"; "context" => %context, "err" => %self);
    }

    pub fn is_retry_timeout(&self) -> bool {
        matches!(self, Error::RetryTimeout)
    }
}
