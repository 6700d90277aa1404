use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid configuration: {0}")]
  ConfigInvalid(String),

  #[error("trigger rule '{id}' has an invalid pattern: {source}")]
  RuleCompileError {
    id: String,
    #[source]
    source: regex::Error,
  },

  #[error("failed to open serial transport at {path}: {source}")]
  TransportOpenFailed {
    path: String,
    #[source]
    source: io::Error,
  },

  #[error("serial transport closed")]
  TransportClosed,

  #[error("serial transport I/O error: {0}")]
  TransportIoError(#[source] io::Error),

  #[error("device did not respond within the command deadline")]
  DeviceTimeout,

  #[error("client I/O error: {0}")]
  ClientIOError(#[source] io::Error),

  #[error("the proxy is shutting down")]
  ServiceStopped,
}

pub type Result<T> = std::result::Result<T, Error>;
