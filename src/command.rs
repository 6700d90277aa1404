use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// A single non-empty GCode line submitted by a client.
///
/// The sequence number exists only for logging and test assertions; it has
/// no bearing on dispatch order (the submission queue is FIFO on its own).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
  pub line: String,
  pub client: SocketAddr,
  pub seq: u64,
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

impl Command {
  pub fn new(line: impl Into<String>, client: SocketAddr) -> Self {
    Command {
      line: line.into(),
      client,
      seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
    }
  }
}
