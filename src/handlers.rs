use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::error;

use crate::command::Command;
use crate::response::Response;

/// The four observation points in the pipeline. A no-op default is provided
/// for every method so a partial implementation only needs to override the
/// hooks it cares about.
///
/// Handlers must not panic: any panic is caught at the call site and
/// logged as `HandlerRaised`, and the pipeline continues with the
/// unmodified value, preserving fault isolation from observer code.
pub trait Handlers: Send + Sync {
  /// Called after a line is read from a client, before submission. May
  /// rewrite the line; returning an empty string drops it.
  fn on_gcode_received(&self, line: &str, _client: SocketAddr) -> String {
    line.to_string()
  }

  /// Called immediately before the serial write.
  fn on_gcode_sent(&self, _line: &str, _client: SocketAddr) {}

  /// Called after classification, before delivery to the client. May
  /// rewrite the response.
  fn on_response_received(&self, response: &Response, _command: &Command, _client: SocketAddr) -> Response {
    response.clone()
  }

  /// Called after a successful socket write back to the client.
  fn on_response_sent(&self, _response: &Response, _client: SocketAddr) {}
}

/// A `Handlers` implementation that does nothing.
#[derive(Default)]
pub struct NoopHandlers;

impl Handlers for NoopHandlers {}

/// Logs every hook invocation at DEBUG via `tracing`.
#[derive(Default)]
pub struct LoggingHandlers;

impl Handlers for LoggingHandlers {
  fn on_gcode_received(&self, line: &str, client: SocketAddr) -> String {
    tracing::debug!(%client, %line, "gcode received");
    line.to_string()
  }

  fn on_gcode_sent(&self, line: &str, client: SocketAddr) {
    tracing::debug!(%client, %line, "gcode sent");
  }

  fn on_response_received(&self, response: &Response, command: &Command, client: SocketAddr) -> Response {
    tracing::debug!(%client, line = %command.line, response = %response.raw(), "response received");
    response.clone()
  }

  fn on_response_sent(&self, response: &Response, client: SocketAddr) {
    tracing::debug!(%client, response = %response.raw(), "response sent");
  }
}

/// Composes a list of handlers, invoking each in order. Useful for layering
/// e.g. a file logger and the trigger dispatcher without either needing to
/// know about the other.
pub struct ChainHandlers {
  chain: Vec<Box<dyn Handlers>>,
}

impl ChainHandlers {
  pub fn new(chain: Vec<Box<dyn Handlers>>) -> Self {
    ChainHandlers { chain }
  }
}

impl Handlers for ChainHandlers {
  fn on_gcode_received(&self, line: &str, client: SocketAddr) -> String {
    let mut current = line.to_string();
    for handler in &self.chain {
      current = handler.on_gcode_received(&current, client);
    }
    current
  }

  fn on_gcode_sent(&self, line: &str, client: SocketAddr) {
    for handler in &self.chain {
      handler.on_gcode_sent(line, client);
    }
  }

  fn on_response_received(&self, response: &Response, command: &Command, client: SocketAddr) -> Response {
    let mut current = response.clone();
    for handler in &self.chain {
      current = handler.on_response_received(&current, command, client);
    }
    current
  }

  fn on_response_sent(&self, response: &Response, client: SocketAddr) {
    for handler in &self.chain {
      handler.on_response_sent(response, client);
    }
  }
}

/// Invokes `on_gcode_received`, catching a panic and falling back to the
/// unmodified line.
pub fn invoke_gcode_received(handlers: &dyn Handlers, line: &str, client: SocketAddr) -> String {
  match catch_unwind(AssertUnwindSafe(|| handlers.on_gcode_received(line, client))) {
    Ok(rewritten) => rewritten,
    Err(_) => {
      error!(%client, "on_gcode_received handler panicked; using unmodified line");
      line.to_string()
    }
  }
}

pub fn invoke_gcode_sent(handlers: &dyn Handlers, line: &str, client: SocketAddr) {
  if catch_unwind(AssertUnwindSafe(|| handlers.on_gcode_sent(line, client))).is_err() {
    error!(%client, "on_gcode_sent handler panicked");
  }
}

pub fn invoke_response_received(
  handlers: &dyn Handlers,
  response: &Response,
  command: &Command,
  client: SocketAddr,
) -> Response {
  match catch_unwind(AssertUnwindSafe(|| handlers.on_response_received(response, command, client))) {
    Ok(rewritten) => rewritten,
    Err(_) => {
      error!(%client, "on_response_received handler panicked; using unmodified response");
      response.clone()
    }
  }
}

pub fn invoke_response_sent(handlers: &dyn Handlers, response: &Response, client: SocketAddr) {
  if catch_unwind(AssertUnwindSafe(|| handlers.on_response_sent(response, client))).is_err() {
    error!(%client, "on_response_sent handler panicked");
  }
}
