//! TCP-to-serial proxy multiplexing GRBL-style GCode clients onto a single
//! serial-attached motion-control device.
//!
//! The core pipeline is `ClientConnection` -> `DeviceSession` ->
//! `SerialTransport`, with `TriggerEngine` observing outgoing commands and
//! `Handlers` observing all four directions of traffic. `ProxyService` wires
//! everything together and owns the top-level `start`/`stop` lifecycle.

pub mod client_connection;
pub mod command;
pub mod config;
pub mod device;
pub mod device_session;
pub mod error;
pub mod handlers;
pub mod response;
pub mod server;
pub mod service;
pub mod transport;
pub mod trigger;

pub use command::Command;
pub use config::Config;
pub use device_session::DeviceSession;
pub use error::{Error, Result};
pub use handlers::{ChainHandlers, Handlers as HandlersTrait, LoggingHandlers, NoopHandlers};
pub use response::{classify, Response};
pub use server::Server;
pub use service::ProxyService;
pub use transport::SerialTransport;
pub use trigger::{TriggerEngine, TriggerRule};
