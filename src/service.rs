use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::device;
use crate::device_session::DeviceSession;
use crate::error::Error;
use crate::handlers::Handlers;
use crate::server::Server;
use crate::transport::SerialTransport;
use crate::trigger::TriggerEngine;

const CONNECTION_DRAIN_GRACE: Duration = Duration::from_secs(2);
const DISPATCHER_DRAIN_GRACE: Duration = Duration::from_secs(2);
const TRIGGER_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Top-level composition: constructs and wires SerialTransport,
/// DeviceSession, TriggerEngine, and Server, and exposes `start`/`stop`.
/// ProxyService exclusively owns all four.
pub struct ProxyService {
  device_session: Arc<DeviceSession>,
  triggers: Arc<TriggerEngine>,
  server: Server,
}

impl ProxyService {
  /// Builds the rule table, opens the serial transport (or its dry-run
  /// stand-in), starts the device session, and binds the TCP listener — in
  /// that order, so a rule-compilation or transport-open failure aborts
  /// before any connection can be accepted.
  pub async fn start(config: Config, dry_run: bool, handlers: Arc<dyn Handlers>) -> Result<Self, Error> {
    let config = Arc::new(config);

    let triggers = Arc::new(TriggerEngine::new(&config.custom_triggers)?);

    let transport = if dry_run {
      SerialTransport::open_dry_run()
    } else {
      let path = device::resolve_device_path(&config.device)?;
      SerialTransport::open(&path, config.device.baud_rate, config.serial_delay()).await?
    };

    let device_session = Arc::new(DeviceSession::start(
      transport,
      Arc::clone(&config),
      Arc::clone(&triggers),
      Arc::clone(&handlers),
    ));

    let server = Server::bind(
      &config.server.address,
      config.server.port,
      Arc::clone(&device_session),
      handlers,
    )
    .await?;

    Ok(ProxyService {
      device_session,
      triggers,
      server,
    })
  }

  /// The TCP address the proxy actually bound to.
  pub fn local_addr(&self) -> std::net::SocketAddr {
    self.server.local_addr()
  }

  /// Shuts the proxy down in the order the design calls for: stop
  /// accepting and close client sockets, wait briefly for their tasks to
  /// finish, stop the device session (drain its queue, cancel the
  /// liveness task, close the transport), then ask the trigger engine to
  /// await its live-set.
  ///
  /// `DeviceSession::stop` is called through the shared `Arc` rather than
  /// after an `Arc::try_unwrap` — a `ClientConnection` task that outlives
  /// `Server::stop`'s grace period still holds a clone, and skipping the
  /// device session's own shutdown in that case would leave the liveness
  /// prober firing `?` forever and the transport never closed.
  pub async fn stop(self) {
    self.server.stop(CONNECTION_DRAIN_GRACE).await;

    self.device_session.stop(DISPATCHER_DRAIN_GRACE).await;

    self.triggers.shutdown(TRIGGER_DRAIN_GRACE).await;
  }
}
