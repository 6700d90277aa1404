use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client_connection::ClientConnection;
use crate::device_session::DeviceSession;
use crate::error::Error;
use crate::handlers::Handlers;

/// Listens for TCP connections and spawns one `ClientConnection` per
/// accept. Accepts unboundedly — there is no per-host connection limit.
pub struct Server {
  local_addr: SocketAddr,
  accept_handle: JoinHandle<()>,
  shutdown_tx: watch::Sender<bool>,
  connections: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl Server {
  pub async fn bind(
    address: &str,
    port: u16,
    device: Arc<DeviceSession>,
    handlers: Arc<dyn Handlers>,
  ) -> Result<Self, Error> {
    let listener = TcpListener::bind((address, port)).await.map_err(|source| {
      Error::TransportOpenFailed {
        path: format!("{}:{}", address, port),
        source,
      }
    })?;

    let local_addr = listener.local_addr().map_err(|source| Error::TransportOpenFailed {
      path: format!("{}:{}", address, port),
      source,
    })?;

    info!(%local_addr, "listening for clients");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let connections = Arc::new(StdMutex::new(Vec::new()));

    let accept_handle = tokio::spawn(accept_loop(
      listener,
      device,
      handlers,
      shutdown_rx,
      Arc::clone(&connections),
    ));

    Ok(Server {
      local_addr,
      accept_handle,
      shutdown_tx,
      connections,
    })
  }

  /// The address actually bound, useful when `server.port` is `0` and the
  /// OS assigns an ephemeral port (tests rely on this).
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Stops accepting, then waits up to `grace` for already-accepted
  /// connections to finish their in-flight round trip. Any connection task
  /// still running once `grace` elapses is aborted rather than left to run
  /// indefinitely — callers (namely `ProxyService::stop`) rely on every
  /// `ClientConnection`'s `Arc<DeviceSession>` clone being dropped by the
  /// time this returns.
  pub async fn stop(self, grace: Duration) {
    let _ = self.shutdown_tx.send(true);

    if tokio::time::timeout(Duration::from_millis(200), self.accept_handle).await.is_err() {
      warn!("accept loop did not stop promptly");
    }

    let handles = {
      let mut guard = self.connections.lock().unwrap();
      std::mem::take(&mut *guard)
    };

    let deadline = tokio::time::Instant::now() + grace;
    for mut handle in handles {
      let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());

      tokio::select! {
        result = &mut handle => {
          let _ = result;
        }
        _ = tokio::time::sleep(remaining) => {
          warn!("aborting a client connection that outlived the shutdown grace period");
          handle.abort();
          let _ = handle.await;
        }
      }
    }
  }
}

async fn accept_loop(
  listener: TcpListener,
  device: Arc<DeviceSession>,
  handlers: Arc<dyn Handlers>,
  mut shutdown_rx: watch::Receiver<bool>,
  connections: Arc<StdMutex<Vec<JoinHandle<()>>>>,
) {
  loop {
    tokio::select! {
      biased;
      _ = shutdown_rx.changed() => {
        if *shutdown_rx.borrow() {
          break;
        }
      }
      accepted = listener.accept() => {
        match accepted {
          Ok((stream, addr)) => accept_client(stream, addr, &device, &handlers, &shutdown_rx, &connections),
          Err(e) => warn!(error = %e, "failed to accept a connection"),
        }
      }
    }
  }
}

fn accept_client(
  stream: tokio::net::TcpStream,
  addr: SocketAddr,
  device: &Arc<DeviceSession>,
  handlers: &Arc<dyn Handlers>,
  shutdown_rx: &watch::Receiver<bool>,
  connections: &Arc<StdMutex<Vec<JoinHandle<()>>>>,
) {
  info!(%addr, "client connected");
  let handle = ClientConnection::spawn(stream, addr, Arc::clone(device), Arc::clone(handlers), shutdown_rx.clone());
  connections.lock().unwrap().push(handle);
}
