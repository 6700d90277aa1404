use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::command::Command;
use crate::device_session::DeviceSession;
use crate::handlers::{self, Handlers};

/// Reads `\n`-delimited lines from one TCP client, submits each to the
/// device, and writes the correlated response back. At most one command
/// per connection is in flight at a time: the write-path awaits each
/// submitted command's response before the next line is submitted. Bytes
/// read from the socket while a command is in flight simply accumulate in
/// the OS receive buffer.
pub struct ClientConnection;

impl ClientConnection {
  pub fn spawn(
    stream: TcpStream,
    addr: SocketAddr,
    device: Arc<DeviceSession>,
    handlers: Arc<dyn Handlers>,
    shutdown: watch::Receiver<bool>,
  ) -> JoinHandle<()> {
    tokio::spawn(async move {
      if let Err(e) = run(stream, addr, device, handlers, shutdown).await {
        debug!(%addr, error = %e, "client connection terminated");
      }
    })
  }
}

async fn run(
  stream: TcpStream,
  addr: SocketAddr,
  device: Arc<DeviceSession>,
  handlers: Arc<dyn Handlers>,
  mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
  let (read_half, mut write_half) = stream.into_split();
  let mut lines = BufReader::new(read_half).lines();
  let mut out_of_band = device.register_client(addr);

  let result = 'outer: loop {
    let raw = tokio::select! {
      biased;
      _ = shutdown.changed() => {
        if *shutdown.borrow() {
          break 'outer Ok(());
        }
        continue;
      }
      Some(oob) = out_of_band.recv() => {
        if write_half.write_all(format!("{}\n", oob).as_bytes()).await.is_err() {
          break 'outer Ok(());
        }
        continue;
      }
      line = lines.next_line() => line,
    };

    let raw = match raw {
      Ok(Some(raw)) => raw,
      Ok(None) => break 'outer Ok(()),
      Err(e) => break 'outer Err(e),
    };

    let trimmed = raw.trim_end_matches('\r');
    if trimmed.is_empty() {
      continue;
    }

    let rewritten = handlers::invoke_gcode_received(handlers.as_ref(), trimmed, addr);
    if rewritten.is_empty() {
      continue;
    }

    let command = Command::new(rewritten, addr);
    let submit_fut = device.submit(command);
    tokio::pin!(submit_fut);

    let response = loop {
      tokio::select! {
        biased;
        res = &mut submit_fut => break res,
        Some(oob) = out_of_band.recv() => {
          if write_half.write_all(format!("{}\n", oob).as_bytes()).await.is_err() {
            break 'outer Ok(());
          }
        }
      }
    };

    match response {
      Ok(response) => {
        let line = format!("{}\n", response.raw());
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
          break 'outer Err(e);
        }
        handlers::invoke_response_sent(handlers.as_ref(), &response, addr);
      }
      Err(_) => {
        // device session stopped or the command timed out fatally; the
        // in-flight command completed (or was abandoned) against the
        // device, its response is simply not delivered to this client.
        break 'outer Ok(());
      }
    }
  };

  device.unregister_client(addr);
  result
}
