use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, warn};

use crate::error::Error;

/// Line-framed byte I/O over the serial port.
///
/// Lines are UTF-8 and `\n`-terminated; `write_line` appends the
/// terminator and `read_line` strips a trailing `\r?\n`. The dry-run
/// backend satisfies the same contract without touching real hardware,
/// synthesising `ok` (or a canned status frame for `?`) on every write.
pub struct SerialTransport {
  backend: Backend,
  read_buf: BytesMut,
}

enum Backend {
  Port(tokio_serial::SerialStream),
  DryRun { pending: VecDeque<String>, withhold: bool },
}

/// Implementation-defined chunk size for blocking reads off the wire.
const READ_CHUNK_SIZE: usize = 256;

impl SerialTransport {
  /// Opens the real serial device and waits out the post-open quiescence
  /// window, discarding any bytes a bootloader dumps onto the line.
  pub async fn open(path: &str, baud_rate: u32, serial_delay: Duration) -> Result<Self, Error> {
    let port = tokio_serial::new(path, baud_rate)
      .data_bits(tokio_serial::DataBits::Eight)
      .parity(tokio_serial::Parity::None)
      .stop_bits(tokio_serial::StopBits::One)
      .open_native_async()
      .map_err(|source| Error::TransportOpenFailed {
        path: path.to_string(),
        source: io::Error::new(io::ErrorKind::Other, source),
      })?;

    let mut transport = SerialTransport {
      backend: Backend::Port(port),
      read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
    };

    transport.discard_for(serial_delay).await;

    Ok(transport)
  }

  /// Builds a dry-run transport: no hardware is touched, writes are
  /// discarded, and responses are synthesised on the next `read_line`.
  pub fn open_dry_run() -> Self {
    SerialTransport {
      backend: Backend::DryRun {
        pending: VecDeque::new(),
        withhold: false,
      },
      read_buf: BytesMut::new(),
    }
  }

  /// A dry-run transport whose writes are acknowledged by nobody: every
  /// `read_line` hangs until cancelled. Exists to exercise the command
  /// timeout path without a real device; not useful outside tests.
  #[cfg(test)]
  pub(crate) fn open_dry_run_withholding() -> Self {
    SerialTransport {
      backend: Backend::DryRun {
        pending: VecDeque::new(),
        withhold: true,
      },
      read_buf: BytesMut::new(),
    }
  }

  /// Queues a line to be returned by a future `read_line` ahead of anything
  /// a write would otherwise synthesise, simulating a firmware quirk (e.g.
  /// a stray `ok` ahead of a probe's status frame). Dry-run only.
  #[cfg(test)]
  pub(crate) fn queue_dry_run_line(&mut self, line: impl Into<String>) {
    if let Backend::DryRun { pending, .. } = &mut self.backend {
      pending.push_back(line.into());
    }
  }

  async fn discard_for(&mut self, delay: Duration) {
    let deadline = tokio::time::Instant::now() + delay;
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
      let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
      if remaining.is_zero() {
        break;
      }

      match &mut self.backend {
        Backend::Port(port) => {
          match tokio::time::timeout(remaining, port.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => debug!(bytes = n, "discarded bootloader garbage during quiescence window"),
            Ok(Err(e)) => {
              warn!(error = %e, "error while discarding quiescence-window bytes");
              break;
            }
          }
        }
        Backend::DryRun { .. } => {
          tokio::time::sleep(remaining).await;
          break;
        }
      }
    }
  }

  pub async fn write_line(&mut self, line: &str) -> Result<(), Error> {
    match &mut self.backend {
      Backend::Port(port) => {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        port.write_all(&bytes).await.map_err(Error::TransportIoError)?;
        Ok(())
      }
      Backend::DryRun { pending, withhold } => {
        if *withhold {
          return Ok(());
        }
        let synthesised = if line == "?" {
          "<Idle|MPos:0.000,0.000,0.000|FS:0,0>".to_string()
        } else {
          "ok".to_string()
        };
        pending.push_back(synthesised);
        Ok(())
      }
    }
  }

  pub async fn read_line(&mut self) -> Result<String, Error> {
    match &mut self.backend {
      Backend::Port(port) => loop {
        if let Some(line) = take_line(&mut self.read_buf) {
          return Ok(line);
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let n = port.read(&mut chunk).await.map_err(Error::TransportIoError)?;
        if n == 0 {
          return Err(Error::TransportClosed);
        }

        self.read_buf.extend_from_slice(&chunk[..n]);
      },
      Backend::DryRun { pending, withhold } => match pending.pop_front() {
        Some(line) => Ok(line),
        None if *withhold => std::future::pending().await,
        None => Err(Error::TransportClosed),
      },
    }
  }

  pub async fn close(self) {
    match self.backend {
      Backend::Port(mut port) => {
        let _ = port.flush().await;
      }
      Backend::DryRun { .. } => {}
    }
  }
}

/// Pulls one `\n`-terminated line out of `buf`, stripping a trailing `\r`.
/// Returns `None` if no complete line is buffered yet.
fn take_line(buf: &mut BytesMut) -> Option<String> {
  let newline_at = buf.iter().position(|&b| b == b'\n')?;

  let mut line = buf.split_to(newline_at + 1);
  line.truncate(line.len() - 1); // drop '\n'
  if line.last() == Some(&b'\r') {
    line.truncate(line.len() - 1);
  }

  Some(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn dry_run_acks_normal_commands() {
    let mut t = SerialTransport::open_dry_run();
    t.write_line("G28").await.unwrap();
    assert_eq!(t.read_line().await.unwrap(), "ok");
  }

  #[tokio::test]
  async fn dry_run_synthesises_status_for_probe() {
    let mut t = SerialTransport::open_dry_run();
    t.write_line("?").await.unwrap();
    let line = t.read_line().await.unwrap();
    assert!(line.starts_with('<') && line.ends_with('>'));
  }

  #[tokio::test]
  async fn dry_run_preserves_write_order() {
    let mut t = SerialTransport::open_dry_run();
    t.write_line("G0 X1").await.unwrap();
    t.write_line("?").await.unwrap();
    assert_eq!(t.read_line().await.unwrap(), "ok");
    assert!(t.read_line().await.unwrap().starts_with('<'));
  }

  #[test]
  fn take_line_strips_crlf() {
    let mut buf = BytesMut::from(&b"ok\r\nrest"[..]);
    assert_eq!(take_line(&mut buf).unwrap(), "ok");
    assert_eq!(&buf[..], b"rest");
  }

  #[test]
  fn take_line_returns_none_without_newline() {
    let mut buf = BytesMut::from(&b"partial"[..]);
    assert!(take_line(&mut buf).is_none());
  }
}
