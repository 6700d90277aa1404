use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::config::Config;
use crate::error::Error;
use crate::handlers::{self, Handlers};
use crate::response::{classify, Response};
use crate::transport::SerialTransport;
use crate::trigger::TriggerEngine;

const REALTIME_STATUS_QUERY: &str = "?";

struct Submission {
  line: String,
  origin: Option<Command>,
  reply: oneshot::Sender<Result<Response, Error>>,
}

/// Owns the serial channel and the one-in-flight discipline. This is the
/// only component that touches the serial transport.
///
/// `stop` takes `&self` rather than consuming ownership: callers only ever
/// hold this behind an `Arc` shared with `ClientConnection` tasks, and
/// shutdown must not be skippable just because one of those tasks is slow
/// to drop its clone. The sender and task handles live behind a
/// `std::sync::Mutex` so `stop` can take them out exactly once.
pub struct DeviceSession {
  submit_tx: StdMutex<Option<mpsc::Sender<Submission>>>,
  out_of_band: Arc<StdMutex<HashMap<SocketAddr, mpsc::UnboundedSender<String>>>>,
  liveness_stop: watch::Sender<bool>,
  liveness_handle: StdMutex<Option<JoinHandle<()>>>,
  dispatcher_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl DeviceSession {
  pub fn start(
    transport: SerialTransport,
    config: Arc<Config>,
    triggers: Arc<TriggerEngine>,
    handlers: Arc<dyn Handlers>,
  ) -> Self {
    let (submit_tx, submit_rx) = mpsc::channel(config.server.queue_limit);
    let out_of_band = Arc::new(StdMutex::new(HashMap::new()));
    let command_timeout = Duration::from_millis(config.device.command_timeout_ms);
    let swallow_realtime_ok = config.device.swallow_realtime_ok;

    let dispatcher_handle = tokio::spawn(run_dispatcher(
      transport,
      submit_rx,
      Arc::clone(&triggers),
      Arc::clone(&handlers),
      Arc::clone(&out_of_band),
      command_timeout,
      swallow_realtime_ok,
    ));

    let (liveness_stop, liveness_stop_rx) = watch::channel(false);

    let liveness_handle = config.liveness_period().map(|period| {
      tokio::spawn(run_liveness(submit_tx.clone(), period, liveness_stop_rx))
    });

    DeviceSession {
      submit_tx: StdMutex::new(Some(submit_tx)),
      out_of_band,
      liveness_stop,
      liveness_handle: StdMutex::new(liveness_handle),
      dispatcher_handle: StdMutex::new(Some(dispatcher_handle)),
    }
  }

  /// Submits a command and awaits its correlated response. Blocks the
  /// caller (applying backpressure) while the submission queue is full.
  /// Fails fast with `ServiceStopped` once `stop` has been called, even if
  /// the dispatcher is still draining earlier submissions.
  pub async fn submit(&self, command: Command) -> Result<Response, Error> {
    let tx = self.submit_tx.lock().unwrap().clone().ok_or(Error::ServiceStopped)?;

    let (reply_tx, reply_rx) = oneshot::channel();
    let line = command.line.clone();

    tx.send(Submission {
      line,
      origin: Some(command),
      reply: reply_tx,
    })
    .await
    .map_err(|_| Error::ServiceStopped)?;

    reply_rx.await.map_err(|_| Error::ServiceStopped)?
  }

  /// Registers an out-of-band channel that Informational lines read while
  /// this client's command is in-flight get forwarded to.
  pub fn register_client(&self, addr: SocketAddr) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    self.out_of_band.lock().unwrap().insert(addr, tx);
    rx
  }

  pub fn unregister_client(&self, addr: SocketAddr) {
    self.out_of_band.lock().unwrap().remove(&addr);
  }

  /// Stops the liveness task, drains the submission queue with a bounded
  /// grace period, and closes the transport. Submissions still queued
  /// after the grace period are abandoned; their submitters observe
  /// `ServiceStopped`. Safe to call through a shared reference (e.g. an
  /// `Arc<DeviceSession>` still held elsewhere) and safe to call more than
  /// once — later calls are no-ops once the sender and handles are taken.
  pub async fn stop(&self, drain_grace: Duration) {
    let _ = self.liveness_stop.send(true);
    let liveness_handle = self.liveness_handle.lock().unwrap().take();
    if let Some(handle) = liveness_handle {
      let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
    }

    // Drop the canonical sender so the dispatcher's receiver drains
    // whatever is already queued, then observes `None` and exits. A
    // submission already in flight inside `submit` may hold a short-lived
    // clone a moment longer; that submission is exactly the kind of
    // already-queued work the drain is meant to finish.
    self.submit_tx.lock().unwrap().take();

    let dispatcher_handle = self.dispatcher_handle.lock().unwrap().take();
    if let Some(handle) = dispatcher_handle {
      if tokio::time::timeout(drain_grace, handle).await.is_err() {
        warn!("device session dispatcher did not drain within the shutdown grace period");
      }
    }
  }
}

#[allow(clippy::too_many_arguments)]
async fn run_dispatcher(
  mut transport: SerialTransport,
  mut submit_rx: mpsc::Receiver<Submission>,
  triggers: Arc<TriggerEngine>,
  handlers: Arc<dyn Handlers>,
  out_of_band: Arc<StdMutex<HashMap<SocketAddr, mpsc::UnboundedSender<String>>>>,
  command_timeout: Duration,
  swallow_realtime_ok: bool,
) {
  while let Some(submission) = submit_rx.recv().await {
    let is_realtime = submission.line == REALTIME_STATUS_QUERY;
    let client = submission.origin.as_ref().map(|c| c.client);

    if let (Some(client), Some(origin)) = (client, &submission.origin) {
      triggers.evaluate(&origin.line).await;
      handlers::invoke_gcode_sent(handlers.as_ref(), &origin.line, client);
    }

    if let Err(e) = transport.write_line(&submission.line).await {
      let _ = submission.reply.send(Err(Error::ServiceStopped));
      error!(error = %e, "serial transport write failed; device session is shutting down");
      return;
    }

    let result = await_terminal_response(
      &mut transport,
      is_realtime,
      swallow_realtime_ok,
      command_timeout,
      client,
      &out_of_band,
    )
    .await;

    let response = match result {
      Ok(response) => {
        if let Some(origin) = &submission.origin {
          debug!(client = %origin.client, seq = origin.seq, response = %response.raw(), "command completed");
        }
        response
      }
      Err(Error::DeviceTimeout) => {
        warn!(is_realtime, "command timed out waiting for a terminal response");
        Response::Error("error:timeout".to_string())
      }
      Err(e) => {
        let _ = submission.reply.send(Err(Error::ServiceStopped));
        error!(error = %e, "serial transport closed while awaiting a response");
        return;
      }
    };

    match &submission.origin {
      Some(origin) => {
        let response = handlers::invoke_response_received(handlers.as_ref(), &response, origin, origin.client);
        let _ = submission.reply.send(Ok(response));
      }
      None => {
        let _ = submission.reply.send(Ok(response));
      }
    }
  }

  transport.close().await;
  info!("device session dispatcher drained and transport closed");
}

/// Reads lines until one is terminal for the in-flight command, forwarding
/// Informational lines to the originating client's out-of-band channel (if
/// any). When `swallow_realtime_ok` is set, a stray `ok` that precedes a
/// probe's status frame is swallowed instead of terminating the probe;
/// when it's unset, that `ok` is an Acknowledgement like any other and
/// terminates the probe immediately.
async fn await_terminal_response(
  transport: &mut SerialTransport,
  is_realtime: bool,
  swallow_realtime_ok: bool,
  command_timeout: Duration,
  client: Option<SocketAddr>,
  out_of_band: &Arc<StdMutex<HashMap<SocketAddr, mpsc::UnboundedSender<String>>>>,
) -> Result<Response, Error> {
  let deadline = tokio::time::Instant::now() + command_timeout;

  loop {
    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    if remaining.is_zero() {
      return Err(Error::DeviceTimeout);
    }

    let line = match tokio::time::timeout(remaining, transport.read_line()).await {
      Ok(Ok(line)) => line,
      Ok(Err(e)) => return Err(e),
      Err(_) => return Err(Error::DeviceTimeout),
    };

    let response = classify(&line);

    if is_realtime && swallow_realtime_ok && matches!(response, Response::Acknowledgement(_)) {
      debug!("swallowed a stray 'ok' preceding this probe's status frame");
      continue;
    }

    if response.is_terminal_for(is_realtime) {
      return Ok(response);
    }

    match (&response, client) {
      (Response::Informational(text), Some(addr)) => {
        let forwarded = out_of_band
          .lock()
          .unwrap()
          .get(&addr)
          .map(|tx| tx.send(text.clone()).is_ok());
        if forwarded != Some(true) {
          debug!(%addr, line = %text, "dropping informational line for a client that already disconnected");
        }
      }
      (Response::Informational(text), None) => {
        debug!(line = %text, "dropping informational line with no waiting client");
      }
      _ => {}
    }
  }
}

async fn run_liveness(submit_tx: mpsc::Sender<Submission>, period: Duration, mut stop_rx: watch::Receiver<bool>) {
  let mut ticker = tokio::time::interval(period);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  let mut consecutive_misses = 0u32;

  loop {
    tokio::select! {
      _ = ticker.tick() => {}
      _ = stop_rx.changed() => {
        if *stop_rx.borrow() {
          break;
        }
        continue;
      }
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    let submission = Submission {
      line: REALTIME_STATUS_QUERY.to_string(),
      origin: None,
      reply: reply_tx,
    };

    if submit_tx.send(submission).await.is_err() {
      break;
    }

    match tokio::time::timeout(period * 2, reply_rx).await {
      Ok(Ok(Ok(_response))) => {
        consecutive_misses = 0;
      }
      Ok(Ok(Err(_))) | Ok(Err(_)) | Err(_) => {
        consecutive_misses += 1;
        if consecutive_misses >= 1 {
          warn!(
            consecutive_misses,
            "liveness probe received no response within two probe periods; device may be unresponsive"
          );
        }
      }
    }
  }
}
