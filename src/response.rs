/// A single text line read from the device, classified by shape.
///
/// `Acknowledgement` and `Error` are terminal for whatever command is
/// in-flight; `StatusReport` is terminal only for a probe (see
/// `DeviceSession`); `Informational` never terminates anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
  Acknowledgement(String),
  Error(String),
  StatusReport(String),
  Informational(String),
}

impl Response {
  pub fn raw(&self) -> &str {
    match self {
      Response::Acknowledgement(s) => s,
      Response::Error(s) => s,
      Response::StatusReport(s) => s,
      Response::Informational(s) => s,
    }
  }

  /// Whether this response, if it were read while `probe_in_flight` describes
  /// the currently outstanding command, would terminate that command.
  pub fn is_terminal_for(&self, probe_in_flight: bool) -> bool {
    match self {
      Response::Acknowledgement(_) | Response::Error(_) => true,
      Response::StatusReport(_) => probe_in_flight,
      Response::Informational(_) => false,
    }
  }
}

/// Classifies a line read from the serial transport.
///
/// | Pattern | Class |
/// |---|---|
/// | `ok` (optionally followed by whitespace) | Acknowledgement |
/// | `error:*` or `ALARM:*` | Error |
/// | `<...>` (angle-bracketed) | StatusReport |
/// | anything else | Informational |
pub fn classify(line: &str) -> Response {
  let trimmed = line.trim_end();

  if trimmed == "ok" || trimmed.starts_with("ok ") || trimmed.starts_with("ok\t") {
    return Response::Acknowledgement(line.to_string());
  }

  if trimmed.starts_with("error:") || trimmed.starts_with("ALARM:") {
    return Response::Error(line.to_string());
  }

  if trimmed.starts_with('<') && trimmed.ends_with('>') {
    return Response::StatusReport(line.to_string());
  }

  Response::Informational(line.to_string())
}
