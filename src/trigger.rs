use std::time::Duration;

use regex::Regex;
use tokio::process::Command as ProcessCommand;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::TriggerConfig;
use crate::error::Error;

/// A compiled (regex, shell-command) pair. Construction validates that the
/// pattern compiles; the rule set as a whole is immutable once built.
pub struct TriggerRule {
  pub id: String,
  pub pattern: Regex,
  pub command: String,
}

impl TriggerRule {
  fn compile(config: &TriggerConfig) -> Result<Self, Error> {
    if config.trigger.kind != "gcode" {
      return Err(Error::ConfigInvalid(format!(
        "trigger '{}' has unsupported trigger.type '{}' (only 'gcode' is recognised)",
        config.id, config.trigger.kind
      )));
    }

    let pattern = Regex::new(&config.trigger.pattern).map_err(|source| Error::RuleCompileError {
      id: config.id.clone(),
      source,
    })?;

    Ok(TriggerRule {
      id: config.id.clone(),
      pattern,
      command: config.command.clone(),
    })
  }
}

/// Holds the compiled rule table and tracks spawned subprocess tasks so
/// shutdown can wait on them with a bounded grace period.
pub struct TriggerEngine {
  rules: Vec<TriggerRule>,
  live: Mutex<JoinSet<()>>,
}

impl TriggerEngine {
  /// Compiles every rule in `configs`. A single invalid rule aborts
  /// construction — this is meant to be called once at startup, before any
  /// connection is accepted.
  pub fn new(configs: &[TriggerConfig]) -> Result<Self, Error> {
    let mut rules = Vec::with_capacity(configs.len());
    for config in configs {
      rules.push(TriggerRule::compile(config)?);
    }

    Ok(TriggerEngine {
      rules,
      live: Mutex::new(JoinSet::new()),
    })
  }

  /// Scans every rule against `line` (unanchored search, per the rule
  /// semantics documented for the config format) and spawns a detached
  /// subprocess for each match. All matching rules fire, not just the
  /// first. Evaluation itself is synchronous; only the spawn is async.
  pub async fn evaluate(&self, line: &str) {
    for rule in &self.rules {
      if rule.pattern.is_match(line) {
        self.spawn(rule).await;
      }
    }
  }

  async fn spawn(&self, rule: &TriggerRule) {
    let id = rule.id.clone();
    let command = rule.command.clone();

    info!(trigger = %id, command = %command, "Executing trigger '{}': {}", id, command);

    let mut live = self.live.lock().await;
    live.spawn(async move {
      let output = ProcessCommand::new("sh").arg("-c").arg(&command).output().await;

      match output {
        Ok(output) if output.status.success() => {
          info!(
            trigger = %id,
            "Trigger '{}' executed successfully (exit code: 0)", id
          );
        }
        Ok(output) => {
          let code = output.status.code().unwrap_or(-1);
          let stderr_tail = tail(&String::from_utf8_lossy(&output.stderr));
          error!(
            trigger = %id,
            exit_code = code,
            "Trigger '{}' failed with exit code {}: {}", id, code, stderr_tail
          );
        }
        Err(e) => {
          error!(trigger = %id, error = %e, "Trigger '{}' failed to spawn: {}", id, e);
        }
      }
    });
  }

  /// Awaits every still-running trigger subprocess for up to `grace`.
  /// Anything left running after the deadline is abandoned to the OS.
  pub async fn shutdown(&self, grace: Duration) {
    let mut live = self.live.lock().await;
    let deadline = tokio::time::Instant::now() + grace;

    loop {
      let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
      if remaining.is_zero() {
        break;
      }

      match tokio::time::timeout(remaining, live.join_next()).await {
        Ok(Some(_)) => continue,
        Ok(None) => break,
        Err(_) => break,
      }
    }
  }
}

/// Keeps the last few lines of captured stderr for the failure log line.
fn tail(stderr: &str) -> String {
  const MAX_LINES: usize = 5;
  let lines: Vec<&str> = stderr.lines().collect();
  let start = lines.len().saturating_sub(MAX_LINES);
  lines[start..].join(" | ")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{TriggerKindConfig, TriggerConfig};

  fn rule(id: &str, pattern: &str, command: &str) -> TriggerConfig {
    TriggerConfig {
      id: id.to_string(),
      trigger: TriggerKindConfig {
        kind: "gcode".to_string(),
        pattern: pattern.to_string(),
      },
      command: command.to_string(),
    }
  }

  #[test]
  fn rejects_unsupported_trigger_type() {
    let mut config = rule("bad", "^M8$", "true");
    config.trigger.kind = "other".to_string();
    assert!(TriggerEngine::new(&[config]).is_err());
  }

  #[test]
  fn rejects_invalid_regex() {
    let config = rule("bad", "([", "true");
    assert!(TriggerEngine::new(&[config]).is_err());
  }

  #[tokio::test]
  async fn all_matching_rules_fire() {
    let engine = TriggerEngine::new(&[
      rule("air-on", "^M8$", "true"),
      rule("air-also", "M.", "false"),
    ])
    .unwrap();

    engine.evaluate("M8").await;
    engine.shutdown(Duration::from_secs(2)).await;
  }

  #[test]
  fn unanchored_match_is_not_exact() {
    let rule = TriggerRule::compile(&rule("m8", "M8", "true")).unwrap();
    assert!(rule.pattern.is_match("M8"));
    assert!(rule.pattern.is_match("GM8X"));
  }
}
