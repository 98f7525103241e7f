use std::{
  collections::BTreeMap,
  path::PathBuf,
  sync::{Mutex, PoisonError},
  time::Duration,
};

use chrono::{DateTime, Utc};
use log::warn;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
  error::{Error, Result},
  store::{read_json, write_json_atomic},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
  pub base: Duration,
  pub cap: Duration,
}

impl Default for Backoff {
  fn default() -> Self {
    Self {
      base: Duration::from_secs(1),
      cap: Duration::from_secs(60),
    }
  }
}

impl Backoff {
  /// Upper bound of the wait after the `attempt`-th failure (1-based)
  pub fn ceiling(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self.base.saturating_mul(factor).min(self.cap)
  }

  /// Full jitter: uniform in `[0, ceiling]`
  pub fn delay(&self, attempt: u32) -> Duration {
    let ceiling = self.ceiling(attempt);
    if ceiling.is_zero() {
      return ceiling;
    }
    rand::thread_rng().gen_range(Duration::ZERO..=ceiling)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitPhase {
  Pending,
  Applying,
  Applied,
  Failed,
  Stuck,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitState {
  pub phase: UnitPhase,
  pub attempts: u32,
  #[serde(default)]
  pub next_attempt_at: Option<DateTime<Utc>>,
  /// Hash of the desired input the state refers to
  pub fingerprint: String,
  #[serde(default)]
  pub last_error: Option<String>,
}

impl UnitState {
  fn pending(fingerprint: &str) -> Self {
    Self {
      phase: UnitPhase::Pending,
      attempts: 0,
      next_attempt_at: None,
      fingerprint: fingerprint.to_string(),
      last_error: None,
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
  Run,
  BackingOff(DateTime<Utc>),
  Stuck,
}

/// How a unit's run ended
pub enum RunOutcome<'a> {
  Applied,
  Failed(&'a Error),
  Cancelled,
}

pub struct RetryLedger {
  max_attempts: u32,
  backoff: Backoff,
  states: Mutex<BTreeMap<String, UnitState>>,
  path: Option<PathBuf>,
}

impl RetryLedger {
  pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
      backoff,
      states: Mutex::new(BTreeMap::new()),
      path: None,
    }
  }

  pub fn open(max_attempts: u32, backoff: Backoff, path: impl Into<PathBuf>) -> Result<Self> {
    let path = path.into();
    let states = read_json(&path)?.unwrap_or_default();
    Ok(Self {
      states: Mutex::new(states),
      path: Some(path),
      ..Self::new(max_attempts, backoff)
    })
  }

  pub fn state(&self, unit: &str) -> Option<UnitState> {
    self.lock().get(unit).cloned()
  }

  /// Decides whether `unit` runs this cycle, moving it to `Applying` if so.
  /// A changed fingerprint resets the unit, which is what releases `Stuck`.
  pub fn admit(&self, unit: &str, fingerprint: &str, now: DateTime<Utc>) -> Result<Admission> {
    let mut states = self.lock();
    let state = states
      .entry(unit.to_string())
      .or_insert_with(|| UnitState::pending(fingerprint));
    if state.fingerprint != fingerprint {
      *state = UnitState::pending(fingerprint);
    }

    let admission = match state.phase {
      UnitPhase::Stuck => Admission::Stuck,
      UnitPhase::Failed => match state.next_attempt_at {
        Some(at) if at > now => Admission::BackingOff(at),
        _ => Admission::Run,
      },
      _ => Admission::Run,
    };
    if admission == Admission::Run {
      state.phase = UnitPhase::Applying;
    }
    self.flush(&states)?;
    Ok(admission)
  }

  pub fn record(&self, unit: &str, outcome: RunOutcome<'_>, now: DateTime<Utc>) -> Result<UnitPhase> {
    let mut states = self.lock();
    let state = states
      .entry(unit.to_string())
      .or_insert_with(|| UnitState::pending(""));

    match outcome {
      RunOutcome::Applied => {
        state.phase = UnitPhase::Applied;
        state.attempts = 0;
        state.next_attempt_at = None;
        state.last_error = None;
      }
      RunOutcome::Cancelled => {
        // cancellation says nothing about the declaration
        state.phase = UnitPhase::Pending;
      }
      RunOutcome::Failed(err) => {
        state.attempts += 1;
        state.last_error = Some(err.to_string());
        if !err.is_retryable() || state.attempts >= self.max_attempts {
          warn!("Unit {} is stuck after {} attempt(s): {}", unit, state.attempts, err);
          state.phase = UnitPhase::Stuck;
          state.next_attempt_at = None;
        } else {
          let delay = self.backoff.delay(state.attempts);
          state.phase = UnitPhase::Failed;
          state.next_attempt_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
        }
      }
    }

    let phase = state.phase;
    self.flush(&states)?;
    Ok(phase)
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, UnitState>> {
    self.states.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn flush(&self, states: &BTreeMap<String, UnitState>) -> Result<()> {
    match &self.path {
      Some(path) => write_json_atomic(path, states),
      None => Ok(()),
    }
  }
}
