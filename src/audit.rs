use std::{
  fs::{File, OpenOptions},
  io::Write,
  path::Path,
  sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use log::{error, info};

use crate::{
  error::{Error, Result},
  model::{Action, ErrorRecord, Outcome, ReconciliationResult, ResourceRef},
};

struct Trail {
  records: Vec<ReconciliationResult>,
  last: Option<DateTime<Utc>>,
  sink: Option<File>,
}

pub struct AuditLog {
  trail: Mutex<Trail>,
}

impl Default for AuditLog {
  fn default() -> Self {
    Self::new()
  }
}

impl AuditLog {
  pub fn new() -> Self {
    Self {
      trail: Mutex::new(Trail {
        records: Vec::new(),
        last: None,
        sink: None,
      }),
    }
  }

  /// Also appends every record to `path` as JSON lines
  pub fn with_file(path: impl AsRef<Path>) -> Result<Self> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let log = Self::new();
    log.trail.lock().unwrap_or_else(PoisonError::into_inner).sink = Some(file);
    Ok(log)
  }

  /// Emits a record. Timestamps never go backwards, so anything recorded later
  /// in a cycle sorts after what came before it.
  pub fn record(
    &self,
    resource: ResourceRef,
    action: Action,
    outcome: Outcome,
    error: Option<&Error>,
  ) -> ReconciliationResult {
    let mut trail = self.trail.lock().unwrap_or_else(PoisonError::into_inner);
    let now = Utc::now();
    let timestamp = trail.last.map_or(now, |last| last.max(now));
    trail.last = Some(timestamp);

    let result = ReconciliationResult {
      resource,
      action,
      outcome,
      error: error.map(ErrorRecord::from),
      timestamp,
    };
    match serde_json::to_string(&result) {
      Ok(line) => {
        info!(target: "audit", "{}", line);
        if let Some(file) = trail.sink.as_mut() {
          if let Err(e) = writeln!(file, "{}", line) {
            error!("Failed to append audit record: {}", e);
          }
        }
      }
      Err(e) => error!("Failed to encode audit record {:?}: {}", result, e),
    }
    trail.records.push(result.clone());
    result
  }

  pub fn len(&self) -> usize {
    self.trail.lock().unwrap_or_else(PoisonError::into_inner).records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn records(&self) -> Vec<ReconciliationResult> {
    self.since(0)
  }

  /// Records from position `offset` on
  pub fn since(&self, offset: usize) -> Vec<ReconciliationResult> {
    let trail = self.trail.lock().unwrap_or_else(PoisonError::into_inner);
    trail.records.get(offset..).map(<[_]>::to_vec).unwrap_or_default()
  }
}
