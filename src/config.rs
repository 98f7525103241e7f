//! Operator settings, read from the environment.

use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::{
  engine::EngineConfig,
  error::{Error, Result},
  rbac::MergePolicy,
};

#[derive(Clone, Debug)]
pub struct Config {
  /// Desired state file; when unset, `IrsaBinding` resources are the source
  pub desired_state: Option<PathBuf>,
  pub store_path: Option<PathBuf>,
  pub ledger_path: Option<PathBuf>,
  pub audit_path: Option<PathBuf>,
  /// Interval between periodic cycles
  pub resync: Duration,
  pub engine: EngineConfig,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let parse = |key: &str, default: u64| -> Result<u64> {
      match get(key) {
        Some(v) => v
          .trim()
          .parse()
          .map_err(|_| Error::validation(key, format!("{:?} is not a number", v))),
        None => Ok(default),
      }
    };

    let oidc_issuer = get("IRSA_OIDC_ISSUER").ok_or_else(|| Error::validation("IRSA_OIDC_ISSUER", "must be set"))?;
    let merge_policy = match get("IRSA_MERGE_POLICY") {
      Some(v) => MergePolicy::from_str(v.trim())?,
      None => MergePolicy::default(),
    };
    let defaults = EngineConfig::new(oidc_issuer);
    let max_attempts = parse("IRSA_MAX_ATTEMPTS", defaults.max_attempts.into())?;
    let concurrency = parse("IRSA_CONCURRENCY", defaults.concurrency as u64)?;

    Ok(Config {
      desired_state: get("IRSA_DESIRED_STATE").map(PathBuf::from),
      store_path: get("IRSA_STORE_PATH").map(PathBuf::from),
      ledger_path: get("IRSA_LEDGER_PATH").map(PathBuf::from),
      audit_path: get("IRSA_AUDIT_PATH").map(PathBuf::from),
      resync: Duration::from_secs(parse("IRSA_RESYNC_SECS", 300)?),
      engine: EngineConfig {
        max_attempts: u32::try_from(max_attempts)
          .map_err(|_| Error::validation("IRSA_MAX_ATTEMPTS", format!("{} is out of range", max_attempts)))?,
        call_timeout: Duration::from_secs(parse("IRSA_CALL_TIMEOUT_SECS", defaults.call_timeout.as_secs())?),
        concurrency: usize::try_from(concurrency.max(1))
          .map_err(|_| Error::validation("IRSA_CONCURRENCY", format!("{} is out of range", concurrency)))?,
        merge_policy,
        ..defaults
      },
    })
  }
}
