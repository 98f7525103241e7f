use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid {resource}: {message}")]
  Validation { resource: String, message: String },
  #[error("{0} not found")]
  NotFound(String),
  #[error("conflicting write on {0}")]
  Conflict(String),
  #[error("external api error: {0}")]
  ExternalApi(String),
  #[error("malformed trust policy on {resource}: {message}")]
  MalformedTrustPolicy { resource: String, message: String },
  #[error("policy merge conflict in namespace {namespace}: {message}")]
  PolicyMergeConflict { namespace: String, message: String },
  #[error("cancelled")]
  Cancelled,
  #[error("Yaml decode error: {0:?}")]
  YamlError(#[from] serde_yaml::Error),
  #[error("Json error: {0:?}")]
  JsonError(#[from] serde_json::Error),
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// Tag attached to audit records so collectors can group failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
  ValidationError,
  NotFound,
  ConflictError,
  ExternalApiError,
  MalformedTrustPolicy,
  PolicyMergeConflict,
  Cancelled,
  StorageError,
}

impl Error {
  pub fn validation(resource: impl Into<String>, message: impl Into<String>) -> Self {
    Error::Validation {
      resource: resource.into(),
      message: message.into(),
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::Validation { .. } | Error::YamlError(_) | Error::JsonError(_) => ErrorKind::ValidationError,
      Error::NotFound(_) => ErrorKind::NotFound,
      Error::Conflict(_) => ErrorKind::ConflictError,
      Error::ExternalApi(_) => ErrorKind::ExternalApiError,
      Error::MalformedTrustPolicy { .. } => ErrorKind::MalformedTrustPolicy,
      Error::PolicyMergeConflict { .. } => ErrorKind::PolicyMergeConflict,
      Error::Cancelled => ErrorKind::Cancelled,
      Error::Io(_) => ErrorKind::StorageError,
    }
  }

  /// Transient failures go back through the backoff loop; everything else is
  /// surfaced to the operator as is.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self.kind(),
      ErrorKind::ExternalApiError | ErrorKind::ConflictError | ErrorKind::StorageError
    )
  }
}

impl From<kube::Error> for Error {
  fn from(err: kube::Error) -> Self {
    match err {
      kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(resp.message),
      // 422 is what a failed json-patch `test` op comes back as
      kube::Error::Api(resp) if resp.code == 409 || resp.code == 422 => Error::Conflict(resp.message),
      other => Error::ExternalApi(format!("Kube error: {:?}", other)),
    }
  }
}
