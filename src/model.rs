use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, ErrorKind, Result};

pub const DEFAULT_AUDIENCE: &str = "sts.amazonaws.com";

fn default_audience() -> String {
  DEFAULT_AUDIENCE.to_string()
}

/// Verbs an access intent may grant
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
  Get,
  List,
  Watch,
  Create,
  Update,
  Patch,
  Delete,
}

impl Verb {
  pub fn as_str(&self) -> &'static str {
    match self {
      Verb::Get => "get",
      Verb::List => "list",
      Verb::Watch => "watch",
      Verb::Create => "create",
      Verb::Update => "update",
      Verb::Patch => "patch",
      Verb::Delete => "delete",
    }
  }
}

impl FromStr for Verb {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    Ok(match s {
      "get" => Verb::Get,
      "list" => Verb::List,
      "watch" => Verb::Watch,
      "create" => Verb::Create,
      "update" => Verb::Update,
      "patch" => Verb::Patch,
      "delete" => Verb::Delete,
      other => return Err(Error::validation("verb", format!("unsupported verb {:?}", other))),
    })
  }
}

/// (namespace, service account) pair; the identity key everywhere in the operator.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceAccountRef {
  pub namespace: String,
  pub name: String,
}

impl ServiceAccountRef {
  pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      name: name.into(),
    }
  }

  /// The `sub` claim Kubernetes puts into projected service account tokens
  pub fn subject(&self) -> String {
    format!("system:serviceaccount:{}:{}", self.namespace, self.name)
  }
}

impl fmt::Display for ServiceAccountRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.namespace, self.name)
  }
}

/// Parsed `arn:<partition>:iam::<account>:role/<path><name>`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoleArn {
  pub partition: String,
  pub account: String,
  pub path: String,
  pub name: String,
}

impl RoleArn {
  pub fn parse(arn: &str) -> Result<Self> {
    let invalid = |why: &str| Error::validation(format!("role arn {:?}", arn), why.to_string());

    let mut parts = arn.splitn(6, ':');
    let (prefix, partition, service, region, account, resource) = (
      parts.next(),
      parts.next(),
      parts.next(),
      parts.next(),
      parts.next(),
      parts.next(),
    );
    if prefix != Some("arn") {
      return Err(invalid("must start with arn:"));
    }
    let partition = partition.unwrap_or_default();
    if partition.is_empty() || !partition.chars().all(|c| c.is_ascii_lowercase() || c == '-') {
      return Err(invalid("bad partition"));
    }
    if service != Some("iam") {
      return Err(invalid("not an iam arn"));
    }
    if region != Some("") {
      return Err(invalid("iam arns carry no region"));
    }
    let account = account.unwrap_or_default();
    if account.len() != 12 || !account.chars().all(|c| c.is_ascii_digit()) {
      return Err(invalid("account id must be 12 digits"));
    }
    let resource = resource
      .and_then(|r| r.strip_prefix("role/"))
      .ok_or_else(|| invalid("resource must be role/<name>"))?;
    let (path, name) = match resource.rfind('/') {
      Some(idx) => (&resource[..=idx], &resource[idx + 1..]),
      None => ("", resource),
    };
    let name_ok = (1..=64).contains(&name.len())
      && name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "+=,.@_-".contains(c));
    if !name_ok {
      return Err(invalid("bad role name"));
    }
    if path.split('/').any(|seg| seg.chars().any(|c| !(c.is_ascii_alphanumeric() || "+=,.@_-".contains(c)))) {
      return Err(invalid("bad role path"));
    }

    Ok(RoleArn {
      partition: partition.to_string(),
      account: account.to_string(),
      path: format!("/{}", path),
      name: name.to_string(),
    })
  }
}

impl fmt::Display for RoleArn {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "arn:{}:iam::{}:role{}{}",
      self.partition, self.account, self.path, self.name
    )
  }
}

/// DNS-1123 label, which is what namespaces have to be
pub fn validate_namespace(namespace: &str) -> Result<()> {
  if !is_dns_name(namespace, 63, false) {
    return Err(Error::validation(
      format!("namespace {:?}", namespace),
      "must be a DNS-1123 label",
    ));
  }
  Ok(())
}

/// DNS-1123 subdomain, which is what service account names have to be
pub fn validate_service_account(name: &str) -> Result<()> {
  if !is_dns_name(name, 253, true) {
    return Err(Error::validation(
      format!("service account {:?}", name),
      "must be a DNS-1123 subdomain",
    ));
  }
  Ok(())
}

fn is_dns_name(s: &str, max: usize, dots: bool) -> bool {
  let edge = |c: Option<char>| c.map_or(false, |c| c.is_ascii_lowercase() || c.is_ascii_digit());
  !s.is_empty()
    && s.len() <= max
    && edge(s.chars().next())
    && edge(s.chars().last())
    && s
      .chars()
      .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || (dots && c == '.'))
}

/// Maps a service account to the IAM role it may assume
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityMapping {
  pub namespace: String,
  pub service_account: String,
  pub role_arn: String,
  #[serde(default = "default_audience")]
  pub audience: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_reconciled_at: Option<DateTime<Utc>>,
}

impl IdentityMapping {
  pub fn new(namespace: impl Into<String>, service_account: impl Into<String>, role_arn: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      service_account: service_account.into(),
      role_arn: role_arn.into(),
      audience: default_audience(),
      created_at: None,
      last_reconciled_at: None,
    }
  }

  pub fn key(&self) -> ServiceAccountRef {
    ServiceAccountRef::new(&self.namespace, &self.service_account)
  }

  pub fn role(&self) -> Result<RoleArn> {
    RoleArn::parse(&self.role_arn)
  }

  pub fn validate(&self) -> Result<()> {
    validate_namespace(&self.namespace)?;
    validate_service_account(&self.service_account)?;
    self.role()?;
    if self.audience.trim().is_empty() {
      return Err(Error::validation(self.key().to_string(), "audience is empty"));
    }
    Ok(())
  }

  /// Same declaration, ignoring bookkeeping timestamps
  pub fn same_declaration(&self, other: &IdentityMapping) -> bool {
    self.key() == other.key() && self.role_arn == other.role_arn && self.audience == other.audience
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRule {
  /// "" is the core group
  #[serde(default)]
  pub api_group: String,
  pub resource_kinds: BTreeSet<String>,
  pub verbs: BTreeSet<Verb>,
}

/// Kubernetes permissions a service account should hold in its namespace
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessIntent {
  pub namespace: String,
  pub service_account: String,
  pub resource_rules: Vec<ResourceRule>,
}

impl AccessIntent {
  pub fn key(&self) -> ServiceAccountRef {
    ServiceAccountRef::new(&self.namespace, &self.service_account)
  }

  pub fn validate(&self) -> Result<()> {
    validate_namespace(&self.namespace)?;
    validate_service_account(&self.service_account)?;
    for rule in &self.resource_rules {
      if rule.resource_kinds.is_empty() || rule.resource_kinds.iter().any(|k| k.trim().is_empty()) {
        return Err(Error::validation(
          format!("access intent {}", self.key()),
          "resourceKinds must be non-empty",
        ));
      }
      if rule.verbs.is_empty() {
        return Err(Error::validation(format!("access intent {}", self.key()), "verbs must be non-empty"));
      }
    }
    Ok(())
  }
}

/// Derived from an [`IdentityMapping`] and the cluster issuer; never stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustCondition {
  pub oidc_provider_url: String,
  pub subject_claim: String,
  pub audience_claim: String,
}

impl TrustCondition {
  pub fn from_mapping(mapping: &IdentityMapping, issuer: &str) -> Self {
    Self {
      oidc_provider_url: normalize_issuer(issuer),
      subject_claim: mapping.key().subject(),
      audience_claim: mapping.audience.clone(),
    }
  }

  pub fn fingerprint(&self) -> String {
    sha256_hex(&[&self.oidc_provider_url[..], &self.subject_claim[..], &self.audience_claim[..]])
  }
}

/// IAM wants the issuer without scheme or trailing slash in keys and provider ARNs
pub fn normalize_issuer(issuer: &str) -> String {
  issuer
    .trim()
    .trim_start_matches("https://")
    .trim_end_matches('/')
    .to_string()
}

pub(crate) fn sha256_hex(parts: &[&str]) -> String {
  let mut hasher = Sha256::new();
  for part in parts {
    hasher.update(part.as_bytes());
    hasher.update([0u8]);
  }
  hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
  ServiceAccount,
  Role,
  RoleBinding,
  TrustPolicy,
  IdentityMapping,
  /// A cycle as a whole, when it could not get to individual resources
  Cycle,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
  pub kind: ResourceKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub namespace: Option<String>,
  pub name: String,
}

impl ResourceRef {
  pub fn namespaced(kind: ResourceKind, namespace: &str, name: &str) -> Self {
    Self {
      kind,
      namespace: Some(namespace.to_string()),
      name: name.to_string(),
    }
  }

  pub fn trust_policy(role: &RoleArn) -> Self {
    Self {
      kind: ResourceKind::TrustPolicy,
      namespace: None,
      name: role.to_string(),
    }
  }

  pub fn cycle() -> Self {
    Self {
      kind: ResourceKind::Cycle,
      namespace: None,
      name: "reconciliation".to_string(),
    }
  }
}

impl fmt::Display for ResourceRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.namespace {
      Some(ns) => write!(f, "{:?} {}/{}", self.kind, ns, self.name),
      None => write!(f, "{:?} {}", self.kind, self.name),
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
  Create,
  Update,
  Delete,
  Noop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
  Applied,
  Failed,
  Skipped,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
  pub kind: ErrorKind,
  pub message: String,
}

impl From<&Error> for ErrorRecord {
  fn from(err: &Error) -> Self {
    Self {
      kind: err.kind(),
      message: err.to_string(),
    }
  }
}

/// One audit entry. Never mutated after it is emitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
  pub resource: ResourceRef,
  pub action: Action,
  pub outcome: Outcome,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<ErrorRecord>,
  pub timestamp: DateTime<Utc>,
}
