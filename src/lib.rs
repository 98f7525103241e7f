use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod audit;
pub mod cluster;
pub mod config;
pub mod desired;
pub mod engine;
pub mod error;
pub mod iam;
pub mod model;
pub mod rbac;
pub mod retry;
pub mod store;
pub mod trust;

pub use error::{Error, Result};

use model::ResourceRule;

/// Let a service account assume an AWS IAM role, and grant it Kubernetes permissions
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "irsa.controlant.com", version = "v1", kind = "IrsaBinding", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct IrsaBindingSpec {
  /// Service account in the binding's namespace
  pub service_account: String,
  /// ARN of the AWS Role
  pub role_arn: String,
  /// Token audience, sts.amazonaws.com if unset
  #[serde(default)]
  pub audience: Option<String>,
  /// Permissions inside the namespace
  #[serde(default)]
  pub rules: Vec<ResourceRule>,
}
