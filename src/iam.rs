//! AWS IAM side of reconciliation.

use std::collections::BTreeSet;

use async_trait::async_trait;
use aws_sdk_iam::error::{DisplayErrorContext, ProvideErrorMetadata};
use log::debug;
use percent_encoding::percent_decode_str;

use crate::{
  error::{Error, Result},
  model::RoleArn,
};

#[async_trait]
pub trait IamApi: Send + Sync {
  /// The role's current assume-role policy, as a JSON document
  async fn get_trust_policy(&self, role: &RoleArn) -> Result<String>;

  async fn update_trust_policy(&self, role: &RoleArn, document: &str) -> Result<()>;

  /// ARNs of the OIDC providers registered in the account
  async fn list_oidc_providers(&self) -> Result<BTreeSet<String>>;
}

pub struct AwsIam {
  client: aws_sdk_iam::Client,
}

impl AwsIam {
  pub fn new(client: aws_sdk_iam::Client) -> Self {
    Self { client }
  }

  /// IAM addresses roles by name within the caller's account, so the role
  /// found has to be checked against the full ARN asked for
  async fn get_role(&self, role: &RoleArn) -> Result<aws_sdk_iam::types::Role> {
    let out = self
      .client
      .get_role()
      .role_name(&role.name)
      .send()
      .await
      .map_err(|e| sdk_error(&format!("role {}", role), e))?;
    let found = out.role.ok_or_else(|| Error::NotFound(format!("role {}", role)))?;
    ensure_same_role(role, found.arn())?;
    Ok(found)
  }
}

fn ensure_same_role(role: &RoleArn, found: &str) -> Result<()> {
  if found == role.to_string() {
    Ok(())
  } else {
    Err(Error::validation(
      role.to_string(),
      format!("role name resolves to {} with the current credentials", found),
    ))
  }
}

fn sdk_error<E>(what: &str, err: E) -> Error
where
  E: ProvideErrorMetadata + std::error::Error + 'static,
{
  match err.code() {
    Some("NoSuchEntity") => Error::NotFound(what.to_string()),
    Some("MalformedPolicyDocument") => Error::MalformedTrustPolicy {
      resource: what.to_string(),
      message: err.message().unwrap_or_default().to_string(),
    },
    _ => Error::ExternalApi(format!("{}: {}", what, DisplayErrorContext(&err))),
  }
}

#[async_trait]
impl IamApi for AwsIam {
  async fn get_trust_policy(&self, role: &RoleArn) -> Result<String> {
    let found = self.get_role(role).await?;

    // GetRole hands the document back url-encoded
    let encoded = found.assume_role_policy_document().unwrap_or_default();
    let document = percent_decode_str(encoded)
      .decode_utf8()
      .map_err(|e| Error::MalformedTrustPolicy {
        resource: role.to_string(),
        message: e.to_string(),
      })?;
    debug!("Trust policy of {}: {}", role, document);
    Ok(document.into_owned())
  }

  async fn update_trust_policy(&self, role: &RoleArn, document: &str) -> Result<()> {
    self.get_role(role).await?;
    self
      .client
      .update_assume_role_policy()
      .role_name(&role.name)
      .policy_document(document)
      .send()
      .await
      .map_err(|e| sdk_error(&format!("role {}", role), e))?;
    Ok(())
  }

  async fn list_oidc_providers(&self) -> Result<BTreeSet<String>> {
    let out = self
      .client
      .list_open_id_connect_providers()
      .send()
      .await
      .map_err(|e| sdk_error("oidc providers", e))?;
    Ok(
      out
        .open_id_connect_provider_list()
        .iter()
        .filter_map(|p| p.arn().map(str::to_string))
        .collect(),
    )
  }
}
