use std::{
  collections::{BTreeMap, BTreeSet},
  path::Path,
};

use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::{
  error::{Error, Result},
  model::{
    AccessIntent, IdentityMapping, ResourceKind, ResourceRef, ServiceAccountRef, DEFAULT_AUDIENCE,
  },
  IrsaBinding,
};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DesiredState {
  #[serde(default)]
  pub mappings: Vec<IdentityMapping>,
  #[serde(default)]
  pub intents: Vec<AccessIntent>,
}

impl DesiredState {
  pub fn from_yaml(doc: &str) -> Result<Self> {
    let state: DesiredState = serde_yaml::from_str(doc)?;
    state.validate()?;
    Ok(state)
  }

  pub fn from_json(doc: &str) -> Result<Self> {
    let state: DesiredState = serde_json::from_str(doc)?;
    state.validate()?;
    Ok(state)
  }

  /// `.json` files are read as JSON, anything else as YAML
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let doc = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
      Some("json") => Self::from_json(&doc),
      _ => Self::from_yaml(&doc),
    }
  }

  pub fn to_yaml(&self) -> Result<String> {
    Ok(serde_yaml::to_string(self)?)
  }

  pub fn validate(&self) -> Result<()> {
    let mut seen = BTreeSet::new();
    for mapping in &self.mappings {
      mapping.validate()?;
      if !seen.insert(mapping.key()) {
        return Err(Error::validation(
          format!("identity mapping {}", mapping.key()),
          "declared more than once",
        ));
      }
    }
    for intent in &self.intents {
      intent.validate()?;
    }
    Ok(())
  }

  pub fn mapping(&self, key: &ServiceAccountRef) -> Option<&IdentityMapping> {
    self.mappings.iter().find(|m| &m.key() == key)
  }

  /// Service accounts holding at least one non-empty intent
  pub fn mandated(&self) -> BTreeSet<ServiceAccountRef> {
    self
      .intents
      .iter()
      .filter(|i| !i.resource_rules.is_empty())
      .map(AccessIntent::key)
      .collect()
  }

  pub fn namespaces(&self) -> BTreeSet<String> {
    self
      .mappings
      .iter()
      .map(|m| m.namespace.clone())
      .chain(self.intents.iter().map(|i| i.namespace.clone()))
      .collect()
  }

  pub fn mappings_in<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a IdentityMapping> + 'a {
    self.mappings.iter().filter(move |m| m.namespace == namespace)
  }

  pub fn intents_in<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a AccessIntent> + 'a {
    self.intents.iter().filter(move |i| i.namespace == namespace)
  }

  /// Builds desired state out of `IrsaBinding` resources. Bindings that do not
  /// validate are left out and handed back next to the state, so one bad
  /// object never blocks the rest of the cluster.
  pub fn from_bindings(bindings: &[IrsaBinding]) -> (Self, Vec<(ResourceRef, Error)>) {
    let mut state = DesiredState::default();
    let mut rejected = Vec::new();
    let mut owners: BTreeMap<ServiceAccountRef, String> = BTreeMap::new();

    for binding in bindings {
      let namespace = binding.namespace().unwrap_or_default();
      let resource = ResourceRef::namespaced(ResourceKind::IdentityMapping, &namespace, &binding.name_any());
      let mut mapping = IdentityMapping::new(&namespace, &binding.spec.service_account, &binding.spec.role_arn);
      mapping.audience = binding
        .spec
        .audience
        .clone()
        .unwrap_or_else(|| DEFAULT_AUDIENCE.to_string());
      let intent = AccessIntent {
        namespace: namespace.clone(),
        service_account: binding.spec.service_account.clone(),
        resource_rules: binding.spec.rules.clone(),
      };

      let checked = mapping.validate().and_then(|_| intent.validate()).and_then(|_| {
        match owners.get(&mapping.key()) {
          Some(owner) => Err(Error::validation(
            format!("IrsaBinding {}/{}", namespace, binding.name_any()),
            format!("service account {} is already bound by {}", mapping.service_account, owner),
          )),
          None => Ok(()),
        }
      });
      match checked {
        Ok(()) => {
          owners.insert(mapping.key(), binding.name_any());
          state.mappings.push(mapping);
          state.intents.push(intent);
        }
        Err(e) => rejected.push((resource, e)),
      }
    }
    (state, rejected)
  }
}
