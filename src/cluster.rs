use std::collections::BTreeSet;

use async_trait::async_trait;
use json_patch::{AddOperation, PatchOperation, TestOperation};
use k8s_openapi::{
  api::{
    core::v1::ServiceAccount,
    rbac::v1::{Role, RoleBinding},
  },
  NamespaceResourceScope,
};
use kube::{
  api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions},
  Client, Resource,
};
use log::debug;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{
  error::{Error, Result},
  model::Action,
  rbac::{NamespaceSnapshot, RbacObject, RbacPatch, MANAGED_BY_LABEL, MANAGED_BY_VALUE},
};

#[async_trait]
pub trait KubeApi: Send + Sync {
  /// Namespaces holding at least one object labelled as ours
  async fn managed_namespaces(&self) -> Result<BTreeSet<String>>;

  /// Every ServiceAccount, Role and RoleBinding in `namespace`
  async fn snapshot(&self, namespace: &str) -> Result<NamespaceSnapshot>;

  async fn apply(&self, patch: &RbacPatch) -> Result<()>;
}

pub struct KubeClient {
  client: Client,
}

impl KubeClient {
  pub fn new(client: Client) -> Self {
    Self { client }
  }

  async fn namespaces_of<K>(&self, selector: &str) -> Result<BTreeSet<String>>
  where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    K::DynamicType: Default,
  {
    let list = Api::<K>::all(self.client.clone())
      .list(&ListParams::default().labels(selector))
      .await?;
    Ok(list.items.iter().filter_map(|o| o.meta().namespace.clone()).collect())
  }

  async fn write<K>(&self, action: Action, object: &K, field: &str, value: Value) -> Result<()>
  where
    K: Resource<Scope = NamespaceResourceScope> + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
    K::DynamicType: Default,
  {
    let meta = object.meta();
    let namespace = meta.namespace.as_deref().unwrap_or_default();
    let name = meta.name.as_deref().unwrap_or_default();
    let api = Api::<K>::namespaced(self.client.clone(), namespace);

    match action {
      Action::Create => {
        api.create(&PostParams::default(), object).await?;
      }
      Action::Update => {
        // conditioned on the version the plan was computed from
        let resource_version = meta
          .resource_version
          .clone()
          .ok_or_else(|| Error::Conflict(format!("{}/{} has no resourceVersion", namespace, name)))?;
        api
          .patch(
            name,
            &PatchParams::default(),
            &Patch::<()>::Json(json_patch::Patch(vec![
              PatchOperation::Test(TestOperation {
                path: "/metadata/resourceVersion".to_string(),
                value: resource_version.into(),
              }),
              PatchOperation::Add(AddOperation {
                path: field.to_string(),
                value,
              }),
            ])),
          )
          .await?;
      }
      Action::Delete => {
        let params = DeleteParams {
          preconditions: Some(Preconditions {
            resource_version: meta.resource_version.clone(),
            uid: None,
          }),
          ..DeleteParams::default()
        };
        match api.delete(name, &params).await {
          Ok(_) => {}
          Err(kube::Error::Api(resp)) if resp.code == 404 => {
            debug!("{}/{} already gone", namespace, name);
          }
          Err(e) => return Err(e.into()),
        }
      }
      Action::Noop => {}
    }
    Ok(())
  }
}

#[async_trait]
impl KubeApi for KubeClient {
  async fn managed_namespaces(&self) -> Result<BTreeSet<String>> {
    let selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);
    let mut namespaces = self.namespaces_of::<ServiceAccount>(&selector).await?;
    namespaces.extend(self.namespaces_of::<Role>(&selector).await?);
    namespaces.extend(self.namespaces_of::<RoleBinding>(&selector).await?);
    Ok(namespaces)
  }

  async fn snapshot(&self, namespace: &str) -> Result<NamespaceSnapshot> {
    let lp = ListParams::default();
    Ok(NamespaceSnapshot {
      namespace: namespace.to_string(),
      service_accounts: Api::<ServiceAccount>::namespaced(self.client.clone(), namespace)
        .list(&lp)
        .await?
        .items,
      roles: Api::<Role>::namespaced(self.client.clone(), namespace).list(&lp).await?.items,
      role_bindings: Api::<RoleBinding>::namespaced(self.client.clone(), namespace)
        .list(&lp)
        .await?
        .items,
    })
  }

  async fn apply(&self, patch: &RbacPatch) -> Result<()> {
    debug!("Applying {:?} {}", patch.action, patch.resource_ref());
    match &patch.object {
      RbacObject::ServiceAccount(sa) => {
        let annotations = serde_json::to_value(&sa.metadata.annotations)?;
        self.write(patch.action, sa, "/metadata/annotations", annotations).await
      }
      RbacObject::Role(role) => {
        let rules = serde_json::to_value(&role.rules)?;
        self.write(patch.action, role, "/rules", rules).await
      }
      RbacObject::RoleBinding(binding) => {
        let subjects = serde_json::to_value(&binding.subjects)?;
        self.write(patch.action, binding, "/subjects", subjects).await
      }
    }
  }
}
