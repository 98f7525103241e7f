#![allow(dead_code)]

use std::{
  collections::{BTreeMap, BTreeSet},
  sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex,
  },
  time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::api::{
  core::v1::ServiceAccount,
  rbac::v1::{Role, RoleBinding},
};
use kube::Resource;

use operator::{
  cluster::KubeApi,
  desired::DesiredState,
  engine::{Engine, EngineConfig},
  iam::IamApi,
  model::{Action, ResourceKind, RoleArn},
  rbac::{is_managed, NamespaceSnapshot, RbacObject, RbacPatch},
  retry::Backoff,
  trust::TrustPolicy,
  Error, Result,
};

pub const ISSUER: &str = "https://oidc.eks.us-east-1.amazonaws.com/id/EXAMPLED539D4633E53DE1B71EXAMPLE";
pub const ROLE: &str = "arn:aws:iam::123456789012:role/demo-irsa-role";
pub const PROVIDER: &str =
  "arn:aws:iam::123456789012:oidc-provider/oidc.eks.us-east-1.amazonaws.com/id/EXAMPLED539D4633E53DE1B71EXAMPLE";
pub const BASE_POLICY: &str = r#"{"Version":"2012-10-17","Statement":[{"Sid":"Ec2","Effect":"Allow","Principal":{"Service":"ec2.amazonaws.com"},"Action":"sts:AssumeRole"}]}"#;

pub const DEMO: &str = r#"
mappings:
  - namespace: demo-namespace
    serviceAccount: demo-service-account
    roleArn: arn:aws:iam::123456789012:role/demo-irsa-role
intents:
  - namespace: demo-namespace
    serviceAccount: demo-service-account
    resourceRules:
      - apiGroup: ""
        resourceKinds: [pods]
        verbs: [get, list]
"#;

pub fn demo() -> DesiredState {
  DesiredState::from_yaml(DEMO).unwrap()
}

/// Demo mapping without its access intent
pub fn demo_without_intent() -> DesiredState {
  let mut desired = demo();
  desired.intents.clear();
  desired
}

/// A cluster and an IAM account in one, writing to a shared journal
#[derive(Default)]
pub struct World {
  namespaces: Mutex<BTreeMap<String, NamespaceSnapshot>>,
  policies: Mutex<BTreeMap<String, String>>,
  providers: Mutex<BTreeSet<String>>,
  journal: Mutex<Vec<String>>,
  versions: AtomicU64,
  pub policy_updates: AtomicUsize,
  pub hang_updates: AtomicBool,
  pub conflict_once: AtomicBool,
  pub fail_discovery: AtomicBool,
  failing: Mutex<Option<ResourceKind>>,
}

impl World {
  pub fn new() -> Arc<Self> {
    let world = World::default();
    world.providers.lock().unwrap().insert(PROVIDER.to_string());
    world.policies.lock().unwrap().insert(ROLE.to_string(), BASE_POLICY.to_string());
    Arc::new(world)
  }

  pub fn without_provider(self: &Arc<Self>) -> Arc<Self> {
    self.providers.lock().unwrap().clear();
    self.clone()
  }

  pub fn journal(&self) -> Vec<String> {
    self.journal.lock().unwrap().clone()
  }

  pub fn fail_writes_to(&self, kind: Option<ResourceKind>) {
    *self.failing.lock().unwrap() = kind;
  }

  pub fn policy(&self, role: &str) -> TrustPolicy {
    TrustPolicy::parse(&self.policies.lock().unwrap()[role]).unwrap()
  }

  pub fn set_policy(&self, role: &str, document: &str) {
    self.policies.lock().unwrap().insert(role.to_string(), document.to_string());
  }

  /// Deletes the IAM role out from under the operator
  pub fn remove_role(&self, role: &str) {
    self.policies.lock().unwrap().remove(role);
  }

  pub fn snapshot_of(&self, namespace: &str) -> NamespaceSnapshot {
    self
      .namespaces
      .lock()
      .unwrap()
      .get(namespace)
      .cloned()
      .unwrap_or_else(|| NamespaceSnapshot {
        namespace: namespace.to_string(),
        ..NamespaceSnapshot::default()
      })
  }

  pub fn service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
    find(&self.snapshot_of(namespace).service_accounts, name)
  }

  pub fn role(&self, namespace: &str, name: &str) -> Option<Role> {
    find(&self.snapshot_of(namespace).roles, name)
  }

  pub fn role_binding(&self, namespace: &str, name: &str) -> Option<RoleBinding> {
    find(&self.snapshot_of(namespace).role_bindings, name)
  }

  /// Seeds an object as if somebody else created it
  pub fn seed(&self, object: RbacObject) {
    let namespace = object.meta().namespace.clone().unwrap_or_default();
    let version = self.next_version();
    let mut namespaces = self.namespaces.lock().unwrap();
    let snapshot = namespaces.entry(namespace.clone()).or_insert_with(|| NamespaceSnapshot {
      namespace,
      ..NamespaceSnapshot::default()
    });
    match object {
      RbacObject::ServiceAccount(o) => snapshot.service_accounts.push(versioned(o, version)),
      RbacObject::Role(o) => snapshot.roles.push(versioned(o, version)),
      RbacObject::RoleBinding(o) => snapshot.role_bindings.push(versioned(o, version)),
    }
  }

  fn next_version(&self) -> u64 {
    self.versions.fetch_add(1, Ordering::SeqCst) + 1
  }
}

fn find<K: Resource + Clone>(items: &[K], name: &str) -> Option<K> {
  items.iter().find(|o| o.meta().name.as_deref() == Some(name)).cloned()
}

fn versioned<K: Resource>(mut object: K, version: u64) -> K {
  object.meta_mut().resource_version = Some(version.to_string());
  object
}

fn write<K: Resource + Clone>(items: &mut Vec<K>, action: Action, object: K, version: u64) -> Result<()> {
  let name = object.meta().name.clone();
  let position = items.iter().position(|o| o.meta().name == name);
  match (action, position) {
    (Action::Create, Some(_)) => Err(Error::Conflict(format!("{:?} already exists", name))),
    (Action::Create, None) => {
      items.push(versioned(object, version));
      Ok(())
    }
    (Action::Update, Some(idx)) => {
      if items[idx].meta().resource_version != object.meta().resource_version {
        return Err(Error::Conflict(format!("{:?} was modified", name)));
      }
      items[idx] = versioned(object, version);
      Ok(())
    }
    (Action::Update, None) => Err(Error::NotFound(format!("{:?}", name))),
    (Action::Delete, Some(idx)) => {
      items.remove(idx);
      Ok(())
    }
    (Action::Delete, None) | (Action::Noop, _) => Ok(()),
  }
}

#[async_trait]
impl KubeApi for World {
  async fn managed_namespaces(&self) -> Result<BTreeSet<String>> {
    if self.fail_discovery.load(Ordering::SeqCst) {
      return Err(Error::ExternalApi("listing namespaces refused".into()));
    }
    let namespaces = self.namespaces.lock().unwrap();
    Ok(
      namespaces
        .values()
        .filter(|s| {
          s.service_accounts.iter().any(|o| is_managed(&o.metadata))
            || s.roles.iter().any(|o| is_managed(&o.metadata))
            || s.role_bindings.iter().any(|o| is_managed(&o.metadata))
        })
        .map(|s| s.namespace.clone())
        .collect(),
    )
  }

  async fn snapshot(&self, namespace: &str) -> Result<NamespaceSnapshot> {
    Ok(self.snapshot_of(namespace))
  }

  async fn apply(&self, patch: &RbacPatch) -> Result<()> {
    let resource = patch.resource_ref();
    if *self.failing.lock().unwrap() == Some(resource.kind) {
      return Err(Error::ExternalApi(format!("{} refused", resource)));
    }
    if patch.action != Action::Create && self.conflict_once.swap(false, Ordering::SeqCst) {
      // somebody else touched the object since it was read
      let mut namespaces = self.namespaces.lock().unwrap();
      if let Some(snapshot) = namespaces.get_mut(resource.namespace.as_deref().unwrap_or_default()) {
        for role in &mut snapshot.roles {
          role.metadata.resource_version = Some(format!("{}-touched", self.next_version()));
        }
      }
      return Err(Error::Conflict(format!("{} was modified", resource)));
    }

    let version = self.next_version();
    let namespace = resource.namespace.clone().unwrap_or_default();
    let mut namespaces = self.namespaces.lock().unwrap();
    let snapshot = namespaces.entry(namespace.clone()).or_insert_with(|| NamespaceSnapshot {
      namespace,
      ..NamespaceSnapshot::default()
    });
    match &patch.object {
      RbacObject::ServiceAccount(o) => write(&mut snapshot.service_accounts, patch.action, o.clone(), version)?,
      RbacObject::Role(o) => write(&mut snapshot.roles, patch.action, o.clone(), version)?,
      RbacObject::RoleBinding(o) => write(&mut snapshot.role_bindings, patch.action, o.clone(), version)?,
    }
    self
      .journal
      .lock()
      .unwrap()
      .push(format!("kube {:?} {}", patch.action, resource));
    Ok(())
  }
}

#[async_trait]
impl IamApi for World {
  async fn get_trust_policy(&self, role: &RoleArn) -> Result<String> {
    self
      .policies
      .lock()
      .unwrap()
      .get(&role.to_string())
      .cloned()
      .ok_or_else(|| Error::NotFound(role.to_string()))
  }

  async fn update_trust_policy(&self, role: &RoleArn, document: &str) -> Result<()> {
    self.policy_updates.fetch_add(1, Ordering::SeqCst);
    if self.hang_updates.load(Ordering::SeqCst) {
      tokio::time::sleep(Duration::from_secs(3600)).await;
    }
    self.policies.lock().unwrap().insert(role.to_string(), document.to_string());
    self.journal.lock().unwrap().push(format!("iam update {}", role));
    Ok(())
  }

  async fn list_oidc_providers(&self) -> Result<BTreeSet<String>> {
    Ok(self.providers.lock().unwrap().clone())
  }
}

pub fn config() -> EngineConfig {
  EngineConfig {
    max_attempts: 3,
    backoff: Backoff {
      base: Duration::ZERO,
      cap: Duration::ZERO,
    },
    call_timeout: Duration::from_millis(200),
    ..EngineConfig::new(ISSUER)
  }
}

pub fn engine(world: &Arc<World>) -> Engine {
  engine_with(world, config())
}

pub fn engine_with(world: &Arc<World>, config: EngineConfig) -> Engine {
  Engine::new(world.clone(), world.clone(), config)
}
