//! Plans the managed Role, RoleBindings and IRSA annotations of a namespace.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::{
  api::{
    core::v1::ServiceAccount,
    rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
  },
  apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use serde::Deserialize;

use crate::{
  error::{Error, Result},
  model::{sha256_hex, AccessIntent, Action, IdentityMapping, ResourceKind, ResourceRef, Verb, DEFAULT_AUDIENCE},
};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "irsa-operator";
pub const ROLE_NAME: &str = "irsa-access";
pub const ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";
pub const AUDIENCE_ANNOTATION: &str = "eks.amazonaws.com/audience";
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// What to do when two intents grant different verbs on the same kind.
///
/// `Union` is additive: everyone gets everything anyone asked for. That keeps
/// workloads running but is wider than least privilege; `Strict` refuses the
/// namespace instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
  #[default]
  Union,
  Strict,
}

impl std::str::FromStr for MergePolicy {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "union" => Ok(MergePolicy::Union),
      "strict" => Ok(MergePolicy::Strict),
      other => Err(Error::validation("merge policy", format!("expected union or strict, got {:?}", other))),
    }
  }
}

/// Merged grants keyed by (apiGroup, resource kind)
pub type MergedRules = BTreeMap<(String, String), BTreeSet<Verb>>;

pub fn merge_rules<'a>(
  namespace: &str,
  intents: impl IntoIterator<Item = &'a AccessIntent>,
  policy: MergePolicy,
) -> Result<MergedRules> {
  // per intent first, so duplicates inside one intent never count as a conflict
  let mut merged = MergedRules::new();
  let mut owners: BTreeMap<(String, String), String> = BTreeMap::new();
  for intent in intents {
    let mut own = MergedRules::new();
    for rule in &intent.resource_rules {
      for kind in &rule.resource_kinds {
        own
          .entry((rule.api_group.clone(), kind.clone()))
          .or_default()
          .extend(rule.verbs.iter().copied());
      }
    }
    for (key, verbs) in own {
      match merged.get_mut(&key) {
        Some(existing) if policy == MergePolicy::Strict && *existing != verbs => {
          return Err(Error::PolicyMergeConflict {
            namespace: namespace.to_string(),
            message: format!(
              "{} and {} ask for different verbs on {}",
              owners.get(&key).map(String::as_str).unwrap_or("?"),
              intent.service_account,
              display_kind(&key)
            ),
          });
        }
        Some(existing) => existing.extend(verbs),
        None => {
          owners.insert(key.clone(), intent.service_account.clone());
          merged.insert(key, verbs);
        }
      }
    }
  }
  Ok(merged)
}

fn display_kind((group, kind): &(String, String)) -> String {
  if group.is_empty() {
    kind.clone()
  } else {
    format!("{}.{}", kind, group)
  }
}

pub fn is_managed(meta: &ObjectMeta) -> bool {
  meta
    .labels
    .as_ref()
    .and_then(|l| l.get(MANAGED_BY_LABEL))
    .map_or(false, |v| v == MANAGED_BY_VALUE)
}

fn managed_meta(namespace: &str, name: &str) -> ObjectMeta {
  ObjectMeta {
    name: Some(name.to_string()),
    namespace: Some(namespace.to_string()),
    labels: Some([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())].into()),
    ..ObjectMeta::default()
  }
}

fn name_of(meta: &ObjectMeta) -> &str {
  meta.name.as_deref().unwrap_or_default()
}

/// Binding name for a service account; long names get a hashed suffix to stay within 253 chars
pub fn role_binding_name(service_account: &str) -> String {
  let name = format!("irsa-{}", service_account);
  if name.len() <= 253 {
    return name;
  }
  let digest = sha256_hex(&[service_account]);
  format!("irsa-{}-{}", service_account[..200].trim_end_matches(['-', '.']), &digest[..12])
}

/// Renders merged grants, one rule per (group, kind), in a stable order
pub fn render_rules(merged: &MergedRules) -> Vec<PolicyRule> {
  merged
    .iter()
    .map(|((group, kind), verbs)| PolicyRule {
      api_groups: Some(vec![group.clone()]),
      resources: Some(vec![kind.clone()]),
      verbs: verbs.iter().map(|v| v.as_str().to_string()).collect(),
      ..PolicyRule::default()
    })
    .collect()
}

/// Normal form of live rules; `None` when they use features we never render.
fn normalize_rules(rules: &[PolicyRule]) -> Option<BTreeMap<(String, String), BTreeSet<String>>> {
  let mut out: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
  for rule in rules {
    if rule.resource_names.as_ref().map_or(false, |n| !n.is_empty())
      || rule.non_resource_urls.as_ref().map_or(false, |n| !n.is_empty())
    {
      return None;
    }
    for group in rule.api_groups.iter().flatten() {
      for kind in rule.resources.iter().flatten() {
        out
          .entry((group.clone(), kind.clone()))
          .or_default()
          .extend(rule.verbs.iter().cloned());
      }
    }
  }
  Some(out)
}

fn same_rules(live: &Role, merged: &MergedRules) -> bool {
  let desired: BTreeMap<(String, String), BTreeSet<String>> = merged
    .iter()
    .map(|(k, verbs)| (k.clone(), verbs.iter().map(|v| v.as_str().to_string()).collect()))
    .collect();
  normalize_rules(live.rules.as_deref().unwrap_or_default()).map_or(false, |live| live == desired)
}

fn sa_annotations(mapping: &IdentityMapping) -> BTreeMap<String, String> {
  let mut annotations = BTreeMap::new();
  annotations.insert(ROLE_ARN_ANNOTATION.to_string(), mapping.role_arn.clone());
  if mapping.audience != DEFAULT_AUDIENCE {
    annotations.insert(AUDIENCE_ANNOTATION.to_string(), mapping.audience.clone());
  }
  annotations
}

fn sa_matches(live: &ServiceAccount, desired: &BTreeMap<String, String>) -> bool {
  let live = live.metadata.annotations.clone().unwrap_or_default();
  live.get(ROLE_ARN_ANNOTATION) == desired.get(ROLE_ARN_ANNOTATION)
    && live.get(AUDIENCE_ANNOTATION) == desired.get(AUDIENCE_ANNOTATION)
}

fn desired_binding(namespace: &str, service_account: &str) -> RoleBinding {
  RoleBinding {
    metadata: managed_meta(namespace, &role_binding_name(service_account)),
    role_ref: RoleRef {
      api_group: RBAC_API_GROUP.to_string(),
      kind: "Role".to_string(),
      name: ROLE_NAME.to_string(),
    },
    subjects: Some(vec![Subject {
      kind: "ServiceAccount".to_string(),
      name: service_account.to_string(),
      namespace: Some(namespace.to_string()),
      ..Subject::default()
    }]),
  }
}

/// Live objects of one namespace, as observed at the start of a cycle
#[derive(Clone, Debug, Default)]
pub struct NamespaceSnapshot {
  pub namespace: String,
  pub service_accounts: Vec<ServiceAccount>,
  pub roles: Vec<Role>,
  pub role_bindings: Vec<RoleBinding>,
}

#[derive(Clone, Debug)]
pub enum RbacObject {
  ServiceAccount(ServiceAccount),
  Role(Role),
  RoleBinding(RoleBinding),
}

impl RbacObject {
  pub fn meta(&self) -> &ObjectMeta {
    match self {
      RbacObject::ServiceAccount(o) => &o.metadata,
      RbacObject::Role(o) => &o.metadata,
      RbacObject::RoleBinding(o) => &o.metadata,
    }
  }

  pub fn kind(&self) -> ResourceKind {
    match self {
      RbacObject::ServiceAccount(_) => ResourceKind::ServiceAccount,
      RbacObject::Role(_) => ResourceKind::Role,
      RbacObject::RoleBinding(_) => ResourceKind::RoleBinding,
    }
  }
}

/// One write against the cluster. For updates and deletes the object carries
/// the observed `resourceVersion`, which the write is conditioned on.
#[derive(Clone, Debug)]
pub struct RbacPatch {
  pub action: Action,
  pub object: RbacObject,
}

impl RbacPatch {
  pub fn resource_ref(&self) -> ResourceRef {
    let meta = self.object.meta();
    ResourceRef::namespaced(
      self.object.kind(),
      meta.namespace.as_deref().unwrap_or_default(),
      name_of(meta),
    )
  }
}

#[derive(Clone, Debug, Default)]
pub struct RbacPlan {
  pub namespace: String,
  /// In application order
  pub patches: Vec<RbacPatch>,
  pub unchanged: Vec<ResourceRef>,
  /// Foreign objects in the way of a desired one
  pub skipped: Vec<(ResourceRef, String)>,
}

impl RbacPlan {
  pub fn is_noop(&self) -> bool {
    self.patches.is_empty()
  }
}

#[derive(Default)]
struct Phases {
  upsert_sa: Vec<RbacPatch>,
  upsert_role: Vec<RbacPatch>,
  upsert_binding: Vec<RbacPatch>,
  delete_binding: Vec<RbacPatch>,
  delete_role: Vec<RbacPatch>,
  delete_sa: Vec<RbacPatch>,
}

/// Computes the patches for one namespace.
///
/// Creates and updates run service accounts, then the Role, then bindings, so a
/// binding never points at a Role that is not there yet; deletes run the other
/// way round. Within a phase objects are ordered by name, so the same inputs
/// always give the same plan.
pub fn plan_namespace(
  snapshot: &NamespaceSnapshot,
  mappings: &[&IdentityMapping],
  intents: &[&AccessIntent],
  policy: MergePolicy,
) -> Result<RbacPlan> {
  let namespace = snapshot.namespace.as_str();
  let merged = merge_rules(namespace, intents.iter().copied(), policy)?;
  let mut plan = RbacPlan {
    namespace: namespace.to_string(),
    ..RbacPlan::default()
  };
  let mut phases = Phases::default();
  let skip = |plan: &mut RbacPlan, kind: ResourceKind, name: &str| {
    plan.skipped.push((
      ResourceRef::namespaced(kind, namespace, name),
      format!("{:?} {}/{} is not managed by {}", kind, namespace, name, MANAGED_BY_VALUE),
    ));
  };

  // service accounts
  let desired_sas: BTreeMap<&str, &IdentityMapping> =
    mappings.iter().map(|m| (m.service_account.as_str(), *m)).collect();
  let live_sas: BTreeMap<&str, &ServiceAccount> = snapshot
    .service_accounts
    .iter()
    .map(|sa| (name_of(&sa.metadata), sa))
    .collect();
  for (&name, &mapping) in &desired_sas {
    let annotations = sa_annotations(mapping);
    match live_sas.get(name) {
      Some(live) if sa_matches(live, &annotations) => {
        plan.unchanged.push(ResourceRef::namespaced(ResourceKind::ServiceAccount, namespace, name))
      }
      Some(live) if !is_managed(&live.metadata) => skip(&mut plan, ResourceKind::ServiceAccount, name),
      Some(live) => {
        let mut updated = (*live).clone();
        let mut merged_annotations = updated.metadata.annotations.take().unwrap_or_default();
        merged_annotations.remove(AUDIENCE_ANNOTATION);
        merged_annotations.extend(annotations);
        updated.metadata.annotations = Some(merged_annotations);
        phases.upsert_sa.push(RbacPatch {
          action: Action::Update,
          object: RbacObject::ServiceAccount(updated),
        });
      }
      None => {
        let mut meta = managed_meta(namespace, name);
        meta.annotations = Some(annotations);
        phases.upsert_sa.push(RbacPatch {
          action: Action::Create,
          object: RbacObject::ServiceAccount(ServiceAccount {
            metadata: meta,
            ..ServiceAccount::default()
          }),
        });
      }
    }
  }
  for (name, live) in &live_sas {
    if !desired_sas.contains_key(name) && is_managed(&live.metadata) {
      phases.delete_sa.push(RbacPatch {
        action: Action::Delete,
        object: RbacObject::ServiceAccount((*live).clone()),
      });
    }
  }

  // the namespace Role
  let role_wanted = !merged.is_empty();
  let mut live_roles: Vec<&Role> = snapshot.roles.iter().collect();
  live_roles.sort_by(|a, b| name_of(&a.metadata).cmp(name_of(&b.metadata)));
  let live_role = live_roles.iter().find(|r| name_of(&r.metadata) == ROLE_NAME);
  if role_wanted {
    match live_role {
      Some(live) if !is_managed(&live.metadata) => skip(&mut plan, ResourceKind::Role, ROLE_NAME),
      Some(live) if same_rules(live, &merged) => {
        plan.unchanged.push(ResourceRef::namespaced(ResourceKind::Role, namespace, ROLE_NAME))
      }
      Some(live) => {
        let mut updated = (*live).clone();
        updated.rules = Some(render_rules(&merged));
        phases.upsert_role.push(RbacPatch {
          action: Action::Update,
          object: RbacObject::Role(updated),
        });
      }
      None => phases.upsert_role.push(RbacPatch {
        action: Action::Create,
        object: RbacObject::Role(Role {
          metadata: managed_meta(namespace, ROLE_NAME),
          rules: Some(render_rules(&merged)),
        }),
      }),
    }
  }
  for live in &live_roles {
    let stale = !role_wanted || name_of(&live.metadata) != ROLE_NAME;
    if stale && is_managed(&live.metadata) {
      phases.delete_role.push(RbacPatch {
        action: Action::Delete,
        object: RbacObject::Role((*live).clone()),
      });
    }
  }

  // one binding per service account with an intent
  let bound: BTreeSet<&str> = intents
    .iter()
    .filter(|i| !i.resource_rules.is_empty())
    .map(|i| i.service_account.as_str())
    .collect();
  let desired_bindings: BTreeMap<String, RoleBinding> = bound
    .iter()
    .map(|sa| (role_binding_name(sa), desired_binding(namespace, sa)))
    .collect();
  let live_bindings: BTreeMap<&str, &RoleBinding> = snapshot
    .role_bindings
    .iter()
    .map(|rb| (name_of(&rb.metadata), rb))
    .collect();
  // never bind to a Role somebody else owns under our name
  let role_foreign = role_wanted && live_role.map_or(false, |r| !is_managed(&r.metadata));
  for (name, desired) in &desired_bindings {
    match live_bindings.get(name.as_str()) {
      _ if role_foreign => skip(&mut plan, ResourceKind::RoleBinding, name.as_str()),
      Some(live) if !is_managed(&live.metadata) => skip(&mut plan, ResourceKind::RoleBinding, name.as_str()),
      Some(live) if live.role_ref != desired.role_ref => {
        // roleRef is immutable, the binding has to be recreated
        phases.upsert_binding.push(RbacPatch {
          action: Action::Delete,
          object: RbacObject::RoleBinding((*live).clone()),
        });
        phases.upsert_binding.push(RbacPatch {
          action: Action::Create,
          object: RbacObject::RoleBinding(desired.clone()),
        });
      }
      Some(live) if live.subjects == desired.subjects => {
        plan.unchanged.push(ResourceRef::namespaced(ResourceKind::RoleBinding, namespace, name))
      }
      Some(live) => {
        let mut updated = (*live).clone();
        updated.subjects = desired.subjects.clone();
        phases.upsert_binding.push(RbacPatch {
          action: Action::Update,
          object: RbacObject::RoleBinding(updated),
        });
      }
      None => phases.upsert_binding.push(RbacPatch {
        action: Action::Create,
        object: RbacObject::RoleBinding(desired.clone()),
      }),
    }
  }
  for (name, live) in &live_bindings {
    if !desired_bindings.contains_key(*name) && is_managed(&live.metadata) {
      phases.delete_binding.push(RbacPatch {
        action: Action::Delete,
        object: RbacObject::RoleBinding((*live).clone()),
      });
    }
  }

  plan.patches = [
    phases.upsert_sa,
    phases.upsert_role,
    phases.upsert_binding,
    phases.delete_binding,
    phases.delete_role,
    phases.delete_sa,
  ]
  .into_iter()
  .flatten()
  .collect();
  Ok(plan)
}
