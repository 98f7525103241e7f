//! Reconciles RBAC per namespace first, then trust policies per IAM role.

use std::{
  collections::{BTreeMap, BTreeSet},
  future::Future,
  sync::{Arc, Mutex as StdMutex, PoisonError},
  time::Duration,
};

use chrono::Utc;
use futures_util::{stream, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
  audit::AuditLog,
  cluster::KubeApi,
  desired::DesiredState,
  error::{Error, Result},
  iam::IamApi,
  model::{
    sha256_hex, AccessIntent, Action, IdentityMapping, Outcome, ReconciliationResult, ResourceKind, ResourceRef,
    RoleArn, ServiceAccountRef, TrustCondition,
  },
  rbac::{self, MergePolicy, ROLE_NAME},
  retry::{Admission, Backoff, RetryLedger, RunOutcome},
  store::{MappingStore, StoredMapping},
  trust::{self, TrustPolicy},
};

#[derive(Clone, Debug)]
pub struct EngineConfig {
  /// Issuer URL of the cluster's service account tokens
  pub oidc_issuer: String,
  pub max_attempts: u32,
  pub backoff: Backoff,
  pub call_timeout: Duration,
  pub concurrency: usize,
  pub merge_policy: MergePolicy,
}

impl EngineConfig {
  pub fn new(oidc_issuer: impl Into<String>) -> Self {
    Self {
      oidc_issuer: oidc_issuer.into(),
      max_attempts: 5,
      backoff: Backoff::default(),
      call_timeout: Duration::from_secs(30),
      concurrency: 8,
      merge_policy: MergePolicy::default(),
    }
  }
}

#[derive(Default)]
struct LockMap(StdMutex<BTreeMap<String, Arc<Mutex<()>>>>);

impl LockMap {
  fn get(&self, key: &str) -> Arc<Mutex<()>> {
    self
      .0
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .entry(key.to_string())
      .or_default()
      .clone()
  }
}

/// Results of one cycle, in the order they were recorded
#[derive(Clone, Debug, Default)]
pub struct CycleReport {
  pub results: Vec<ReconciliationResult>,
}

impl CycleReport {
  /// Writes that actually went out
  pub fn patches(&self) -> usize {
    self
      .results
      .iter()
      .filter(|r| r.action != Action::Noop && r.outcome == Outcome::Applied)
      .count()
  }

  pub fn failures(&self) -> usize {
    self.results.iter().filter(|r| r.outcome == Outcome::Failed).count()
  }

  pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &ReconciliationResult> {
    self.results.iter().filter(move |r| r.resource.kind == kind)
  }
}

struct UnitOutcome {
  /// Everything desired is in place, nothing was skipped
  complete: bool,
  results: Vec<ReconciliationResult>,
}

impl UnitOutcome {
  fn idle() -> Self {
    Self {
      complete: false,
      results: Vec::new(),
    }
  }
}

/// Trust-phase input for one IAM role
#[derive(Default)]
struct RoleWork<'a> {
  granted: Vec<&'a IdentityMapping>,
  deferred: Vec<&'a IdentityMapping>,
  /// Mappings pointing at this role that carry no mandate
  unmandated: Vec<&'a IdentityMapping>,
}

impl RoleWork<'_> {
  /// Depends on the declaration only, never on how the RBAC phase went
  fn fingerprint(&self) -> String {
    let mut parts: Vec<String> = self
      .granted
      .iter()
      .chain(&self.deferred)
      .map(|m| format!("grant {} {}", m.key(), m.audience))
      .chain(self.unmandated.iter().map(|m| format!("none {}", m.key())))
      .collect();
    parts.sort();
    sha256_hex(&parts.iter().map(String::as_str).collect::<Vec<_>>())
  }
}

pub struct Engine {
  kube: Arc<dyn KubeApi>,
  iam: Arc<dyn IamApi>,
  store: MappingStore,
  ledger: RetryLedger,
  audit: AuditLog,
  config: EngineConfig,
  namespace_locks: LockMap,
}

impl Engine {
  pub fn new(kube: Arc<dyn KubeApi>, iam: Arc<dyn IamApi>, config: EngineConfig) -> Self {
    Self {
      kube,
      iam,
      store: MappingStore::in_memory(),
      ledger: RetryLedger::new(config.max_attempts, config.backoff.clone()),
      audit: AuditLog::new(),
      config,
      namespace_locks: LockMap::default(),
    }
  }

  pub fn with_store(mut self, store: MappingStore) -> Self {
    self.store = store;
    self
  }

  pub fn with_ledger(mut self, ledger: RetryLedger) -> Self {
    self.ledger = ledger;
    self
  }

  pub fn with_audit(mut self, audit: AuditLog) -> Self {
    self.audit = audit;
    self
  }

  pub fn store(&self) -> &MappingStore {
    &self.store
  }

  pub fn ledger(&self) -> &RetryLedger {
    &self.ledger
  }

  pub fn audit(&self) -> &AuditLog {
    &self.audit
  }

  /// Drives both back ends towards `desired` once.
  ///
  /// Only fails as a whole when the desired state is invalid or the managed
  /// namespaces can not be discovered, and then records that against
  /// [`ResourceRef::cycle`]. Every other failure is reported per resource in
  /// the returned report.
  pub async fn run_cycle(&self, desired: &DesiredState, cancel: &CancellationToken) -> Result<CycleReport> {
    desired.validate().map_err(|e| self.abort(e))?;
    self.register_declarations(desired);
    let previous: Vec<StoredMapping> = self.store.list().collect();

    let discovered = self
      .call(cancel, self.kube.managed_namespaces())
      .await
      .map_err(|e| self.abort(e))?;
    let mut namespaces = desired.namespaces();
    namespaces.extend(discovered);
    namespaces.extend(previous.iter().map(|p| p.mapping.namespace.clone()));
    debug!("Reconciling {} namespace(s)", namespaces.len());

    let mut report = CycleReport::default();

    // phase 1: kubernetes
    let rbac: Vec<(String, UnitOutcome)> = stream::iter(namespaces)
      .map(|ns| async move {
        let outcome = self.reconcile_namespace(&ns, desired, cancel).await;
        (ns, outcome)
      })
      .buffer_unordered(self.config.concurrency.max(1))
      .collect()
      .await;
    let mut ready = BTreeSet::new();
    for (ns, outcome) in rbac {
      if outcome.complete {
        ready.insert(ns);
      }
      report.results.extend(outcome.results);
    }

    // phase 2: iam
    let mandated = desired.mandated();
    let mut roles: BTreeMap<RoleArn, RoleWork<'_>> = BTreeMap::new();
    for mapping in &desired.mappings {
      let work = roles.entry(mapping.role()?).or_default();
      if !mandated.contains(&mapping.key()) {
        work.unmandated.push(mapping);
      } else if ready.contains(&mapping.namespace) {
        work.granted.push(mapping);
      } else {
        work.deferred.push(mapping);
      }
    }
    for stored in &previous {
      if let Ok(role) = stored.mapping.role() {
        roles.entry(role).or_default();
      }
    }

    let providers = if roles.values().any(|w| !w.granted.is_empty()) {
      self.call(cancel, self.iam.list_oidc_providers()).await
    } else {
      Ok(BTreeSet::new())
    };
    let providers = &providers;

    let trust: Vec<(RoleArn, UnitOutcome)> = stream::iter(roles.iter())
      .map(|(role, work)| async move {
        let outcome = self.reconcile_role(role, work, providers, cancel).await;
        (role.clone(), outcome)
      })
      .buffer_unordered(self.config.concurrency.max(1))
      .collect()
      .await;
    let mut settled = BTreeSet::new();
    for (role, outcome) in trust {
      if outcome.complete {
        settled.insert(role);
      }
      report.results.extend(outcome.results);
    }

    report.results.extend(self.commit(desired, &previous, &roles, &settled));

    info!(
      "Reconciliation cycle done: {} result(s), {} patch(es), {} failure(s)",
      report.results.len(),
      report.patches(),
      report.failures()
    );
    Ok(report)
  }

  fn abort(&self, err: Error) -> Error {
    let outcome = match err {
      Error::Cancelled => Outcome::Skipped,
      _ => {
        error!("Reconciliation cycle aborted: {}", err);
        Outcome::Failed
      }
    };
    self.audit.record(ResourceRef::cycle(), Action::Noop, outcome, Some(&err));
    err
  }

  /// Mappings enter the store on first sight, so the role they point at is
  /// remembered even if the first apply fails.
  fn register_declarations(&self, desired: &DesiredState) {
    for mapping in &desired.mappings {
      let key = mapping.key();
      if self.store.get(&key.namespace, &key.name).is_ok() {
        continue;
      }
      match self.store.compare_and_swap(mapping.clone(), None, 0) {
        Ok(_) | Err(Error::Conflict(_)) => {}
        Err(e) => error!("Failed to register identity mapping {}: {}", key, e),
      }
    }
  }

  async fn call<T>(&self, cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    let timeout = self.config.call_timeout;
    tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(Error::Cancelled),
      res = tokio::time::timeout(timeout, fut) => res.unwrap_or_else(|_| {
        Err(Error::ExternalApi(format!("call timed out after {:?}", timeout)))
      }),
    }
  }

  fn admit(&self, unit: &str, fingerprint: &str) -> Admission {
    match self.ledger.admit(unit, fingerprint, Utc::now()) {
      Ok(Admission::Stuck) => {
        warn!("Skipping {}: stuck until its declaration changes", unit);
        Admission::Stuck
      }
      Ok(Admission::BackingOff(until)) => {
        debug!("Skipping {}: backing off until {}", unit, until);
        Admission::BackingOff(until)
      }
      Ok(Admission::Run) => Admission::Run,
      Err(e) => {
        error!("Failed to persist retry state of {}: {}", unit, e);
        Admission::Run
      }
    }
  }

  fn settle(&self, unit: &str, outcome: &Result<bool>) {
    let run = match outcome {
      Ok(_) => RunOutcome::Applied,
      Err(Error::Cancelled) => RunOutcome::Cancelled,
      Err(e) => RunOutcome::Failed(e),
    };
    if let Err(e) = self.ledger.record(unit, run, Utc::now()) {
      error!("Failed to persist retry state of {}: {}", unit, e);
    }
  }

  fn fail(&self, results: &mut Vec<ReconciliationResult>, resource: ResourceRef, action: Action, err: &Error) {
    let outcome = match err {
      Error::Cancelled => Outcome::Skipped,
      _ => {
        warn!("{} failed: {}", resource, err);
        Outcome::Failed
      }
    };
    results.push(self.audit.record(resource, action, outcome, Some(err)));
  }

  async fn reconcile_namespace(&self, namespace: &str, desired: &DesiredState, cancel: &CancellationToken) -> UnitOutcome {
    let unit = format!("rbac/{}", namespace);
    let mappings: Vec<&IdentityMapping> = desired.mappings_in(namespace).collect();
    let intents: Vec<&AccessIntent> = desired.intents_in(namespace).collect();
    let declared = serde_json::to_string(&(&mappings, &intents)).unwrap_or_default();
    let fingerprint = sha256_hex(&[&declared, &format!("{:?}", self.config.merge_policy)]);

    if self.admit(&unit, &fingerprint) != Admission::Run {
      return UnitOutcome::idle();
    }

    let mut results = Vec::new();
    let lock = self.namespace_locks.get(namespace);
    let outcome = tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(Error::Cancelled),
      _guard = lock.lock() => {
        self.apply_rbac(namespace, &mappings, &intents, cancel, &mut results).await
      }
    };
    if let Err(Error::Cancelled) = &outcome {
      if results.is_empty() {
        self.fail(&mut results, role_ref(namespace), Action::Noop, &Error::Cancelled);
      }
    }
    self.settle(&unit, &outcome);

    UnitOutcome {
      complete: matches!(outcome, Ok(true)),
      results,
    }
  }

  /// Plans and applies one namespace. A conflicting write triggers one fresh
  /// read and replan. Returns whether nothing had to be skipped.
  async fn apply_rbac(
    &self,
    namespace: &str,
    mappings: &[&IdentityMapping],
    intents: &[&AccessIntent],
    cancel: &CancellationToken,
    results: &mut Vec<ReconciliationResult>,
  ) -> Result<bool> {
    let mut reported: BTreeSet<ResourceRef> = BTreeSet::new();

    for attempt in 0..2 {
      let plan = match self.call(cancel, self.kube.snapshot(namespace)).await.and_then(|snapshot| {
        rbac::plan_namespace(&snapshot, mappings, intents, self.config.merge_policy)
      }) {
        Ok(plan) => plan,
        Err(e) => {
          self.fail(results, role_ref(namespace), Action::Noop, &e);
          return Err(e);
        }
      };

      for resource in &plan.unchanged {
        if reported.insert(resource.clone()) {
          results.push(self.audit.record(resource.clone(), Action::Noop, Outcome::Applied, None));
        }
      }
      for (resource, reason) in &plan.skipped {
        if reported.insert(resource.clone()) {
          warn!("Skipping {}: {}", resource, reason);
          let why = Error::validation(resource.to_string(), reason.as_str());
          results.push(self.audit.record(resource.clone(), Action::Noop, Outcome::Skipped, Some(&why)));
        }
      }

      let mut patches = plan.patches.iter();
      let mut conflicted = false;
      while let Some(patch) = patches.next() {
        let resource = patch.resource_ref();
        match self.call(cancel, self.kube.apply(patch)).await {
          Ok(()) => {
            info!("{:?} {}", patch.action, resource);
            reported.insert(resource.clone());
            results.push(self.audit.record(resource, patch.action, Outcome::Applied, None));
          }
          Err(Error::Conflict(msg)) if attempt == 0 => {
            debug!("Conflict on {}, re-reading namespace {}: {}", resource, namespace, msg);
            conflicted = true;
            break;
          }
          Err(e) => {
            reported.insert(resource.clone());
            self.fail(results, resource, patch.action, &e);
            for rest in patches {
              let resource = rest.resource_ref();
              if reported.insert(resource.clone()) {
                results.push(self.audit.record(resource, rest.action, Outcome::Skipped, None));
              }
            }
            return Err(e);
          }
        }
      }
      if !conflicted {
        return Ok(plan.skipped.is_empty());
      }
    }
    Err(Error::Conflict(format!("namespace {}", namespace)))
  }

  async fn reconcile_role(
    &self,
    role: &RoleArn,
    work: &RoleWork<'_>,
    providers: &Result<BTreeSet<String>>,
    cancel: &CancellationToken,
  ) -> UnitOutcome {
    let unit = format!("trust/{}", role);
    if self.admit(&unit, &work.fingerprint()) != Admission::Run {
      return UnitOutcome::idle();
    }

    let mut results = Vec::new();
    let outcome = self.apply_trust(role, work, providers, cancel).await;
    let resource = ResourceRef::trust_policy(role);
    match &outcome {
      Ok(action) => {
        if *action != Action::Noop {
          info!("Updated trust policy of {}", role);
        }
        results.push(self.audit.record(resource, *action, Outcome::Applied, None));
      }
      Err(e) => self.fail(&mut results, resource, Action::Update, e),
    }
    let outcome = outcome.map(|_| true);
    self.settle(&unit, &outcome);

    UnitOutcome {
      complete: outcome.is_ok(),
      results,
    }
  }

  async fn apply_trust(
    &self,
    role: &RoleArn,
    work: &RoleWork<'_>,
    providers: &Result<BTreeSet<String>>,
    cancel: &CancellationToken,
  ) -> Result<Action> {
    let issuer = &self.config.oidc_issuer;
    let document = match self.call(cancel, self.iam.get_trust_policy(role)).await {
      // nothing to grant and the role is gone: nothing left to revoke either
      Err(Error::NotFound(msg)) if work.granted.is_empty() && work.deferred.is_empty() => {
        info!("Role {} no longer exists ({}), forgetting its grants", role, msg);
        return Ok(Action::Noop);
      }
      other => other?,
    };
    let observed = TrustPolicy::parse(&document).map_err(|e| Error::MalformedTrustPolicy {
      resource: role.to_string(),
      message: e.to_string(),
    })?;

    // a grant we applied before vanished entirely: somebody rewrote the
    // role by hand, and putting our statement back would widen access
    let applied_before = work.granted.iter().chain(&work.deferred).any(|m| {
      let key = m.key();
      self
        .store
        .get(&key.namespace, &key.name)
        .map_or(false, |r| r.fingerprint.is_some() && r.mapping.role_arn == m.role_arn)
    });
    if applied_before {
      trust::validate(role, &observed)?;
    }

    if !work.granted.is_empty() {
      let provider = trust::oidc_provider_arn(role, issuer);
      let registered = match providers {
        Ok(providers) => providers.contains(&provider),
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => return Err(Error::ExternalApi(format!("listing OIDC providers: {}", e))),
      };
      if !registered {
        return Err(Error::validation(
          role.to_string(),
          format!("OIDC provider {} is not registered", provider),
        ));
      }
    }

    let mut expected = Vec::new();
    for mapping in &work.granted {
      expected.push(trust::synthesize(mapping, issuer)?);
    }
    // deferred grants stay exactly as they are: neither added nor revoked
    for mapping in &work.deferred {
      let sid = trust::synthesize(mapping, issuer)?.sid;
      if let Some(current) = observed.managed(issuer).find(|s| s.sid == sid) {
        expected.push(current.clone());
      }
    }

    let delta = trust::diff(&expected, &observed.statements(), issuer);
    if delta.is_empty() {
      return Ok(Action::Noop);
    }
    info!(
      "Trust policy drift on {}: {} missing, {} extra, {} condition mismatch(es)",
      role,
      delta.missing.len(),
      delta.extra.len(),
      delta.condition_mismatches.len()
    );
    let document = trust::render(&observed, &expected, issuer).to_string();
    self
      .call(cancel, self.iam.update_trust_policy(role, &document))
      .await?;
    Ok(Action::Update)
  }

  /// Store bookkeeping. The engine is the only writer: a mapping is updated
  /// once both its old and new role settled, and dropped once the grant in its
  /// last known role is revoked.
  fn commit(
    &self,
    desired: &DesiredState,
    previous: &[StoredMapping],
    roles: &BTreeMap<RoleArn, RoleWork<'_>>,
    settled: &BTreeSet<RoleArn>,
  ) -> Vec<ReconciliationResult> {
    let now = Utc::now();
    let mut results = Vec::new();
    let previous: BTreeMap<ServiceAccountRef, &StoredMapping> =
      previous.iter().map(|p| (p.mapping.key(), p)).collect();
    let settled_role = |arn: &str| RoleArn::parse(arn).map_or(false, |r| settled.contains(&r));

    for mapping in &desired.mappings {
      let key = mapping.key();
      let stored = previous.get(&key);
      let old_settled = stored.map_or(true, |s| s.mapping.role_arn == mapping.role_arn || settled_role(&s.mapping.role_arn));
      if !settled_role(&mapping.role_arn) || !old_settled {
        continue;
      }
      let work = RoleArn::parse(&mapping.role_arn).ok().and_then(|r| roles.get(&r));
      let fingerprint = match work {
        Some(w) if w.granted.iter().any(|m| m.key() == key) => {
          Some(TrustCondition::from_mapping(mapping, &self.config.oidc_issuer).fingerprint())
        }
        Some(w) if w.deferred.iter().any(|m| m.key() == key) => stored.and_then(|s| s.fingerprint.clone()),
        _ => None,
      };
      let mut record = mapping.clone();
      record.last_reconciled_at = Some(now);
      if let Err(e) = self.write_mapping(record, fingerprint) {
        self.fail(&mut results, mapping_ref(&key), Action::Update, &e);
      }
    }

    for (key, stored) in &previous {
      if desired.mapping(key).is_some() || !settled_role(&stored.mapping.role_arn) {
        continue;
      }
      match self.store.delete(&key.namespace, &key.name) {
        Ok(()) => debug!("Forgot identity mapping {}", key),
        Err(e) => self.fail(&mut results, mapping_ref(key), Action::Delete, &e),
      }
    }
    results
  }

  /// Compare-and-swap against the current version, retried once on a lost race
  fn write_mapping(&self, mapping: IdentityMapping, fingerprint: Option<String>) -> Result<()> {
    let key = mapping.key();
    let mut retried = false;
    loop {
      let version = match self.store.get(&key.namespace, &key.name) {
        Ok(current) => current.version,
        Err(Error::NotFound(_)) => 0,
        Err(e) => return Err(e),
      };
      match self.store.compare_and_swap(mapping.clone(), fingerprint.clone(), version) {
        Err(Error::Conflict(msg)) if !retried => {
          debug!("Retrying write of {}: {}", key, msg);
          retried = true;
        }
        other => return other.map(|_| ()),
      }
    }
  }
}

fn role_ref(namespace: &str) -> ResourceRef {
  ResourceRef::namespaced(ResourceKind::Role, namespace, ROLE_NAME)
}

fn mapping_ref(key: &ServiceAccountRef) -> ResourceRef {
  ResourceRef::namespaced(ResourceKind::IdentityMapping, &key.namespace, &key.name)
}
