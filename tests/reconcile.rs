mod common;

use std::{sync::atomic::Ordering, time::Duration};

use k8s_openapi::{
  api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef},
  apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use tokio_util::sync::CancellationToken;

use common::*;
use operator::{
  engine::EngineConfig,
  error::ErrorKind,
  model::{Action, IdentityMapping, Outcome, ResourceKind, ResourceRef, RoleArn, ServiceAccountRef},
  rbac::{self, RbacObject, ROLE_ARN_ANNOTATION, ROLE_NAME},
  retry::UnitPhase,
  trust,
};

const NS: &str = "demo-namespace";
const SA: &str = "demo-service-account";

fn trust_unit() -> String {
  format!("trust/{}", ROLE)
}

fn managed_statements(world: &World) -> usize {
  world.policy(ROLE).managed(ISSUER).count()
}

#[tokio::test]
async fn demo_mapping_is_applied_on_both_sides() {
  let world = World::new();
  let engine = engine(&world);
  let report = engine.run_cycle(&demo(), &CancellationToken::new()).await.unwrap();

  let sa = world.service_account(NS, SA).expect("service account created");
  let annotations = sa.metadata.annotations.unwrap();
  assert_eq!(annotations[ROLE_ARN_ANNOTATION], ROLE);

  let role = world.role(NS, ROLE_NAME).expect("role created");
  let rule = &role.rules.unwrap()[0];
  assert_eq!(rule.resources, Some(vec!["pods".to_string()]));
  assert_eq!(rule.verbs, vec!["get".to_string(), "list".to_string()]);
  let binding = world.role_binding(NS, &rbac::role_binding_name(SA)).expect("binding created");
  assert_eq!(binding.role_ref.name, ROLE_NAME);

  let policy = world.policy(ROLE);
  let granted: Vec<_> = policy.managed(ISSUER).collect();
  assert_eq!(granted.len(), 1);
  let conditions = &granted[0].conditions["StringEquals"];
  let provider = "oidc.eks.us-east-1.amazonaws.com/id/EXAMPLED539D4633E53DE1B71EXAMPLE";
  assert!(conditions[&format!("{}:sub", provider)].contains("system:serviceaccount:demo-namespace:demo-service-account"));
  assert!(conditions[&format!("{}:aud", provider)].contains("sts.amazonaws.com"));
  // the statement somebody else wrote survives
  assert_eq!(policy.statements().len(), 2);

  assert_eq!(report.failures(), 0);
  assert_eq!(report.patches(), 4);
  let stored = engine.store().get(NS, SA).unwrap();
  assert!(stored.fingerprint.is_some());
  assert!(stored.mapping.last_reconciled_at.is_some());
  assert_eq!(engine.ledger().state(&trust_unit()).unwrap().phase, UnitPhase::Applied);
}

#[tokio::test]
async fn second_cycle_is_a_noop() {
  let world = World::new();
  let engine = engine(&world);
  let cancel = CancellationToken::new();
  engine.run_cycle(&demo(), &cancel).await.unwrap();
  let journal = world.journal().len();

  let report = engine.run_cycle(&demo(), &cancel).await.unwrap();
  assert_eq!(report.patches(), 0);
  assert!(report.results.iter().all(|r| r.action == Action::Noop && r.outcome == Outcome::Applied));
  assert_eq!(world.journal().len(), journal);
  assert_eq!(world.policy_updates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn removing_the_intent_revokes_rbac_and_trust() {
  let world = World::new();
  let engine = engine(&world);
  let cancel = CancellationToken::new();
  engine.run_cycle(&demo(), &cancel).await.unwrap();

  let report = engine.run_cycle(&demo_without_intent(), &cancel).await.unwrap();
  assert_eq!(report.failures(), 0);
  assert!(world.role(NS, ROLE_NAME).is_none());
  assert!(world.role_binding(NS, &rbac::role_binding_name(SA)).is_none());
  assert_eq!(managed_statements(&world), 0);
  assert_eq!(world.policy(ROLE).statements().len(), 1);
  // the mapping itself is still declared
  assert!(world.service_account(NS, SA).is_some());
  assert_eq!(engine.store().get(NS, SA).unwrap().fingerprint, None);

  let deletes: Vec<_> = report
    .of_kind(ResourceKind::RoleBinding)
    .chain(report.of_kind(ResourceKind::Role))
    .map(|r| r.action)
    .collect();
  assert_eq!(deletes, vec![Action::Delete, Action::Delete]);
}

#[tokio::test]
async fn dropping_the_mapping_cleans_up_everything() {
  let world = World::new();
  let engine = engine(&world);
  let cancel = CancellationToken::new();
  engine.run_cycle(&demo(), &cancel).await.unwrap();

  let report = engine
    .run_cycle(&Default::default(), &cancel)
    .await
    .unwrap();
  assert_eq!(report.failures(), 0);
  assert!(world.service_account(NS, SA).is_none());
  assert!(world.role(NS, ROLE_NAME).is_none());
  assert_eq!(managed_statements(&world), 0);
  assert!(engine.store().get(NS, SA).is_err());
  assert_eq!(engine.store().list().count(), 0);
}

#[tokio::test]
async fn hanging_iam_gets_stuck_after_max_attempts() {
  let world = World::new();
  world.hang_updates.store(true, Ordering::SeqCst);
  let engine = engine(&world);
  let cancel = CancellationToken::new();

  for attempt in 1..=3 {
    let report = engine.run_cycle(&demo(), &cancel).await.unwrap();
    let trust: Vec<_> = report.of_kind(ResourceKind::TrustPolicy).collect();
    assert_eq!(trust.len(), 1, "attempt {}", attempt);
    assert_eq!(trust[0].outcome, Outcome::Failed);
    assert_eq!(trust[0].error.as_ref().unwrap().kind, ErrorKind::ExternalApiError);
  }
  let state = engine.ledger().state(&trust_unit()).unwrap();
  assert_eq!(state.phase, UnitPhase::Stuck);
  assert_eq!(state.attempts, 3);

  // a stuck unit is left alone, the rest keeps going
  let report = engine.run_cycle(&demo(), &cancel).await.unwrap();
  assert_eq!(report.of_kind(ResourceKind::TrustPolicy).count(), 0);
  assert!(report.of_kind(ResourceKind::Role).count() > 0);
  assert_eq!(world.policy_updates.load(Ordering::SeqCst), 3);
  assert_eq!(engine.store().get(NS, SA).unwrap().fingerprint, None);
}

#[tokio::test]
async fn changing_the_declaration_releases_a_stuck_unit() {
  let world = World::new();
  world.hang_updates.store(true, Ordering::SeqCst);
  let engine = engine(&world);
  let cancel = CancellationToken::new();
  for _ in 0..3 {
    engine.run_cycle(&demo(), &cancel).await.unwrap();
  }
  assert_eq!(engine.ledger().state(&trust_unit()).unwrap().phase, UnitPhase::Stuck);

  world.hang_updates.store(false, Ordering::SeqCst);
  let mut desired = demo();
  desired.mappings[0].audience = "sts.example.com".into();
  let report = engine.run_cycle(&desired, &cancel).await.unwrap();

  let trust: Vec<_> = report.of_kind(ResourceKind::TrustPolicy).collect();
  assert_eq!(trust[0].outcome, Outcome::Applied);
  assert_eq!(trust[0].action, Action::Update);
  assert_eq!(engine.ledger().state(&trust_unit()).unwrap().phase, UnitPhase::Applied);
  let audience = world.policy(ROLE).managed(ISSUER).next().unwrap().conditions["StringEquals"]
    .iter()
    .find(|(k, _)| k.ends_with(":aud"))
    .map(|(_, v)| v.clone())
    .unwrap();
  assert!(audience.contains("sts.example.com"));
}

#[tokio::test]
async fn deleted_role_is_forgotten_once_nothing_grants_through_it() {
  let world = World::new();
  let engine = engine(&world);
  let cancel = CancellationToken::new();
  engine.run_cycle(&demo(), &cancel).await.unwrap();

  world.remove_role(ROLE);
  let report = engine.run_cycle(&Default::default(), &cancel).await.unwrap();
  assert_eq!(report.failures(), 0);
  let trust = report.of_kind(ResourceKind::TrustPolicy).next().unwrap();
  assert_eq!((trust.action, trust.outcome), (Action::Noop, Outcome::Applied));
  assert_eq!(engine.store().list().count(), 0);
  assert_eq!(engine.ledger().state(&trust_unit()).unwrap().phase, UnitPhase::Applied);

  // while a mapping still points at it, a missing role is a failure
  let report = engine.run_cycle(&demo(), &cancel).await.unwrap();
  let trust = report.of_kind(ResourceKind::TrustPolicy).next().unwrap();
  assert_eq!(trust.outcome, Outcome::Failed);
  assert_eq!(trust.error.as_ref().unwrap().kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn cycle_that_can_not_start_is_still_recorded() {
  let world = World::new();
  let engine = engine(&world);
  let cancel = CancellationToken::new();

  world.fail_discovery.store(true, Ordering::SeqCst);
  assert!(engine.run_cycle(&demo(), &cancel).await.is_err());
  let records = engine.audit().records();
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].resource, ResourceRef::cycle());
  assert_eq!(records[0].outcome, Outcome::Failed);
  assert_eq!(records[0].error.as_ref().unwrap().kind, ErrorKind::ExternalApiError);

  let mut invalid = demo();
  invalid.mappings[0].role_arn = "not-an-arn".into();
  assert!(engine.run_cycle(&invalid, &cancel).await.is_err());
  let records = engine.audit().records();
  assert_eq!(records.len(), 2);
  assert_eq!(records[1].resource.kind, ResourceKind::Cycle);
  assert_eq!(records[1].error.as_ref().unwrap().kind, ErrorKind::ValidationError);
}

#[tokio::test]
async fn kubernetes_side_lands_before_the_grant() {
  let world = World::new();
  let engine = engine(&world);
  let report = engine.run_cycle(&demo(), &CancellationToken::new()).await.unwrap();

  let journal = world.journal();
  let grant = journal.iter().position(|e| e.starts_with("iam update")).unwrap();
  let last_kube = journal.iter().rposition(|e| e.starts_with("kube")).unwrap();
  assert!(last_kube < grant, "{:?}", journal);

  let last_rbac = report
    .results
    .iter()
    .filter(|r| r.resource.kind != ResourceKind::TrustPolicy)
    .map(|r| r.timestamp)
    .max()
    .unwrap();
  let trust = report.of_kind(ResourceKind::TrustPolicy).next().unwrap();
  assert!(last_rbac <= trust.timestamp);
}

#[tokio::test]
async fn failed_rbac_defers_the_grant() {
  let world = World::new();
  world.fail_writes_to(Some(ResourceKind::RoleBinding));
  let engine = engine(&world);
  let cancel = CancellationToken::new();

  let report = engine.run_cycle(&demo(), &cancel).await.unwrap();
  let binding = report.of_kind(ResourceKind::RoleBinding).next().unwrap();
  assert_eq!(binding.outcome, Outcome::Failed);
  assert_eq!(managed_statements(&world), 0);
  assert_eq!(world.policy_updates.load(Ordering::SeqCst), 0);
  let trust = report.of_kind(ResourceKind::TrustPolicy).next().unwrap();
  assert_eq!(trust.action, Action::Noop);

  world.fail_writes_to(None);
  engine.run_cycle(&demo(), &cancel).await.unwrap();
  assert_eq!(managed_statements(&world), 1);
}

#[tokio::test]
async fn foreign_objects_are_never_touched() {
  let world = World::new();
  let foreign_role = Role {
    metadata: ObjectMeta {
      name: Some(ROLE_NAME.into()),
      namespace: Some(NS.into()),
      ..ObjectMeta::default()
    },
    rules: Some(vec![PolicyRule {
      api_groups: Some(vec!["".into()]),
      resources: Some(vec!["secrets".into()]),
      verbs: vec!["get".into()],
      ..PolicyRule::default()
    }]),
  };
  let unrelated = RoleBinding {
    metadata: ObjectMeta {
      name: Some("team-readers".into()),
      namespace: Some(NS.into()),
      ..ObjectMeta::default()
    },
    role_ref: RoleRef {
      api_group: "rbac.authorization.k8s.io".into(),
      kind: "ClusterRole".into(),
      name: "view".into(),
    },
    subjects: None,
  };
  world.seed(RbacObject::Role(foreign_role.clone()));
  world.seed(RbacObject::RoleBinding(unrelated));
  let engine = engine(&world);
  let cancel = CancellationToken::new();

  let report = engine.run_cycle(&demo(), &cancel).await.unwrap();
  let role = report.of_kind(ResourceKind::Role).next().unwrap();
  assert_eq!(role.outcome, Outcome::Skipped);
  assert_eq!(world.role(NS, ROLE_NAME).unwrap().rules, foreign_role.rules);
  // the namespace is not fully in place, so no grant yet
  assert_eq!(managed_statements(&world), 0);

  engine.run_cycle(&Default::default(), &cancel).await.unwrap();
  assert!(world.role(NS, ROLE_NAME).is_some());
  assert!(world.role_binding(NS, "team-readers").is_some());
  assert_eq!(world.policy(ROLE).statements().len(), 1);
}

#[tokio::test]
async fn cancellation_skips_and_keeps_the_unit_pending() {
  let world = World::new();
  world.hang_updates.store(true, Ordering::SeqCst);
  let engine = engine_with(
    &world,
    EngineConfig {
      call_timeout: Duration::from_secs(30),
      ..config()
    },
  );
  let cancel = CancellationToken::new();
  let desired = demo();

  let (report, _) = tokio::join!(engine.run_cycle(&desired, &cancel), async {
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
  });
  let report = report.unwrap();
  let trust = report.of_kind(ResourceKind::TrustPolicy).next().unwrap();
  assert_eq!(trust.outcome, Outcome::Skipped);
  assert_eq!(trust.error.as_ref().unwrap().kind, ErrorKind::Cancelled);

  let state = engine.ledger().state(&trust_unit()).unwrap();
  assert_eq!(state.phase, UnitPhase::Pending);
  assert_eq!(state.attempts, 0);
}

#[tokio::test]
async fn conflicting_write_is_replanned_from_a_fresh_read() {
  let world = World::new();
  let stale = Role {
    metadata: ObjectMeta {
      name: Some(ROLE_NAME.into()),
      namespace: Some(NS.into()),
      labels: Some([(rbac::MANAGED_BY_LABEL.to_string(), rbac::MANAGED_BY_VALUE.to_string())].into()),
      ..ObjectMeta::default()
    },
    rules: None,
  };
  world.seed(RbacObject::Role(stale));
  world.conflict_once.store(true, Ordering::SeqCst);
  let engine = engine(&world);

  let report = engine.run_cycle(&demo(), &CancellationToken::new()).await.unwrap();
  assert_eq!(report.failures(), 0);
  assert!(!world.conflict_once.load(Ordering::SeqCst));
  assert!(world.role(NS, ROLE_NAME).unwrap().rules.is_some());
  assert_eq!(managed_statements(&world), 1);
}

#[tokio::test]
async fn missing_oidc_provider_fails_validation() {
  let world = World::new().without_provider();
  let engine = engine(&world);
  let report = engine.run_cycle(&demo(), &CancellationToken::new()).await.unwrap();

  let trust = report.of_kind(ResourceKind::TrustPolicy).next().unwrap();
  assert_eq!(trust.outcome, Outcome::Failed);
  assert_eq!(trust.error.as_ref().unwrap().kind, ErrorKind::ValidationError);
  assert_eq!(engine.ledger().state(&trust_unit()).unwrap().phase, UnitPhase::Stuck);
}

#[tokio::test]
async fn hand_rewritten_trust_policy_is_reported_malformed() {
  let world = World::new();
  let engine = engine(&world);
  let cancel = CancellationToken::new();
  engine.run_cycle(&demo(), &cancel).await.unwrap();

  world.set_policy(ROLE, BASE_POLICY);
  let report = engine.run_cycle(&demo(), &cancel).await.unwrap();
  let trust = report.of_kind(ResourceKind::TrustPolicy).next().unwrap();
  assert_eq!(trust.outcome, Outcome::Failed);
  assert_eq!(trust.error.as_ref().unwrap().kind, ErrorKind::MalformedTrustPolicy);
  assert_eq!(managed_statements(&world), 0);
}

#[tokio::test]
async fn moving_a_mapping_to_another_role_revokes_the_old_grant() {
  let world = World::new();
  let other = "arn:aws:iam::123456789012:role/other-irsa-role";
  world.set_policy(other, BASE_POLICY);
  let engine = engine(&world);
  let cancel = CancellationToken::new();
  engine.run_cycle(&demo(), &cancel).await.unwrap();

  let mut desired = demo();
  desired.mappings[0].role_arn = other.into();
  let report = engine.run_cycle(&desired, &cancel).await.unwrap();
  assert_eq!(report.failures(), 0);
  assert_eq!(managed_statements(&world), 0);
  assert_eq!(world.policy(other).managed(ISSUER).count(), 1);
  assert_eq!(engine.store().get(NS, SA).unwrap().mapping.role_arn, other);
  let sa = world.service_account(NS, SA).unwrap();
  assert_eq!(sa.metadata.annotations.unwrap()[ROLE_ARN_ANNOTATION], other);
}

#[tokio::test]
async fn results_name_the_touched_resources() {
  let world = World::new();
  let engine = engine(&world);
  let report = engine.run_cycle(&demo(), &CancellationToken::new()).await.unwrap();

  let touched: Vec<ResourceRef> = report.results.iter().map(|r| r.resource.clone()).collect();
  let role = RoleArn::parse(ROLE).unwrap();
  assert!(touched.contains(&ResourceRef::trust_policy(&role)));
  assert!(touched.contains(&ResourceRef::namespaced(ResourceKind::ServiceAccount, NS, SA)));
  assert_eq!(engine.audit().records(), report.results);

  let statement = trust::synthesize(&IdentityMapping::new(NS, SA, ROLE), ISSUER).unwrap();
  assert!(world.policy(ROLE).managed(ISSUER).any(|s| s.sid == statement.sid));
  let stored: Vec<ServiceAccountRef> = engine.store().list().map(|r| r.mapping.key()).collect();
  assert_eq!(stored, vec![ServiceAccountRef::new(NS, SA)]);
}
