//! IAM trust statements, compared in canonical form so IAM reformatting is not drift.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};

use crate::{
  error::{Error, Result},
  model::{normalize_issuer, sha256_hex, IdentityMapping, RoleArn, TrustCondition},
};

pub const WEB_IDENTITY_ACTION: &str = "sts:AssumeRoleWithWebIdentity";
pub const MANAGED_SID_PREFIX: &str = "IrsaOperator";
const POLICY_VERSION: &str = "2012-10-17";

/// operator -> key -> values
pub type Conditions = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
  pub sid: Option<String>,
  pub effect: String,
  pub principals: BTreeMap<String, BTreeSet<String>>,
  pub actions: BTreeSet<String>,
  pub conditions: Conditions,
}

impl Statement {
  /// Carries the managed Sid prefix and federates this cluster's issuer.
  /// Operators of other clusters sharing a role own their own statements.
  pub fn is_managed_by(&self, issuer: &str) -> bool {
    let provider = format!(":oidc-provider/{}", normalize_issuer(issuer));
    self.sid.as_deref().map_or(false, |sid| sid.starts_with(MANAGED_SID_PREFIX))
      && self
        .principals
        .get("Federated")
        .map_or(false, |arns| !arns.is_empty() && arns.iter().all(|a| a.ends_with(&provider)))
  }

  pub fn allows_web_identity(&self) -> bool {
    self
      .actions
      .iter()
      .any(|a| a.eq_ignore_ascii_case(WEB_IDENTITY_ACTION))
  }

  /// Same grant, whatever the Sid says
  fn same_grant(&self, other: &Statement) -> bool {
    self.effect == other.effect
      && self.principals == other.principals
      && self.actions == other.actions
      && self.conditions == other.conditions
  }

  fn same_target(&self, other: &Statement) -> bool {
    self.effect == other.effect && self.principals == other.principals && self.actions == other.actions
  }

  fn from_json(value: &Value) -> Result<Self> {
    let malformed = |msg: &str| Error::MalformedTrustPolicy {
      resource: "statement".to_string(),
      message: msg.to_string(),
    };
    let obj = value.as_object().ok_or_else(|| malformed("statement is not an object"))?;

    let effect = obj
      .get("Effect")
      .and_then(Value::as_str)
      .ok_or_else(|| malformed("statement has no Effect"))?
      .to_string();

    let principals: BTreeMap<String, BTreeSet<String>> = match obj.get("Principal") {
      None => BTreeMap::new(),
      Some(Value::String(s)) => BTreeMap::from([("AWS".to_string(), BTreeSet::from([s.clone()]))]),
      Some(Value::Object(map)) => map
        .iter()
        .map(|(k, v)| string_set(v).map(|set| (k.clone(), set)).ok_or_else(|| malformed("bad Principal")))
        .collect::<Result<_>>()?,
      Some(_) => return Err(malformed("bad Principal")),
    };

    let actions = match obj.get("Action") {
      None => BTreeSet::new(),
      Some(v) => string_set(v).ok_or_else(|| malformed("bad Action"))?,
    };

    let mut conditions = Conditions::new();
    if let Some(cond) = obj.get("Condition") {
      let cond = cond.as_object().ok_or_else(|| malformed("bad Condition"))?;
      for (op, keys) in cond {
        let keys = keys.as_object().ok_or_else(|| malformed("bad Condition"))?;
        let entry = conditions.entry(op.clone()).or_default();
        for (key, values) in keys {
          entry.insert(key.clone(), string_set(values).ok_or_else(|| malformed("bad Condition value"))?);
        }
      }
    }

    Ok(Statement {
      sid: obj.get("Sid").and_then(Value::as_str).map(str::to_string),
      effect,
      principals,
      actions,
      conditions,
    })
  }

  pub fn to_json(&self) -> Value {
    let mut obj = Map::new();
    if let Some(sid) = &self.sid {
      obj.insert("Sid".into(), json!(sid));
    }
    obj.insert("Effect".into(), json!(self.effect));
    if !self.principals.is_empty() {
      let principals: Map<String, Value> = self
        .principals
        .iter()
        .map(|(k, v)| (k.clone(), set_to_json(v)))
        .collect();
      obj.insert("Principal".into(), Value::Object(principals));
    }
    obj.insert("Action".into(), set_to_json(&self.actions));
    if !self.conditions.is_empty() {
      let conditions: Map<String, Value> = self
        .conditions
        .iter()
        .map(|(op, keys)| {
          let keys: Map<String, Value> = keys.iter().map(|(k, v)| (k.clone(), set_to_json(v))).collect();
          (op.clone(), Value::Object(keys))
        })
        .collect();
      obj.insert("Condition".into(), Value::Object(conditions));
    }
    Value::Object(obj)
  }
}

fn string_set(value: &Value) -> Option<BTreeSet<String>> {
  let scalar = |v: &Value| match v {
    Value::String(s) => Some(s.clone()),
    Value::Bool(b) => Some(b.to_string()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  };
  match value {
    Value::Array(items) => items.iter().map(scalar).collect(),
    other => scalar(other).map(|s| BTreeSet::from([s])),
  }
}

fn set_to_json(set: &BTreeSet<String>) -> Value {
  if set.len() == 1 {
    json!(set.iter().next())
  } else {
    json!(set)
  }
}

/// A trust policy as read back from IAM
#[derive(Clone, Debug)]
pub struct TrustPolicy {
  pub version: String,
  statements: Vec<(Statement, Value)>,
}

impl TrustPolicy {
  pub fn parse(document: &str) -> Result<Self> {
    if document.trim().is_empty() {
      return Ok(Self {
        version: POLICY_VERSION.to_string(),
        statements: Vec::new(),
      });
    }
    let value: Value = serde_json::from_str(document)?;
    let version = value
      .get("Version")
      .and_then(Value::as_str)
      .unwrap_or(POLICY_VERSION)
      .to_string();
    let raw = match value.get("Statement") {
      None | Some(Value::Null) => Vec::new(),
      Some(Value::Array(items)) => items.clone(),
      Some(single) => vec![single.clone()],
    };
    let statements = raw
      .into_iter()
      .map(|v| Statement::from_json(&v).map(|s| (s, v)))
      .collect::<Result<_>>()?;
    Ok(Self { version, statements })
  }

  pub fn statements(&self) -> Vec<Statement> {
    self.statements.iter().map(|(s, _)| s.clone()).collect()
  }

  /// Statements this operator manages for `issuer` that are currently present
  pub fn managed<'a>(&'a self, issuer: &'a str) -> impl Iterator<Item = &'a Statement> + 'a {
    self.statements.iter().map(|(s, _)| s).filter(move |s| s.is_managed_by(issuer))
  }
}

pub fn oidc_provider_arn(role: &RoleArn, issuer: &str) -> String {
  format!(
    "arn:{}:iam::{}:oidc-provider/{}",
    role.partition,
    role.account,
    normalize_issuer(issuer)
  )
}

/// Sid for the statement granting one service account. It only depends on
/// issuer and subject, so an audience change shows up as a condition mismatch.
pub fn managed_sid(condition: &TrustCondition) -> String {
  let digest = sha256_hex(&[condition.oidc_provider_url.as_str(), condition.subject_claim.as_str()]);
  format!("{}{}", MANAGED_SID_PREFIX, &digest[..16])
}

/// The statement that lets `mapping`'s service account assume its role
pub fn synthesize(mapping: &IdentityMapping, issuer: &str) -> Result<Statement> {
  let role = mapping.role()?;
  let condition = TrustCondition::from_mapping(mapping, issuer);
  let provider = &condition.oidc_provider_url;
  let string_equals = BTreeMap::from([
    (format!("{}:aud", provider), BTreeSet::from([condition.audience_claim.clone()])),
    (format!("{}:sub", provider), BTreeSet::from([condition.subject_claim.clone()])),
  ]);

  Ok(Statement {
    sid: Some(managed_sid(&condition)),
    effect: "Allow".to_string(),
    principals: BTreeMap::from([(
      "Federated".to_string(),
      BTreeSet::from([oidc_provider_arn(&role, issuer)]),
    )]),
    actions: BTreeSet::from([WEB_IDENTITY_ACTION.to_string()]),
    conditions: BTreeMap::from([("StringEquals".to_string(), string_equals)]),
  })
}

/// A document without any web identity statement can not be an IRSA role
pub fn validate(role: &RoleArn, policy: &TrustPolicy) -> Result<()> {
  if policy.statements.iter().any(|(s, _)| s.allows_web_identity()) {
    Ok(())
  } else {
    Err(Error::MalformedTrustPolicy {
      resource: role.to_string(),
      message: format!("no {} statement", WEB_IDENTITY_ACTION),
    })
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionMismatch {
  pub sid: String,
  pub expected: Conditions,
  pub observed: Conditions,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustDelta {
  pub missing: Vec<Statement>,
  /// Managed statements nothing asks for anymore
  pub extra: Vec<Statement>,
  pub condition_mismatches: Vec<ConditionMismatch>,
}

impl TrustDelta {
  pub fn is_empty(&self) -> bool {
    self.missing.is_empty() && self.extra.is_empty() && self.condition_mismatches.is_empty()
  }
}

pub fn diff(expected: &[Statement], observed: &[Statement], issuer: &str) -> TrustDelta {
  let mut delta = TrustDelta::default();
  let mut matched = vec![false; observed.len()];

  for want in expected {
    if let Some(idx) = (0..observed.len()).find(|&i| !matched[i] && observed[i].same_grant(want)) {
      matched[idx] = true;
      continue;
    }
    let by_sid = (0..observed.len()).find(|&i| !matched[i] && want.sid.is_some() && observed[i].sid == want.sid);
    match by_sid {
      Some(idx) if observed[idx].same_target(want) => {
        matched[idx] = true;
        delta.condition_mismatches.push(ConditionMismatch {
          sid: want.sid.clone().unwrap_or_default(),
          expected: want.conditions.clone(),
          observed: observed[idx].conditions.clone(),
        });
      }
      _ => delta.missing.push(want.clone()),
    }
  }

  delta.extra = observed
    .iter()
    .zip(matched)
    .filter(|(s, hit)| !hit && s.is_managed_by(issuer))
    .map(|(s, _)| s.clone())
    .collect();
  delta
}

/// New document: foreign statements untouched, managed ones replaced by `expected`
pub fn render(observed: &TrustPolicy, expected: &[Statement], issuer: &str) -> Value {
  let mut expected = expected.to_vec();
  expected.sort_by(|a, b| a.sid.cmp(&b.sid));
  let statements: Vec<Value> = observed
    .statements
    .iter()
    .filter(|(s, _)| !s.is_managed_by(issuer))
    .map(|(_, raw)| raw.clone())
    .chain(expected.iter().map(Statement::to_json))
    .collect();
  json!({ "Version": observed.version, "Statement": statements })
}
