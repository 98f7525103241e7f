//! Versioned identity mapping records, optionally persisted to a JSON file.

use std::{
  collections::BTreeMap,
  fs,
  ops::Bound,
  path::{Path, PathBuf},
  sync::{PoisonError, RwLock},
};

use chrono::Utc;
use log::debug;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
  error::{Error, Result},
  model::{IdentityMapping, ServiceAccountRef},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMapping {
  pub mapping: IdentityMapping,
  /// Trust condition fingerprint of the grant last applied to IAM, if any
  #[serde(default)]
  pub fingerprint: Option<String>,
  pub version: u64,
}

pub struct MappingStore {
  records: RwLock<BTreeMap<ServiceAccountRef, StoredMapping>>,
  path: Option<PathBuf>,
}

impl MappingStore {
  pub fn in_memory() -> Self {
    Self {
      records: RwLock::new(BTreeMap::new()),
      path: None,
    }
  }

  /// Opens a file backed store, loading existing records if the file is there
  pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
    let path = path.into();
    let records: Vec<StoredMapping> = read_json(&path)?.unwrap_or_default();
    debug!("Loaded {} identity mappings from {}", records.len(), path.display());

    Ok(Self {
      records: RwLock::new(records.into_iter().map(|r| (r.mapping.key(), r)).collect()),
      path: Some(path),
    })
  }

  pub fn get(&self, namespace: &str, service_account: &str) -> Result<StoredMapping> {
    let key = ServiceAccountRef::new(namespace, service_account);
    self
      .records
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(&key)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("identity mapping {}", key)))
  }

  /// Unconditional upsert. Keeps `createdAt` of an existing record.
  pub fn put(&self, mapping: IdentityMapping) -> Result<u64> {
    mapping.validate()?;
    let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
    let previous = records.get(&mapping.key()).cloned();
    let version = previous.as_ref().map_or(0, |p| p.version) + 1;
    let record = StoredMapping {
      mapping: with_created_at(mapping, previous.as_ref()),
      fingerprint: previous.and_then(|p| p.fingerprint),
      version,
    };
    let key = record.mapping.key();
    self.replace(&mut records, key, Some(record))?;
    Ok(version)
  }

  /// Writes only if the stored version still equals `expected_version`
  /// (0 meaning "not present"). Returns the new version.
  pub fn compare_and_swap(
    &self,
    mapping: IdentityMapping,
    fingerprint: Option<String>,
    expected_version: u64,
  ) -> Result<u64> {
    mapping.validate()?;
    let key = mapping.key();
    let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
    let previous = records.get(&key);
    let current = previous.map_or(0, |p| p.version);
    if current != expected_version {
      return Err(Error::Conflict(format!(
        "identity mapping {} (expected version {}, found {})",
        key, expected_version, current
      )));
    }
    let record = StoredMapping {
      mapping: with_created_at(mapping, previous),
      fingerprint,
      version: current + 1,
    };
    self.replace(&mut records, key, Some(record))?;
    Ok(current + 1)
  }

  /// Removing an absent key is not an error
  pub fn delete(&self, namespace: &str, service_account: &str) -> Result<()> {
    let key = ServiceAccountRef::new(namespace, service_account);
    let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
    if records.contains_key(&key) {
      self.replace(&mut records, key, None)?;
    }
    Ok(())
  }

  /// Lazy iteration in (namespace, service account) order
  pub fn list(&self) -> Iter<'_> {
    self.list_after(None)
  }

  /// Resumes a listing right after `cursor`
  pub fn list_after(&self, cursor: Option<ServiceAccountRef>) -> Iter<'_> {
    Iter { store: self, cursor }
  }

  /// Swaps one entry and flushes; the previous entry is put back if the flush fails
  fn replace(
    &self,
    records: &mut BTreeMap<ServiceAccountRef, StoredMapping>,
    key: ServiceAccountRef,
    record: Option<StoredMapping>,
  ) -> Result<()> {
    let previous = match record {
      Some(r) => records.insert(key.clone(), r),
      None => records.remove(&key),
    };
    if let Err(e) = self.flush(records) {
      match previous {
        Some(p) => records.insert(key, p),
        None => records.remove(&key),
      };
      return Err(e);
    }
    Ok(())
  }

  fn flush(&self, records: &BTreeMap<ServiceAccountRef, StoredMapping>) -> Result<()> {
    match &self.path {
      Some(path) => write_json_atomic(path, &records.values().collect::<Vec<_>>()),
      None => Ok(()),
    }
  }
}

fn with_created_at(mut mapping: IdentityMapping, previous: Option<&StoredMapping>) -> IdentityMapping {
  mapping.created_at = previous
    .and_then(|p| p.mapping.created_at)
    .or(mapping.created_at)
    .or_else(|| Some(Utc::now()));
  mapping
}

/// Each step takes the read lock once, so writers are never blocked by a slow consumer.
pub struct Iter<'a> {
  store: &'a MappingStore,
  cursor: Option<ServiceAccountRef>,
}

impl Iter<'_> {
  /// Position to hand to [`MappingStore::list_after`] to pick up where this left off
  pub fn cursor(&self) -> Option<&ServiceAccountRef> {
    self.cursor.as_ref()
  }
}

impl Iterator for Iter<'_> {
  type Item = StoredMapping;

  fn next(&mut self) -> Option<StoredMapping> {
    let records = self.store.records.read().unwrap_or_else(PoisonError::into_inner);
    let lower = match &self.cursor {
      Some(key) => Bound::Excluded(key),
      None => Bound::Unbounded,
    };
    let (key, record) = records.range((lower, Bound::Unbounded)).next()?;
    self.cursor = Some(key.clone());
    Some(record.clone())
  }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
  match fs::read(path) {
    Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
    Err(e) => Err(e.into()),
  }
}

pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
  let tmp = path.with_extension("tmp");
  fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
  fs::rename(&tmp, path)?;
  Ok(())
}
