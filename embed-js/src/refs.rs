//! Numeric handle tables used to name host objects across the engine boundary.
//!
//! The engine only ever sees small decimal ids embedded in [`CallbackId`] strings; the tables
//! here map those ids back to host records when a callback arrives.

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use crate::Error;

/// A dense id, local to the table that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId(pub u64);

impl fmt::Display for RefId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Records that can be stored in a [`RefTable`]. The key identifies "the same record" so
/// re-adding it reuses its id.
pub trait RefKey {
  fn ref_key(&self) -> usize;
}

impl<T: ?Sized> RefKey for Arc<T> {
  fn ref_key(&self) -> usize {
    Arc::as_ptr(self) as *const () as usize
  }
}

struct Entry<T> {
  record: T,
  count: usize,
}

struct Table<T> {
  next: u64,
  entries: AHashMap<u64, Entry<T>>,
  by_key: AHashMap<usize, u64>,
}

/// A strong, refcounted id table. Entries keep their record alive until the count drops to zero
/// or the record is force-released.
pub struct RefTable<T> {
  table: Mutex<Table<T>>,
}

impl<T> Default for RefTable<T> {
  fn default() -> Self {
    Self {
      table: Mutex::new(Table {
        next: 1,
        entries: AHashMap::new(),
        by_key: AHashMap::new(),
      }),
    }
  }
}

impl<T: RefKey + Clone> RefTable<T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the id for `record`, assigning a fresh one the first time it is seen.
  pub fn add(&self, record: T) -> RefId {
    let mut table = self.table.lock();
    let key = record.ref_key();
    if let Some(&id) = table.by_key.get(&key) {
      if let Some(entry) = table.entries.get_mut(&id) {
        entry.count += 1;
        return RefId(id);
      }
    }
    let id = table.next;
    table.next += 1;
    table.entries.insert(id, Entry { record, count: 1 });
    table.by_key.insert(key, id);
    RefId(id)
  }

  /// Drops one reference; the entry is removed when none remain.
  pub fn unref(&self, record: &T) {
    let mut table = self.table.lock();
    let key = record.ref_key();
    let Some(&id) = table.by_key.get(&key) else {
      return;
    };
    let remove = match table.entries.get_mut(&id) {
      Some(entry) => {
        entry.count = entry.count.saturating_sub(1);
        entry.count == 0
      }
      None => true,
    };
    if remove {
      table.entries.remove(&id);
      table.by_key.remove(&key);
    }
  }

  pub fn get(&self, id: RefId) -> Option<T> {
    self.table.lock().entries.get(&id.0).map(|e| e.record.clone())
  }

  /// Removes the record regardless of its count.
  pub fn release(&self, record: &T) -> bool {
    let mut table = self.table.lock();
    let key = record.ref_key();
    match table.by_key.remove(&key) {
      Some(id) => table.entries.remove(&id).is_some(),
      None => false,
    }
  }

  pub fn release_id(&self, id: RefId) -> Option<T> {
    let mut table = self.table.lock();
    let entry = table.entries.remove(&id.0)?;
    let key = entry.record.ref_key();
    table.by_key.remove(&key);
    Some(entry.record)
  }

  /// Empties the table and hands back every record so the caller controls where they drop.
  pub fn release_all(&self) -> Vec<T> {
    let mut table = self.table.lock();
    table.by_key.clear();
    table.entries.drain().map(|(_, e)| e.record).collect()
  }

  pub fn refs(&self) -> Vec<(RefId, T)> {
    let table = self.table.lock();
    let mut refs: Vec<_> = table
      .entries
      .iter()
      .map(|(&id, e)| (RefId(id), e.record.clone()))
      .collect();
    refs.sort_by_key(|(id, _)| *id);
    refs
  }

  pub fn len(&self) -> usize {
    self.table.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// A weak id table. Records are owned elsewhere; once they are dropped `get` returns `None`.
pub struct WeakRefTable<T> {
  next: AtomicU64,
  entries: DashMap<u64, Weak<T>, ahash::RandomState>,
}

impl<T> Default for WeakRefTable<T> {
  fn default() -> Self {
    Self {
      next: AtomicU64::new(1),
      entries: DashMap::with_hasher(ahash::RandomState::new()),
    }
  }
}

impl<T> WeakRefTable<T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Reserves an id without a record, for records that need their id during construction.
  pub fn reserve(&self) -> RefId {
    RefId(self.next.fetch_add(1, Ordering::Relaxed))
  }

  pub fn insert(&self, id: RefId, record: &Arc<T>) {
    self.entries.insert(id.0, Arc::downgrade(record));
  }

  pub fn add(&self, record: &Arc<T>) -> RefId {
    let id = self.reserve();
    self.insert(id, record);
    id
  }

  pub fn get(&self, id: RefId) -> Option<Arc<T>> {
    self.entries.get(&id.0).and_then(|w| w.upgrade())
  }

  /// Removing an id twice is harmless.
  pub fn release(&self, id: RefId) {
    self.entries.remove(&id.0);
  }

  pub fn refs(&self) -> Vec<(RefId, Arc<T>)> {
    let mut refs: Vec<_> = self
      .entries
      .iter()
      .filter_map(|e| e.value().upgrade().map(|r| (RefId(*e.key()), r)))
      .collect();
    refs.sort_by_key(|(id, _)| *id);
    refs
  }
}

/// The `isolateId:contextId:callbackId[:execCtxId]` triple stored alongside every host function
/// and accessor installed into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId {
  pub isolate: RefId,
  pub context: RefId,
  pub callback: RefId,
  pub execution_context: Option<RefId>,
}

impl fmt::Display for CallbackId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}:{}", self.isolate, self.context, self.callback)?;
    if let Some(ec) = self.execution_context {
      write!(f, ":{ec}")?;
    }
    Ok(())
  }
}

impl FromStr for CallbackId {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let malformed = || Error::msg(format!("malformed callback id {s:?}"));
    let mut ids = s.split(':').map(|part| part.parse::<u64>().map(RefId));
    let mut next = || ids.next().ok_or_else(malformed)?.map_err(|_| malformed());
    let isolate = next()?;
    let context = next()?;
    let callback = next()?;
    let execution_context = match next() {
      Ok(id) => Some(id),
      Err(_) if s.matches(':').count() == 2 => None,
      Err(err) => return Err(err),
    };
    if s.matches(':').count() > 3 {
      return Err(malformed());
    }
    Ok(CallbackId {
      isolate,
      context,
      callback,
      execution_context,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn add_reuses_ids_for_the_same_record() {
    let table = RefTable::new();
    let a = Arc::new(1);
    let b = Arc::new(1);
    let id_a = table.add(a.clone());
    assert_eq!(table.add(a.clone()), id_a);
    assert_ne!(table.add(b.clone()), id_a);

    table.unref(&a);
    assert!(table.get(id_a).is_some());
    table.unref(&a);
    assert!(table.get(id_a).is_none());
  }

  #[test]
  fn release_all_drains_every_record() {
    let table = RefTable::new();
    table.add(Arc::new("x"));
    table.add(Arc::new("y"));
    assert_eq!(table.release_all().len(), 2);
    assert!(table.is_empty());
  }

  #[test]
  fn weak_table_tolerates_dropped_and_double_released_records() {
    let table = WeakRefTable::new();
    let record = Arc::new(5);
    let id = table.add(&record);
    assert_eq!(table.get(id).as_deref(), Some(&5));
    drop(record);
    assert!(table.get(id).is_none());
    table.release(id);
    table.release(id);
    assert!(table.get(id).is_none());
  }

  #[test]
  fn callback_ids_round_trip_through_strings() {
    let id: CallbackId = "3:7:11".parse().unwrap();
    assert_eq!(id.callback, RefId(11));
    assert_eq!(id.execution_context, None);
    assert_eq!(id.to_string(), "3:7:11");

    let with_ec: CallbackId = "3:7:11:2".parse().unwrap();
    assert_eq!(with_ec.execution_context, Some(RefId(2)));
    assert_eq!(with_ec.to_string(), "3:7:11:2");

    assert!("3:7".parse::<CallbackId>().is_err());
    assert!("3:x:1".parse::<CallbackId>().is_err());
    assert!("1:2:3:4:5".parse::<CallbackId>().is_err());
  }
}
