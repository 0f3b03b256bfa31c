//! Retain/release bookkeeping for host handles.
//!
//! Every [`Value`](crate::Value) wrapper and every context reports when it is created and when it
//! goes away. By default nothing listens; tests install a [`RecordingTracer`] to catch leaks and
//! double releases.

use ahash::AHashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::backtrace::Backtrace;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::refs::RefId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
  Value,
  Context,
}

pub trait Tracer: Send + Sync {
  fn retain(&self, resource: Resource, id: u64);
  fn release(&self, resource: Resource, id: u64);
}

pub struct NoopTracer;

impl Tracer for NoopTracer {
  fn retain(&self, _resource: Resource, _id: u64) {}

  fn release(&self, _resource: Resource, _id: u64) {}
}

static ENABLED: AtomicBool = AtomicBool::new(false);
static TRACER: Lazy<RwLock<Arc<dyn Tracer>>> = Lazy::new(|| RwLock::new(Arc::new(NoopTracer)));

/// Installs `tracer` process-wide, replacing the previous one.
pub fn set_tracer(tracer: Arc<dyn Tracer>) {
  *TRACER.write() = tracer;
  ENABLED.store(true, Ordering::Release);
}

/// Restores the no-op tracer.
pub fn clear_tracer() {
  ENABLED.store(false, Ordering::Release);
  *TRACER.write() = Arc::new(NoopTracer);
}

fn current() -> Option<Arc<dyn Tracer>> {
  if !ENABLED.load(Ordering::Acquire) {
    return None;
  }
  Some(TRACER.read().clone())
}

pub(crate) fn retain(resource: Resource, id: u64) {
  if let Some(tracer) = current() {
    tracer.retain(resource, id);
  }
}

pub(crate) fn release(resource: Resource, id: u64) {
  if let Some(tracer) = current() {
    tracer.release(resource, id);
  }
}

pub(crate) fn context_released(id: RefId) {
  release(Resource::Context, id.0);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
  /// Retained again after its final release.
  UnderRetain { resource: Resource, id: u64 },
  /// Released more often than retained.
  OverRelease { resource: Resource, id: u64 },
  /// Released without ever being retained.
  ReleaseWithoutRetain { resource: Resource, id: u64 },
}

impl fmt::Display for Violation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Violation::UnderRetain { resource, id } => write!(f, "{resource:?} {id} retained after final release"),
      Violation::OverRelease { resource, id } => write!(f, "{resource:?} {id} released too often"),
      Violation::ReleaseWithoutRetain { resource, id } => write!(f, "{resource:?} {id} released without retain"),
    }
  }
}

struct Record {
  count: usize,
  closed: bool,
  allocated: Arc<Backtrace>,
}

/// A still-retained resource and where it was first retained.
#[derive(Debug, Clone)]
pub struct Outstanding {
  pub resource: Resource,
  pub id: u64,
  pub allocated: Arc<Backtrace>,
}

/// Records every retain and release and reports unbalanced ones.
#[derive(Default)]
pub struct RecordingTracer {
  records: Mutex<AHashMap<(Resource, u64), Record>>,
  violations: Mutex<Vec<Violation>>,
}

impl RecordingTracer {
  pub fn new() -> RecordingTracer {
    RecordingTracer::default()
  }

  pub fn violations(&self) -> Vec<Violation> {
    self.violations.lock().clone()
  }

  /// Resources of `resource` kind retained and not yet released.
  pub fn outstanding(&self, resource: Resource) -> Vec<Outstanding> {
    let mut outstanding: Vec<_> = self
      .records
      .lock()
      .iter()
      .filter(|((r, _), record)| *r == resource && record.count > 0)
      .map(|((resource, id), record)| Outstanding {
        resource: *resource,
        id: *id,
        allocated: record.allocated.clone(),
      })
      .collect();
    outstanding.sort_by_key(|o| o.id);
    outstanding
  }

  fn violation(&self, violation: Violation) {
    tracing::warn!(%violation, "tracer violation");
    self.violations.lock().push(violation);
  }
}

impl Tracer for RecordingTracer {
  fn retain(&self, resource: Resource, id: u64) {
    let mut records = self.records.lock();
    let record = records.entry((resource, id)).or_insert_with(|| Record {
      count: 0,
      closed: false,
      allocated: Arc::new(Backtrace::capture()),
    });
    let reopened = record.closed;
    record.count += 1;
    drop(records);
    if reopened {
      self.violation(Violation::UnderRetain { resource, id });
    }
  }

  fn release(&self, resource: Resource, id: u64) {
    let mut records = self.records.lock();
    let violation = match records.get_mut(&(resource, id)) {
      None => Some(Violation::ReleaseWithoutRetain { resource, id }),
      Some(record) if record.count == 0 => Some(Violation::OverRelease { resource, id }),
      Some(record) => {
        record.count -= 1;
        if record.count == 0 {
          record.closed = true;
        }
        None
      }
    };
    drop(records);
    if let Some(violation) = violation {
      self.violation(violation);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::RecordingTracer;
  use super::Resource;
  use super::Tracer;
  use super::Violation;

  #[test]
  fn balanced_retain_release_is_clean() {
    let tracer = RecordingTracer::new();
    tracer.retain(Resource::Value, 1);
    tracer.retain(Resource::Value, 2);
    tracer.release(Resource::Value, 1);
    assert!(tracer.violations().is_empty());
    let outstanding = tracer.outstanding(Resource::Value);
    assert_eq!(outstanding.len(), 1);
    assert_eq!(outstanding[0].id, 2);
    tracer.release(Resource::Value, 2);
    assert!(tracer.outstanding(Resource::Value).is_empty());
  }

  #[test]
  fn detects_over_release() {
    let tracer = RecordingTracer::new();
    tracer.retain(Resource::Context, 7);
    tracer.release(Resource::Context, 7);
    tracer.release(Resource::Context, 7);
    assert_eq!(tracer.violations(), vec![Violation::OverRelease {
      resource: Resource::Context,
      id: 7
    }]);
  }

  #[test]
  fn detects_release_without_retain() {
    let tracer = RecordingTracer::new();
    tracer.release(Resource::Value, 3);
    assert_eq!(tracer.violations(), vec![Violation::ReleaseWithoutRetain {
      resource: Resource::Value,
      id: 3
    }]);
  }

  #[test]
  fn detects_retain_after_final_release() {
    let tracer = RecordingTracer::new();
    tracer.retain(Resource::Value, 4);
    tracer.release(Resource::Value, 4);
    tracer.retain(Resource::Value, 4);
    assert_eq!(tracer.violations(), vec![Violation::UnderRetain {
      resource: Resource::Value,
      id: 4
    }]);
  }

  #[test]
  fn resources_are_tracked_separately() {
    let tracer = RecordingTracer::new();
    tracer.retain(Resource::Value, 5);
    tracer.retain(Resource::Context, 5);
    tracer.release(Resource::Context, 5);
    assert!(tracer.violations().is_empty());
    assert_eq!(tracer.outstanding(Resource::Value).len(), 1);
    assert!(tracer.outstanding(Resource::Context).is_empty());
  }
}
