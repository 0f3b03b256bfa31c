use once_cell::sync::Lazy;
use std::sync::Arc;

use crate::execution_context::ExecutionContextInner;
use crate::isolate::IsolateInner;
use crate::refs::RefId;
use crate::refs::WeakRefTable;
use crate::ExecutionContext;
use crate::Isolate;

/// Process-wide weak directories of live isolates and execution contexts.
///
/// Callback ids only carry numbers; the directory turns them back into handles. Entries are weak
/// so the directory never keeps an isolate alive.
#[derive(Default)]
pub struct Directory {
  isolates: WeakRefTable<IsolateInner>,
  execution_contexts: WeakRefTable<ExecutionContextInner>,
}

static GLOBAL: Lazy<Directory> = Lazy::new(Directory::default);

impl Directory {
  pub fn global() -> &'static Directory {
    &GLOBAL
  }

  pub(crate) fn reserve_isolate(&self) -> RefId {
    self.isolates.reserve()
  }

  pub(crate) fn register_isolate(&self, id: RefId, isolate: &Arc<IsolateInner>) {
    self.isolates.insert(id, isolate);
  }

  pub(crate) fn release_isolate(&self, id: RefId) {
    self.isolates.release(id);
  }

  pub fn isolate(&self, id: RefId) -> Option<Isolate> {
    self.isolates.get(id).map(Isolate::from_inner)
  }

  pub fn isolates(&self) -> Vec<Isolate> {
    self
      .isolates
      .refs()
      .into_iter()
      .map(|(_, inner)| Isolate::from_inner(inner))
      .collect()
  }

  pub(crate) fn reserve_execution_context(&self) -> RefId {
    self.execution_contexts.reserve()
  }

  pub(crate) fn register_execution_context(&self, id: RefId, ec: &Arc<ExecutionContextInner>) {
    self.execution_contexts.insert(id, ec);
  }

  pub(crate) fn release_execution_context(&self, id: RefId) {
    self.execution_contexts.release(id);
  }

  pub fn execution_context(&self, id: RefId) -> Option<ExecutionContext> {
    self
      .execution_contexts
      .get(id)
      .map(ExecutionContext::from_inner)
  }
}
