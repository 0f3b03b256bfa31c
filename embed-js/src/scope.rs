//! Access to the engine from the isolate's own thread.
//!
//! Every isolate is driven by exactly one executor thread. That thread records which isolate it
//! owns here, and anything running on it (queued jobs, engine callbacks re-entering the host) opens
//! its handle scopes through [`with_scope`], nested below whatever scope is current.

use std::cell::Cell;
use std::ptr::NonNull;

use crate::refs::RefId;

thread_local! {
  static CURRENT: Cell<Option<(RefId, NonNull<v8::Isolate>)>> = const { Cell::new(None) };
}

pub(crate) struct ThreadBinding;

impl ThreadBinding {
  /// Binds the calling thread to `isolate` until the returned guard is dropped.
  pub(crate) fn bind(id: RefId, isolate: &mut v8::Isolate) -> ThreadBinding {
    CURRENT.with(|c| c.set(Some((id, NonNull::from(isolate)))));
    ThreadBinding
  }
}

impl Drop for ThreadBinding {
  fn drop(&mut self) {
    CURRENT.with(|c| c.set(None));
  }
}

/// The id of the isolate owned by the calling thread, if any.
pub(crate) fn current_isolate() -> Option<RefId> {
  CURRENT.with(|c| c.get()).map(|(id, _)| id)
}

pub(crate) fn is_isolate_thread(id: RefId) -> bool {
  current_isolate() == Some(id)
}

/// Runs `f` inside a fresh handle scope of the isolate owned by this thread.
///
/// Returns `None` when the thread does not own `id`.
pub(crate) fn with_scope<R>(
  id: RefId,
  f: impl for<'s> FnOnce(&mut v8::HandleScope<'s, ()>) -> R,
) -> Option<R> {
  let (current, ptr) = CURRENT.with(|c| c.get())?;
  if current != id {
    return None;
  }
  // SAFETY: the pointer is set by the executor for the lifetime of the isolate and only read on
  // that same thread. The callback scope attaches below whichever scope is currently active, so
  // nesting inside engine callbacks is sound.
  let isolate = unsafe { &mut *ptr.as_ptr() };
  let callback_scope = &mut unsafe { v8::CallbackScope::new(isolate) };
  let outer: &mut v8::HandleScope<'_, ()> = callback_scope;
  let scope = &mut v8::HandleScope::new(outer);
  Some(f(scope))
}
