use std::mem::ManuallyDrop;
use std::sync::Weak;

use crate::isolate::IsolateInner;
use crate::refs::RefId;
use crate::scope;

/// An engine handle owned by the host.
///
/// `v8::Global` must only be reset on its isolate's thread. A `Persistent` can be held and dropped
/// anywhere: drops on foreign threads are queued on the isolate and drained by its executor.
pub(crate) struct Persistent<T: 'static> {
  global: ManuallyDrop<v8::Global<T>>,
  isolate_id: RefId,
  isolate: Weak<IsolateInner>,
}

// SAFETY: the wrapped global is only opened or reset on the owning isolate's thread (see `open`
// and `Drop`); elsewhere it is moved around as an opaque token.
unsafe impl<T: 'static> Send for Persistent<T> {}
unsafe impl<T: 'static> Sync for Persistent<T> {}

impl<T: 'static> Persistent<T> {
  pub(crate) fn new(isolate: &IsolateInner, scope: &mut v8::Isolate, local: v8::Local<T>) -> Self {
    Self {
      global: ManuallyDrop::new(v8::Global::new(scope, local)),
      isolate_id: isolate.id,
      isolate: isolate.weak(),
    }
  }

  pub(crate) fn isolate_id(&self) -> RefId {
    self.isolate_id
  }

  /// Opens a local handle in `scope`. Must be called on the isolate thread.
  pub(crate) fn open<'s>(&self, scope: &mut v8::HandleScope<'s, ()>) -> v8::Local<'s, T> {
    v8::Local::new(scope, &*self.global)
  }
}

/// A weak engine handle owned by the host. It does not keep its object alive; once the engine
/// collects the object, `finalizer` runs on the isolate thread.
pub(crate) struct WeakHandle<T: 'static> {
  weak: ManuallyDrop<v8::Weak<T>>,
  isolate_id: RefId,
  isolate: Weak<IsolateInner>,
}

// SAFETY: as for `Persistent`, the handle is only opened or reset on the owning isolate's thread.
unsafe impl<T: 'static> Send for WeakHandle<T> {}
unsafe impl<T: 'static> Sync for WeakHandle<T> {}

impl<T: 'static> WeakHandle<T> {
  pub(crate) fn new(
    isolate: &IsolateInner,
    scope: &mut v8::Isolate,
    local: v8::Local<T>,
    finalizer: impl FnOnce() + 'static,
  ) -> Self {
    Self {
      weak: ManuallyDrop::new(v8::Weak::with_finalizer(scope, local, Box::new(move |_| finalizer()))),
      isolate_id: isolate.id,
      isolate: isolate.weak(),
    }
  }

  /// Opens a local handle in `scope` unless the object was collected. Must be called on the
  /// isolate thread.
  pub(crate) fn open<'s>(&self, scope: &mut v8::HandleScope<'s, ()>) -> Option<v8::Local<'s, T>> {
    self.weak.to_local(scope)
  }
}

pub(crate) struct Garbage(#[allow(dead_code)] Box<dyn Send>);

struct SendHandle<H>(#[allow(dead_code)] H);

// SAFETY: only dropped by the executor thread of the isolate that created it.
unsafe impl<H> Send for SendHandle<H> {}

/// Resets `handle` now when on its isolate's thread, otherwise queues it for the executor.
fn dispose<H: 'static>(handle: H, isolate_id: RefId, isolate: &Weak<IsolateInner>) {
  if scope::is_isolate_thread(isolate_id) {
    drop(handle);
    return;
  }
  match isolate.upgrade() {
    Some(isolate) if !isolate.is_disposed() => {
      if let Err(garbage) = isolate.defer_drop(Garbage(Box::new(SendHandle(handle)))) {
        // The executor is gone; the engine may still be tearing down on its thread.
        std::mem::forget(garbage);
      }
    }
    // The isolate may still be disposing on its own thread, so the handle cannot be reset here.
    _ => std::mem::forget(handle),
  }
}

impl<T: 'static> Drop for Persistent<T> {
  fn drop(&mut self) {
    // SAFETY: `global` is never touched again after this point.
    let global = unsafe { ManuallyDrop::take(&mut self.global) };
    dispose(global, self.isolate_id, &self.isolate);
  }
}

impl<T: 'static> Drop for WeakHandle<T> {
  fn drop(&mut self) {
    // SAFETY: `weak` is never touched again after this point.
    let weak = unsafe { ManuallyDrop::take(&mut self.weak) };
    dispose(weak, self.isolate_id, &self.isolate);
  }
}
