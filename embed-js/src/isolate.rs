//! Isolates and their serial executors.
//!
//! An [`Isolate`] owns one engine instance. The engine lives on a dedicated thread which is the
//! isolate's serial executor: every host operation is shipped there as a job and runs to completion
//! before the next one starts. Calls made while already on that thread (an engine callback
//! re-entering the host, a nested [`Isolate::sync`]) run inline, so re-entrancy never deadlocks.

use ahash::AHashMap;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde::Serialize;
use std::any::Any;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Weak;
use std::thread;

use crate::callback;
use crate::context::ContextInner;
use crate::directory::Directory;
use crate::handle::Garbage;
use crate::inspector;
use crate::platform;
use crate::refs::RefId;
use crate::refs::RefTable;
use crate::scope;
use crate::scope::ThreadBinding;
use crate::Context;
use crate::Error;
use crate::ExecutionContext;
use crate::Resolver;
use crate::Value;

type Job = Box<dyn for<'s> FnOnce(&mut v8::HandleScope<'s, ()>) + Send + 'static>;

enum Message {
  Run(Job),
  Drain,
}

/// A host-side module record registered with an isolate, looked up again when the engine asks
/// for a dynamic `import()` on behalf of a script that was run with it.
pub type ModuleRecord = Arc<dyn Any + Send + Sync>;

/// A dynamic `import()` request raised by the engine.
pub struct DynamicImport {
  pub module: ModuleRecord,
  pub specifier: String,
  pub resource_name: String,
  pub import_assertions: Vec<Value>,
  pub context: Context,
}

/// Fulfils dynamic imports. Invoked on a background task; must settle `resolver`.
pub type DynamicImportHandler =
  Arc<dyn Fn(&ExecutionContext, DynamicImport, Resolver) + Send + Sync>;

type ShutdownHook = Box<dyn FnOnce(&Isolate) + Send>;

/// An opaque startup snapshot blob.
#[derive(Clone)]
pub struct Snapshot {
  data: Arc<[u8]>,
}

impl Snapshot {
  /// Snapshot authoring is not supported; this always fails.
  pub fn create(_code: &str) -> Result<Snapshot, Error> {
    Err(Error::msg("snapshot authoring is not supported"))
  }

  pub fn import(bytes: &[u8]) -> Snapshot {
    Snapshot {
      data: Arc::from(bytes),
    }
  }

  pub fn export(&self) -> Vec<u8> {
    self.data.to_vec()
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }
}

/// Engine heap statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapStatistics {
  pub total_heap_size: usize,
  pub total_heap_size_executable: usize,
  pub total_physical_size: usize,
  pub total_available_size: usize,
  pub used_heap_size: usize,
  pub heap_size_limit: usize,
  pub malloced_memory: usize,
  pub peak_malloced_memory: usize,
  pub external_memory: usize,
  pub number_of_native_contexts: usize,
  pub number_of_detached_contexts: usize,
}

#[derive(Clone, Default)]
pub struct IsolateOptions {
  pub snapshot: Option<Snapshot>,
  /// Initial and maximum heap size in bytes.
  pub heap_limits: Option<(usize, usize)>,
  pub thread_name: Option<String>,
}

impl IsolateOptions {
  pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
    self.snapshot = Some(snapshot);
    self
  }

  pub fn with_heap_limits(mut self, initial: usize, max: usize) -> Self {
    self.heap_limits = Some((initial, max));
    self
  }

  pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
    self.thread_name = Some(name.into());
    self
  }
}

/// Stored in the engine isolate's slot so engine callbacks can find their way back.
pub(crate) struct IsolateSlot(pub(crate) RefId);

/// A handle to an engine instance. Cheap to clone.
#[derive(Clone)]
pub struct Isolate {
  inner: Arc<IsolateInner>,
}

pub(crate) struct IsolateInner {
  state: Arc<IsolateState>,
  finalize: bool,
}

impl Deref for IsolateInner {
  type Target = IsolateState;

  fn deref(&self) -> &IsolateState {
    &self.state
  }
}

impl Drop for IsolateInner {
  fn drop(&mut self) {
    if self.finalize && !self.state.terminating.load(Ordering::Acquire) {
      let temporary = Isolate {
        inner: Arc::new(IsolateInner {
          state: self.state.clone(),
          finalize: false,
        }),
      };
      temporary.terminate();
    }
  }
}

pub(crate) struct IsolateState {
  pub(crate) id: RefId,
  this: Mutex<Weak<IsolateInner>>,
  sender: Mutex<Option<mpsc::Sender<Message>>>,
  thread: Mutex<Option<thread::JoinHandle<()>>>,
  handle: v8::IsolateHandle,
  busy: Arc<AtomicBool>,
  terminating: AtomicBool,
  terminated: Arc<AtomicBool>,
  disposed: Arc<AtomicBool>,
  garbage: Arc<Mutex<Vec<Garbage>>>,
  drain_requested: Arc<AtomicBool>,
  contexts: Mutex<AHashMap<RefId, Weak<ContextInner>>>,
  modules: RefTable<ModuleRecord>,
  shutdown_hooks: Mutex<Vec<ShutdownHook>>,
  data: Mutex<AHashMap<String, Arc<dyn Any + Send + Sync>>>,
  microtasks_pending: AtomicBool,
  active: Mutex<Vec<ExecutionContext>>,
  import_handler: RwLock<Option<DynamicImportHandler>>,
}

/// Holds the job closure and the reply channel so that, when a job is dropped unrun, the closure
/// is destroyed before the waiting caller is released.
struct Pending<F, T> {
  f: Option<F>,
  reply: Option<mpsc::SyncSender<Result<T, Error>>>,
}

impl<F, T> Drop for Pending<F, T> {
  fn drop(&mut self) {
    drop(self.f.take());
    drop(self.reply.take());
  }
}

impl Isolate {
  pub fn new() -> Result<Isolate, Error> {
    Isolate::with_options(IsolateOptions::default())
  }

  pub fn new_with_snapshot(snapshot: Snapshot) -> Result<Isolate, Error> {
    Isolate::with_options(IsolateOptions::default().with_snapshot(snapshot))
  }

  pub fn with_options(options: IsolateOptions) -> Result<Isolate, Error> {
    platform::initialize();

    let directory = Directory::global();
    let id = directory.reserve_isolate();
    let (sender, receiver) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::sync_channel(1);
    let busy = Arc::new(AtomicBool::new(false));
    let terminated = Arc::new(AtomicBool::new(false));
    let disposed = Arc::new(AtomicBool::new(false));
    let garbage = Arc::new(Mutex::new(Vec::new()));
    let drain_requested = Arc::new(AtomicBool::new(false));

    let executor = Executor {
      id,
      options: options.clone(),
      receiver,
      busy: busy.clone(),
      terminated: terminated.clone(),
      disposed: disposed.clone(),
      garbage: garbage.clone(),
      drain_requested: drain_requested.clone(),
    };
    let thread_name = options
      .thread_name
      .clone()
      .unwrap_or_else(|| format!("embed-js-isolate-{id}"));
    let thread = thread::Builder::new()
      .name(thread_name)
      .spawn(move || executor.run(ready_tx))
      .map_err(Error::host)?;
    let handle = ready_rx
      .recv()
      .map_err(|_| Error::msg("isolate executor failed to start"))?;

    let state = Arc::new(IsolateState {
      id,
      this: Mutex::new(Weak::new()),
      sender: Mutex::new(Some(sender)),
      thread: Mutex::new(Some(thread)),
      handle,
      busy,
      terminating: AtomicBool::new(false),
      terminated,
      disposed,
      garbage,
      drain_requested,
      contexts: Mutex::new(AHashMap::new()),
      modules: RefTable::new(),
      shutdown_hooks: Mutex::new(Vec::new()),
      data: Mutex::new(AHashMap::new()),
      microtasks_pending: AtomicBool::new(false),
      active: Mutex::new(Vec::new()),
      import_handler: RwLock::new(None),
    });
    let inner = Arc::new(IsolateInner {
      state,
      finalize: true,
    });
    *inner.this.lock() = Arc::downgrade(&inner);
    directory.register_isolate(id, &inner);
    tracing::debug!(isolate = %id, "isolate created");
    Ok(Isolate { inner })
  }

  pub(crate) fn from_inner(inner: Arc<IsolateInner>) -> Isolate {
    Isolate { inner }
  }

  pub(crate) fn inner(&self) -> &IsolateInner {
    &self.inner
  }

  pub fn id(&self) -> RefId {
    self.inner.id
  }

  pub fn ptr_eq(a: &Isolate, b: &Isolate) -> bool {
    Arc::ptr_eq(&a.inner.state, &b.inner.state)
  }

  /// Whether the isolate still accepts work.
  pub fn is_running(&self) -> bool {
    !self.inner.terminated.load(Ordering::Acquire)
  }

  /// Whether a job is executing on the engine right now.
  pub fn is_active(&self) -> bool {
    self.inner.busy.load(Ordering::Acquire)
  }

  pub fn new_context(&self, ec: &ExecutionContext) -> Result<Context, Error> {
    Context::new(self, ec)
  }

  /// Returns the execution context currently in flight on this isolate, or a fresh one.
  pub fn execution_context(&self) -> ExecutionContext {
    if scope::is_isolate_thread(self.id()) {
      if let Some(ec) = self.inner.active.lock().last() {
        return ec.clone();
      }
    }
    ExecutionContext::new(self)
  }

  /// Runs `f` under the isolate's single-entrant discipline and returns its result.
  ///
  /// From any thread other than the isolate's own, the call is queued behind earlier work and the
  /// caller blocks until it completes. On the isolate thread it runs inline.
  pub fn sync<'a, T, F>(&self, ec: &ExecutionContext, f: F) -> Result<T, Error>
  where
    T: Send + 'a,
    F: for<'s> FnOnce(&mut v8::HandleScope<'s, ()>) -> Result<T, Error> + Send + 'a,
  {
    self.inner.check_running()?;
    let _entry = ec.enter();

    if scope::is_isolate_thread(self.id()) {
      return self.run_inline(ec, f);
    }

    let (reply_tx, reply_rx) = mpsc::sync_channel(1);
    let isolate = self.clone();
    let ec = ec.clone();
    let mut pending = Pending {
      f: Some(f),
      reply: Some(reply_tx),
    };
    let job: Box<dyn for<'s> FnOnce(&mut v8::HandleScope<'s, ()>) + Send + 'a> =
      Box::new(move |scope| {
        let result = match pending.f.take() {
          Some(f) => {
            isolate.inner.push_active(ec);
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| f(scope)))
              .unwrap_or_else(|payload| Err(Error::from_panic(payload)));
            isolate.inner.pop_active();
            result
          }
          None => Err(Error::Terminated),
        };
        if let Some(reply) = pending.reply.take() {
          let _ = reply.send(result);
        }
      });
    // SAFETY: the caller blocks below until the job has either run (and replied) or been
    // dropped; `Pending` drops the closure before the reply sender, so nothing borrowed for 'a is
    // touched after this function returns.
    let job: Job = unsafe {
      std::mem::transmute::<Box<dyn for<'s> FnOnce(&mut v8::HandleScope<'s, ()>) + Send + 'a>, Job>(
        job,
      )
    };
    self.inner.send(Message::Run(job))?;
    reply_rx.recv().unwrap_or(Err(Error::Terminated))
  }

  fn run_inline<T, F>(&self, ec: &ExecutionContext, f: F) -> Result<T, Error>
  where
    F: for<'s> FnOnce(&mut v8::HandleScope<'s, ()>) -> Result<T, Error>,
  {
    self.inner.push_active(ec.clone());
    let result =
      std::panic::catch_unwind(AssertUnwindSafe(|| scope::with_scope(self.id(), f)));
    self.inner.pop_active();
    match result {
      Ok(Some(result)) => result,
      Ok(None) => Err(Error::Terminated),
      Err(payload) => Err(Error::from_panic(payload)),
    }
  }

  /// Runs `f` on a new thread with an execution context inheriting `ec`'s isolate and context.
  /// Panics are caught and logged.
  pub fn background(&self, ec: &ExecutionContext, f: impl FnOnce(&ExecutionContext) + Send + 'static) {
    let child = ec.fork();
    let spawned = thread::Builder::new()
      .name(format!("embed-js-background-{}", self.id()))
      .spawn(move || {
        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| f(&child))) {
          tracing::error!(error = %Error::from_panic(payload), "background task panicked");
        }
      });
    if let Err(err) = spawned {
      tracing::error!(%err, "failed to spawn background task");
    }
  }

  pub fn run_microtask_checkpoint(&self, ec: &ExecutionContext) -> Result<(), Error> {
    self.sync(ec, |scope| {
      scope.perform_microtask_checkpoint();
      Ok(())
    })
  }

  /// Schedules a checkpoint on a background task. At most one is pending at a time.
  pub fn run_microtasks_in_background(&self, ec: &ExecutionContext) {
    if self.inner.microtasks_pending.swap(true, Ordering::AcqRel) {
      return;
    }
    let isolate = self.clone();
    self.background(ec, move |ec| {
      let result = isolate.sync(ec, |scope| {
        isolate.inner.microtasks_pending.store(false, Ordering::Release);
        scope.perform_microtask_checkpoint();
        Ok(())
      });
      if let Err(err) = result {
        isolate.inner.microtasks_pending.store(false, Ordering::Release);
        tracing::debug!(%err, "background microtask checkpoint skipped");
      }
    });
  }

  /// Queues `function` (a script function value) on the engine's microtask queue.
  pub fn enqueue_microtask(&self, ec: &ExecutionContext, function: &Value) -> Result<(), Error> {
    function.require_kind(crate::Kind::FUNCTION)?;
    function.check_isolate(self)?;
    function.context().sync(ec, |scope, _| {
      let local = function.open(scope);
      let function = v8::Local::<v8::Function>::try_from(local).map_err(|e| Error::msg(e.to_string()))?;
      scope.enqueue_microtask(function);
      Ok(())
    })
  }

  /// Registers `hook` to run with this isolate when it is terminated.
  pub fn add_shutdown_hook(&self, hook: impl FnOnce(&Isolate) + Send + 'static) {
    self.inner.shutdown_hooks.lock().push(Box::new(hook));
  }

  pub fn data(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
    self.inner.data.lock().get(key).cloned()
  }

  pub fn set_data(&self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
    self.inner.data.lock().insert(key.into(), value);
  }

  pub fn set_dynamic_import_handler(&self, handler: DynamicImportHandler) {
    *self.inner.import_handler.write() = Some(handler);
  }

  pub(crate) fn dynamic_import_handler(&self) -> Option<DynamicImportHandler> {
    self.inner.import_handler.read().clone()
  }

  pub fn register_module(&self, module: ModuleRecord) -> RefId {
    self.inner.modules.add(module)
  }

  pub fn module(&self, id: RefId) -> Option<ModuleRecord> {
    self.inner.modules.get(id)
  }

  /// Drops the record registered under `id`. Scripts run with it can no longer `import()`.
  pub fn unregister_module(&self, id: RefId) -> Option<ModuleRecord> {
    self.inner.modules.release_id(id)
  }

  pub fn heap_statistics(&self, ec: &ExecutionContext) -> Result<HeapStatistics, Error> {
    self.sync(ec, |scope| {
      let mut stats = v8::HeapStatistics::default();
      scope.get_heap_statistics(&mut stats);
      Ok(HeapStatistics {
        total_heap_size: stats.total_heap_size(),
        total_heap_size_executable: stats.total_heap_size_executable(),
        total_physical_size: stats.total_physical_size(),
        total_available_size: stats.total_available_size(),
        used_heap_size: stats.used_heap_size(),
        heap_size_limit: stats.heap_size_limit(),
        malloced_memory: stats.malloced_memory(),
        peak_malloced_memory: stats.peak_malloced_memory(),
        external_memory: stats.external_memory(),
        number_of_native_contexts: stats.number_of_native_contexts(),
        number_of_detached_contexts: stats.number_of_detached_contexts(),
      })
    })
  }

  pub fn low_memory_notification(&self, ec: &ExecutionContext) -> Result<(), Error> {
    self.sync(ec, |scope| {
      scope.low_memory_notification();
      Ok(())
    })
  }

  /// Forces a full collection. Requires the engine to run with `--expose-gc`
  /// (see [`set_flags`](crate::set_flags)).
  pub fn request_garbage_collection_for_testing(&self, ec: &ExecutionContext) -> Result<(), Error> {
    if !platform::gc_exposed() {
      return Err(Error::msg("garbage collection for testing requires --expose-gc"));
    }
    self.sync(ec, |scope| {
      scope.request_garbage_collection_for_testing(v8::GarbageCollectionType::Full);
      Ok(())
    })
  }

  pub fn contexts(&self) -> Vec<Context> {
    self
      .inner
      .contexts
      .lock()
      .values()
      .filter_map(|c| c.upgrade().map(Context::from_inner))
      .collect()
  }

  pub(crate) fn context(&self, id: RefId) -> Option<Context> {
    self
      .inner
      .contexts
      .lock()
      .get(&id)
      .and_then(|c| c.upgrade())
      .map(Context::from_inner)
  }

  pub(crate) fn register_context(&self, id: RefId, context: &Arc<ContextInner>) {
    self.inner.contexts.lock().insert(id, Arc::downgrade(context));
  }

  pub(crate) fn forget_context(&self, id: RefId) {
    self.inner.contexts.lock().remove(&id);
  }

  /// Stops the isolate: runs shutdown hooks, releases every context, and disposes the engine.
  /// Further calls fail with [`Error::Terminated`]. Calling it again is a no-op.
  pub fn terminate(&self) {
    let inner = &self.inner;
    if inner.terminating.swap(true, Ordering::AcqRel) {
      return;
    }
    tracing::debug!(isolate = %inner.id, "terminating isolate");

    if inner.busy.load(Ordering::Acquire) && !scope::is_isolate_thread(inner.id) {
      inner.handle.terminate_execution();
    }

    let hooks = std::mem::take(&mut *inner.shutdown_hooks.lock());
    for hook in hooks {
      if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| hook(self))) {
        tracing::error!(error = %Error::from_panic(payload), "shutdown hook panicked");
      }
    }

    inner.terminated.store(true, Ordering::Release);

    let contexts: Vec<_> = inner.contexts.lock().drain().map(|(_, c)| c).collect();
    for context in contexts.into_iter().filter_map(|c| c.upgrade()) {
      Context::from_inner(context).release_tables();
    }
    inner.modules.release_all();
    inner.data.lock().clear();
    *inner.import_handler.write() = None;

    drop(inner.sender.lock().take());
    if !scope::is_isolate_thread(inner.id) {
      if let Some(thread) = inner.thread.lock().take() {
        if thread.join().is_err() {
          tracing::error!(isolate = %inner.id, "isolate executor panicked");
        }
      }
    }
    Directory::global().release_isolate(inner.id);
  }
}

impl IsolateState {
  pub(crate) fn weak(&self) -> Weak<IsolateInner> {
    self.this.lock().clone()
  }

  pub(crate) fn is_disposed(&self) -> bool {
    self.disposed.load(Ordering::Acquire)
  }

  pub(crate) fn check_running(&self) -> Result<(), Error> {
    if self.terminated.load(Ordering::Acquire) {
      Err(Error::Terminated)
    } else {
      Ok(())
    }
  }

  fn send(&self, message: Message) -> Result<(), Error> {
    let sender = self.sender.lock();
    match sender.as_ref() {
      Some(sender) => sender.send(message).map_err(|_| Error::Terminated),
      None => Err(Error::Terminated),
    }
  }

  /// Queues an engine handle to be released on the isolate thread.
  pub(crate) fn defer_drop(&self, garbage: Garbage) -> Result<(), Garbage> {
    if self.sender.lock().is_none() {
      return Err(garbage);
    }
    self.garbage.lock().push(garbage);
    if !self.drain_requested.swap(true, Ordering::AcqRel) && self.send(Message::Drain).is_err() {
      self.drain_requested.store(false, Ordering::Release);
    }
    Ok(())
  }

  pub(crate) fn push_active(&self, ec: ExecutionContext) {
    self.active.lock().push(ec);
  }

  pub(crate) fn pop_active(&self) {
    self.active.lock().pop();
  }

  pub(crate) fn active_execution_context(&self) -> Option<ExecutionContext> {
    self.active.lock().last().cloned()
  }
}

struct Executor {
  id: RefId,
  options: IsolateOptions,
  receiver: mpsc::Receiver<Message>,
  busy: Arc<AtomicBool>,
  terminated: Arc<AtomicBool>,
  disposed: Arc<AtomicBool>,
  garbage: Arc<Mutex<Vec<Garbage>>>,
  drain_requested: Arc<AtomicBool>,
}

impl Executor {
  fn run(self, ready: mpsc::SyncSender<v8::IsolateHandle>) {
    let mut params = v8::CreateParams::default();
    if let Some((initial, max)) = self.options.heap_limits {
      params = params.heap_limits(initial, max);
    }
    if let Some(snapshot) = &self.options.snapshot {
      params = params.snapshot_blob(snapshot.export());
    }

    let mut isolate = v8::Isolate::new(params);
    isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
    isolate.set_host_import_module_dynamically_callback(callback::import_module_dynamically);
    isolate.set_slot(IsolateSlot(self.id));
    if ready.send(isolate.thread_safe_handle()).is_err() {
      return;
    }

    {
      let _binding = ThreadBinding::bind(self.id, &mut isolate);
      while let Ok(message) = self.receiver.recv() {
        self.drain_garbage();
        if self.terminated.load(Ordering::Acquire) {
          // Dropping a queued job releases its caller with `Error::Terminated`.
          continue;
        }
        if let Message::Run(job) = message {
          let _span = tracing::trace_span!("isolate.job", isolate = %self.id).entered();
          self.busy.store(true, Ordering::Release);
          scope::with_scope(self.id, job);
          scope::with_scope(self.id, |scope| scope.perform_microtask_checkpoint());
          self.busy.store(false, Ordering::Release);
        }
        self.drain_garbage();
      }
      inspector::dispose_all();
      self.drain_garbage();
    }

    drop(isolate);
    self.disposed.store(true, Ordering::Release);
    tracing::debug!(isolate = %self.id, "isolate disposed");
  }

  fn drain_garbage(&self) {
    self.drain_requested.store(false, Ordering::Release);
    let garbage = std::mem::take(&mut *self.garbage.lock());
    drop(garbage);
  }
}
