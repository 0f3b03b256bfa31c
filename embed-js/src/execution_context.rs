use ahash::AHashMap;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;

use crate::directory::Directory;
use crate::marshal::FromJs;
use crate::marshal::ToJs;
use crate::refs::RefId;
use crate::Context;
use crate::Error;
use crate::Isolate;
use crate::Value;

type Hook = Arc<dyn Fn(&ExecutionContext) + Send + Sync>;
type Releaser = Box<dyn FnOnce() + Send>;

/// The host-side frame of one call chain into an isolate.
///
/// It names the isolate and (optionally) the context that operations act on, and it is how engine
/// callbacks find their way back to the host call that triggered them. Pass it explicitly as the
/// first argument; [`Isolate::background`] hands a derived one to the spawned task.
#[derive(Clone)]
pub struct ExecutionContext {
  inner: Arc<ExecutionContextInner>,
}

pub(crate) struct ExecutionContextInner {
  id: RefId,
  isolate: Isolate,
  context: RwLock<Option<Context>>,
  depth: Mutex<usize>,
  enter_hooks: Mutex<Vec<Hook>>,
  exit_hooks: Mutex<Vec<Hook>>,
  releasers: Mutex<Vec<Releaser>>,
}

impl Drop for ExecutionContextInner {
  fn drop(&mut self) {
    Directory::global().release_execution_context(self.id);
  }
}

/// Marks one (possibly nested) entry into an isolate. The outermost entry fires the enter hooks;
/// dropping it fires the exit hooks and the deferred releasers.
pub(crate) struct Entry {
  ec: ExecutionContext,
}

impl Drop for Entry {
  fn drop(&mut self) {
    let outermost = {
      let mut depth = self.ec.inner.depth.lock();
      *depth = depth.saturating_sub(1);
      *depth == 0
    };
    if !outermost {
      return;
    }
    let hooks = self.ec.inner.exit_hooks.lock().clone();
    for hook in hooks {
      hook(&self.ec);
    }
    let releasers = std::mem::take(&mut *self.ec.inner.releasers.lock());
    for release in releasers.into_iter().rev() {
      release();
    }
  }
}

macro_rules! console_methods {
  ($($method:ident => $name:literal),* $(,)?) => {
    $(
      #[doc = concat!("Calls `console.", $name, "` on the bound context's global object.")]
      pub fn $method(&self, args: &[&dyn ToJs]) -> Result<(), Error> {
        self.console($name, args)
      }
    )*
  };
}

impl ExecutionContext {
  pub fn new(isolate: &Isolate) -> ExecutionContext {
    ExecutionContext::build(isolate, None)
  }

  /// A new execution context bound to `context` and its isolate.
  pub fn with_context(context: &Context) -> ExecutionContext {
    ExecutionContext::build(context.isolate(), Some(context.clone()))
  }

  fn build(isolate: &Isolate, context: Option<Context>) -> ExecutionContext {
    let directory = Directory::global();
    let id = directory.reserve_execution_context();
    let inner = Arc::new(ExecutionContextInner {
      id,
      isolate: isolate.clone(),
      context: RwLock::new(context),
      depth: Mutex::new(0),
      enter_hooks: Mutex::new(Vec::new()),
      exit_hooks: Mutex::new(Vec::new()),
      releasers: Mutex::new(Vec::new()),
    });
    directory.register_execution_context(id, &inner);
    ExecutionContext { inner }
  }

  pub(crate) fn from_inner(inner: Arc<ExecutionContextInner>) -> ExecutionContext {
    ExecutionContext { inner }
  }

  /// A fresh execution context with the same isolate and context, for a forked task.
  pub fn fork(&self) -> ExecutionContext {
    ExecutionContext::build(&self.inner.isolate, self.try_context())
  }

  pub fn id(&self) -> RefId {
    self.inner.id
  }

  pub fn isolate(&self) -> &Isolate {
    &self.inner.isolate
  }

  pub fn context(&self) -> Result<Context, Error> {
    self.try_context().ok_or(Error::NoContext)
  }

  pub fn try_context(&self) -> Option<Context> {
    self.inner.context.read().clone()
  }

  pub fn set_context(&self, context: Option<&Context>) {
    *self.inner.context.write() = context.cloned();
  }

  pub fn ptr_eq(a: &ExecutionContext, b: &ExecutionContext) -> bool {
    Arc::ptr_eq(&a.inner, &b.inner)
  }

  /// Whether a call on this execution context is currently in flight.
  pub fn is_entered(&self) -> bool {
    *self.inner.depth.lock() > 0
  }

  /// Registers `hook` to run each time the outermost call on this execution context begins.
  pub fn on_enter(&self, hook: impl Fn(&ExecutionContext) + Send + Sync + 'static) {
    self.inner.enter_hooks.lock().push(Arc::new(hook));
  }

  /// Registers `hook` to run each time the outermost call on this execution context ends.
  pub fn on_exit(&self, hook: impl Fn(&ExecutionContext) + Send + Sync + 'static) {
    self.inner.exit_hooks.lock().push(Arc::new(hook));
  }

  /// Defers `release` until the outermost call ends. Releasers run last-registered first. Outside
  /// of a call it runs immediately.
  pub fn defer_release(&self, release: impl FnOnce() + Send + 'static) {
    {
      let depth = self.inner.depth.lock();
      if *depth > 0 {
        self.inner.releasers.lock().push(Box::new(release));
        return;
      }
    }
    release();
  }

  pub(crate) fn enter(&self) -> Entry {
    let outermost = {
      let mut depth = self.inner.depth.lock();
      *depth += 1;
      *depth == 1
    };
    if outermost {
      let hooks = self.inner.enter_hooks.lock().clone();
      for hook in hooks {
        hook(self);
      }
    }
    Entry { ec: self.clone() }
  }

  /// Invokes `constructor` with `new` in the bound context and converts the result.
  pub fn new_instance<T: FromJs>(&self, constructor: &Value, args: &[&dyn ToJs]) -> Result<T, Error> {
    self.context()?.new_instance(self, constructor, args)
  }

  pub fn data(&self, key: &str) -> Result<Option<Arc<dyn Any + Send + Sync>>, Error> {
    Ok(self.context()?.data(key))
  }

  pub fn set_data(&self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) -> Result<(), Error> {
    self.context()?.set_data(key, value);
    Ok(())
  }

  fn console(&self, method: &str, args: &[&dyn ToJs]) -> Result<(), Error> {
    let context = self.context()?;
    let console = context.global(self)?.get(self, "console")?;
    console.call_method(self, method, args)?;
    Ok(())
  }

  console_methods! {
    assert => "assert",
    clear => "clear",
    count => "count",
    count_reset => "countReset",
    debug => "debug",
    dir => "dir",
    dirxml => "dirxml",
    error => "error",
    group => "group",
    group_collapsed => "groupCollapsed",
    group_end => "groupEnd",
    info => "info",
    log => "log",
    table => "table",
    time => "time",
    time_end => "timeEnd",
    time_log => "timeLog",
    trace => "trace",
    warn => "warn",
    profile => "profile",
    profile_end => "profileEnd",
    time_stamp => "timeStamp",
  }
}

/// Per-context string keyed user data.
#[derive(Default)]
pub(crate) struct DataMap {
  entries: Mutex<AHashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl DataMap {
  pub(crate) fn get(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
    self.entries.lock().get(key).cloned()
  }

  pub(crate) fn insert(&self, key: String, value: Arc<dyn Any + Send + Sync>) {
    self.entries.lock().insert(key, value);
  }

  pub(crate) fn clear(&self) {
    let drained: Vec<_> = self.entries.lock().drain().collect();
    drop(drained);
  }
}
