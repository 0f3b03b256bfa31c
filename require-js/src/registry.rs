//! Built-in runtimes: module ids that resolve to host code or to a file on a library file system
//! instead of going through path resolution.

use ahash::AHashMap;
use embed_js::Constructor;
use embed_js::Function;
use embed_js::FunctionArgs;
use embed_js::HostFunction;
use embed_js::Value;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::fs::ModuleFs;
use crate::module::Module;

/// Fills in a runtime module. Called with the global object as `this` and
/// `(module, exports, require, __filename, __dirname)` as arguments.
pub type RuntimeFactory = HostFunction;

#[derive(Clone)]
pub enum Runtime {
  Factory { path: String, factory: RuntimeFactory },
  Library { fs: Arc<dyn ModuleFs>, path: String },
}

impl Runtime {
  pub fn path(&self) -> &str {
    match self {
      Runtime::Factory { path, .. } => path,
      Runtime::Library { path, .. } => path,
    }
  }
}

/// Runtimes by module id. A name registered more than once evaluates every registration in order
/// into the same module.
#[derive(Default)]
pub struct Registry {
  runtimes: RwLock<AHashMap<String, Vec<Runtime>>>,
}

static GLOBAL: Lazy<Arc<Registry>> = Lazy::new(|| Arc::new(Registry::with_builtins()));

impl Registry {
  pub fn new() -> Registry {
    Registry::default()
  }

  /// A registry holding the `module` and `vm` runtimes.
  pub fn with_builtins() -> Registry {
    let registry = Registry::new();
    registry.register_runtime("module", "module", Arc::new(module_runtime));
    registry.register_runtime("vm", "vm", Arc::new(|args: &FunctionArgs| args.context.undefined(&args.ec)));
    registry
  }

  /// The process-wide registry used when no other is configured.
  pub fn global() -> Arc<Registry> {
    GLOBAL.clone()
  }

  pub fn register_runtime(&self, name: &str, path: &str, factory: RuntimeFactory) {
    tracing::debug!(name, path, "runtime registered");
    self.push(name, Runtime::Factory {
      path: path.to_string(),
      factory,
    });
  }

  /// Makes `name` load the file at `path` on `fs`.
  pub fn register_runtime_library(&self, name: &str, fs: Arc<dyn ModuleFs>, path: &str) {
    tracing::debug!(name, path, "runtime library registered");
    self.push(name, Runtime::Library {
      fs,
      path: path.to_string(),
    });
  }

  fn push(&self, name: &str, runtime: Runtime) {
    self
      .runtimes
      .write()
      .entry(name.to_string())
      .or_default()
      .push(runtime);
  }

  pub fn get(&self, name: &str) -> Option<Vec<Runtime>> {
    self.runtimes.read().get(name).cloned()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.runtimes.read().contains_key(name)
  }
}

pub fn register_runtime(name: &str, path: &str, factory: RuntimeFactory) {
  GLOBAL.register_runtime(name, path, factory);
}

pub fn register_runtime_library(name: &str, fs: Arc<dyn ModuleFs>, path: &str) {
  GLOBAL.register_runtime_library(name, fs, path);
}

/// `require("module")`: exposes the `Module` class.
fn module_runtime(args: &FunctionArgs) -> Result<Value, embed_js::Error> {
  let exports = args.arg(1).cloned().ok_or_else(|| embed_js::Error::msg("module runtime needs exports"))?;
  let class = args
    .context
    .create(&args.ec, &Constructor::new(|_: &FunctionArgs| Ok(Module::default())))?;
  let preload = args
    .context
    .create(&args.ec, &Function::named("_preloadModules", |args: &FunctionArgs| args.context.undefined(&args.ec)))?;
  class.set(&args.ec, "_preloadModules", &preload)?;
  exports.set(&args.ec, "Module", &class)?;
  args.context.undefined(&args.ec)
}
