//! `require` functions and the module cache they share.

use ahash::AHashMap;
use ahash::AHashSet;
use embed_js::Context;
use embed_js::Error;
use embed_js::ExecutionContext;
use embed_js::Function;
use embed_js::FunctionArgs;
use embed_js::Isolate;
use embed_js::Kind;
use embed_js::RefId;
use embed_js::StoredValue;
use embed_js::Value;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::RequireError;
use crate::fs::value_to_string;
use crate::fs::ModuleFs;
use crate::fs::ScriptFs;
use crate::module::Failure;
use crate::module::Module;
use crate::path;
use crate::registry::Registry;
use crate::registry::Runtime;
use crate::resolve::Resolved;
use crate::resolve::Resolver;

/// Loaded modules by filename, or by id for runtimes.
pub type ModuleCache = Arc<Mutex<AHashMap<String, Arc<Mutex<Module>>>>>;

#[derive(Clone)]
pub struct RequireOptions {
  /// Extensions loaded as script, in probing order. `.json` is always loadable and probed last.
  pub extensions: Vec<String>,
  /// `exports` conditions in order of preference.
  pub conditions: Vec<String>,
  /// Ids that are never resolved, reported as missing.
  pub deny: AHashSet<String>,
  pub registry: Arc<Registry>,
  pub cache: ModuleCache,
}

impl Default for RequireOptions {
  fn default() -> Self {
    RequireOptions {
      extensions: vec![".js".to_string(), ".cjs".to_string()],
      conditions: ["solid", "node", "require", "default"]
        .into_iter()
        .map(String::from)
        .collect(),
      deny: AHashSet::new(),
      registry: Registry::global(),
      cache: ModuleCache::default(),
    }
  }
}

impl RequireOptions {
  pub fn with_conditions(mut self, conditions: &[&str]) -> Self {
    self.conditions = conditions.iter().map(|c| c.to_string()).collect();
    self
  }

  pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
    self.registry = registry;
    self
  }

  pub fn deny(mut self, id: impl Into<String>) -> Self {
    self.deny.insert(id.into());
    self
  }
}

/// State shared by every `require` function of one module tree.
#[derive(Clone)]
pub(crate) struct Loader {
  fs: Arc<dyn ModuleFs>,
  script_fs: Arc<Mutex<ScriptFs>>,
  /// The script-visible `require.extensions` object; its keys are the probed extensions.
  extensions: StoredValue,
  conditions: Arc<[String]>,
  deny: Arc<AHashSet<String>>,
  registry: Arc<Registry>,
  cache: ModuleCache,
  records: Arc<Records>,
}

/// Isolate module records of the modules one `require` tree loaded, unregistered once every
/// loader of the tree is gone.
struct Records {
  isolate: Isolate,
  ids: Mutex<Vec<RefId>>,
}

impl Records {
  fn register(&self, module: &Arc<Mutex<Module>>) -> RefId {
    let id = self.isolate.register_module(module.clone());
    self.ids.lock().push(id);
    id
  }
}

impl Drop for Records {
  fn drop(&mut self) {
    for id in self.ids.get_mut().drain(..) {
      self.isolate.unregister_module(id);
    }
  }
}

enum Entry {
  Factory(embed_js::HostFunction),
  File(String),
}

/// Creates a `require` function resolving relative to the file `path` on `fs`.
pub fn create_require(
  ec: &ExecutionContext,
  context: &Context,
  fs: Arc<dyn ModuleFs>,
  path: &str,
  options: &RequireOptions,
) -> Result<Value, Error> {
  let extensions = context.new_object(ec)?;
  for ext in &options.extensions {
    extensions.set(ec, ext, &Function::named("loadScript", load_script))?;
  }
  extensions.set(ec, ".json", &Function::named("loadJson", load_json))?;
  let loader = Arc::new(Loader {
    script_fs: ScriptFs::new(fs.clone()),
    fs,
    extensions: extensions.store(ec)?,
    conditions: options.conditions.iter().cloned().collect(),
    deny: Arc::new(options.deny.clone()),
    registry: options.registry.clone(),
    cache: options.cache.clone(),
    records: Arc::new(Records {
      isolate: context.isolate().clone(),
      ids: Mutex::new(Vec::new()),
    }),
  });
  crate::runtime::install_import_handler(context.isolate());
  loader.require_function(ec, context, path)
}

impl Loader {
  fn with_fs(&self, fs: Arc<dyn ModuleFs>) -> Arc<Loader> {
    Arc::new(Loader {
      script_fs: ScriptFs::new(fs.clone()),
      fs,
      ..self.clone()
    })
  }

  fn require_function(self: &Arc<Self>, ec: &ExecutionContext, context: &Context, path: &str) -> Result<Value, Error> {
    let dir = path::dirname(path);
    let require = {
      let loader = self.clone();
      let dir = dir.clone();
      context.create(ec, &Function::named("require", move |args: &FunctionArgs| loader.require(args, &dir)))?
    };
    let resolve = {
      let loader = self.clone();
      Function::named("resolve", move |args: &FunctionArgs| {
        let id = module_id(args)?;
        let resolved = match loader.resolve(&args.ec, &id, &dir)? {
          Resolved::Runtime(_) => id,
          Resolved::File(file) => file,
        };
        args.context.create(&args.ec, &resolved)
      })
    };
    require.set(ec, "resolve", &resolve)?;
    require.set(ec, "extensions", &self.extensions)?;
    Ok(require)
  }

  fn resolve(&self, ec: &ExecutionContext, id: &str, dir: &str) -> Result<Resolved, Error> {
    if self.deny.contains(id) {
      return Err(
        RequireError::Denied {
          id: id.to_string(),
          dir: dir.to_string(),
        }
        .into(),
      );
    }
    let extensions = self.extensions.load(ec)?.keys(ec)?;
    let resolver = Resolver {
      fs: self.fs.as_ref(),
      registry: &self.registry,
      extensions: &extensions,
      conditions: &self.conditions,
    };
    Ok(resolver.resolve(id, dir)?)
  }

  fn require(self: &Arc<Self>, args: &FunctionArgs, dir: &str) -> Result<Value, Error> {
    let ec = &args.ec;
    let context = &args.context;
    let id = module_id(args)?;
    let _span = tracing::debug_span!("require", %id, dir).entered();

    let (key, loader, filename, entries) = match self.resolve(ec, &id, dir)? {
      Resolved::File(file) => {
        let filename = self.fs.realpath(&file).map_err(|e| RequireError::io(&file, e))?;
        (filename.clone(), self.clone(), filename.clone(), vec![Entry::File(filename)])
      }
      Resolved::Runtime(runtimes) => {
        let mut loader = self.clone();
        let mut filename = None;
        let mut entries = Vec::with_capacity(runtimes.len());
        for runtime in runtimes {
          match runtime {
            Runtime::Factory { path, factory } => {
              filename.get_or_insert(path);
              entries.push(Entry::Factory(factory));
            }
            Runtime::Library { fs, path } => {
              let real = fs.realpath(&path).map_err(|e| RequireError::io(&path, e))?;
              if filename.is_none() {
                filename = Some(real.clone());
                loader = self.with_fs(fs);
              }
              entries.push(Entry::File(real));
            }
          }
        }
        (id.clone(), loader, filename.unwrap_or_else(|| id.clone()), entries)
      }
    };

    let cached = self.cache.lock().get(&key).cloned();
    if let Some(module) = cached {
      let (failure, object) = {
        let module = module.lock();
        (module.failure.clone(), module.object.clone())
      };
      if let Some(failure) = failure {
        return Err(failure.error(ec));
      }
      tracing::trace!(%key, "module cache hit");
      let object = match object {
        Some(object) => object.load(ec)?,
        None => context.create(ec, &module)?,
      };
      return object.get(ec, "exports");
    }

    let dirname = path::dirname(&filename);
    let module = Arc::new(Mutex::new(Module {
      id: key.clone(),
      fs: Some(loader.script_fs.clone()),
      filename: filename.clone(),
      dirname: dirname.clone(),
      require: Some(loader.require_function(ec, context, &filename)?.store(ec)?),
      object: None,
      failure: None,
      record: None,
    }));
    let record = self.records.register(&module);
    module.lock().record = Some(record);
    // Inserted before evaluation so require cycles see the partially filled exports.
    self.cache.lock().insert(key.clone(), module.clone());

    let result = self.evaluate(args, &module, &id, dir, &entries);
    if let Err(err) = &result {
      tracing::debug!(%key, error = %err, "module failed to load");
      let failure = Failure::new(ec, err);
      module.lock().failure = Some(failure);
    }
    result
  }

  fn evaluate(
    &self,
    args: &FunctionArgs,
    module: &Arc<Mutex<Module>>,
    id: &str,
    dir: &str,
    entries: &[Entry],
  ) -> Result<Value, Error> {
    let ec = &args.ec;
    let context = &args.context;
    let module_value = context.create(ec, module)?;
    module_value.set(ec, "exports", &context.new_object(ec)?)?;
    let object = module_value.store(ec)?;
    module.lock().object = Some(object);
    let (require, filename, dirname) = {
      let module = module.lock();
      (module.require.clone(), module.filename.clone(), module.dirname.clone())
    };

    for entry in entries {
      match entry {
        Entry::Factory(factory) => {
          let global = context.global(ec)?;
          let call = FunctionArgs {
            ec: ec.clone(),
            context: context.clone(),
            this: global.clone(),
            holder: global,
            is_construct_call: false,
            args: vec![
              module_value.clone(),
              module_value.get(ec, "exports")?,
              context.create(ec, &require)?,
              context.create(ec, &filename)?,
              context.create(ec, &dirname)?,
            ],
            caller: None,
          };
          factory(&call)?;
        }
        Entry::File(file) => {
          let ext = match path::extname(file) {
            "" => ".js",
            ext => ext,
          };
          let load = self.extensions.load(ec)?.get(ec, ext)?;
          if !load.is_kind(Kind::FUNCTION) {
            return Err(RequireError::not_resolved(id, dir).into());
          }
          load.call_value(ec, None, &[module_value.clone(), context.create(ec, file)?])?;
        }
      }
      default_interop(ec, context, &module_value)?;
    }
    module_value.get(ec, "exports")
  }
}

fn module_id(args: &FunctionArgs) -> Result<String, Error> {
  let id: Option<String> = args.arg_as(0)?;
  id.ok_or_else(|| Error::msg("module id must be a string"))
}

/// Makes an object `default` export the module's exports, with the other exports copied onto it.
fn default_interop(ec: &ExecutionContext, context: &Context, module: &Value) -> Result<(), Error> {
  let exports = module.get(ec, "exports")?;
  if !exports.is_kind(Kind::OBJECT) {
    return Ok(());
  }
  let default = exports.get(ec, "default")?;
  if !default.is_kind(Kind::OBJECT) || default.strict_equals(ec, &exports)? {
    return Ok(());
  }
  module.set(ec, "exports", &default)?;
  context.assign(ec, &default, &[exports])?;
  Ok(())
}

fn read_source(args: &FunctionArgs, module: &Value, filename: &Value) -> Result<String, Error> {
  let fs = module.get(&args.ec, "fs")?;
  let contents = fs.call_method(&args.ec, "readFileSync", &[filename, &"utf8"])?;
  value_to_string(&args.ec, &contents)
}

/// `require.extensions[".js"]`: reads through `module.fs` and compiles.
fn load_script(args: &FunctionArgs) -> Result<Value, Error> {
  let ec = &args.ec;
  let (module, filename) = loader_args(args)?;
  let source = read_source(args, &module, &filename)?;
  module.call_method(ec, "_compile", &[&source, &filename])?;
  args.context.undefined(ec)
}

/// `require.extensions[".json"]`: parses the file into `module.exports`.
fn load_json(args: &FunctionArgs) -> Result<Value, Error> {
  let ec = &args.ec;
  let (module, filename) = loader_args(args)?;
  let source = read_source(args, &module, &filename)?;
  let exports = args.context.parse_json(ec, source.strip_prefix('\u{feff}').unwrap_or(&source))?;
  module.set(ec, "exports", &exports)?;
  args.context.undefined(ec)
}

fn loader_args(args: &FunctionArgs) -> Result<(Value, Value), Error> {
  match (args.arg(0), args.arg(1)) {
    (Some(module), Some(filename)) => Ok((module.clone(), filename.clone())),
    _ => Err(Error::msg("loader expects (module, filename)")),
  }
}
