//! Running an entry script with a `require` tree, and dynamic `import()` on top of it.

use embed_js::Context;
use embed_js::DynamicImport;
use embed_js::Error;
use embed_js::ExecutionContext;
use embed_js::Isolate;
use embed_js::Value;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::fs::ModuleFs;
use crate::module::Module;
use crate::require::create_require;
use crate::require::RequireOptions;

/// What the environment hook sees before the entry module runs.
pub struct RuntimeArgs<'a> {
  pub ec: &'a ExecutionContext,
  pub context: &'a Context,
  pub global: Value,
  /// A `require` resolving relative to the entry module.
  pub require: Value,
}

/// Creates a `require` tree on `fs`, lets `env` prepare the global environment, then requires the
/// module at `path` and returns its exports.
pub fn run_with_runtime(
  ec: &ExecutionContext,
  context: &Context,
  fs: Arc<dyn ModuleFs>,
  path: &str,
  options: &RequireOptions,
  env: impl FnOnce(&RuntimeArgs<'_>) -> Result<(), Error>,
) -> Result<Value, Error> {
  let _span = tracing::info_span!("run_with_runtime", path).entered();
  let require = create_require(ec, context, fs, path, options)?;
  env(&RuntimeArgs {
    ec,
    context,
    global: context.global(ec)?,
    require: require.clone(),
  })?;
  require.call(ec, None, &[&path])
}

pub(crate) fn install_import_handler(isolate: &Isolate) {
  isolate.set_dynamic_import_handler(Arc::new(import_module));
}

/// Settles `import(specifier)` with the exports of `require(specifier)` from the importing module.
fn import_module(ec: &ExecutionContext, import: DynamicImport, resolver: embed_js::Resolver) {
  let specifier = import
    .specifier
    .strip_prefix("file://")
    .unwrap_or(&import.specifier)
    .to_string();
  let require = import
    .module
    .downcast_ref::<Mutex<Module>>()
    .and_then(|module| module.lock().require.clone());
  let Some(require) = require else {
    let err = Error::msg(format!("cannot import {specifier} from {}", import.resource_name));
    if let Err(err) = resolver.reject(ec, &err) {
      tracing::debug!(%err, "rejecting dynamic import failed");
    }
    return;
  };
  tracing::debug!(%specifier, resource = %import.resource_name, "dynamic import");
  let scheduled = import.context.add_microtask(ec, move |args| {
    let exports = require
      .load(&args.ec)
      .and_then(|require| require.call(&args.ec, None, &[&specifier]));
    let settled = match exports {
      Ok(exports) => resolver.resolve_value(&args.ec, &exports),
      Err(err) => resolver.reject(&args.ec, &err),
    };
    if let Err(err) = settled {
      tracing::debug!(%err, "settling dynamic import failed");
    }
  });
  if let Err(err) = scheduled {
    tracing::debug!(%err, "scheduling dynamic import failed");
  }
}
