//! The `module` object handed to every CommonJS module.

use embed_js::Class;
use embed_js::ClassBuilder;
use embed_js::Error;
use embed_js::ExecutionContext;
use embed_js::FunctionArgs;
use embed_js::JsError;
use embed_js::RefId;
use embed_js::StoredValue;
use embed_js::Value;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::fs::value_to_string;
use crate::fs::ScriptFs;

const WRAPPER_HEAD: &str = "(function (module, exports, require, __filename, __dirname) {\n";
const WRAPPER_TAIL: &str = "\n})";

/// Host state of one loaded module. Script sees it as a `Module` instance with read-only `id`,
/// `fs`, `filename`, `dirname` and `require`, plus a writable `exports` data property.
///
/// Modules live in tables their context owns, so script values are kept as [`StoredValue`]s.
#[derive(Default)]
pub struct Module {
  pub(crate) id: String,
  pub(crate) fs: Option<Arc<Mutex<ScriptFs>>>,
  pub(crate) filename: String,
  pub(crate) dirname: String,
  pub(crate) require: Option<StoredValue>,
  /// The script object whose `exports` later requires return.
  pub(crate) object: Option<StoredValue>,
  /// Set when loading failed; later requires of the same module fail with it again.
  pub(crate) failure: Option<Failure>,
  /// The isolate module record scripts of this module are run with.
  pub(crate) record: Option<RefId>,
}

/// A load failure kept on its module.
#[derive(Clone)]
pub(crate) struct Failure {
  error: Error,
  thrown: Option<StoredValue>,
}

impl Failure {
  pub(crate) fn new(ec: &ExecutionContext, err: &Error) -> Failure {
    let thrown = err.value().and_then(|value| value.store(ec).ok());
    let error = match err {
      Error::Js(js) => Error::Js(JsError::new(js.message.clone(), None)),
      err => err.clone(),
    };
    Failure { error, thrown }
  }

  /// The error again, carrying the originally thrown value while its context is alive.
  pub(crate) fn error(&self, ec: &ExecutionContext) -> Error {
    let thrown = self.thrown.as_ref().and_then(|thrown| thrown.load(ec).ok());
    match (&self.error, thrown) {
      (Error::Js(js), Some(value)) => Error::Js(JsError::new(js.message.clone(), Some(value))),
      (error, _) => error.clone(),
    }
  }
}

impl Module {
  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn filename(&self) -> &str {
    &self.filename
  }

  pub fn dirname(&self) -> &str {
    &self.dirname
  }

  pub fn require(&self) -> Option<&StoredValue> {
    self.require.as_ref()
  }

  /// The load failure, without the thrown script value.
  pub fn error(&self) -> Option<&Error> {
    self.failure.as_ref().map(|failure| &failure.error)
  }
}

impl Class for Module {
  fn describe(class: &mut ClassBuilder<Self>) {
    class
      .getter("id", |m, args| args.context.create(&args.ec, &m.id))
      .getter("fs", |m, args| args.context.create(&args.ec, &m.fs))
      .getter("filename", |m, args| args.context.create(&args.ec, &m.filename))
      .getter("dirname", |m, args| args.context.create(&args.ec, &m.dirname))
      .getter("require", |m, args| args.context.create(&args.ec, &m.require))
      .function("_compile", compile);
  }
}

/// Drops a leading byte order mark and `#!` line.
pub fn strip_hashbang(source: &str) -> &str {
  let source = source.strip_prefix('\u{feff}').unwrap_or(source);
  if !source.starts_with('#') {
    return source;
  }
  match source.find('\n') {
    Some(end) => &source[end + 1..],
    None => "",
  }
}

pub fn wrap(source: &str) -> String {
  let source = strip_hashbang(source);
  let mut wrapped = String::with_capacity(WRAPPER_HEAD.len() + source.len() + WRAPPER_TAIL.len());
  wrapped.push_str(WRAPPER_HEAD);
  wrapped.push_str(source);
  wrapped.push_str(WRAPPER_TAIL);
  wrapped
}

/// `module._compile(content, filename)`: evaluates `content` as the body of the module wrapper
/// and calls it with this module.
fn compile(args: &FunctionArgs) -> Result<Value, Error> {
  let ec = &args.ec;
  let module: Arc<Mutex<Module>> = args.this.unmarshal(ec)?;
  let content = match args.arg(0) {
    Some(content) => value_to_string(ec, content)?,
    None => String::new(),
  };
  let (record, require, dirname, filename) = {
    let module = module.lock();
    let filename: Option<String> = args.arg_as(1)?;
    (
      module.record,
      module.require.clone(),
      module.dirname.clone(),
      filename.unwrap_or_else(|| module.filename.clone()),
    )
  };
  let _span = tracing::debug_span!("module.compile", %filename).entered();
  let source = wrap(&content);
  let wrapper = match record {
    Some(record) => args.context.run_with_module(ec, &source, &filename, record)?,
    None => args.context.run(ec, &source, &filename)?,
  };
  let exports = args.this.get(ec, "exports")?;
  let global = args.context.global(ec)?;
  let argv = [
    args.this.clone(),
    exports,
    args.context.create(ec, &require)?,
    args.context.create(ec, &filename)?,
    args.context.create(ec, &dirname)?,
  ];
  wrapper.call_value(ec, Some(&global), &argv)?;
  args.context.undefined(ec)
}

#[cfg(test)]
mod tests {
  use super::strip_hashbang;
  use super::wrap;

  #[test]
  fn strips_hashbang_and_bom() {
    assert_eq!(strip_hashbang("#!/usr/bin/env node\nmodule.exports = 1"), "module.exports = 1");
    assert_eq!(strip_hashbang("#!node\r\nx"), "x");
    assert_eq!(strip_hashbang("\u{feff}#!node\nx"), "x");
    assert_eq!(strip_hashbang("x\n#!not first"), "x\n#!not first");
    assert_eq!(strip_hashbang("#!only"), "");
  }

  #[test]
  fn wraps_in_function() {
    assert_eq!(
      wrap("return 1"),
      "(function (module, exports, require, __filename, __dirname) {\nreturn 1\n})"
    );
  }
}
