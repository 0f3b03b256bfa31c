//! Engine entry points for host functions and accessors.
//!
//! Every host function, getter and setter installed into the engine carries a [`CallbackId`]
//! string as its data. When the engine calls back, the id leads to the isolate (through the
//! process-wide [`Directory`]), the context, and the host closure registered in that context.

use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::directory::Directory;
use crate::error::JsError;
use crate::isolate::DynamicImport;
use crate::isolate::IsolateSlot;
use crate::marshal::FromJs;
use crate::marshal::ToJs;
use crate::refs::CallbackId;
use crate::refs::RefId;
use crate::Context;
use crate::Error;
use crate::ExecutionContext;
use crate::Isolate;
use crate::Resolver;
use crate::Value;

pub type HostFunction = Arc<dyn Fn(&FunctionArgs) -> Result<Value, Error> + Send + Sync>;
pub type GetterFn = Arc<dyn Fn(&GetterArgs) -> Result<Value, Error> + Send + Sync>;
pub type SetterFn = Arc<dyn Fn(&SetterArgs) -> Result<(), Error> + Send + Sync>;

/// A named property accessor registered in a context.
pub(crate) struct Accessor {
  pub(crate) name: String,
  pub(crate) getter: Option<GetterFn>,
  pub(crate) setter: Option<SetterFn>,
}

/// Where in script a callback was invoked from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerInfo {
  pub function: String,
  pub file: String,
  pub line: usize,
  pub column: usize,
}

/// Everything a host function sees of its invocation.
pub struct FunctionArgs {
  pub ec: ExecutionContext,
  pub context: Context,
  pub this: Value,
  pub holder: Value,
  pub is_construct_call: bool,
  pub args: Vec<Value>,
  pub caller: Option<CallerInfo>,
}

impl FunctionArgs {
  /// Arguments for a host-initiated call with no script caller.
  pub(crate) fn synthetic(ec: &ExecutionContext, context: &Context, this: &Value) -> FunctionArgs {
    FunctionArgs {
      ec: ec.clone(),
      context: context.clone(),
      this: this.clone(),
      holder: this.clone(),
      is_construct_call: false,
      args: Vec::new(),
      caller: None,
    }
  }

  pub fn arg(&self, index: usize) -> Option<&Value> {
    self.args.get(index)
  }

  pub fn len(&self) -> usize {
    self.args.len()
  }

  pub fn is_empty(&self) -> bool {
    self.args.is_empty()
  }

  /// Converts argument `index`; a missing argument converts from `undefined`.
  pub fn arg_as<T: FromJs>(&self, index: usize) -> Result<T, Error> {
    match self.args.get(index) {
      Some(value) => T::from_js(&self.ec, value),
      None => T::from_js(&self.ec, &self.context.undefined(&self.ec)?),
    }
  }
}

pub struct GetterArgs {
  base: FunctionArgs,
  pub key: String,
}

impl Deref for GetterArgs {
  type Target = FunctionArgs;

  fn deref(&self) -> &FunctionArgs {
    &self.base
  }
}

pub struct SetterArgs {
  base: FunctionArgs,
  pub key: String,
  pub value: Value,
}

impl Deref for SetterArgs {
  type Target = FunctionArgs;

  fn deref(&self) -> &FunctionArgs {
    &self.base
  }
}

#[derive(Clone, Copy)]
enum CallbackKind {
  Function,
  Getter,
  Setter,
}

pub(crate) fn function_callback<'s>(
  scope: &mut v8::HandleScope<'s>,
  args: v8::FunctionCallbackArguments<'s>,
  mut rv: v8::ReturnValue,
) {
  dispatch(scope, &args, &mut rv, CallbackKind::Function);
}

pub(crate) fn getter_callback<'s>(
  scope: &mut v8::HandleScope<'s>,
  args: v8::FunctionCallbackArguments<'s>,
  mut rv: v8::ReturnValue,
) {
  dispatch(scope, &args, &mut rv, CallbackKind::Getter);
}

pub(crate) fn setter_callback<'s>(
  scope: &mut v8::HandleScope<'s>,
  args: v8::FunctionCallbackArguments<'s>,
  mut rv: v8::ReturnValue,
) {
  dispatch(scope, &args, &mut rv, CallbackKind::Setter);
}

/// The call behavior of synthesized classes without a host constructor: `new` yields `this`.
pub(crate) fn identity_callback(
  _scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  rv.set(args.this().into());
}

fn dispatch<'s>(
  scope: &mut v8::HandleScope<'s>,
  args: &v8::FunctionCallbackArguments<'s>,
  rv: &mut v8::ReturnValue,
  kind: CallbackKind,
) {
  let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| invoke(scope, args, kind)));
  let result = match outcome {
    Ok(result) => result,
    Err(payload) => {
      let err = Error::from_panic(payload);
      tracing::error!(error = %err, "host callback panicked");
      Err(err)
    }
  };
  match result {
    Ok(Some(value)) => rv.set(value),
    Ok(None) => {}
    Err(err) => throw(scope, err),
  }
}

struct ActiveGuard<'a>(&'a Isolate);

impl Drop for ActiveGuard<'_> {
  fn drop(&mut self) {
    self.0.inner().pop_active();
  }
}

fn invoke<'s>(
  scope: &mut v8::HandleScope<'s>,
  args: &v8::FunctionCallbackArguments<'s>,
  kind: CallbackKind,
) -> Result<Option<v8::Local<'s, v8::Value>>, Error> {
  let id: CallbackId = args.data().to_rust_string_lossy(scope).parse()?;
  let directory = Directory::global();
  let isolate = directory.isolate(id.isolate).ok_or(Error::Terminated)?;
  let context = isolate.context(id.context).ok_or(Error::ContextReleased)?;
  let ec = isolate
    .inner()
    .active_execution_context()
    .or_else(|| id.execution_context.and_then(|ec| directory.execution_context(ec)))
    .unwrap_or_else(|| ExecutionContext::with_context(&context));

  let _entry = ec.enter();
  isolate.inner().push_active(ec.clone());
  let _active = ActiveGuard(&isolate);

  let this = context.value(scope, args.this().into());
  let holder = context.value(scope, args.holder().into());
  let argv: Vec<Value> = (0..args.length()).map(|i| context.value(scope, args.get(i))).collect();
  let base = FunctionArgs {
    ec,
    context: context.clone(),
    this,
    holder,
    is_construct_call: !args.new_target().is_undefined(),
    args: argv,
    caller: caller(scope),
  };

  let ec = base.ec.clone();
  let result = match call(&context, id.callback, base, kind) {
    Ok(Some(result)) => result,
    Ok(None) => return Ok(None),
    Err(err) => return Err(script_error(&ec, &context, err)),
  };
  result.check_isolate(&isolate)?;
  Ok(Some(result.open(scope)))
}

fn call(context: &Context, callback: RefId, base: FunctionArgs, kind: CallbackKind) -> Result<Option<Value>, Error> {
  let result = match kind {
    CallbackKind::Function => {
      let f = context
        .lookup_function(callback)
        .ok_or_else(|| Error::msg(format!("function {} not registered", callback)))?;
      f(&base)?
    }
    CallbackKind::Getter => {
      let accessor = context
        .lookup_accessor(callback)
        .ok_or_else(|| Error::msg(format!("accessor {} not registered", callback)))?;
      let getter = accessor
        .getter
        .clone()
        .ok_or_else(|| Error::msg(format!("{} has no getter", accessor.name)))?;
      getter(&GetterArgs {
        base,
        key: accessor.name.clone(),
      })?
    }
    CallbackKind::Setter => {
      let accessor = context
        .lookup_accessor(callback)
        .ok_or_else(|| Error::msg(format!("accessor {} not registered", callback)))?;
      let setter = accessor
        .setter
        .clone()
        .ok_or_else(|| Error::msg(format!("{} is read-only", accessor.name)))?;
      let value = match base.args.first() {
        Some(value) => value.clone(),
        None => context.undefined(&base.ec)?,
      };
      setter(&SetterArgs {
        base,
        key: accessor.name.clone(),
        value,
      })?;
      return Ok(None);
    }
  };
  Ok(Some(result))
}

/// Marshals a failed host call's error through its [`ToJs`] so it is thrown with its own shape.
fn script_error(ec: &ExecutionContext, context: &Context, err: Error) -> Error {
  if err.value().is_some() || matches!(err, Error::Terminated) {
    return err;
  }
  match err.to_js(ec, context) {
    Ok(value) => Error::Js(JsError::new(err.to_string(), Some(value))),
    Err(marshal) => {
      tracing::debug!(error = %err, %marshal, "host error could not be marshaled");
      err
    }
  }
}

fn caller(scope: &mut v8::HandleScope<'_>) -> Option<CallerInfo> {
  let trace = v8::StackTrace::current_stack_trace(scope, 1)?;
  let frame = trace.get_frame(scope, 0)?;
  let function = frame
    .get_function_name(scope)
    .map(|name| name.to_rust_string_lossy(scope))
    .unwrap_or_default();
  let file = frame
    .get_script_name(scope)
    .map(|name| name.to_rust_string_lossy(scope))
    .unwrap_or_default();
  Some(CallerInfo {
    function,
    file,
    line: frame.get_line_number(),
    column: frame.get_column(),
  })
}

/// Throws `err` into script: errors carrying a script value are rethrown as-is, anything else
/// becomes an `Error`.
fn throw(scope: &mut v8::HandleScope<'_>, err: Error) {
  if matches!(err, Error::Terminated) {
    return;
  }
  let current = scope.get_slot::<IsolateSlot>().map(|slot| slot.0);
  if let Some(value) = err.value() {
    if Some(value.isolate().id()) == current {
      let exception = value.open(scope);
      scope.throw_exception(exception);
      return;
    }
  }
  tracing::debug!(error = %err, "host callback failed");
  let message = v8::String::new(scope, &err.to_string()).unwrap_or_else(|| v8::String::empty(scope));
  let exception = v8::Exception::error(scope, message);
  scope.throw_exception(exception);
}

pub(crate) fn import_module_dynamically<'s>(
  scope: &mut v8::HandleScope<'s>,
  _host_defined_options: v8::Local<'s, v8::Data>,
  resource_name: v8::Local<'s, v8::Value>,
  specifier: v8::Local<'s, v8::String>,
  import_assertions: v8::Local<'s, v8::FixedArray>,
) -> Option<v8::Local<'s, v8::Promise>> {
  let resolver = v8::PromiseResolver::new(scope)?;
  let promise = resolver.get_promise(scope);
  if let Err(err) = schedule_import(scope, resolver, resource_name, specifier, import_assertions) {
    tracing::debug!(error = %err, "dynamic import rejected");
    let message = v8::String::new(scope, &err.to_string()).unwrap_or_else(|| v8::String::empty(scope));
    let exception = v8::Exception::error(scope, message);
    resolver.reject(scope, exception);
  }
  Some(promise)
}

fn schedule_import<'s>(
  scope: &mut v8::HandleScope<'s>,
  resolver: v8::Local<'s, v8::PromiseResolver>,
  resource_name: v8::Local<'s, v8::Value>,
  specifier: v8::Local<'s, v8::String>,
  import_assertions: v8::Local<'s, v8::FixedArray>,
) -> Result<(), Error> {
  let id = scope
    .get_slot::<IsolateSlot>()
    .map(|slot| slot.0)
    .ok_or(Error::Terminated)?;
  let isolate = Directory::global().isolate(id).ok_or(Error::Terminated)?;
  let current = scope.get_current_context();
  let context = isolate
    .contexts()
    .into_iter()
    .find(|c| c.local(scope).map(|local| local == current).unwrap_or(false))
    .ok_or(Error::NoContext)?;

  let resource_name = resource_name.to_rust_string_lossy(scope);
  let specifier = specifier.to_rust_string_lossy(scope);
  let mut assertions = Vec::with_capacity(import_assertions.length());
  for i in 0..import_assertions.length() {
    let entry = import_assertions
      .get(scope, i)
      .and_then(|data| v8::Local::<v8::Value>::try_from(data).ok());
    if let Some(entry) = entry {
      assertions.push(context.value(scope, entry));
    }
  }

  let handler = isolate
    .dynamic_import_handler()
    .ok_or_else(|| Error::msg("dynamic import is not supported"))?;
  let module_id = context
    .module_for_resource(&resource_name)
    .ok_or_else(|| Error::msg(format!("no module registered for {resource_name}")))?;
  let module = isolate
    .module(module_id)
    .ok_or_else(|| Error::msg(format!("module {module_id} was released")))?;
  let resolver = Resolver::from_local(&context, scope, resolver);
  let ec = isolate
    .inner()
    .active_execution_context()
    .unwrap_or_else(|| ExecutionContext::with_context(&context));

  tracing::trace!(%specifier, %resource_name, "dynamic import");
  let import = DynamicImport {
    module,
    specifier,
    resource_name,
    import_assertions: assertions,
    context,
  };
  isolate.background(&ec, move |ec| handler(ec, import, resolver));
  Ok(())
}
