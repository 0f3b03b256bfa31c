use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use crate::callback::FunctionArgs;
use crate::callback::HostFunction;
use crate::context::error_message;
use crate::context::string;
use crate::context::Builtin;
use crate::context::ContextInner;
use crate::error::JsError;
use crate::handle::Persistent;
use crate::marshal::FromJs;
use crate::marshal::ToJs;
use crate::scope;
use crate::tracer;
use crate::Context;
use crate::Error;
use crate::ExecutionContext;
use crate::Isolate;
use crate::Kind;

static NEXT_VALUE_ID: AtomicU64 = AtomicU64::new(1);

/// A host handle to a script value. Clones share the same engine handle.
#[derive(Clone)]
pub struct Value {
  inner: Arc<ValueInner>,
}

pub(crate) struct ValueInner {
  id: u64,
  context: Context,
  handle: Persistent<v8::Value>,
  kind: Kind,
}

impl Drop for ValueInner {
  fn drop(&mut self) {
    self.context.value_dropped();
    tracer::release(tracer::Resource::Value, self.id);
  }
}

/// A property descriptor for [`Value::define_property`]. Either `value` or `get`/`set` is used.
#[derive(Clone, Default)]
pub struct PropertyDescriptor {
  pub value: Option<Value>,
  pub get: Option<Value>,
  pub set: Option<Value>,
  pub writable: bool,
  pub enumerable: bool,
  pub configurable: bool,
}

impl PropertyDescriptor {
  pub fn data(value: Value) -> Self {
    Self {
      value: Some(value),
      ..Default::default()
    }
  }

  pub fn accessor(get: Option<Value>, set: Option<Value>) -> Self {
    Self {
      get,
      set,
      ..Default::default()
    }
  }

  pub fn writable(mut self, writable: bool) -> Self {
    self.writable = writable;
    self
  }

  pub fn enumerable(mut self, enumerable: bool) -> Self {
    self.enumerable = enumerable;
    self
  }

  pub fn configurable(mut self, configurable: bool) -> Self {
    self.configurable = configurable;
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
  Pending,
  Fulfilled,
  Rejected,
}

#[derive(Debug, Clone)]
pub struct PromiseInfo {
  pub state: PromiseState,
  /// The fulfilment value or rejection reason; `None` while pending.
  pub result: Option<Value>,
}

impl Value {
  pub(crate) fn from_local<'s>(context: &Context, scope: &mut v8::HandleScope<'s>, local: v8::Local<'s, v8::Value>) -> Value {
    let id = NEXT_VALUE_ID.fetch_add(1, Ordering::Relaxed);
    let kind = Kind::of(&local);
    let handle = Persistent::new(context.isolate().inner(), scope, local);
    context.value_created();
    tracer::retain(tracer::Resource::Value, id);
    Value {
      inner: Arc::new(ValueInner {
        id,
        context: context.clone(),
        handle,
        kind,
      }),
    }
  }

  pub(crate) fn from_inner(inner: Arc<ValueInner>) -> Value {
    Value { inner }
  }

  pub(crate) fn downgrade(&self) -> Weak<ValueInner> {
    Arc::downgrade(&self.inner)
  }

  pub(crate) fn open<'s>(&self, scope: &mut v8::HandleScope<'s, ()>) -> v8::Local<'s, v8::Value> {
    self.inner.handle.open(scope)
  }

  pub(crate) fn object<'s>(&self, scope: &mut v8::HandleScope<'s, ()>) -> Result<v8::Local<'s, v8::Object>, Error> {
    v8::Local::<v8::Object>::try_from(self.open(scope)).map_err(|_| self.kind_error(Kind::OBJECT))
  }

  fn function<'s>(&self, scope: &mut v8::HandleScope<'s, ()>) -> Result<v8::Local<'s, v8::Function>, Error> {
    v8::Local::<v8::Function>::try_from(self.open(scope)).map_err(|_| self.kind_error(Kind::FUNCTION))
  }

  fn kind_error(&self, expected: Kind) -> Error {
    Error::Kind {
      expected,
      found: self.inner.kind,
    }
  }

  pub fn ptr_eq(a: &Value, b: &Value) -> bool {
    Arc::ptr_eq(&a.inner, &b.inner)
  }

  pub fn context(&self) -> &Context {
    &self.inner.context
  }

  pub fn isolate(&self) -> &Isolate {
    self.inner.context.isolate()
  }

  pub fn kind(&self) -> Kind {
    self.inner.kind
  }

  /// Whether the value carries any of the kinds in `kind`.
  pub fn is_kind(&self, kind: Kind) -> bool {
    self.inner.kind.intersects(kind)
  }

  pub(crate) fn require_kind(&self, kind: Kind) -> Result<(), Error> {
    if self.is_kind(kind) {
      Ok(())
    } else {
      Err(self.kind_error(kind))
    }
  }

  pub(crate) fn check_isolate(&self, isolate: &Isolate) -> Result<(), Error> {
    if self.inner.handle.isolate_id() == isolate.id() {
      Ok(())
    } else {
      Err(Error::CrossIsolate)
    }
  }

  pub fn define_property(&self, ec: &ExecutionContext, key: &str, descriptor: &PropertyDescriptor) -> Result<(), Error> {
    self.require_kind(Kind::OBJECT)?;
    for value in [&descriptor.value, &descriptor.get, &descriptor.set].into_iter().flatten() {
      value.check_isolate(self.isolate())?;
    }
    self.context().sync(ec, |scope, ctx| {
      let object = self.object(scope)?;
      let desc = v8::Object::new(scope);
      let mut put = |scope: &mut v8::HandleScope<'_>, name: &str, value: v8::Local<v8::Value>| -> Result<(), Error> {
        let name = string(scope, name)?;
        ctx.catch(scope, |scope| desc.set(scope, name.into(), value)).map(|_| ())
      };
      let accessor = descriptor.get.is_some() || descriptor.set.is_some();
      if let Some(get) = &descriptor.get {
        let get = get.open(scope);
        put(scope, "get", get)?;
      }
      if let Some(set) = &descriptor.set {
        let set = set.open(scope);
        put(scope, "set", set)?;
      }
      if !accessor {
        let value = match &descriptor.value {
          Some(value) => value.open(scope),
          None => v8::undefined(scope).into(),
        };
        put(scope, "value", value)?;
        let writable = v8::Boolean::new(scope, descriptor.writable).into();
        put(scope, "writable", writable)?;
      }
      let enumerable = v8::Boolean::new(scope, descriptor.enumerable).into();
      put(scope, "enumerable", enumerable)?;
      let configurable = v8::Boolean::new(scope, descriptor.configurable).into();
      put(scope, "configurable", configurable)?;
      let key = string(scope, key)?;
      ctx.call_builtin(scope, Builtin::DefineProperty, &[object.into(), key.into(), desc.into()])?;
      Ok(())
    })
  }

  pub fn get(&self, ec: &ExecutionContext, key: &str) -> Result<Value, Error> {
    self.require_kind(Kind::OBJECT)?;
    self.context().sync(ec, |scope, ctx| {
      let object = self.object(scope)?;
      let key = string(scope, key)?;
      let value = ctx.catch(scope, |scope| object.get(scope, key.into()))?;
      Ok(ctx.value(scope, value))
    })
  }

  pub fn set(&self, ec: &ExecutionContext, key: &str, value: &dyn ToJs) -> Result<(), Error> {
    self.require_kind(Kind::OBJECT)?;
    let value = value.to_js(ec, self.context())?;
    value.check_isolate(self.isolate())?;
    self.context().sync(ec, |scope, ctx| {
      let object = self.object(scope)?;
      let key = string(scope, key)?;
      let value = value.open(scope);
      ctx.catch(scope, |scope| object.set(scope, key.into(), value))?;
      Ok(())
    })
  }

  pub fn get_index(&self, ec: &ExecutionContext, index: u32) -> Result<Value, Error> {
    self.require_kind(Kind::OBJECT)?;
    self.context().sync(ec, |scope, ctx| {
      let object = self.object(scope)?;
      let value = ctx.catch(scope, |scope| object.get_index(scope, index))?;
      Ok(ctx.value(scope, value))
    })
  }

  pub fn set_index(&self, ec: &ExecutionContext, index: u32, value: &dyn ToJs) -> Result<(), Error> {
    self.require_kind(Kind::OBJECT)?;
    let value = value.to_js(ec, self.context())?;
    value.check_isolate(self.isolate())?;
    self.context().sync(ec, |scope, ctx| {
      let object = self.object(scope)?;
      let value = value.open(scope);
      ctx.catch(scope, |scope| object.set_index(scope, index, value))?;
      Ok(())
    })
  }

  /// The `length` property as an integer.
  pub fn length(&self, ec: &ExecutionContext) -> Result<i64, Error> {
    self.get(ec, "length")?.int64(ec)
  }

  pub fn internal_field_count(&self, ec: &ExecutionContext) -> Result<usize, Error> {
    self.require_kind(Kind::OBJECT)?;
    self.context().sync(ec, |scope, _| Ok(self.object(scope)?.internal_field_count()))
  }

  pub fn internal_field(&self, ec: &ExecutionContext, index: usize) -> Result<Value, Error> {
    self.require_kind(Kind::OBJECT)?;
    self.context().sync(ec, |scope, ctx| {
      let object = self.object(scope)?;
      if index >= object.internal_field_count() {
        return Err(Error::msg(format!("internal field {index} out of range")));
      }
      let field = object
        .get_internal_field(scope, index)
        .and_then(|f| v8::Local::<v8::Value>::try_from(f).ok())
        .unwrap_or_else(|| v8::undefined(scope).into());
      Ok(ctx.value(scope, field))
    })
  }

  pub fn set_internal_field(&self, ec: &ExecutionContext, index: usize, value: &Value) -> Result<(), Error> {
    self.require_kind(Kind::OBJECT)?;
    value.check_isolate(self.isolate())?;
    self.context().sync(ec, |scope, _| {
      let object = self.object(scope)?;
      if index >= object.internal_field_count() {
        return Err(Error::msg(format!("internal field {index} out of range")));
      }
      let value = value.open(scope);
      object.set_internal_field(index, value.into());
      Ok(())
    })
  }

  /// Calls this function, marshaling `this` and `args` first.
  pub fn call(&self, ec: &ExecutionContext, this: Option<&dyn ToJs>, args: &[&dyn ToJs]) -> Result<Value, Error> {
    let this = this.map(|t| t.to_js(ec, self.context())).transpose()?;
    let args = marshal_args(ec, self.context(), args)?;
    self.call_value(ec, this.as_ref(), &args)
  }

  pub fn call_value(&self, ec: &ExecutionContext, this: Option<&Value>, args: &[Value]) -> Result<Value, Error> {
    self.require_kind(Kind::FUNCTION)?;
    for value in this.into_iter().chain(args) {
      value.check_isolate(self.isolate())?;
    }
    self.context().sync(ec, |scope, ctx| {
      let function = self.function(scope)?;
      let recv = match this {
        Some(this) => this.open(scope),
        None => v8::undefined(scope).into(),
      };
      let argv: Vec<_> = args.iter().map(|a| a.open(scope)).collect();
      let result = ctx.catch(scope, |scope| function.call(scope, recv, &argv))?;
      Ok(ctx.value(scope, result))
    })
  }

  /// Calls the method `name` of this object with this object as `this`.
  pub fn call_method(&self, ec: &ExecutionContext, name: &str, args: &[&dyn ToJs]) -> Result<Value, Error> {
    let method = self.get(ec, name)?;
    let args = marshal_args(ec, self.context(), args)?;
    method.call_value(ec, Some(self), &args)
  }

  /// `new this(...args)`.
  pub fn new(&self, ec: &ExecutionContext, args: &[&dyn ToJs]) -> Result<Value, Error> {
    let args = marshal_args(ec, self.context(), args)?;
    self.new_value(ec, &args)
  }

  pub fn new_value(&self, ec: &ExecutionContext, args: &[Value]) -> Result<Value, Error> {
    self.require_kind(Kind::FUNCTION)?;
    for value in args {
      value.check_isolate(self.isolate())?;
    }
    self.context().sync(ec, |scope, ctx| {
      let function = self.function(scope)?;
      let argv: Vec<_> = args.iter().map(|a| a.open(scope)).collect();
      let result = ctx.catch(scope, |scope| function.new_instance(scope, &argv))?;
      Ok(ctx.value(scope, result.into()))
    })
  }

  /// `this.bind(target)`.
  pub fn bind(&self, ec: &ExecutionContext, target: &Value) -> Result<Value, Error> {
    self.require_kind(Kind::FUNCTION)?;
    self.call_method(ec, "bind", &[target])
  }

  /// The method `name` bound to this object.
  pub fn bind_method(&self, ec: &ExecutionContext, name: &str) -> Result<Value, Error> {
    self.get(ec, name)?.bind(ec, self)
  }

  /// Replaces the method `name` with a copy bound to this object, so it survives being detached.
  pub fn rebind_method(&self, ec: &ExecutionContext, name: &str) -> Result<(), Error> {
    let bound = self.bind_method(ec, name)?;
    self.set(ec, name, &bound)
  }

  /// Rebinds every method found on this object's prototype.
  pub fn rebind_all(&self, ec: &ExecutionContext) -> Result<(), Error> {
    let prototype = self.get_prototype(ec)?;
    if !prototype.is_kind(Kind::OBJECT) {
      return Ok(());
    }
    let descriptors = prototype.get_own_property_descriptors(ec)?;
    for name in descriptors.keys(ec)? {
      if name == "constructor" {
        continue;
      }
      let descriptor = descriptors.get(ec, &name)?;
      if descriptor.get(ec, "value")?.is_kind(Kind::FUNCTION) {
        self.rebind_method(ec, &name)?;
      }
    }
    Ok(())
  }

  /// `Object.keys(this)`.
  pub fn keys(&self, ec: &ExecutionContext) -> Result<Vec<String>, Error> {
    self.require_kind(Kind::OBJECT)?;
    self.context().sync(ec, |scope, ctx| {
      let this = self.open(scope);
      let keys = ctx.call_builtin(scope, Builtin::Keys, &[this])?;
      let keys = v8::Local::<v8::Array>::try_from(keys).map_err(|e| Error::msg(e.to_string()))?;
      let mut out = Vec::with_capacity(keys.length() as usize);
      for i in 0..keys.length() {
        let key = ctx.catch(scope, |scope| keys.get_index(scope, i))?;
        out.push(key.to_rust_string_lossy(scope));
      }
      Ok(out)
    })
  }

  pub fn instance_of(&self, ec: &ExecutionContext, constructor: &Value) -> Result<bool, Error> {
    constructor.require_kind(Kind::FUNCTION)?;
    constructor.check_isolate(self.isolate())?;
    if !self.is_kind(Kind::OBJECT) {
      return Ok(false);
    }
    self.context().sync(ec, |scope, ctx| {
      let object = self.object(scope)?;
      let constructor = constructor.object(scope)?;
      ctx.catch(scope, |scope| object.instance_of(scope, constructor))
    })
  }

  /// `Object.getOwnPropertyDescriptors(this)`.
  pub fn get_own_property_descriptors(&self, ec: &ExecutionContext) -> Result<Value, Error> {
    self.require_kind(Kind::OBJECT)?;
    self.context().sync(ec, |scope, ctx| {
      let this = self.open(scope);
      let descriptors = ctx.call_builtin(scope, Builtin::GetOwnPropertyDescriptors, &[this])?;
      Ok(ctx.value(scope, descriptors))
    })
  }

  pub fn get_prototype(&self, ec: &ExecutionContext) -> Result<Value, Error> {
    self.require_kind(Kind::OBJECT)?;
    self.context().sync(ec, |scope, ctx| {
      let this = self.open(scope);
      let prototype = ctx.call_builtin(scope, Builtin::GetPrototypeOf, &[this])?;
      Ok(ctx.value(scope, prototype))
    })
  }

  /// Copies out the contents of an `ArrayBuffer` or a view onto one.
  pub fn bytes(&self, ec: &ExecutionContext) -> Result<Vec<u8>, Error> {
    self.require_kind(Kind::BUFFER)?;
    self.context().sync(ec, |scope, _| {
      let local = self.open(scope);
      if let Ok(buffer) = v8::Local::<v8::ArrayBuffer>::try_from(local) {
        let store = buffer.get_backing_store();
        return Ok(store.iter().map(|b| b.get()).collect());
      }
      if let Ok(view) = v8::Local::<v8::ArrayBufferView>::try_from(local) {
        let mut out = vec![0; view.byte_length()];
        view.copy_contents(&mut out);
        return Ok(out);
      }
      Err(self.kind_error(Kind::BUFFER))
    })
  }

  /// Overwrites the start of an `ArrayBuffer` with `bytes`.
  pub fn set_bytes(&self, ec: &ExecutionContext, bytes: &[u8]) -> Result<(), Error> {
    self.require_kind(Kind::ARRAY_BUFFER)?;
    self.context().sync(ec, |scope, _| {
      let buffer = v8::Local::<v8::ArrayBuffer>::try_from(self.open(scope)).map_err(|_| self.kind_error(Kind::ARRAY_BUFFER))?;
      let store = buffer.get_backing_store();
      if bytes.len() > store.byte_length() {
        return Err(Error::msg(format!(
          "{} bytes do not fit in a buffer of {}",
          bytes.len(),
          store.byte_length()
        )));
      }
      for (cell, byte) in store.iter().zip(bytes) {
        cell.set(*byte);
      }
      Ok(())
    })
  }

  pub fn byte_length(&self, ec: &ExecutionContext) -> Result<usize, Error> {
    self.require_kind(Kind::BUFFER)?;
    self.context().sync(ec, |scope, _| {
      let local = self.open(scope);
      if let Ok(buffer) = v8::Local::<v8::ArrayBuffer>::try_from(local) {
        return Ok(buffer.byte_length());
      }
      if let Ok(view) = v8::Local::<v8::ArrayBufferView>::try_from(local) {
        return Ok(view.byte_length());
      }
      Err(self.kind_error(Kind::BUFFER))
    })
  }

  pub fn int64(&self, ec: &ExecutionContext) -> Result<i64, Error> {
    self.context().sync(ec, |scope, ctx| {
      let local = self.open(scope);
      if let Ok(bigint) = v8::Local::<v8::BigInt>::try_from(local) {
        return Ok(bigint.i64_value().0);
      }
      ctx.catch(scope, |scope| local.integer_value(scope))
    })
  }

  pub fn float64(&self, ec: &ExecutionContext) -> Result<f64, Error> {
    self.context().sync(ec, |scope, ctx| {
      let local = self.open(scope);
      ctx.catch(scope, |scope| local.number_value(scope))
    })
  }

  /// The value's truthiness.
  pub fn bool(&self, ec: &ExecutionContext) -> Result<bool, Error> {
    self.context().sync(ec, |scope, _| {
      let local = self.open(scope);
      Ok(local.boolean_value(scope))
    })
  }

  pub fn date(&self, ec: &ExecutionContext) -> Result<SystemTime, Error> {
    self.require_kind(Kind::DATE)?;
    let millis = self.context().sync(ec, |scope, _| {
      let date = v8::Local::<v8::Date>::try_from(self.open(scope)).map_err(|_| self.kind_error(Kind::DATE))?;
      Ok(date.value_of())
    })?;
    millis_to_time(millis)
  }

  /// The value's string form, as `String(value)` would produce.
  pub fn string_value(&self, ec: &ExecutionContext) -> Result<String, Error> {
    self.context().sync(ec, |scope, ctx| {
      let local = self.open(scope);
      if local.is_string() {
        return Ok(local.to_rust_string_lossy(scope));
      }
      let string = ctx.catch(scope, |scope| local.to_string(scope))?;
      Ok(string.to_rust_string_lossy(scope))
    })
  }

  /// Abstract (`==`) equality. Values of different isolates are never equal.
  pub fn equals(&self, ec: &ExecutionContext, other: &Value) -> Result<bool, Error> {
    if other.check_isolate(self.isolate()).is_err() {
      return Ok(false);
    }
    self.context().sync(ec, |scope, ctx| {
      let a = self.open(scope);
      let b = other.open(scope);
      ctx.catch(scope, |scope| a.equals(scope, b))
    })
  }

  /// Strict (`===`) equality. Values of different isolates are never equal.
  pub fn strict_equals(&self, ec: &ExecutionContext, other: &Value) -> Result<bool, Error> {
    if Value::ptr_eq(self, other) {
      return Ok(true);
    }
    if other.check_isolate(self.isolate()).is_err() {
      return Ok(false);
    }
    self.context().sync(ec, |scope, _| {
      let a = self.open(scope);
      let b = other.open(scope);
      Ok(a.strict_equals(b))
    })
  }

  pub fn promise_info(&self, ec: &ExecutionContext) -> Result<PromiseInfo, Error> {
    self.require_kind(Kind::PROMISE)?;
    self.context().sync(ec, |scope, ctx| {
      let promise = v8::Local::<v8::Promise>::try_from(self.open(scope)).map_err(|_| self.kind_error(Kind::PROMISE))?;
      let state = match promise.state() {
        v8::PromiseState::Pending => PromiseState::Pending,
        v8::PromiseState::Fulfilled => PromiseState::Fulfilled,
        v8::PromiseState::Rejected => PromiseState::Rejected,
      };
      let result = match state {
        PromiseState::Pending => None,
        _ => {
          let result = promise.result(scope);
          Some(ctx.value(scope, result))
        }
      };
      Ok(PromiseInfo { state, result })
    })
  }

  /// Blocks until this promise settles and returns its value, or the rejection as an error.
  ///
  /// Settled promises are read directly. For a pending one the settle callbacks are attached by
  /// calling `then` inline on the caller's thread, not from a background task, and the caller
  /// then blocks until one of them runs. On the isolate's own thread that wait could never end,
  /// so awaiting a pending promise there fails at once instead.
  pub fn await_promise(&self, ec: &ExecutionContext) -> Result<Value, Error> {
    let info = self.promise_info(ec)?;
    match info.state {
      PromiseState::Fulfilled => return info.result.ok_or(Error::Terminated),
      PromiseState::Rejected => {
        return match info.result {
          Some(reason) => Err(reason.to_error(ec)?),
          None => Err(Error::Terminated),
        }
      }
      PromiseState::Pending => {}
    }
    if scope::is_isolate_thread(self.isolate().id()) {
      return Err(Error::msg("cannot await a pending promise on its own isolate thread"));
    }

    let (tx, rx) = mpsc::sync_channel::<Result<Value, Value>>(1);
    let tx = Arc::new(Mutex::new(Some(tx)));
    let settle = |fulfilled: bool| -> HostFunction {
      let tx = tx.clone();
      Arc::new(move |args: &FunctionArgs| {
        let result = match args.args.first() {
          Some(value) => value.clone(),
          None => args.context.undefined(&args.ec)?,
        };
        if let Some(tx) = tx.lock().take() {
          let _ = tx.send(if fulfilled { Ok(result) } else { Err(result) });
        }
        args.context.undefined(&args.ec)
      })
    };
    let context = self.context();
    let (on_fulfilled, fulfilled_id) = context.function(ec, None, settle(true))?;
    let (on_rejected, rejected_id) = context.function(ec, None, settle(false))?;
    drop(tx);

    let then = self.get(ec, "then").and_then(|then| then.call_value(ec, Some(self), &[on_fulfilled, on_rejected]));
    let outcome = match then {
      Ok(_) => rx.recv().map_err(|_| Error::Terminated),
      Err(err) => Err(err),
    };
    context.release_function(fulfilled_id);
    context.release_function(rejected_id);
    match outcome? {
      Ok(value) => Ok(value),
      Err(reason) => Err(reason.to_error(ec)?),
    }
  }

  /// `JSON.stringify(this)`. Values with no JSON form (undefined, functions, symbols) render as
  /// `null`.
  pub fn marshal_json(&self, ec: &ExecutionContext) -> Result<Vec<u8>, Error> {
    if self.is_kind(Kind::UNDEFINED | Kind::FUNCTION | Kind::SYMBOL) {
      return Ok(b"null".to_vec());
    }
    self.context().sync(ec, |scope, ctx| {
      let local = self.open(scope);
      let json = ctx.catch(scope, |scope| v8::json::stringify(scope, local))?;
      Ok(json.to_rust_string_lossy(scope).into_bytes())
    })
  }

  /// Converts a thrown or rejected value into an [`Error`], preferring its `stack`.
  pub fn to_error(&self, ec: &ExecutionContext) -> Result<Error, Error> {
    let message = self.context().sync(ec, |scope, _| {
      let local = self.open(scope);
      Ok(error_message(scope, local))
    })?;
    Ok(Error::Js(JsError::new(message, Some(self.clone()))))
  }

  /// Binds `host` as the receiver of this object, or removes the binding with `None`.
  pub fn set_receiver(&self, ec: &ExecutionContext, host: Option<Arc<dyn Any + Send + Sync>>) -> Result<(), Error> {
    match host {
      Some(host) => self.context().bind_receiver(ec, self, host),
      None => self.context().unbind_receiver(ec, self),
    }
  }

  pub fn receiver(&self, ec: &ExecutionContext) -> Result<Option<Arc<dyn Any + Send + Sync>>, Error> {
    self.context().receiver(ec, self)
  }

  pub fn unmarshal<T: FromJs>(&self, ec: &ExecutionContext) -> Result<T, Error> {
    T::from_js(ec, self)
  }
}

pub(crate) fn marshal_args(ec: &ExecutionContext, context: &Context, args: &[&dyn ToJs]) -> Result<Vec<Value>, Error> {
  args.iter().map(|a| a.to_js(ec, context)).collect()
}

pub(crate) fn millis_to_time(millis: f64) -> Result<SystemTime, Error> {
  if !millis.is_finite() {
    return Err(Error::unmarshal::<SystemTime>("invalid date"));
  }
  let whole = millis.abs().trunc();
  if whole > u64::MAX as f64 {
    return Err(Error::unmarshal::<SystemTime>("date out of range"));
  }
  let nanos = ((millis.abs() - whole) * 1e6).round() as u64;
  let offset = Duration::from_millis(whole as u64) + Duration::from_nanos(nanos);
  let time = if millis >= 0.0 {
    UNIX_EPOCH.checked_add(offset)
  } else {
    UNIX_EPOCH.checked_sub(offset)
  };
  time.ok_or_else(|| Error::unmarshal::<SystemTime>("date out of range"))
}

pub(crate) fn duration_millis(duration: Duration) -> f64 {
  duration.as_millis() as f64 + f64::from(duration.subsec_nanos() % 1_000_000) / 1e6
}

pub(crate) fn time_to_millis(time: SystemTime) -> f64 {
  match time.duration_since(UNIX_EPOCH) {
    Ok(after) => duration_millis(after),
    Err(before) => -duration_millis(before.duration()),
  }
}

impl fmt::Debug for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Value")
      .field("kind", &self.inner.kind)
      .field("context", &self.inner.context.id())
      .finish()
  }
}

/// A script value kept in host state owned by its own context, such as a class receiver or a
/// registered function's closure.
///
/// Unlike [`Value`] it does not keep the context alive, so the context is still freed when its
/// last host handle drops. [`load`](StoredValue::load) fails with [`Error::ContextReleased`] after
/// that.
#[derive(Clone)]
pub struct StoredValue {
  inner: Arc<StoredValueInner>,
}

struct StoredValueInner {
  context: Weak<ContextInner>,
  handle: Persistent<v8::Value>,
}

impl Value {
  pub fn store(&self, ec: &ExecutionContext) -> Result<StoredValue, Error> {
    self.context().sync(ec, |scope, ctx| {
      let local = self.open(scope);
      Ok(StoredValue {
        inner: Arc::new(StoredValueInner {
          context: ctx.downgrade(),
          handle: Persistent::new(ctx.isolate().inner(), scope, local),
        }),
      })
    })
  }
}

impl StoredValue {
  pub fn load(&self, ec: &ExecutionContext) -> Result<Value, Error> {
    let context = self
      .inner
      .context
      .upgrade()
      .map(Context::from_inner)
      .ok_or(Error::ContextReleased)?;
    context.sync(ec, |scope, ctx| {
      let local = self.inner.handle.open(scope);
      Ok(ctx.value(scope, local))
    })
  }
}

impl ToJs for StoredValue {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    self.load(ec)?.to_js(ec, context)
  }
}
