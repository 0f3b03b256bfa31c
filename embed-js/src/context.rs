use ahash::AHashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::any::Any;
use std::any::TypeId;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use crate::callback;
use crate::callback::Accessor;
use crate::callback::FunctionArgs;
use crate::callback::HostFunction;
use crate::error::JsError;
use crate::execution_context::DataMap;
use crate::handle::Persistent;
use crate::handle::WeakHandle;
use crate::marshal::class;
use crate::marshal::Class;
use crate::marshal::FromJs;
use crate::marshal::ToJs;
use crate::refs::CallbackId;
use crate::refs::RefId;
use crate::refs::RefTable;
use crate::template::FunctionTemplate;
use crate::tracer;
use crate::value::ValueInner;
use crate::Error;
use crate::ExecutionContext;
use crate::Isolate;
use crate::Kind;
use crate::Resolver;
use crate::Value;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

const UNDEFINED: usize = 0;
const NULL: usize = 1;
const TRUE: usize = 2;
const FALSE: usize = 3;
const GLOBAL: usize = 4;

pub(crate) const CONSOLE_METHODS: &[&str] = &[
  "assert",
  "clear",
  "count",
  "countReset",
  "debug",
  "dir",
  "dirxml",
  "error",
  "group",
  "groupCollapsed",
  "groupEnd",
  "info",
  "log",
  "table",
  "time",
  "timeEnd",
  "timeLog",
  "trace",
  "warn",
  "profile",
  "profileEnd",
  "timeStamp",
];

/// Built-ins looked up once per context.
struct Builtins {
  object_prototype: Persistent<v8::Object>,
  object_create: Persistent<v8::Function>,
  object_assign: Persistent<v8::Function>,
  object_keys: Persistent<v8::Function>,
  object_get_own_property_descriptors: Persistent<v8::Function>,
  object_get_prototype_of: Persistent<v8::Function>,
  object_define_property: Persistent<v8::Function>,
  error: Persistent<v8::Function>,
}

pub(crate) enum Builtin {
  Create,
  Assign,
  Keys,
  GetOwnPropertyDescriptors,
  GetPrototypeOf,
  DefineProperty,
}

/// A host object reflected into script as the `this` of a class instance.
///
/// The host side is held strongly and the script object weakly: the binding lives as long as a
/// host wrapper or script still references the object, and is dropped once the engine collects it.
struct Receiver {
  host: Arc<dyn Any + Send + Sync>,
  object: WeakHandle<v8::Object>,
  wrapper: Weak<ValueInner>,
}

#[derive(Default)]
struct Receivers {
  next: i32,
  by_id: AHashMap<i32, Receiver>,
  by_host: AHashMap<usize, i32>,
}

impl Receivers {
  fn remove(&mut self, id: i32) -> Option<Receiver> {
    let receiver = self.by_id.remove(&id)?;
    let key = host_key(&receiver.host);
    if self.by_host.get(&key) == Some(&id) {
      self.by_host.remove(&key);
    }
    Some(receiver)
  }
}

fn host_key(host: &Arc<dyn Any + Send + Sync>) -> usize {
  Arc::as_ptr(host) as *const () as usize
}

/// A script global environment inside an isolate. Cheap to clone.
#[derive(Clone)]
pub struct Context {
  inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
  id: RefId,
  isolate: Isolate,
  handle: RwLock<Option<Persistent<v8::Context>>>,
  released: AtomicBool,
  singletons: Mutex<[Weak<ValueInner>; 5]>,
  builtins: RwLock<Option<Arc<Builtins>>>,
  functions: RefTable<HostFunction>,
  accessors: RefTable<Arc<Accessor>>,
  refs: RefTable<Arc<dyn Any + Send + Sync>>,
  receivers: Mutex<Receivers>,
  /// Receiver ids whose script objects were collected, filled by engine finalizers.
  collected: Arc<Mutex<Vec<i32>>>,
  prototypes: Mutex<AHashMap<TypeId, FunctionTemplate>>,
  constructors: Mutex<AHashMap<TypeId, FunctionTemplate>>,
  resources: Mutex<AHashMap<String, RefId>>,
  data: DataMap,
  outstanding: AtomicUsize,
}

impl Drop for ContextInner {
  fn drop(&mut self) {
    if !self.released.swap(true, Ordering::AcqRel) {
      tracer::context_released(self.id);
    }
    self.isolate.forget_context(self.id);
    tracing::debug!(isolate = %self.isolate.id(), context = %self.id, "context dropped");
  }
}

pub(crate) fn string<'s>(
  scope: &mut v8::HandleScope<'s, ()>,
  value: &str,
) -> Result<v8::Local<'s, v8::String>, Error> {
  v8::String::new(scope, value).ok_or_else(|| Error::marshal::<str>("string exceeds the engine's maximum length"))
}

/// The `stack` of a thrown object when it has one, otherwise its string form.
pub(crate) fn error_message<'s>(scope: &mut v8::HandleScope<'s>, exception: v8::Local<'s, v8::Value>) -> String {
  if let Ok(object) = v8::Local::<v8::Object>::try_from(exception) {
    if let Some(key) = v8::String::new(scope, "stack") {
      if let Some(stack) = object.get(scope, key.into()) {
        if stack.is_string() {
          let stack = stack.to_rust_string_lossy(scope);
          if !stack.is_empty() {
            return stack;
          }
        }
      }
    }
  }
  exception.to_rust_string_lossy(scope)
}

impl Context {
  pub(crate) fn new(isolate: &Isolate, ec: &ExecutionContext) -> Result<Context, Error> {
    let id = RefId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
    let handle = isolate.sync(ec, |scope| {
      let context = v8::Context::new(scope, Default::default());
      Ok(Persistent::new(isolate.inner(), scope, context))
    })?;
    let inner = Arc::new(ContextInner {
      id,
      isolate: isolate.clone(),
      handle: RwLock::new(Some(handle)),
      released: AtomicBool::new(false),
      singletons: Mutex::new(Default::default()),
      builtins: RwLock::new(None),
      functions: RefTable::new(),
      accessors: RefTable::new(),
      refs: RefTable::new(),
      receivers: Mutex::new(Receivers::default()),
      collected: Arc::new(Mutex::new(Vec::new())),
      prototypes: Mutex::new(AHashMap::new()),
      constructors: Mutex::new(AHashMap::new()),
      resources: Mutex::new(AHashMap::new()),
      data: DataMap::default(),
      outstanding: AtomicUsize::new(0),
    });
    isolate.register_context(id, &inner);
    tracer::retain(tracer::Resource::Context, id.0);
    let context = Context { inner };
    if ec.try_context().is_none() {
      ec.set_context(Some(&context));
    }
    context.install_console(ec)?;
    tracing::debug!(isolate = %isolate.id(), context = %id, "context created");
    Ok(context)
  }

  pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Context {
    Context { inner }
  }

  pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
    Arc::downgrade(&self.inner)
  }

  pub fn id(&self) -> RefId {
    self.inner.id
  }

  pub fn isolate(&self) -> &Isolate {
    &self.inner.isolate
  }

  pub fn ptr_eq(a: &Context, b: &Context) -> bool {
    Arc::ptr_eq(&a.inner, &b.inner)
  }

  pub fn is_released(&self) -> bool {
    self.inner.released.load(Ordering::Acquire)
  }

  /// Host wrappers currently alive for values of this context.
  pub fn outstanding_values(&self) -> usize {
    self.inner.outstanding.load(Ordering::Acquire)
  }

  pub(crate) fn value_created(&self) {
    self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
  }

  pub(crate) fn value_dropped(&self) {
    self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
  }

  fn check_released(&self) -> Result<(), Error> {
    self.inner.isolate.inner().check_running()?;
    if self.is_released() {
      Err(Error::ContextReleased)
    } else {
      Ok(())
    }
  }

  pub(crate) fn local<'s>(&self, scope: &mut v8::HandleScope<'s, ()>) -> Result<v8::Local<'s, v8::Context>, Error> {
    match self.inner.handle.read().as_ref() {
      Some(handle) => Ok(handle.open(scope)),
      None => Err(Error::ContextReleased),
    }
  }

  /// Runs `f` on the isolate with this context entered.
  pub fn sync<'a, T, F>(&self, ec: &ExecutionContext, f: F) -> Result<T, Error>
  where
    T: Send + 'a,
    F: for<'s> FnOnce(&mut v8::HandleScope<'s>, &Context) -> Result<T, Error> + Send + 'a,
  {
    self.check_released()?;
    let this = self;
    self.inner.isolate.sync(ec, move |scope| {
      let context = this.local(scope)?;
      let scope = &mut v8::ContextScope::new(scope, context);
      f(scope, this)
    })
  }

  /// Runs `f` under a `TryCatch`; a `None` result becomes the caught exception.
  pub(crate) fn catch<'s, T>(
    &self,
    scope: &mut v8::HandleScope<'s>,
    f: impl FnOnce(&mut v8::HandleScope<'s>) -> Option<T>,
  ) -> Result<T, Error> {
    let tc = &mut v8::TryCatch::new(scope);
    match f(tc) {
      Some(result) => Ok(result),
      None => Err(self.exception(tc)),
    }
  }

  fn exception<'s>(&self, tc: &mut v8::TryCatch<v8::HandleScope<'s>>) -> Error {
    if tc.has_terminated() {
      return Error::Terminated;
    }
    match tc.exception() {
      Some(exception) => {
        let message = error_message(tc, exception);
        let value = self.value(tc, exception);
        Error::Js(JsError::new(message, Some(value)))
      }
      None => Error::msg("script execution failed"),
    }
  }

  /// Wraps an engine handle, reusing the host wrapper for singletons and receiver-bound objects.
  pub(crate) fn value<'s>(&self, scope: &mut v8::HandleScope<'s>, local: v8::Local<'s, v8::Value>) -> Value {
    if local.is_undefined() {
      return self.singleton(scope, UNDEFINED, local);
    }
    if local.is_null() {
      return self.singleton(scope, NULL, local);
    }
    if local.is_true() {
      return self.singleton(scope, TRUE, local);
    }
    if local.is_false() {
      return self.singleton(scope, FALSE, local);
    }
    if let Ok(object) = v8::Local::<v8::Object>::try_from(local) {
      if let Some(id) = receiver_id(scope, object) {
        let mut receivers = self.inner.receivers.lock();
        if let Some(receiver) = receivers.by_id.get_mut(&id) {
          if let Some(inner) = receiver.wrapper.upgrade() {
            return Value::from_inner(inner);
          }
          let value = Value::from_local(self, scope, local);
          receiver.wrapper = value.downgrade();
          return value;
        }
      }
    }
    Value::from_local(self, scope, local)
  }

  fn singleton<'s>(&self, scope: &mut v8::HandleScope<'s>, slot: usize, local: v8::Local<'s, v8::Value>) -> Value {
    let mut singletons = self.inner.singletons.lock();
    if let Some(inner) = singletons[slot].upgrade() {
      return Value::from_inner(inner);
    }
    let value = Value::from_local(self, scope, local);
    singletons[slot] = value.downgrade();
    value
  }

  fn cached_singleton(&self, slot: usize) -> Option<Value> {
    self.inner.singletons.lock()[slot].upgrade().map(Value::from_inner)
  }

  pub fn undefined(&self, ec: &ExecutionContext) -> Result<Value, Error> {
    if let Some(value) = self.cached_singleton(UNDEFINED) {
      return Ok(value);
    }
    self.sync(ec, |scope, ctx| {
      let local = v8::undefined(scope).into();
      Ok(ctx.value(scope, local))
    })
  }

  pub fn null(&self, ec: &ExecutionContext) -> Result<Value, Error> {
    if let Some(value) = self.cached_singleton(NULL) {
      return Ok(value);
    }
    self.sync(ec, |scope, ctx| {
      let local = v8::null(scope).into();
      Ok(ctx.value(scope, local))
    })
  }

  pub fn boolean(&self, ec: &ExecutionContext, value: bool) -> Result<Value, Error> {
    let slot = if value { TRUE } else { FALSE };
    if let Some(value) = self.cached_singleton(slot) {
      return Ok(value);
    }
    self.sync(ec, |scope, ctx| {
      let local = v8::Boolean::new(scope, value).into();
      Ok(ctx.value(scope, local))
    })
  }

  pub fn true_value(&self, ec: &ExecutionContext) -> Result<Value, Error> {
    self.boolean(ec, true)
  }

  pub fn false_value(&self, ec: &ExecutionContext) -> Result<Value, Error> {
    self.boolean(ec, false)
  }

  pub fn global(&self, ec: &ExecutionContext) -> Result<Value, Error> {
    if let Some(value) = self.cached_singleton(GLOBAL) {
      return Ok(value);
    }
    self.sync(ec, |scope, ctx| {
      let context = ctx.local(scope)?;
      let local = context.global(scope).into();
      Ok(ctx.singleton(scope, GLOBAL, local))
    })
  }

  fn builtins(&self, scope: &mut v8::HandleScope<'_>) -> Result<Arc<Builtins>, Error> {
    if let Some(builtins) = self.inner.builtins.read().as_ref() {
      return Ok(builtins.clone());
    }
    let context = self.local(scope)?;
    let global = context.global(scope);
    let object = get_object(scope, global, "Object")?;
    let prototype = get_object(scope, object, "prototype")?;
    let error = get_function(scope, global, "Error")?;
    let isolate = self.inner.isolate.inner();
    let mut function = |name: &str| -> Result<Persistent<v8::Function>, Error> {
      let f = get_function(scope, object, name)?;
      Ok(Persistent::new(isolate, scope, f))
    };
    let builtins = Builtins {
      object_create: function("create")?,
      object_assign: function("assign")?,
      object_keys: function("keys")?,
      object_get_own_property_descriptors: function("getOwnPropertyDescriptors")?,
      object_get_prototype_of: function("getPrototypeOf")?,
      object_define_property: function("defineProperty")?,
      object_prototype: Persistent::new(isolate, scope, prototype),
      error: Persistent::new(isolate, scope, error),
    };
    let builtins = Arc::new(builtins);
    *self.inner.builtins.write() = Some(builtins.clone());
    Ok(builtins)
  }

  /// Calls one of the cached `Object.*` built-ins.
  pub(crate) fn call_builtin<'s>(
    &self,
    scope: &mut v8::HandleScope<'s>,
    builtin: Builtin,
    args: &[v8::Local<'s, v8::Value>],
  ) -> Result<v8::Local<'s, v8::Value>, Error> {
    let builtins = self.builtins(scope)?;
    let function = match builtin {
      Builtin::Create => &builtins.object_create,
      Builtin::Assign => &builtins.object_assign,
      Builtin::Keys => &builtins.object_keys,
      Builtin::GetOwnPropertyDescriptors => &builtins.object_get_own_property_descriptors,
      Builtin::GetPrototypeOf => &builtins.object_get_prototype_of,
      Builtin::DefineProperty => &builtins.object_define_property,
    };
    let function = function.open(scope);
    let recv = v8::undefined(scope).into();
    self.catch(scope, |scope| function.call(scope, recv, args))
  }

  pub(crate) fn object_prototype<'s>(&self, scope: &mut v8::HandleScope<'s>) -> Result<v8::Local<'s, v8::Object>, Error> {
    Ok(self.builtins(scope)?.object_prototype.open(scope))
  }

  pub fn error_constructor(&self, ec: &ExecutionContext) -> Result<Value, Error> {
    self.sync(ec, |scope, ctx| {
      let error = ctx.builtins(scope)?.error.open(scope);
      Ok(ctx.value(scope, error.into()))
    })
  }

  /// A new script `Error` whose message is `message`.
  pub fn new_error(&self, ec: &ExecutionContext, message: &str) -> Result<Value, Error> {
    self.sync(ec, |scope, ctx| {
      let message = string(scope, message)?;
      let error = v8::Exception::error(scope, message);
      Ok(ctx.value(scope, error))
    })
  }

  pub fn new_object(&self, ec: &ExecutionContext) -> Result<Value, Error> {
    self.sync(ec, |scope, ctx| {
      let object = v8::Object::new(scope);
      Ok(ctx.value(scope, object.into()))
    })
  }

  /// A new object with the given properties, set in order.
  pub fn new_object_with(&self, ec: &ExecutionContext, entries: &[(String, Value)]) -> Result<Value, Error> {
    for (_, value) in entries {
      value.check_isolate(self.isolate())?;
    }
    self.sync(ec, |scope, ctx| {
      let object = v8::Object::new(scope);
      for (key, value) in entries {
        let key = string(scope, key)?;
        let value = value.open(scope);
        ctx.catch(scope, |scope| object.set(scope, key.into(), value))?;
      }
      Ok(ctx.value(scope, object.into()))
    })
  }

  pub fn new_array(&self, ec: &ExecutionContext, elements: &[Value]) -> Result<Value, Error> {
    for element in elements {
      element.check_isolate(self.isolate())?;
    }
    self.sync(ec, |scope, ctx| {
      let elements: Vec<_> = elements.iter().map(|e| e.open(scope)).collect();
      let array = v8::Array::new_with_elements(scope, &elements);
      Ok(ctx.value(scope, array.into()))
    })
  }

  /// `Object.create(prototype)`.
  pub fn object_create(&self, ec: &ExecutionContext, prototype: &Value) -> Result<Value, Error> {
    prototype.check_isolate(self.isolate())?;
    self.sync(ec, |scope, ctx| {
      let prototype = prototype.open(scope);
      let object = ctx.call_builtin(scope, Builtin::Create, &[prototype])?;
      Ok(ctx.value(scope, object))
    })
  }

  /// `Object.assign(target, ...sources)`.
  pub fn assign(&self, ec: &ExecutionContext, target: &Value, sources: &[Value]) -> Result<Value, Error> {
    target.check_isolate(self.isolate())?;
    for source in sources {
      source.check_isolate(self.isolate())?;
    }
    self.sync(ec, |scope, ctx| {
      let mut args = vec![target.open(scope)];
      args.extend(sources.iter().map(|s| s.open(scope)));
      let result = ctx.call_builtin(scope, Builtin::Assign, &args)?;
      Ok(ctx.value(scope, result))
    })
  }

  /// Copies every own property descriptor of each source and of its prototypes (stopping at
  /// `Object.prototype`) onto `target`, skipping `constructor`. Derived definitions win over the
  /// ones they shadow.
  pub fn assign_all(&self, ec: &ExecutionContext, target: &Value, sources: &[Value]) -> Result<Value, Error> {
    target.check_isolate(self.isolate())?;
    for source in sources {
      source.check_isolate(self.isolate())?;
    }
    self.sync(ec, |scope, ctx| {
      let target = target.open(scope);
      let object_prototype: v8::Local<v8::Value> = ctx.object_prototype(scope)?.into();
      let constructor = string(scope, "constructor")?;
      for source in sources {
        let mut levels = Vec::new();
        let mut current = source.open(scope);
        while current.is_object() && !current.strict_equals(object_prototype) {
          levels.push(current);
          current = ctx.call_builtin(scope, Builtin::GetPrototypeOf, &[current])?;
        }
        for level in levels.into_iter().rev() {
          let descriptors = ctx.call_builtin(scope, Builtin::GetOwnPropertyDescriptors, &[level])?;
          let keys = ctx.call_builtin(scope, Builtin::Keys, &[descriptors])?;
          let keys = v8::Local::<v8::Array>::try_from(keys).map_err(|e| Error::msg(e.to_string()))?;
          let descriptors = v8::Local::<v8::Object>::try_from(descriptors).map_err(|e| Error::msg(e.to_string()))?;
          for i in 0..keys.length() {
            let key = ctx.catch(scope, |scope| keys.get_index(scope, i))?;
            if key.strict_equals(constructor.into()) {
              continue;
            }
            let descriptor = ctx.catch(scope, |scope| descriptors.get(scope, key))?;
            ctx.call_builtin(scope, Builtin::DefineProperty, &[target, key, descriptor])?;
          }
        }
      }
      Ok(ctx.value(scope, target))
    })
  }

  pub fn parse_json(&self, ec: &ExecutionContext, text: &str) -> Result<Value, Error> {
    self.sync(ec, |scope, ctx| {
      let text = string(scope, text)?;
      let value = ctx.catch(scope, |scope| v8::json::parse(scope, text))?;
      Ok(ctx.value(scope, value))
    })
  }

  /// Converts a host value into a script value.
  pub fn create(&self, ec: &ExecutionContext, value: &dyn ToJs) -> Result<Value, Error> {
    value.to_js(ec, self)
  }

  /// Like [`create`](Self::create), naming the result when it is a function.
  pub fn create_with_name(&self, ec: &ExecutionContext, name: &str, value: &dyn ToJs) -> Result<Value, Error> {
    let value = value.to_js(ec, self)?;
    if value.is_kind(Kind::FUNCTION) {
      self.sync(ec, |scope, _| {
        let function = v8::Local::<v8::Function>::try_from(value.open(scope)).map_err(|e| Error::msg(e.to_string()))?;
        function.set_name(string(scope, name)?);
        Ok(())
      })?;
    }
    Ok(value)
  }

  /// Converts a dynamically typed host value using the marshaller registry.
  pub fn create_dyn(&self, ec: &ExecutionContext, value: &(dyn Any + Send + Sync)) -> Result<Value, Error> {
    crate::marshal::create_dyn(ec, self, value)
  }

  /// Exposes `f` as a script function.
  pub fn create_function(
    &self,
    ec: &ExecutionContext,
    name: Option<&str>,
    f: impl Fn(&FunctionArgs) -> Result<Value, Error> + Send + Sync + 'static,
  ) -> Result<Value, Error> {
    let f: HostFunction = Arc::new(f);
    Ok(self.function(ec, name, f)?.0)
  }

  pub(crate) fn function(&self, ec: &ExecutionContext, name: Option<&str>, f: HostFunction) -> Result<(Value, RefId), Error> {
    let id = self.register_function(f);
    let callback = self.callback_id(id, Some(ec));
    let value = self.sync(ec, |scope, ctx| {
      let data = string(scope, &callback.to_string())?;
      let function = v8::Function::builder(callback::function_callback)
        .data(data.into())
        .build(scope)
        .ok_or_else(|| Error::msg("failed to create function"))?;
      if let Some(name) = name {
        function.set_name(string(scope, name)?);
      }
      Ok(ctx.value(scope, function.into()))
    });
    if value.is_err() {
      self.inner.functions.release_id(id);
    }
    Ok((value?, id))
  }

  /// Exposes `T` as a script class whose constructor runs `f`.
  pub fn create_constructor<T: Class>(
    &self,
    ec: &ExecutionContext,
    f: impl Fn(&FunctionArgs) -> Result<T, Error> + Send + Sync + 'static,
  ) -> Result<Value, Error> {
    let template = class::constructor::<T>(ec, self, Arc::new(f))?;
    template.function(ec)
  }

  /// The script class synthesized for `T`, without a host constructor.
  pub fn class<T: Class>(&self, ec: &ExecutionContext) -> Result<Value, Error> {
    class::prototype::<T>(ec, self)?.function(ec)
  }

  pub(crate) fn cached_prototype(&self, type_id: TypeId) -> Option<FunctionTemplate> {
    self.inner.prototypes.lock().get(&type_id).cloned()
  }

  pub(crate) fn cache_prototype(&self, type_id: TypeId, template: FunctionTemplate) -> FunctionTemplate {
    self.inner.prototypes.lock().entry(type_id).or_insert(template).clone()
  }

  pub(crate) fn cached_constructor(&self, type_id: TypeId) -> Option<FunctionTemplate> {
    self.inner.constructors.lock().get(&type_id).cloned()
  }

  /// Records the latest host constructor of a type; host-created instances use it afterwards.
  pub(crate) fn cache_constructor(&self, type_id: TypeId, template: FunctionTemplate) -> FunctionTemplate {
    self.inner.constructors.lock().insert(type_id, template.clone());
    template
  }

  /// `new constructor(...args)`, converted to `T`.
  pub fn new_instance<T: FromJs>(&self, ec: &ExecutionContext, constructor: &Value, args: &[&dyn ToJs]) -> Result<T, Error> {
    let instance = constructor.new(ec, args)?;
    T::from_js(ec, &instance)
  }

  pub fn new_resolver(&self, ec: &ExecutionContext) -> Result<Resolver, Error> {
    Resolver::new(ec, self)
  }

  /// Queues `f` on the engine's microtask queue.
  pub fn add_microtask(&self, ec: &ExecutionContext, f: impl FnOnce(&FunctionArgs) + Send + 'static) -> Result<(), Error> {
    let task = Mutex::new(Some(f));
    let slot: Arc<OnceCell<RefId>> = Arc::new(OnceCell::new());
    let own_id = slot.clone();
    let callback: HostFunction = Arc::new(move |args: &FunctionArgs| {
      if let Some(task) = task.lock().take() {
        task(args);
      }
      if let Some(id) = own_id.get() {
        args.context.release_function(*id);
      }
      args.context.undefined(&args.ec)
    });
    let (function, id) = self.function(ec, None, callback)?;
    let _ = slot.set(id);
    self.isolate().enqueue_microtask(ec, &function)
  }

  pub(crate) fn register_function(&self, f: HostFunction) -> RefId {
    self.inner.functions.add(f)
  }

  pub(crate) fn lookup_function(&self, id: RefId) -> Option<HostFunction> {
    self.inner.functions.get(id)
  }

  pub(crate) fn release_function(&self, id: RefId) {
    self.inner.functions.release_id(id);
  }

  pub(crate) fn register_accessor(&self, accessor: Arc<Accessor>) -> RefId {
    self.inner.accessors.add(accessor)
  }

  pub(crate) fn lookup_accessor(&self, id: RefId) -> Option<Arc<Accessor>> {
    self.inner.accessors.get(id)
  }

  pub(crate) fn callback_id(&self, callback: RefId, ec: Option<&ExecutionContext>) -> CallbackId {
    CallbackId {
      isolate: self.isolate().id(),
      context: self.id(),
      callback,
      execution_context: ec.map(|ec| ec.id()),
    }
  }

  /// Keeps `record` alive for as long as this context (or until [`release_ref`](Self::release_ref)).
  pub fn add_ref(&self, record: Arc<dyn Any + Send + Sync>) -> RefId {
    self.inner.refs.add(record)
  }

  pub fn get_ref(&self, id: RefId) -> Option<Arc<dyn Any + Send + Sync>> {
    self.inner.refs.get(id)
  }

  pub fn release_ref(&self, id: RefId) -> bool {
    self.inner.refs.release_id(id).is_some()
  }

  /// Counts of registered host functions, accessors and refs.
  pub fn registrations(&self) -> (usize, usize, usize) {
    (
      self.inner.functions.len(),
      self.inner.accessors.len(),
      self.inner.refs.len(),
    )
  }

  pub fn data(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
    self.inner.data.get(key)
  }

  pub fn set_data(&self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
    self.inner.data.insert(key.into(), value);
  }

  /// Compiles and evaluates `code` as a classic script named `filename`.
  pub fn run(&self, ec: &ExecutionContext, code: &str, filename: &str) -> Result<Value, Error> {
    let _span = tracing::debug_span!("context.run", context = %self.id(), filename).entered();
    self.sync(ec, |scope, ctx| {
      let source = string(scope, code)?;
      let name = string(scope, filename)?;
      let origin = v8::ScriptOrigin::new(scope, name.into(), 0, 0, false, 0, None, false, false, false, None);
      let result = ctx.catch(scope, |scope| {
        let script = v8::Script::compile(scope, source, Some(&origin))?;
        script.run(scope)
      })?;
      Ok(ctx.value(scope, result))
    })
  }

  /// Like [`run`](Self::run), recording `module` as the origin of any dynamic `import()` the
  /// script performs.
  pub fn run_with_module(&self, ec: &ExecutionContext, code: &str, filename: &str, module: RefId) -> Result<Value, Error> {
    self.inner.resources.lock().insert(filename.to_string(), module);
    self.run(ec, code, filename)
  }

  pub(crate) fn module_for_resource(&self, resource_name: &str) -> Option<RefId> {
    self.inner.resources.lock().get(resource_name).copied()
  }

  pub(crate) fn bind_receiver(
    &self,
    ec: &ExecutionContext,
    value: &Value,
    host: Arc<dyn Any + Send + Sync>,
  ) -> Result<(), Error> {
    value.require_kind(Kind::OBJECT)?;
    self.prune_receivers();
    let key = host_key(&host);
    let replaced = self.sync(ec, |scope, ctx| {
      let object = value.object(scope)?;
      if object.internal_field_count() == 0 {
        return Err(Error::msg("object has no internal field for a receiver"));
      }
      let previous = receiver_id(scope, object);
      let id = {
        let mut receivers = ctx.inner.receivers.lock();
        receivers.next += 1;
        receivers.next
      };
      let field = v8::Integer::new(scope, id);
      object.set_internal_field(0, field.into());
      let collected = ctx.inner.collected.clone();
      let handle = WeakHandle::new(ctx.isolate().inner(), scope, object, move || collected.lock().push(id));
      let receiver = Receiver {
        host,
        object: handle,
        wrapper: value.downgrade(),
      };
      let mut receivers = ctx.inner.receivers.lock();
      let replaced = previous.and_then(|previous| receivers.remove(previous));
      receivers.by_id.insert(id, receiver);
      receivers.by_host.insert(key, id);
      Ok(replaced)
    })?;
    drop(replaced);
    Ok(())
  }

  pub(crate) fn unbind_receiver(&self, ec: &ExecutionContext, value: &Value) -> Result<(), Error> {
    if !value.is_kind(Kind::OBJECT) {
      return Ok(());
    }
    let removed = self.sync(ec, |scope, ctx| {
      let object = value.object(scope)?;
      let Some(id) = receiver_id(scope, object) else {
        return Ok(None);
      };
      let undefined = v8::undefined(scope);
      object.set_internal_field(0, undefined.into());
      let removed = ctx.inner.receivers.lock().remove(id);
      Ok(removed)
    })?;
    drop(removed);
    Ok(())
  }

  pub(crate) fn receiver(&self, ec: &ExecutionContext, value: &Value) -> Result<Option<Arc<dyn Any + Send + Sync>>, Error> {
    if !value.is_kind(Kind::OBJECT) {
      return Ok(None);
    }
    self.sync(ec, |scope, ctx| {
      let object = value.object(scope)?;
      Ok(receiver_id(scope, object).and_then(|id| ctx.inner.receivers.lock().by_id.get(&id).map(|r| r.host.clone())))
    })
  }

  /// The script object already bound to `host` in this context, if any.
  pub(crate) fn receiver_value(&self, ec: &ExecutionContext, host: &Arc<dyn Any + Send + Sync>) -> Result<Option<Value>, Error> {
    self.prune_receivers();
    let key = host_key(host);
    let wrapper = {
      let receivers = self.inner.receivers.lock();
      let Some(id) = receivers.by_host.get(&key) else {
        return Ok(None);
      };
      receivers.by_id.get(id).and_then(|r| r.wrapper.upgrade())
    };
    if let Some(inner) = wrapper {
      return Ok(Some(Value::from_inner(inner)));
    }
    self.sync(ec, |scope, ctx| {
      let object = {
        let receivers = ctx.inner.receivers.lock();
        let id = receivers.by_host.get(&key).copied();
        match id.and_then(|id| receivers.by_id.get(&id)) {
          Some(receiver) => receiver.object.open(scope),
          None => None,
        }
      };
      // Collected but not yet pruned: the host gets a fresh object.
      Ok(object.map(|object| ctx.value(scope, object.into())))
    })
  }

  /// Drops bindings whose script objects the engine has collected.
  fn prune_receivers(&self) {
    let ids = std::mem::take(&mut *self.inner.collected.lock());
    if ids.is_empty() {
      return;
    }
    let removed: Vec<Receiver> = {
      let mut receivers = self.inner.receivers.lock();
      ids.into_iter().filter_map(|id| receivers.remove(id)).collect()
    };
    tracing::trace!(context = %self.id(), count = removed.len(), "pruned collected receivers");
    drop(removed);
  }

  /// Live receiver bindings, after dropping those whose script objects were collected.
  pub fn receiver_count(&self) -> usize {
    self.prune_receivers();
    self.inner.receivers.lock().by_id.len()
  }

  fn install_console(&self, ec: &ExecutionContext) -> Result<(), Error> {
    let console = self.new_object(ec)?;
    for &method in CONSOLE_METHODS {
      let function = self.create_function(ec, Some(method), move |args| {
        let mut line = Vec::with_capacity(args.args.len());
        for arg in &args.args {
          line.push(arg.string_value(&args.ec)?);
        }
        let line = line.join(" ");
        match method {
          "error" | "assert" => tracing::error!(target: "console", method, "{line}"),
          "warn" => tracing::warn!(target: "console", method, "{line}"),
          "debug" | "trace" => tracing::debug!(target: "console", method, "{line}"),
          _ => tracing::info!(target: "console", method, "{line}"),
        }
        args.context.undefined(&args.ec)
      })?;
      console.set(ec, method, &function)?;
    }
    self.global(ec)?.set(ec, "console", &console)
  }

  /// Releases every host registration and the engine context. Values of this context fail with
  /// [`Error::ContextReleased`] afterwards.
  pub fn release(&self) {
    self.release_tables();
    self.isolate().forget_context(self.id());
  }

  pub(crate) fn release_tables(&self) {
    if self.inner.released.swap(true, Ordering::AcqRel) {
      return;
    }
    tracing::debug!(context = %self.id(), "releasing context");
    let functions = self.inner.functions.release_all();
    let accessors = self.inner.accessors.release_all();
    let refs = self.inner.refs.release_all();
    let receivers = std::mem::take(&mut *self.inner.receivers.lock());
    let prototypes = std::mem::take(&mut *self.inner.prototypes.lock());
    let constructors = std::mem::take(&mut *self.inner.constructors.lock());
    let builtins = self.inner.builtins.write().take();
    let handle = self.inner.handle.write().take();
    *self.inner.singletons.lock() = Default::default();
    self.inner.resources.lock().clear();
    self.inner.data.clear();
    drop((functions, accessors, refs, receivers, prototypes, constructors, builtins, handle));
    tracer::context_released(self.id());
  }
}

/// The receiver id stored in an object's first internal field.
pub(crate) fn receiver_id(scope: &mut v8::HandleScope<'_>, object: v8::Local<v8::Object>) -> Option<i32> {
  if object.internal_field_count() == 0 {
    return None;
  }
  let field = object.get_internal_field(scope, 0)?;
  let field = v8::Local::<v8::Value>::try_from(field).ok()?;
  if !field.is_int32() {
    return None;
  }
  field.int32_value(scope)
}

fn get_object<'s>(
  scope: &mut v8::HandleScope<'s>,
  object: v8::Local<'s, v8::Object>,
  name: &str,
) -> Result<v8::Local<'s, v8::Object>, Error> {
  let key = string(scope, name)?;
  object
    .get(scope, key.into())
    .and_then(|v| v8::Local::<v8::Object>::try_from(v).ok())
    .ok_or_else(|| Error::msg(format!("built-in {name} is missing")))
}

fn get_function<'s>(
  scope: &mut v8::HandleScope<'s>,
  object: v8::Local<'s, v8::Object>,
  name: &str,
) -> Result<v8::Local<'s, v8::Function>, Error> {
  let key = string(scope, name)?;
  object
    .get(scope, key.into())
    .and_then(|v| v8::Local::<v8::Function>::try_from(v).ok())
    .ok_or_else(|| Error::msg(format!("built-in {name} is missing")))
}
