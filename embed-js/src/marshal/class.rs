//! Script classes synthesized from host types.
//!
//! A host type describes itself once through [`Class::describe`]; the description becomes a
//! function template whose prototype carries one accessor per field or getter/setter pair and one
//! method per function. Instances hold an `Arc<Mutex<T>>` receiver, resolved through the object's
//! internal field on every access.

use parking_lot::Mutex;
use std::any::Any;
use std::any::TypeId;
use std::sync::Arc;

use super::name;
use super::FromJs;
use super::ToJs;
use crate::callback::FunctionArgs;
use crate::callback::GetterArgs;
use crate::callback::GetterFn;
use crate::callback::HostFunction;
use crate::callback::SetterArgs;
use crate::callback::SetterFn;
use crate::template::FunctionTemplate;
use crate::Context;
use crate::Error;
use crate::ExecutionContext;
use crate::Kind;
use crate::Value;

/// A host type exposed to script as a class.
pub trait Class: Any + Send + Sized {
  /// The script-visible class name.
  fn class_name() -> String {
    name::class_name(std::any::type_name::<Self>())
  }

  /// Registers the fields, accessors, methods and embedded types of the class.
  fn describe(class: &mut ClassBuilder<Self>);

  /// Host-side initialization, run once when an instance gets its receiver.
  fn construct(&mut self, _args: &FunctionArgs) -> Result<(), Error> {
    Ok(())
  }

  /// The receiver to create on demand for instances made by script without one, and the starting
  /// point when unmarshaling a plain object into this type.
  fn zero() -> Option<Self> {
    None
  }
}

pub type ConstructorFn<T> = Arc<dyn Fn(&FunctionArgs) -> Result<T, Error> + Send + Sync>;

type Getter<T> = Arc<dyn Fn(&T, &GetterArgs) -> Result<Value, Error> + Send + Sync>;
type Setter<T> = Arc<dyn Fn(&mut T, &SetterArgs) -> Result<(), Error> + Send + Sync>;
type LockedMethod<T> = Arc<dyn Fn(&mut T, &FunctionArgs) -> Result<Value, Error> + Send + Sync>;
type Load<T> = Arc<dyn Fn(&mut T, &ExecutionContext, &Value) -> Result<(), Error> + Send + Sync>;
type Parent = Box<dyn Fn(&ExecutionContext, &Context) -> Result<FunctionTemplate, Error>>;

enum Method<T> {
  Locked(LockedMethod<T>),
  /// Runs without taking the receiver lock.
  Unlocked(HostFunction),
}

struct Property<T> {
  name: String,
  get: Option<Getter<T>>,
  set: Option<Setter<T>>,
  load: Option<Load<T>>,
}

/// Collects the members of a [`Class`].
pub struct ClassBuilder<T> {
  properties: Vec<Property<T>>,
  methods: Vec<(String, Method<T>)>,
  parent: Option<Parent>,
}

impl<T: Class> ClassBuilder<T> {
  fn describe() -> ClassBuilder<T> {
    let mut class = ClassBuilder {
      properties: Vec::new(),
      methods: Vec::new(),
      parent: None,
    };
    T::describe(&mut class);
    class
  }

  fn property(&mut self, name: String) -> &mut Property<T> {
    let index = match self.properties.iter().position(|p| p.name == name) {
      Some(index) => index,
      None => {
        self.properties.push(Property {
          name,
          get: None,
          set: None,
          load: None,
        });
        self.properties.len() - 1
      }
    };
    &mut self.properties[index]
  }

  /// A data field, readable and writable from script, also filled in by unmarshaling.
  pub fn field<F>(
    &mut self,
    name: &str,
    get: impl Fn(&T) -> &F + Send + Sync + 'static,
    get_mut: impl Fn(&mut T) -> &mut F + Send + Sync + 'static,
  ) -> &mut Self
  where
    F: ToJs + FromJs + 'static,
  {
    let get_mut = Arc::new(get_mut);
    let load_mut = get_mut.clone();
    let property = self.property(name::js_name(name));
    property.get = Some(Arc::new(move |t: &T, args: &GetterArgs| get(t).to_js(&args.ec, &args.context)));
    property.set = Some(Arc::new(move |t: &mut T, args: &SetterArgs| {
      *get_mut(t) = F::from_js(&args.ec, &args.value)?;
      Ok(())
    }));
    property.load = Some(Arc::new(move |t: &mut T, ec: &ExecutionContext, value: &Value| {
      *load_mut(t) = F::from_js(ec, value)?;
      Ok(())
    }));
    self
  }

  pub fn getter(
    &mut self,
    name: &str,
    f: impl Fn(&T, &GetterArgs) -> Result<Value, Error> + Send + Sync + 'static,
  ) -> &mut Self {
    self.property(name::js_name(name)).get = Some(Arc::new(f));
    self
  }

  pub fn setter(
    &mut self,
    name: &str,
    f: impl Fn(&mut T, &SetterArgs) -> Result<(), Error> + Send + Sync + 'static,
  ) -> &mut Self {
    self.property(name::js_name(name)).set = Some(Arc::new(f));
    self
  }

  pub fn method(
    &mut self,
    name: &str,
    f: impl Fn(&mut T, &FunctionArgs) -> Result<Value, Error> + Send + Sync + 'static,
  ) -> &mut Self {
    self.methods.push((name::js_name(name), Method::Locked(Arc::new(f))));
    self
  }

  /// A prototype function that does not lock the receiver, for methods that run script which
  /// may read this object's own accessors. It can still look the receiver up through `this`.
  pub fn function(
    &mut self,
    name: &str,
    f: impl Fn(&FunctionArgs) -> Result<Value, Error> + Send + Sync + 'static,
  ) -> &mut Self {
    self.methods.push((name::js_name(name), Method::Unlocked(Arc::new(f))));
    self
  }

  /// Embeds `U`: its members are exposed on this class through the projections. The first
  /// embedded type also becomes the parent class, so instances pass `instanceof U`.
  pub fn embed<U: Class>(
    &mut self,
    project: impl Fn(&T) -> &U + Send + Sync + 'static,
    project_mut: impl Fn(&mut T) -> &mut U + Send + Sync + 'static,
  ) -> &mut Self {
    if self.parent.is_none() {
      self.parent = Some(Box::new(|ec, ctx| prototype::<U>(ec, ctx)));
    }
    let project = Arc::new(project);
    let project_mut = Arc::new(project_mut);
    let embedded = ClassBuilder::<U>::describe();
    for Property { name, get, set, load } in embedded.properties {
      let property = self.property(name);
      if let Some(get) = get {
        let project = project.clone();
        property.get = Some(Arc::new(move |t: &T, args: &GetterArgs| get(project(t), args)));
      }
      if let Some(set) = set {
        let project_mut = project_mut.clone();
        property.set = Some(Arc::new(move |t: &mut T, args: &SetterArgs| set(project_mut(t), args)));
      }
      if let Some(load) = load {
        let project_mut = project_mut.clone();
        property.load = Some(Arc::new(move |t: &mut T, ec: &ExecutionContext, value: &Value| {
          load(project_mut(t), ec, value)
        }));
      }
    }
    for (name, method) in embedded.methods {
      let method = match method {
        Method::Locked(f) => {
          let project_mut = project_mut.clone();
          let f: LockedMethod<T> = Arc::new(move |t: &mut T, args: &FunctionArgs| f(project_mut(t), args));
          Method::Locked(f)
        }
        Method::Unlocked(f) => Method::Unlocked(f),
      };
      self.methods.push((name, method));
    }
    self
  }
}

/// The receiver bound to `this`, creating a zero receiver when the class has one.
pub(crate) fn resolve<T: Class>(ec: &ExecutionContext, this: &Value) -> Result<Arc<Mutex<T>>, Error> {
  if let Some(host) = this.receiver(ec)? {
    return host.downcast::<Mutex<T>>().map_err(|_| Error::ReceiverNotFound);
  }
  let zero = T::zero().ok_or(Error::ReceiverNotFound)?;
  let host = Arc::new(Mutex::new(zero));
  this.set_receiver(ec, Some(host.clone()))?;
  host.lock().construct(&FunctionArgs::synthetic(ec, this.context(), this))?;
  Ok(host)
}

fn getter_fn<T: Class>(get: Getter<T>) -> GetterFn {
  Arc::new(move |args: &GetterArgs| {
    let host = resolve::<T>(&args.ec, &args.this)?;
    let guard = host.try_lock().ok_or(Error::ReceiverBusy)?;
    get(&guard, args)
  })
}

fn setter_fn<T: Class>(set: Setter<T>) -> SetterFn {
  Arc::new(move |args: &SetterArgs| {
    let host = resolve::<T>(&args.ec, &args.this)?;
    let mut guard = host.try_lock().ok_or(Error::ReceiverBusy)?;
    set(&mut guard, args)
  })
}

fn method_fn<T: Class>(method: Method<T>) -> HostFunction {
  match method {
    Method::Locked(f) => Arc::new(move |args: &FunctionArgs| {
      let host = resolve::<T>(&args.ec, &args.this)?;
      let mut guard = host.try_lock().ok_or(Error::ReceiverBusy)?;
      f(&mut guard, args)
    }),
    Method::Unlocked(f) => f,
  }
}

fn build<T: Class>(ec: &ExecutionContext, context: &Context, template: &FunctionTemplate) -> Result<(), Error> {
  let class = ClassBuilder::<T>::describe();
  template.set_class_name(ec, &T::class_name())?;
  template.instance_template().set_internal_field_count(ec, 1)?;
  if let Some(parent) = &class.parent {
    template.inherit(ec, &parent(ec, context)?)?;
  }
  let prototype = template.prototype_template();
  for Property { name, get, set, .. } in class.properties {
    prototype.set_accessor(ec, &name, get.map(getter_fn::<T>), set.map(setter_fn::<T>))?;
  }
  for (name, f) in class.methods {
    prototype.set_method(ec, &name, method_fn::<T>(f))?;
  }
  Ok(())
}

/// The template for `T` without a host constructor, created once per context.
pub fn prototype<T: Class>(ec: &ExecutionContext, context: &Context) -> Result<FunctionTemplate, Error> {
  let type_id = TypeId::of::<T>();
  if let Some(template) = context.cached_prototype(type_id) {
    return Ok(template);
  }
  let template = FunctionTemplate::new(ec, context, None)?;
  build::<T>(ec, context, &template)?;
  tracing::debug!(class = %T::class_name(), context = %context.id(), "synthesized class");
  Ok(context.cache_prototype(type_id, template))
}

/// A template for `T` whose `new` runs `f` and binds the result to `this`. Instances of `T`
/// created by the host afterwards share this constructor.
pub fn constructor<T: Class>(ec: &ExecutionContext, context: &Context, f: ConstructorFn<T>) -> Result<FunctionTemplate, Error> {
  let class_name = T::class_name();
  let name = class_name.clone();
  let callback: HostFunction = Arc::new(move |args: &FunctionArgs| {
    if !args.is_construct_call {
      return Err(Error::msg(format!("class constructor {name} cannot be invoked without 'new'")));
    }
    let mut host = f(args)?;
    host.construct(args)?;
    args.this.set_receiver(&args.ec, Some(Arc::new(Mutex::new(host))))?;
    Ok(args.this.clone())
  });
  let template = FunctionTemplate::new(ec, context, Some(callback))?;
  build::<T>(ec, context, &template)?;
  tracing::debug!(class = %class_name, context = %context.id(), "synthesized constructor");
  Ok(context.cache_constructor(TypeId::of::<T>(), template))
}

/// A new instance of `T`'s class in `context` bound to `host`, or the instance it is already bound
/// to.
pub(crate) fn instance<T: Class>(ec: &ExecutionContext, context: &Context, host: &Arc<Mutex<T>>) -> Result<Value, Error> {
  let any: Arc<dyn Any + Send + Sync> = host.clone();
  if let Some(existing) = context.receiver_value(ec, &any)? {
    return Ok(existing);
  }
  let template = match context.cached_constructor(TypeId::of::<T>()) {
    Some(template) => template,
    None => prototype::<T>(ec, context)?,
  };
  template.function(ec)?;
  let instance = template.instance_template().new_instance(ec)?;
  instance.set_receiver(ec, Some(any))?;
  host
    .try_lock()
    .ok_or(Error::ReceiverBusy)?
    .construct(&FunctionArgs::synthetic(ec, context, &instance))?;
  Ok(instance)
}

/// Recovers the receiver of `value`, or builds one from its properties starting at `T::zero`.
pub(crate) fn unmarshal<T: Class>(ec: &ExecutionContext, value: &Value) -> Result<Arc<Mutex<T>>, Error> {
  if let Some(host) = value.receiver(ec)? {
    return host
      .downcast::<Mutex<T>>()
      .map_err(|_| Error::unmarshal::<T>("receiver is bound to another type"));
  }
  let mut host = T::zero().ok_or_else(|| Error::unmarshal::<T>("no receiver bound and no zero value"))?;
  if value.is_kind(Kind::OBJECT) {
    for Property { name, load, .. } in ClassBuilder::<T>::describe().properties {
      let Some(load) = load else {
        continue;
      };
      let field = value.get(ec, &name)?;
      if !field.is_kind(Kind::UNDEFINED) {
        load(&mut host, ec, &field)?;
      }
    }
  }
  host.construct(&FunctionArgs::synthetic(ec, value.context(), value))?;
  Ok(Arc::new(Mutex::new(host)))
}
