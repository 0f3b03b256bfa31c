//! Function and object templates, the blueprints script classes are stamped from.

use parking_lot::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use crate::callback;
use crate::callback::Accessor;
use crate::callback::GetterFn;
use crate::callback::HostFunction;
use crate::callback::SetterFn;
use crate::context::string;
use crate::context::ContextInner;
use crate::handle::Persistent;
use crate::refs::RefId;
use crate::Context;
use crate::Error;
use crate::ExecutionContext;
use crate::Value;

fn upgrade(context: &Weak<ContextInner>) -> Result<Context, Error> {
  context.upgrade().map(Context::from_inner).ok_or(Error::ContextReleased)
}

/// Builds a function template whose data is the callback id of `callback`.
fn callback_template<'s>(
  scope: &mut v8::HandleScope<'s>,
  ctx: &Context,
  callback: RefId,
  entry: impl v8::MapFnTo<v8::FunctionCallback>,
) -> Result<v8::Local<'s, v8::FunctionTemplate>, Error> {
  let data = string(scope, &ctx.callback_id(callback, None).to_string())?;
  Ok(v8::FunctionTemplate::builder(entry).data(data.into()).build(scope))
}

#[derive(Clone)]
enum Member {
  Accessor(Arc<Accessor>),
  Method(String, HostFunction),
}

/// Shape of objects created from a template: internal field count, accessors and methods.
#[derive(Clone)]
pub struct ObjectTemplate {
  inner: Arc<ObjectTemplateInner>,
}

struct ObjectTemplateInner {
  context: Weak<ContextInner>,
  template: Persistent<v8::ObjectTemplate>,
  internal_fields: AtomicUsize,
  members: Mutex<Vec<Member>>,
}

impl ObjectTemplate {
  pub fn new(ec: &ExecutionContext, context: &Context) -> Result<ObjectTemplate, Error> {
    context.sync(ec, |scope, ctx| {
      let template = v8::ObjectTemplate::new(scope);
      Ok(ObjectTemplate::wrap(ctx, scope, template))
    })
  }

  fn wrap(ctx: &Context, scope: &mut v8::HandleScope<'_>, template: v8::Local<v8::ObjectTemplate>) -> ObjectTemplate {
    ObjectTemplate {
      inner: Arc::new(ObjectTemplateInner {
        context: ctx.downgrade(),
        template: Persistent::new(ctx.isolate().inner(), scope, template),
        internal_fields: AtomicUsize::new(template.internal_field_count()),
        members: Mutex::new(Vec::new()),
      }),
    }
  }

  pub fn context(&self) -> Result<Context, Error> {
    upgrade(&self.inner.context)
  }

  pub fn internal_field_count(&self) -> usize {
    self.inner.internal_fields.load(Ordering::Acquire)
  }

  pub fn set_internal_field_count(&self, ec: &ExecutionContext, count: usize) -> Result<(), Error> {
    self.context()?.sync(ec, |scope, _| {
      self.inner.template.open(scope).set_internal_field_count(count);
      Ok(())
    })?;
    self.inner.internal_fields.store(count, Ordering::Release);
    Ok(())
  }

  /// Installs a named accessor property. A missing setter makes the property read-only.
  pub fn set_accessor(
    &self,
    ec: &ExecutionContext,
    name: &str,
    getter: Option<GetterFn>,
    setter: Option<SetterFn>,
  ) -> Result<(), Error> {
    let accessor = Arc::new(Accessor {
      name: name.to_string(),
      getter,
      setter,
    });
    self.install(ec, Member::Accessor(accessor))
  }

  pub fn set_method(&self, ec: &ExecutionContext, name: &str, f: HostFunction) -> Result<(), Error> {
    self.install(ec, Member::Method(name.to_string(), f))
  }

  /// Installs every accessor and method of `other` on this template.
  pub fn copy(&self, ec: &ExecutionContext, other: &ObjectTemplate) -> Result<(), Error> {
    let members = other.inner.members.lock().clone();
    for member in members {
      self.install(ec, member)?;
    }
    Ok(())
  }

  pub fn new_instance(&self, ec: &ExecutionContext) -> Result<Value, Error> {
    self.context()?.sync(ec, |scope, ctx| {
      let template = self.inner.template.open(scope);
      let object = ctx.catch(scope, |scope| template.new_instance(scope))?;
      Ok(ctx.value(scope, object.into()))
    })
  }

  fn install(&self, ec: &ExecutionContext, member: Member) -> Result<(), Error> {
    let context = self.context()?;
    match &member {
      Member::Accessor(accessor) => {
        let id = context.register_accessor(accessor.clone());
        context.sync(ec, |scope, ctx| {
          let key = string(scope, &accessor.name)?;
          let getter = match accessor.getter {
            Some(_) => Some(callback_template(scope, ctx, id, callback::getter_callback)?),
            None => None,
          };
          let setter = match accessor.setter {
            Some(_) => Some(callback_template(scope, ctx, id, callback::setter_callback)?),
            None => None,
          };
          let template = self.inner.template.open(scope);
          template.set_accessor_property(key.into(), getter, setter, v8::PropertyAttribute::NONE);
          Ok(())
        })?;
      }
      Member::Method(name, f) => {
        let id = context.register_function(f.clone());
        context.sync(ec, |scope, ctx| {
          let key = string(scope, name)?;
          let method = callback_template(scope, ctx, id, callback::function_callback)?;
          let template = self.inner.template.open(scope);
          template.set(key.into(), method.into());
          Ok(())
        })?;
      }
    }
    self.inner.members.lock().push(member);
    Ok(())
  }
}

/// A constructor blueprint. The function it produces is created once and reused; inheritance
/// must be declared before that happens.
#[derive(Clone)]
pub struct FunctionTemplate {
  inner: Arc<FunctionTemplateInner>,
}

struct FunctionTemplateInner {
  context: Weak<ContextInner>,
  template: Persistent<v8::FunctionTemplate>,
  instance: ObjectTemplate,
  prototype: ObjectTemplate,
  parent: Mutex<Option<FunctionTemplate>>,
  function: Mutex<Option<Persistent<v8::Function>>>,
}

impl FunctionTemplate {
  /// A template calling `callback` when invoked. Without one, `new` simply yields `this`.
  pub fn new(ec: &ExecutionContext, context: &Context, callback: Option<HostFunction>) -> Result<FunctionTemplate, Error> {
    let callback = callback.map(|f| context.register_function(f));
    context.sync(ec, |scope, ctx| {
      let template = match callback {
        Some(id) => callback_template(scope, ctx, id, callback::function_callback)?,
        None => v8::FunctionTemplate::builder(callback::identity_callback).build(scope),
      };
      let instance = template.instance_template(scope);
      let prototype = template.prototype_template(scope);
      Ok(FunctionTemplate {
        inner: Arc::new(FunctionTemplateInner {
          context: ctx.downgrade(),
          template: Persistent::new(ctx.isolate().inner(), scope, template),
          instance: ObjectTemplate::wrap(ctx, scope, instance),
          prototype: ObjectTemplate::wrap(ctx, scope, prototype),
          parent: Mutex::new(None),
          function: Mutex::new(None),
        }),
      })
    })
  }

  pub fn context(&self) -> Result<Context, Error> {
    upgrade(&self.inner.context)
  }

  pub fn instance_template(&self) -> &ObjectTemplate {
    &self.inner.instance
  }

  pub fn prototype_template(&self) -> &ObjectTemplate {
    &self.inner.prototype
  }

  pub fn parent(&self) -> Option<FunctionTemplate> {
    self.inner.parent.lock().clone()
  }

  pub fn is_instantiated(&self) -> bool {
    self.inner.function.lock().is_some()
  }

  /// Makes instances of this template inherit from instances of `parent`.
  pub fn inherit(&self, ec: &ExecutionContext, parent: &FunctionTemplate) -> Result<(), Error> {
    if self.is_instantiated() {
      return Err(Error::msg("cannot inherit after the function was created"));
    }
    self.context()?.sync(ec, |scope, _| {
      let template = self.inner.template.open(scope);
      let parent = parent.inner.template.open(scope);
      template.inherit(parent);
      Ok(())
    })?;
    *self.inner.parent.lock() = Some(parent.clone());
    Ok(())
  }

  pub fn set_class_name(&self, ec: &ExecutionContext, name: &str) -> Result<(), Error> {
    self.context()?.sync(ec, |scope, _| {
      let name = string(scope, name)?;
      self.inner.template.open(scope).set_class_name(name);
      Ok(())
    })
  }

  /// The constructor function for this template in its context.
  pub fn function(&self, ec: &ExecutionContext) -> Result<Value, Error> {
    self.context()?.sync(ec, |scope, ctx| {
      let mut cached = self.inner.function.lock();
      let function = match cached.as_ref() {
        Some(function) => function.open(scope),
        None => {
          let template = self.inner.template.open(scope);
          let function = ctx.catch(scope, |scope| template.get_function(scope))?;
          *cached = Some(Persistent::new(ctx.isolate().inner(), scope, function));
          function
        }
      };
      Ok(ctx.value(scope, function.into()))
    })
  }
}
