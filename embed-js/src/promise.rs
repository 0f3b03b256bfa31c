use parking_lot::Mutex;
use std::sync::Arc;

use crate::callback::FunctionArgs;
use crate::callback::HostFunction;
use crate::handle::Persistent;
use crate::marshal::ToJs;
use crate::refs::RefId;
use crate::Context;
use crate::Error;
use crate::ExecutionContext;
use crate::Value;

/// The settling side of a script promise.
#[derive(Clone)]
pub struct Resolver {
  inner: Arc<ResolverInner>,
}

struct ResolverInner {
  context: Context,
  handle: Persistent<v8::PromiseResolver>,
}

impl Resolver {
  pub fn new(ec: &ExecutionContext, context: &Context) -> Result<Resolver, Error> {
    context.sync(ec, |scope, ctx| {
      let resolver = ctx.catch(scope, |scope| v8::PromiseResolver::new(scope))?;
      Ok(Resolver::from_local(ctx, scope, resolver))
    })
  }

  pub(crate) fn from_local(context: &Context, scope: &mut v8::HandleScope<'_>, resolver: v8::Local<v8::PromiseResolver>) -> Resolver {
    Resolver {
      inner: Arc::new(ResolverInner {
        context: context.clone(),
        handle: Persistent::new(context.isolate().inner(), scope, resolver),
      }),
    }
  }

  pub fn context(&self) -> &Context {
    &self.inner.context
  }

  /// The promise this resolver settles. Always the same promise.
  pub fn promise(&self, ec: &ExecutionContext) -> Result<Value, Error> {
    self.inner.context.sync(ec, |scope, ctx| {
      let promise = self.inner.handle.open(scope).get_promise(scope);
      Ok(ctx.value(scope, promise.into()))
    })
  }

  pub fn resolve(&self, ec: &ExecutionContext, value: &dyn ToJs) -> Result<(), Error> {
    let value = value.to_js(ec, &self.inner.context)?;
    self.resolve_value(ec, &value)
  }

  pub fn resolve_value(&self, ec: &ExecutionContext, value: &Value) -> Result<(), Error> {
    self.settle(ec, value, true)
  }

  pub fn reject(&self, ec: &ExecutionContext, reason: &dyn ToJs) -> Result<(), Error> {
    let reason = reason.to_js(ec, &self.inner.context)?;
    self.reject_value(ec, &reason)
  }

  pub fn reject_value(&self, ec: &ExecutionContext, reason: &Value) -> Result<(), Error> {
    self.settle(ec, reason, false)
  }

  fn settle(&self, ec: &ExecutionContext, value: &Value, fulfil: bool) -> Result<(), Error> {
    value.check_isolate(self.inner.context.isolate())?;
    self.inner.context.sync(ec, |scope, ctx| {
      let resolver = self.inner.handle.open(scope);
      let value = value.open(scope);
      ctx.catch(scope, |scope| {
        if fulfil {
          resolver.resolve(scope, value)
        } else {
          resolver.reject(scope, value)
        }
      })?;
      Ok(())
    })
  }

  /// Forwards the outcome to `callback` node-style: `callback(null, value)` on fulfilment and
  /// `callback(reason)` on rejection.
  pub fn to_callback(&self, ec: &ExecutionContext, callback: &Value) -> Result<(), Error> {
    let context = &self.inner.context;
    callback.check_isolate(context.isolate())?;
    let ids: Arc<Mutex<Vec<RefId>>> = Arc::new(Mutex::new(Vec::new()));
    let forward = |fulfilled: bool| -> HostFunction {
      let callback = callback.clone();
      let ids = ids.clone();
      Arc::new(move |args: &FunctionArgs| {
        // Either handler fires at most once, so both are released together.
        for id in ids.lock().drain(..) {
          args.context.release_function(id);
        }
        let outcome = match args.args.first() {
          Some(value) => value.clone(),
          None => args.context.undefined(&args.ec)?,
        };
        if fulfilled {
          let null = args.context.null(&args.ec)?;
          callback.call_value(&args.ec, None, &[null, outcome])
        } else {
          callback.call_value(&args.ec, None, &[outcome])
        }
      })
    };
    let (on_fulfilled, fulfilled_id) = context.function(ec, None, forward(true))?;
    let (on_rejected, rejected_id) = context.function(ec, None, forward(false))?;
    ids.lock().extend([fulfilled_id, rejected_id]);
    let promise = self.promise(ec)?;
    promise.call_method(ec, "then", &[&on_fulfilled, &on_rejected])?;
    Ok(())
  }
}
