//! Chrome DevTools protocol sessions.
//!
//! The engine-side inspector and its session can only be used on the isolate's own thread, so
//! they live in a thread-local table there; [`Inspector`] is the host handle addressing them.

use ahash::AHashMap;
use std::cell::RefCell;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use v8::inspector::ChannelBase;
use v8::inspector::ChannelImpl;
use v8::inspector::StringBuffer;
use v8::inspector::StringView;
use v8::inspector::V8Inspector;
use v8::inspector::V8InspectorClientBase;
use v8::inspector::V8InspectorClientImpl;
use v8::inspector::V8InspectorClientTrustLevel;
use v8::inspector::V8InspectorSession;

use crate::Context;
use crate::Error;
use crate::ExecutionContext;
use crate::Isolate;

const CONTEXT_GROUP_ID: i32 = 1;

static NEXT_INSPECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Receives protocol traffic produced by the engine.
pub trait InspectorClient: Send + Sync {
  fn send_response(&self, call_id: i32, message: &str);
  fn send_notification(&self, message: &str);
  fn flush_protocol_notifications(&self) {}
}

struct Client {
  base: V8InspectorClientBase,
}

impl V8InspectorClientImpl for Client {
  fn base(&self) -> &V8InspectorClientBase {
    &self.base
  }

  fn base_mut(&mut self) -> &mut V8InspectorClientBase {
    &mut self.base
  }

  unsafe fn base_ptr(this: *const Self) -> *const V8InspectorClientBase
  where
    Self: Sized,
  {
    // SAFETY: `this` points to a live `Client`.
    unsafe { std::ptr::addr_of!((*this).base) }
  }
}

struct Channel {
  base: ChannelBase,
  client: Arc<dyn InspectorClient>,
}

fn text(message: &v8::UniquePtr<StringBuffer>) -> String {
  message.as_ref().map(|m| m.string().to_string()).unwrap_or_default()
}

impl ChannelImpl for Channel {
  fn base(&self) -> &ChannelBase {
    &self.base
  }

  fn base_mut(&mut self) -> &mut ChannelBase {
    &mut self.base
  }

  unsafe fn base_ptr(this: *const Self) -> *const ChannelBase
  where
    Self: Sized,
  {
    // SAFETY: `this` points to a live `Channel`.
    unsafe { std::ptr::addr_of!((*this).base) }
  }

  fn send_response(&mut self, call_id: i32, message: v8::UniquePtr<StringBuffer>) {
    self.client.send_response(call_id, &text(&message));
  }

  fn send_notification(&mut self, message: v8::UniquePtr<StringBuffer>) {
    self.client.send_notification(&text(&message));
  }

  fn flush_protocol_notifications(&mut self) {
    self.client.flush_protocol_notifications();
  }
}

/// Engine objects of one inspector. Fields drop in order: the session before the inspector, and
/// both before the boxed client and channel they point into.
struct Engine {
  session: v8::UniqueRef<V8InspectorSession>,
  inspector: v8::UniqueRef<V8Inspector>,
  _channel: Box<Channel>,
  _client: Box<Client>,
}

thread_local! {
  static ENGINES: RefCell<AHashMap<u64, Engine>> = RefCell::new(AHashMap::new());
}

/// Takes the engine out of the table while `f` runs, since protocol callbacks may re-enter.
fn with_engine<R>(id: u64, f: impl FnOnce(&mut Engine) -> R) -> Result<R, Error> {
  let mut engine = ENGINES
    .with(|engines| engines.borrow_mut().remove(&id))
    .ok_or_else(|| Error::msg(format!("inspector {id} is released or busy")))?;
  let result = f(&mut engine);
  ENGINES.with(|engines| engines.borrow_mut().insert(id, engine));
  Ok(result)
}

/// Drops every inspector of the calling isolate thread. Runs before the isolate is disposed.
pub(crate) fn dispose_all() {
  let engines = ENGINES.with(|engines| std::mem::take(&mut *engines.borrow_mut()));
  drop(engines);
}

/// A debugging session attached to an isolate.
pub struct Inspector {
  id: u64,
  isolate: Isolate,
  released: AtomicBool,
}

impl Inspector {
  pub fn new(ec: &ExecutionContext, isolate: &Isolate, client: Arc<dyn InspectorClient>) -> Result<Inspector, Error> {
    let id = NEXT_INSPECTOR_ID.fetch_add(1, Ordering::Relaxed);
    isolate.sync(ec, move |scope| {
      let mut client_impl = Box::new(Client {
        base: V8InspectorClientBase::new::<Client>(),
      });
      let mut inspector = V8Inspector::create(scope, &mut *client_impl);
      let mut channel = Box::new(Channel {
        base: ChannelBase::new::<Channel>(),
        client,
      });
      let session = inspector.connect(
        CONTEXT_GROUP_ID,
        &mut *channel,
        StringView::empty(),
        V8InspectorClientTrustLevel::FullyTrusted,
      );
      let engine = Engine {
        session,
        inspector,
        _channel: channel,
        _client: client_impl,
      };
      ENGINES.with(|engines| engines.borrow_mut().insert(id, engine));
      Ok(())
    })?;
    tracing::debug!(isolate = %isolate.id(), inspector = id, "inspector attached");
    Ok(Inspector {
      id,
      isolate: isolate.clone(),
      released: AtomicBool::new(false),
    })
  }

  /// Makes `context` visible to the debugger under `name`.
  pub fn add_context(&self, ec: &ExecutionContext, context: &Context, name: &str) -> Result<(), Error> {
    let id = self.id;
    context.sync(ec, |scope, ctx| {
      let local = ctx.local(scope)?;
      with_engine(id, |engine| {
        engine
          .inspector
          .context_created(local, CONTEXT_GROUP_ID, StringView::from(name.as_bytes()), StringView::empty())
      })
    })
  }

  pub fn remove_context(&self, ec: &ExecutionContext, context: &Context) -> Result<(), Error> {
    let id = self.id;
    context.sync(ec, |scope, ctx| {
      let local = ctx.local(scope)?;
      with_engine(id, |engine| engine.inspector.context_destroyed(local))
    })
  }

  /// Feeds one protocol message to the engine. Responses arrive through the client.
  pub fn dispatch_message(&self, ec: &ExecutionContext, message: &str) -> Result<(), Error> {
    let id = self.id;
    self.isolate.sync(ec, |_| {
      with_engine(id, |engine| {
        engine
          .session
          .dispatch_protocol_message(StringView::from(message.as_bytes()))
      })
    })
  }

  pub fn release(&self, ec: &ExecutionContext) -> Result<(), Error> {
    if self.released.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    let id = self.id;
    self.isolate.sync(ec, move |_| {
      let engine = ENGINES.with(|engines| engines.borrow_mut().remove(&id));
      drop(engine);
      Ok(())
    })?;
    tracing::debug!(isolate = %self.isolate.id(), inspector = id, "inspector released");
    Ok(())
  }
}

impl Drop for Inspector {
  fn drop(&mut self) {
    if self.released.load(Ordering::Acquire) || !self.isolate.is_running() {
      return;
    }
    let ec = self.isolate.execution_context();
    if let Err(err) = self.release(&ec) {
      tracing::debug!(%err, inspector = self.id, "inspector release on drop failed");
    }
  }
}
