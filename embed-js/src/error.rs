use crate::kind::Kind;
use crate::marshal::ToJs;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Host errors with a script shape of their own, such as an `Error` carrying a `code` property.
pub trait ScriptError: std::error::Error + ToJs + Send + Sync {}

impl<T: std::error::Error + ToJs + Send + Sync> ScriptError for T {}

/// Errors produced by isolates, contexts and values.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
  /// The owning isolate was terminated; no further engine work is possible.
  #[error("isolate terminated")]
  Terminated,

  /// An operation needed an implicit [`Context`](crate::Context) but the execution context has
  /// none bound.
  #[error("no context bound to execution context")]
  NoContext,

  #[error("context released")]
  ContextReleased,

  /// A host callback produced a value that belongs to a different isolate.
  #[error("callback returned a value from another isolate")]
  CrossIsolate,

  /// A value thrown by script (or a rejected promise).
  #[error("{0}")]
  Js(JsError),

  /// The value's kind is incompatible with the requested operation.
  #[error("expected {expected}, found {found}")]
  Kind { expected: Kind, found: Kind },

  #[error("cannot marshal {type_name}: {reason}")]
  Marshal {
    type_name: &'static str,
    reason: String,
  },

  #[error("cannot unmarshal into {type_name}: {reason}")]
  Unmarshal {
    type_name: &'static str,
    reason: String,
  },

  #[error("receiver not found")]
  ReceiverNotFound,

  /// The host object behind a receiver is already mutably borrowed further up the call chain.
  #[error("receiver is already borrowed")]
  ReceiverBusy,

  /// A panic was caught at the engine boundary.
  #[error("panic: {0}")]
  Panic(String),

  #[error("{0}")]
  Host(Arc<dyn std::error::Error + Send + Sync>),

  /// A host error that marshals itself; thrown into script as whatever its [`ToJs`] produces.
  #[error("{0}")]
  Script(Arc<dyn ScriptError>),

  #[error("{0}")]
  Message(String),
}

impl Error {
  pub fn msg(message: impl Into<String>) -> Self {
    Error::Message(message.into())
  }

  pub fn host(err: impl std::error::Error + Send + Sync + 'static) -> Self {
    Error::Host(Arc::new(err))
  }

  pub fn script(err: impl ScriptError + 'static) -> Self {
    Error::Script(Arc::new(err))
  }

  pub(crate) fn marshal<T: ?Sized>(reason: impl Into<String>) -> Self {
    Error::Marshal {
      type_name: std::any::type_name::<T>(),
      reason: reason.into(),
    }
  }

  pub(crate) fn unmarshal<T: ?Sized>(reason: impl Into<String>) -> Self {
    Error::Unmarshal {
      type_name: std::any::type_name::<T>(),
      reason: reason.into(),
    }
  }

  pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
      (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
      s.clone()
    } else {
      "unknown panic payload".to_string()
    };
    Error::Panic(message)
  }

  /// The script value behind this error, if it originated from script.
  pub fn value(&self) -> Option<&Value> {
    match self {
      Error::Js(err) => err.value.as_ref(),
      _ => None,
    }
  }

  /// Compares two errors by the identity of the script value they carry, falling back to their
  /// rendered message.
  pub fn is_same(&self, other: &Error) -> bool {
    if let (Some(a), Some(b)) = (self.value(), other.value()) {
      if Value::ptr_eq(a, b) {
        return true;
      }
    }
    self.to_string() == other.to_string()
  }
}

/// An error thrown from script.
///
/// `message` is the thrown value's `stack` property when it has one, otherwise its string form.
#[derive(Clone)]
pub struct JsError {
  pub message: String,
  pub value: Option<Value>,
}

impl JsError {
  pub fn new(message: impl Into<String>, value: Option<Value>) -> Self {
    Self {
      message: message.into(),
      value,
    }
  }
}

impl fmt::Display for JsError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.message)
  }
}

impl fmt::Debug for JsError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JsError")
      .field("message", &self.message)
      .field("kind", &self.value.as_ref().map(|v| v.kind()))
      .finish()
  }
}
