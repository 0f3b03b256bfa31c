//! Conversions between host values and script values.
//!
//! [`ToJs`] creates a script value in a context, [`FromJs`] reads one back. Both are implemented
//! for primitives, strings, options, sequences, string-keyed maps, byte buffers, times and
//! durations, errors, JSON documents, big integers and [`Value`] itself. Host types implementing
//! [`Class`] marshal as `Arc<Mutex<T>>`, reflected into script as class instances whose receiver is
//! the shared host object, so marshaling the same `Arc` twice yields the same script object.
//!
//! Values whose type is only known at runtime go through [`create_dyn`], which consults the
//! marshallers added with [`register_marshaller`].

pub mod class;
pub mod name;

use ahash::AHashMap;
use itertools::Itertools;
use num_bigint::BigInt;
use num_bigint::BigUint;
use num_bigint::Sign;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::any::Any;
use std::any::TypeId;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

pub use class::Class;
pub use class::ClassBuilder;
pub use class::ConstructorFn;

use crate::callback::FunctionArgs;
use crate::callback::HostFunction;
use crate::context::string;
use crate::value::duration_millis;
use crate::value::millis_to_time;
use crate::value::time_to_millis;
use crate::Context;
use crate::Error;
use crate::ExecutionContext;
use crate::Kind;
use crate::Value;

/// Host values that can be created in a script context.
pub trait ToJs {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error>;
}

/// Host values that can be read back from a script value.
pub trait FromJs: Sized {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error>;
}

/// Creates a value from a local built by `f` inside `context`.
pub(crate) fn immediate<F>(ec: &ExecutionContext, context: &Context, f: F) -> Result<Value, Error>
where
  F: for<'s> FnOnce(&mut v8::HandleScope<'s>) -> Result<v8::Local<'s, v8::Value>, Error> + Send,
{
  context.sync(ec, |scope, ctx| {
    let local = f(scope)?;
    Ok(ctx.value(scope, local))
  })
}

impl<T: ToJs + ?Sized> ToJs for &T {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    (**self).to_js(ec, context)
  }
}

impl<T: ToJs + ?Sized> ToJs for Box<T> {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    (**self).to_js(ec, context)
  }
}

impl ToJs for Value {
  fn to_js(&self, _ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    self.check_isolate(context.isolate())?;
    Ok(self.clone())
  }
}

impl FromJs for Value {
  fn from_js(_ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    Ok(value.clone())
  }
}

impl ToJs for () {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    context.undefined(ec)
  }
}

impl FromJs for () {
  fn from_js(_ec: &ExecutionContext, _value: &Value) -> Result<Self, Error> {
    Ok(())
  }
}

impl ToJs for bool {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    context.boolean(ec, *self)
  }
}

impl FromJs for bool {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    value.bool(ec)
  }
}

macro_rules! integers {
  ($($t:ty),* $(,)?) => {
    $(
      impl ToJs for $t {
        fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
          let n = *self as f64;
          immediate(ec, context, |scope| Ok(v8::Number::new(scope, n).into()))
        }
      }

      impl FromJs for $t {
        fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
          let n = value.int64(ec)?;
          <$t>::try_from(n).map_err(|_| Error::unmarshal::<$t>(format!("{n} is out of range")))
        }
      }
    )*
  };
}

integers!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl ToJs for f64 {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    let n = *self;
    immediate(ec, context, |scope| Ok(v8::Number::new(scope, n).into()))
  }
}

impl FromJs for f64 {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    value.float64(ec)
  }
}

impl ToJs for f32 {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    f64::from(*self).to_js(ec, context)
  }
}

impl FromJs for f32 {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    Ok(value.float64(ec)? as f32)
  }
}

impl ToJs for str {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    immediate(ec, context, |scope| Ok(string(scope, self)?.into()))
  }
}

impl ToJs for String {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    self.as_str().to_js(ec, context)
  }
}

impl FromJs for String {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    value.string_value(ec)
  }
}

/// Raw pointers marshal as their address, formatted like `{:p}`.
impl<T: ?Sized> ToJs for *const T {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    format!("{:p}", *self).to_js(ec, context)
  }
}

impl<T: ?Sized> ToJs for *mut T {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    format!("{:p}", *self).to_js(ec, context)
  }
}

/// `None` marshals as `null`; `null` and `undefined` read back as `None`.
impl<T: ToJs> ToJs for Option<T> {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    match self {
      Some(value) => value.to_js(ec, context),
      None => context.null(ec),
    }
  }
}

impl<T: FromJs> FromJs for Option<T> {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    if value.is_kind(Kind::NULLISH) {
      Ok(None)
    } else {
      T::from_js(ec, value).map(Some)
    }
  }
}

impl<T: ToJs> ToJs for [T] {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    let elements = self.iter().map(|e| e.to_js(ec, context)).collect::<Result<Vec<_>, _>>()?;
    context.new_array(ec, &elements)
  }
}

impl<T: ToJs> ToJs for Vec<T> {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    self.as_slice().to_js(ec, context)
  }
}

impl<T: FromJs> FromJs for Vec<T> {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    value.require_kind(Kind::OBJECT)?;
    let length = value.length(ec)?;
    let length = u32::try_from(length).map_err(|_| Error::unmarshal::<Self>(format!("invalid length {length}")))?;
    (0..length).map(|i| T::from_js(ec, &value.get_index(ec, i)?)).collect()
  }
}

/// Bytes that marshal as an `ArrayBuffer` rather than an array of numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Bytes(pub Vec<u8>);

impl From<Vec<u8>> for Bytes {
  fn from(bytes: Vec<u8>) -> Self {
    Bytes(bytes)
  }
}

impl From<&[u8]> for Bytes {
  fn from(bytes: &[u8]) -> Self {
    Bytes(bytes.to_vec())
  }
}

impl Deref for Bytes {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    &self.0
  }
}

impl ToJs for Bytes {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    let bytes = self.0.clone();
    immediate(ec, context, |scope| {
      let store = v8::ArrayBuffer::new_backing_store_from_vec(bytes).make_shared();
      Ok(v8::ArrayBuffer::with_backing_store(scope, &store).into())
    })
  }
}

impl FromJs for Bytes {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    value.bytes(ec).map(Bytes)
  }
}

fn object_from_entries<'a, T: ToJs + 'a>(
  ec: &ExecutionContext,
  context: &Context,
  entries: impl Iterator<Item = (&'a String, &'a T)>,
) -> Result<Value, Error> {
  let entries = entries
    .map(|(key, value)| Ok((key.clone(), value.to_js(ec, context)?)))
    .collect::<Result<Vec<_>, Error>>()?;
  context.new_object_with(ec, &entries)
}

fn entries_from_object<T: FromJs>(ec: &ExecutionContext, value: &Value) -> Result<Vec<(String, T)>, Error> {
  value.require_kind(Kind::OBJECT)?;
  value
    .keys(ec)?
    .into_iter()
    .map(|key| {
      let entry = T::from_js(ec, &value.get(ec, &key)?)?;
      Ok((key, entry))
    })
    .collect()
}

impl<T: ToJs> ToJs for BTreeMap<String, T> {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    object_from_entries(ec, context, self.iter())
  }
}

impl<T: FromJs> FromJs for BTreeMap<String, T> {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    Ok(entries_from_object(ec, value)?.into_iter().collect())
  }
}

/// Keys are set in sorted order.
impl<T: ToJs, S: BuildHasher> ToJs for HashMap<String, T, S> {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    object_from_entries(ec, context, self.iter().sorted_by(|a, b| a.0.cmp(b.0)))
  }
}

impl<T: FromJs, S: BuildHasher + Default> FromJs for HashMap<String, T, S> {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    Ok(entries_from_object(ec, value)?.into_iter().collect())
  }
}

impl ToJs for SystemTime {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    let millis = time_to_millis(*self);
    immediate(ec, context, |scope| {
      let date = v8::Date::new(scope, millis).ok_or_else(|| Error::marshal::<SystemTime>("date out of range"))?;
      Ok(date.into())
    })
  }
}

impl FromJs for SystemTime {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    if value.is_kind(Kind::DATE) {
      value.date(ec)
    } else {
      millis_to_time(value.float64(ec)?)
    }
  }
}

/// Durations marshal as a number of milliseconds.
impl ToJs for Duration {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    duration_millis(*self).to_js(ec, context)
  }
}

impl FromJs for Duration {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    let millis = value.float64(ec)?;
    if !millis.is_finite() || millis < 0.0 {
      return Err(Error::unmarshal::<Duration>(format!("{millis} is not a valid duration")));
    }
    Ok(Duration::from_secs_f64(millis / 1000.0))
  }
}

/// Script errors marshal back as the value that was thrown; anything else becomes a new `Error`
/// carrying the rendered message.
impl ToJs for Error {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    if let Some(value) = self.value() {
      if value.isolate().id() == context.isolate().id() {
        return Ok(value.clone());
      }
    }
    if let Error::Script(err) = self {
      return (**err).to_js(ec, context);
    }
    context.new_error(ec, &self.to_string())
  }
}

impl FromJs for Error {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    if let Some(host) = value.receiver(ec)? {
      if let Some(err) = host.downcast_ref::<Error>() {
        return Ok(err.clone());
      }
    }
    value.to_error(ec)
  }
}

impl ToJs for serde_json::Value {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    let text = serde_json::to_string(self).map_err(|e| Error::marshal::<serde_json::Value>(e.to_string()))?;
    context.parse_json(ec, &text)
  }
}

impl FromJs for serde_json::Value {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    let bytes = value.marshal_json(ec)?;
    serde_json::from_slice(&bytes).map_err(|e| Error::unmarshal::<serde_json::Value>(e.to_string()))
  }
}

impl ToJs for BigInt {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    let (sign, words) = self.to_u64_digits();
    immediate(ec, context, |scope| {
      let bigint = v8::BigInt::new_from_words(scope, sign == Sign::Minus, &words)
        .ok_or_else(|| Error::marshal::<BigInt>("too large for the engine"))?;
      Ok(bigint.into())
    })
  }
}

impl FromJs for BigInt {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    if !value.is_kind(Kind::BIG_INT) {
      return Ok(BigInt::from(value.int64(ec)?));
    }
    let (negative, bytes) = value.context().sync(ec, |scope, _| {
      let bigint = v8::Local::<v8::BigInt>::try_from(value.open(scope)).map_err(|e| Error::unmarshal::<BigInt>(e.to_string()))?;
      let mut words = vec![0u64; bigint.word_count()];
      let (negative, words) = bigint.to_words_array(&mut words);
      let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
      Ok((negative, bytes))
    })?;
    let sign = if negative { Sign::Minus } else { Sign::Plus };
    Ok(BigInt::from_biguint(sign, BigUint::from_bytes_le(&bytes)))
  }
}

/// A host function exposed to script, optionally named.
#[derive(Clone)]
pub struct Function {
  name: Option<String>,
  f: HostFunction,
}

impl Function {
  pub fn new(f: impl Fn(&FunctionArgs) -> Result<Value, Error> + Send + Sync + 'static) -> Function {
    Function { name: None, f: Arc::new(f) }
  }

  pub fn named(name: impl Into<String>, f: impl Fn(&FunctionArgs) -> Result<Value, Error> + Send + Sync + 'static) -> Function {
    Function {
      name: Some(name.into()),
      f: Arc::new(f),
    }
  }
}

impl ToJs for Function {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    Ok(context.function(ec, self.name.as_deref(), self.f.clone())?.0)
  }
}

/// A host constructor for `T`, exposed to script as its class.
pub struct Constructor<T> {
  f: ConstructorFn<T>,
}

impl<T: Class> Constructor<T> {
  pub fn new(f: impl Fn(&FunctionArgs) -> Result<T, Error> + Send + Sync + 'static) -> Constructor<T> {
    Constructor { f: Arc::new(f) }
  }
}

impl<T> Clone for Constructor<T> {
  fn clone(&self) -> Self {
    Constructor { f: self.f.clone() }
  }
}

impl<T: Class> ToJs for Constructor<T> {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    class::constructor::<T>(ec, context, self.f.clone())?.function(ec)
  }
}

impl<T: Class> ToJs for Arc<Mutex<T>> {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    class::instance(ec, context, self)
  }
}

impl<T: Class> FromJs for Arc<Mutex<T>> {
  fn from_js(ec: &ExecutionContext, value: &Value) -> Result<Self, Error> {
    class::unmarshal(ec, value)
  }
}

type Marshaller = Arc<dyn Fn(&ExecutionContext, &Context, &(dyn Any + Send + Sync)) -> Result<Value, Error> + Send + Sync>;

static MARSHALLERS: Lazy<RwLock<AHashMap<TypeId, Marshaller>>> = Lazy::new(|| RwLock::new(AHashMap::new()));

/// Teaches [`create_dyn`] how to marshal `T`. A later registration for the same type replaces the
/// earlier one.
pub fn register_marshaller<T: Any + Send + Sync>(
  f: impl Fn(&ExecutionContext, &Context, &T) -> Result<Value, Error> + Send + Sync + 'static,
) {
  let marshaller: Marshaller = Arc::new(move |ec: &ExecutionContext, context: &Context, value: &(dyn Any + Send + Sync)| {
    match value.downcast_ref::<T>() {
      Some(value) => f(ec, context, value),
      None => Err(Error::marshal::<T>("marshaller registered for a different type")),
    }
  });
  MARSHALLERS.write().insert(TypeId::of::<T>(), marshaller);
}

macro_rules! try_builtin {
  ($ec:expr, $context:expr, $value:expr, $($t:ty),* $(,)?) => {
    $(
      if let Some(value) = $value.downcast_ref::<$t>() {
        return value.to_js($ec, $context);
      }
    )*
  };
}

/// Marshals a value whose type is only known at runtime: registered marshallers first, then the
/// built-in conversions.
pub fn create_dyn(ec: &ExecutionContext, context: &Context, value: &(dyn Any + Send + Sync)) -> Result<Value, Error> {
  let marshaller = MARSHALLERS.read().get(&value.type_id()).cloned();
  if let Some(marshaller) = marshaller {
    return marshaller(ec, context, value);
  }
  try_builtin!(
    ec,
    context,
    value,
    Value,
    (),
    bool,
    i32,
    i64,
    u32,
    u64,
    usize,
    f64,
    String,
    &'static str,
    Bytes,
    Vec<String>,
    Vec<Value>,
    SystemTime,
    Duration,
    Error,
    serde_json::Value,
    BigInt,
    Function,
  );
  Err(Error::marshal::<dyn Any>("no marshaller registered for this type"))
}
