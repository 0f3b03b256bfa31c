//! Embed V8 isolates in a Rust host and expose host values, functions and classes to script.
//!
//! The crate is organized around a handful of handles:
//! - [`Isolate`]: one engine instance, driven by its own serial executor thread
//! - [`Context`]: a global environment inside an isolate
//! - [`Value`]: a host-side reference to a script value
//! - [`ExecutionContext`]: the host frame of one call chain, passed explicitly to every operation
//!
//! # Serial execution
//!
//! Every engine operation runs through [`Isolate::sync`]. Calls from other threads are queued and
//! run one at a time on the isolate's executor; calls made on the executor itself (a host function
//! invoked by script calling back into the engine) run inline. Different isolates are independent
//! and can be driven concurrently.
//!
//! # Marshaling
//!
//! [`ToJs`] and [`FromJs`] convert between host and script values. Host types implementing
//! [`Class`] are reflected as script classes: an `Arc<Mutex<T>>` becomes an instance whose
//! accessors and methods operate on the shared host object, and marshaling the same `Arc` into the
//! same context twice yields the same script object.
//!
//! # Callbacks
//!
//! Host functions are registered per context and identified by a [`CallbackId`]. When script calls
//! one, the id leads back through the process-wide [`Directory`] to the isolate, the context and
//! the execution context that was active. Errors returned by host functions are thrown into script;
//! panics are caught at the boundary and thrown as errors too.

mod callback;
mod context;
mod directory;
mod error;
mod execution_context;
mod handle;
mod inspector;
mod isolate;
mod kind;
pub mod marshal;
mod platform;
mod promise;
mod refs;
mod scope;
mod template;
pub mod tracer;
mod value;

pub use crate::callback::CallerInfo;
pub use crate::callback::FunctionArgs;
pub use crate::callback::GetterArgs;
pub use crate::callback::GetterFn;
pub use crate::callback::HostFunction;
pub use crate::callback::SetterArgs;
pub use crate::callback::SetterFn;
pub use crate::context::Context;
pub use crate::directory::Directory;
pub use crate::error::Error;
pub use crate::error::JsError;
pub use crate::error::ScriptError;
pub use crate::execution_context::ExecutionContext;
pub use crate::inspector::Inspector;
pub use crate::inspector::InspectorClient;
pub use crate::isolate::DynamicImport;
pub use crate::isolate::DynamicImportHandler;
pub use crate::isolate::HeapStatistics;
pub use crate::isolate::Isolate;
pub use crate::isolate::IsolateOptions;
pub use crate::isolate::ModuleRecord;
pub use crate::isolate::Snapshot;
pub use crate::kind::Kind;
pub use crate::marshal::register_marshaller;
pub use crate::marshal::Bytes;
pub use crate::marshal::Class;
pub use crate::marshal::ClassBuilder;
pub use crate::marshal::Constructor;
pub use crate::marshal::FromJs;
pub use crate::marshal::Function;
pub use crate::marshal::ToJs;
pub use crate::platform::flags;
pub use crate::platform::set_flags;
pub use crate::promise::Resolver;
pub use crate::refs::CallbackId;
pub use crate::refs::RefId;
pub use crate::refs::RefKey;
pub use crate::refs::RefTable;
pub use crate::refs::WeakRefTable;
pub use crate::template::FunctionTemplate;
pub use crate::template::ObjectTemplate;
pub use crate::value::PromiseInfo;
pub use crate::value::PromiseState;
pub use crate::value::PropertyDescriptor;
pub use crate::value::StoredValue;
pub use crate::value::Value;
