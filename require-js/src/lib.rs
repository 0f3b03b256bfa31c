//! CommonJS modules for [`embed_js`] contexts.
//!
//! [`create_require`] builds a `require` function over a [`ModuleFs`]. Modules are resolved the
//! way Node resolves them (extension probing, `index` files, `node_modules` lookup and
//! `package.json` `exports`/`main`), evaluated once per tree and cached by filename. Ids
//! registered in a [`Registry`] resolve to host-provided runtimes instead; `module` and `vm` are
//! built in.
//!
//! Loading goes through script-visible hooks: `require.extensions[ext](module, filename)` reads
//! the file through `module.fs` and calls `module._compile`, so script can replace loaders.

mod error;
pub mod fs;
mod module;
pub mod path;
mod registry;
mod require;
mod resolve;
mod runtime;

pub use crate::error::RequireError;
pub use crate::fs::MemoryFs;
pub use crate::fs::ModuleFs;
pub use crate::fs::RealFs;
pub use crate::module::Module;
pub use crate::registry::register_runtime;
pub use crate::registry::register_runtime_library;
pub use crate::registry::Registry;
pub use crate::registry::Runtime;
pub use crate::registry::RuntimeFactory;
pub use crate::require::create_require;
pub use crate::require::ModuleCache;
pub use crate::require::RequireOptions;
pub use crate::resolve::Resolved;
pub use crate::resolve::Resolver;
pub use crate::runtime::run_with_runtime;
pub use crate::runtime::RuntimeArgs;
