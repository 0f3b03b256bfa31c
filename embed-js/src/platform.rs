use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Once;

static INIT: Once = Once::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static EXPOSE_GC: AtomicBool = AtomicBool::new(false);
static FLAGS: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Passes command-line style flags to the engine (e.g. `--expose-gc --max-old-space-size=64`).
///
/// Flags should be set before the first isolate is created; later calls still reach the engine
/// but most flags are only read during initialization.
pub fn set_flags(flags: &str) {
  if flags.split_whitespace().any(|f| f == "--expose-gc" || f == "--expose_gc") {
    EXPOSE_GC.store(true, Ordering::Relaxed);
  }
  if INITIALIZED.load(Ordering::Acquire) {
    tracing::warn!(flags, "engine flags set after initialization");
  }
  FLAGS.lock().push(flags.to_string());
  v8::V8::set_flags_from_string(flags);
}

/// The flags passed to [`set_flags`] so far, in order.
pub fn flags() -> Vec<String> {
  FLAGS.lock().clone()
}

pub(crate) fn gc_exposed() -> bool {
  EXPOSE_GC.load(Ordering::Relaxed)
}

pub(crate) fn initialize() {
  INIT.call_once(|| {
    let platform = v8::new_default_platform(0, false).make_shared();
    v8::V8::initialize_platform(platform);
    v8::V8::initialize();
    INITIALIZED.store(true, Ordering::Release);
    tracing::debug!(version = v8::V8::get_version(), "engine initialized");
  });
}
