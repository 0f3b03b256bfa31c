use embed_js::Error;
use embed_js::Isolate;
use embed_js::Snapshot;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

mod common;

use common::fixture;

#[test]
fn runs_script() {
  let f = fixture();
  let result = f
    .context
    .run(
      &f.ec,
      "function fib(n) { return n < 2 ? n : fib(n - 1) + fib(n - 2); } fib(20)",
      "fib.js",
    )
    .unwrap();
  assert_eq!(result.int64(&f.ec).unwrap(), 6765);
}

#[test]
fn script_errors_carry_the_stack() {
  let f = fixture();
  let err = f
    .context
    .run(&f.ec, "function boom() { throw new Error('boom'); } boom();", "boom.js")
    .unwrap_err();
  let message = err.to_string();
  assert!(message.starts_with("Error: boom"), "{message}");
  assert!(message.contains("boom.js"), "{message}");
  assert!(err.value().is_some());
}

#[test]
fn sync_is_serial_across_threads() {
  let f = fixture();
  f.context.run(&f.ec, "var counter = 0;", "init.js").unwrap();
  let in_flight = AtomicUsize::new(0);
  let overlapped = AtomicBool::new(false);
  crossbeam_utils::thread::scope(|s| {
    for _ in 0..8 {
      s.spawn(|_| {
        let ec = f.isolate.execution_context();
        for _ in 0..25 {
          f.isolate
            .sync(&ec, |_| {
              if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                overlapped.store(true, Ordering::SeqCst);
              }
              in_flight.fetch_sub(1, Ordering::SeqCst);
              Ok(())
            })
            .unwrap();
          f.context.run(&ec, "counter++", "inc.js").unwrap();
        }
      });
    }
  })
  .unwrap();
  assert!(!overlapped.load(Ordering::SeqCst));
  let counter = f.context.run(&f.ec, "counter", "read.js").unwrap();
  assert_eq!(counter.int64(&f.ec).unwrap(), 200);
}

#[test]
fn host_functions_reenter_the_isolate() {
  let f = fixture();
  let double = f
    .context
    .create_function(&f.ec, Some("double"), |args| {
      // Runs on the isolate thread; evaluating more script must not deadlock.
      let n: i64 = args.arg_as(0)?;
      args.context.run(&args.ec, &format!("{n} * 2"), "nested.js")
    })
    .unwrap();
  f.context
    .global(&f.ec)
    .unwrap()
    .set(&f.ec, "double", &double)
    .unwrap();
  let result = f.context.run(&f.ec, "double(double(5))", "outer.js").unwrap();
  assert_eq!(result.int64(&f.ec).unwrap(), 20);
}

#[test]
fn terminate_is_idempotent() {
  let f = fixture();
  let hooks = Arc::new(AtomicUsize::new(0));
  let counted = hooks.clone();
  f.isolate.add_shutdown_hook(move |_| {
    counted.fetch_add(1, Ordering::SeqCst);
  });
  assert!(f.isolate.is_running());
  f.isolate.terminate();
  f.isolate.terminate();
  assert!(!f.isolate.is_running());
  assert_eq!(hooks.load(Ordering::SeqCst), 1);
  assert!(matches!(f.context.run(&f.ec, "1", "after.js"), Err(Error::Terminated)));
  assert!(matches!(f.isolate.new_context(&f.ec), Err(Error::Terminated)));
}

#[test]
fn values_outlive_termination() {
  let f = fixture();
  let object = f.context.run(&f.ec, "({ a: 1 })", "object.js").unwrap();
  f.isolate.terminate();
  assert!(matches!(object.get(&f.ec, "a"), Err(Error::Terminated)));
  drop(object);
}

#[test]
fn isolates_are_independent() {
  let a = fixture();
  let b = fixture();
  a.context.run(&a.ec, "var shared = 'a';", "a.js").unwrap();
  let missing = b.context.run(&b.ec, "typeof shared", "b.js").unwrap();
  assert_eq!(missing.string_value(&b.ec).unwrap(), "undefined");
  assert!(!Isolate::ptr_eq(&a.isolate, &b.isolate));
}

#[test]
fn heap_statistics_are_reported() {
  let f = fixture();
  let stats = f.isolate.heap_statistics(&f.ec).unwrap();
  assert!(stats.used_heap_size > 0);
  assert!(stats.heap_size_limit >= stats.used_heap_size);
  assert!(stats.number_of_native_contexts >= 1);
}

#[test]
fn isolate_and_context_data() {
  let f = fixture();
  f.isolate.set_data("name", Arc::new("isolate".to_string()));
  f.context.set_data("name", Arc::new(7u32));
  let name = f.isolate.data("name").unwrap();
  assert_eq!(name.downcast_ref::<String>().unwrap(), "isolate");
  let number = f.context.data("name").unwrap();
  assert_eq!(*number.downcast_ref::<u32>().unwrap(), 7);
  assert!(f.isolate.data("missing").is_none());
}

#[test]
fn contexts_are_tracked_until_released() {
  let f = fixture();
  let other = f.isolate.new_context(&f.ec).unwrap();
  assert_eq!(f.isolate.contexts().len(), 2);
  other.release();
  assert!(other.is_released());
  assert!(matches!(other.run(&f.ec, "1", "released.js"), Err(Error::ContextReleased)));
  assert_eq!(f.isolate.contexts().len(), 1);
}

#[test]
fn contexts_are_released_when_dropped() {
  let f = fixture();
  let other = f.isolate.new_context(&f.ec).unwrap();
  let id = other.id();
  {
    let twice = other
      .create_function(&f.ec, Some("twice"), |args| {
        let n = args.arg_as::<Option<i64>>(0)?.unwrap_or_default();
        args.context.create(&args.ec, &(n * 2))
      })
      .unwrap();
    other.global(&f.ec).unwrap().set(&f.ec, "twice", &twice).unwrap();
    let result = other.run(&f.ec, "twice(21)", "twice.js").unwrap();
    assert_eq!(result.int64(&f.ec).unwrap(), 42);
  }
  assert_eq!(f.isolate.contexts().len(), 2);
  drop(other);
  assert_eq!(f.isolate.contexts().len(), 1);
  assert!(f.isolate.contexts().iter().all(|c| c.id() != id));
}

#[test]
fn snapshots_cannot_be_authored() {
  assert!(Snapshot::create("var x = 1;").is_err());
  let imported = Snapshot::import(&[1, 2, 3]);
  assert_eq!(imported.export(), vec![1, 2, 3]);
  assert_eq!(imported.len(), 3);
}
