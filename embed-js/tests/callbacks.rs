use embed_js::Context;
use embed_js::Error;
use embed_js::ExecutionContext;
use embed_js::Function;
use embed_js::FunctionArgs;
use embed_js::GetterArgs;
use embed_js::ObjectTemplate;
use embed_js::SetterArgs;
use embed_js::ToJs;
use embed_js::Value;
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

mod common;

use common::fixture;

#[test]
fn host_errors_are_thrown_into_script() {
  let f = fixture();
  let fail = f
    .context
    .create_function(&f.ec, Some("fail"), |_args| Err(Error::msg("host says no")))
    .unwrap();
  f.context.global(&f.ec).unwrap().set(&f.ec, "fail", &fail).unwrap();
  let caught = f
    .context
    .run(&f.ec, "try { fail(); } catch (e) { (e instanceof Error) + ':' + e.message }", "fail.js")
    .unwrap();
  assert_eq!(caught.string_value(&f.ec).unwrap(), "true:host says no");

  let err = f.context.run(&f.ec, "fail()", "uncaught.js").unwrap_err();
  assert!(err.to_string().contains("host says no"), "{err}");
}

#[derive(Debug)]
struct QuotaExceeded {
  limit: u32,
}

impl std::fmt::Display for QuotaExceeded {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "quota of {} exceeded", self.limit)
  }
}

impl std::error::Error for QuotaExceeded {}

impl ToJs for QuotaExceeded {
  fn to_js(&self, ec: &ExecutionContext, context: &Context) -> Result<Value, Error> {
    let err = context.new_error(ec, &self.to_string())?;
    err.set(ec, "code", &"E_QUOTA")?;
    err.set(ec, "limit", &self.limit)?;
    Ok(err)
  }
}

#[test]
fn host_errors_keep_their_script_shape() {
  let f = fixture();
  let reserve = f
    .context
    .create_function(&f.ec, Some("reserve"), |_args| Err(Error::script(QuotaExceeded { limit: 3 })))
    .unwrap();
  f.context.global(&f.ec).unwrap().set(&f.ec, "reserve", &reserve).unwrap();
  let caught = f
    .context
    .run(
      &f.ec,
      "try { reserve(); } catch (e) { [e instanceof Error, e.code, e.limit, e.message].join() }",
      "reserve.js",
    )
    .unwrap();
  assert_eq!(caught.string_value(&f.ec).unwrap(), "true,E_QUOTA,3,quota of 3 exceeded");
}

#[test]
fn script_errors_pass_through_host_functions_unchanged() {
  let f = fixture();
  let relay = f
    .context
    .create_function(&f.ec, Some("relay"), |args| {
      let callback = args.arg(0).cloned().ok_or_else(|| Error::msg("missing callback"))?;
      callback.call(&args.ec, None, &[])
    })
    .unwrap();
  f.context.global(&f.ec).unwrap().set(&f.ec, "relay", &relay).unwrap();
  let same = f
    .context
    .run(
      &f.ec,
      "const thrown = new TypeError('inner'); try { relay(() => { throw thrown; }); } catch (e) { e === thrown }",
      "relay.js",
    )
    .unwrap();
  assert!(same.bool(&f.ec).unwrap());
}

#[test]
fn panics_are_caught_at_the_boundary() {
  let f = fixture();
  let explode = Function::named("explode", |_args| panic!("kaboom"));
  f.context.global(&f.ec).unwrap().set(&f.ec, "explode", &explode).unwrap();
  let message = f
    .context
    .run(&f.ec, "try { explode(); 'survived' } catch (e) { e.message }", "panic.js")
    .unwrap();
  assert_eq!(message.string_value(&f.ec).unwrap(), "panic: kaboom");
  let after = f.context.run(&f.ec, "1 + 1", "after.js").unwrap();
  assert_eq!(after.int64(&f.ec).unwrap(), 2);
}

#[test]
fn callers_are_reported() {
  let f = fixture();
  let seen = Arc::new(Mutex::new(None));
  let record = seen.clone();
  let who_called = f
    .context
    .create_function(&f.ec, Some("whoCalled"), move |args| {
      *record.lock() = args.caller.clone();
      args.context.undefined(&args.ec)
    })
    .unwrap();
  f.context.global(&f.ec).unwrap().set(&f.ec, "whoCalled", &who_called).unwrap();
  f.context
    .run(&f.ec, "function outer() {\n  whoCalled();\n}\nouter();", "caller.js")
    .unwrap();
  let caller = seen.lock().clone().unwrap();
  assert_eq!(caller.function, "outer");
  assert_eq!(caller.file, "caller.js");
  assert_eq!(caller.line, 2);
}

#[test]
fn host_calls_share_the_execution_context() {
  let f = fixture();
  let outer = f.ec.clone();
  let same = Arc::new(Mutex::new(false));
  let record = same.clone();
  let check = f
    .context
    .create_function(&f.ec, Some("check"), move |args| {
      *record.lock() = ExecutionContext::ptr_eq(&args.ec, &outer) && args.ec.is_entered();
      args.context.undefined(&args.ec)
    })
    .unwrap();
  f.context.global(&f.ec).unwrap().set(&f.ec, "check", &check).unwrap();
  f.context.run(&f.ec, "check()", "ec.js").unwrap();
  assert!(*same.lock());
  assert!(!f.ec.is_entered());
}

#[test]
fn deferred_releases_run_when_the_call_ends() {
  let f = fixture();
  let log = Arc::new(Mutex::new(Vec::new()));
  let inner_log = log.clone();
  let defer = f
    .context
    .create_function(&f.ec, Some("defer"), move |args| {
      let first = inner_log.clone();
      let second = inner_log.clone();
      args.ec.defer_release(move || first.lock().push("first"));
      args.ec.defer_release(move || second.lock().push("second"));
      inner_log.lock().push("call");
      args.context.undefined(&args.ec)
    })
    .unwrap();
  f.context.global(&f.ec).unwrap().set(&f.ec, "defer", &defer).unwrap();
  f.context.run(&f.ec, "defer()", "defer.js").unwrap();
  assert_eq!(*log.lock(), vec!["call", "second", "first"]);
}

#[test]
fn resolver_settled_from_a_background_task() {
  let f = fixture();
  let resolver = f.context.new_resolver(&f.ec).unwrap();
  let promise = resolver.promise(&f.ec).unwrap();
  let settle = resolver.clone();
  f.isolate.background(&f.ec, move |ec| {
    std::thread::sleep(Duration::from_millis(10));
    settle.resolve(ec, &"hello").unwrap();
  });
  let value = promise.await_promise(&f.ec).unwrap();
  assert_eq!(value.string_value(&f.ec).unwrap(), "hello");
  // The resolver always hands out the same promise.
  let again = resolver.promise(&f.ec).unwrap();
  assert!(again.strict_equals(&f.ec, &promise).unwrap());
}

#[test]
fn rejected_resolver_surfaces_as_error() {
  let f = fixture();
  let resolver = f.context.new_resolver(&f.ec).unwrap();
  let reason = f.context.new_error(&f.ec, "rejected on purpose").unwrap();
  resolver.reject_value(&f.ec, &reason).unwrap();
  let err = resolver.promise(&f.ec).unwrap().await_promise(&f.ec).unwrap_err();
  assert!(err.to_string().starts_with("Error: rejected on purpose"), "{err}");
}

#[test]
fn resolver_outcome_forwards_to_a_node_style_callback() {
  let f = fixture();
  f.context
    .run(&f.ec, "var outcome; function done(err, value) { outcome = [err, value]; }", "cb.js")
    .unwrap();
  let done = f.context.run(&f.ec, "done", "done.js").unwrap();

  let ok = f.context.new_resolver(&f.ec).unwrap();
  ok.to_callback(&f.ec, &done).unwrap();
  ok.resolve(&f.ec, &7u32).unwrap();
  let outcome = f.context.run(&f.ec, "JSON.stringify(outcome)", "read.js").unwrap();
  assert_eq!(outcome.string_value(&f.ec).unwrap(), "[null,7]");

  let failed = f.context.new_resolver(&f.ec).unwrap();
  failed.to_callback(&f.ec, &done).unwrap();
  failed.reject(&f.ec, &"bad").unwrap();
  let outcome = f.context.run(&f.ec, "JSON.stringify(outcome)", "read.js").unwrap();
  assert_eq!(outcome.string_value(&f.ec).unwrap(), "[\"bad\",null]");
}

#[test]
fn microtasks_run_after_the_current_job() {
  let f = fixture();
  let (tx, rx) = mpsc::channel();
  let tx = Arc::new(Mutex::new(Some(tx)));
  let (before, _, _) = f.context.registrations();
  let schedule = f
    .context
    .create_function(&f.ec, Some("schedule"), move |args| {
      let Some(tx) = tx.lock().take() else {
        return args.context.undefined(&args.ec);
      };
      args.context.add_microtask(&args.ec, move |args| {
        let marker = args
          .context
          .run(&args.ec, "globalThis.marker", "marker.js")
          .and_then(|value| value.string_value(&args.ec));
        let _ = tx.send(marker.map_err(|err| err.to_string()));
      })?;
      args.context.undefined(&args.ec)
    })
    .unwrap();
  f.context.global(&f.ec).unwrap().set(&f.ec, "schedule", &schedule).unwrap();
  f.context
    .run(&f.ec, "schedule(); globalThis.marker = 'set'", "schedule.js")
    .unwrap();
  let marker = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
  assert_eq!(marker, "set");
  // The microtask's function releases itself once run.
  let (after, _, _) = f.context.registrations();
  assert_eq!(after, before + 1);
}

#[test]
fn object_templates_install_accessors_and_methods() {
  let f = fixture();
  let template = ObjectTemplate::new(&f.ec, &f.context).unwrap();
  let stored = Arc::new(Mutex::new(String::from("initial")));
  let read = stored.clone();
  let write = stored.clone();
  template
    .set_accessor(
      &f.ec,
      "label",
      Some(Arc::new(move |args: &GetterArgs| args.context.create(&args.ec, &*read.lock()))),
      Some(Arc::new(move |args: &SetterArgs| {
        *write.lock() = args.value.string_value(&args.ec)?;
        Ok(())
      })),
    )
    .unwrap();
  template
    .set_accessor(&f.ec, "fixed", Some(Arc::new(|args: &GetterArgs| args.context.create(&args.ec, &args.key))), None)
    .unwrap();
  template
    .set_method(&f.ec, "twice", Arc::new(|args: &FunctionArgs| {
      let n: i64 = args.arg_as(0)?;
      args.context.create(&args.ec, &(n * 2))
    }))
    .unwrap();
  let object = template.new_instance(&f.ec).unwrap();
  f.context.global(&f.ec).unwrap().set(&f.ec, "o", &object).unwrap();
  let result = f
    .context
    .run(&f.ec, "o.label = 'changed'; [o.label, o.fixed, o.twice(21)].join()", "template.js")
    .unwrap();
  assert_eq!(result.string_value(&f.ec).unwrap(), "changed,fixed,42");
  assert_eq!(*stored.lock(), "changed");

  let copy = ObjectTemplate::new(&f.ec, &f.context).unwrap();
  copy.copy(&f.ec, &template).unwrap();
  let other = copy.new_instance(&f.ec).unwrap();
  assert_eq!(other.call_method(&f.ec, "twice", &[&5u32]).unwrap().int64(&f.ec).unwrap(), 10);
}
