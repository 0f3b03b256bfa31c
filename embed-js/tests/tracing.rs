use embed_js::tracer;
use embed_js::tracer::RecordingTracer;
use embed_js::tracer::Resource;
use embed_js::Value;
use parking_lot::Mutex;
use std::sync::Arc;

mod common;

use common::fixture;

#[derive(Default)]
struct Point {
  x: i32,
}

impl embed_js::Class for Point {
  fn describe(class: &mut embed_js::ClassBuilder<Self>) {
    class.field("X", |p| &p.x, |p| &mut p.x);
  }

  fn zero() -> Option<Self> {
    Some(Point::default())
  }
}

// The tracer is process-wide, so everything runs in one test.
#[test]
fn handles_are_released_exactly_once() {
  let recording = Arc::new(RecordingTracer::new());
  tracer::set_tracer(recording.clone());

  let f = fixture();
  let context_id = f.context.id().0;
  {
    let object = f.context.run(&f.ec, "({ list: [1, 2, 3], nested: { ok: true } })", "object.js").unwrap();
    let list = object.get(&f.ec, "list").unwrap();
    let copy = list.clone();
    assert_eq!(copy.unmarshal::<Vec<u8>>(&f.ec).unwrap(), vec![1, 2, 3]);
    let point = Arc::new(Mutex::new(Point { x: 3 }));
    let a = f.context.create(&f.ec, &point).unwrap();
    let b = f.context.create(&f.ec, &point).unwrap();
    assert!(Value::ptr_eq(&a, &b));
    assert!(!recording.outstanding(Resource::Value).is_empty());
    let undefined = f.context.undefined(&f.ec).unwrap();
    drop(undefined);
  }
  assert!(recording
    .outstanding(Resource::Context)
    .iter()
    .any(|o| o.id == context_id));

  f.isolate.terminate();
  drop(f);

  tracer::clear_tracer();
  assert_eq!(recording.violations(), vec![]);
  assert!(recording.outstanding(Resource::Context).is_empty());
  let leaked = recording.outstanding(Resource::Value);
  assert!(leaked.is_empty(), "leaked values allocated at:\n{}", leaked[0].allocated);
}
