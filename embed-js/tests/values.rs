use embed_js::Bytes;
use embed_js::Error;
use embed_js::Kind;
use embed_js::PromiseState;
use embed_js::Value;
use num_bigint::BigInt;
use std::collections::BTreeMap;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

mod common;

use common::assert_text_eq;
use common::fixture;
use common::pretty_json;

#[test]
fn json_round_trip() {
  let f = fixture();
  let value = f.context.parse_json(&f.ec, r#"{"a":1,"b":[2,3]}"#).unwrap();
  assert!(value.is_kind(Kind::OBJECT));
  let json = String::from_utf8(value.marshal_json(&f.ec).unwrap()).unwrap();
  assert_text_eq(&pretty_json(r#"{"a":1,"b":[2,3]}"#), &pretty_json(&json));
}

#[test]
fn json_of_values_without_a_json_form_is_null() {
  let f = fixture();
  let undefined = f.context.undefined(&f.ec).unwrap();
  assert_eq!(undefined.marshal_json(&f.ec).unwrap(), b"null");
  let function = f.context.run(&f.ec, "(function () {})", "fn.js").unwrap();
  assert_eq!(function.marshal_json(&f.ec).unwrap(), b"null");
}

#[test]
fn primitives_round_trip() {
  let f = fixture();
  let (ec, ctx) = (&f.ec, &f.context);
  let n = ctx.create(ec, &42i32).unwrap();
  assert!(n.is_kind(Kind::NUMBER));
  assert_eq!(n.unmarshal::<i32>(ec).unwrap(), 42);
  let x = ctx.create(ec, &1.5f64).unwrap();
  assert_eq!(x.unmarshal::<f64>(ec).unwrap(), 1.5);
  let s = ctx.create(ec, &"héllo").unwrap();
  assert!(s.is_kind(Kind::STRING));
  assert_eq!(s.unmarshal::<String>(ec).unwrap(), "héllo");
  let b = ctx.create(ec, &true).unwrap();
  assert!(b.unmarshal::<bool>(ec).unwrap());
  let none: Option<u8> = None;
  let null = ctx.create(ec, &none).unwrap();
  assert!(null.is_kind(Kind::NULL));
  assert_eq!(null.unmarshal::<Option<u8>>(ec).unwrap(), None);
}

#[test]
fn integers_out_of_range_fail_to_unmarshal() {
  let f = fixture();
  let big = f.context.run(&f.ec, "300", "big.js").unwrap();
  assert!(matches!(big.unmarshal::<u8>(&f.ec), Err(Error::Unmarshal { .. })));
}

#[test]
fn bytes_become_array_buffers() {
  let f = fixture();
  let buffer = f.context.create(&f.ec, &Bytes(vec![1, 2, 3, 255])).unwrap();
  assert!(buffer.is_kind(Kind::ARRAY_BUFFER));
  assert_eq!(buffer.byte_length(&f.ec).unwrap(), 4);
  f.context
    .global(&f.ec)
    .unwrap()
    .set(&f.ec, "buf", &buffer)
    .unwrap();
  let sum = f
    .context
    .run(&f.ec, "new Uint8Array(buf).reduce((a, b) => a + b, 0)", "sum.js")
    .unwrap();
  assert_eq!(sum.int64(&f.ec).unwrap(), 261);
  let view = f.context.run(&f.ec, "new Uint8Array([9, 8, 7]).subarray(1)", "view.js").unwrap();
  assert_eq!(view.unmarshal::<Bytes>(&f.ec).unwrap().0, vec![8, 7]);
}

#[test]
fn collections_round_trip() {
  let f = fixture();
  let list = f.context.create(&f.ec, &vec![3u32, 1, 2]).unwrap();
  assert!(list.is_kind(Kind::ARRAY));
  assert_eq!(list.length(&f.ec).unwrap(), 3);
  assert_eq!(list.unmarshal::<Vec<u32>>(&f.ec).unwrap(), vec![3, 1, 2]);

  let mut map = BTreeMap::new();
  map.insert("b".to_string(), 2i64);
  map.insert("a".to_string(), 1i64);
  let object = f.context.create(&f.ec, &map).unwrap();
  assert_eq!(object.keys(&f.ec).unwrap(), vec!["a", "b"]);
  assert_eq!(object.unmarshal::<BTreeMap<String, i64>>(&f.ec).unwrap(), map);
}

#[test]
fn dates_and_durations() {
  let f = fixture();
  let time = UNIX_EPOCH + Duration::from_millis(1_600_000_000_123);
  let date = f.context.create(&f.ec, &time).unwrap();
  assert!(date.is_kind(Kind::DATE));
  assert_eq!(date.unmarshal::<SystemTime>(&f.ec).unwrap(), time);
  let iso = date.call_method(&f.ec, "toISOString", &[]).unwrap();
  assert_eq!(iso.string_value(&f.ec).unwrap(), "2020-09-13T12:26:40.123Z");

  let elapsed = f.context.create(&f.ec, &Duration::from_millis(1500)).unwrap();
  assert_eq!(elapsed.float64(&f.ec).unwrap(), 1500.0);
}

#[test]
fn big_integers_round_trip() {
  let f = fixture();
  let n: BigInt = "-123456789012345678901234567890".parse().unwrap();
  let value = f.context.create(&f.ec, &n).unwrap();
  assert!(value.is_kind(Kind::BIG_INT));
  assert_eq!(value.string_value(&f.ec).unwrap(), "-123456789012345678901234567890");
  assert_eq!(value.unmarshal::<BigInt>(&f.ec).unwrap(), n);
  let from_script = f.context.run(&f.ec, "2n ** 70n", "pow.js").unwrap();
  assert_eq!(
    from_script.unmarshal::<BigInt>(&f.ec).unwrap(),
    BigInt::from(1u128 << 70)
  );
}

#[test]
fn serde_json_values_round_trip() {
  let f = fixture();
  let json = serde_json::json!({ "name": "x", "tags": ["a", "b"], "n": 2.5, "nested": { "ok": true } });
  let value = f.context.create(&f.ec, &json).unwrap();
  let back: serde_json::Value = value.unmarshal(&f.ec).unwrap();
  assert_eq!(back, json);
}

#[test]
fn singletons_share_a_wrapper() {
  let f = fixture();
  let a = f.context.undefined(&f.ec).unwrap();
  let b = f.context.run(&f.ec, "undefined", "u.js").unwrap();
  assert!(Value::ptr_eq(&a, &b));
  let t = f.context.boolean(&f.ec, true).unwrap();
  let u = f.context.run(&f.ec, "1 === 1", "t.js").unwrap();
  assert!(Value::ptr_eq(&t, &u));
  let null = f.context.null(&f.ec).unwrap();
  assert!(!Value::ptr_eq(&a, &null));
}

#[test]
fn property_access() {
  let f = fixture();
  let object = f.context.new_object(&f.ec).unwrap();
  object.set(&f.ec, "answer", &42u32).unwrap();
  object.set_index(&f.ec, 0, &"zero").unwrap();
  assert_eq!(object.get(&f.ec, "answer").unwrap().int64(&f.ec).unwrap(), 42);
  assert_eq!(object.get_index(&f.ec, 0).unwrap().string_value(&f.ec).unwrap(), "zero");
  let mut keys = object.keys(&f.ec).unwrap();
  keys.sort();
  assert_eq!(keys, vec!["0", "answer"]);
  assert!(object.get(&f.ec, "missing").unwrap().is_kind(Kind::UNDEFINED));
}

#[test]
fn kind_mismatch_is_reported() {
  let f = fixture();
  let number = f.context.create(&f.ec, &1u8).unwrap();
  let err = number.bytes(&f.ec).unwrap_err();
  assert!(matches!(err, Error::Kind { .. }), "{err}");
  assert!(number.call(&f.ec, None, &[]).is_err());
}

#[test]
fn calls_and_construction() {
  let f = fixture();
  let add = f.context.run(&f.ec, "(function (a, b) { return a + b; })", "add.js").unwrap();
  let sum = add.call(&f.ec, None, &[&2u32, &3u32]).unwrap();
  assert_eq!(sum.int64(&f.ec).unwrap(), 5);
  let point = f
    .context
    .run(&f.ec, "(class Point { constructor(x) { this.x = x; } })", "point.js")
    .unwrap();
  let instance = point.new(&f.ec, &[&7u32]).unwrap();
  assert_eq!(instance.get(&f.ec, "x").unwrap().int64(&f.ec).unwrap(), 7);
  assert!(instance.instance_of(&f.ec, &point).unwrap());
}

#[test]
fn await_resolved_promise() {
  let f = fixture();
  let promise = f.context.run(&f.ec, "Promise.resolve(41).then(x => x + 1)", "p.js").unwrap();
  assert!(promise.is_kind(Kind::PROMISE));
  let value = promise.await_promise(&f.ec).unwrap();
  assert_eq!(value.int64(&f.ec).unwrap(), 42);
  let info = promise.promise_info(&f.ec).unwrap();
  assert_eq!(info.state, PromiseState::Fulfilled);
}

#[test]
fn await_rejected_promise() {
  let f = fixture();
  let promise = f
    .context
    .run(&f.ec, "Promise.reject(new Error('nope'))", "reject.js")
    .unwrap();
  let err = promise.await_promise(&f.ec).unwrap_err();
  let reason = err.value().unwrap();
  let stack = reason.get(&f.ec, "stack").unwrap().string_value(&f.ec).unwrap();
  assert_eq!(err.to_string(), stack);
  assert!(stack.starts_with("Error: nope"));
}

#[test]
fn await_pending_promise_settled_later() {
  let f = fixture();
  let promise = f
    .context
    .run(
      &f.ec,
      "var settle; new Promise(resolve => { settle = resolve; })",
      "pending.js",
    )
    .unwrap();
  assert_eq!(promise.promise_info(&f.ec).unwrap().state, PromiseState::Pending);
  let context = f.context.clone();
  f.isolate.background(&f.ec, move |ec| {
    std::thread::sleep(Duration::from_millis(20));
    context.run(ec, "settle('later')", "settle.js").unwrap();
  });
  let value = promise.await_promise(&f.ec).unwrap();
  assert_eq!(value.string_value(&f.ec).unwrap(), "later");
}

#[test]
fn await_on_the_isolate_thread_only_reads_settled_promises() {
  let f = fixture();
  let inspect = f
    .context
    .create_function(&f.ec, Some("inspect"), |args| {
      let promise = args.arg(0).cloned().ok_or_else(|| Error::msg("missing promise"))?;
      let outcome = match promise.await_promise(&args.ec) {
        Ok(value) => value.string_value(&args.ec)?,
        Err(err) => err.to_string(),
      };
      args.context.create(&args.ec, &outcome)
    })
    .unwrap();
  f.context.global(&f.ec).unwrap().set(&f.ec, "inspect", &inspect).unwrap();
  let settled = f.context.run(&f.ec, "inspect(Promise.resolve('done'))", "settled.js").unwrap();
  assert_eq!(settled.string_value(&f.ec).unwrap(), "done");
  let pending = f.context.run(&f.ec, "inspect(new Promise(() => {}))", "pending.js").unwrap();
  assert_eq!(
    pending.string_value(&f.ec).unwrap(),
    "cannot await a pending promise on its own isolate thread"
  );
}
