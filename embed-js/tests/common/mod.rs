#![allow(dead_code)]

use embed_js::Context;
use embed_js::ExecutionContext;
use embed_js::Isolate;
use similar::ChangeTag;
use similar::TextDiff;

pub struct Fixture {
  pub context: Context,
  pub ec: ExecutionContext,
  pub isolate: Isolate,
}

pub fn fixture() -> Fixture {
  let isolate = Isolate::new().unwrap();
  let ec = isolate.execution_context();
  let context = isolate.new_context(&ec).unwrap();
  Fixture { context, ec, isolate }
}

/// Asserts two multi-line texts are equal, printing a line diff when they are not.
pub fn assert_text_eq(expected: &str, actual: &str) {
  if expected == actual {
    return;
  }
  let mut msg = String::from("texts differ:\n");
  let diff = TextDiff::from_lines(expected, actual);
  for change in diff.iter_all_changes() {
    let sign = match change.tag() {
      ChangeTag::Delete => "-",
      ChangeTag::Insert => "+",
      ChangeTag::Equal => " ",
    };
    msg.push_str(sign);
    msg.push_str(&change.to_string());
  }
  panic!("{}", msg);
}

/// Pretty-prints JSON so diffs are per property.
pub fn pretty_json(text: &str) -> String {
  let value: serde_json::Value = serde_json::from_str(text).unwrap();
  serde_json::to_string_pretty(&value).unwrap() + "\n"
}
