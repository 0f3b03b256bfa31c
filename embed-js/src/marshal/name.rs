/// Adapter prefixes that classify a host member as getter, setter or function.
const ADAPTER_PREFIXES: &[&str] = &["V8Get", "V8Set", "V8Func"];

/// Class name suffixes that carry no meaning in script.
const TRIMMED_SUFFIXES: &[&str] = &["Base", "Impl"];

/// The script name of a host member: adapter prefixes are stripped and the rest is camel-cased
/// word by word, each uppercase run folding into the word before it (`V8GetServerURL` becomes
/// `serverurl`, `V8GetHTTPServer` becomes `httpServer`).
pub fn js_name(name: &str) -> String {
  let name = ADAPTER_PREFIXES
    .iter()
    .find_map(|prefix| name.strip_prefix(prefix))
    .filter(|rest| !rest.is_empty())
    .unwrap_or(name);
  camel_case(name)
}

fn camel_case(name: &str) -> String {
  // Tokens start at the first character and before every later uppercase letter.
  let mut tokens: Vec<String> = Vec::new();
  for (i, c) in name.char_indices() {
    if i == 0 || c.is_uppercase() {
      tokens.push(String::new());
    }
    if let Some(token) = tokens.last_mut() {
      token.push(c);
    }
  }

  let mut words: Vec<String> = Vec::with_capacity(tokens.len());
  for token in tokens {
    let uppercase = !token.chars().any(char::is_lowercase);
    match words.last_mut() {
      Some(word) if uppercase => word.push_str(&token.to_lowercase()),
      _ => words.push(token.to_lowercase()),
    }
  }

  let mut out = String::with_capacity(name.len());
  for (i, word) in words.iter().enumerate() {
    let mut chars = word.chars();
    match chars.next() {
      Some(first) if i > 0 => {
        out.extend(first.to_uppercase());
        out.push_str(chars.as_str());
      }
      _ => out.push_str(word),
    }
  }
  out
}

/// The script class name for a Rust type name: module path and generic arguments are dropped, as
/// is a trailing `Base` or `Impl`.
pub fn class_name(type_name: &str) -> String {
  let base = type_name.split('<').next().unwrap_or(type_name);
  let base = base.rsplit("::").next().unwrap_or(base);
  TRIMMED_SUFFIXES
    .iter()
    .find_map(|suffix| base.strip_suffix(suffix))
    .filter(|rest| !rest.is_empty())
    .unwrap_or(base)
    .to_string()
}

#[cfg(test)]
mod tests {
  use super::class_name;
  use super::js_name;

  #[test]
  fn strips_adapter_prefixes() {
    assert_eq!(js_name("V8GetName"), "name");
    assert_eq!(js_name("V8SetName"), "name");
    assert_eq!(js_name("V8FuncIncrement"), "increment");
    assert_eq!(js_name("V8Get"), "v8Get");
  }

  #[test]
  fn folds_uppercase_runs() {
    assert_eq!(js_name("V8GetHTTPServer"), "httpServer");
    assert_eq!(js_name("ID"), "id");
    assert_eq!(js_name("URLs"), "urLs");
    assert_eq!(js_name("value"), "value");
    assert_eq!(js_name("readFileSync"), "readFileSync");
    assert_eq!(js_name("_preloadModules"), "_preloadModules");
  }

  #[test]
  fn folds_inner_acronyms_into_the_previous_word() {
    assert_eq!(js_name("UserID"), "userid");
    assert_eq!(js_name("V8GetServerURL"), "serverurl");
    assert_eq!(js_name("V8FuncParseJSONBody"), "parsejsonBody");
    assert_eq!(js_name("V8SetMaxRetries"), "maxRetries");
  }

  #[test]
  fn derives_class_names() {
    assert_eq!(class_name("app::model::Counter"), "Counter");
    assert_eq!(class_name("app::model::ThingImpl"), "Thing");
    assert_eq!(class_name("app::model::NodeBase<u8>"), "Node");
    assert_eq!(class_name("Base"), "Base");
  }
}
