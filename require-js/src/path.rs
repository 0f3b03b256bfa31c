//! Slash-separated module paths, independent of the host platform's separator.

/// Whether `path` is rooted.
pub fn is_absolute(path: &str) -> bool {
  path.starts_with('/')
}

/// Whether `id` names a file relative to the requiring module.
pub fn is_relative(id: &str) -> bool {
  id == "." || id == ".." || id.starts_with("./") || id.starts_with("../")
}

/// Collapses `.`, `..` and repeated separators. Never climbs above the root.
pub fn normalize(path: &str) -> String {
  let absolute = is_absolute(path);
  let mut parts: Vec<&str> = Vec::new();
  for part in path.split('/') {
    match part {
      "" | "." => {}
      ".." => {
        if matches!(parts.last(), Some(last) if *last != "..") {
          parts.pop();
        } else if !absolute {
          parts.push("..");
        }
      }
      part => parts.push(part),
    }
  }
  let joined = parts.join("/");
  match (absolute, joined.is_empty()) {
    (true, _) => format!("/{joined}"),
    (false, true) => ".".to_string(),
    (false, false) => joined,
  }
}

pub fn join(base: &str, path: &str) -> String {
  if base.is_empty() {
    return normalize(path);
  }
  normalize(&format!("{base}/{path}"))
}

/// Everything before the last element, `/` for top-level paths and `.` without a separator.
pub fn dirname(path: &str) -> String {
  let path = normalize(path);
  match path.rfind('/') {
    Some(0) => "/".to_string(),
    Some(i) => path[..i].to_string(),
    None => ".".to_string(),
  }
}

/// The extension of the last element including its dot, or an empty string.
pub fn extname(path: &str) -> &str {
  let name = path.rsplit('/').next().unwrap_or(path);
  match name.rfind('.') {
    Some(0) | None => "",
    Some(i) => &name[i..],
  }
}

#[cfg(test)]
mod tests {
  use super::dirname;
  use super::extname;
  use super::is_relative;
  use super::join;
  use super::normalize;

  #[test]
  fn normalizes() {
    assert_eq!(normalize("/a//b/./c/../d"), "/a/b/d");
    assert_eq!(normalize("/../a"), "/a");
    assert_eq!(normalize("a/../../b"), "../b");
    assert_eq!(normalize("./"), ".");
    assert_eq!(normalize("/"), "/");
  }

  #[test]
  fn joins_and_splits() {
    assert_eq!(join("/app/src", "../lib/x.js"), "/app/lib/x.js");
    assert_eq!(join("/app", "./node_modules/@scope/pkg"), "/app/node_modules/@scope/pkg");
    assert_eq!(dirname("/app/src/x.js"), "/app/src");
    assert_eq!(dirname("/x.js"), "/");
    assert_eq!(dirname("module"), ".");
  }

  #[test]
  fn extensions() {
    assert_eq!(extname("/a/b.test.js"), ".js");
    assert_eq!(extname("/a/.hidden"), "");
    assert_eq!(extname("/a.dir/file"), "");
    assert_eq!(extname("data.json"), ".json");
  }

  #[test]
  fn relative_ids() {
    assert!(is_relative("./a"));
    assert!(is_relative(".."));
    assert!(!is_relative(".hidden"));
    assert!(!is_relative("pkg/sub"));
  }
}
