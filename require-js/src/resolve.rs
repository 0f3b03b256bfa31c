//! Maps a module id, as passed to `require`, to the file or runtime that implements it.
//!
//! Relative and absolute ids are probed with each registered extension, then as a file, then as
//! a directory (its `package.json`, then `index`). Bare ids are looked up in `node_modules`
//! directories from the requiring directory up to the root, honoring the package's `exports` map
//! under the configured conditions and falling back to `main`.

use serde_json::Value as Json;

use crate::error::RequireError;
use crate::fs::read_to_string;
use crate::fs::ModuleFs;
use crate::path;
use crate::registry::Registry;
use crate::registry::Runtime;

pub enum Resolved {
  Runtime(Vec<Runtime>),
  File(String),
}

pub struct Resolver<'a> {
  pub fs: &'a dyn ModuleFs,
  pub registry: &'a Registry,
  /// Probed in order when an id names a file without its extension.
  pub extensions: &'a [String],
  /// Tried in order when an `exports` target is a condition map.
  pub conditions: &'a [String],
}

impl<'a> Resolver<'a> {
  pub fn resolve(&self, id: &str, dir: &str) -> Result<Resolved, RequireError> {
    if let Some(runtimes) = self.registry.get(id) {
      tracing::trace!(id, "resolved to runtime");
      return Ok(Resolved::Runtime(runtimes));
    }
    let found = if path::is_relative(id) {
      self.resolve_path(&path::join(dir, id))?
    } else if path::is_absolute(id) {
      self.resolve_path(id)?
    } else {
      self.resolve_bare(id, dir)?
    };
    match found {
      Some(file) => {
        tracing::trace!(id, dir, %file, "resolved");
        Ok(Resolved::File(file))
      }
      None => Err(RequireError::not_resolved(id, dir)),
    }
  }

  fn is_file(&self, path: &str) -> bool {
    self.fs.stat(path).map(|m| m.is_file()).unwrap_or(false)
  }

  fn is_dir(&self, path: &str) -> bool {
    self.fs.stat(path).map(|m| m.is_dir()).unwrap_or(false)
  }

  fn resolve_path(&self, file: &str) -> Result<Option<String>, RequireError> {
    let file = path::normalize(file);
    for ext in self.extensions {
      let candidate = format!("{file}{ext}");
      if self.is_file(&candidate) {
        return Ok(Some(candidate));
      }
    }
    match self.fs.stat(&file) {
      Ok(metadata) if metadata.is_dir() => {
        if let Some(found) = self.resolve_package(&file, ".")? {
          return Ok(Some(found));
        }
        self.resolve_path(&path::join(&file, "index"))
      }
      Ok(_) => Ok(Some(file)),
      Err(_) => Ok(None),
    }
  }

  fn resolve_bare(&self, id: &str, dir: &str) -> Result<Option<String>, RequireError> {
    let (name, rest) = split_package(id);
    let package_path = if rest.is_empty() {
      ".".to_string()
    } else {
      format!("./{rest}")
    };
    let mut current = path::normalize(dir);
    loop {
      let package_dir = path::join(&path::join(&current, "node_modules"), name);
      if self.is_dir(&package_dir) {
        if let Some(found) = self.resolve_package(&package_dir, &package_path)? {
          return Ok(Some(found));
        }
        if let Some(found) = self.resolve_path(&path::join(&package_dir, rest))? {
          return Ok(Some(found));
        }
      }
      if current == "/" || current == "." {
        return Ok(None);
      }
      current = path::dirname(&current);
    }
  }

  /// Resolves `package_path` (`.` or `./sub/path`) inside the package rooted at `dir`.
  fn resolve_package(&self, dir: &str, package_path: &str) -> Result<Option<String>, RequireError> {
    let manifest_path = path::join(dir, "package.json");
    if !self.is_file(&manifest_path) {
      return Ok(None);
    }
    let text = read_to_string(self.fs, &manifest_path)?;
    let manifest: Json = serde_json::from_str(&text).map_err(|source| RequireError::Json {
      path: manifest_path.clone(),
      source,
    })?;

    if let Some(target) = manifest.get("exports").and_then(|e| exports_target(e, package_path)) {
      if let Some(found) = self.package_target(dir, target)? {
        return Ok(Some(found));
      }
    }
    if package_path == "." {
      if let Some(main) = manifest.get("main").and_then(Json::as_str) {
        if let Some(found) = self.with_extension(&path::join(dir, main), true)? {
          return Ok(Some(found));
        }
      }
      return self.with_extension(&path::join(dir, "index"), true);
    }
    self.with_extension(&path::join(dir, package_path), true)
  }

  fn package_target(&self, dir: &str, target: &Json) -> Result<Option<String>, RequireError> {
    match target {
      Json::String(file) => self.with_extension(&path::join(dir, file), true),
      Json::Array(files) => {
        for file in files {
          if let Some(found) = self.package_target(dir, file)? {
            return Ok(Some(found));
          }
        }
        Ok(None)
      }
      Json::Object(conditions) => {
        for condition in self.conditions {
          if let Some(target) = conditions.get(condition) {
            if let Some(found) = self.package_target(dir, target)? {
              return Ok(Some(found));
            }
          }
        }
        Ok(None)
      }
      _ => Ok(None),
    }
  }

  /// `file` itself, its `index` when it is a directory, or with an extension appended when it
  /// does not exist and `probe` is set.
  fn with_extension(&self, file: &str, probe: bool) -> Result<Option<String>, RequireError> {
    match self.fs.stat(file) {
      Ok(metadata) if metadata.is_file() => Ok(Some(path::normalize(file))),
      Ok(_) => self.with_extension(&path::join(file, "index"), true),
      Err(_) if probe => {
        for ext in self.extensions {
          if let Some(found) = self.with_extension(&format!("{file}{ext}"), false)? {
            return Ok(Some(found));
          }
        }
        Ok(None)
      }
      Err(_) => Ok(None),
    }
  }
}

/// Splits `@scope/name/rest` or `name/rest` into the package name and the rest.
fn split_package(id: &str) -> (&str, &str) {
  let segments = if id.starts_with('@') { 2 } else { 1 };
  let mut end = 0;
  for _ in 0..segments {
    match id[end..].find('/') {
      Some(i) => end += i + 1,
      None => return (id, ""),
    }
  }
  (&id[..end - 1], &id[end..])
}

/// The `exports` entry for `package_path`. A string, an array or a map without `.` keys is
/// shorthand for the `.` entry.
fn exports_target<'j>(exports: &'j Json, package_path: &str) -> Option<&'j Json> {
  match exports {
    Json::Object(map) if map.keys().all(|k| !k.starts_with('.')) => (package_path == ".").then_some(exports),
    Json::Object(map) => map
      .iter()
      .find(|(key, _)| key.trim_end_matches('/') == package_path)
      .map(|(_, target)| target),
    Json::String(_) | Json::Array(_) => (package_path == ".").then_some(exports),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::split_package;
  use super::Resolved;
  use super::Resolver;
  use crate::error::RequireError;
  use crate::fs::MemoryFs;
  use crate::registry::Registry;

  fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
  }

  fn resolve(fs: &MemoryFs, conditions: &[&str], id: &str, dir: &str) -> Result<String, RequireError> {
    let registry = Registry::with_builtins();
    let extensions = strings(&[".js", ".cjs", ".json"]);
    let conditions = strings(conditions);
    let resolver = Resolver {
      fs,
      registry: &registry,
      extensions: &extensions,
      conditions: &conditions,
    };
    match resolver.resolve(id, dir)? {
      Resolved::File(file) => Ok(file),
      Resolved::Runtime(runtimes) => Ok(format!("runtime:{}", runtimes.len())),
    }
  }

  #[test]
  fn splits_package_names() {
    assert_eq!(split_package("pkg"), ("pkg", ""));
    assert_eq!(split_package("pkg/a/b"), ("pkg", "a/b"));
    assert_eq!(split_package("@scope/pkg"), ("@scope/pkg", ""));
    assert_eq!(split_package("@scope/pkg/sub"), ("@scope/pkg", "sub"));
  }

  #[test]
  fn relative_ids_probe_extensions_then_index() {
    let fs = MemoryFs::new()
      .with_file("/app/a.js", "")
      .with_file("/app/lib/index.cjs", "")
      .with_file("/app/data.json", "{}")
      .with_file("/app/raw.txt", "");
    assert_eq!(resolve(&fs, &[], "./a", "/app").unwrap(), "/app/a.js");
    assert_eq!(resolve(&fs, &[], "./a.js", "/app").unwrap(), "/app/a.js");
    assert_eq!(resolve(&fs, &[], "./lib", "/app").unwrap(), "/app/lib/index.cjs");
    assert_eq!(resolve(&fs, &[], "../app/data", "/app/lib").unwrap(), "/app/data.json");
    assert_eq!(resolve(&fs, &[], "/app/raw.txt", "/").unwrap(), "/app/raw.txt");
    let err = resolve(&fs, &[], "./missing", "/app").unwrap_err();
    assert_eq!(err.to_string(), "unable to resolve: ./missing in /app");
  }

  #[test]
  fn runtimes_win_over_files() {
    let fs = MemoryFs::new().with_file("/app/node_modules/module/index.js", "");
    assert_eq!(resolve(&fs, &[], "module", "/app").unwrap(), "runtime:1");
  }

  #[test]
  fn bare_ids_walk_up_node_modules() {
    let fs = MemoryFs::new()
      .with_file("/node_modules/top/index.js", "")
      .with_file("/app/node_modules/near/main.js", "")
      .with_file("/app/node_modules/near/package.json", r#"{"main": "./main"}"#)
      .with_file("/app/node_modules/@scope/pkg/lib/sub.js", "")
      .with_file("/app/node_modules/@scope/pkg/package.json", "{}");
    assert_eq!(resolve(&fs, &[], "near", "/app/src/deep").unwrap(), "/app/node_modules/near/main.js");
    assert_eq!(resolve(&fs, &[], "top", "/app/src").unwrap(), "/node_modules/top/index.js");
    assert_eq!(
      resolve(&fs, &[], "@scope/pkg/lib/sub", "/app").unwrap(),
      "/app/node_modules/@scope/pkg/lib/sub.js"
    );
    assert!(resolve(&fs, &[], "absent", "/app").is_err());
  }

  #[test]
  fn exports_follow_conditions_in_order() {
    let fs = MemoryFs::new()
      .with_file("/node_modules/pkg/s.js", "")
      .with_file("/node_modules/pkg/d.js", "")
      .with_file(
        "/node_modules/pkg/package.json",
        r#"{"exports": {"solid": "./s.js", "default": "./d.js"}, "main": "./d.js"}"#,
      );
    assert_eq!(resolve(&fs, &["solid", "default"], "pkg", "/").unwrap(), "/node_modules/pkg/s.js");
    assert_eq!(resolve(&fs, &["node", "default"], "pkg", "/").unwrap(), "/node_modules/pkg/d.js");
  }

  #[test]
  fn exports_subpaths_and_fallback_lists() {
    let fs = MemoryFs::new()
      .with_file("/node_modules/pkg/dist/server.js", "")
      .with_file("/node_modules/pkg/dist/feature/index.js", "")
      .with_file(
        "/node_modules/pkg/package.json",
        r#"{
          "exports": {
            ".": {"browser": "./dist/browser.js", "node": ["./dist/missing.js", "./dist/server"]},
            "./feature/": "./dist/feature"
          }
        }"#,
      );
    assert_eq!(resolve(&fs, &["node"], "pkg", "/").unwrap(), "/node_modules/pkg/dist/server.js");
    assert_eq!(
      resolve(&fs, &["node"], "pkg/feature", "/").unwrap(),
      "/node_modules/pkg/dist/feature/index.js"
    );
  }

  #[test]
  fn invalid_manifests_are_reported() {
    let fs = MemoryFs::new()
      .with_file("/node_modules/broken/package.json", "{")
      .with_file("/node_modules/broken/index.js", "");
    match resolve(&fs, &[], "broken", "/") {
      Err(RequireError::Json { path, .. }) => assert_eq!(path, "/node_modules/broken/package.json"),
      other => panic!("unexpected {:?}", other.map_err(|e| e.to_string())),
    }
  }
}
