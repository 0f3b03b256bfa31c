//! The file systems modules are loaded from.
//!
//! Resolution only needs to read files, tell files from directories and canonicalize paths, so
//! [`ModuleFs`] is that and nothing more. Paths are always slash-separated and absolute.

use ahash::AHashMap;
use embed_js::Bytes;
use embed_js::Class;
use embed_js::ClassBuilder;
use embed_js::Error;
use embed_js::FunctionArgs;
use embed_js::Value;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::RequireError;
use crate::path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
  File,
  Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
  pub kind: FileKind,
  pub len: u64,
}

impl Metadata {
  pub fn is_file(&self) -> bool {
    self.kind == FileKind::File
  }

  pub fn is_dir(&self) -> bool {
    self.kind == FileKind::Directory
  }
}

pub trait ModuleFs: Send + Sync {
  fn read(&self, path: &str) -> io::Result<Vec<u8>>;

  fn stat(&self, path: &str) -> io::Result<Metadata>;

  /// The canonical name of `path`, used as the module's filename and cache key.
  fn realpath(&self, path: &str) -> io::Result<String> {
    self.stat(path)?;
    Ok(path::normalize(path))
  }
}

/// The host file system, optionally confined below `root`.
#[derive(Debug, Clone, Default)]
pub struct RealFs {
  root: Option<PathBuf>,
}

impl RealFs {
  pub fn new() -> RealFs {
    RealFs::default()
  }

  /// Maps module path `/a/b` to `root/a/b`.
  pub fn rooted(root: impl Into<PathBuf>) -> RealFs {
    RealFs { root: Some(root.into()) }
  }

  fn host_path(&self, path: &str) -> PathBuf {
    let path = path::normalize(path);
    match &self.root {
      Some(root) => root.join(path.trim_start_matches('/')),
      None => PathBuf::from(path),
    }
  }
}

impl ModuleFs for RealFs {
  fn read(&self, path: &str) -> io::Result<Vec<u8>> {
    fs::read(self.host_path(path))
  }

  fn stat(&self, path: &str) -> io::Result<Metadata> {
    let metadata = fs::metadata(self.host_path(path))?;
    Ok(Metadata {
      kind: if metadata.is_dir() {
        FileKind::Directory
      } else {
        FileKind::File
      },
      len: metadata.len(),
    })
  }

  fn realpath(&self, path: &str) -> io::Result<String> {
    let canonical = fs::canonicalize(self.host_path(path))?;
    let canonical = match &self.root {
      Some(root) => {
        let root = fs::canonicalize(root)?;
        match canonical.strip_prefix(&root) {
          Ok(rest) => PathBuf::from("/").join(rest),
          // Symlinked out of the root.
          Err(_) => return Err(io::Error::new(io::ErrorKind::NotFound, format!("{path} leaves the root"))),
        }
      }
      None => canonical,
    };
    Ok(canonical.to_string_lossy().replace('\\', "/"))
  }
}

/// An in-memory tree of files. Directories exist implicitly above every file.
#[derive(Default)]
pub struct MemoryFs {
  files: RwLock<AHashMap<String, Arc<[u8]>>>,
}

impl MemoryFs {
  pub fn new() -> MemoryFs {
    MemoryFs::default()
  }

  pub fn insert(&self, path: &str, contents: impl AsRef<[u8]>) {
    self
      .files
      .write()
      .insert(path::normalize(path), Arc::from(contents.as_ref()));
  }

  pub fn with_file(self, path: &str, contents: impl AsRef<[u8]>) -> MemoryFs {
    self.insert(path, contents);
    self
  }

  pub fn remove(&self, path: &str) -> bool {
    self.files.write().remove(&path::normalize(path)).is_some()
  }
}

fn not_found(path: &str) -> io::Error {
  io::Error::new(io::ErrorKind::NotFound, format!("no such file or directory: {path}"))
}

impl ModuleFs for MemoryFs {
  fn read(&self, path: &str) -> io::Result<Vec<u8>> {
    let path = path::normalize(path);
    let contents = self.files.read().get(&path).cloned();
    match contents {
      Some(contents) => Ok(contents.to_vec()),
      None if self.stat(&path).is_ok() => Err(io::Error::new(io::ErrorKind::Other, format!("is a directory: {path}"))),
      None => Err(not_found(&path)),
    }
  }

  fn stat(&self, path: &str) -> io::Result<Metadata> {
    let path = path::normalize(path);
    let files = self.files.read();
    if let Some(contents) = files.get(&path) {
      return Ok(Metadata {
        kind: FileKind::File,
        len: contents.len() as u64,
      });
    }
    let prefix = if path == "/" { path.clone() } else { format!("{path}/") };
    if files.keys().any(|f| f.starts_with(&prefix)) {
      return Ok(Metadata {
        kind: FileKind::Directory,
        len: 0,
      });
    }
    Err(not_found(&path))
  }
}

/// The file system as script sees it through `module.fs`.
pub struct ScriptFs {
  fs: Arc<dyn ModuleFs>,
}

impl ScriptFs {
  pub fn new(fs: Arc<dyn ModuleFs>) -> Arc<Mutex<ScriptFs>> {
    Arc::new(Mutex::new(ScriptFs { fs }))
  }

  pub fn fs(&self) -> &Arc<dyn ModuleFs> {
    &self.fs
  }
}

fn path_arg(args: &FunctionArgs) -> Result<String, Error> {
  let path: Option<String> = args.arg_as(0)?;
  path.ok_or_else(|| Error::msg("path must be a string"))
}

impl Class for ScriptFs {
  fn class_name() -> String {
    "FileSystem".to_string()
  }

  fn describe(class: &mut ClassBuilder<Self>) {
    class
      .method("readFileSync", |fs, args| {
        let path = path_arg(args)?;
        let encoding: Option<String> = args.arg_as(1)?;
        let contents = fs.fs.read(&path).map_err(|e| RequireError::io(&path, e))?;
        match encoding {
          Some(_) => args.context.create(&args.ec, &String::from_utf8_lossy(&contents).into_owned()),
          None => args.context.create(&args.ec, &Bytes(contents)),
        }
      })
      .method("statSync", |fs, args| {
        let path = path_arg(args)?;
        let metadata = fs.fs.stat(&path).map_err(|e| RequireError::io(&path, e))?;
        args.context.create(&args.ec, &Arc::new(Mutex::new(Stats { metadata })))
      })
      .method("existsSync", |fs, args| {
        let path = path_arg(args)?;
        args.context.create(&args.ec, &fs.fs.stat(&path).is_ok())
      })
      .method("realpathSync", |fs, args| {
        let path = path_arg(args)?;
        let real = fs.fs.realpath(&path).map_err(|e| RequireError::io(&path, e))?;
        args.context.create(&args.ec, &real)
      });
  }
}

/// What `statSync` returns.
pub struct Stats {
  metadata: Metadata,
}

impl Class for Stats {
  fn describe(class: &mut ClassBuilder<Self>) {
    class
      .getter("size", |s, args| args.context.create(&args.ec, &(s.metadata.len as f64)))
      .method("isFile", |s, args| args.context.create(&args.ec, &s.metadata.is_file()))
      .method("isDirectory", |s, args| args.context.create(&args.ec, &s.metadata.is_dir()));
  }
}

pub(crate) fn read_to_string(fs: &dyn ModuleFs, path: &str) -> Result<String, RequireError> {
  let bytes = fs.read(path).map_err(|e| RequireError::io(path, e))?;
  String::from_utf8(bytes).map_err(|e| RequireError::io(path, io::Error::new(io::ErrorKind::InvalidData, e)))
}

pub(crate) fn value_to_string(ec: &embed_js::ExecutionContext, value: &Value) -> Result<String, Error> {
  if value.is_kind(embed_js::Kind::STRING) {
    return value.string_value(ec);
  }
  let bytes: Bytes = value.unmarshal(ec)?;
  Ok(String::from_utf8_lossy(&bytes.0).into_owned())
}

#[cfg(test)]
mod tests {
  use super::FileKind;
  use super::MemoryFs;
  use super::ModuleFs;

  #[test]
  fn memory_fs_has_implicit_directories() {
    let fs = MemoryFs::new().with_file("/app/node_modules/pkg/index.js", "1");
    assert_eq!(fs.stat("/app").unwrap().kind, FileKind::Directory);
    assert_eq!(fs.stat("/app/node_modules/pkg/").unwrap().kind, FileKind::Directory);
    assert_eq!(fs.stat("/app/node_modules/pkg/index.js").unwrap().len, 1);
    assert!(fs.stat("/app/node").is_err());
    assert!(fs.read("/app").is_err());
  }

  #[test]
  fn memory_fs_realpath_normalizes() {
    let fs = MemoryFs::new().with_file("/a/b.js", "");
    assert_eq!(fs.realpath("/a/./c/../b.js").unwrap(), "/a/b.js");
    assert!(fs.realpath("/a/missing.js").is_err());
  }
}
