use std::io;

/// Failures of module resolution and loading.
#[derive(Debug, thiserror::Error)]
pub enum RequireError {
  #[error("unable to resolve: {id} in {dir}")]
  NotResolved { id: String, dir: String },

  /// The id is on the deny list. Reported exactly like a missing module.
  #[error("unable to resolve: {id} in {dir}")]
  Denied { id: String, dir: String },

  #[error("{path}: {source}")]
  Io {
    path: String,
    #[source]
    source: io::Error,
  },

  #[error("invalid package.json at {path}: {source}")]
  Json {
    path: String,
    #[source]
    source: serde_json::Error,
  },

  #[error(transparent)]
  Engine(#[from] embed_js::Error),
}

impl RequireError {
  pub(crate) fn not_resolved(id: &str, dir: &str) -> RequireError {
    RequireError::NotResolved {
      id: id.to_string(),
      dir: dir.to_string(),
    }
  }

  pub(crate) fn io(path: &str, source: io::Error) -> RequireError {
    RequireError::Io {
      path: path.to_string(),
      source,
    }
  }
}

impl From<RequireError> for embed_js::Error {
  fn from(err: RequireError) -> Self {
    match err {
      RequireError::Engine(err) => err,
      err => embed_js::Error::host(err),
    }
  }
}
