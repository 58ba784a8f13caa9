use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store already exists at {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("database is closed")]
    Closed,
}

impl Error {
    pub fn store<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Store {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Prefixes the context of a store failure; other variants pass through.
    pub fn context(self, prefix: impl std::fmt::Display) -> Self {
        match self {
            Error::Store { context, source } => Error::Store {
                context: format!("{}: {}", prefix, context),
                source,
            },
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Attaches an operation description to backend failures.
pub trait StoreContext<T> {
    fn store_context(self, context: &str) -> Result<T>;

    fn with_store_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> StoreContext<T> for std::result::Result<T, E>
where
    E: Into<BoxError>,
{
    fn store_context(self, context: &str) -> Result<T> {
        self.map_err(|e| Error::store(context, e))
    }

    fn with_store_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Error::store(f(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_store_context_keeps_source() {
        let res: std::result::Result<(), io::Error> =
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire"));
        let err = res.store_context("write snapshot").unwrap_err();
        assert_eq!(err.to_string(), "write snapshot: disk on fire");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_context_prefixes_store_errors_only() {
        let err = Error::store("read blob", "gone").context("get 2024-01-01T00:00:00+00:00");
        assert_eq!(err.to_string(), "get 2024-01-01T00:00:00+00:00: read blob: gone");
        let err = Error::InvalidArgument("value is empty".into()).context("put");
        assert_eq!(err.to_string(), "invalid argument: value is empty");
    }

    #[test]
    fn test_not_found_predicate() {
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(!Error::Closed.is_not_found());
    }
}
