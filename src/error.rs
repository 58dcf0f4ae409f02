use std::fmt::Display;

/// Engine errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// An index with the same name is already registered.
    AlreadyExists(String),
    /// Invalid caller input, typically an empty collection name or id.
    InvalidArgument(String),
    /// Invalid data, typically decoding errors or on-disk corruption.
    InvalidData(String),
    /// An IO error from the underlying storage.
    Io(String),
    /// The requested document or index does not exist.
    NotFound(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}
