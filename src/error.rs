use std::fmt::Display;

/// VoxDB errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Well-formed request, but no data exists for it.
    NotFound,
    /// Invalid user input: unparseable ids, supervoxel 0, missing configuration.
    BadRequest(String),
    /// A mapping instance exhausted its 256-version budget.
    VersionLimit,
    /// A tarsupervoxels operation was attempted with no synced label-mapping instance.
    NoSync,
    /// An RLE value whose length is not a multiple of the 16-byte run size.
    MalformedRle(usize),
    /// Underlying key-value store failure. Retryable at the caller's discretion.
    Backend(String),
    /// A mutation raced an unresolved concurrent write reported by the backend.
    Conflict(String),
    /// Corrupt on-disk data, typically a mapping-log checksum mismatch or short read.
    Corrupt(String),
    /// An IO error.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Error::VersionLimit => {
                write!(f, "can only have 256 active versions of data instance mapping")
            }
            Error::NoSync => write!(f, "not synced with any label-mapping instance"),
            Error::MalformedRle(len) => {
                write!(f, "RLE encoding doesn't have correct # bytes: {len}")
            }
            Error::Backend(msg) => write!(f, "backend error: {msg}"),
            Error::Conflict(msg) => write!(f, "write conflict: {msg}"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl Error {
    /// HTTP status code this error surfaces as.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound => 404,
            Error::BadRequest(_) | Error::NoSync | Error::MalformedRle(_) | Error::VersionLimit => {
                400
            }
            Error::Conflict(_) => 409,
            Error::Backend(_) | Error::Corrupt(_) | Error::Io(_) => 500,
        }
    }

    /// Exit code for the equivalent CLI: 2 bad request, 3 not found, 4 backend.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotFound => 3,
            Error::BadRequest(_) | Error::NoSync | Error::MalformedRle(_) | Error::VersionLimit => 2,
            Error::Backend(_) | Error::Conflict(_) | Error::Corrupt(_) | Error::Io(_) => 4,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::BadRequest(err.to_string())
    }
}

/// Constructs an Error::BadRequest for the given format string.
#[macro_export]
macro_rules! badreq {
    ($($args:tt)*) => { $crate::error::Error::BadRequest(format!($($args)*)) };
}

/// Constructs an Error::Corrupt for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupt(format!($($args)*)) };
}

/// A VoxDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
