use std::fmt;
use std::path::Path;

/// Coarse classification used by the pipeline to report why a stage stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required input path is missing.
    NotFound,
    /// An external tool could not be executed or exited non-zero.
    ExternalTool,
    /// The profile or a config file is malformed.
    Config,
    Io,
    Other,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn not_found(what: &str, path: &Path) -> Self {
        Self::new(
            ErrorKind::NotFound,
            format!("{what} not found: {}", path.display()),
        )
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn external_tool<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::ExternalTool, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Prefixes the message, keeping the kind.
    pub fn context(self, what: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{what}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = if err.kind() == std::io::ErrorKind::NotFound {
            ErrorKind::NotFound
        } else {
            ErrorKind::Io
        };
        Self::new(kind, err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Self::new(ErrorKind::Io, format!("walkdir error: {err}"))
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => io.into(),
            zip::result::ZipError::FileNotFound => Self::new(ErrorKind::NotFound, err.to_string()),
            other => Self::msg(format!("zip error: {other}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
