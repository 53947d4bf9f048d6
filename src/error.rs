//! The control plane's structured error type (`spec.md` §7).
//!
//! Every public fallible function returns [`Result<T>`]. There is a single
//! closed set of error [`Kind`]s; each carries a message and the call site
//! that raised it so a Controller can surface the cause in a final report
//! without re-deriving context from a bare string.

use std::fmt;

/// The closed set of error kinds (`spec.md` §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Caller error: unknown name, wrong domain, out-of-range index, length
    /// mismatch, malformed policy.
    Invalid,
    /// Transient or environment failure: hardware inaccessible, endpoint
    /// timeout, mutex deadlock detected.
    Runtime,
    /// Internal consistency failure: handle used before read, policy vector
    /// wrong length for tree level.
    Logic,
    /// Feature absent on this platform.
    Unsupported,
    /// Persistent store or JSON corrupt.
    FileParse,
}

impl Kind {
    /// The human-readable name used in exit-code mapping (`spec.md` §6).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Kind::Invalid => "invalid",
            Kind::Runtime => "runtime",
            Kind::Logic => "logic",
            Kind::Unsupported => "unsupported",
            Kind::FileParse => "file_parse",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised anywhere in the control plane.
#[derive(Debug, Clone)]
pub struct Error {
    kind: Kind,
    message: String,
    file: &'static str,
    line: u32,
    /// The originating `errno`, when the error wraps a syscall failure.
    errno: Option<i32>,
}

impl Error {
    /// Constructs an error of the given kind with the given message.
    #[track_caller]
    #[must_use]
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            kind,
            message: message.into(),
            file: loc.file(),
            line: loc.line(),
            errno: None,
        }
    }

    /// Attaches an `errno` value to this error.
    #[must_use]
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    /// Shorthand for [`Error::new`] with [`Kind::Invalid`].
    #[track_caller]
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(Kind::Invalid, message)
    }

    /// Shorthand for [`Error::new`] with [`Kind::Runtime`].
    #[track_caller]
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(Kind::Runtime, message)
    }

    /// Shorthand for [`Error::new`] with [`Kind::Logic`].
    #[track_caller]
    #[must_use]
    pub fn logic(message: impl Into<String>) -> Self {
        Self::new(Kind::Logic, message)
    }

    /// Shorthand for [`Error::new`] with [`Kind::Unsupported`].
    #[track_caller]
    #[must_use]
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(Kind::Unsupported, message)
    }

    /// Shorthand for [`Error::new`] with [`Kind::FileParse`].
    #[track_caller]
    #[must_use]
    pub fn file_parse(message: impl Into<String>) -> Self {
        Self::new(Kind::FileParse, message)
    }

    /// The error's kind.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        self.kind
    }

    /// The error's message, without location/errno context.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({}:{})",
            self.kind, self.message, self.file, self.line
        )?;
        if let Some(errno) = self.errno {
            write!(f, " [errno {errno}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::runtime(err.to_string()).with_errno(err.raw_os_error().unwrap_or(0))
    }
}

impl From<serde_json::Error> for Error {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::file_parse(err.to_string())
    }
}

/// A `Result` specialized to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = Error::invalid("bad domain");
        let rendered = err.to_string();
        assert!(rendered.starts_with("invalid: bad domain"));
    }

    #[test]
    fn kind_as_str_matches_exit_code_names() {
        assert_eq!(Kind::Invalid.as_str(), "invalid");
        assert_eq!(Kind::Runtime.as_str(), "runtime");
        assert_eq!(Kind::Logic.as_str(), "logic");
        assert_eq!(Kind::Unsupported.as_str(), "unsupported");
        assert_eq!(Kind::FileParse.as_str(), "file_parse");
    }

    #[test]
    fn io_error_converts_to_runtime() {
        let io_err = std::io::Error::other("boom");
        let err: Error = io_err.into();
        assert_eq!(err.kind(), Kind::Runtime);
    }
}
