//! Error related business logic of `plenum`.
//!
//! Every failure carries an `ErrorKind` naming its recovery policy, a
//! short context string saying what the replica was doing, and
//! optionally the underlying error that caused it. The kind is what
//! the replica dispatches on; the context and source are for the
//! operator reading the log.

use std::error;
use std::fmt;
use std::io;
use std::result;

/// The classes of failure the core distinguishes.
///
/// Each kind maps to one recovery policy: malformed input and failed
/// authentication are rejected without touching replica state, protocol
/// violations feed the suspicion counters, invalid proofs reject the
/// carrying message, timeouts retry or escalate, capacity overflows
/// evict, and fatal errors halt the replica.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// A request, batch or encoded payload failed static validation.
    InputMalformed,
    /// A client signature was missing or did not verify.
    AuthFailure,
    /// A peer broke the protocol: wrong primary, duplicate sequence
    /// number, mismatched roots.
    ProtocolViolation,
    /// A state proof or BLS signature failed verification.
    ProofInvalid,
    /// A 3PC, view change or catch-up deadline expired.
    Timeout,
    /// A bounded stash overflowed.
    CapacityExceeded,
    /// Storage corruption or key register inconsistency; operator
    /// intervention required.
    Fatal,
}

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

/// The error type used throughout this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    context: String,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

impl Error {
    /// An error originating in the core itself; `context` states the
    /// check that failed.
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Error { kind, context: context.into(), source: None }
    }

    /// Returns the `ErrorKind` driving this error's recovery policy.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Whether the replica may recover from this error locally,
    /// without operator intervention.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind, ErrorKind::Fatal)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{:?}: {}", self.kind, self.context)?;
        if let Some(source) = &self.source {
            write!(fmt, " ({})", source)?;
        }
        Ok(())
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source.as_deref().map(|s| s as &(dyn error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        // uncaught i/o failures come from the record files, and a
        // replica must not keep ordering over broken storage
        Error {
            kind: ErrorKind::Fatal,
            context: "storage i/o failed".to_owned(),
            source: Some(Box::new(e)),
        }
    }
}

/// Extension of the standard library's `Result` type: classifies the
/// error of a fallible call under an `ErrorKind`, keeping the
/// underlying error as the source.
pub trait ErrorExt {
    type T;

    fn or_fault(self, kind: ErrorKind, context: &str) -> Result<Self::T>;
}

impl<T, E> ErrorExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn or_fault(self, kind: ErrorKind, context: &str) -> Result<T> {
        self.map_err(|e| Error {
            kind,
            context: context.to_owned(),
            source: Some(e.into()),
        })
    }
}
