use std::fmt;
use std::io;
use std::num::TryFromIntError;
use std::os::raw::c_int;
use std::path::PathBuf;
use std::str::Utf8Error;

/// Result of a fallible function.
pub type Result<T> = std::result::Result<T, Error>;

/// Normalized kind of a failed confinement operation.
#[non_exhaustive]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ErrorKind {
    /// AppArmor is not present or not enabled in the running kernel,
    /// or `libapparmor` is unavailable.
    Unsupported,
    /// Malformed hat or profile name, empty hat list, zero magic token,
    /// or a descriptor that cannot be queried.
    InvalidArgument,
    /// Policy rejects the transition.
    PermissionDenied,
    /// Hat pop without the magic token of the matching push.
    TokenMismatch,
    /// Named profile or hat does not exist.
    NotFound,
    /// Kernel or allocation failure while reading confinement state.
    ResourceExhausted,
    /// Any other failure.
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unsupported => "AppArmor is unsupported",
            Self::InvalidArgument => "invalid argument",
            Self::PermissionDenied => "permission denied",
            Self::TokenMismatch => "magic token mismatch",
            Self::NotFound => "not found",
            Self::ResourceExhausted => "resource exhausted",
            Self::Unknown => "unknown error",
        };
        f.write_str(s)
    }
}

/// What the failed native call was asked to do.
///
/// Only a hat pop reinterprets access errors: the kernel refuses it when the
/// magic token differs from the one used by the push.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Request {
    HatPush,
    HatPop,
    Other,
}

impl ErrorKind {
    /// Classify an `errno` value reported by a native call.
    pub(crate) fn from_errno(errno: c_int, request: Request) -> Self {
        match errno {
            libc::ENOSYS | libc::ENOPROTOOPT | libc::EOPNOTSUPP => Self::Unsupported,

            libc::EINVAL | libc::EBADF | libc::ENOTSOCK | libc::ENOTCONN | libc::ENAMETOOLONG => {
                Self::InvalidArgument
            }

            libc::EACCES | libc::EPERM if request == Request::HatPop => Self::TokenMismatch,
            libc::EACCES | libc::EPERM => Self::PermissionDenied,

            libc::ENOENT => Self::NotFound,

            libc::ENOMEM | libc::ERANGE | libc::ENOBUFS | libc::EMFILE | libc::ENFILE => {
                Self::ResourceExhausted
            }

            _ => Self::Unknown,
        }
    }

    /// Classify a failure captured from a native call.
    ///
    /// This must only be called after the error has been captured, since it
    /// may probe the kernel, which overwrites `errno`.
    pub(crate) fn classify(source: &io::Error, request: Request) -> Self {
        let kind = source
            .raw_os_error()
            .map_or(Self::Unknown, |errno| Self::from_errno(errno, request));

        if kind != Self::Unsupported && crate::kernel_support() == crate::KernelSupport::Unsupported
        {
            Self::Unsupported
        } else {
            kind
        }
    }

    fn from_io_error_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Self::InvalidArgument,
            io::ErrorKind::Unsupported => Self::Unsupported,
            io::ErrorKind::OutOfMemory => Self::ResourceExhausted,
            _ => Self::Unknown,
        }
    }
}

/// Error.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Confinement operation failed.
    #[error("{operation} failed: {kind}")]
    Confinement {
        /// Normalized kind.
        kind: ErrorKind,
        /// Cause.
        source: io::Error,
        /// Operation.
        operation: &'static str,
    },

    /// Confinement operation failed on a named hat or profile.
    #[error("{operation} failed with '{name}': {kind}")]
    Confinement1Name {
        /// Normalized kind.
        kind: ErrorKind,
        /// Cause.
        source: io::Error,
        /// Operation.
        operation: &'static str,
        /// Hat or profile name.
        name: String,
    },

    /// Confinement query failed on a task.
    #[error("{operation} failed on task with ID '{process_id}': {kind}")]
    Confinement1Process {
        /// Normalized kind.
        kind: ErrorKind,
        /// Cause.
        source: io::Error,
        /// Operation.
        operation: &'static str,
        /// Task identifier.
        process_id: libc::pid_t,
    },

    /// Lock was poisoned.
    #[error("{operation} failed due to poisoned lock")]
    LockPoisoned {
        /// Operation.
        operation: &'static str,
    },

    /// Input/Output operation failed.
    #[error("{operation} failed")]
    IO {
        /// Cause.
        source: io::Error,
        /// Operation.
        operation: &'static str,
    },

    /// Operation failed on a file system object.
    #[error("{operation} failed on path '{}'", .path.display())]
    IO1Path {
        /// Cause.
        source: io::Error,
        /// Operation.
        operation: &'static str,
        /// Path.
        path: PathBuf,
    },

    /// Stored magic token is not a valid non-zero hexadecimal number.
    #[error("Magic token is invalid: '{0}'")]
    InvalidMagicToken(String),

    /// Data is not encoded as UTF-8.
    #[error(transparent)]
    NotUTF8(#[from] Utf8Error),

    /// Integer is out of valid range.
    #[error(transparent)]
    IntegerOutOfRange(#[from] TryFromIntError),
}

impl Error {
    /// Return the normalized kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Confinement { kind, .. }
            | Self::Confinement1Name { kind, .. }
            | Self::Confinement1Process { kind, .. } => *kind,

            Self::IO { source, .. } | Self::IO1Path { source, .. } => {
                ErrorKind::from_io_error_kind(source.kind())
            }

            Self::InvalidMagicToken(_) | Self::NotUTF8(_) | Self::IntegerOutOfRange(_) => {
                ErrorKind::InvalidArgument
            }

            Self::LockPoisoned { .. } => ErrorKind::Unknown,
        }
    }

    pub(crate) fn from_native(operation: &'static str, request: Request, source: io::Error) -> Self {
        let kind = ErrorKind::classify(&source, request);
        Error::Confinement {
            kind,
            source,
            operation,
        }
    }

    pub(crate) fn from_native_name(
        operation: &'static str,
        request: Request,
        name: impl Into<String>,
        source: io::Error,
    ) -> Self {
        let kind = ErrorKind::classify(&source, request);
        Error::Confinement1Name {
            kind,
            source,
            operation,
            name: name.into(),
        }
    }

    pub(crate) fn from_native_pid(
        operation: &'static str,
        process_id: libc::pid_t,
        source: io::Error,
    ) -> Self {
        let kind = ErrorKind::classify(&source, Request::Other);
        Error::Confinement1Process {
            kind,
            source,
            operation,
            process_id,
        }
    }

    pub(crate) fn unsupported(operation: &'static str) -> Self {
        Error::Confinement {
            kind: ErrorKind::Unsupported,
            source: io::ErrorKind::Unsupported.into(),
            operation,
        }
    }

    pub(crate) fn hat_not_entered(operation: &'static str, hat: impl Into<String>) -> Self {
        Error::Confinement1Name {
            kind: ErrorKind::NotFound,
            source: io::ErrorKind::NotFound.into(),
            operation,
            name: hat.into(),
        }
    }

    pub(crate) fn invalid_argument(operation: &'static str, name: impl Into<String>) -> Self {
        Error::Confinement1Name {
            kind: ErrorKind::InvalidArgument,
            source: io::ErrorKind::InvalidInput.into(),
            operation,
            name: name.into(),
        }
    }

    pub(crate) fn invalid_input(operation: &'static str) -> Self {
        Error::Confinement {
            kind: ErrorKind::InvalidArgument,
            source: io::ErrorKind::InvalidInput.into(),
            operation,
        }
    }

    pub(crate) fn unexpected_data(operation: &'static str) -> Self {
        Error::Confinement {
            kind: ErrorKind::Unknown,
            source: io::ErrorKind::InvalidData.into(),
            operation,
        }
    }

    pub(crate) fn from_io(operation: &'static str, source: io::Error) -> Self {
        Error::IO { source, operation }
    }

    pub(crate) fn from_io_path(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: io::Error,
    ) -> Self {
        Error::IO1Path {
            source,
            operation,
            path: path.into(),
        }
    }

    pub(crate) fn set_errno(errno: c_int) {
        unsafe {
            *libc::__errno_location() = errno;
        }
    }

    pub(crate) fn clear_errno() {
        Self::set_errno(0);
    }

    #[allow(dead_code)] // This is used by unit tests.
    pub(crate) fn io_source(&self) -> Option<&io::Error> {
        match self {
            Self::Confinement { source, .. } => Some(source),
            Self::Confinement1Name { source, .. } => Some(source),
            Self::Confinement1Process { source, .. } => Some(source),
            Self::IO { source, .. } => Some(source),
            Self::IO1Path { source, .. } => Some(source),
            _ => None,
        }
    }
}
