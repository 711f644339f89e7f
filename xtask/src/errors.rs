use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("'{name}' command failed")]
    CommandFailed { name: String },

    #[error("No test binary was built for package '{package}'")]
    NoTestBinary { package: &'static str },

    #[error("Logger could not be installed")]
    Logger(#[from] log::SetLoggerError),

    #[error("{operation} failed")]
    IO {
        source: io::Error,
        operation: &'static str,
    },

    #[error("{operation} failed on '{}'", .path.display())]
    IO1Path {
        source: io::Error,
        operation: &'static str,
        path: PathBuf,
    },
}

impl Error {
    pub(crate) fn command_failed(name: impl Into<String>) -> Self {
        Error::CommandFailed { name: name.into() }
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
}
