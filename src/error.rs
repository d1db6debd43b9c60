use std::fmt;
use std::io;

/// Errors returned by ringbench setup paths.
#[derive(Debug)]
pub enum Error {
    /// Socket or ring I/O failed.
    Io(io::Error),
    /// io_uring setup failed (e.g., unsupported kernel features).
    RingSetup(String),
    /// Buffer arena allocation or registration failed.
    BufferSetup(String),
    /// Bad engine or scenario specification string.
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::RingSetup(msg) => write!(f, "ring setup: {msg}"),
            Error::BufferSetup(msg) => write!(f, "buffer setup: {msg}"),
            Error::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Log a single line and terminate the process.
///
/// Used for invariant violations inside the engine loops, where unwinding
/// through kernel-owned buffers and registered files would not be safe.
pub fn fatal(msg: impl fmt::Display) -> ! {
    tracing::error!("fatal: {msg}");
    std::process::exit(1);
}
