use std::fmt;
use std::io;

/// Failure categories for every fallible operation in the stack.
///
/// Success is expressed through `Result::Ok`; a `Status` always carries a
/// non-success code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Programming error or input constraint violation.
    InvalidArgument,
    /// Scheme or feature not available on this build/host.
    NotSupported,
    /// Syscall or transport failure, including connection reset.
    IoError,
    /// A bounded wait elapsed.
    Timeout,
    /// The endpoint was closed, locally or by the peer.
    Closed,
    /// Framing invariants violated on decode.
    ProtocolError,
}

impl StatusCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::InvalidArgument => "invalid argument",
            StatusCode::NotSupported => "not supported",
            StatusCode::IoError => "i/o error",
            StatusCode::Timeout => "timeout",
            StatusCode::Closed => "closed",
            StatusCode::ProtocolError => "protocol error",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure status: a [`StatusCode`] plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotSupported, message)
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::IoError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Timeout, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Closed, message)
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ProtocolError, message)
    }

    /// Wrap an `io::Error`, classifying end-of-stream and reset conditions.
    ///
    /// `context` names the failing operation (e.g. `"recv()"`).
    pub fn from_io(context: &str, err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => StatusCode::Closed,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => StatusCode::Timeout,
            _ => StatusCode::IoError,
        };
        Self::new(code, format!("{context} failed: {err}"))
    }

    #[inline]
    pub fn code(&self) -> StatusCode {
        self.code
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

impl From<io::Error> for Status {
    fn from(err: io::Error) -> Self {
        Self::from_io("i/o", err)
    }
}

/// Result alias used by every fallible operation in the stack.
pub type Result<T> = std::result::Result<T, Status>;
