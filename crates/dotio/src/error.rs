use thiserror::Error;

/// Errors produced while reading or writing frames.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FrameError {
    /// The peer closed the connection cleanly between frames.
    #[error("connection closed")]
    Closed,

    /// The stream ended in the middle of a frame.
    #[error("stream ended mid-frame")]
    Truncated,

    /// The declared frame length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },

    /// The declared frame length cannot hold a frame id.
    #[error("frame length {0} is shorter than the frame header")]
    InvalidLength(u32),

    /// A payload field ran past the end of the payload.
    #[error("payload under-run: needed {needed} bytes, {available} remaining")]
    PayloadUnderrun { needed: usize, available: usize },

    /// A length-prefixed string was not valid UTF-8.
    #[error("payload string is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// An I/O error from the underlying connection.
    #[error("connection I/O error")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Returns `true` when the error means the peer simply went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::Closed => true,
            FrameError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Errors that can occur while registering routes.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouteError {
    /// A handler is already registered for this verb and path.
    #[error("function '{verb}' at '{path}' already exists")]
    Duplicate { verb: String, path: String },
}

/// Errors that can occur while running the server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// The configured address could not be resolved.
    #[error("failed to resolve address '{address}'")]
    Resolve {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The listening socket could not be bound.
    #[error("failed to bind '{address}'")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The accept loop failed with a socket-level error.
    #[error("failed to accept connection")]
    Accept(#[source] std::io::Error),
}

/// Error type returned by route handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The status code written back to the peer after each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum WireStatus {
    /// The handler ran to completion.
    Ok,

    /// No handler registered for the requested verb and path.
    NoRoute,

    /// The handler returned an error.
    HandlerFailed,

    /// The server is at its in-flight request limit.
    Busy,

    /// A status code this version does not know about.
    Unknown(i32),
}

impl WireStatus {
    pub const CODE_OK: i32 = 0;
    pub const CODE_NO_ROUTE: i32 = 1;
    pub const CODE_HANDLER_FAILED: i32 = 2;
    pub const CODE_BUSY: i32 = 3;

    pub fn to_code(&self) -> i32 {
        match self {
            WireStatus::Ok => Self::CODE_OK,
            WireStatus::NoRoute => Self::CODE_NO_ROUTE,
            WireStatus::HandlerFailed => Self::CODE_HANDLER_FAILED,
            WireStatus::Busy => Self::CODE_BUSY,
            WireStatus::Unknown(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            Self::CODE_OK => WireStatus::Ok,
            Self::CODE_NO_ROUTE => WireStatus::NoRoute,
            Self::CODE_HANDLER_FAILED => WireStatus::HandlerFailed,
            Self::CODE_BUSY => WireStatus::Busy,
            other => WireStatus::Unknown(other),
        }
    }
}

impl std::fmt::Display for WireStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireStatus::Ok => write!(f, "ok"),
            WireStatus::NoRoute => write!(f, "no route"),
            WireStatus::HandlerFailed => write!(f, "handler failed"),
            WireStatus::Busy => write!(f, "busy"),
            WireStatus::Unknown(code) => write!(f, "unknown status {code}"),
        }
    }
}
