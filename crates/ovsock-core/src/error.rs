//! Error types for ports and sockets.
//!
//! These never cross the public socket API: `ClientSocket`/`ServerSocket`
//! log them and report plain success/failure. Backends and the `net` layer
//! use them internally so the reason survives until it is logged.

use core::fmt;

pub type PortResult<T> = Result<T, PortError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    /// Raw OS error (errno on unix, WSA/Win32 code on Windows).
    Os(i32),

    /// The socket handle is not open.
    Closed,

    /// `create` on a socket that already owns a handle.
    AlreadyOpen,

    /// The runtime has no completion port (not started or torn down).
    NotInitialized,

    /// The backend or platform cannot perform this request.
    Unsupported(&'static str),

    /// Host/port resolution produced no usable address.
    Resolve(String),

    /// The backend could not queue another operation.
    QueueFull,
}

impl PortError {
    /// Capture the calling thread's last OS error.
    pub fn last_os_error() -> Self {
        PortError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(-1))
    }

    /// The raw OS code, when this error carries one.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            PortError::Os(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortError::Os(code) => write!(f, "os error {}: {}", code, os_error_string(*code)),
            PortError::Closed => write!(f, "socket closed"),
            PortError::AlreadyOpen => write!(f, "socket already open"),
            PortError::NotInitialized => write!(f, "completion port not initialized"),
            PortError::Unsupported(what) => write!(f, "unsupported: {}", what),
            PortError::Resolve(target) => write!(f, "cannot resolve {}", target),
            PortError::QueueFull => write!(f, "completion port queue full"),
        }
    }
}

impl std::error::Error for PortError {}

impl From<std::io::Error> for PortError {
    fn from(e: std::io::Error) -> Self {
        PortError::Os(e.raw_os_error().unwrap_or(-1))
    }
}

/// Human-readable text for a raw OS error code. Diagnostics only.
pub fn os_error_string(code: i32) -> String {
    if code == 0 {
        return String::new();
    }
    std::io::Error::from_raw_os_error(code).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(PortError::Closed.to_string(), "socket closed");
        assert_eq!(
            PortError::Resolve("nowhere:1".into()).to_string(),
            "cannot resolve nowhere:1"
        );
        assert!(PortError::Os(2).to_string().starts_with("os error 2: "));
    }

    #[test]
    fn test_os_code() {
        assert_eq!(PortError::Os(11).os_code(), Some(11));
        assert_eq!(PortError::QueueFull.os_code(), None);
        assert_eq!(os_error_string(0), "");
    }

    #[test]
    fn test_from_io() {
        let e: PortError = std::io::Error::from_raw_os_error(5).into();
        assert_eq!(e, PortError::Os(5));
    }
}
