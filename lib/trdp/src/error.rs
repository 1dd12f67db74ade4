use std::error;
use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, TrdpError>;

/// Status classification shared by synchronous API results and the status
/// field of receive/timeout callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Success; only ever seen in callback status fields.
    NoError,
    /// Caller-supplied argument failed a precondition.
    Param,
    /// Operation invoked on a closed or uninitialized session.
    NoInit,
    /// Pre-allocated buffer pool exhausted.
    Memory,
    /// Transport-level I/O failure; the affected socket is reopened on the
    /// next tick.
    Socket,
    /// Header or payload checksum did not verify; the frame was dropped.
    CrcMismatch,
    /// Version, type code or length field out of range; the frame was dropped.
    WireFormat,
    /// Dataset length disagrees with the dictionary, or dictionary
    /// resolution failed.
    StructureMismatch,
    /// Marshalling source or destination buffer too small.
    BufferOverflow,
    /// No reply within the configured time, or no process data within the
    /// subscription timeout.
    Timeout,
    /// Session closed while the operation was in flight.
    Aborted,
    /// The counterpart did not confirm within the confirm timeout.
    ConfirmTimeout,
    /// Received message-data frame whose UUID matches no live session.
    UnknownSession,
}

#[derive(Debug)]
pub enum TrdpError {
    Param(String),
    NoInit,
    Memory(usize),
    Socket(io::ErrorKind),
    CrcMismatch,
    WireFormat(&'static str),
    StructureMismatch(String),
    BufferOverflow,
    Timeout,
    Aborted,
    ConfirmTimeout,
    UnknownSession,
}

impl TrdpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrdpError::Param(_) => ErrorKind::Param,
            TrdpError::NoInit => ErrorKind::NoInit,
            TrdpError::Memory(_) => ErrorKind::Memory,
            TrdpError::Socket(_) => ErrorKind::Socket,
            TrdpError::CrcMismatch => ErrorKind::CrcMismatch,
            TrdpError::WireFormat(_) => ErrorKind::WireFormat,
            TrdpError::StructureMismatch(_) => ErrorKind::StructureMismatch,
            TrdpError::BufferOverflow => ErrorKind::BufferOverflow,
            TrdpError::Timeout => ErrorKind::Timeout,
            TrdpError::Aborted => ErrorKind::Aborted,
            TrdpError::ConfirmTimeout => ErrorKind::ConfirmTimeout,
            TrdpError::UnknownSession => ErrorKind::UnknownSession,
        }
    }

    pub(crate) fn param<S: Into<String>>(msg: S) -> TrdpError {
        TrdpError::Param(msg.into())
    }

    pub(crate) fn structure<S: Into<String>>(msg: S) -> TrdpError {
        TrdpError::StructureMismatch(msg.into())
    }
}

impl fmt::Display for TrdpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TrdpError::Param(msg) => write!(f, "invalid parameter: {}", msg),
            TrdpError::NoInit => write!(f, "session not initialized"),
            TrdpError::Memory(size) => write!(f, "buffer pool exhausted ({} byte request)", size),
            TrdpError::Socket(kind) => write!(f, "socket error: {:?}", kind),
            TrdpError::CrcMismatch => write!(f, "frame checksum mismatch"),
            TrdpError::WireFormat(what) => write!(f, "malformed frame: {}", what),
            TrdpError::StructureMismatch(msg) => write!(f, "dataset structure mismatch: {}", msg),
            TrdpError::BufferOverflow => write!(f, "marshalling buffer too small"),
            TrdpError::Timeout => write!(f, "timed out"),
            TrdpError::Aborted => write!(f, "session closed while operation in flight"),
            TrdpError::ConfirmTimeout => write!(f, "confirmation not received in time"),
            TrdpError::UnknownSession => write!(f, "no session for received UUID"),
        }
    }
}

impl error::Error for TrdpError {}

impl From<io::Error> for TrdpError {
    fn from(e: io::Error) -> Self {
        TrdpError::Socket(e.kind())
    }
}

pub(crate) type NetResult<T> = std::result::Result<T, NetError>;

/// Two-level result used on the socket paths: `Wait` means the descriptor
/// would block and the operation should be retried on the next tick, `Fatal`
/// condemns the descriptor (not the session).
#[derive(Debug)]
pub(crate) enum NetError {
    Wait,
    Fatal(TrdpError),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(TrdpError::Socket(kind)),
        }
    }
}

impl From<TrdpError> for NetError {
    #[inline]
    fn from(e: TrdpError) -> Self {
        NetError::Fatal(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(TrdpError::CrcMismatch.kind(), ErrorKind::CrcMismatch);
        assert_eq!(TrdpError::param("x").kind(), ErrorKind::Param);
        assert_eq!(TrdpError::Socket(io::ErrorKind::ConnectionReset).kind(), ErrorKind::Socket);
    }

    #[test]
    fn test_wouldblock_folds_to_wait() {
        let err: NetError = io::Error::from(io::ErrorKind::WouldBlock).into();
        match err {
            NetError::Wait => (),
            other => panic!("expected Wait, got {:?}", other),
        }
    }

    #[test]
    fn test_io_error_folds_to_fatal_socket() {
        let err: NetError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        match err {
            NetError::Fatal(TrdpError::Socket(io::ErrorKind::ConnectionRefused)) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_display_is_informative() {
        let msg = TrdpError::structure("dataset 1001 refers to unknown type 77").to_string();
        assert!(msg.contains("1001"));
    }
}
