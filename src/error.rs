use std::fmt;

use thiserror::Error;

/// Error returned by control-plane operations. The packet fast path never surfaces these, it logs and moves on.
#[derive(Debug, Error)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Packet(PacketErrorKind),
    Io(IoErrorKind),
    State(StateErrorKind),
    Fatal(FatalErrorKind),
    Webrtc,
    Json,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Packet(kind) => write!(f, "PacketError({})", kind),
            ErrorKind::Io(kind) => write!(f, "IoError({})", kind),
            ErrorKind::State(kind) => write!(f, "StateError({})", kind),
            ErrorKind::Fatal(kind) => write!(f, "FatalError({})", kind),
            ErrorKind::Webrtc => write!(f, "WebrtcError"),
            ErrorKind::Json => write!(f, "JsonError"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum PacketErrorKind {
    MalformedPacket,
    ShortBuffer,
    PayloadTooLarge,
    UseAfterRelease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum IoErrorKind {
    ReadTimeout,
    WriteDropped,
    Broken,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum StateErrorKind {
    TrackExists,
    TrackNotFound,
    ClientExists,
    ClientNotFound,
    RoomNotFound,
    NegotiationNotRequested,
    RenegotiationCallbackMissing,
    ClientStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum FatalErrorKind {
    CodecRegistration,
    TransportConstruction,
}

impl Error {
    pub fn new_packet(message: String, kind: PacketErrorKind) -> Error {
        Error {
            kind: ErrorKind::Packet(kind),
            message,
        }
    }

    pub fn new_io(message: String, kind: IoErrorKind) -> Error {
        Error {
            kind: ErrorKind::Io(kind),
            message,
        }
    }

    pub fn new_state(message: String, kind: StateErrorKind) -> Error {
        Error {
            kind: ErrorKind::State(kind),
            message,
        }
    }

    pub fn new_fatal(message: String, kind: FatalErrorKind) -> Error {
        Error {
            kind: ErrorKind::Fatal(kind),
            message,
        }
    }

    /// EOF and `Broken` end a stream for good, every other I/O error is retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Io(IoErrorKind::Eof) | ErrorKind::Io(IoErrorKind::Broken)
        )
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error {
            kind: ErrorKind::Webrtc,
            message: err.to_string(),
        }
    }
}

impl From<webrtc_util::Error> for Error {
    fn from(err: webrtc_util::Error) -> Self {
        Error {
            kind: ErrorKind::Packet(PacketErrorKind::MalformedPacket),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::Json,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = Error::new_state(
            "track abc is not published".to_string(),
            StateErrorKind::TrackNotFound,
        );
        assert_eq!(
            err.to_string(),
            "StateError(TrackNotFound): track abc is not published"
        );
    }

    #[test]
    fn only_eof_and_broken_are_terminal() {
        let eof = Error::new_io("closed".to_string(), IoErrorKind::Eof);
        let timeout = Error::new_io("deadline".to_string(), IoErrorKind::ReadTimeout);
        assert!(eof.is_terminal());
        assert!(!timeout.is_terminal());
    }
}
