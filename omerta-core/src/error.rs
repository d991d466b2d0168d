use std::fmt;

/// The node's full error taxonomy. Variants are grouped by kind in the spec sense, not
/// by Rust module, since several components can produce the same kind (e.g. both the
/// dispatcher and the relay client can produce `PeerUnreachable`).
#[derive(Debug)]
pub enum Error {
    // -- Validation --
    InvalidConfiguration(String),
    InvalidChannelName(String),

    // -- Lifecycle --
    NotStarted,
    AlreadyStarted,

    // -- Peer-routing --
    PeerNotFound,
    PeerUnreachable,

    // -- Transient --
    Timeout,
    ConnectionFailed,
    SendFailed,
    Io(std::io::Error),

    // -- Crypto (never surfaced across the channel API; dropped silently at the
    // dispatcher and counted in metrics, see `crate::dispatcher`) --
    HeaderAuthFail,
    PayloadAuthFail,
    BadSignature,
    WrongNetwork,

    // -- Hole-punch --
    HolePunchFailed(String),
    HolePunchImpossible,

    // -- Cloister --
    CloisterRejected(String),
    KeyExchangeFailed,
    ConfirmationMismatch,
    SessionExpired,
    PeerMismatch,

    // -- Resource --
    RelayAtCapacity,
    NoPortsAvailable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfiguration(why) => write!(f, "invalid configuration: {why}"),
            Error::InvalidChannelName(name) => write!(f, "invalid channel name: {name}"),
            Error::NotStarted => write!(f, "node is not started"),
            Error::AlreadyStarted => write!(f, "node is already started"),
            Error::PeerNotFound => write!(f, "peer not found"),
            Error::PeerUnreachable => write!(f, "peer unreachable"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::ConnectionFailed => write!(f, "connection failed"),
            Error::SendFailed => write!(f, "send failed"),
            Error::Io(e) => write!(f, "i/o error: {e}"),
            Error::HeaderAuthFail => write!(f, "header authentication failed"),
            Error::PayloadAuthFail => write!(f, "payload authentication failed"),
            Error::BadSignature => write!(f, "bad signature"),
            Error::WrongNetwork => write!(f, "wrong network"),
            Error::HolePunchFailed(reason) => write!(f, "hole punch failed: {reason}"),
            Error::HolePunchImpossible => write!(f, "hole punch impossible (both peers symmetric)"),
            Error::CloisterRejected(reason) => write!(f, "cloister request rejected: {reason}"),
            Error::KeyExchangeFailed => write!(f, "cloister key exchange failed"),
            Error::ConfirmationMismatch => write!(f, "cloister confirmation mismatch"),
            Error::SessionExpired => write!(f, "cloister session expired"),
            Error::PeerMismatch => write!(f, "cloister peer mismatch"),
            Error::RelayAtCapacity => write!(f, "relay at capacity"),
            Error::NoPortsAvailable => write!(f, "no ports available"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors rejected by the wire codec. Kept separate from the top-level `Error` so the
/// dispatcher can match on it exhaustively without the unrelated lifecycle/resource
/// variants, and so the codec crate boundary stays self-contained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    BadMagic,
    UnsupportedVersion,
    HeaderAuthFail,
    WrongNetwork,
    PayloadAuthFail,
    BadSignature,
    Malformed,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CodecError::BadMagic => "bad magic",
            CodecError::UnsupportedVersion => "unsupported version",
            CodecError::HeaderAuthFail => "header authentication failed",
            CodecError::WrongNetwork => "wrong network",
            CodecError::PayloadAuthFail => "payload authentication failed",
            CodecError::BadSignature => "bad signature",
            CodecError::Malformed => "malformed packet",
        };
        f.write_str(s)
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::HeaderAuthFail => Error::HeaderAuthFail,
            CodecError::PayloadAuthFail => Error::PayloadAuthFail,
            CodecError::BadSignature => Error::BadSignature,
            CodecError::WrongNetwork => Error::WrongNetwork,
            CodecError::BadMagic | CodecError::UnsupportedVersion | CodecError::Malformed => {
                Error::SendFailed
            }
        }
    }
}
