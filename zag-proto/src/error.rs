use std::fmt;

/// Errors from the framed host<->radio [`crate::transport::Transport`].
#[derive(Debug)]
pub enum TransportError {
    /// The serial link returned an I/O error; fatal, the role should shut down.
    Io(std::io::Error),
    /// The reader lost byte-alignment and had to resynchronise on the magic.
    SyncLost,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "serial I/O error: {e}"),
            TransportError::SyncLost => write!(f, "transport lost frame synchronisation"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// The radio replied to a request with `kind == err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseError;

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "radio returned an error response")
    }
}

impl std::error::Error for ResponseError {}

/// Frame decode failures. One variant per rejection site in the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedFrame {
    /// Fewer bytes remained than the field being decoded required.
    ShortBuffer,
    /// `version > 2006` (covers both the 2015 and reserved encodings).
    UnsupportedVersion,
    /// `dst_mode == 1` or `src_mode == 1` (reserved addressing mode).
    ReservedAddrMode,
    /// An address-list length nibble exceeded 7.
    AddrListTooLong,
    /// A string field was not valid UTF-8.
    InvalidUtf8,
    /// `identifier` did not match any known `CMD` variant's expected body length.
    TruncatedCommand,
}

impl fmt::Display for MalformedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            MalformedFrame::ShortBuffer => "buffer too short for field",
            MalformedFrame::UnsupportedVersion => "unsupported frame version",
            MalformedFrame::ReservedAddrMode => "reserved address mode",
            MalformedFrame::AddrListTooLong => "pending address list exceeds 7 entries",
            MalformedFrame::InvalidUtf8 => "ssid was not valid utf-8",
            MalformedFrame::TruncatedCommand => "command body shorter than identifier requires",
        };
        write!(f, "malformed frame: {msg}")
    }
}

impl std::error::Error for MalformedFrame {}

/// The pending-ack layer exhausted its ten retransmit attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryExhausted;

impl fmt::Display for RetryExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pending-ack packet exhausted its retries")
    }
}

impl std::error::Error for RetryExhausted {}

/// Errors raised while loading or persisting [`crate::config::CoordinatorConfig`]
/// or [`crate::config::DeviceConfig`].
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(ini::Error),
    /// A hex-encoded long address in the config file had the wrong length.
    BadLongAddr(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "config parse error: {e}"),
            ConfigError::BadLongAddr(s) => write!(f, "malformed long address {s:?} in config"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<ini::Error> for ConfigError {
    fn from(e: ini::Error) -> Self {
        ConfigError::Parse(e)
    }
}
