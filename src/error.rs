//! Error taxonomy for both planes.
//!
//! Only [`StartupError`] is fatal. Everything else is scoped to a single
//! tick, datagram or control message and is logged by the loop that hit it.

use thiserror::Error;

/// Failures while producing a compressed frame. Tick-local.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No capturable surface, or no frame became ready in time.
    #[error("capture failed: {0}")]
    Capture(String),

    /// JPEG compression failed or could not fit the datagram budget.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Data-plane framing violations. The offending datagram is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// Payload (or declared length) exceeds the datagram ceiling.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Fewer bytes than the header plus declared length.
    #[error("truncated packet: need {needed} bytes, got {available}")]
    TruncatedPacket { needed: usize, available: usize },
}

/// A control message that could not be understood.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Unparseable JSON, unknown `type`, or an invalid payload.
    #[error("malformed control message: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for ControlError {
    fn from(e: serde_json::Error) -> Self {
        ControlError::Malformed(e.to_string())
    }
}

/// A configuration file that exists but cannot be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Resource acquisition failures at startup.
#[derive(Debug, Error)]
pub enum StartupError {
    /// A listening or datagram socket could not be bound.
    #[error("failed to bind {what} socket on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The control connection to the server could not be opened.
    #[error("failed to connect control channel to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// A bound socket would not report its local address.
    #[error("socket has no local address: {0}")]
    LocalAddr(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_errors_mention_sizes() {
        let e = FramingError::PayloadTooLarge {
            size: 70_000,
            max: 65_503,
        };
        assert!(e.to_string().contains("70000"));
        assert!(e.to_string().contains("65503"));

        let e = FramingError::TruncatedPacket {
            needed: 14,
            available: 6,
        };
        assert!(e.to_string().contains("14"));
    }

    #[test]
    fn json_errors_become_malformed() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let e: ControlError = err.into();
        assert!(matches!(e, ControlError::Malformed(_)));
    }
}
