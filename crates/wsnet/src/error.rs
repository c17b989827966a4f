use std::fmt;

use thiserror::Error;

use crate::broker::BrokerError;
use crate::ice::{IceError, IceServerConfig};

#[derive(Debug, Error)]
pub enum Error {
    #[error("broker: {0}")]
    Broker(#[from] BrokerError),
    #[error("handshake stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed handshake message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Error string reported by the remote peer.
    #[error("{0}")]
    Remote(String),
    #[error("webrtc: {0}")]
    Rtc(String),
    #[error(transparent)]
    Ice(#[from] IceError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("connection closed")]
    ConnectionClosed,
    /// The listener could not reach the requested target.
    #[error("{op} {net}: {message}")]
    Dial {
        op: String,
        net: String,
        message: String,
    },
    #[error("{source} (ice: [{ice}], rtc: {rtc})")]
    Handshake {
        source: Box<Error>,
        ice: String,
        rtc: String,
    },
}

impl Error {
    /// Wraps a negotiation failure with the ICE servers in use and the peer
    /// connection state at the time of failure.
    pub(crate) fn handshake(
        source: Error,
        servers: &[IceServerConfig],
        rtc: impl fmt::Display,
    ) -> Self {
        let ice = servers
            .iter()
            .map(|server| server.urls.join(", "))
            .collect::<Vec<_>>()
            .join(", ");
        Error::Handshake {
            source: Box::new(source),
            ice,
            rtc: rtc.to_string(),
        }
    }

    /// Strips diagnostic wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Handshake { source, .. } => source.root(),
            other => other,
        }
    }
}

pub(crate) fn rtc_error<E: fmt::Display>(err: E) -> Error {
    Error::Rtc(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_error_lists_servers_and_state() {
        let servers = vec![
            IceServerConfig::new(vec!["stun:a:3478".into(), "stun:b:3478".into()]),
            IceServerConfig::new(vec!["turn:c:3478".into()]),
        ];
        let err = Error::handshake(Error::Remote("boom".into()), &servers, "failed");
        assert_eq!(
            err.to_string(),
            "boom (ice: [stun:a:3478, stun:b:3478, turn:c:3478], rtc: failed)"
        );
        assert!(matches!(err.root(), Error::Remote(message) if message == "boom"));
    }
}
