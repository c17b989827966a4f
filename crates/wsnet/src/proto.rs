//! Handshake messages exchanged over the broker, dial policies and the
//! response written at the head of every proxied data channel.

use std::net::IpAddr;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::Error;
use crate::ice::IceServerConfig;

/// Protocol and label of the liveness channel every dialer opens.
pub const CONTROL_CHANNEL: &str = "control";
/// Label of channels opened by [`crate::Dialer::dial_context`].
pub const PROXY_CHANNEL: &str = "proxy";

/// `code` reported when the listener failed to reach the target.
pub const CODE_DIAL_ERR: &str = "dial_error";
/// `code` reported when the target address is malformed or not permitted.
pub const CODE_BAD_ADDRESS: &str = "bad_address";

/// Upper bound on a single buffered handshake document.
const MAX_HANDSHAKE_LEN: usize = 1 << 20;

/// A single network + host + port combination a connection may use. Empty
/// strings and a zero port match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialPolicy {
    #[serde(default)]
    pub network: String,
    /// IP or hostname without the port. "localhost", `[::1]` and any address
    /// in 127.0.0.0/8 are interchangeable.
    #[serde(rename = "address", default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

impl DialPolicy {
    pub fn new(network: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            network: network.into(),
            host: host.into(),
            port,
        }
    }

    /// `host` must already be canonicalized.
    pub fn permits(&self, network: &str, host: &str, port: u16) -> bool {
        if !self.network.is_empty() && self.network != network {
            return false;
        }
        if !self.host.is_empty() && canonicalize_host(&self.host) != host {
            return false;
        }
        self.port == 0 || self.port == port
    }
}

/// One handshake document. Dialers send the offer along with the ICE servers
/// both sides must use; listeners reply with an answer or an error; both ends
/// trickle candidates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<RTCSessionDescription>,
    #[serde(rename = "servers", default, skip_serializing_if = "Option::is_none")]
    pub ice_servers: Option<Vec<IceServerConfig>>,
    #[serde(rename = "ports", default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<DialPolicy>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_as_none"
    )]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<RTCSessionDescription>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_as_none"
    )]
    pub candidate: Option<String>,
}

impl HandshakeMessage {
    pub fn offer(
        offer: RTCSessionDescription,
        ice_servers: Vec<IceServerConfig>,
        policies: Vec<DialPolicy>,
    ) -> Self {
        Self {
            offer: Some(offer),
            ice_servers: Some(ice_servers),
            policies,
            ..Default::default()
        }
    }

    pub fn answer(answer: RTCSessionDescription) -> Self {
        Self {
            answer: Some(answer),
            ..Default::default()
        }
    }

    pub fn candidate(candidate: impl Into<String>) -> Self {
        Self {
            candidate: Some(candidate.into()),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|value| !value.is_empty()))
}

/// Written by the listener as the first message on every proxy channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialChannelResponse {
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub net: String,
    #[serde(default)]
    pub op: String,
}

impl DialChannelResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn bad_address(err: &PolicyError) -> Self {
        Self {
            err: err.to_string(),
            code: CODE_BAD_ADDRESS.into(),
            ..Default::default()
        }
    }

    pub fn dial_failed(network: &str, err: &std::io::Error) -> Self {
        Self {
            err: err.to_string(),
            code: CODE_DIAL_ERR.into(),
            net: network.into(),
            op: "dial".into(),
        }
    }

    pub fn into_result(self) -> Result<(), Error> {
        if self.err.is_empty() {
            return Ok(());
        }
        if self.code == CODE_DIAL_ERR {
            return Err(Error::Dial {
                op: self.op,
                net: self.net,
                message: self.err,
            });
        }
        Err(Error::Remote(self.err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("invalid dial address: {0}")]
    Malformed(String),
    #[error("invalid dial address {protocol:?} network: {network}")]
    Network { protocol: String, network: String },
    #[error("invalid dial address {protocol:?} host: {host}")]
    Host { protocol: String, host: String },
    #[error("invalid dial address {protocol:?} port: {port}")]
    Port { protocol: String, port: String },
    #[error("connections are not permitted to {0:?} by policy")]
    NotPermitted(String),
}

/// Parses a channel protocol of the form `network:host:port` into a network
/// and an address suitable for dialing, enforcing `policies` when any are
/// given. The returned address keeps the caller's host spelling.
pub fn resolve_address(
    policies: &[DialPolicy],
    protocol: &str,
) -> Result<(String, String), PolicyError> {
    let malformed = || PolicyError::Malformed(protocol.to_string());
    let (network, rest) = protocol.split_once(':').ok_or_else(malformed)?;
    let (host, port) = split_host_port(rest).ok_or_else(malformed)?;

    if network.is_empty() {
        return Err(PolicyError::Network {
            protocol: protocol.to_string(),
            network: network.to_string(),
        });
    }
    if host.is_empty() {
        return Err(PolicyError::Host {
            protocol: protocol.to_string(),
            host: host.to_string(),
        });
    }
    let port_number: u16 = port.parse().map_err(|_| PolicyError::Port {
        protocol: protocol.to_string(),
        port: port.to_string(),
    })?;

    let address = join_host_port(host, port);
    if policies.is_empty() {
        return Ok((network.to_string(), address));
    }

    let canonical = canonicalize_host(host);
    if policies
        .iter()
        .any(|policy| policy.permits(network, &canonical, port_number))
    {
        return Ok((network.to_string(), address));
    }
    Err(PolicyError::NotPermitted(protocol.to_string()))
}

/// Maps every loopback spelling to "localhost" and strips IPv6 brackets.
pub fn canonicalize_host(host: &str) -> String {
    let host = host.strip_prefix('[').unwrap_or(host);
    let host = host.strip_suffix(']').unwrap_or(host);
    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_loopback() => "localhost".to_string(),
        _ => host.to_string(),
    }
}

/// Formats a dial protocol from a network and a `host:port` address.
pub fn format_address(network: &str, address: &str) -> String {
    format!("{network}:{address}")
}

fn split_host_port(input: &str) -> Option<(&str, &str)> {
    if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        if port.contains(':') {
            return None;
        }
        return Some((host, port));
    }
    let (host, port) = input.rsplit_once(':')?;
    if host.contains(':') || host.contains('[') || host.contains(']') {
        return None;
    }
    Some((host, port))
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Decodes a byte stream of concatenated JSON handshake documents and encodes
/// one document per write.
#[derive(Debug, Default)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = HandshakeMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (next, consumed) = {
            let mut documents =
                serde_json::Deserializer::from_slice(src).into_iter::<HandshakeMessage>();
            let next = documents.next();
            (next, documents.byte_offset())
        };
        match next {
            Some(Ok(message)) => {
                src.advance(consumed);
                Ok(Some(message))
            }
            Some(Err(err)) if err.is_eof() => {
                if src.len() > MAX_HANDSHAKE_LEN {
                    return Err(Error::Protocol(format!(
                        "handshake message exceeds {MAX_HANDSHAKE_LEN} bytes"
                    )));
                }
                Ok(None)
            }
            Some(Err(err)) => Err(err.into()),
            None => {
                src.clear();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.iter().all(u8::is_ascii_whitespace) => Ok(None),
            None => Err(Error::Protocol("handshake stream ended mid-message".into())),
        }
    }
}

impl Encoder<HandshakeMessage> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, item: HandshakeMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = serde_json::to_vec(&item)?;
        dst.extend_from_slice(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_permitted(policies: &[DialPolicy], network: &str, host: &str, port: u16) {
        let protocol = format_address(network, &format!("{host}:{port}"));
        let (got_network, got_address) = resolve_address(policies, &protocol)
            .unwrap_or_else(|err| panic!("{protocol} rejected: {err}"));
        assert_eq!(got_network, network);
        assert_eq!(got_address, format!("{host}:{port}"));
    }

    #[test]
    fn resolves_without_policies() {
        let (network, address) = resolve_address(&[], "tcp:localhost:1234").unwrap();
        assert_eq!(network, "tcp");
        assert_eq!(address, "localhost:1234");

        let (_, address) = resolve_address(&[], "tcp:[::1]:22").unwrap();
        assert_eq!(address, "[::1]:22");
    }

    #[test]
    fn rejects_malformed_protocols() {
        let cases = [
            ("", "invalid"),
            ("a:b", "invalid"),
            ("a:b:c:d", "invalid"),
            (":localhost:1234", "network"),
            ("tcp::1234", "host"),
            ("tcp:localhost:", "port"),
            ("tcp:localhost:asdf", "port"),
            ("tcp:localhost:-1", "port"),
            ("tcp:localhost:65536", "port"),
        ];
        for (protocol, needle) in cases {
            let err = resolve_address(&[], protocol)
                .expect_err(&format!("{protocol:?} should be rejected"));
            assert!(
                err.to_string().contains(needle),
                "{protocol:?}: {err} does not mention {needle}"
            );
        }
    }

    #[test]
    fn wildcard_network_policy_permits() {
        let policies = [DialPolicy::new("tcp", "", 0)];
        assert!(resolve_address(&policies, "tcp:localhost:1234").is_ok());

        let policies = [DialPolicy::new("udp", "", 0)];
        let err = resolve_address(&policies, "tcp:localhost:1234").unwrap_err();
        assert!(err.to_string().contains("not permitted"));
    }

    #[test]
    fn checks_each_policy_field() {
        let noise = [
            DialPolicy::new("asdf", "localhost", 1234),
            DialPolicy::new("tcp", "asdf", 1234),
            DialPolicy::new("tcp", "localhost", 17208),
        ];
        let cases = [
            ("tcp", "localhost", DialPolicy::new("tcp", "localhost", 1234), true),
            ("tcp", "localhost", DialPolicy::new("udp", "example.com", 51), false),
            ("tcp", "localhost", DialPolicy::new("", "localhost", 1234), true),
            ("tcp", "localhost", DialPolicy::new("udp", "localhost", 1234), false),
            ("tcp", "localhost", DialPolicy::new("tcp", "", 1234), true),
            ("tcp", "localhost", DialPolicy::new("tcp", "127.0.0.1", 1234), true),
            ("tcp", "127.0.0.1", DialPolicy::new("tcp", "127.1.2.3", 1234), true),
            ("tcp", "[::1]", DialPolicy::new("tcp", "127.1.2.3", 1234), true),
            ("tcp", "localhost", DialPolicy::new("tcp", "example.com", 1234), false),
            ("tcp", "example.com", DialPolicy::new("tcp", "localhost", 1234), false),
            ("tcp", "localhost", DialPolicy::new("tcp", "localhost", 5678), false),
            ("tcp", "localhost", DialPolicy::new("tcp", "localhost", 0), true),
        ];

        for (network, host, policy, ok) in cases {
            assert_eq!(
                policy.permits(network, &canonicalize_host(host), 1234),
                ok,
                "{policy:?} against {network}:{host}"
            );
            if ok {
                let mut policies = noise.to_vec();
                policies.push(policy);
                assert_permitted(&policies, network, host, 1234);
            } else {
                let protocol = format_address(network, &format!("{host}:1234"));
                let err = resolve_address(&[policy], &protocol).unwrap_err();
                assert!(matches!(err, PolicyError::NotPermitted(_)), "{err}");
            }
        }
    }

    #[test]
    fn canonicalizes_loopback_spellings() {
        assert_eq!(canonicalize_host("127.0.0.1"), "localhost");
        assert_eq!(canonicalize_host("127.9.9.9"), "localhost");
        assert_eq!(canonicalize_host("[::1]"), "localhost");
        assert_eq!(canonicalize_host("localhost"), "localhost");
        assert_eq!(canonicalize_host("[fe80::1]"), "fe80::1");
        assert_eq!(canonicalize_host("10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn codec_splits_concatenated_documents() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(br#"{"candidate":"a"}{"error":"nope"}{"cand"#);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.candidate.as_deref(), Some("a"));
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.error.as_deref(), Some("nope"));
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(br#"idate":"b"}"#);
        let third = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(third.candidate.as_deref(), Some("b"));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_rejects_garbage_and_truncation() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::from(&b"not json"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::Json(_))));

        let mut buf = BytesMut::from(&br#"{"error":"#[..]);
        assert!(matches!(codec.decode_eof(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn missing_servers_is_distinct_from_empty() {
        let message: HandshakeMessage = serde_json::from_str(r#"{"candidate":""}"#).unwrap();
        assert!(message.ice_servers.is_none());
        assert!(message.candidate.is_none());

        let message: HandshakeMessage = serde_json::from_str(r#"{"servers":[]}"#).unwrap();
        assert_eq!(message.ice_servers.map(|servers| servers.len()), Some(0));

        let encoded = serde_json::to_string(&HandshakeMessage::candidate("c")).unwrap();
        assert_eq!(encoded, r#"{"candidate":"c"}"#);
    }

    #[test]
    fn dial_response_maps_codes() {
        assert!(DialChannelResponse::ok().into_result().is_ok());

        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err = DialChannelResponse::dial_failed("tcp", &io)
            .into_result()
            .unwrap_err();
        assert!(matches!(err, Error::Dial { ref op, ref net, .. } if op == "dial" && net == "tcp"));

        let policy = PolicyError::NotPermitted("tcp:example.com:1".into());
        let err = DialChannelResponse::bad_address(&policy)
            .into_result()
            .unwrap_err();
        assert!(err.to_string().contains("not permitted"));
    }
}
