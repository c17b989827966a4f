//! ICE server descriptors and pre-flight validation of STUN/TURN relays.

use std::any::Any;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use webrtc::dtls::config::Config as DtlsConfig;
use webrtc::dtls::conn::DTLSConn;
use webrtc::ice::url::{ProtoType, SchemeType, Url};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::turn::client::{Client, ClientConfig};
use webrtc::util::Conn;

const DEFAULT_VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);
const STUN_RTO_MS: u16 = 200;
const STUN_HEADER_LEN: usize = 20;
const CHANNEL_DATA_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    #[default]
    Password,
    Oauth,
}

/// A STUN or TURN server in the standard WebRTC descriptor shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
    #[serde(default)]
    pub credential_type: CredentialType,
}

impl IceServerConfig {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            ..Default::default()
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.credential = credential.into();
        self.credential_type = CredentialType::Password;
        self
    }

    fn password(&self) -> String {
        match self.credential_type {
            CredentialType::Password => self.credential.clone(),
            CredentialType::Oauth => String::new(),
        }
    }

    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone(),
            credential: self.password(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidateOptions {
    /// Bounds each URL's exchange; defaults to five seconds.
    pub timeout: Option<Duration>,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Error)]
pub enum IceError {
    /// The relay never answered over the requested transport, e.g. TCP was
    /// requested from a UDP-only relay or TURN from a STUN-only endpoint.
    #[error("{url}: mismatched protocols")]
    MismatchedProtocol { url: String },
    #[error("{url}: invalid credentials")]
    InvalidCredentials { url: String },
    #[error("{url}: unsupported ice url: {reason}")]
    Unsupported { url: String, reason: String },
    #[error("{url}: transport: {message}")]
    Transport { url: String, message: String },
    #[error("{url}: {message}")]
    Stun { url: String, message: String },
}

/// Checks that every URL of `server` completes a STUN binding, and for TURN
/// URLs also a relay allocation with the configured credentials.
pub async fn validate_ice_server(
    server: &IceServerConfig,
    options: &ValidateOptions,
) -> Result<(), IceError> {
    for url in &server.urls {
        validate_url(server, url, options).await?;
    }
    Ok(())
}

async fn validate_url(
    server: &IceServerConfig,
    raw_url: &str,
    options: &ValidateOptions,
) -> Result<(), IceError> {
    let url = raw_url.to_string();
    let parsed = Url::parse_url(raw_url).map_err(|err| IceError::Unsupported {
        url: url.clone(),
        reason: err.to_string(),
    })?;
    let address = if parsed.host.contains(':') {
        format!("[{}]:{}", parsed.host, parsed.port)
    } else {
        format!("{}:{}", parsed.host, parsed.port)
    };
    let wait = options.timeout.unwrap_or(DEFAULT_VALIDATE_TIMEOUT);
    let allocate = matches!(parsed.scheme, SchemeType::Turn | SchemeType::Turns);

    let conn = match timeout(wait, open_transport(&url, &parsed, &address, options)).await {
        Ok(conn) => conn?,
        Err(_) => return Err(IceError::MismatchedProtocol { url }),
    };

    let client = Client::new(ClientConfig {
        stun_serv_addr: address.clone(),
        turn_serv_addr: address,
        username: server.username.clone(),
        password: server.password(),
        realm: String::new(),
        software: String::new(),
        rto_in_ms: STUN_RTO_MS,
        conn,
        vnet: None,
    })
    .await
    .map_err(|err| IceError::Transport {
        url: url.clone(),
        message: err.to_string(),
    })?;
    client.listen().await.map_err(|err| IceError::Transport {
        url: url.clone(),
        message: err.to_string(),
    })?;

    let outcome = match timeout(wait, exchange(&client, &url, allocate)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(IceError::MismatchedProtocol { url: url.clone() }),
    };
    if let Err(err) = client.close().await {
        tracing::trace!(target = "wsnet::ice", url = %url, error = %err, "turn client close failed");
    }
    tracing::debug!(target = "wsnet::ice", url = %url, ok = outcome.is_ok(), "ice server validated");
    outcome
}

async fn exchange(client: &Client, url: &str, allocate: bool) -> Result<(), IceError> {
    // STUN and TURN share the binding request, so this only proves the
    // transport works; credentials are exercised by the allocation.
    client
        .send_binding_request()
        .await
        .map_err(|err| classify(url, err.to_string(), false))?;
    if allocate {
        let relay = client
            .allocate()
            .await
            .map_err(|err| classify(url, err.to_string(), true))?;
        let _ = relay.close().await;
    }
    Ok(())
}

fn classify(url: &str, message: String, allocating: bool) -> IceError {
    let url = url.to_string();
    if message.contains("retransmissions failed") {
        return IceError::MismatchedProtocol { url };
    }
    // Allocate rejections read "<type> (error <code>: <reason>)".
    if allocating && matches!(error_code(&message), Some(400..=499)) {
        return IceError::InvalidCredentials { url };
    }
    IceError::Stun { url, message }
}

fn error_code(message: &str) -> Option<u16> {
    message.match_indices("error ").find_map(|(at, marker)| {
        let rest = &message[at + marker.len()..];
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        rest[..digits].parse().ok()
    })
}

/// Binds a UDP socket in the address family of the relay at `address`.
async fn bind_udp(address: &str) -> std::io::Result<UdpSocket> {
    let remote = tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "relay did not resolve"))?;
    let local: SocketAddr = if remote.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    UdpSocket::bind(local).await
}

async fn open_transport(
    url: &str,
    parsed: &Url,
    address: &str,
    options: &ValidateOptions,
) -> Result<Arc<dyn Conn + Send + Sync>, IceError> {
    let transport = |err: &dyn std::fmt::Display| IceError::Transport {
        url: url.to_string(),
        message: err.to_string(),
    };

    match (parsed.scheme, parsed.proto) {
        (SchemeType::Stun | SchemeType::Turn, ProtoType::Udp) => {
            let socket = bind_udp(address).await.map_err(|err| transport(&err))?;
            Ok(Arc::new(socket))
        }
        (SchemeType::Stun | SchemeType::Turn, ProtoType::Tcp) => {
            let stream = connect_tcp(url, address).await?;
            let conn = StunStreamConn::new(stream).map_err(|err| transport(&err))?;
            Ok(Arc::new(conn))
        }
        (SchemeType::Stuns | SchemeType::Turns, ProtoType::Udp) => {
            let socket = bind_udp(address).await.map_err(|err| transport(&err))?;
            socket.connect(address).await.map_err(|err| transport(&err))?;
            let remote = socket.peer_addr().map_err(|err| transport(&err))?;
            let config = DtlsConfig {
                insecure_skip_verify: options.insecure_skip_verify,
                server_name: parsed.host.clone(),
                ..Default::default()
            };
            let dtls = DTLSConn::new(Arc::new(socket), config, true, None)
                .await
                .map_err(|err| transport(&err))?;
            Ok(Arc::new(ConnectedDatagram {
                inner: Arc::new(dtls),
                remote,
            }))
        }
        (SchemeType::Stuns | SchemeType::Turns, ProtoType::Tcp) => {
            let stream = connect_tcp(url, address).await?;
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(options.insecure_skip_verify)
                .danger_accept_invalid_hostnames(options.insecure_skip_verify)
                .build()
                .map_err(|err| transport(&err))?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            let local = stream.local_addr().map_err(|err| transport(&err))?;
            let remote = stream.peer_addr().map_err(|err| transport(&err))?;
            let tls = connector
                .connect(&parsed.host, stream)
                .await
                .map_err(|err| transport(&err))?;
            Ok(Arc::new(StunStreamConn::from_parts(tls, local, remote)))
        }
        (scheme, proto) => Err(IceError::Unsupported {
            url: url.to_string(),
            reason: format!("scheme {scheme} over {proto}"),
        }),
    }
}

async fn connect_tcp(url: &str, address: &str) -> Result<TcpStream, IceError> {
    match TcpStream::connect(address).await {
        Ok(stream) => Ok(stream),
        // Nothing listens for TCP at the relay address.
        Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
            Err(IceError::MismatchedProtocol {
                url: url.to_string(),
            })
        }
        Err(err) => Err(IceError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }),
    }
}

fn util_error<E: std::fmt::Display>(err: E) -> webrtc::util::Error {
    webrtc::util::Error::Other(err.to_string())
}

/// Carries STUN messages and TURN ChannelData over a byte stream, splitting
/// the stream back into one message per read.
struct StunStreamConn<S> {
    reader: AsyncMutex<(ReadHalf<S>, BytesMut)>,
    writer: AsyncMutex<WriteHalf<S>>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl StunStreamConn<TcpStream> {
    fn new(stream: TcpStream) -> std::io::Result<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        Ok(Self::from_parts(stream, local, remote))
    }
}

impl<S: AsyncRead + AsyncWrite> StunStreamConn<S> {
    fn from_parts(stream: S, local: SocketAddr, remote: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: AsyncMutex::new((reader, BytesMut::new())),
            writer: AsyncMutex::new(writer),
            local,
            remote,
        }
    }
}

/// Length of the first framed message in `buf`, once its header is present.
fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < CHANNEL_DATA_HEADER_LEN {
        return None;
    }
    let body = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf[0] & 0xC0 == 0 {
        Some(STUN_HEADER_LEN + body)
    } else {
        // ChannelData over stream transports is padded to four bytes.
        Some(CHANNEL_DATA_HEADER_LEN + body.div_ceil(4) * 4)
    }
}

#[async_trait]
impl<S> Conn for StunStreamConn<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn connect(&self, _addr: SocketAddr) -> webrtc::util::Result<()> {
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> webrtc::util::Result<usize> {
        let mut guard = self.reader.lock().await;
        let (reader, pending) = &mut *guard;
        loop {
            if let Some(len) = frame_len(pending) {
                if pending.len() >= len {
                    let frame = pending.split_to(len);
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    return Ok(n);
                }
            }
            let mut chunk = [0u8; 2048];
            let n = reader.read(&mut chunk).await.map_err(util_error)?;
            if n == 0 {
                return Err(util_error("stream closed by relay"));
            }
            pending.extend_from_slice(&chunk[..n]);
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> webrtc::util::Result<(usize, SocketAddr)> {
        let n = self.recv(buf).await?;
        Ok((n, self.remote))
    }

    async fn send(&self, buf: &[u8]) -> webrtc::util::Result<usize> {
        let mut writer = self.writer.lock().await;
        writer.write_all(buf).await.map_err(util_error)?;
        Ok(buf.len())
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> webrtc::util::Result<usize> {
        self.send(buf).await
    }

    fn local_addr(&self) -> webrtc::util::Result<SocketAddr> {
        Ok(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    async fn close(&self) -> webrtc::util::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(util_error)
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// Presents a connected datagram transport (DTLS) as an addressable packet
/// conn by ignoring destination addresses.
struct ConnectedDatagram {
    inner: Arc<dyn Conn + Send + Sync>,
    remote: SocketAddr,
}

#[async_trait]
impl Conn for ConnectedDatagram {
    async fn connect(&self, _addr: SocketAddr) -> webrtc::util::Result<()> {
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> webrtc::util::Result<usize> {
        self.inner.recv(buf).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> webrtc::util::Result<(usize, SocketAddr)> {
        let n = self.inner.recv(buf).await?;
        Ok((n, self.remote))
    }

    async fn send(&self, buf: &[u8]) -> webrtc::util::Result<usize> {
        self.inner.send(buf).await
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> webrtc::util::Result<usize> {
        self.inner.send(buf).await
    }

    fn local_addr(&self) -> webrtc::util::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    async fn close(&self) -> webrtc::util::Result<()> {
        self.inner.close().await
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid token format")]
pub struct InvalidToken;

/// Derives TURN credentials from a `<id>-<secret>` session token.
pub fn turn_credentials(token: &str) -> Result<(String, String), InvalidToken> {
    let (username, secret) = token.split_once('-').ok_or(InvalidToken)?;
    let digest = Sha256::digest(secret.as_bytes());
    let password = base64::engine::general_purpose::STANDARD.encode(digest);
    Ok((username.to_string(), password))
}
