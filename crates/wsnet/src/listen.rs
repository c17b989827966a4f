//! The answering side: keeps a broker connection open, answers every offer
//! multiplexed over it, and serves the data channels peers open.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_yamux::{Config as YamuxConfig, Session, StreamHandle};
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::broker::{self, BrokerCloser, BrokerConn, CloseStatus};
use crate::conn::{ChannelAddr, DataChannelConn, MAX_MESSAGE_SIZE};
use crate::error::Error;
use crate::ice::{validate_ice_server, ValidateOptions};
use crate::negotiate::{Negotiator, OfferAcceptor};
use crate::proto::{
    resolve_address, DialChannelResponse, DialPolicy, HandshakeCodec, HandshakeMessage,
    CONTROL_CHANNEL,
};
use crate::rtc::{new_peer, wait_for_state, Peer, SignalSender};
use crate::wait_closed;

/// A data channel opened by a remote peer.
#[derive(Debug, Clone)]
pub struct ChannelRequest {
    pub label: String,
    pub protocol: String,
    /// Policies the peer's offer carried.
    pub policies: Arc<[DialPolicy]>,
}

/// Serves data channels opened by connected peers.
#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    async fn handle(&self, request: ChannelRequest, channel: DataChannelConn);
}

/// Echoes the control channel and proxies every other channel to the
/// address in its protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProxyHandler;

#[async_trait]
impl ChannelHandler for ProxyHandler {
    async fn handle(&self, request: ChannelRequest, channel: DataChannelConn) {
        if request.protocol == CONTROL_CHANNEL {
            echo(channel).await;
        } else {
            proxy(request, channel).await;
        }
    }
}

async fn echo(mut channel: DataChannelConn) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        let n = match channel.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(err) => {
                tracing::trace!(target = "wsnet::listen", error = %err, "control channel read");
                return;
            }
        };
        if channel.write_all(&buf[..n]).await.is_err() {
            return;
        }
    }
}

async fn proxy(request: ChannelRequest, mut channel: DataChannelConn) {
    let (network, address) = match resolve_address(&request.policies, &request.protocol) {
        Ok(resolved) => resolved,
        Err(err) => {
            tracing::debug!(target = "wsnet::listen", protocol = %request.protocol, error = %err, "rejected channel");
            let _ = write_response(&mut channel, &DialChannelResponse::bad_address(&err)).await;
            let _ = channel.shutdown().await;
            return;
        }
    };

    // Dial the target, then report before relaying any bytes
    let outcome = match network.as_str() {
        "tcp" | "tcp4" | "tcp6" => match TcpStream::connect(&address).await {
            Ok(stream) => {
                if write_response(&mut channel, &DialChannelResponse::ok()).await.is_ok() {
                    proxy_tcp(&mut channel, stream).await
                } else {
                    Ok(())
                }
            }
            Err(err) => Err(err),
        },
        "udp" | "udp4" | "udp6" => match connect_udp(&address).await {
            Ok(socket) => {
                if write_response(&mut channel, &DialChannelResponse::ok()).await.is_ok() {
                    proxy_udp(&mut channel, socket).await
                } else {
                    Ok(())
                }
            }
            Err(err) => Err(err),
        },
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unknown network {other}"),
        )),
    };

    if let Err(err) = outcome {
        tracing::debug!(
            target = "wsnet::listen",
            network = %network,
            address = %address,
            error = %err,
            "proxy dial failed"
        );
        let _ = write_response(&mut channel, &DialChannelResponse::dial_failed(&network, &err)).await;
    }
    let _ = channel.shutdown().await;
}

async fn write_response(
    channel: &mut DataChannelConn,
    response: &DialChannelResponse,
) -> Result<(), Error> {
    let data = serde_json::to_vec(response)?;
    channel.write_all(&data).await?;
    Ok(())
}

async fn proxy_tcp(channel: &mut DataChannelConn, mut stream: TcpStream) -> io::Result<()> {
    match tokio::io::copy_bidirectional(channel, &mut stream).await {
        Ok((sent, received)) => {
            tracing::trace!(target = "wsnet::listen", sent, received, "proxy finished");
        }
        Err(err) => {
            tracing::trace!(target = "wsnet::listen", error = %err, "proxy ended");
        }
    }
    Ok(())
}

async fn connect_udp(address: &str) -> io::Result<UdpSocket> {
    let target = tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address found"))?;
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;
    Ok(socket)
}

async fn proxy_udp(channel: &mut DataChannelConn, socket: UdpSocket) -> io::Result<()> {
    let mut inbound = vec![0u8; MAX_MESSAGE_SIZE];
    let mut outbound = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        tokio::select! {
            read = channel.read(&mut inbound) => match read {
                Ok(0) | Err(_) => return Ok(()),
                Ok(n) => { socket.send(&inbound[..n]).await?; }
            },
            received = socket.recv(&mut outbound) => {
                let n = received?;
                if channel.write_all(&outbound[..n]).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

pub struct ListenOptions {
    /// Delay between broker reconnection attempts.
    pub retry_interval: Duration,
    pub handler: Arc<dyn ChannelHandler>,
    /// Probe the ICE servers an offer carries before answering it.
    pub validate_ice_servers: bool,
    pub validate: ValidateOptions,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            handler: Arc::new(ProxyHandler),
            validate_ice_servers: true,
            validate: ValidateOptions::default(),
        }
    }
}

/// Listens for dialers on a broker. Reconnects to the broker until closed.
pub struct Listener {
    inner: Arc<ListenerInner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct ListenerInner {
    url: String,
    options: ListenOptions,
    peers: Mutex<Vec<Arc<RTCPeerConnection>>>,
    broker: Mutex<Option<BrokerCloser>>,
    closed: watch::Sender<bool>,
}

impl Listener {
    /// Connects to the broker at `url`. Fails if the first connection
    /// fails; later disconnects are retried in the background.
    pub async fn listen(url: impl Into<String>, options: ListenOptions) -> Result<Listener, Error> {
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(ListenerInner {
            url: url.into(),
            options,
            peers: Mutex::new(Vec::new()),
            broker: Mutex::new(None),
            closed,
        });
        let session = inner.connect().await?;
        let supervisor = tokio::spawn(inner.clone().supervise(session));
        Ok(Listener {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Peer connections answered by this listener that are not closed.
    pub fn peer_count(&self) -> usize {
        let mut peers = self.inner.peers.lock();
        peers.retain(|pc| !is_retired(pc.connection_state()));
        peers.len()
    }

    /// Closes every answered peer connection and the broker connection.
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<(), Error> {
        if self.inner.closed.send_replace(true) {
            return Ok(());
        }
        if let Some(broker) = self.inner.broker.lock().take() {
            broker.close(CloseStatus::Normal);
        }
        let peers: Vec<_> = self.inner.peers.lock().drain(..).collect();
        for pc in peers {
            if let Err(err) = pc.close().await {
                tracing::trace!(target = "wsnet::listen", error = %err, "close peer connection");
            }
        }
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
        tracing::debug!(target = "wsnet::listen", url = %self.inner.url, "listener closed");
        Ok(())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        if let Some(broker) = self.inner.broker.lock().take() {
            broker.close(CloseStatus::Normal);
        }
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }
    }
}

impl ListenerInner {
    async fn connect(&self) -> Result<Session<BrokerConn>, Error> {
        let conn = broker::connect(&self.url).await?;
        if let Some(previous) = self.broker.lock().replace(conn.closer()) {
            previous.close(CloseStatus::Normal);
        }
        tracing::debug!(target = "wsnet::listen", url = %self.url, "listening on broker");
        Ok(Session::new_server(conn, YamuxConfig::default()))
    }

    async fn supervise(self: Arc<Self>, mut session: Session<BrokerConn>) {
        let mut closed = self.closed.subscribe();
        loop {
            tokio::select! {
                outcome = self.clone().accept(session) => {
                    if let Err(err) = outcome {
                        tracing::debug!(target = "wsnet::listen", error = %err, "broker session ended");
                    }
                }
                _ = wait_closed(&mut closed) => return,
            }

            // Broker lost; retry until it is back or we are closed
            session = loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.retry_interval) => {}
                    _ = wait_closed(&mut closed) => return,
                }
                match self.connect().await {
                    Ok(session) => break session,
                    Err(err) => {
                        tracing::warn!(target = "wsnet::listen", url = %self.url, error = %err, "broker reconnect failed");
                    }
                }
            };
        }
    }

    async fn accept(self: Arc<Self>, mut session: Session<BrokerConn>) -> io::Result<()> {
        // Every stream the broker opens carries one dialer's handshake
        while let Some(stream) = session.next().await {
            let stream = stream?;
            tokio::spawn(self.clone().negotiate(stream));
        }
        Ok(())
    }

    async fn negotiate(self: Arc<Self>, stream: StreamHandle) {
        let (reader, writer) = tokio::io::split(stream);
        let signals = SignalSender::new(Box::new(writer));
        let acceptor: Arc<dyn OfferAcceptor> = self.clone();
        let mut negotiator = Negotiator::answerer(acceptor, signals);
        if let Err(err) = negotiator
            .run(FramedRead::new(reader, HandshakeCodec))
            .await
        {
            tracing::debug!(target = "wsnet::listen", error = %err, "negotiation failed");
            negotiator.reject(&err).await;
        }
    }

    fn track(&self, pc: Arc<RTCPeerConnection>) {
        let mut peers = self.peers.lock();
        peers.retain(|pc| !is_retired(pc.connection_state()));
        peers.push(pc);
    }
}

#[async_trait]
impl OfferAcceptor for ListenerInner {
    async fn accept_offer(&self, message: &HandshakeMessage) -> Result<Peer, Error> {
        let servers = message
            .ice_servers
            .as_ref()
            .ok_or_else(|| Error::Protocol("ICE servers must be provided".into()))?;
        // Reject relays we could not use before spending a peer on them
        if self.options.validate_ice_servers {
            for server in servers {
                validate_ice_server(server, &self.options.validate).await?;
            }
        }

        let peer = new_peer(servers).await?;
        if *self.closed.borrow() {
            let _ = peer.pc.close().await;
            return Err(Error::ConnectionClosed);
        }
        self.track(peer.pc.clone());
        close_on_failure(&peer);

        let handler = self.options.handler.clone();
        let policies: Arc<[DialPolicy]> = message.policies.clone().into();
        peer.pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let handler = handler.clone();
            let policies = policies.clone();
            Box::pin(async move {
                serve_channel(channel, handler, policies);
            })
        }));
        Ok(peer)
    }
}

/// Peers in these states never carry traffic again.
fn is_retired(state: RTCPeerConnectionState) -> bool {
    matches!(
        state,
        RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed
    )
}

/// Releases the ICE agent and transports of a peer whose connection failed.
fn close_on_failure(peer: &Peer) {
    let pc = peer.pc.clone();
    let mut state = peer.state.clone();
    tokio::spawn(async move {
        let state = wait_for_state(&mut state, is_retired).await;
        if state == RTCPeerConnectionState::Failed {
            tracing::debug!(target = "wsnet::listen", "closing failed peer connection");
            if let Err(err) = pc.close().await {
                tracing::trace!(target = "wsnet::listen", error = %err, "close failed peer connection");
            }
        }
    });
}

fn serve_channel(
    channel: Arc<RTCDataChannel>,
    handler: Arc<dyn ChannelHandler>,
    policies: Arc<[DialPolicy]>,
) {
    let opened = channel.clone();
    channel.on_open(Box::new(move || {
        let channel = opened.clone();
        let handler = handler.clone();
        let policies = policies.clone();
        Box::pin(async move {
            let request = ChannelRequest {
                label: channel.label().to_string(),
                protocol: channel.protocol().to_string(),
                policies,
            };
            let addr = ChannelAddr {
                network: "webrtc".into(),
                address: request.protocol.clone(),
            };
            match DataChannelConn::open(channel, addr, None).await {
                Ok(conn) => {
                    tokio::spawn(async move { handler.handle(request, conn).await });
                }
                Err(err) => {
                    tracing::warn!(target = "wsnet::listen", error = %err, "failed to detach data channel");
                }
            }
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_and_closed_peers_are_retired() {
        assert!(is_retired(RTCPeerConnectionState::Failed));
        assert!(is_retired(RTCPeerConnectionState::Closed));
        for state in [
            RTCPeerConnectionState::New,
            RTCPeerConnectionState::Connecting,
            RTCPeerConnectionState::Connected,
            RTCPeerConnectionState::Disconnected,
        ] {
            assert!(!is_retired(state), "{state} should stay tracked");
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn tracking_prunes_retired_peers() {
        let inner = ListenerInner {
            url: "ws://127.0.0.1:1/listen".into(),
            options: ListenOptions::default(),
            broker: Mutex::new(None),
            peers: Mutex::new(Vec::new()),
            closed: watch::channel(false).0,
        };
        let finished = new_peer(&[]).await.unwrap();
        inner.track(finished.pc.clone());
        finished.pc.close().await.unwrap();

        let live = new_peer(&[]).await.unwrap();
        inner.track(live.pc.clone());
        assert_eq!(inner.peers.lock().len(), 1);
        assert!(Arc::ptr_eq(&inner.peers.lock()[0], &live.pc));
        live.pc.close().await.unwrap();
    }
}
