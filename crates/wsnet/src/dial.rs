//! The initiating side: negotiates a peer connection through a broker and
//! opens proxied data channels over it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::codec::FramedRead;
use webrtc::data::data_channel::DataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::broker;
use crate::conn::{ChannelAddr, ChannelRegistry, DataChannelConn};
use crate::error::{rtc_error, Error};
use crate::ice::IceServerConfig;
use crate::negotiate::Negotiator;
use crate::proto::{
    format_address, DialChannelResponse, DialPolicy, HandshakeCodec, HandshakeMessage,
    CONTROL_CHANNEL, PROXY_CHANNEL,
};
use crate::rtc::{new_peer, wait_for_channel_open, wait_for_state, Peer, SignalSender};

const PING_TIMEOUT: Duration = Duration::from_secs(15);
const DIAL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const PING_PAYLOAD: &[u8] = b"a";
const MAX_DIAL_RESPONSE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Servers used by both peers. Sent to the listener with the offer.
    pub ice_servers: Vec<IceServerConfig>,
    /// Addresses the listener may connect to on this dialer's behalf. Empty
    /// permits every address. Brokers usually inject these.
    pub policies: Vec<DialPolicy>,
    /// Bounds the wait for the control channel to open.
    pub connect_timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            policies: Vec::new(),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Connects to the broker at `url` and negotiates a peer connection with the
/// listener behind it.
pub async fn dial_websocket(url: &str, options: DialOptions) -> Result<Dialer, Error> {
    tracing::debug!(target = "wsnet::dial", url = %url, "dialing broker");
    let conn = broker::connect(url).await?;
    dial(conn, options).await
}

/// Negotiates a peer connection over an already established handshake
/// stream. The stream is closed once the connection is up.
pub async fn dial<T>(io: T, options: DialOptions) -> Result<Dialer, Error>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let peer = new_peer(&options.ice_servers).await?;
    match negotiate_offer(io, &peer, &options).await {
        Ok(control) => {
            tracing::debug!(target = "wsnet::dial", "dialer connected");
            Ok(Dialer::new(peer, control, options.ice_servers))
        }
        Err(err) => {
            let state = peer.pc.connection_state();
            if let Err(close_err) = peer.pc.close().await {
                tracing::trace!(target = "wsnet::dial", error = %close_err, "close peer connection");
            }
            Err(Error::handshake(err, &options.ice_servers, state))
        }
    }
}

async fn negotiate_offer<T>(
    io: T,
    peer: &Peer,
    options: &DialOptions,
) -> Result<Arc<RTCDataChannel>, Error>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(io);
    // Candidates queue until the offer is on the wire
    let signals = SignalSender::new(Box::new(writer));
    signals.attach(&peer.pc);

    let control = peer
        .pc
        .create_data_channel(
            CONTROL_CHANNEL,
            Some(RTCDataChannelInit {
                ordered: Some(true),
                protocol: Some(CONTROL_CHANNEL.to_string()),
                ..Default::default()
            }),
        )
        .await
        .map_err(rtc_error)?;

    // Create and send the offer
    let offer = peer
        .pc
        .create_offer(None)
        .await
        .map_err(|err| Error::Rtc(format!("create offer: {err}")))?;
    peer.pc
        .set_local_description(offer)
        .await
        .map_err(|err| Error::Rtc(format!("set local description: {err}")))?;
    let local = peer
        .pc
        .local_description()
        .await
        .ok_or_else(|| Error::Rtc("missing local description".into()))?;
    signals
        .send_description(HandshakeMessage::offer(
            local,
            options.ice_servers.clone(),
            options.policies.clone(),
        ))
        .await?;

    // Read answer and candidates until the control channel opens
    let mut negotiator = Negotiator::offerer(
        peer.clone(),
        control.clone(),
        options.connect_timeout,
        signals,
    );
    negotiator
        .run(FramedRead::new(reader, HandshakeCodec))
        .await?;
    Ok(control)
}

/// A connected peer that opens proxied streams to addresses on the
/// listener's network.
pub struct Dialer {
    peer: Peer,
    ice_servers: Vec<IceServerConfig>,
    control: Arc<RTCDataChannel>,
    control_io: AsyncMutex<Option<Arc<DataChannel>>>,
    channels: Arc<ChannelRegistry>,
    closed: Arc<watch::Sender<bool>>,
    closing: AtomicBool,
}

impl Dialer {
    fn new(peer: Peer, control: Arc<RTCDataChannel>, ice_servers: Vec<IceServerConfig>) -> Self {
        let channels = Arc::new(ChannelRegistry::default());
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let mut state = peer.state.clone();
        let watched_channels = channels.clone();
        let watched_closed = closed.clone();
        tokio::spawn(async move {
            wait_for_state(&mut state, |state| state == RTCPeerConnectionState::Connected).await;
            let state =
                wait_for_state(&mut state, |state| state != RTCPeerConnectionState::Connected)
                    .await;
            tracing::debug!(target = "wsnet::dial", state = %state, "peer connection lost");
            watched_channels.close_all().await;
            watched_closed.send_replace(true);
        });

        Self {
            peer,
            ice_servers,
            control,
            control_io: AsyncMutex::new(None),
            channels,
            closed,
            closing: AtomicBool::new(false),
        }
    }

    pub fn ice_servers(&self) -> &[IceServerConfig] {
        &self.ice_servers
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.peer.pc.connection_state()
    }

    /// Resolves once the peer connection is gone or [`Dialer::close`] was
    /// called.
    pub async fn closed(&self) {
        crate::wait_closed(&mut self.closed.subscribe()).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
            || matches!(
                self.peer.pc.connection_state(),
                RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed
            )
    }

    /// Streams opened by [`Dialer::dial_context`] that are still in use.
    pub fn active_connections(&self) -> usize {
        self.channels.active()
    }

    /// Streams ever requested, including closed ones.
    pub fn channels_requested(&self) -> usize {
        self.channels.requested()
    }

    /// Round-trips a byte over the control channel.
    pub async fn ping(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let mut control_io = self.control_io.lock().await;
        let raw = match control_io.as_ref() {
            Some(raw) => raw.clone(),
            None => {
                wait_for_channel_open(&self.control, PING_TIMEOUT).await?;
                let raw = self.control.detach().await.map_err(rtc_error)?;
                *control_io = Some(raw.clone());
                raw
            }
        };

        let round_trip = async {
            raw.write(&Bytes::from_static(PING_PAYLOAD))
                .await
                .map_err(|_| Error::ConnectionClosed)?;
            let mut buf = [0u8; 64];
            match raw.read(&mut buf).await {
                Ok(0) | Err(_) => Err(Error::ConnectionClosed),
                Ok(_) => Ok(()),
            }
        };
        tokio::time::timeout(PING_TIMEOUT, round_trip)
            .await
            .map_err(|_| Error::Timeout("ping response"))?
    }

    /// Opens a stream to `address` on the listener's network.
    pub async fn dial_context(&self, network: &str, address: &str) -> Result<DataChannelConn, Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let ordered = !network.starts_with("udp");
        let channel = self
            .peer
            .pc
            .create_data_channel(
                PROXY_CHANNEL,
                Some(RTCDataChannelInit {
                    ordered: Some(ordered),
                    protocol: Some(format_address(network, address)),
                    ..Default::default()
                }),
            )
            .await
            .map_err(rtc_error)?;
        let lease = self.channels.register(channel.clone());

        // The listener dials the target once the channel opens and reports back

        let opened = async {
            wait_for_channel_open(&channel, PING_TIMEOUT).await?;
            let addr = ChannelAddr {
                network: network.to_string(),
                address: address.to_string(),
            };
            let mut conn = DataChannelConn::open(channel.clone(), addr, Some(lease)).await?;
            tokio::time::timeout(DIAL_RESPONSE_TIMEOUT, read_dial_response(&mut conn))
                .await
                .map_err(|_| Error::Timeout("dial response"))??;
            Ok(conn)
        };
        match opened.await {
            Ok(conn) => Ok(conn),
            Err(err) => {
                // Dropping the lease uncounts the channel; close it on the wire too
                tracing::debug!(
                    target = "wsnet::dial",
                    network = %network,
                    address = %address,
                    error = %err,
                    "dial through peer failed"
                );
                let _ = channel.close().await;
                Err(err)
            }
        }
    }

    /// Closes the peer connection. Safe to call more than once.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channels.close_all().await;
        let result = self.peer.pc.close().await.map_err(rtc_error);
        self.closed.send_replace(true);
        result
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.send_replace(true);
        // Without a runtime the peer connection's own tasks are gone too.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pc = self.peer.pc.clone();
            let channels = self.channels.clone();
            handle.spawn(async move {
                channels.close_all().await;
                if let Err(err) = pc.close().await {
                    tracing::trace!(target = "wsnet::dial", error = %err, "close dropped peer connection");
                }
            });
        }
    }
}

/// Reads the listener's JSON verdict, keeping any bytes that followed it.
async fn read_dial_response(conn: &mut DataChannelConn) -> Result<(), Error> {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; crate::conn::MAX_MESSAGE_SIZE];
    loop {
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut documents =
            serde_json::Deserializer::from_slice(&buf).into_iter::<DialChannelResponse>();
        match documents.next() {
            Some(Ok(response)) => {
                let consumed = documents.byte_offset();
                conn.set_prefix(Bytes::copy_from_slice(&buf[consumed..]));
                return response.into_result();
            }
            Some(Err(err)) if err.is_eof() && buf.len() < MAX_DIAL_RESPONSE_LEN => continue,
            Some(Err(err)) => return Err(err.into()),
            None => continue,
        }
    }
}
