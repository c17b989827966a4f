//! Peer connection construction and handshake signalling shared by both
//! sides of a negotiation.

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio_util::codec::FramedWrite;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::url::{SchemeType, Url};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{rtc_error, Error};
use crate::ice::IceServerConfig;
use crate::proto::{HandshakeCodec, HandshakeMessage};

pub(crate) const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// A peer connection together with a watch of its connection state.
#[derive(Clone)]
pub(crate) struct Peer {
    pub pc: Arc<RTCPeerConnection>,
    pub state: watch::Receiver<RTCPeerConnectionState>,
}

fn build_api(setting: SettingEngine) -> API {
    APIBuilder::new().with_setting_engine(setting).build()
}

pub(crate) async fn new_peer(servers: &[IceServerConfig]) -> Result<Peer, Error> {
    let mut setting = SettingEngine::default();
    setting.detach_data_channels();
    setting.set_network_types(vec![NetworkType::Udp4]);
    setting.set_srflx_acceptance_min_wait(Some(Duration::ZERO));
    setting.set_ice_timeouts(
        Some(Duration::from_secs(5)),
        Some(Duration::from_secs(25)),
        Some(Duration::from_secs(2)),
    );
    let api = build_api(setting);

    let mut config = RTCConfiguration {
        ice_servers: servers.iter().map(IceServerConfig::to_rtc).collect(),
        ..Default::default()
    };
    if relay_only(servers) {
        config.ice_transport_policy = RTCIceTransportPolicy::Relay;
    }

    let pc = Arc::new(api.new_peer_connection(config).await.map_err(rtc_error)?);
    let (tx, state) = watch::channel(pc.connection_state());
    pc.on_peer_connection_state_change(Box::new(move |next: RTCPeerConnectionState| {
        tracing::debug!(target = "wsnet::rtc", state = %next, "peer connection state changed");
        tx.send_replace(next);
        Box::pin(async {})
    }));
    Ok(Peer { pc, state })
}

/// A single TURN server with a single URL forces relayed candidates.
fn relay_only(servers: &[IceServerConfig]) -> bool {
    let [server] = servers else {
        return false;
    };
    let [url] = server.urls.as_slice() else {
        return false;
    };
    matches!(
        Url::parse_url(url).map(|url| url.scheme),
        Ok(SchemeType::Turn | SchemeType::Turns)
    )
}

pub(crate) async fn wait_for_state<F>(
    state: &mut watch::Receiver<RTCPeerConnectionState>,
    mut done: F,
) -> RTCPeerConnectionState
where
    F: FnMut(RTCPeerConnectionState) -> bool,
{
    loop {
        let current = *state.borrow_and_update();
        if done(current) || state.changed().await.is_err() {
            return current;
        }
    }
}

/// Waits for `channel` to open, failing fast if it is already closing.
pub(crate) async fn wait_for_channel_open(
    channel: &Arc<RTCDataChannel>,
    wait: Duration,
) -> Result<(), Error> {
    match channel.ready_state() {
        RTCDataChannelState::Open => return Ok(()),
        RTCDataChannelState::Closing | RTCDataChannelState::Closed => {
            return Err(Error::ConnectionClosed)
        }
        _ => {}
    }
    let opened = Arc::new(Notify::new());
    let signal = opened.clone();
    channel.on_open(Box::new(move || {
        let signal = signal.clone();
        Box::pin(async move {
            signal.notify_one();
        })
    }));
    if channel.ready_state() == RTCDataChannelState::Open {
        return Ok(());
    }
    tokio::time::timeout(wait, opened.notified())
        .await
        .map_err(|_| Error::Timeout("data channel to open"))
}

type SignalSink = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, HandshakeCodec>;

/// Local candidates are held back until the session description has been
/// written so the remote side never sees a candidate first.
enum CandidateQueue {
    NotFlushed(Vec<String>),
    Flushed,
}

struct SignalState {
    /// `None` once the stream was closed or abandoned.
    sink: Option<SignalSink>,
    candidates: CandidateQueue,
}

impl SignalState {
    async fn send(&mut self, message: HandshakeMessage) -> Result<(), Error> {
        match self.sink.as_mut() {
            Some(sink) => sink.send(message).await,
            None => Err(Error::ConnectionClosed),
        }
    }
}

/// Serialised writer for the handshake stream.
#[derive(Clone)]
pub(crate) struct SignalSender {
    state: Arc<AsyncMutex<SignalState>>,
}

impl SignalSender {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            state: Arc::new(AsyncMutex::new(SignalState {
                sink: Some(FramedWrite::new(writer, HandshakeCodec)),
                candidates: CandidateQueue::NotFlushed(Vec::new()),
            })),
        }
    }

    /// Forwards local ICE candidates of `pc` to the remote side.
    pub fn attach(&self, pc: &RTCPeerConnection) {
        let sender = self.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let sender = sender.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sender.candidate(init.candidate).await,
                    Err(err) => tracing::warn!(
                        target = "wsnet::rtc",
                        error = %err,
                        "failed to serialize local candidate"
                    ),
                }
            })
        }));
    }

    async fn candidate(&self, candidate: String) {
        let mut state = self.state.lock().await;
        if let CandidateQueue::NotFlushed(queue) = &mut state.candidates {
            queue.push(candidate);
            return;
        }
        if let Err(err) = state.send(HandshakeMessage::candidate(candidate)).await {
            tracing::trace!(target = "wsnet::rtc", error = %err, "dropped local candidate");
        }
    }

    /// Writes an offer or answer, then every candidate gathered so far.
    pub async fn send_description(&self, message: HandshakeMessage) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.send(message).await?;
        let queued = std::mem::replace(&mut state.candidates, CandidateQueue::Flushed);
        if let CandidateQueue::NotFlushed(queue) = queued {
            tracing::trace!(target = "wsnet::rtc", count = queue.len(), "flushing candidates");
            for candidate in queue {
                state.send(HandshakeMessage::candidate(candidate)).await?;
            }
        }
        Ok(())
    }

    pub async fn send(&self, message: HandshakeMessage) -> Result<(), Error> {
        self.state.lock().await.send(message).await
    }

    /// Closes the write side of the handshake stream. Later candidates are
    /// dropped.
    pub async fn close(&self) -> Result<(), Error> {
        let Some(mut sink) = self.state.lock().await.sink.take() else {
            return Ok(());
        };
        SinkExt::<HandshakeMessage>::close(&mut sink).await
    }

    /// Releases the write side without shutting it down, so a broker socket
    /// underneath ends with an abnormal close once its reader is gone too.
    pub async fn abort(&self) {
        drop(self.state.lock().await.sink.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn relay_policy_needs_a_lone_turn_url() {
        let turn = IceServerConfig::new(vec!["turn:relay.example.com:3478".into()]);
        let stun = IceServerConfig::new(vec!["stun:stun.example.com:3478".into()]);
        assert!(relay_only(&[turn.clone()]));
        assert!(!relay_only(&[stun.clone()]));
        assert!(!relay_only(&[turn.clone(), stun]));
        assert!(!relay_only(&[IceServerConfig::new(vec![
            "turn:a:3478".into(),
            "turn:b:3478".into()
        ])]));
        assert!(!relay_only(&[]));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn candidates_wait_for_the_description() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let signals = SignalSender::new(Box::new(local));

        signals.candidate("candidate:early".into()).await;
        signals
            .send_description(HandshakeMessage::error("stand-in description"))
            .await
            .unwrap();
        signals.candidate("candidate:late".into()).await;
        signals.close().await.unwrap();
        signals.candidate("candidate:after-close".into()).await;

        let mut written = String::new();
        remote.read_to_string(&mut written).await.unwrap();
        let description = written.find("stand-in description").unwrap();
        let early = written.find("candidate:early").unwrap();
        let late = written.find("candidate:late").unwrap();
        assert!(description < early && early < late);
        assert!(!written.contains("after-close"));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn aborted_signals_close_the_broker_abnormally() {
        use crate::broker::{BrokerConn, CloseStatus, Outbound};

        let (conn, mut frames) = BrokerConn::pair();
        let (reader, writer) = tokio::io::split(conn);
        let signals = SignalSender::new(Box::new(writer));
        signals.abort().await;
        assert!(matches!(
            signals.send(HandshakeMessage::error("late")).await,
            Err(Error::ConnectionClosed)
        ));
        drop(reader);

        assert!(matches!(
            frames.rx_out.recv().await,
            Some(Outbound::Close(CloseStatus::Abnormal(_)))
        ));
    }
}
