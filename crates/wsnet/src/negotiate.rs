//! Offer/answer exchange over a handshake stream.
//!
//! Both sides run the same [`Negotiator`]; the role decides which session
//! descriptions it accepts and when the exchange is finished. The offerer is
//! done once its control channel opens. The answerer is done once its peer
//! connection leaves the connecting states.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::Error;
use crate::proto::{HandshakeCodec, HandshakeMessage};
use crate::rtc::{wait_for_channel_open, wait_for_state, Peer, SignalSender};

/// Builds the answering peer connection for an incoming offer.
#[async_trait]
pub(crate) trait OfferAcceptor: Send + Sync {
    async fn accept_offer(&self, message: &HandshakeMessage) -> Result<Peer, Error>;
}

pub(crate) enum Role {
    Offerer {
        control: Arc<RTCDataChannel>,
        open_timeout: Duration,
    },
    Answerer(Arc<dyn OfferAcceptor>),
}

enum Liveness {
    Pending,
    Running(BoxFuture<'static, Result<(), Error>>),
}

enum Event {
    Live(Result<(), Error>),
    Message(Option<Result<HandshakeMessage, Error>>),
}

pub(crate) struct Negotiator {
    role: Role,
    signals: SignalSender,
    peer: Option<Peer>,
    remote_described: bool,
    pending: Vec<RTCIceCandidateInit>,
}

impl Negotiator {
    pub fn offerer(
        peer: Peer,
        control: Arc<RTCDataChannel>,
        open_timeout: Duration,
        signals: SignalSender,
    ) -> Self {
        Self {
            role: Role::Offerer {
                control,
                open_timeout,
            },
            signals,
            peer: Some(peer),
            remote_described: false,
            pending: Vec::new(),
        }
    }

    pub fn answerer(acceptor: Arc<dyn OfferAcceptor>, signals: SignalSender) -> Self {
        Self {
            role: Role::Answerer(acceptor),
            signals,
            peer: None,
            remote_described: false,
            pending: Vec::new(),
        }
    }

    fn liveness(&self) -> Liveness {
        match (&self.role, &self.peer) {
            (
                Role::Offerer {
                    control,
                    open_timeout,
                },
                _,
            ) => {
                let control = control.clone();
                let open_timeout = *open_timeout;
                Liveness::Running(
                    async move { wait_for_channel_open(&control, open_timeout).await }.boxed(),
                )
            }
            (Role::Answerer(_), Some(peer)) => {
                let mut state = peer.state.clone();
                Liveness::Running(
                    async move {
                        wait_for_state(&mut state, |state| {
                            !matches!(
                                state,
                                RTCPeerConnectionState::New
                                    | RTCPeerConnectionState::Connecting
                                    | RTCPeerConnectionState::Unspecified
                            )
                        })
                        .await;
                        Ok(())
                    }
                    .boxed(),
                )
            }
            (Role::Answerer(_), None) => Liveness::Pending,
        }
    }

    /// Processes handshake messages until the connection is established or
    /// the remote side ends the stream. The write side of the stream is
    /// closed on success.
    pub async fn run<R>(&mut self, mut messages: FramedRead<R, HandshakeCodec>) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut liveness = self.liveness();
        loop {
            let event = match &mut liveness {
                Liveness::Running(live) => tokio::select! {
                    outcome = live => Event::Live(outcome),
                    next = messages.next() => Event::Message(next),
                },
                Liveness::Pending => Event::Message(messages.next().await),
            };
            match event {
                Event::Live(outcome) => {
                    if let Err(err) = outcome {
                        self.signals.abort().await;
                        return Err(err);
                    }
                    tracing::debug!(target = "wsnet::negotiate", "peer connection established");
                    return self.signals.close().await;
                }
                Event::Message(Some(message)) => {
                    self.handle(message?).await?;
                    if matches!(liveness, Liveness::Pending) {
                        liveness = self.liveness();
                    }
                }
                Event::Message(None) => break,
            }
        }

        match (liveness, &self.role) {
            (Liveness::Running(live), Role::Offerer { .. }) => {
                if let Err(err) = live.await {
                    self.signals.abort().await;
                    return Err(err);
                }
                self.signals.close().await
            }
            (Liveness::Pending, Role::Answerer(_)) => Err(Error::Protocol(
                "handshake stream ended before an offer arrived".into(),
            )),
            _ => self.signals.close().await,
        }
    }

    async fn handle(&mut self, mut message: HandshakeMessage) -> Result<(), Error> {
        if let Some(error) = message.error.take() {
            return Err(Error::Remote(error));
        }
        if let Some(offer) = message.offer.take() {
            return self.handle_offer(offer, &message).await;
        }
        if let Some(answer) = message.answer {
            return self.handle_answer(answer).await;
        }
        if let Some(candidate) = message.candidate {
            return self.handle_candidate(candidate).await;
        }
        Err(Error::Protocol("empty handshake message".into()))
    }

    async fn handle_offer(
        &mut self,
        offer: RTCSessionDescription,
        message: &HandshakeMessage,
    ) -> Result<(), Error> {
        let acceptor = match &self.role {
            Role::Answerer(acceptor) => acceptor.clone(),
            Role::Offerer { .. } => return Err(Error::Protocol("unexpected offer".into())),
        };
        if self.peer.is_some() {
            return Err(Error::Protocol("duplicate offer".into()));
        }
        // Build the peer from the offer's servers and start gathering
        let peer = acceptor.accept_offer(message).await?;
        self.signals.attach(&peer.pc);
        self.peer = Some(peer.clone());

        peer.pc
            .set_remote_description(offer)
            .await
            .map_err(|err| Error::Rtc(format!("apply offer: {err}")))?;
        self.remote_described = true;

        // Answer, then release the candidates gathered meanwhile
        let answer = peer
            .pc
            .create_answer(None)
            .await
            .map_err(|err| Error::Rtc(format!("create answer: {err}")))?;
        peer.pc
            .set_local_description(answer)
            .await
            .map_err(|err| Error::Rtc(format!("set local description: {err}")))?;
        let local = peer
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Rtc("missing local description".into()))?;
        self.signals
            .send_description(HandshakeMessage::answer(local))
            .await
    }

    async fn handle_answer(&mut self, answer: RTCSessionDescription) -> Result<(), Error> {
        let peer = match (&self.role, &self.peer) {
            (Role::Offerer { .. }, Some(peer)) => peer.clone(),
            _ => return Err(Error::Protocol("unexpected answer".into())),
        };
        if self.remote_described {
            return Err(Error::Protocol("duplicate answer".into()));
        }
        peer.pc
            .set_remote_description(answer)
            .await
            .map_err(|err| Error::Rtc(format!("apply answer: {err}")))?;
        self.remote_described = true;
        // Apply candidates that raced ahead of the answer
        for candidate in std::mem::take(&mut self.pending) {
            peer.pc
                .add_ice_candidate(candidate)
                .await
                .map_err(|err| Error::Rtc(format!("add candidate: {err}")))?;
        }
        Ok(())
    }

    async fn handle_candidate(&mut self, candidate: String) -> Result<(), Error> {
        let init = RTCIceCandidateInit {
            candidate,
            ..Default::default()
        };
        match &self.peer {
            Some(peer) if self.remote_described => peer
                .pc
                .add_ice_candidate(init)
                .await
                .map_err(|err| Error::Rtc(format!("add candidate: {err}"))),
            Some(_) => {
                self.pending.push(init);
                Ok(())
            }
            None => Err(Error::Protocol("candidate received before offer".into())),
        }
    }

    /// Reports `err` to the remote side and tears down a peer connection
    /// that never connected.
    pub async fn reject(&self, err: &Error) {
        if let Err(send_err) = self.signals.send(HandshakeMessage::error(err.to_string())).await {
            tracing::trace!(target = "wsnet::negotiate", error = %send_err, "could not report handshake error");
        }
        let _ = self.signals.close().await;
        // A connected peer outlives its handshake
        if let Some(peer) = &self.peer {
            if peer.pc.connection_state() != RTCPeerConnectionState::Connected {
                let _ = peer.pc.close().await;
            }
        }
    }
}
