//! Byte-stream view of the broker WebSocket.
//!
//! Frames are moved between the socket and [`BrokerConn`] over unbounded
//! channels by a pump task, so any WebSocket implementation can back a
//! connection by driving a [`FrameChannel`].

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, WebSocketStream};

/// How long a pump keeps reading after sending a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);
/// Control frame payloads are capped at 125 bytes, two of which hold the code.
const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker rejected the connection with http {status}")]
    Http { status: u16 },
    #[error("dial broker: {0}")]
    Connect(String),
}

/// How a broker socket ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseStatus {
    Normal,
    Abnormal(String),
}

#[derive(Debug)]
pub enum Inbound {
    Data(Bytes),
    Closed(CloseStatus),
}

#[derive(Debug)]
pub enum Outbound {
    Data(Bytes),
    Close(CloseStatus),
}

/// The socket side of a [`BrokerConn`].
pub struct FrameChannel {
    pub tx_in: mpsc::UnboundedSender<Inbound>,
    pub rx_out: mpsc::UnboundedReceiver<Outbound>,
}

/// Requests that the broker socket be closed with the given status.
#[derive(Clone)]
pub struct BrokerCloser {
    tx_out: mpsc::UnboundedSender<Outbound>,
}

impl BrokerCloser {
    pub fn close(&self, status: CloseStatus) {
        let _ = self.tx_out.send(Outbound::Close(status));
    }
}

/// Each write becomes one binary frame. Reads return EOF after a normal
/// closure and an error after any other closure.
pub struct BrokerConn {
    rx_in: mpsc::UnboundedReceiver<Inbound>,
    tx_out: mpsc::UnboundedSender<Outbound>,
    pending: Bytes,
    closed: Option<CloseStatus>,
    shutdown: bool,
}

impl BrokerConn {
    pub fn pair() -> (BrokerConn, FrameChannel) {
        let (tx_in, rx_in) = mpsc::unbounded_channel();
        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let conn = BrokerConn {
            rx_in,
            tx_out,
            pending: Bytes::new(),
            closed: None,
            shutdown: false,
        };
        (conn, FrameChannel { tx_in, rx_out })
    }

    pub fn from_tungstenite<S>(ws: WebSocketStream<S>) -> BrokerConn
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (conn, frames) = BrokerConn::pair();
        tokio::spawn(pump_tungstenite(ws, frames));
        conn
    }

    pub fn closer(&self) -> BrokerCloser {
        BrokerCloser {
            tx_out: self.tx_out.clone(),
        }
    }
}

/// Opens a WebSocket to `url` and returns it as a byte stream.
pub async fn connect(url: &str) -> Result<BrokerConn, BrokerError> {
    let (ws, _) = connect_async(url).await.map_err(|err| match err {
        tungstenite::Error::Http(response) => BrokerError::Http {
            status: response.status().as_u16(),
        },
        other => BrokerError::Connect(other.to_string()),
    })?;
    tracing::debug!(target = "wsnet::broker", url = %url, "broker connected");
    Ok(BrokerConn::from_tungstenite(ws))
}

impl AsyncRead for BrokerConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match &this.closed {
                Some(CloseStatus::Normal) => return Poll::Ready(Ok(())),
                Some(CloseStatus::Abnormal(reason)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        reason.clone(),
                    )))
                }
                None => {}
            }
            match ready!(this.rx_in.poll_recv(cx)) {
                Some(Inbound::Data(data)) => this.pending = data,
                Some(Inbound::Closed(status)) => this.closed = Some(status),
                None => {
                    this.closed = Some(CloseStatus::Abnormal("broker pump stopped".into()))
                }
            }
        }
    }
}

impl AsyncWrite for BrokerConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.shutdown {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        this.tx_out
            .send(Outbound::Data(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.shutdown {
            this.shutdown = true;
            let _ = this.tx_out.send(Outbound::Close(CloseStatus::Normal));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for BrokerConn {
    fn drop(&mut self) {
        if !self.shutdown {
            let _ = self.tx_out.send(Outbound::Close(CloseStatus::Abnormal(
                "connection dropped".into(),
            )));
        }
    }
}

pub fn close_status(frame: Option<&CloseFrame<'_>>) -> CloseStatus {
    match frame {
        None => CloseStatus::Normal,
        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
            CloseStatus::Normal
        }
        Some(frame) => CloseStatus::Abnormal(format!("{}: {}", u16::from(frame.code), frame.reason)),
    }
}

/// The close code and reason to send for `status`. Abnormal closes use 1011
/// since 1006 is reserved for closes without a frame.
pub fn close_parts(status: &CloseStatus) -> (u16, String) {
    match status {
        CloseStatus::Normal => (1000, String::new()),
        CloseStatus::Abnormal(reason) => (1011, truncate_reason(reason)),
    }
}

fn truncate_reason(reason: &str) -> String {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

async fn pump_tungstenite<S>(ws: WebSocketStream<S>, frames: FrameChannel)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let FrameChannel { tx_in, mut rx_out } = frames;
    let (mut ws_write, mut ws_read) = ws.split();
    let mut outbound_open = true;
    let mut closing: Option<tokio::time::Instant> = None;

    loop {
        let grace = async move {
            match closing {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            outbound = rx_out.recv(), if outbound_open && closing.is_none() => {
                let status = match outbound {
                    Some(Outbound::Data(data)) => {
                        if let Err(err) = ws_write.send(Message::Binary(data.to_vec())).await {
                            tracing::trace!(target = "wsnet::broker", error = %err, "broker write failed");
                            let _ = tx_in.send(Inbound::Closed(CloseStatus::Abnormal(err.to_string())));
                            break;
                        }
                        continue;
                    }
                    Some(Outbound::Close(status)) => status,
                    None => {
                        outbound_open = false;
                        CloseStatus::Abnormal("connection dropped".into())
                    }
                };
                let (code, reason) = close_parts(&status);
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                if ws_write.send(Message::Close(Some(frame))).await.is_err() {
                    break;
                }
                closing = Some(tokio::time::Instant::now() + CLOSE_GRACE);
            }
            inbound = ws_read.next() => match inbound {
                Some(Ok(Message::Binary(data))) => {
                    let _ = tx_in.send(Inbound::Data(Bytes::from(data)));
                }
                Some(Ok(Message::Text(text))) => {
                    let _ = tx_in.send(Inbound::Data(Bytes::from(text.into_bytes())));
                }
                Some(Ok(Message::Close(frame))) => {
                    let _ = tx_in.send(Inbound::Closed(close_status(frame.as_ref())));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = tx_in.send(Inbound::Closed(CloseStatus::Abnormal(err.to_string())));
                    break;
                }
                None => {
                    let _ = tx_in.send(Inbound::Closed(CloseStatus::Abnormal(
                        "broker connection ended without a close frame".into(),
                    )));
                    break;
                }
            },
            _ = grace => {
                let _ = tx_in.send(Inbound::Closed(CloseStatus::Abnormal(
                    "broker did not acknowledge close".into(),
                )));
                break;
            }
        }
    }
    let _ = ws_write.close().await;
    tracing::trace!(target = "wsnet::broker", "broker pump stopped");
}
