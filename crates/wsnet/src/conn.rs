//! Stream adapter over a detached data channel.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use webrtc::data::data_channel::{DataChannel, PollDataChannel};
use webrtc::data_channel::RTCDataChannel;

use crate::error::{rtc_error, Error};

/// Largest payload sent in a single data channel message.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024;
/// Writers resume once the send buffer drains below this.
pub const BUFFERED_AMOUNT_LOW_THRESHOLD: usize = 512 * 1024;
/// Writers pause while the send buffer holds this much.
pub const MAX_BUFFERED_AMOUNT: usize = 1024 * 1024;

/// Synthetic address of a data channel stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAddr {
    pub network: String,
    pub address: String,
}

impl fmt::Display for ChannelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Channels a dialer has opened and not yet released.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    open: Mutex<HashMap<u64, Arc<RTCDataChannel>>>,
    next_id: AtomicU64,
    requested: AtomicUsize,
}

impl ChannelRegistry {
    pub fn register(self: &Arc<Self>, channel: Arc<RTCDataChannel>) -> ChannelLease {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.requested.fetch_add(1, Ordering::Relaxed);
        self.open.lock().insert(id, channel);
        ChannelLease {
            registry: self.clone(),
            id,
        }
    }

    pub fn active(&self) -> usize {
        self.open.lock().len()
    }

    pub fn requested(&self) -> usize {
        self.requested.load(Ordering::Relaxed)
    }

    pub async fn close_all(&self) {
        let channels: Vec<_> = self.open.lock().drain().map(|(_, channel)| channel).collect();
        for channel in channels {
            if let Err(err) = channel.close().await {
                tracing::trace!(target = "wsnet::conn", error = %err, "close data channel");
            }
        }
    }
}

/// Counts a channel as active until dropped.
pub(crate) struct ChannelLease {
    registry: Arc<ChannelRegistry>,
    id: u64,
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.registry.open.lock().remove(&self.id);
    }
}

type WaitWritable = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A byte stream over one data channel. Writes are split into messages of
/// at most [`MAX_MESSAGE_SIZE`] bytes and pause while the channel's send
/// buffer is full.
pub struct DataChannelConn {
    channel: Arc<RTCDataChannel>,
    raw: Arc<DataChannel>,
    stream: PollDataChannel,
    prefix: Bytes,
    addr: ChannelAddr,
    writable: Arc<Notify>,
    wait_writable: Option<WaitWritable>,
    lease: Option<ChannelLease>,
    shutdown: bool,
}

impl DataChannelConn {
    /// Detaches an open channel.
    pub(crate) async fn open(
        channel: Arc<RTCDataChannel>,
        addr: ChannelAddr,
        lease: Option<ChannelLease>,
    ) -> Result<Self, Error> {
        let raw = channel.detach().await.map_err(rtc_error)?;
        raw.set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD);
        let writable = Arc::new(Notify::new());
        let signal = writable.clone();
        raw.on_buffered_amount_low(Box::new(move || {
            let signal = signal.clone();
            Box::pin(async move {
                signal.notify_one();
            })
        }));
        let mut stream = PollDataChannel::new(raw.clone());
        stream.set_read_buf_capacity(MAX_MESSAGE_SIZE);
        Ok(Self {
            channel,
            raw,
            stream,
            prefix: Bytes::new(),
            addr,
            writable,
            wait_writable: None,
            lease,
            shutdown: false,
        })
    }

    /// Bytes that arrived with the dial response and must be read first.
    pub(crate) fn set_prefix(&mut self, prefix: Bytes) {
        self.prefix = prefix;
    }

    pub fn label(&self) -> &str {
        self.channel.label()
    }

    pub fn protocol(&self) -> &str {
        self.channel.protocol()
    }

    pub fn local_addr(&self) -> &ChannelAddr {
        &self.addr
    }

    pub fn remote_addr(&self) -> &ChannelAddr {
        &self.addr
    }

    pub fn buffered_amount(&self) -> usize {
        self.raw.buffered_amount()
    }
}

impl fmt::Debug for DataChannelConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannelConn")
            .field("label", &self.channel.label())
            .field("addr", &self.addr)
            .finish()
    }
}

impl AsyncRead for DataChannelConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for DataChannelConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(wait) = this.wait_writable.as_mut() {
            ready!(wait.as_mut().poll(cx));
            this.wait_writable = None;
        }
        let len = buf.len().min(MAX_MESSAGE_SIZE);
        if this.raw.buffered_amount() + len >= MAX_BUFFERED_AMOUNT {
            let writable = this.writable.clone();
            let mut wait: WaitWritable = Box::pin(async move { writable.notified().await });
            if wait.as_mut().poll(cx).is_pending() {
                this.wait_writable = Some(wait);
                return Poll::Pending;
            }
        }
        Pin::new(&mut this.stream).poll_write(cx, &buf[..len])
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.stream).poll_shutdown(cx))?;
        this.shutdown = true;
        this.lease.take();
        Poll::Ready(Ok(()))
    }
}

impl Drop for DataChannelConn {
    fn drop(&mut self) {
        if self.shutdown {
            return;
        }
        let channel = self.channel.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = channel.close().await;
            });
        }
    }
}
