//! Peer-to-peer tunnels negotiated through a WebSocket broker.
//!
//! A [`Listener`] keeps a connection to the broker and answers offers from
//! dialers. A [`Dialer`] negotiates a WebRTC peer connection with it and
//! opens [`DataChannelConn`] streams that the listener proxies to addresses
//! on its network, subject to the [`DialPolicy`] list carried in the offer.

pub mod broker;
pub mod cache;
pub mod conn;
pub mod dial;
pub mod endpoint;
pub mod error;
pub mod ice;
pub mod listen;
mod negotiate;
pub mod proto;
mod rtc;

use tokio::sync::watch;

pub use cache::{CacheError, CachedDialer, DialerCache};
pub use conn::{ChannelAddr, DataChannelConn};
pub use dial::{dial, dial_websocket, DialOptions, Dialer};
pub use endpoint::{connect_endpoint, listen_endpoint};
pub use error::Error;
pub use ice::{turn_credentials, validate_ice_server, IceError, IceServerConfig, ValidateOptions};
pub use listen::{ChannelHandler, ChannelRequest, ListenOptions, Listener, ProxyHandler};
pub use proto::{resolve_address, DialChannelResponse, DialPolicy, HandshakeMessage};

/// Resolves once the flag is set or its owner is gone.
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // A dropped sender means the owner went away, which counts as closed.
    let _ = closed.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test_timeout::tokio_timeout_test(5)]
    async fn wait_closed_resolves_on_flag_or_drop() {
        let (flag, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_closed(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        flag.send_replace(true);
        waiter.await.unwrap();

        let (flag, mut rx) = watch::channel(false);
        drop(flag);
        wait_closed(&mut rx).await;
    }
}
