use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use webrtc::turn::auth::{generate_auth_key, AuthHandler};
use webrtc::turn::relay::relay_static::RelayAddressGeneratorStatic;
use webrtc::turn::server::config::{ConnConfig, ServerConfig};
use webrtc::turn::server::Server;
use webrtc::util::vnet::net::Net;
use wsnet::{validate_ice_server, IceError, IceServerConfig, ValidateOptions};

const REALM: &str = "wsnet.test";
const USERNAME: &str = "agent";
const PASSWORD: &str = "hunter2";

struct StaticAuth {
    key: Vec<u8>,
}

impl AuthHandler for StaticAuth {
    fn auth_handle(
        &self,
        username: &str,
        _realm: &str,
        _src_addr: SocketAddr,
    ) -> Result<Vec<u8>, webrtc::turn::Error> {
        if username == USERNAME {
            Ok(self.key.clone())
        } else {
            Err(webrtc::turn::Error::Other(format!("unknown user {username}")))
        }
    }
}

async fn spawn_turn() -> (Server, SocketAddr) {
    let conn = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = conn.local_addr().unwrap();
    let server = Server::new(ServerConfig {
        conn_configs: vec![ConnConfig {
            conn,
            relay_addr_generator: Box::new(RelayAddressGeneratorStatic {
                relay_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                address: "127.0.0.1".to_owned(),
                net: Arc::new(Net::new(None)),
            }),
        }],
        realm: REALM.to_owned(),
        auth_handler: Arc::new(StaticAuth {
            key: generate_auth_key(USERNAME, REALM, PASSWORD),
        }),
        channel_bind_timeout: Duration::from_secs(0),
        alloc_close_notify: None,
    })
    .await
    .unwrap();
    (server, addr)
}

fn options() -> ValidateOptions {
    ValidateOptions {
        timeout: Some(Duration::from_secs(2)),
        ..Default::default()
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn turn_with_valid_credentials_passes() {
    let (server, addr) = spawn_turn().await;
    let config = IceServerConfig::new(vec![format!("turn:{addr}")])
        .with_credentials(USERNAME, PASSWORD);
    validate_ice_server(&config, &options()).await.unwrap();

    let stun = IceServerConfig::new(vec![format!("stun:{addr}")]);
    validate_ice_server(&stun, &options()).await.unwrap();
    server.close().await.unwrap();
}

#[test_timeout::tokio_timeout_test(30)]
async fn turn_with_wrong_password_is_rejected() {
    let (server, addr) = spawn_turn().await;
    let config = IceServerConfig::new(vec![format!("turn:{addr}")])
        .with_credentials(USERNAME, "not-the-password");
    let err = validate_ice_server(&config, &options()).await.unwrap_err();
    assert!(
        matches!(err, IceError::InvalidCredentials { .. }),
        "unexpected error: {err}"
    );
    server.close().await.unwrap();
}

#[test_timeout::tokio_timeout_test(30)]
async fn tcp_against_udp_relay_is_a_protocol_mismatch() {
    let (server, addr) = spawn_turn().await;
    let config = IceServerConfig::new(vec![format!("turn:{addr}?transport=tcp")])
        .with_credentials(USERNAME, PASSWORD);
    let err = validate_ice_server(&config, &options()).await.unwrap_err();
    assert!(
        matches!(err, IceError::MismatchedProtocol { .. }),
        "unexpected error: {err}"
    );
    server.close().await.unwrap();
}

#[test_timeout::tokio_timeout_test(30)]
async fn unsupported_urls_are_reported() {
    let config = IceServerConfig::new(vec!["http://example.com".into()]);
    let err = validate_ice_server(&config, &options()).await.unwrap_err();
    assert!(matches!(err, IceError::Unsupported { .. }), "unexpected error: {err}");
}
