use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use wsnet::{Error, ListenOptions, Listener};

/// Accepts WebSocket upgrades and drops every socket right away.
async fn spawn_flaky_broker() -> (SocketAddr, Arc<AtomicUsize>) {
    async fn upgrade(State(accepted): State<Arc<AtomicUsize>>, ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(move |socket| async move {
            accepted.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        })
    }

    let accepted = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/listen", get(upgrade))
        .with_state(accepted.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, accepted)
}

async fn wait_for_count(counter: &AtomicUsize, target: usize) {
    while counter.load(Ordering::SeqCst) < target {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test_timeout::tokio_timeout_test(20)]
async fn reconnects_after_losing_the_broker() {
    let (addr, accepted) = spawn_flaky_broker().await;
    let options = ListenOptions {
        retry_interval: Duration::from_millis(100),
        validate_ice_servers: false,
        ..Default::default()
    };
    let listener = Listener::listen(format!("ws://{addr}/listen"), options)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), wait_for_count(&accepted, 3))
        .await
        .expect("listener should keep reconnecting");

    listener.close().await.unwrap();
    assert!(listener.is_closed());
    tokio::time::sleep(Duration::from_millis(200)).await;
    let settled = accepted.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), settled);

    listener.close().await.unwrap();
}

#[test_timeout::tokio_timeout_test(10)]
async fn first_connection_failure_is_returned() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    let err = match Listener::listen(format!("ws://{addr}/listen"), ListenOptions::default()).await {
        Ok(_) => panic!("listen should fail without a broker"),
        Err(err) => err,
    };
    assert!(matches!(err, Error::Broker(_)), "unexpected error: {err}");
}
