use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use wsnet::{dial_websocket, DialOptions, Error};

/// A broker that accepts the handshake and never answers it. Reports the
/// close code the dialer ends the socket with.
async fn spawn_silent_broker() -> (SocketAddr, mpsc::UnboundedReceiver<Option<u16>>) {
    let (codes, observed) = mpsc::unbounded_channel();
    let app = Router::new().route(
        "/connect",
        get(move |ws: WebSocketUpgrade| {
            let codes = codes.clone();
            async move {
                let response: Response = ws.on_upgrade(move |mut socket| async move {
                    let mut code = None;
                    while let Some(Ok(message)) = socket.recv().await {
                        if let Message::Close(frame) = message {
                            code = frame.map(|frame| frame.code);
                            break;
                        }
                    }
                    let _ = codes.send(code);
                });
                response
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, observed)
}

#[test_timeout::tokio_timeout_test(30)]
async fn unanswered_dial_times_out_and_aborts_the_broker() {
    let (broker, mut observed) = spawn_silent_broker().await;
    let options = DialOptions {
        connect_timeout: Duration::from_secs(1),
        ..Default::default()
    };

    let started = Instant::now();
    let err = match dial_websocket(&format!("ws://{broker}/connect"), options).await {
        Ok(_) => panic!("dial should fail without an answer"),
        Err(err) => err,
    };
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "gave up after {elapsed:?}");
    assert!(matches!(err, Error::Handshake { .. }), "unexpected error: {err}");
    assert!(matches!(err.root(), Error::Timeout(_)), "unexpected error: {err}");

    let code = tokio::time::timeout(Duration::from_secs(5), observed.recv())
        .await
        .expect("broker socket should close")
        .expect("broker handler should report");
    assert_eq!(code, Some(1011));
}
