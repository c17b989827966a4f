use std::time::Duration;

#[test_timeout::tokio_timeout_test(5)]
async fn body_can_use_timers() {
    tokio::time::sleep(Duration::from_millis(10)).await;
    let elapsed = tokio::time::timeout(Duration::from_millis(50), std::future::pending::<()>()).await;
    assert!(elapsed.is_err());
}

#[test_timeout::tokio_timeout_test(5)]
async fn body_can_spawn_tasks() {
    let handle = tokio::spawn(async { 7 });
    assert_eq!(handle.await.unwrap(), 7);
}

#[test_timeout::tokio_timeout_test(1)]
#[should_panic(expected = "timed out")]
async fn overrunning_body_fails() {
    tokio::time::sleep(Duration::from_secs(30)).await;
}
