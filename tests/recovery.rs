use std::time::Duration;

use http::StatusCode;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use tenacious::client::{ConnectionState, Error, Target};
use tenacious::config::Config;
use tenacious::notify::{Notification, RecoveryReason};
use tenacious::transport::mock::{MockConnector, MockRemote};
use tenacious::StreamClient;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn mock_client() -> (StreamClient, MockConnector) {
    let connector = MockConnector::new();
    let initializer = connector.clone();
    let client = StreamClient::with_config(
        Target::initializer(move || initializer.connect()),
        Config::new().with_socket_timeout(Duration::from_secs(30)),
    )
    .expect("mock target is valid");
    (client, connector)
}

/// Open the stream, then have the server end it so recovery begins.
async fn connected_then_ended(client: &StreamClient, connector: &MockConnector) -> MockRemote {
    let started = client.start();
    let remote = connector.remote().await;
    remote.ok();
    started.await.expect("first connection");
    remote.end();
    remote
}

fn reject(remote: &MockRemote) {
    remote.respond(StatusCode::SERVICE_UNAVAILABLE);
    remote.data("try again later");
    remote.end();
}

/// Wait for the next attempt, returning it with the time spent waiting.
async fn next_attempt(connector: &MockConnector) -> (MockRemote, Duration) {
    let waiting = Instant::now();
    let remote = connector.remote().await;
    (remote, waiting.elapsed())
}

#[track_caller]
fn assert_waited(elapsed: Duration, expected: Duration) {
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_secs(1),
        "waited {elapsed:?}, expected {expected:?}"
    );
}

fn drain(notifications: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut drained = Vec::new();
    while let Ok(notification) = notifications.try_recv() {
        drained.push(notification);
    }
    drained
}

#[tokio::test(start_paused = true)]
async fn retries_with_backoff_until_connected() -> Result<(), BoxError> {
    let (client, connector) = mock_client();
    let mut notifications = client.subscribe();
    connected_then_ended(&client, &connector).await;

    let (second, elapsed) = next_attempt(&connector).await;
    assert_waited(elapsed, Duration::ZERO);
    assert_eq!(client.reconnect_attempts(), 1);
    reject(&second);

    let (third, elapsed) = next_attempt(&connector).await;
    assert_waited(elapsed, Duration::from_secs(10));
    assert_eq!(client.reconnect_attempts(), 2);
    reject(&third);

    let (fourth, elapsed) = next_attempt(&connector).await;
    assert_waited(elapsed, Duration::from_secs(20));
    assert_eq!(client.reconnect_attempts(), 3);
    fourth.ok();

    let recovered = loop {
        match notifications.recv().await {
            Some(Notification::Recovered(reason)) => break reason,
            Some(_) => continue,
            None => panic!("notifier dropped"),
        }
    };
    assert_eq!(recovered, RecoveryReason::ServerEnd);
    assert_eq!(client.reconnect_attempts(), 0);
    assert!(client.started());
    assert_eq!(connector.attempts(), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn construction_failures_are_retried() -> Result<(), BoxError> {
    let (client, connector) = mock_client();
    connector.fail_next(2);

    let start = Instant::now();
    let recovery = client.recover();
    assert_eq!(client.reconnect_attempts(), 1);

    let remote = connector.remote().await;
    assert_waited(start.elapsed(), Duration::from_secs(30));
    assert_eq!(connector.attempts(), 3);
    remote.ok();

    recovery.await?;
    assert!(client.started());
    assert_eq!(client.reconnect_attempts(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrent_recover_is_rejected() -> Result<(), BoxError> {
    let (client, connector) = mock_client();

    let first = client.recover();
    let second = client.recover().await;
    assert!(matches!(second, Err(Error::RecoveryInProgress)));
    assert!(second.unwrap_err().is_recovery_guard());
    assert_eq!(client.reconnect_attempts(), 1);

    connector.remote().await.ok();
    first.await?;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(client.reconnect_attempts(), 0);

    // Another sequence may start once the first has finished.
    let third = client.recover();
    connector.remote().await.ok();
    third.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stop_during_backoff_cancels_recovery() -> Result<(), BoxError> {
    let (client, connector) = mock_client();
    let mut notifications = client.subscribe();
    connected_then_ended(&client, &connector).await;

    let (second, _) = next_attempt(&connector).await;
    reject(&second);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(client.reconnect_attempts(), 2);

    client.stop(None).await;
    assert_eq!(client.reconnect_attempts(), 0);
    assert_eq!(client.state(), ConnectionState::Idle);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(client.state(), ConnectionState::Idle);

    let emitted = drain(&mut notifications);
    assert!(emitted.iter().all(|notification| !matches!(
        notification,
        Notification::Recovered(_) | Notification::Error(_)
    )));

    // Recovery is allowed again once the stop has completed.
    let recovery = client.recover();
    connector.remote().await.ok();
    recovery.await?;
    assert!(client.started());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_recovery_future() {
    let (client, connector) = mock_client();
    connector.fail_next(1);

    let recovery = client.recover();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(connector.attempts(), 1);

    client.stop(None).await;
    assert!(matches!(recovery.await, Err(Error::Stopped)));
}

#[tokio::test(start_paused = true)]
async fn fault_during_recovery_reports_error() -> Result<(), BoxError> {
    let (client, connector) = mock_client();
    let mut notifications = client.subscribe();
    connected_then_ended(&client, &connector).await;

    // The recovery attempt times out before it gets a response. That fault cannot start a
    // second recovery sequence, so it is reported instead.
    let (second, _) = next_attempt(&connector).await;
    second.socket();
    second.timeout();

    let error = loop {
        match notifications.recv().await {
            Some(Notification::Error(error)) => break error,
            Some(_) => continue,
            None => panic!("notifier dropped"),
        }
    };
    assert!(matches!(error, Error::RecoveryInProgress));

    // The original sequence carries on.
    let (third, elapsed) = next_attempt(&connector).await;
    assert_waited(elapsed, Duration::from_secs(10));
    third.ok();

    loop {
        match notifications.recv().await {
            Some(Notification::Recovered(RecoveryReason::ServerEnd)) => break,
            Some(_) => continue,
            None => panic!("notifier dropped"),
        }
    }
    assert!(client.started());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn quick_end_after_reconnect_recovers_again() -> Result<(), BoxError> {
    let (client, connector) = mock_client();
    let mut notifications = client.subscribe();
    connected_then_ended(&client, &connector).await;

    // The reconnected stream ends before the recovery task gets to run again.
    let (second, _) = next_attempt(&connector).await;
    second.ok();
    second.end();

    let (third, elapsed) = next_attempt(&connector).await;
    assert_waited(elapsed, Duration::ZERO);
    third.ok();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(client.started());
    assert_eq!(client.reconnect_attempts(), 0);
    assert_eq!(connector.attempts(), 3);

    let emitted = drain(&mut notifications);
    assert!(!emitted
        .iter()
        .any(|notification| matches!(notification, Notification::Error(_))));
    let recoveries = emitted
        .iter()
        .filter(|notification| {
            matches!(
                notification,
                Notification::Recovered(RecoveryReason::ServerEnd)
            )
        })
        .count();
    assert_eq!(recoveries, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn recovery_adopts_pending_start() -> Result<(), BoxError> {
    let (client, connector) = mock_client();

    let started = client.start();
    let recovery = client.recover();
    let remote = connector.remote().await;

    // The recovery sequence waits on the start already in flight.
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(connector.attempts(), 1);

    remote.ok();
    started.await?;
    assert_eq!(client.reconnect_attempts(), 0);

    // The stream can fault and recover right away.
    remote.end();
    connector.remote().await.ok();
    recovery.await?;
    assert_eq!(connector.attempts(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn direct_recover_emits_no_notification() -> Result<(), BoxError> {
    let (client, connector) = mock_client();
    let mut notifications = client.subscribe();

    let recovery = client.recover();
    connector.remote().await.ok();
    recovery.await?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(drain(&mut notifications).is_empty());
    assert!(client.started());
    Ok(())
}
