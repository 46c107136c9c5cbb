//! Supervised reconnection and manual override

mod integration;

use heatlink_core::core::error::{ConnectionError, Error};
use heatlink_core::ConnectionState;
use integration::{connect, Controller};
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_up_to_the_cap() {
    let controller = Controller::default();
    let (control, conn) = connect(&controller).await;

    control.unplug();
    let err = assert_err!(conn.receive(Duration::from_millis(10)).await);
    assert!(err.is_link_failure());

    let states: Vec<_> = conn.history().iter().map(|t| t.to).collect();
    assert!(states.ends_with(&[ConnectionState::Error, ConnectionState::Closed]));
    assert_eq!(conn.reconnect_delay(), Duration::from_secs(5));

    // failed attempts at 5, 15, 35, 75, 155 and 315 seconds
    tokio::time::sleep(Duration::from_millis(315_100)).await;
    assert_eq!(control.open_attempts(), 7);
    assert_eq!(conn.reconnect_delay(), Duration::from_secs(300));
    assert_eq!(conn.state(), ConnectionState::Closed);

    control.plug();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.reconnect_delay(), Duration::from_secs(5));
    assert!(!conn.is_reconnecting());
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_cancels_backoff_immediately() {
    let controller = Controller::default();
    let (control, conn) = connect(&controller).await;

    control.unplug();
    let _ = conn.receive(Duration::from_millis(10)).await;
    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert!(conn.is_reconnecting());

    let before = Instant::now();
    conn.manual_disconnect().await;
    assert_eq!(before.elapsed(), Duration::ZERO);
    assert!(!conn.is_reconnecting());

    control.plug();
    let attempts = control.open_attempts();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(control.open_attempts(), attempts);
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_manual_connect_skips_remaining_wait() {
    let controller = Controller::default();
    let (control, conn) = connect(&controller).await;

    control.unplug();
    let _ = conn.receive(Duration::from_millis(10)).await;
    tokio::time::sleep(Duration::from_millis(15_100)).await;
    assert_eq!(conn.reconnect_delay(), Duration::from_secs(20));

    control.plug();
    let before = Instant::now();
    assert_ok!(conn.manual_connect().await);
    assert_eq!(before.elapsed(), Duration::ZERO);
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.reconnect_delay(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_manual_connect_after_manual_disconnect_reopens() {
    let controller = Controller::default();
    let (control, conn) = connect(&controller).await;
    let mut states = conn.subscribe_state();

    conn.manual_disconnect().await;
    assert!(conn.is_manually_disconnected());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Closed);

    control.fail_next_open(ConnectionError::PermissionDenied("held by another process".into()));
    let err = conn.manual_connect().await.unwrap_err();
    assert!(matches!(err, Error::Connection(ConnectionError::PermissionDenied(_))));
    assert!(!conn.is_reconnecting());

    assert_ok!(conn.manual_connect().await);
    assert!(!conn.is_manually_disconnected());
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_during_reconnect_open_ends_closed() {
    let controller = Controller::default();
    let (control, conn) = connect(&controller).await;

    control.unplug();
    let _ = conn.receive(Duration::from_millis(10)).await;
    control.set_open_delay(Duration::from_secs(2));
    control.plug();

    // the attempt at 5 s is still inside open()
    tokio::time::sleep(Duration::from_millis(5_500)).await;
    assert_eq!(conn.state(), ConnectionState::Connecting);
    let attempts = control.open_attempts();

    conn.manual_disconnect().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(!conn.is_reconnecting());
    let last = conn.history().last().cloned().unwrap();
    assert_eq!((last.from, last.to), (ConnectionState::Connecting, ConnectionState::Closed));

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(control.open_attempts(), attempts);
    assert_err!(conn.receive(Duration::from_millis(10)).await);
}
