//! End-to-end scenarios for the bridge's RPC correlation engine, driven over an in-memory duplex stream standing in for the
//! hypervisor socket.

use std::sync::Arc;
use std::time::Duration;

use gcs_bridge::{
    Bridge, BridgeConfig, BridgeError, Category, MessageIdentifier, MessageType, Operation,
};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_util::sync::CancellationToken;

fn no_notify() -> gcs_bridge::bridge::NotificationCallback {
    Arc::new(|_notification| Ok(()))
}

fn split(
    stream: DuplexStream,
) -> (
    impl AsyncRead + Unpin + Send + 'static,
    impl AsyncWrite + Unpin + Send + 'static,
) {
    tokio::io::split(stream)
}

/// Reads one request off the peer side and replies with `body`, after an
/// optional delay, reusing the request's id and turning its identifier
/// into a response identifier.
async fn reflect_once(
    peer: DuplexStream,
    delay: Option<Duration>,
    body: serde_json::Value,
) {
    use gcs_bridge::transport::{MessageReader, MessageWriter};

    let (read_half, write_half) = split(peer);
    let mut reader = MessageReader::new(read_half);
    let mut writer = MessageWriter::new(write_half);

    let message = reader.read_message().await.unwrap().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    let response_id = message.identifier.with_type(MessageType::Response);
    writer
        .write_message(response_id, message.id, &body)
        .await
        .unwrap();
}

#[tokio::test]
async fn s1_reflected_echo() {
    let (host, guest) = tokio::io::duplex(64 * 1024);
    let bridge = Bridge::new(host, no_notify(), BridgeConfig::default());

    let echoed = json!({"Result": 0, "X": 5, "Y": 0});
    let reflector = tokio::spawn(reflect_once(guest, None, echoed.clone()));

    let ctx = CancellationToken::new();
    let result = bridge
        .rpc(
            &ctx,
            MessageIdentifier::request(Category::Container, Operation::Create),
            json!({"X": 5, "Y": 0}),
            false,
        )
        .await
        .unwrap();

    assert_eq!(result, echoed);
    reflector.await.unwrap();
}

#[tokio::test]
async fn s2_response_timeout_closes_bridge() {
    let (host, guest) = tokio::io::duplex(64 * 1024);

    let mut config = BridgeConfig::default();
    config.rpc_timeout = Duration::from_millis(100);

    let bridge = Bridge::new(host, no_notify(), config);

    let _reflector = tokio::spawn(reflect_once(
        guest,
        Some(Duration::from_secs(60)),
        json!({"Result": 0}),
    ));

    let ctx = CancellationToken::new();
    let err = bridge
        .rpc(
            &ctx,
            MessageIdentifier::request(Category::Container, Operation::Create),
            json!({}),
            false,
        )
        .await
        .unwrap_err();

    assert!(err.to_string().contains("bridge closed"));
    assert!(bridge.is_closed());

    // Any subsequent RPC sees the same cause.
    let err2 = bridge
        .rpc(
            &ctx,
            MessageIdentifier::request(Category::Container, Operation::Create),
            json!({}),
            false,
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), err2.to_string());
}

#[tokio::test]
async fn s3_cancellable_context_wins_over_timeout() {
    let (host, guest) = tokio::io::duplex(64 * 1024);

    let mut config = BridgeConfig::default();
    config.rpc_timeout = Duration::from_millis(250);

    let bridge = Bridge::new(host, no_notify(), config);
    let _reflector = tokio::spawn(reflect_once(
        guest,
        Some(Duration::from_secs(60)),
        json!({"Result": 0}),
    ));

    let ctx = CancellationToken::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let err = bridge
        .rpc(
            &ctx,
            MessageIdentifier::request(Category::Container, Operation::Create),
            json!({}),
            true,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::Cancelled));
    assert!(!bridge.is_closed());
}

#[tokio::test]
async fn s4_non_cancellable_ignores_context_and_times_out() {
    let (host, guest) = tokio::io::duplex(64 * 1024);

    let mut config = BridgeConfig::default();
    config.rpc_timeout = Duration::from_millis(250);

    let bridge = Bridge::new(host, no_notify(), config);
    let _reflector = tokio::spawn(reflect_once(
        guest,
        Some(Duration::from_secs(60)),
        json!({"Result": 0}),
    ));

    let ctx = CancellationToken::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let err = bridge
        .rpc(
            &ctx,
            MessageIdentifier::request(Category::Container, Operation::Create),
            json!({}),
            false,
        )
        .await
        .unwrap_err();

    assert!(err.to_string().contains("bridge closed"));
}

#[tokio::test]
async fn s5_pre_killed_bridge_returns_cause() {
    let (host, _guest) = tokio::io::duplex(64 * 1024);

    let bridge = Bridge::new(host, no_notify(), BridgeConfig::default());

    bridge.kill(Some(BridgeError::BridgeClosed(
        "forcibly terminated".to_string(),
    )));

    let ctx = CancellationToken::new();
    let err = bridge
        .rpc(
            &ctx,
            MessageIdentifier::request(Category::Container, Operation::Create),
            json!({}),
            false,
        )
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "forcibly terminated");
}

#[tokio::test]
async fn s6_notification_round_trip() {
    use gcs_bridge::transport::MessageWriter;

    let (host, guest) = tokio::io::duplex(64 * 1024);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let notify: gcs_bridge::bridge::NotificationCallback = Arc::new(move |notification| {
        let _ = tx.send(notification);
        Ok(())
    });

    let _bridge = Bridge::new(host, notify, BridgeConfig::default());

    let (_, guest_write) = split(guest);
    let mut writer = MessageWriter::new(guest_write);
    let identifier = MessageIdentifier::new(
        MessageType::Notify,
        Category::Container,
        Operation::NotifyContainer,
    );
    let payload = json!({
        "ContainerId": "00000000-0000-0000-0000-000000000000",
        "Operation": "testing",
    });
    writer.write_message(identifier, 0, &payload).await.unwrap();

    let received = tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("notification handler should fire within 100ms")
        .expect("channel should not be closed");

    assert_eq!(received.operation, "testing");
    assert!(rx.try_recv().is_err(), "handler should fire exactly once");
}

#[tokio::test]
async fn in_flight_table_empties_after_close() {
    let (host, guest) = tokio::io::duplex(64 * 1024);

    let bridge = Bridge::new(host, no_notify(), BridgeConfig::default());

    let ctx = CancellationToken::new();
    let _handle = bridge
        .async_rpc(
            &ctx,
            MessageIdentifier::request(Category::Container, Operation::Create),
            json!({}),
        )
        .await
        .unwrap();

    // Give the send loop a moment to assign the id and insert the entry.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(bridge.in_flight_count(), 1);

    bridge.close();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(bridge.in_flight_count(), 0);

    drop(guest);
}
