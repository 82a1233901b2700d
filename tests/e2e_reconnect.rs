//! End-to-end tests for transport loss, reconnect and resubscription.

mod helpers;

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use helpers::fake_controller::FakeController;
use serde_json::json;
use subline::{ClientError, ConnectionState, ObjectRecord, Request};

async fn wait_for_state(client: &subline::Client, expected: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while client.state() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("client never reached {expected}, still {}", client.state()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_connection_fails_pending_then_resubscribes() {
    let controller = FakeController::bind().await;
    let (client, mut peer) = controller.connect(controller.config()).await;
    let (tx, rx) = std_mpsc::channel();

    let subscribe = client.subscribe("PMP1", move |r: &ObjectRecord| {
        let _ = tx.send(r.get("RPM").cloned());
    });
    let ack = async {
        let sent = peer.recv().await;
        peer.reply_ok(&sent, json!([])).await;
    };
    let (handle, ()) = tokio::join!(subscribe, ack);
    let _handle = handle.unwrap();

    let first = client.submit(Request::new("GetQuery")).unwrap();
    let second = client.submit(Request::new("GetParamList")).unwrap();
    peer.recv().await;
    peer.recv().await;
    assert_eq!(client.pending_count(), 2);

    // Kill the socket with both requests outstanding
    drop(peer);

    for pending in [first, second] {
        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("pending request should fail promptly");
        assert!(matches!(result, Err(ClientError::TransportLost(_))), "{result:?}");
    }
    assert_eq!(client.pending_count(), 0);

    // The client comes back on its own and asks for the topic again
    let mut peer = controller.accept().await;
    let resubscribe = peer.recv().await;
    assert_eq!(resubscribe["command"], "RequestParamList");
    assert_eq!(resubscribe["objectList"][0]["objnam"], "PMP1");
    peer.reply_ok(&resubscribe, json!([])).await;
    wait_for_state(&client, ConnectionState::Connected).await;

    // Listener keeps working on the new connection
    peer.notify("PMP1", json!({"RPM": 2400})).await;
    let update = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
        .await
        .unwrap()
        .expect("listener called after reconnect");
    assert_eq!(update, Some(json!(2400)));

    // And so do plain requests
    let pending = client.submit(Request::new("GetQuery")).unwrap();
    let sent = peer.recv().await;
    peer.reply_ok(&sent, json!([])).await;
    assert!(pending.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notification_in_same_write_as_resubscribe_ack_is_delivered() {
    let controller = FakeController::bind().await;
    let (client, mut peer) = controller.connect(controller.config()).await;
    let (tx, rx) = std_mpsc::channel();

    let subscribe = client.subscribe("B1", move |r: &ObjectRecord| {
        let _ = tx.send(r.get("STATUS").cloned());
    });
    let ack = async {
        let sent = peer.recv().await;
        peer.reply_ok(&sent, json!([])).await;
    };
    let (handle, ()) = tokio::join!(subscribe, ack);
    let _handle = handle.unwrap();

    drop(peer);
    let mut peer = controller.accept().await;
    let resubscribe = peer.recv().await;
    assert_eq!(resubscribe["objectList"][0]["objnam"], "B1");

    let ack = json!({
        "messageID": resubscribe["messageID"],
        "command": "RequestParamList",
        "response": "200",
        "objectList": [],
    });
    let update = json!({
        "command": "NotifyList",
        "objectList": [{"objnam": "B1", "params": {"STATUS": "ON"}}],
    });
    peer.send_raw(&format!("{ack}\n{update}")).await;

    let update = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
        .await
        .unwrap()
        .expect("listener called right after the resubscribe acknowledgement");
    assert_eq!(update, Some(json!("ON")));
    assert_eq!(client.listener_count("B1"), 1);
}

#[tokio::test]
async fn reconnect_disabled_leaves_client_disconnected() {
    let controller = FakeController::bind().await;
    let mut config = controller.config();
    config.auto_reconnect = false;
    let (client, peer) = controller.connect(config).await;

    let pending = client.submit(Request::new("GetQuery")).unwrap();
    drop(peer);

    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("should fail promptly");
    assert!(matches!(result, Err(ClientError::TransportLost(_))));
    wait_for_state(&client, ConnectionState::Disconnected).await;

    assert!(matches!(
        client.submit(Request::new("GetQuery")),
        Err(ClientError::Disconnected)
    ));
}

#[tokio::test]
async fn failed_reconnect_is_permanent() {
    let controller = FakeController::bind().await;
    let (client, peer) = controller.connect(controller.config()).await;

    // Nothing listens any more, so the single reconnect attempt fails
    drop(controller);
    drop(peer);

    // Allow the failure report and the refused reconnect to play out
    tokio::time::sleep(Duration::from_millis(300)).await;
    wait_for_state(&client, ConnectionState::Disconnected).await;
    assert!(matches!(
        client.submit(Request::new("GetQuery")),
        Err(ClientError::Disconnected)
    ));
}

#[tokio::test]
async fn close_during_connection_cancels_pending() {
    let controller = FakeController::bind().await;
    let (client, mut peer) = controller.connect(controller.config()).await;

    let pending = client.submit(Request::new("GetQuery")).unwrap();
    peer.recv().await;

    client.close().await;
    assert!(matches!(pending.await, Err(ClientError::Cancelled(_))));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // No reconnect after an explicit close
    let reconnect = tokio::time::timeout(Duration::from_millis(200), controller.accept()).await;
    assert!(reconnect.is_err(), "closed client must not reconnect");
}
