//! Targeted tests for the quantified invariants of spec §8: reply ordering
//! is preserved per client even when an earlier forward is slow, and
//! `Target.setAutoAttach` replay is idempotent (prefix property).

mod common;

use common::*;
use serde_json::json;

#[tokio::test]
async fn command_replies_preserve_send_order_despite_slow_first_forward() {
    let addr = spawn_relay().await;
    let mut ext = connect_extension(addr).await;
    extension_attach(&mut ext, "t1", "s1", "https://example.com/", "Example").await;

    let mut client = connect_client(addr, "c1").await;

    // id 1 forwards to the extension and will be held back; id 2 is
    // synthesized locally and would otherwise race ahead of it.
    send(
        &mut client,
        json!({"id": 1, "method": "Page.navigate", "params": {"url": "https://x"}, "sessionId": "s1"}),
    )
    .await;
    send(&mut client, json!({"id": 2, "method": "Browser.getVersion"})).await;

    let (forward_id, method, _, _) = recv_extension_command(&mut ext).await;
    assert_eq!(method, "Page.navigate");

    // Reply to the held-back forward only after both client commands have
    // been sent and queued; the synthesize for id 2 could easily have
    // completed first if the router dropped ordering.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    extension_reply(&mut ext, forward_id, json!({})).await;

    let first = recv(&mut client).await;
    let second = recv(&mut client).await;
    assert_eq!(first["id"], 1, "reply for id 1 must arrive before id 2's, since it was sent first");
    assert_eq!(second["id"], 2);
}

#[tokio::test]
async fn set_auto_attach_replay_is_a_growing_prefix() {
    let addr = spawn_relay().await;
    let mut ext = connect_extension(addr).await;
    extension_attach(&mut ext, "t1", "s1", "https://example.com/", "Example").await;

    let mut client = connect_client(addr, "c1").await;
    send(
        &mut client,
        json!({"id": 1, "method": "Target.setAutoAttach", "params": {"autoAttach": true}}),
    )
    .await;
    let _reply = recv(&mut client).await;
    let first_round = recv(&mut client).await;
    assert_eq!(first_round["method"], "Target.attachedToTarget");
    assert_eq!(first_round["params"]["sessionId"], "s1");

    extension_attach(&mut ext, "t2", "s2", "https://other.example/", "Other").await;

    send(
        &mut client,
        json!({"id": 2, "method": "Target.setAutoAttach", "params": {"autoAttach": true}}),
    )
    .await;
    let _reply = recv(&mut client).await;

    let mut seen = std::collections::HashSet::new();
    for _ in 0..2 {
        let event = recv(&mut client).await;
        assert_eq!(event["method"], "Target.attachedToTarget");
        seen.insert(event["params"]["sessionId"].as_str().unwrap().to_string());
    }
    assert!(seen.contains("s1"), "the second call's replay still includes everything the first did");
    assert!(seen.contains("s2"));
}

#[tokio::test]
async fn forwarded_command_echoes_original_client_id() {
    let addr = spawn_relay().await;
    let mut ext = connect_extension(addr).await;
    extension_attach(&mut ext, "t1", "s1", "https://example.com/", "Example").await;

    let mut client = connect_client(addr, "c1").await;
    send(
        &mut client,
        json!({"id": 42, "method": "Page.navigate", "params": {"url": "https://x"}, "sessionId": "s1"}),
    )
    .await;

    let (forward_id, _, _, _) = recv_extension_command(&mut ext).await;
    // The relay-assigned id on the extension side must not collide with the
    // client's own id namespace, and the reply must echo back 42.
    extension_reply(&mut ext, forward_id, json!({"frameId": "f1"})).await;

    let reply = recv(&mut client).await;
    assert_eq!(reply["id"], 42);
    assert_eq!(reply["result"]["frameId"], "f1");
}
