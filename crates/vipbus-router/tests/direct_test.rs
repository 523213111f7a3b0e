//! End-to-end tests over the direct TCP transport.

mod common;

use common::{local_config, recv_subsystem, start_direct, wait_for_peer, TIMEOUT};
use vipbus_router::config::CredentialConfig;
use vipbus_router::RouterError;
use vipbus_wire::{connect, Credential, Message, WireError};

#[tokio::test]
async fn test_ping_over_tcp() {
    let router = start_direct(local_config("site")).await;
    let mut agent = connect(router.addr, "hvac", None).await.unwrap();
    assert_eq!(agent.identity(), Some("hvac"));

    agent
        .send_message(&Message::new("", "ping").with_msg_id("m1"))
        .await
        .unwrap();
    let reply = recv_subsystem(&mut agent, "ping").await;
    assert!(reply.peer.is_empty());
    assert!(reply.msg_id == "m1");
    assert_eq!(reply.args.len(), 1);
    assert!(reply.args[0] == "pong");

    wait_for_peer(&router.handle, "hvac").await;
    router.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_forward_between_agents_with_user_id() {
    let mut config = local_config("site");
    config.credentials.push(CredentialConfig {
        key_id: "hvac-key".into(),
        secret: "s3cret".into(),
        user_id: "hvac-user".into(),
        identities: vec![],
    });
    let router = start_direct(config).await;

    let cred = Credential::new("hvac-key", "s3cret");
    let mut hvac = connect(router.addr, "hvac", Some(&cred)).await.unwrap();
    let mut meter = connect(router.addr, "meter", None).await.unwrap();

    hvac.send_message(
        &Message::new("meter", "echo")
            .with_user_id("forged")
            .with_msg_id("m2")
            .with_args(["hello"]),
    )
    .await
    .unwrap();

    let got = recv_subsystem(&mut meter, "echo").await;
    assert!(got.peer == "hvac");
    assert!(got.user_id == "hvac-user");
    assert!(got.msg_id == "m2");
    assert!(got.args[0] == "hello");
}

#[tokio::test]
async fn test_unknown_recipient_gets_error_reply() {
    let router = start_direct(local_config("site")).await;
    let mut agent = connect(router.addr, "hvac", None).await.unwrap();

    agent
        .send_message(&Message::new("ghost", "echo").with_msg_id("m3").with_args(["x"]))
        .await
        .unwrap();
    let err = recv_subsystem(&mut agent, "error").await;
    assert!(err.msg_id == "m3");
    let args: Vec<String> = err
        .args
        .iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    assert_eq!(args, vec!["30", "Peer unknown", "ghost", "echo"]);
}

#[tokio::test]
async fn test_handshake_rejections() {
    let mut config = local_config("site");
    config.allow_anonymous = false;
    config.credentials.push(CredentialConfig {
        key_id: "k".into(),
        secret: "right".into(),
        user_id: "u".into(),
        identities: vec![],
    });
    let router = start_direct(config).await;

    let wrong = Credential::new("k", "wrong");
    match connect(router.addr, "a", Some(&wrong)).await {
        Err(WireError::HandshakeFailed(reason)) => assert_eq!(reason, "authentication failed"),
        other => panic!("expected rejection, got {other:?}"),
    }
    match connect(router.addr, "a", None).await {
        Err(WireError::HandshakeFailed(reason)) => assert_eq!(reason, "credentials required"),
        other => panic!("expected rejection, got {other:?}"),
    }

    let right = Credential::new("k", "right");
    let _first = connect(router.addr, "a", Some(&right)).await.unwrap();
    match connect(router.addr, "a", Some(&right)).await {
        Err(WireError::HandshakeFailed(reason)) => assert_eq!(reason, "identity in use"),
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_blank_identity_is_assigned() {
    let router = start_direct(local_config("site")).await;
    let agent = connect(router.addr, "", None).await.unwrap();
    let identity = agent.identity().unwrap();
    assert!(!identity.is_empty());
}

#[tokio::test]
async fn test_disconnect_broadcasts_drop() {
    let router = start_direct(local_config("site")).await;
    let mut watcher = connect(router.addr, "watcher", None).await.unwrap();
    watcher.send_probe().await.unwrap();
    wait_for_peer(&router.handle, "watcher").await;

    let mut leaver = connect(router.addr, "leaver", None).await.unwrap();
    leaver.send_probe().await.unwrap();
    let added = recv_subsystem(&mut watcher, "peerlist").await;
    assert!(added.args[0] == "add" && added.args[1] == "leaver");

    drop(leaver);
    let dropped = recv_subsystem(&mut watcher, "peerlist").await;
    assert!(dropped.args[0] == "drop" && dropped.args[1] == "leaver");
    assert_eq!(router.handle.peers().await.unwrap(), vec!["watcher"]);
}

#[tokio::test]
async fn test_quit_from_control_stops_router() {
    let router = start_direct(local_config("site")).await;
    let mut control = connect(router.addr, "control", None).await.unwrap();
    control.send_message(&Message::new("", "quit")).await.unwrap();

    let result = tokio::time::timeout(TIMEOUT, router.task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(matches!(router.handle.peers().await, Err(RouterError::Stopped)));
}

#[tokio::test]
async fn test_stop_via_handle() {
    let router = start_direct(local_config("site")).await;
    router.handle.stop().await.unwrap();
    tokio::time::timeout(TIMEOUT, router.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(
        router.handle.disconnect_platform("nowhere").await,
        Err(RouterError::Stopped)
    ));
}
