//! Two routers federated over TCP.

mod common;

use common::{local_config, recv_subsystem, start_direct, wait_for_platform};
use serde_json::{json, Value};
use vipbus_router::{PlatformConfig, PlatformState, RouterError};
use vipbus_wire::{connect, Message};

#[tokio::test]
async fn test_link_handshake_and_external_rpc() {
    let site_b = start_direct(local_config("site-b")).await;

    let mut config_a = local_config("site-a");
    config_a.platforms.push(PlatformConfig {
        instance_name: "site-b".into(),
        address: site_b.addr.to_string(),
        credential: None,
        web_address: Some("https://site-b".into()),
    });
    let site_a = start_direct(config_a).await;

    wait_for_platform(&site_a.handle, "site-b", PlatformState::Connected).await;
    wait_for_platform(&site_b.handle, "site-a", PlatformState::Connected).await;
    let inbound = site_b.handle.platforms().await.unwrap();
    assert!(inbound.iter().any(|p| p.instance_name == "site-a" && p.inbound));

    let mut meter = connect(site_b.addr, "meter", None).await.unwrap();
    let mut hvac = connect(site_a.addr, "hvac", None).await.unwrap();

    let call = json!({"to_platform": "site-b", "to_peer": "meter", "method": "read"});
    hvac.send_message(
        &Message::new("", "external_rpc")
            .with_msg_id("rpc-1")
            .with_args(["send_platform".to_string(), call.to_string()]),
    )
    .await
    .unwrap();

    let got = recv_subsystem(&mut meter, "external_rpc").await;
    assert!(got.msg_id == "rpc-1");
    assert!(got.args[0] == "send_peer");
    let payload: Value = serde_json::from_slice(got.args[1].as_bytes()).unwrap();
    assert_eq!(payload["from_platform"], "site-a");
    assert_eq!(payload["from_peer"], "hvac");
    assert_eq!(payload["method"], "read");

    site_a.handle.disconnect_platform("site-b").await.unwrap();
    assert!(matches!(
        site_a.handle.disconnect_platform("site-b").await,
        Err(RouterError::UnknownPlatform(_))
    ));
}

#[tokio::test]
async fn test_unreachable_platform_is_delayed() {
    // Grab a free port, then close it so connects are refused.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let mut config = local_config("site-a");
    config.federation.reconnect_initial_ms = 20;
    config.federation.reconnect_max_ms = 100;
    let site_a = start_direct(config).await;
    site_a
        .handle
        .connect_platform(PlatformConfig {
            instance_name: "site-z".into(),
            address: dead.to_string(),
            credential: None,
            web_address: None,
        })
        .await
        .unwrap();

    wait_for_platform(&site_a.handle, "site-z", PlatformState::ConnectionDelayed).await;
    site_a.handle.disconnect_platform("site-z").await.unwrap();
    assert!(site_a.handle.platforms().await.unwrap().is_empty());
}
