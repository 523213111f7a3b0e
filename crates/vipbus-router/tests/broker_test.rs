//! End-to-end tests over the in-process broker, alone and behind a proxy.

mod common;

use common::{local_config, recv_subsystem, wait_for_peer, TIMEOUT};
use vipbus_router::{Broker, BrokerConnection, ProxyRouter, RouterConfig, RouterService};
use vipbus_wire::{connect, decode, encode, FrameKind, Message, Value, VipSocket};

fn broker_agent(broker: &Broker, identity: &str) -> VipSocket<BrokerConnection> {
    let conn = BrokerConnection::connect(broker, "site", identity, "router").unwrap();
    VipSocket::dealer(conn).with_identity(identity)
}

fn broker_config() -> RouterConfig {
    RouterConfig {
        instance_name: "site".into(),
        bind_addresses: vec![],
        ..RouterConfig::default()
    }
}

#[tokio::test]
async fn test_broker_ping_and_forward() {
    let broker = Broker::new("volttron");
    let service = RouterService::on_broker(broker_config(), &broker).unwrap();
    let handle = service.handle();
    let task = tokio::spawn(service.run());

    let mut hvac = broker_agent(&broker, "hvac");
    let mut meter = broker_agent(&broker, "meter");

    hvac.send_message(&Message::new("", "ping").with_msg_id("m1"))
        .await
        .unwrap();
    let pong = recv_subsystem(&mut hvac, "ping").await;
    assert!(pong.peer.is_empty());
    assert!(pong.args[0] == "pong");
    wait_for_peer(&handle, "hvac").await;

    hvac.send_message(&Message::new("meter", "echo").with_args(["hi"]))
        .await
        .unwrap();
    let echo = recv_subsystem(&mut meter, "echo").await;
    assert!(echo.peer == "hvac");
    assert!(echo.args[0] == "hi");

    handle.stop().await.unwrap();
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_broker_preserves_typed_arguments() {
    let broker = Broker::new("volttron");
    let service = RouterService::on_broker(broker_config(), &broker).unwrap();
    let handle = service.handle();
    tokio::spawn(service.run());

    let mut a = broker_agent(&broker, "a");
    let mut b = broker_agent(&broker, "b");
    let values = vec![
        Value::Int(1),
        Value::Float(2.5),
        Value::Bytes(bytes::Bytes::from_static(&[0xff, 0x00])),
    ];
    a.send_message(&Message::new("b", "echo").with_args(encode(&values).unwrap()))
        .await
        .unwrap();

    let got = recv_subsystem(&mut b, "echo").await;
    assert!(got.peer == "a");
    let kinds: Vec<FrameKind> = got.args.iter().map(|f| f.kind()).collect();
    assert_eq!(kinds, vec![FrameKind::Int, FrameKind::Float, FrameKind::Raw]);
    assert_eq!(decode(&got.args), values);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_broker_unroutable_gets_error_reply() {
    let broker = Broker::new("volttron");
    let service = RouterService::on_broker(broker_config(), &broker).unwrap();
    tokio::spawn(service.run());

    let mut hvac = broker_agent(&broker, "hvac");
    hvac.send_message(&Message::new("ghost", "echo").with_msg_id("m4"))
        .await
        .unwrap();
    let err = recv_subsystem(&mut hvac, "error").await;
    assert!(err.msg_id == "m4");
    assert!(err.args[0] == "30");
    assert!(err.args[2] == "ghost");
}

#[tokio::test]
async fn test_proxy_bridges_direct_and_broker_peers() {
    let broker = Broker::new("volttron");
    let upstream = RouterService::on_broker(broker_config(), &broker).unwrap();
    let upstream_handle = upstream.handle();
    tokio::spawn(upstream.run());

    let proxy: ProxyRouter = RouterService::bind_proxy(local_config("site"), &broker)
        .await
        .unwrap();
    let addr = proxy.transport().local_addr().unwrap();
    let proxy_handle = proxy.handle();
    tokio::spawn(proxy.run());

    // The direct agent's first message makes it reachable from the broker.
    let mut direct = connect(addr, "zmq-a", None).await.unwrap();
    direct
        .send_message(&Message::new("", "ping"))
        .await
        .unwrap();
    recv_subsystem(&mut direct, "ping").await;
    wait_for_peer(&upstream_handle, "zmq-a").await;

    let mut rmq = broker_agent(&broker, "rmq-b");
    rmq.send_message(&Message::new("zmq-a", "echo").with_args(["from broker"]))
        .await
        .unwrap();
    let got = recv_subsystem(&mut direct, "echo").await;
    assert!(got.peer == "rmq-b");
    assert!(got.args[0] == "from broker");

    direct
        .send_message(&Message::new("rmq-b", "echo").with_args(["from direct"]))
        .await
        .unwrap();
    let got = recv_subsystem(&mut rmq, "echo").await;
    assert!(got.peer == "zmq-a");
    assert!(got.args[0] == "from direct");

    // Peer bus kinds are visible through the proxy's peer listing.
    direct
        .send_message(&Message::new("", "peerlist").with_args(["list_with_messagebus"]))
        .await
        .unwrap();
    let listing = recv_subsystem(&mut direct, "peerlist").await;
    let listing = loop_until_listing(&mut direct, listing).await;
    let map: serde_json::Value = serde_json::from_slice(listing.args[1].as_bytes()).unwrap();
    assert_eq!(map["zmq-a"], "direct");
    assert_eq!(map["rmq-b"], "broker");

    // Dropping the direct agent unregisters it upstream.
    drop(direct);
    for _ in 0..250 {
        if !upstream_handle.peers().await.unwrap().iter().any(|p| p == "zmq-a") {
            proxy_handle.stop().await.unwrap();
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("zmq-a was never dropped upstream");
}

/// Skip peerlist add/drop notifications until the listing reply arrives.
async fn loop_until_listing<C: vipbus_wire::MultipartChannel>(
    sock: &mut VipSocket<C>,
    mut msg: Message,
) -> Message {
    while msg.args.first().map_or(true, |a| *a != "listing_with_messagebus") {
        msg = recv_subsystem(sock, "peerlist").await;
    }
    msg
}
