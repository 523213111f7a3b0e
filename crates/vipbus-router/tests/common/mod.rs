//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use vipbus_router::{
    PlatformState, RouterConfig, RouterHandle, RouterResult, RouterService,
};
use vipbus_wire::{Message, MultipartChannel, VipSocket};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn local_config(instance: &str) -> RouterConfig {
    RouterConfig {
        instance_name: instance.to_string(),
        bind_addresses: vec!["127.0.0.1:0".to_string()],
        ..RouterConfig::default()
    }
}

pub struct Running {
    pub addr: SocketAddr,
    pub handle: RouterHandle,
    pub task: JoinHandle<RouterResult<()>>,
}

/// Bind a direct-transport router on an ephemeral port and run it.
pub async fn start_direct(config: RouterConfig) -> Running {
    let service = RouterService::bind_direct(config).await.unwrap();
    let addr = service.transport().local_addr().unwrap();
    let handle = service.handle();
    let task = tokio::spawn(service.run());
    Running { addr, handle, task }
}

/// Receive until a message for `subsystem` arrives, skipping peerlist chatter.
pub async fn recv_subsystem<C: MultipartChannel>(sock: &mut VipSocket<C>, subsystem: &str) -> Message {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let msg = sock.recv_message().await.unwrap();
            if msg.subsystem == subsystem {
                return msg;
            }
        }
    })
    .await
    .expect("timed out waiting for message")
}

pub async fn wait_for_peer(handle: &RouterHandle, peer: &str) {
    for _ in 0..250 {
        if handle.peers().await.unwrap().iter().any(|p| p == peer) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("peer {peer} never appeared");
}

pub async fn wait_for_platform(handle: &RouterHandle, instance: &str, state: PlatformState) {
    for _ in 0..250 {
        let platforms = handle.platforms().await.unwrap();
        if platforms
            .iter()
            .any(|p| p.instance_name == instance && p.state == state)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("platform {instance} never reached {state:?}");
}
