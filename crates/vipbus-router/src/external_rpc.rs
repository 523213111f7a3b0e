//! External RPC bridge: relays RPC calls between agents on different
//! platform instances.
//!
//! `send_platform` from a local agent is stamped with where it came from and
//! forwarded to the target instance as `send_peer`. The target router turns
//! `send_peer` into an ordinary local message to the addressed agent.

use crate::routing::RoutingService;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use vipbus_wire::{Frame, PROTO};

/// Stateless relay for the `external_rpc` subsystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExternalRpcBridge;

fn field<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

impl ExternalRpcBridge {
    /// Handle `[sender, recipient, VIP1, user_id, msg_id, "external_rpc",
    /// op, payload]`.
    ///
    /// Returns router-order frames to deliver locally, if any.
    pub fn handle(&self, frames: &[Frame], routing: &mut RoutingService) -> Option<Vec<Frame>> {
        let sender = frames[0].to_string_lossy();
        let op = frames.get(6).and_then(|f| f.to_str());
        let payload = frames
            .get(7)
            .and_then(|f| serde_json::from_slice::<Value>(f.as_bytes()).ok());
        let Some(Value::Object(mut payload)) = payload else {
            warn!(peer = %sender, "VIP: malformed external RPC message");
            return None;
        };

        match op {
            Some("send_platform") => {
                let (Some(to_platform), Some(_)) =
                    (field(&payload, "to_platform"), field(&payload, "to_peer"))
                else {
                    warn!(peer = %sender, "VIP: external RPC without a destination");
                    return None;
                };
                let to_platform = to_platform.to_string();
                payload.insert(
                    "from_platform".into(),
                    Value::String(routing.instance_name().to_string()),
                );
                payload.insert("from_peer".into(), Value::String(sender.to_string()));

                let relayed = vec![
                    Frame::empty(),
                    Frame::text(PROTO),
                    frames[3].clone(),
                    frames[4].clone(),
                    Frame::text("external_rpc"),
                    Frame::text("send_peer"),
                    Frame::text(Value::Object(payload).to_string()),
                ];
                debug!(peer = %sender, platform = %to_platform, "VIP: relaying external RPC");
                if let Err(e) = routing.send(&to_platform, relayed) {
                    warn!(platform = %to_platform, error = %e, "VIP: external RPC not relayed");
                }
                None
            }
            Some("send_peer") => {
                let Some(to_peer) = field(&payload, "to_peer") else {
                    warn!(peer = %sender, "VIP: external RPC without a peer");
                    return None;
                };
                Some(vec![
                    Frame::text(to_peer),
                    Frame::empty(),
                    Frame::text(PROTO),
                    frames[3].clone(),
                    frames[4].clone(),
                    Frame::text("external_rpc"),
                    Frame::text("send_peer"),
                    frames[7].clone(),
                ])
            }
            other => {
                warn!(peer = %sender, op = ?other, "VIP: unknown external RPC operation");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialStore;
    use crate::config::{MessageBus, RouterConfig};
    use crate::error::DeliveryError;
    use crate::transport::FrameSink;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use vipbus_wire::frames;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<Vec<Frame>>>);

    impl FrameSink for RecordingSink {
        fn send_frames(&self, frames: Vec<Frame>) -> Result<(), DeliveryError> {
            self.0.lock().unwrap().push(frames);
            Ok(())
        }

        fn bus_kind(&self, _peer: &str) -> MessageBus {
            MessageBus::Direct
        }

        fn close_peer(&self, _peer: &str) {}
    }

    fn routing(sink: Arc<RecordingSink>) -> RoutingService {
        let config = RouterConfig {
            instance_name: "site-a".into(),
            ..RouterConfig::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        RoutingService::new(&config, sink, Arc::new(CredentialStore::new()), tx)
    }

    fn rpc(sender: &str, op: &str, payload: &str) -> Vec<Frame> {
        frames(&[sender, "", PROTO, "user", "m7", "external_rpc", op, payload])
    }

    #[test]
    fn test_send_platform_relays_to_instance() {
        let sink = Arc::new(RecordingSink::default());
        let mut routing = routing(sink.clone());
        let msg = rpc(
            "hvac",
            "send_platform",
            r#"{"to_platform": "site-b", "to_peer": "meter", "message": [1, 2]}"#,
        );
        assert_eq!(ExternalRpcBridge.handle(&msg, &mut routing), None);

        let sent = sink.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let relayed = &sent[0];
        assert_eq!(relayed[0], "site-b");
        assert_eq!(relayed[3], "user");
        assert_eq!(relayed[6], "send_peer");
        let payload: Value = serde_json::from_slice(relayed[7].as_bytes()).unwrap();
        assert_eq!(payload["from_platform"], "site-a");
        assert_eq!(payload["from_peer"], "hvac");
        assert_eq!(payload["to_peer"], "meter");
    }

    #[test]
    fn test_send_peer_delivers_locally() {
        let sink = Arc::new(RecordingSink::default());
        let mut routing = routing(sink.clone());
        let payload = r#"{"to_peer": "meter", "from_platform": "site-b"}"#;
        let local = ExternalRpcBridge
            .handle(&rpc("site-b", "send_peer", payload), &mut routing)
            .unwrap();
        assert_eq!(
            local,
            frames(&["meter", "", PROTO, "user", "m7", "external_rpc", "send_peer", payload])
        );
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_messages_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let mut routing = routing(sink.clone());
        let bridge = ExternalRpcBridge;
        assert_eq!(bridge.handle(&rpc("hvac", "send_platform", r#"{"to_peer": "x"}"#), &mut routing), None);
        assert_eq!(bridge.handle(&rpc("hvac", "send_peer", r#"{"to_platform": "x"}"#), &mut routing), None);
        assert_eq!(bridge.handle(&rpc("hvac", "send_peer", "not json"), &mut routing), None);
        assert_eq!(bridge.handle(&rpc("hvac", "bogus", "{}"), &mut routing), None);
        assert!(sink.0.lock().unwrap().is_empty());
    }
}
