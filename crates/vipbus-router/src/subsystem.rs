//! Subsystem names understood by the router.

use std::fmt;
use vipbus_wire::Frame;

/// A subsystem named in frame 5 of a VIP message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Hello,
    Ping,
    Peerlist,
    Query,
    AgentStop,
    Quit,
    Error,
    PubSub,
    ExternalRpc,
    RoutingTable,
    /// Anything the router does not know.
    Other(String),
}

impl Subsystem {
    pub fn parse(frame: &Frame) -> Self {
        match frame.as_bytes() {
            b"hello" => Subsystem::Hello,
            b"ping" => Subsystem::Ping,
            b"peerlist" => Subsystem::Peerlist,
            b"query" => Subsystem::Query,
            b"agentstop" => Subsystem::AgentStop,
            b"quit" => Subsystem::Quit,
            b"error" => Subsystem::Error,
            b"pubsub" => Subsystem::PubSub,
            b"external_rpc" => Subsystem::ExternalRpc,
            b"routing_table" => Subsystem::RoutingTable,
            _ => Subsystem::Other(frame.to_string_lossy().into_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Subsystem::Hello => "hello",
            Subsystem::Ping => "ping",
            Subsystem::Peerlist => "peerlist",
            Subsystem::Query => "query",
            Subsystem::AgentStop => "agentstop",
            Subsystem::Quit => "quit",
            Subsystem::Error => "error",
            Subsystem::PubSub => "pubsub",
            Subsystem::ExternalRpc => "external_rpc",
            Subsystem::RoutingTable => "routing_table",
            Subsystem::Other(name) => name,
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of handing a router-addressed message to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// Reply to the sender with these argument frames.
    Reply(Vec<Frame>),
    /// Handled; nothing to send back.
    NoReply,
    /// The handler does not know this subsystem or operation.
    Unsupported,
}
