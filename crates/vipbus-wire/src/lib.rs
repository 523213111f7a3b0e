//! VIP wire layer.
//!
//! Everything an agent or router needs to speak the VIP protocol over a byte
//! stream:
//!
//! - **Frame** / **codec**: typed frames and the value codec
//! - **stream**: length-prefixed multipart framing over TCP or any async stream
//! - **VipSocket**: the frame-ordering state machine
//! - **handshake**: identity and credential exchange when a connection opens

pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod socket;
pub mod stream;

pub use codec::{decode, encode, Value};
pub use error::{ProtocolError, WireError};
pub use frame::{frames, Frame, FrameKind};
pub use handshake::{connect, Credential, Greeting, GreetingAck};
pub use message::{ErrorCode, Message, PROTO, PROTOCOL_VERSION};
pub use socket::{SocketRole, VipSocket};
pub use stream::{FramedStream, MultipartChannel};
