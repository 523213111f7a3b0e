//! Connection handshake for the direct transport.
//!
//! The connecting side sends a [`Greeting`] as a single JSON frame naming the
//! identity it wants and, optionally, proving a credential with
//! HMAC-SHA256(secret, nonce + identity). The router answers with a
//! [`GreetingAck`] carrying the identity it assigned.

use crate::error::WireError;
use crate::frame::{Frame, FrameKind};
use crate::message::PROTO;
use crate::socket::VipSocket;
use crate::stream::{FramedStream, MultipartChannel};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

/// Generate an HMAC-SHA256 signature.
pub fn hmac_sign(secret: &str, data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify an HMAC-SHA256 signature using constant-time comparison.
pub fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    let expected = hmac_sign(secret, data);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}

/// A shared secret known to both the agent and the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub key_id: String,
    pub secret: String,
}

impl Credential {
    pub fn new(key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            secret: secret.into(),
        }
    }
}

/// First message on a new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    /// Requested identity; empty asks the router to assign one.
    pub identity: String,
    pub protocol: String,
    pub nonce: String,
    #[serde(default)]
    pub key_id: Option<String>,
    #[serde(default)]
    pub auth_hmac: String,
}

impl Greeting {
    pub fn new(identity: impl Into<String>, credential: Option<&Credential>) -> Self {
        let identity = identity.into();
        let nonce = uuid::Uuid::new_v4().to_string();
        let (key_id, auth_hmac) = match credential {
            Some(cred) => {
                let data = format!("{}{}", nonce, identity);
                (
                    Some(cred.key_id.clone()),
                    hmac_sign(&cred.secret, data.as_bytes()),
                )
            }
            None => (None, String::new()),
        };
        Self {
            identity,
            protocol: PROTO.to_string(),
            nonce,
            key_id,
            auth_hmac,
        }
    }

    /// Check the credential proof against `secret`.
    pub fn verify(&self, secret: &str) -> bool {
        let data = format!("{}{}", self.nonce, self.identity);
        hmac_verify(secret, data.as_bytes(), &self.auth_hmac)
    }
}

/// The router's answer to a [`Greeting`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingAck {
    pub accepted: bool,
    /// Identity the router assigned to this connection.
    pub identity: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl GreetingAck {
    pub fn accept(identity: impl Into<String>) -> Self {
        Self {
            accepted: true,
            identity: identity.into(),
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            identity: String::new(),
            reason: Some(reason.into()),
        }
    }
}

async fn write_json<C, T>(channel: &mut C, value: &T) -> Result<(), WireError>
where
    C: MultipartChannel + ?Sized,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    channel
        .send_multipart(vec![Frame::new(FrameKind::Json, body)])
        .await
}

async fn read_json<C, T>(channel: &mut C) -> Result<T, WireError>
where
    C: MultipartChannel + ?Sized,
    T: for<'de> Deserialize<'de>,
{
    let frames = channel.recv_multipart().await?;
    match frames.as_slice() {
        [frame] => Ok(serde_json::from_slice(frame.as_bytes())?),
        _ => Err(WireError::HandshakeFailed(format!(
            "expected one handshake frame, got {}",
            frames.len()
        ))),
    }
}

pub async fn write_greeting<C>(channel: &mut C, greeting: &Greeting) -> Result<(), WireError>
where
    C: MultipartChannel + ?Sized,
{
    write_json(channel, greeting).await
}

pub async fn read_greeting<C>(channel: &mut C) -> Result<Greeting, WireError>
where
    C: MultipartChannel + ?Sized,
{
    let greeting: Greeting = read_json(channel).await?;
    if greeting.protocol != PROTO {
        return Err(WireError::HandshakeFailed(format!(
            "unsupported protocol {:?}",
            greeting.protocol
        )));
    }
    Ok(greeting)
}

pub async fn write_ack<C>(channel: &mut C, ack: &GreetingAck) -> Result<(), WireError>
where
    C: MultipartChannel + ?Sized,
{
    write_json(channel, ack).await
}

pub async fn read_ack<C>(channel: &mut C) -> Result<GreetingAck, WireError>
where
    C: MultipartChannel + ?Sized,
{
    read_json(channel).await
}

/// Run the client half of the handshake over an established channel.
///
/// Returns the identity the router assigned.
pub async fn client_handshake<C>(
    channel: &mut C,
    identity: &str,
    credential: Option<&Credential>,
) -> Result<String, WireError>
where
    C: MultipartChannel + ?Sized,
{
    write_greeting(channel, &Greeting::new(identity, credential)).await?;
    let ack = read_ack(channel).await?;
    if !ack.accepted {
        return Err(WireError::HandshakeFailed(
            ack.reason.unwrap_or_else(|| "rejected".to_string()),
        ));
    }
    Ok(ack.identity)
}

/// Connect to a router over TCP as an agent.
pub async fn connect<A: ToSocketAddrs>(
    addr: A,
    identity: &str,
    credential: Option<&Credential>,
) -> Result<VipSocket<FramedStream<TcpStream>>, WireError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let mut channel = FramedStream::new(stream);
    debug!(identity, "VIP: sending greeting");
    let assigned = client_handshake(&mut channel, identity, credential).await?;
    info!(identity = %assigned, "VIP: connected to router");
    Ok(VipSocket::dealer(channel).with_identity(assigned))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_sign_verify() {
        let sig = hmac_sign("secret", b"hello");
        assert!(hmac_verify("secret", b"hello", &sig));
        assert!(!hmac_verify("wrong", b"hello", &sig));
        assert!(!hmac_verify("secret", b"other", &sig));
    }

    #[test]
    fn test_greeting_verify() {
        let cred = Credential::new("agent-key", "s3cret");
        let greeting = Greeting::new("hvac", Some(&cred));
        assert_eq!(greeting.key_id.as_deref(), Some("agent-key"));
        assert!(greeting.verify("s3cret"));
        assert!(!greeting.verify("nope"));

        let mut forged = greeting.clone();
        forged.identity = "other".into();
        assert!(!forged.verify("s3cret"));
    }

    #[test]
    fn test_anonymous_greeting_has_no_proof() {
        let greeting = Greeting::new("", None);
        assert!(greeting.key_id.is_none());
        assert!(greeting.auth_hmac.is_empty());
    }

    #[tokio::test]
    async fn test_client_handshake_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let mut client = FramedStream::new(a);
        let mut server = FramedStream::new(b);
        let server_task = tokio::spawn(async move {
            let greeting = read_greeting(&mut server).await.unwrap();
            assert_eq!(greeting.identity, "dup");
            write_ack(&mut server, &GreetingAck::reject("identity in use"))
                .await
                .unwrap();
        });
        let err = client_handshake(&mut client, "dup", None).await.unwrap_err();
        assert!(matches!(err, WireError::HandshakeFailed(ref r) if r == "identity in use"));
        server_task.await.unwrap();
    }
}
