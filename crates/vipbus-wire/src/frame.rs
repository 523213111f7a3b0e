//! Frames: the unit a transport moves atomically.
//!
//! A frame is an opaque byte payload plus a one-byte kind tag. The tag lets
//! typed values (integers, floats, JSON) survive transports whose native unit
//! is a byte blob; protocol header frames are plain text.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Type tag carried alongside a frame's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Untyped bytes, as produced by foreign peers or byte blobs.
    Raw,
    /// UTF-8 text.
    Text,
    /// Big-endian `i64`.
    Int,
    /// Big-endian IEEE-754 `f64`.
    Float,
    /// JSON document (list, map or boolean).
    Json,
}

impl FrameKind {
    /// Wire tag for this kind.
    pub fn tag(self) -> u8 {
        match self {
            FrameKind::Raw => 0,
            FrameKind::Text => 1,
            FrameKind::Int => 2,
            FrameKind::Float => 3,
            FrameKind::Json => 4,
        }
    }

    /// Parse a wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(FrameKind::Raw),
            1 => Some(FrameKind::Text),
            2 => Some(FrameKind::Int),
            3 => Some(FrameKind::Float),
            4 => Some(FrameKind::Json),
            _ => None,
        }
    }
}

/// One wire frame.
///
/// Equality and hashing look at the payload only; the kind tag is a decoding
/// hint and two frames with the same bytes are the same frame on the wire.
#[derive(Clone, Serialize, Deserialize)]
pub struct Frame {
    kind: FrameKind,
    data: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    pub fn raw(data: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Raw, data)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(FrameKind::Text, Bytes::from(text.into()))
    }

    /// The empty (untyped) frame.
    pub fn empty() -> Self {
        Self::new(FrameKind::Raw, Bytes::new())
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when the frame has no non-whitespace content.
    pub fn is_blank(&self) -> bool {
        self.data.iter().all(|b| b.is_ascii_whitespace())
    }

    /// The payload as UTF-8, if it is valid UTF-8.
    pub fn to_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Frame {}

impl Hash for Frame {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.hash(state);
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FrameKind::Int | FrameKind::Float => {
                write!(f, "{:?}({})", self.kind, hex_preview(&self.data))
            }
            _ => match self.to_str() {
                Some(s) => write!(f, "{s:?}"),
                None => write!(f, "{:?}({})", self.kind, hex_preview(&self.data)),
            },
        }
    }
}

fn hex_preview(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().min(32) * 2);
    for b in data.iter().take(32) {
        out.push_str(&format!("{b:02x}"));
    }
    if data.len() > 32 {
        out.push_str("...");
    }
    out
}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Frame::text(s)
    }
}

impl From<String> for Frame {
    fn from(s: String) -> Self {
        Frame::text(s)
    }
}

impl From<&String> for Frame {
    fn from(s: &String) -> Self {
        Frame::text(s.clone())
    }
}

impl From<Vec<u8>> for Frame {
    fn from(v: Vec<u8>) -> Self {
        Frame::raw(v)
    }
}

impl From<&[u8]> for Frame {
    fn from(v: &[u8]) -> Self {
        Frame::raw(Bytes::copy_from_slice(v))
    }
}

impl From<Bytes> for Frame {
    fn from(b: Bytes) -> Self {
        Frame::raw(b)
    }
}

impl PartialEq<str> for Frame {
    fn eq(&self, other: &str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl PartialEq<&str> for Frame {
    fn eq(&self, other: &&str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

/// Build a frame list from string slices.
pub fn frames<S: AsRef<str>>(parts: &[S]) -> Vec<Frame> {
    parts.iter().map(|p| Frame::text(p.as_ref())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        for kind in [
            FrameKind::Raw,
            FrameKind::Text,
            FrameKind::Int,
            FrameKind::Float,
            FrameKind::Json,
        ] {
            assert_eq!(FrameKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(FrameKind::from_tag(9), None);
    }

    #[test]
    fn test_str_comparison_ignores_kind() {
        assert!(Frame::raw(&b"VIP1"[..]) == "VIP1");
        assert!(Frame::text("VIP1") == "VIP1");
        assert!(Frame::text("VIP2") != "VIP1");
    }

    #[test]
    fn test_equality_ignores_kind() {
        assert_eq!(Frame::empty(), Frame::text(""));
        assert_ne!(Frame::text("a"), Frame::text("b"));
    }

    #[test]
    fn test_blank_detection() {
        assert!(Frame::empty().is_blank());
        assert!(Frame::text("  \t").is_blank());
        assert!(!Frame::text(" ping ").is_blank());
    }

    #[test]
    fn test_debug_shows_text() {
        assert_eq!(format!("{:?}", Frame::text("hello")), "\"hello\"");
        let dbg = format!("{:?}", Frame::raw(vec![0xff, 0xfe]));
        assert!(dbg.contains("fffe"), "{dbg}");
    }
}
