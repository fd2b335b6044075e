// Wire envelope and framing shared by every broker front-end transport.
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const MAGIC: u32 = 0x42524B31;
pub const VERSION: u16 = 1;
// Flags describe how to interpret the frame payload.
pub const FLAG_FAULT: u16 = 0x0001;

/// Header carrying the logical client id.
pub const CLIENT_ID_HEADER: &str = "x-broker-client-id";
/// Opaque user data; its presence also marks the request as fire-and-forget.
pub const USER_DATA_HEADER: &str = "x-broker-user-data";
/// Security header removed before requests reach a client pipeline.
pub const SECURITY_HEADER: &str = "Security";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("unknown fault code {0}")]
    UnknownFaultCode(u32),
    #[error("failed to serialize message")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut bytes = [0u8; Self::LEN];
        self.encode_into(&mut bytes);
        buf.extend_from_slice(&bytes);
    }

    // Network byte order, same layout as `encode`.
    pub fn encode_into(&self, out: &mut [u8; Self::LEN]) {
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[6..8].copy_from_slice(&self.flags.to_be_bytes());
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate header before we trust the length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use broker_wire::Frame;
///
/// let frame = Frame::new(0, Bytes::from_static(b"hello")).expect("frame");
/// let decoded = Frame::decode(frame.encode()).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(flags, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

/// Stable fault codes returned to callers. The numeric values are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum FaultCode {
    InvalidClientId,
    ClientIdMismatch,
    AccessDenied,
    BrokerQueueFailure,
    ThrottlingTimeout,
    OpenFrontEndFailed,
    ClientPurged,
    OperationTimeout,
}

impl FaultCode {
    pub const fn value(self) -> u32 {
        match self {
            FaultCode::InvalidClientId => 1,
            FaultCode::ClientIdMismatch => 2,
            FaultCode::AccessDenied => 3,
            FaultCode::BrokerQueueFailure => 4,
            FaultCode::ThrottlingTimeout => 5,
            FaultCode::OpenFrontEndFailed => 6,
            FaultCode::ClientPurged => 7,
            FaultCode::OperationTimeout => 8,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            FaultCode::InvalidClientId => "invalid_client_id",
            FaultCode::ClientIdMismatch => "client_id_mismatch",
            FaultCode::AccessDenied => "access_denied",
            FaultCode::BrokerQueueFailure => "broker_queue_failure",
            FaultCode::ThrottlingTimeout => "throttling_timeout",
            FaultCode::OpenFrontEndFailed => "open_front_end_failed",
            FaultCode::ClientPurged => "client_purged",
            FaultCode::OperationTimeout => "operation_timeout",
        }
    }
}

impl From<FaultCode> for u32 {
    fn from(code: FaultCode) -> Self {
        code.value()
    }
}

impl TryFrom<u32> for FaultCode {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            1 => FaultCode::InvalidClientId,
            2 => FaultCode::ClientIdMismatch,
            3 => FaultCode::AccessDenied,
            4 => FaultCode::BrokerQueueFailure,
            5 => FaultCode::ThrottlingTimeout,
            6 => FaultCode::OpenFrontEndFailed,
            7 => FaultCode::ClientPurged,
            8 => FaultCode::OperationTimeout,
            other => return Err(Error::UnknownFaultCode(other)),
        })
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured fault payload carried by fault replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultDetail {
    pub code: FaultCode,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "urn:uuid:{}", self.0)
    }
}

/// Whether the sender's envelope version carries addressing headers.
/// Replies are only correlated to their request when it does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingMode {
    #[default]
    Correlated,
    Unaddressed,
}

impl AddressingMode {
    pub fn supports_correlation(self) -> bool {
        matches!(self, AddressingMode::Correlated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Ordered header list. Names compare exactly; they are wire contracts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|header| header.name == name)
            .map(|header| header.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|header| header.name == name)
    }

    // Replaces an existing header of the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|header| header.name == name) {
            Some(header) => header.value = value,
            None => self.0.push(Header { name, value }),
        }
    }

    /// Removes every header with this name. Decoded lists may repeat a name.
    pub fn remove_all(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|header| header.name != name);
        before - self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Request/reply envelope exchanged with broker callers.
///
/// ```
/// use broker_wire::{CLIENT_ID_HEADER, Message};
///
/// let request = Message::request("Echo", b"payload".to_vec()).with_header(CLIENT_ID_HEADER, "AB-12");
/// let decoded = Message::decode(request.encode().expect("encode")).expect("decode");
/// assert_eq!(decoded, request);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub addressing: AddressingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,
    #[serde(default, with = "base64_bytes")]
    pub body: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultDetail>,
}

impl Message {
    pub fn request(action: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            addressing: AddressingMode::Correlated,
            message_id: Some(MessageId::new()),
            relates_to: None,
            action: Some(action.into()),
            headers: Headers::new(),
            body: body.into(),
            fault: None,
        }
    }

    // Reply skeleton; correlation follows the request's addressing mode.
    pub fn reply_to(request: &Message, body: impl Into<Bytes>) -> Self {
        let relates_to = if request.addressing.supports_correlation() {
            request.message_id
        } else {
            None
        };
        Self {
            addressing: request.addressing,
            message_id: Some(MessageId::new()),
            relates_to,
            action: request.action.as_ref().map(|action| format!("{action}Response")),
            headers: Headers::new(),
            body: body.into(),
            fault: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_addressing(mut self, addressing: AddressingMode) -> Self {
        self.addressing = addressing;
        self
    }

    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }

    pub fn encode(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        let flags = if self.is_fault() { FLAG_FAULT } else { 0 };
        Frame::new(flags, Bytes::from(payload))
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        serde_json::from_slice(&frame.payload).map_err(Error::Deserialize)
    }
}

mod base64_bytes {
    use super::*;
    use serde::de::Error;

    // Encode Bytes as base64 string for JSON payloads.
    pub fn serialize<S>(value: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    // Decode base64 string into Bytes.
    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Bytes, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_rejects_bad_magic_and_version() {
        let mut buf = BytesMut::new();
        FrameHeader {
            magic: 0xDEADBEEF,
            version: VERSION,
            flags: 0,
            length: 0,
        }
        .encode(&mut buf);
        assert!(matches!(
            FrameHeader::decode(buf.freeze()),
            Err(Error::InvalidMagic)
        ));

        let mut buf = BytesMut::new();
        FrameHeader {
            magic: MAGIC,
            version: 9,
            flags: 0,
            length: 0,
        }
        .encode(&mut buf);
        assert!(matches!(
            FrameHeader::decode(buf.freeze()),
            Err(Error::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn truncated_frame_is_incomplete() {
        let frame = Frame::new(0, Bytes::from_static(b"abcdef")).expect("frame");
        let encoded = frame.encode();
        let truncated = encoded.slice(0..encoded.len() - 2);
        assert!(matches!(Frame::decode(truncated), Err(Error::Incomplete)));
    }

    #[test]
    fn fault_codes_are_stable() {
        assert_eq!(FaultCode::InvalidClientId.value(), 1);
        assert_eq!(FaultCode::ClientIdMismatch.value(), 2);
        assert_eq!(FaultCode::AccessDenied.value(), 3);
        assert_eq!(FaultCode::BrokerQueueFailure.value(), 4);
        assert_eq!(FaultCode::ThrottlingTimeout.value(), 5);
        assert_eq!(FaultCode::OpenFrontEndFailed.value(), 6);
        assert!(matches!(
            FaultCode::try_from(42),
            Err(Error::UnknownFaultCode(42))
        ));
        let json = serde_json::to_string(&FaultDetail {
            code: FaultCode::AccessDenied,
            reason: "nope".to_string(),
        })
        .expect("serialize");
        assert_eq!(json, r#"{"code":3,"reason":"nope"}"#);
    }

    #[test]
    fn fault_messages_set_frame_flag() {
        let mut message = Message::request("Calc", Bytes::new());
        assert_eq!(message.encode().expect("encode").header.flags, 0);
        message.fault = Some(FaultDetail {
            code: FaultCode::BrokerQueueFailure,
            reason: "queue down".to_string(),
        });
        assert_eq!(message.encode().expect("encode").header.flags, FLAG_FAULT);
    }

    #[test]
    fn headers_insert_replaces_and_remove_all_counts() {
        let mut headers = Headers::new();
        headers.insert(CLIENT_ID_HEADER, "a");
        headers.insert(CLIENT_ID_HEADER, "b");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get(CLIENT_ID_HEADER), Some("b"));
        assert_eq!(headers.get("X-BROKER-CLIENT-ID"), None);
        assert_eq!(headers.remove_all(CLIENT_ID_HEADER), 1);
        assert!(headers.is_empty());
        assert_eq!(headers.remove_all(CLIENT_ID_HEADER), 0);
    }

    #[test]
    fn decoded_duplicate_headers_are_all_removed() {
        let payload = br#"{"headers":[{"name":"Security","value":"a"},{"name":"x","value":"1"},{"name":"Security","value":"b"}]}"#;
        let message = Message::decode(Frame::new(0, Bytes::from_static(payload)).expect("frame"))
            .expect("decode");
        let mut headers = message.headers;
        assert_eq!(headers.len(), 3);
        assert_eq!(headers.remove_all(SECURITY_HEADER), 2);
        assert!(!headers.contains(SECURITY_HEADER));
        assert_eq!(headers.get("x"), Some("1"));
    }

    #[test]
    fn reply_correlates_only_when_addressed() {
        let request = Message::request("Calc", Bytes::new());
        let reply = Message::reply_to(&request, Bytes::new());
        assert_eq!(reply.relates_to, request.message_id);
        assert_eq!(reply.action.as_deref(), Some("CalcResponse"));

        let request = request.with_addressing(AddressingMode::Unaddressed);
        let reply = Message::reply_to(&request, Bytes::new());
        assert_eq!(reply.relates_to, None);
    }

    #[test]
    fn minimal_json_decodes_with_defaults() {
        let frame = Frame::new(0, Bytes::from_static(br#"{"action":"Ping"}"#)).expect("frame");
        let message = Message::decode(frame).expect("decode");
        assert_eq!(message.action.as_deref(), Some("Ping"));
        assert_eq!(message.addressing, AddressingMode::Correlated);
        assert!(message.body.is_empty());
        assert!(message.message_id.is_none());
    }
}
