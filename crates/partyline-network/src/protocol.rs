//! Party Line session wire protocol.
//!
//! A session is one libp2p stream negotiated on [`CHAT_PROTOCOL`]. Both
//! directions carry a sequence of length-delimited records:
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (BE)  | CBOR-encoded WireRecord   |
//! +----------------+---------------------------+
//! ```
//!
//! The first record in each direction is [`WireRecord::Hello`]; every
//! later record is [`WireRecord::Message`]. There are no acknowledgements.
//! A record longer than [`MAX_RECORD_SIZE`] is a protocol violation.
//!
//! # Protocol ID
//!
//! `/party-line/chat/1.0.0`

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{PeerId, StreamProtocol};
use serde::{Deserialize, Serialize};

use partyline_types::{Attachment, Message, PartyLineError, Result, Timestamp, UserInfo};

use crate::identity::parse_peer_id;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Protocol identifier for Party Line chat sessions.
pub const CHAT_PROTOCOL: StreamProtocol = StreamProtocol::new("/party-line/chat/1.0.0");

/// Maximum encoded size of a single record (1 MiB).
pub const MAX_RECORD_SIZE: usize = 1 << 20;

const LEN_PREFIX: usize = 4;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A participant as carried on the wire: binary peer id plus nickname.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireUser {
    /// `PeerId::to_bytes()` of the participant.
    #[serde(with = "serde_bytes")]
    pub peer_id: Vec<u8>,
    /// Display nickname.
    pub nickname: String,
}

/// First record in each direction of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHello {
    /// The sender's identity.
    pub user: WireUser,
}

/// An attachment as carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAttachment {
    /// Attachment id.
    pub id: String,
    /// Content-kind tag (e.g. `audio/opus`).
    pub kind: String,
    /// Inline content, empty if unresolved.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// A chat message as carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Message author.
    pub author: WireUser,
    /// RFC 3339 send time.
    pub sent_at: String,
    /// Optional body.
    pub text: Option<String>,
    /// Ordered attachments.
    pub attachments: Vec<WireAttachment>,
}

/// One framed record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireRecord {
    /// Handshake record.
    Hello(WireHello),
    /// Chat message.
    Message(WireMessage),
}

impl WireRecord {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Message(_) => "message",
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl WireUser {
    /// Wire form of `peer_id` with `nickname`.
    pub fn new(peer_id: &PeerId, nickname: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.to_bytes(),
            nickname: nickname.into(),
        }
    }

    /// Decodes the binary peer id.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if the bytes are not a valid peer id.
    pub fn peer_id(&self) -> Result<PeerId> {
        PeerId::from_bytes(&self.peer_id).map_err(|e| PartyLineError::ProtocolViolation {
            reason: format!("invalid peer id bytes: {e}"),
        })
    }
}

impl TryFrom<&UserInfo> for WireUser {
    type Error = PartyLineError;

    fn try_from(user: &UserInfo) -> Result<Self> {
        Ok(Self::new(&parse_peer_id(&user.peer_id)?, user.nickname.clone()))
    }
}

impl TryFrom<WireUser> for UserInfo {
    type Error = PartyLineError;

    fn try_from(user: WireUser) -> Result<Self> {
        let peer_id = user.peer_id()?;
        Ok(UserInfo::new(peer_id.to_base58(), user.nickname))
    }
}

impl From<&Attachment> for WireAttachment {
    fn from(a: &Attachment) -> Self {
        Self {
            id: a.id.clone(),
            kind: a.kind.as_str().to_string(),
            payload: a.payload.clone(),
        }
    }
}

impl From<WireAttachment> for Attachment {
    fn from(a: WireAttachment) -> Self {
        Self {
            id: a.id,
            kind: a.kind.into(),
            payload: a.payload,
        }
    }
}

impl TryFrom<&Message> for WireMessage {
    type Error = PartyLineError;

    fn try_from(msg: &Message) -> Result<Self> {
        Ok(Self {
            author: WireUser::try_from(&msg.author)?,
            sent_at: msg.sent_at.to_string(),
            text: msg.text.clone(),
            attachments: msg.attachments.iter().map(WireAttachment::from).collect(),
        })
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = PartyLineError;

    fn try_from(msg: WireMessage) -> Result<Self> {
        Ok(Self {
            author: UserInfo::try_from(msg.author)?,
            sent_at: msg.sent_at.parse::<Timestamp>()?,
            text: msg.text,
            attachments: msg.attachments.into_iter().map(Attachment::from).collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Reads one record.
///
/// Returns `Ok(None)` when the stream ends cleanly on a record boundary.
///
/// # Errors
///
/// - `StreamIo` on a read failure or a stream that ends mid-record.
/// - `ProtocolViolation` for an empty or oversized record, or one that
///   does not decode.
pub async fn read_record<R>(reader: &mut R) -> Result<Option<WireRecord>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LEN_PREFIX];
    let mut filled = 0usize;
    while filled < LEN_PREFIX {
        let n = reader
            .read(&mut header[filled..])
            .await
            .map_err(|e| stream_io("read length prefix", e))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(PartyLineError::StreamIo {
                reason: "stream ended inside a length prefix".into(),
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_RECORD_SIZE {
        return Err(PartyLineError::ProtocolViolation {
            reason: format!("record length {len} outside 1..={MAX_RECORD_SIZE}"),
        });
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| stream_io("read record body", e))?;

    let record = ciborium::from_reader(body.as_slice()).map_err(|e| {
        PartyLineError::ProtocolViolation {
            reason: format!("undecodable record: {e}"),
        }
    })?;
    Ok(Some(record))
}

/// Writes one record and flushes.
///
/// # Errors
///
/// - `ProtocolViolation` if the encoded record exceeds [`MAX_RECORD_SIZE`].
/// - `StreamIo` on a write failure.
pub async fn write_record<W>(writer: &mut W, record: &WireRecord) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = vec![0u8; LEN_PREFIX];
    ciborium::into_writer(record, &mut frame).map_err(|e| PartyLineError::ProtocolViolation {
        reason: format!("record encode failed: {e}"),
    })?;

    let len = frame.len() - LEN_PREFIX;
    if len > MAX_RECORD_SIZE {
        return Err(PartyLineError::ProtocolViolation {
            reason: format!("{} record of {len} bytes exceeds {MAX_RECORD_SIZE}", record.label()),
        });
    }
    frame[..LEN_PREFIX].copy_from_slice(&(len as u32).to_be_bytes());

    writer
        .write_all(&frame)
        .await
        .map_err(|e| stream_io("write record", e))?;
    writer.flush().await.map_err(|e| stream_io("flush", e))
}

fn stream_io(context: &str, e: std::io::Error) -> PartyLineError {
    PartyLineError::StreamIo {
        reason: format!("{context}: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use futures::io::Cursor;
    use partyline_types::AttachmentKind;

    use super::*;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn sample_message() -> Message {
        let author = UserInfo::new(PeerId::random().to_base58(), "alice");
        Message::text(author, "hi").with_attachment(Attachment {
            id: "rec-1".into(),
            kind: AttachmentKind::AudioOpus,
            payload: vec![1, 2, 3],
        })
    }

    #[test]
    fn message_survives_wire_conversion() -> TestResult {
        let msg = sample_message();
        let back = Message::try_from(WireMessage::try_from(&msg)?)?;
        assert_eq!(back, msg);
        Ok(())
    }

    #[test]
    fn binary_fields_encode_as_byte_strings() -> TestResult {
        let wire = WireAttachment {
            id: "rec-1".into(),
            kind: "audio/opus".into(),
            payload: vec![1, 2, 3],
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&wire, &mut buf)?;

        let value: ciborium::Value = ciborium::from_reader(buf.as_slice())?;
        let payload = value
            .as_map()
            .and_then(|fields| {
                fields
                    .iter()
                    .find(|(k, _)| k.as_text() == Some("payload"))
                    .map(|(_, v)| v.clone())
            })
            .ok_or("no payload field")?;
        assert_eq!(payload, ciborium::Value::Bytes(vec![1, 2, 3]));

        let back: WireAttachment = ciborium::from_reader(buf.as_slice())?;
        assert_eq!(back, wire);
        Ok(())
    }

    #[test]
    fn invalid_author_rejected() {
        let msg = Message::text(UserInfo::new("nope", "x"), "hi");
        assert!(WireMessage::try_from(&msg).is_err());

        let wire = WireUser {
            peer_id: vec![0xff; 3],
            nickname: "x".into(),
        };
        assert!(matches!(
            UserInfo::try_from(wire),
            Err(PartyLineError::ProtocolViolation { .. })
        ));
    }

    #[tokio::test]
    async fn records_read_back_in_order() -> TestResult {
        let hello = WireRecord::Hello(WireHello {
            user: WireUser::new(&PeerId::random(), "bob"),
        });
        let message = WireRecord::Message(WireMessage::try_from(&sample_message())?);

        let mut buf = Cursor::new(Vec::new());
        write_record(&mut buf, &hello).await?;
        write_record(&mut buf, &message).await?;

        let mut reader = Cursor::new(buf.into_inner());
        assert_eq!(read_record(&mut reader).await?, Some(hello));
        assert_eq!(read_record(&mut reader).await?, Some(message));
        assert_eq!(read_record(&mut reader).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn length_prefix_is_big_endian() -> TestResult {
        let record = WireRecord::Hello(WireHello {
            user: WireUser::new(&PeerId::random(), "carol"),
        });
        let mut buf = Cursor::new(Vec::new());
        write_record(&mut buf, &record).await?;
        let bytes = buf.into_inner();
        let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(declared, bytes.len() - 4);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_prefix_is_protocol_violation() {
        let mut reader = Cursor::new(((MAX_RECORD_SIZE + 1) as u32).to_be_bytes().to_vec());
        assert!(matches!(
            read_record(&mut reader).await,
            Err(PartyLineError::ProtocolViolation { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_record_not_written() {
        let mut msg = sample_message();
        msg.attachments[0].payload = vec![0u8; MAX_RECORD_SIZE];
        let record = match WireMessage::try_from(&msg) {
            Ok(m) => WireRecord::Message(m),
            Err(e) => panic!("conversion failed: {e}"),
        };
        let mut buf = Cursor::new(Vec::new());
        assert!(matches!(
            write_record(&mut buf, &record).await,
            Err(PartyLineError::ProtocolViolation { .. })
        ));
        assert!(buf.into_inner().is_empty());
    }

    #[tokio::test]
    async fn truncated_body_is_stream_io() {
        let mut bytes = 10u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0xa1, 0x00]);
        let mut reader = Cursor::new(bytes);
        assert!(matches!(
            read_record(&mut reader).await,
            Err(PartyLineError::StreamIo { .. })
        ));
    }

    #[tokio::test]
    async fn truncated_prefix_is_stream_io() {
        let mut reader = Cursor::new(vec![0u8, 0]);
        assert!(matches!(
            read_record(&mut reader).await,
            Err(PartyLineError::StreamIo { .. })
        ));
    }

    #[tokio::test]
    async fn garbage_body_is_protocol_violation() {
        let mut bytes = 3u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0xff, 0xff, 0xff]);
        let mut reader = Cursor::new(bytes);
        assert!(matches!(
            read_record(&mut reader).await,
            Err(PartyLineError::ProtocolViolation { .. })
        ));
    }
}
