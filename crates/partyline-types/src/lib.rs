//! Core shared types for the Party Line peer-to-peer chat node.
//!
//! This crate defines the domain types exchanged between the event hub,
//! the network layer and the API/UI collaborators. It deliberately has no
//! libp2p dependency: peer identities travel as their canonical base58
//! string and are parsed back into `PeerId`s by `partyline-network`.

pub mod audio;
pub mod config;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// UserInfo
// ---------------------------------------------------------------------------

/// A network participant: stable peer identity plus a display nickname.
///
/// `peer_id` is the textual (base58) form of the libp2p `PeerId` derived
/// from the participant's keypair. Immutable once created.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct UserInfo {
    /// Canonical textual peer identity.
    pub peer_id: String,
    /// Human-readable nickname announced in the `Hello` record.
    pub nickname: String,
}

impl UserInfo {
    /// Creates a new `UserInfo`.
    pub fn new(peer_id: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            nickname: nickname.into(),
        }
    }
}

impl fmt::Display for UserInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.nickname, self.peer_id)
    }
}

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// UTC timestamp.
///
/// Serialized as RFC 3339 with full sub-second precision, so a message
/// survives a wire round trip bit-for-bit.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a `Timestamp` representing the current UTC time.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a `Timestamp` from a `DateTime<Utc>`.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the inner `DateTime<Utc>`.
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl FromStr for Timestamp {
    type Err = PartyLineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let dt = DateTime::parse_from_rfc3339(s)
            .map_err(|e| PartyLineError::ProtocolViolation {
                reason: format!("invalid RFC 3339 timestamp: {e}"),
            })?
            .with_timezone(&Utc);
        Ok(Self(dt))
    }
}

// ---------------------------------------------------------------------------
// AttachmentKind
// ---------------------------------------------------------------------------

/// Content-kind tag of an [`Attachment`].
///
/// Travels on the wire as its MIME-like string (`audio/opus`). Unknown
/// tags are preserved verbatim so newer peers can add kinds.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum AttachmentKind {
    /// Opus-encoded voice recording held by the audio store.
    AudioOpus,
    /// Any other content kind.
    Other(String),
}

impl AttachmentKind {
    /// Wire tag for [`AttachmentKind::AudioOpus`].
    pub const AUDIO_OPUS: &'static str = "audio/opus";

    /// Returns the wire tag.
    pub fn as_str(&self) -> &str {
        match self {
            Self::AudioOpus => Self::AUDIO_OPUS,
            Self::Other(tag) => tag,
        }
    }
}

impl From<&str> for AttachmentKind {
    fn from(tag: &str) -> Self {
        match tag {
            Self::AUDIO_OPUS => Self::AudioOpus,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for AttachmentKind {
    fn from(tag: String) -> Self {
        Self::from(tag.as_str())
    }
}

impl From<AttachmentKind> for String {
    fn from(kind: AttachmentKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

/// Reference to externally stored content carried inside a [`Message`].
///
/// Locally authored messages carry only `id` and `kind`; the payload stays
/// empty until the fan-out router hydrates it immediately before sending.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Identifier of the stored content (e.g. a recording id).
    pub id: String,
    /// Content-kind tag.
    pub kind: AttachmentKind,
    /// Serialized content. Empty until resolved.
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Attachment {
    /// Creates an unresolved attachment referencing `id`.
    pub fn reference(id: impl Into<String>, kind: AttachmentKind) -> Self {
        Self {
            id: id.into(),
            kind,
            payload: Vec::new(),
        }
    }

    /// Convenience constructor for an audio recording reference.
    pub fn audio(id: impl Into<String>) -> Self {
        Self::reference(id, AttachmentKind::AudioOpus)
    }

    /// Returns whether the payload has been filled in.
    pub fn is_resolved(&self) -> bool {
        !self.payload.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A chat message.
///
/// All chat is broadcast: there is no recipient field.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Author of the message.
    pub author: UserInfo,
    /// Time the author sent the message.
    pub sent_at: Timestamp,
    /// Optional free-text body.
    pub text: Option<String>,
    /// Ordered attachments.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Creates a message authored now with an optional text body.
    pub fn new(author: UserInfo, text: Option<String>) -> Self {
        Self {
            author,
            sent_at: Timestamp::now(),
            text,
            attachments: Vec::new(),
        }
    }

    /// Creates a text-only message authored now.
    pub fn text(author: UserInfo, text: impl Into<String>) -> Self {
        Self::new(author, Some(text.into()))
    }

    /// Appends an attachment, builder style.
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// The closed set of things the event hub reports to its listeners.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    /// A handshake with a remote peer completed.
    #[serde(rename = "user-joined")]
    PeerJoined(UserInfo),
    /// A message arrived from the network.
    #[serde(rename = "msg-received")]
    MessageReceived(Message),
    /// A locally authored message was handed to the fan-out router.
    #[serde(rename = "msg-sent")]
    MessageSent(Message),
    /// Someone asked this node to connect to the given target
    /// (peer id or multiaddr, in textual form).
    #[serde(rename = "connect-requested")]
    ConnectToPeerRequested(String),
}

impl EventKind {
    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PeerJoined(_) => "user-joined",
            Self::MessageReceived(_) => "msg-received",
            Self::MessageSent(_) => "msg-sent",
            Self::ConnectToPeerRequested(_) => "connect-requested",
        }
    }
}

/// Timestamped [`EventKind`]. Produced only by the event hub.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When the hub synthesized the event.
    pub timestamp: Timestamp,
    /// What happened.
    pub kind: EventKind,
}

impl Event {
    /// Stamps `kind` with the current time.
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Timestamp::now(),
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// PartyLineError
// ---------------------------------------------------------------------------

/// Central error type for the Party Line system.
///
/// All crates in the workspace convert their internal errors into variants
/// of this enum. The variants follow the failure taxonomy of the
/// connectivity engine: only `StartupFatal` and `NatDiagnosticTimeout`
/// may terminate the process; everything else is local to one connection,
/// one dial attempt or one attachment.
#[derive(Debug, Error)]
pub enum PartyLineError {
    /// Host construction or bootstrap failed; the process cannot continue.
    #[error("startup failed: {reason}")]
    StartupFatal {
        /// Human-readable description of the startup failure.
        reason: String,
    },

    /// No NAT classification arrived within the diagnostic window.
    #[error("NAT diagnostic timed out after {waited_secs}s ({received} of {expected} transports classified)")]
    NatDiagnosticTimeout {
        /// Length of the diagnostic window in seconds.
        waited_secs: u64,
        /// Number of classifications received before the deadline.
        received: usize,
        /// Number of classifications that were expected.
        expected: usize,
    },

    /// The `Hello` exchange failed (missing, malformed, or mismatched).
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// Human-readable description of the handshake failure.
        reason: String,
    },

    /// A dial could not reach the requested peer.
    #[error("peer unreachable: {reason}")]
    PeerUnreachable {
        /// Human-readable description of why the dial failed.
        reason: String,
    },

    /// A mid-session read or write failed.
    #[error("stream I/O error: {reason}")]
    StreamIo {
        /// Human-readable description of the I/O failure.
        reason: String,
    },

    /// A record or encoded payload violated the wire or codec rules.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// Human-readable description of the violation.
        reason: String,
    },

    /// Attachment content referenced by id could not be found.
    #[error("attachment unresolved: {id}")]
    AttachmentUnresolved {
        /// Identifier that failed to resolve.
        id: String,
    },

    /// A storage operation failed.
    #[error("storage error: {reason}")]
    StorageError {
        /// Human-readable description of the storage failure.
        reason: String,
    },

    /// The event hub worker is gone and can no longer accept work.
    #[error("event hub closed: {reason}")]
    HubClosed {
        /// Which queue was found closed.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    ConfigError {
        /// Human-readable description of the configuration problem.
        reason: String,
    },
}

impl PartyLineError {
    /// Returns whether this error must abort the process.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            Self::StartupFatal { .. } | Self::NatDiagnosticTimeout { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`PartyLineError`].
pub type Result<T> = std::result::Result<T, PartyLineError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
