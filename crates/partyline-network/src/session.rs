//! Per-connection sessions: handshake, stream workers and supervisor.
//!
//! A session runs over any split byte stream (the libp2p stream in
//! production, in-memory pipes in tests):
//!
//! 1. [`SessionContext::establish`] performs the `Hello` exchange in the
//!    order fixed by [`Direction`], registers an outbound queue for the
//!    remote peer and raises `PeerJoined`.
//! 2. [`Session::run`] supervises one reader and one writer task. When
//!    either ends, the supervisor removes the peer's queue (guarded by
//!    its ticket) and stops the other task. Nothing is retried.
//!
//! Errors inside one session are logged and never reach other sessions,
//! the hub or the fan-out router.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use libp2p::PeerId;
use tokio::task::{JoinHandle, JoinSet};

use partyline_hub::Dispatcher;
use partyline_storage::RecordingStore;
use partyline_types::audio::Recording;
use partyline_types::{AttachmentKind, Message, PartyLineError, Result, UserInfo};

use crate::protocol::{read_record, write_record, WireHello, WireMessage, WireRecord, WireUser};
use crate::registry::{OutboundQueue, PeerRegistry};

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Which side opened the stream.
///
/// The inbound side reads the remote `Hello` before sending its own; the
/// outbound side writes first and then reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Stream accepted from a remote peer.
    Inbound,
    /// Stream opened by this node.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Exchanges `Hello` records and returns the remote participant.
///
/// Exactly one `Hello` is sent and one received. The remote `Hello` must
/// carry `expected_peer`, the identity authenticated by the transport.
///
/// # Errors
///
/// Returns `HandshakeFailed` if the stream fails or closes, the first
/// record is not a `Hello`, or the announced identity does not match.
pub async fn handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    local: &WireHello,
    expected_peer: &PeerId,
) -> Result<UserInfo>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match direction {
        Direction::Inbound => {
            let remote = read_hello(reader, expected_peer).await?;
            send_hello(writer, local).await?;
            Ok(remote)
        }
        Direction::Outbound => {
            send_hello(writer, local).await?;
            read_hello(reader, expected_peer).await
        }
    }
}

async fn send_hello<W>(writer: &mut W, local: &WireHello) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_record(writer, &WireRecord::Hello(local.clone()))
        .await
        .map_err(|e| handshake_failed(format!("sending hello: {e}")))
}

async fn read_hello<R>(reader: &mut R, expected_peer: &PeerId) -> Result<UserInfo>
where
    R: AsyncRead + Unpin,
{
    let record = read_record(reader)
        .await
        .map_err(|e| handshake_failed(format!("reading hello: {e}")))?;

    let hello = match record {
        Some(WireRecord::Hello(hello)) => hello,
        Some(other) => {
            return Err(handshake_failed(format!(
                "expected hello, got {}",
                other.label()
            )))
        }
        None => return Err(handshake_failed("stream closed before hello")),
    };

    let announced = hello
        .user
        .peer_id()
        .map_err(|e| handshake_failed(e.to_string()))?;
    if announced != *expected_peer {
        return Err(handshake_failed(format!(
            "hello announces {announced} but the transport peer is {expected_peer}"
        )));
    }
    Ok(UserInfo::new(announced.to_base58(), hello.user.nickname))
}

fn handshake_failed(reason: impl Into<String>) -> PartyLineError {
    PartyLineError::HandshakeFailed {
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// SessionContext
// ---------------------------------------------------------------------------

/// Everything a session needs from the rest of the node.
#[derive(Clone)]
pub struct SessionContext {
    local_hello: WireHello,
    dispatcher: Dispatcher,
    registry: Arc<PeerRegistry>,
    store: Arc<dyn RecordingStore>,
    handshake_timeout: Duration,
}

impl SessionContext {
    /// Creates a context announcing `local_peer` as `nickname`.
    pub fn new(
        local_peer: &PeerId,
        nickname: &str,
        dispatcher: Dispatcher,
        registry: Arc<PeerRegistry>,
        store: Arc<dyn RecordingStore>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            local_hello: WireHello {
                user: WireUser::new(local_peer, nickname),
            },
            dispatcher,
            registry,
            store,
            handshake_timeout,
        }
    }

    /// The peer registry sessions register with.
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Runs the handshake on a fresh stream and, on success, registers
    /// the peer's outbound queue and raises `PeerJoined`.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeFailed` (including on timeout). Nothing is
    /// registered or broadcast in that case.
    pub async fn establish<R, W>(
        &self,
        remote_peer: PeerId,
        direction: Direction,
        mut reader: R,
        mut writer: W,
    ) -> Result<Session<R, W>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let exchange = handshake(
            &mut reader,
            &mut writer,
            direction,
            &self.local_hello,
            &remote_peer,
        );
        let remote = match tokio::time::timeout(self.handshake_timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(handshake_failed(format!(
                    "no hello within {}s",
                    self.handshake_timeout.as_secs()
                )))
            }
        };

        let queue = self.registry.register(remote_peer);
        tracing::info!(
            peer = %remote_peer,
            nickname = %remote.nickname,
            %direction,
            "handshake complete"
        );
        self.dispatcher.notify_peer_joined(remote.clone()).await;

        Ok(Session {
            remote,
            peer: remote_peer,
            queue,
            reader,
            writer,
            ctx: self.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// An established session, ready to run its workers.
pub struct Session<R, W> {
    remote: UserInfo,
    peer: PeerId,
    queue: OutboundQueue,
    reader: R,
    writer: W,
    ctx: SessionContext,
}

#[derive(Clone, Copy, Debug)]
enum Worker {
    Reader,
    Writer,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// The remote participant as announced in its `Hello`.
    pub fn remote(&self) -> &UserInfo {
        &self.remote
    }

    /// Runs the session on its own task.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Runs reader and writer until either ends, then cleans up.
    ///
    /// Returns the result of the worker that ended first. `Ok(())` means
    /// a clean close (remote end-of-stream or local queue closed).
    pub async fn run(self) -> Result<()> {
        let Session {
            remote,
            peer,
            queue,
            reader,
            writer,
            ctx,
        } = self;
        let ticket = queue.ticket();

        let mut workers = JoinSet::new();
        workers.spawn(read_loop(reader, peer, ctx.dispatcher.clone(), Arc::clone(&ctx.store)));
        workers.spawn(write_loop(writer, queue));

        let outcome = match workers.join_next().await {
            Some(Ok((worker, result))) => {
                tracing::debug!(%peer, ?worker, "session worker finished");
                result
            }
            Some(Err(join_error)) => Err(PartyLineError::StreamIo {
                reason: format!("session worker aborted: {join_error}"),
            }),
            None => Ok(()),
        };

        ctx.registry.remove(&peer, ticket);
        workers.shutdown().await;

        match &outcome {
            Ok(()) => tracing::info!(%peer, nickname = %remote.nickname, "session closed"),
            Err(error) => {
                tracing::info!(%peer, nickname = %remote.nickname, %error, "session ended")
            }
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn read_loop<R>(
    mut reader: R,
    peer: PeerId,
    dispatcher: Dispatcher,
    store: Arc<dyn RecordingStore>,
) -> (Worker, Result<()>)
where
    R: AsyncRead + Unpin,
{
    let result = read_messages(&mut reader, peer, &dispatcher, store.as_ref()).await;
    (Worker::Reader, result)
}

async fn read_messages<R>(
    reader: &mut R,
    peer: PeerId,
    dispatcher: &Dispatcher,
    store: &dyn RecordingStore,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let wire = match read_record(reader).await? {
            None => return Ok(()),
            Some(WireRecord::Message(wire)) => wire,
            Some(WireRecord::Hello(_)) => {
                return Err(PartyLineError::ProtocolViolation {
                    reason: "hello after handshake".into(),
                })
            }
        };

        let msg = match Message::try_from(wire) {
            Ok(msg) => msg,
            Err(error) => {
                tracing::warn!(%peer, %error, "dropping malformed message");
                continue;
            }
        };
        tracing::debug!(%peer, attachments = msg.attachments.len(), "message received");

        persist_attachments(&msg, store);
        dispatcher.submit_incoming(msg).await?;
    }
}

async fn write_loop<W>(mut writer: W, mut queue: OutboundQueue) -> (Worker, Result<()>)
where
    W: AsyncWrite + Unpin,
{
    let result = write_messages(&mut writer, &mut queue).await;
    (Worker::Writer, result)
}

async fn write_messages<W>(writer: &mut W, queue: &mut OutboundQueue) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = queue.recv().await {
        let wire = match WireMessage::try_from(msg.as_ref()) {
            Ok(wire) => wire,
            Err(error) => {
                tracing::warn!(peer = %queue.peer(), %error, "skipping unsendable message");
                continue;
            }
        };
        write_record(writer, &WireRecord::Message(wire)).await?;
    }
    // Queue closed: this session was replaced or torn down.
    let _ = writer.close().await;
    Ok(())
}

/// Stores every inbound audio attachment that carries content under the
/// attachment's id. Failures are logged; the message is delivered anyway.
fn persist_attachments(msg: &Message, store: &dyn RecordingStore) {
    for attachment in &msg.attachments {
        if attachment.kind != AttachmentKind::AudioOpus || !attachment.is_resolved() {
            continue;
        }
        let stored = Recording::from_payload(&attachment.payload).and_then(|mut recording| {
            recording.id = attachment.id.clone();
            store.add_recording(recording)
        });
        if let Err(error) = stored {
            tracing::warn!(id = %attachment.id, %error, "could not store inbound recording");
        }
    }
}
