//! Shared helpers for the network integration tests.
//!
//! Sessions run over in-memory byte pipes, so the handshake, workers and
//! fan-out are exercised exactly as over a libp2p stream.

#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::io::{AsyncRead, AsyncWrite};
use futures::stream::{IntoAsyncRead, Map, StreamExt, TryStreamExt};
use libp2p::PeerId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use partyline_hub::{Dispatcher, PublishQueue};
use partyline_network::registry::PeerRegistry;
use partyline_network::SessionContext;
use partyline_storage::MemoryRecordingStore;
use partyline_types::config::HubConfig;
use partyline_types::{Event, EventKind};

// ---------------------------------------------------------------------------
// Pipes
// ---------------------------------------------------------------------------

type Chunks = Map<UnboundedReceiver<Vec<u8>>, fn(Vec<u8>) -> io::Result<Vec<u8>>>;

/// Read end of a pipe.
pub type PipeReader = IntoAsyncRead<Chunks>;

/// Write end of a pipe. Every write is one chunk; closing or dropping it
/// ends the stream at the reader.
pub struct PipeWriter {
    tx: UnboundedSender<Vec<u8>>,
    writes: Arc<AtomicUsize>,
}

impl PipeWriter {
    /// Number of non-empty writes so far.
    pub fn write_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.writes)
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        match self.tx.unbounded_send(buf.to_vec()) {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Poll::Ready(Ok(buf.len()))
            }
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close_channel();
        Poll::Ready(Ok(()))
    }
}

fn ok_chunk(chunk: Vec<u8>) -> io::Result<Vec<u8>> {
    Ok(chunk)
}

/// One-directional in-memory pipe.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = unbounded();
    let chunks: Chunks = rx.map(ok_chunk as fn(Vec<u8>) -> io::Result<Vec<u8>>);
    let writer = PipeWriter {
        tx,
        writes: Arc::new(AtomicUsize::new(0)),
    };
    (writer, chunks.into_async_read())
}

/// The two ends of a bidirectional link, one per side.
pub struct Link {
    pub a: (PipeReader, PipeWriter),
    pub b: (PipeReader, PipeWriter),
}

/// Bidirectional link: what `a` writes `b` reads and vice versa.
pub fn link() -> Link {
    let (a_tx, b_rx) = pipe();
    let (b_tx, a_rx) = pipe();
    Link {
        a: (a_rx, a_tx),
        b: (b_rx, b_tx),
    }
}

/// Reader wrapper that records whether it was polled before a watched
/// writer had written anything.
pub struct ReadOrderWatch<R> {
    inner: R,
    writes: Arc<AtomicUsize>,
    read_before_write: Arc<AtomicBool>,
}

impl<R> ReadOrderWatch<R> {
    pub fn new(inner: R, writes: Arc<AtomicUsize>) -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        let watch = Self {
            inner,
            writes,
            read_before_write: Arc::clone(&flag),
        };
        (watch, flag)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReadOrderWatch<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        if self.writes.load(Ordering::SeqCst) == 0 {
            self.read_before_write.store(true, Ordering::SeqCst);
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

// ---------------------------------------------------------------------------
// Test nodes
// ---------------------------------------------------------------------------

/// Hub, registry and store of one simulated participant.
pub struct TestNode {
    pub peer: PeerId,
    pub nickname: String,
    pub hub: Dispatcher,
    pub events: mpsc::Receiver<Event>,
    pub publish: Option<PublishQueue>,
    pub registry: Arc<PeerRegistry>,
    pub store: Arc<MemoryRecordingStore>,
    pub ctx: SessionContext,
    worker: JoinHandle<()>,
}

impl TestNode {
    pub fn new(nickname: &str) -> Self {
        Self::with_queue_capacity(nickname, 16)
    }

    pub fn with_queue_capacity(nickname: &str, capacity: usize) -> Self {
        let peer = PeerId::random();
        let (hub, worker, publish) = match Dispatcher::new(&HubConfig::default()) {
            Ok(parts) => parts,
            Err(e) => panic!("hub config rejected: {e}"),
        };
        let events = hub.register_listener("test");
        let worker = tokio::spawn(worker.run());
        let registry = Arc::new(PeerRegistry::new(capacity));
        let store = Arc::new(MemoryRecordingStore::new());
        let ctx = SessionContext::new(
            &peer,
            nickname,
            hub.clone(),
            Arc::clone(&registry),
            store.clone(),
            Duration::from_secs(5),
        );
        Self {
            peer,
            nickname: nickname.to_string(),
            hub,
            events,
            publish: Some(publish),
            registry,
            store,
            ctx,
            worker,
        }
    }

    /// Next event, failing the test after five seconds.
    pub async fn next_event(&mut self) -> Event {
        match tokio::time::timeout(Duration::from_secs(5), self.events.recv()).await {
            Ok(Some(event)) => event,
            other => panic!("{}: expected an event, got {other:?}", self.nickname),
        }
    }

    /// Skips events until one matches `pred`.
    pub async fn wait_for(&mut self, pred: impl Fn(&EventKind) -> bool) -> Event {
        loop {
            let event = self.next_event().await;
            if pred(&event.kind) {
                return event;
            }
        }
    }

    /// Polls until `cond` holds, failing the test after five seconds.
    pub async fn eventually(&self, cond: impl Fn(&Self) -> bool) {
        for _ in 0..250 {
            if cond(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{}: condition not met in time", self.nickname);
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
