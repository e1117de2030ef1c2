//! The client node: relays MP timestamps between verifiers.
//!
//! A client never listens — it only dials out to verifiers (grounded in
//! `client_architecture.py`'s `Client`, which has no `listen` method at
//! all). Each outgoing connection gets a read loop and a writer task from
//! [`crate::session`]; the read loop's only real job is forwarding a
//! `TIMESTAMP` it receives from one verifier to every other verifier,
//! exactly once.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::PeerAddr;
use crate::session::{spawn_writer, LinkTable};
use crate::types::NodeId;
use crate::wire::{self, Message};

/// Deduplicates forwards within a session: `(origin, t.to_bits(), iteration)`.
/// Keyed on the timestamp's bit pattern rather than the `f64` itself since
/// a relayed timestamp is never recomputed, only compared for identity.
struct ForwardTracker(Mutex<HashSet<(NodeId, u64, u32)>>);

impl ForwardTracker {
    fn new() -> Self {
        Self(Mutex::new(HashSet::new()))
    }

    /// Returns `true` if this is the first time we've seen this exact
    /// `(origin, t, iteration)`, marking it seen as a side effect.
    async fn mark_if_new(&self, origin: &str, t: f64, iteration: u32) -> bool {
        let key = (origin.to_string(), t.to_bits(), iteration);
        self.0.lock().await.insert(key)
    }

    async fn clear(&self) {
        self.0.lock().await.clear();
    }
}

/// Shared state for a running client node.
pub struct ClientRelay {
    id: NodeId,
    verifiers: LinkTable,
    forwarded: ForwardTracker,
    session_id: Mutex<Option<String>>,
}

impl ClientRelay {
    pub fn new(id: NodeId) -> Arc<Self> {
        Arc::new(Self {
            id,
            verifiers: LinkTable::new(),
            forwarded: ForwardTracker::new(),
            session_id: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn connected_verifiers(&self) -> Vec<NodeId> {
        self.verifiers.ids().await
    }

    /// Dial every peer in `peers` that isn't already connected.
    pub async fn connect_to_verifiers(self: &Arc<Self>, peers: &[PeerAddr]) {
        for peer in peers {
            self.connect(peer).await;
        }
    }

    /// Dial a single verifier and spawn its read loop.
    pub async fn connect(self: &Arc<Self>, peer: &PeerAddr) {
        if self.verifiers.contains(&peer.id).await {
            tracing::info!(verifier = %peer.id, "already connected, skipping");
            return;
        }

        let addr = format!("{}:{}", peer.host, peer.port);
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(verifier = %peer.id, %addr, error = %e, "failed to connect");
                return;
            }
        };

        let (read_half, write_half) = stream.into_split();
        let mut writer = write_half;
        if let Err(e) = wire::write_message(&mut writer, &Message::Hello(self.id.clone())).await {
            tracing::error!(verifier = %peer.id, error = %e, "failed to send HELLO");
            return;
        }

        let tx = spawn_writer(peer.id.clone(), writer);
        let this = Arc::clone(self);
        let verifier_id = peer.id.clone();
        let task = tokio::spawn(async move {
            this.handle_verifier(read_half, verifier_id).await;
        });
        self.verifiers.insert(peer.id.clone(), tx, task).await;
        tracing::info!(verifier = %peer.id, %addr, "connected to verifier");
    }

    async fn handle_verifier<R>(self: Arc<Self>, read_half: R, verifier_id: NodeId)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(read_half);
        loop {
            match wire::read_message(&mut reader).await {
                Ok(Some(Ok(msg))) => self.dispatch(&verifier_id, msg).await,
                Ok(Some(Err(e))) => {
                    tracing::warn!(from = %verifier_id, error = %e, "dropping malformed message");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(from = %verifier_id, error = %e, "connection error");
                    break;
                }
            }
        }
        self.verifiers.remove(&verifier_id).await;
        tracing::info!(verifier = %verifier_id, "disconnected");
    }

    async fn dispatch(self: &Arc<Self>, from: &str, msg: Message) {
        match msg {
            Message::Timestamp { sender, t, iteration } => {
                self.forward_timestamp(from, sender, t, iteration).await;
            }
            Message::StartMeasurements { session_id, iterations } => {
                *self.session_id.lock().await = Some(session_id.clone());
                self.forwarded.clear().await;
                tracing::info!(session_id = %session_id, iterations, "measurement session starting");
                // No action beyond recording the session: verifiers drive the protocol.
            }
            other => {
                tracing::info!(from = %from, command = other.command(), "unhandled message");
            }
        }
    }

    /// Forward a `TIMESTAMP` originating at `sender` to every connected
    /// verifier except `sender` itself, at most once per `(sender, t,
    /// iteration)`.
    async fn forward_timestamp(self: &Arc<Self>, _from: &str, sender: NodeId, t: f64, iteration: u32) {
        if !self.forwarded.mark_if_new(&sender, t, iteration).await {
            return;
        }

        for verifier_id in self.verifiers.ids().await {
            if verifier_id == sender {
                continue;
            }
            let delivered = self
                .verifiers
                .send_to(
                    &verifier_id,
                    Message::ForwardTimestamp {
                        origin: sender.clone(),
                        t,
                        iteration,
                    },
                )
                .await;
            if delivered {
                tracing::info!(origin = %sender, to = %verifier_id, "forwarded timestamp");
            }
        }
    }

    /// Close every verifier connection: aborts each read-loop task (see
    /// [`LinkTable::clear`]) rather than just dropping the writer channel,
    /// so a handler blocked on `wire::read_message` doesn't leak.
    pub async fn shutdown(&self) {
        tracing::info!(id = %self.id, "shutting down");
        self.verifiers.clear().await;
    }
}
