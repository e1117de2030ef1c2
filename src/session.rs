//! Connection bookkeeping shared by verifiers and clients.
//!
//! Every socket — verifier-to-verifier, verifier-to-client, or
//! client-to-verifier — gets one writer task fed by an
//! [`mpsc::Sender<Message>`], the same shape as the teacher's `Peer.tx`.
//! This keeps writes to a single socket serialized without needing the
//! table-wide lock held across an I/O await.
//!
//! [`LinkTable`] is the single-handle table used for verifier↔client and
//! client↔verifier links (the data model's `ClientLink` has one stream
//! handle). [`PeerLinkTable`] is the dual-handle table used for
//! verifier↔verifier links, which independently track an inbound and an
//! outbound half per peer id, matching the data model's `PeerLink`.

use std::collections::HashMap;

use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::types::NodeId;
use crate::wire::{self, Message};

/// Outbound handle to one connected peer: its id, a channel to its
/// dedicated writer task, and the handle of the task reading off the other
/// half of the same socket.
///
/// The read loop's `JoinHandle` is what makes a link's socket actually
/// closeable: dropping the sender only stops the writer task, it does
/// nothing for the reader, which is blocked on `wire::read_message` against
/// a live, separate `OwnedReadHalf` — aborting its task is what drops that
/// half and lets the fd close.
pub struct Link {
    pub id: NodeId,
    tx: mpsc::Sender<Message>,
    reader_task: JoinHandle<()>,
}

impl Link {
    /// Queue `msg` for delivery. Returns `false` if the writer task has
    /// already exited (the socket is gone) — the caller logs and moves on,
    /// per the propagation policy, it never escalates to an error return.
    pub async fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).await.is_ok()
    }
}

/// Spawn the per-socket writer task and return the sender end.
///
/// The task exits as soon as a write fails or every [`Link`] referencing it
/// is dropped, closing the channel.
pub fn spawn_writer<W>(id: NodeId, mut writer: W) -> mpsc::Sender<Message>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(32);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = wire::write_message(&mut writer, &msg).await {
                tracing::warn!(peer = %id, error = %e, "writer task exiting after failed write");
                break;
            }
        }
    });
    tx
}

/// A table of live [`Link`]s keyed by node id, behind one mutex.
///
/// Used for three distinct roles across the crate: a verifier's peers
/// (other verifiers), a verifier's clients, and a client's verifiers. The
/// shape is identical in all three; only which `Message` variants flow
/// through it differs by convention.
pub struct LinkTable {
    links: Mutex<HashMap<NodeId, Link>>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, id: NodeId, tx: mpsc::Sender<Message>, reader_task: JoinHandle<()>) {
        let mut links = self.links.lock().await;
        if let Some(old) = links.insert(id.clone(), Link { id, tx, reader_task }) {
            old.reader_task.abort();
        }
    }

    /// Remove the link, aborting its read loop so the socket actually
    /// closes instead of leaking a task blocked on a read that will never
    /// arrive.
    pub async fn remove(&self, id: &str) {
        if let Some(link) = self.links.lock().await.remove(id) {
            link.reader_task.abort();
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.links.lock().await.contains_key(id)
    }

    /// Best-effort send to a single link. Returns `false` if the id is
    /// unknown or its writer task has exited.
    pub async fn send_to(&self, id: &str, msg: Message) -> bool {
        let tx = {
            let links = self.links.lock().await;
            match links.get(id) {
                Some(link) => link.tx.clone(),
                None => return false,
            }
        };
        tx.send(msg).await.is_ok()
    }

    /// Send to every registered link, dropping ids whose writer has exited.
    pub async fn broadcast(&self, msg: Message) {
        // Clone the senders out and release the table lock before doing
        // any sending — a backed-up writer channel must never park other
        // table access behind it (§5/§9: never block I/O under the mutex).
        let senders: Vec<(NodeId, mpsc::Sender<Message>)> = {
            let links = self.links.lock().await;
            links.values().map(|link| (link.id.clone(), link.tx.clone())).collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in senders {
            if tx.send(msg.clone()).await.is_err() {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut links = self.links.lock().await;
            for id in dead {
                if let Some(link) = links.remove(&id) {
                    link.reader_task.abort();
                }
            }
        }
    }

    pub async fn ids(&self) -> Vec<NodeId> {
        self.links.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.links.lock().await.len()
    }

    /// Close every registered link, e.g. on shutdown: aborts every read
    /// loop task (unblocking it from a pending `wire::read_message`) before
    /// dropping the map, which also drops every writer's `mpsc::Sender`.
    pub async fn clear(&self) {
        for (_, link) in self.links.lock().await.drain() {
            link.reader_task.abort();
        }
    }
}

impl Default for LinkTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One verifier-to-verifier `PeerLink`: up to two independent socket
/// halves, exactly as modeled in the data model — the inbound connection
/// this peer dialed into us with, and the outbound connection we dialed
/// out with. Either may be briefly absent during bring-up; the link is
/// considered "up" once at least the outbound half exists.
#[derive(Default)]
struct PeerLinkEntry {
    incoming: Option<mpsc::Sender<Message>>,
    incoming_task: Option<JoinHandle<()>>,
    outgoing: Option<mpsc::Sender<Message>>,
    outgoing_task: Option<JoinHandle<()>>,
}

impl PeerLinkEntry {
    fn is_empty(&self) -> bool {
        self.incoming.is_none() && self.outgoing.is_none()
    }
}

/// A table of verifier peer links keyed by id, each with its own
/// incoming/outgoing halves.
///
/// A second `HELLO` for an id already present just replaces that half's
/// slot (the "double HELLO" case) rather than creating a second entry —
/// there is at most one `PeerLinkEntry` per peer id, per the data model's
/// uniqueness invariant.
pub struct PeerLinkTable {
    links: Mutex<HashMap<NodeId, PeerLinkEntry>>,
}

impl PeerLinkTable {
    pub fn new() -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Register the inbound half: this peer dialed into us. A second
    /// `HELLO` replacing an already-live incoming half aborts the stale
    /// read loop so the superseded connection's socket actually closes.
    pub async fn set_incoming(&self, id: NodeId, tx: mpsc::Sender<Message>, task: JoinHandle<()>) {
        let mut links = self.links.lock().await;
        let entry = links.entry(id).or_default();
        entry.incoming = Some(tx);
        if let Some(old) = entry.incoming_task.replace(task) {
            old.abort();
        }
    }

    /// Register the outbound half: we dialed this peer.
    pub async fn set_outgoing(&self, id: NodeId, tx: mpsc::Sender<Message>, task: JoinHandle<()>) {
        let mut links = self.links.lock().await;
        let entry = links.entry(id).or_default();
        entry.outgoing = Some(tx);
        if let Some(old) = entry.outgoing_task.replace(task) {
            old.abort();
        }
    }

    pub async fn remove_incoming(&self, id: &str) {
        let mut links = self.links.lock().await;
        if let Some(entry) = links.get_mut(id) {
            entry.incoming = None;
            if let Some(task) = entry.incoming_task.take() {
                task.abort();
            }
            if entry.is_empty() {
                links.remove(id);
            }
        }
    }

    pub async fn remove_outgoing(&self, id: &str) {
        let mut links = self.links.lock().await;
        if let Some(entry) = links.get_mut(id) {
            entry.outgoing = None;
            if let Some(task) = entry.outgoing_task.take() {
                task.abort();
            }
            if entry.is_empty() {
                links.remove(id);
            }
        }
    }

    /// `true` if an outbound half to `id` is currently open — used by
    /// `connect()` to skip a redial, matching the reference's
    /// `self.connections[identifier].get("outgoing")` check.
    pub async fn has_outgoing(&self, id: &str) -> bool {
        self.links
            .lock()
            .await
            .get(id)
            .is_some_and(|e| e.outgoing.is_some())
    }

    /// Every peer id with at least one half present (either direction) —
    /// used where the protocol just needs the set of known peers (e.g.
    /// the MP protocol's min-sum participant set).
    pub async fn ids(&self) -> Vec<NodeId> {
        self.links.lock().await.keys().cloned().collect()
    }

    /// Peer ids with an *outbound* half specifically — the AV protocol
    /// and `START_MEASUREMENTS` broadcast only ever go out over the
    /// outbound half (§4.2, §4.4): a verifier that has only dialed us in,
    /// never having been dialed back yet, is not a send target.
    pub async fn outgoing_ids(&self) -> Vec<NodeId> {
        self.links
            .lock()
            .await
            .iter()
            .filter(|(_, e)| e.outgoing.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.links.lock().await.len()
    }

    /// Best-effort send over the outbound half only. Returns `false` if
    /// there is no outbound half, or its writer task has exited.
    pub async fn send_outgoing(&self, id: &str, msg: Message) -> bool {
        let tx = {
            let links = self.links.lock().await;
            match links.get(id).and_then(|e| e.outgoing.clone()) {
                Some(tx) => tx,
                None => return false,
            }
        };
        tx.send(msg).await.is_ok()
    }

    /// Broadcast over every peer's outbound half, dropping halves whose
    /// writer task has exited.
    pub async fn broadcast_outgoing(&self, msg: Message) {
        // Clone the outbound senders out and release the table lock before
        // sending — matches `LinkTable::broadcast`, never park I/O under
        // the mutex (§5/§9).
        let senders: Vec<(NodeId, mpsc::Sender<Message>)> = {
            let links = self.links.lock().await;
            links
                .iter()
                .filter_map(|(id, entry)| entry.outgoing.clone().map(|tx| (id.clone(), tx)))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in senders {
            if tx.send(msg.clone()).await.is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            self.remove_outgoing(&id).await;
        }
    }

    /// Close every half of every peer, e.g. on shutdown: aborts every
    /// incoming and outgoing read loop task before dropping the map.
    pub async fn clear(&self) {
        for (_, entry) in self.links.lock().await.drain() {
            if let Some(task) = entry.incoming_task {
                task.abort();
            }
            if let Some(task) = entry.outgoing_task {
                task.abort();
            }
        }
    }
}

impl Default for PeerLinkTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod peer_link_tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn pipe() -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(4096)
    }

    fn noop_task() -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    #[tokio::test]
    async fn full_handshake_leaves_one_entry_with_both_halves() {
        let (c1, _s1) = pipe();
        let (c2, _s2) = pipe();
        let table = PeerLinkTable::new();
        table
            .set_outgoing("server2".to_string(), spawn_writer("server2".into(), c1), noop_task())
            .await;
        table
            .set_incoming("server2".to_string(), spawn_writer("server2".into(), c2), noop_task())
            .await;

        assert_eq!(table.len().await, 1);
        assert!(table.has_outgoing("server2").await);
        assert_eq!(table.ids().await, vec!["server2".to_string()]);
    }

    #[tokio::test]
    async fn double_hello_updates_the_incoming_slot_without_duplicating_the_entry() {
        let (c1, mut s1) = pipe();
        let (c2, mut s2) = pipe();
        let table = PeerLinkTable::new();
        table
            .set_incoming("server1".to_string(), spawn_writer("server1".into(), c1), noop_task())
            .await;
        table
            .set_incoming("server1".to_string(), spawn_writer("server1".into(), c2), noop_task())
            .await;

        assert_eq!(table.len().await, 1);
        // The newer inbound half is the one actually wired to the table:
        // a send lands on s2 (the second HELLO's connection), not s1.
        table
            .send_outgoing("server1", Message::Hello("probe".into()))
            .await;
        // send_outgoing requires an outbound half, which was never set, so
        // nothing is delivered anywhere — confirms incoming isn't used for sends.
        drop(s1);
        drop(s2);
    }

    #[tokio::test]
    async fn removing_both_halves_drops_the_entry() {
        let (c1, _s1) = pipe();
        let table = PeerLinkTable::new();
        table
            .set_outgoing("server2".to_string(), spawn_writer("server2".into(), c1), noop_task())
            .await;
        assert_eq!(table.len().await, 1);
        table.remove_outgoing("server2").await;
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn outgoing_ids_excludes_inbound_only_peers() {
        let (c1, _s1) = pipe();
        let (c2, _s2) = pipe();
        let table = PeerLinkTable::new();
        table
            .set_outgoing("server2".to_string(), spawn_writer("server2".into(), c1), noop_task())
            .await;
        table
            .set_incoming("server3".to_string(), spawn_writer("server3".into(), c2), noop_task())
            .await;

        assert_eq!(table.outgoing_ids().await, vec!["server2".to_string()]);
        let mut all = table.ids().await;
        all.sort();
        assert_eq!(all, vec!["server2".to_string(), "server3".to_string()]);
    }

    #[tokio::test]
    async fn send_outgoing_delivers_on_the_outbound_half() {
        let (c1, mut s1) = pipe();
        let table = PeerLinkTable::new();
        table
            .set_outgoing("server2".to_string(), spawn_writer("server2".into(), c1), noop_task())
            .await;

        assert!(
            table
                .send_outgoing("server2", Message::Hello("server1".into()))
                .await
        );
        let mut reader = tokio::io::BufReader::new(&mut s1);
        let msg = wire::read_message(&mut reader).await.unwrap().unwrap().unwrap();
        assert_eq!(msg, Message::Hello("server1".into()));
    }
}
