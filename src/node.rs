//! The verifier node: listens for peers and clients, runs the MP and AV
//! sub-protocols, and logs each iteration's delays.
//!
//! Grounded in `Server` in `server_architecture.py` — `listen` /
//! `_handle_incoming_connection` / `_handle_peer` / `_handle_client` /
//! `mp_protocol` / `av_protocol` map directly onto `accept_loop` /
//! `handle_incoming` / `handle_peer_loop` / `handle_client_loop` /
//! `mp_protocol` / `av_protocol` below, translated from thread-per-
//! connection to task-per-connection.
//!
//! One divergence from the reference: there, the verifier that issues
//! `measure_delays` only broadcasts `START_MEASUREMENTS` and never runs its
//! own measurement loop, which leaves that verifier's own MP/AV maps
//! permanently empty. [`Verifier::measure_delays`] also starts the local
//! loop — every session participant, including the initiator, produces a
//! delay log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{NodeConfig, PeerAddr};
use crate::error::NodeError;
use crate::log::DelayLogSink;
use crate::orchestrator::MeasurementState;
use crate::session::{spawn_writer, LinkTable, PeerLinkTable};
use crate::types::{now_secs, NodeId};
use crate::wire::{self, Message};

const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Which half of a `PeerLink` a connection handler is running for —
/// determines which slot gets cleared when the connection drops.
#[derive(Clone, Copy)]
enum PeerDirection {
    Incoming,
    Outgoing,
}

pub struct Verifier {
    id: NodeId,
    peers: PeerLinkTable,
    clients: LinkTable,
    measurement: MeasurementState,
    log_mp: DelayLogSink,
    log_av: DelayLogSink,
    /// Polled at the head of every handler loop; closing a socket is the
    /// authoritative cancellation for a blocked read, this flag is what
    /// stops the accept loop and any loop between reads (§5).
    terminating: AtomicBool,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Verifier {
    /// Bind the listener, truncate the delay log files, and spawn the
    /// accept loop. Returns the shared handle the REPL drives.
    pub async fn start(config: &NodeConfig) -> Result<Arc<Self>, NodeError> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| NodeError::Bind { addr, source })?;

        let log_mp = DelayLogSink::create_truncated(&config.mp_log).await?;
        let log_av = DelayLogSink::create_truncated(&config.av_log).await?;

        let this = Arc::new(Self {
            id: config.id.clone(),
            peers: PeerLinkTable::new(),
            clients: LinkTable::new(),
            measurement: MeasurementState::new(),
            log_mp,
            log_av,
            terminating: AtomicBool::new(false),
            accept_task: std::sync::Mutex::new(None),
        });

        let bound_addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        tracing::info!(id = %this.id, addr = %bound_addr, "listening");

        let accept_this = Arc::clone(&this);
        let handle = tokio::spawn(async move {
            accept_this.accept_loop(listener).await;
        });
        *this.accept_task.lock().unwrap() = Some(handle);

        Ok(this)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mp_log_path(&self) -> &std::path::Path {
        self.log_mp.path()
    }

    pub fn av_log_path(&self) -> &std::path::Path {
        self.log_av.path()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.terminating.load(Ordering::Relaxed) {
                return;
            }
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        this.handle_incoming(stream, addr).await;
                    });
                }
                Err(e) => {
                    tracing::error!(id = %self.id, error = %e, "error accepting connection");
                }
            }
        }
    }

    async fn handle_incoming(self: Arc<Self>, stream: TcpStream, addr: std::net::SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let hello = match wire::read_message(&mut reader).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                tracing::warn!(%addr, error = %e, "malformed opening message");
                return;
            }
            Ok(None) => return,
            Err(e) => {
                tracing::error!(%addr, error = %e, "error reading opening message");
                return;
            }
        };

        let identifier = match hello {
            Message::Hello(id) => id,
            other => {
                tracing::warn!(%addr, command = other.command(), "expected HELLO, got something else");
                return;
            }
        };

        if crate::types::is_client_id(&identifier) {
            let tx = spawn_writer(identifier.clone(), write_half);
            let this = Arc::clone(&self);
            let reply = tx.clone();
            let client_id = identifier.clone();
            let task = tokio::spawn(async move {
                this.handle_client_loop(reader, client_id, reply).await;
            });
            self.clients.insert(identifier.clone(), tx, task).await;
            tracing::info!(id = %self.id, client = %identifier, %addr, "incoming client connection");
        } else if crate::types::is_server_id(&identifier) {
            let tx = spawn_writer(identifier.clone(), write_half);
            let this = Arc::clone(&self);
            let reply = tx.clone();
            let peer_id = identifier.clone();
            let task = tokio::spawn(async move {
                this.handle_peer_loop(reader, peer_id, reply, PeerDirection::Incoming).await;
            });
            self.peers.set_incoming(identifier.clone(), tx, task).await;
            tracing::info!(id = %self.id, peer = %identifier, %addr, "incoming peer connection");
        } else {
            tracing::warn!(%addr, id = %identifier, "HELLO id matches neither server* nor client*, rejecting");
        }
    }

    async fn handle_client_loop<R>(
        self: Arc<Self>,
        mut reader: BufReader<R>,
        client_id: NodeId,
        reply: mpsc::Sender<Message>,
    ) where
        R: AsyncRead + Unpin,
    {
        loop {
            if self.terminating.load(Ordering::Relaxed) {
                break;
            }
            match wire::read_message(&mut reader).await {
                Ok(Some(Ok(msg))) => self.dispatch(&client_id, msg, &reply).await,
                Ok(Some(Err(e))) => {
                    tracing::warn!(from = %client_id, error = %e, "dropping malformed message");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(from = %client_id, error = %e, "connection error");
                    break;
                }
            }
        }
        self.clients.remove(&client_id).await;
        tracing::info!(id = %self.id, client = %client_id, "disconnected");
    }

    async fn handle_peer_loop<R>(
        self: Arc<Self>,
        mut reader: BufReader<R>,
        peer_id: NodeId,
        reply: mpsc::Sender<Message>,
        direction: PeerDirection,
    ) where
        R: AsyncRead + Unpin,
    {
        loop {
            if self.terminating.load(Ordering::Relaxed) {
                break;
            }
            match wire::read_message(&mut reader).await {
                Ok(Some(Ok(msg))) => self.dispatch(&peer_id, msg, &reply).await,
                Ok(Some(Err(e))) => {
                    tracing::warn!(from = %peer_id, error = %e, "dropping malformed message");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(from = %peer_id, error = %e, "connection error");
                    break;
                }
            }
        }
        match direction {
            PeerDirection::Incoming => self.peers.remove_incoming(&peer_id).await,
            PeerDirection::Outgoing => self.peers.remove_outgoing(&peer_id).await,
        }
        tracing::info!(id = %self.id, peer = %peer_id, "disconnected");
    }

    /// Shared dispatch for both peer and client connections: the reference
    /// implementation's `_handle_peer` and `_handle_client` both route
    /// `FORWARD_TIMESTAMP` and `START_MEASUREMENTS` identically, differing
    /// only in the extra `RTT_MEASUREMENT_*` cases a peer connection sees.
    ///
    /// `reply` is the writer for the exact connection this message arrived
    /// on — an RTT response must go back "on the same stream" (§4.4 step
    /// 2), not via a table lookup that could resolve to the peer's *other*
    /// half if both an inbound and an outbound connection to it exist.
    async fn dispatch(self: &Arc<Self>, from: &str, msg: Message, reply: &mpsc::Sender<Message>) {
        match msg {
            Message::RttRequest { sender: _, t_send: _, iteration } => {
                let response_time = now_secs();
                let _ = reply
                    .send(Message::RttResponse {
                        responder: self.id.clone(),
                        t_resp: response_time,
                        iteration,
                    })
                    .await;
            }
            Message::RttResponse { responder, t_resp: _, iteration } => {
                // §4.4 step 3 / §3: AV uses only one host's clock — the
                // payload is the responder's own clock reading and must be
                // ignored, not mixed with our local receive time.
                let receive_time = now_secs();
                self.measurement.handle_rtt_response(responder, iteration, receive_time).await;
            }
            Message::ForwardTimestamp { origin, t, iteration } => {
                let receive_time = now_secs();
                let dic_dcj = receive_time - t;
                self.measurement
                    .record_pair_sum(origin.clone(), self.id.clone(), iteration, dic_dcj)
                    .await;
                tracing::info!(id = %self.id, origin = %origin, iteration, dic_dcj, "recorded forwarded timestamp");

                // We can only ever observe the direction where we're the
                // receiver; share it so every peer can symmetrize locally
                // (see the OWD_MEASUREMENT_SHARE note in `wire`).
                self.peers
                    .broadcast_outgoing(Message::OwdShare {
                        origin,
                        receiver: self.id.clone(),
                        dic_dcj,
                        iteration,
                    })
                    .await;
            }
            Message::OwdShare { origin, receiver, dic_dcj, iteration } => {
                self.measurement.record_pair_sum(origin, receiver, iteration, dic_dcj).await;
            }
            Message::StartMeasurements { session_id, iterations } => {
                self.measurement.set_session(session_id.clone()).await;
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.run_measurements(iterations).await;
                });
                tracing::info!(id = %self.id, session_id = %session_id, iterations, "starting measurements (triggered by peer/client)");
            }
            Message::Timestamp { .. } => {
                tracing::info!(id = %self.id, from = %from, "unexpected direct TIMESTAMP from peer, ignoring");
            }
            Message::Hello(_) => {}
        }
    }

    /// Dial every configured peer not already connected.
    pub async fn connect_to_peers(self: &Arc<Self>, peers: &[PeerAddr]) {
        for peer in peers {
            self.connect(peer).await;
        }
    }

    pub async fn connect(self: &Arc<Self>, peer: &PeerAddr) {
        if self.peers.has_outgoing(&peer.id).await {
            tracing::info!(id = %self.id, peer = %peer.id, "already connected, skipping");
            return;
        }

        let addr = format!("{}:{}", peer.host, peer.port);
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(id = %self.id, peer = %peer.id, %addr, error = %e, "failed to connect");
                return;
            }
        };

        let (read_half, write_half) = stream.into_split();
        let mut writer = write_half;
        if let Err(e) = wire::write_message(&mut writer, &Message::Hello(self.id.clone())).await {
            tracing::error!(id = %self.id, peer = %peer.id, error = %e, "failed to send HELLO");
            return;
        }

        let tx = spawn_writer(peer.id.clone(), writer);
        let this = Arc::clone(self);
        let reader = BufReader::new(read_half);
        let peer_id = peer.id.clone();
        let reply = tx.clone();
        let task = tokio::spawn(async move {
            this.handle_peer_loop(reader, peer_id, reply, PeerDirection::Outgoing).await;
        });
        self.peers.set_outgoing(peer.id.clone(), tx, task).await;
        tracing::info!(id = %self.id, peer = %peer.id, %addr, "outgoing connection established");
    }

    /// List currently connected peers and clients (mirrors
    /// `list_connections`, which only logs — there is no return value in
    /// the reference either).
    pub async fn list_connections(&self) -> (Vec<NodeId>, Vec<NodeId>) {
        (self.peers.ids().await, self.clients.ids().await)
    }

    /// REPL entry point for `measure_delays`: mint a new session, broadcast
    /// `START_MEASUREMENTS` to every peer and client, and run the local
    /// loop for this session too.
    pub async fn measure_delays(self: &Arc<Self>, iterations: u32) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.measurement.set_session(session_id.clone()).await;

        self.peers
            .broadcast_outgoing(Message::StartMeasurements {
                session_id: session_id.clone(),
                iterations,
            })
            .await;
        self.clients
            .broadcast(Message::StartMeasurements {
                session_id: session_id.clone(),
                iterations,
            })
            .await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_measurements(iterations).await;
        });

        session_id
    }

    async fn run_measurements(self: Arc<Self>, iterations: u32) {
        for iteration in 1..=iterations {
            if self.terminating.load(Ordering::Relaxed) {
                return;
            }
            tracing::info!(id = %self.id, iteration, iterations, "starting iteration");
            self.mp_protocol(iteration).await;
            self.av_protocol(iteration).await;
            tracing::info!(id = %self.id, iteration, iterations, "iteration complete");
            self.measurement.clear_iteration().await;
        }
    }

    async fn mp_protocol(self: &Arc<Self>, iteration: u32) {
        let t = now_secs();
        self.clients
            .broadcast(Message::Timestamp {
                sender: self.id.clone(),
                t,
                iteration,
            })
            .await;

        tokio::time::sleep(SETTLE_DELAY).await;

        let mut participants = self.peers.ids().await;
        participants.push(self.id.clone());
        self.measurement.compute_min_sums(&participants, iteration).await;

        let session_id = self.measurement.session_id().await.unwrap_or_default();
        let data = self.measurement.mp_log_data().await;
        self.log_mp.append(&session_id, iteration, data).await;
    }

    async fn av_protocol(self: &Arc<Self>, iteration: u32) {
        // Per §4.4/§4.2, RTT requests only ever go out over a peer's
        // outbound half — a peer that has only dialed us in is not a
        // request target until we dial it back.
        for peer_id in self.peers.outgoing_ids().await {
            let send_time = now_secs();
            self.measurement
                .record_av_send_time(peer_id.clone(), iteration, send_time)
                .await;
            self.peers
                .send_outgoing(
                    &peer_id,
                    Message::RttRequest {
                        sender: self.id.clone(),
                        t_send: send_time,
                        iteration,
                    },
                )
                .await;
        }

        tokio::time::sleep(SETTLE_DELAY).await;

        let session_id = self.measurement.session_id().await.unwrap_or_default();
        let data = self.measurement.av_log_data().await;
        self.log_av.append(&session_id, iteration, data).await;
    }

    /// Set the terminating flag, stop accepting new connections, and close
    /// every half of every link (§4.2). `LinkTable`/`PeerLinkTable::clear`
    /// abort each half's read-loop task in addition to dropping its writer
    /// channel, so a handler blocked in `wire::read_message` is cancelled
    /// immediately rather than waiting on a remote disconnect that may
    /// never come — matching `Server.shutdown`'s `conn.close()` on every
    /// socket in the reference.
    pub async fn shutdown(&self) {
        tracing::info!(id = %self.id, "shutting down");
        self.terminating.store(true, Ordering::Relaxed);
        if let Some(handle) = self.accept_task.lock().unwrap().take() {
            handle.abort();
        }
        self.peers.clear().await;
        self.clients.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    async fn start_on(id: &str, port: u16) -> Arc<Verifier> {
        let dir = std::env::temp_dir().join(format!("cpv_node_test_{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let config = NodeConfig {
            id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port,
            peers: vec![],
            mp_log: dir.join("delays_mp.json"),
            av_log: dir.join("delays_av.json"),
        };
        Verifier::start(&config).await.unwrap()
    }

    #[tokio::test]
    async fn incoming_client_hello_registers_under_clients_not_peers() {
        let verifier = start_on("server1", 19101).await;

        let mut stream = TcpStream::connect("127.0.0.1:19101").await.unwrap();
        wire::write_message(&mut stream, &Message::Hello("client1".into()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (peers, clients) = verifier.list_connections().await;
        assert!(peers.is_empty());
        assert_eq!(clients, vec!["client1".to_string()]);
    }

    #[tokio::test]
    async fn incoming_peer_hello_registers_under_peers() {
        let verifier = start_on("server1", 19102).await;

        let mut stream = TcpStream::connect("127.0.0.1:19102").await.unwrap();
        wire::write_message(&mut stream, &Message::Hello("server2".into()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (peers, clients) = verifier.list_connections().await;
        assert_eq!(peers, vec!["server2".to_string()]);
        assert!(clients.is_empty());
    }

    #[tokio::test]
    async fn rtt_request_gets_a_response_on_the_same_connection() {
        let verifier = start_on("server1", 19103).await;

        let mut stream = TcpStream::connect("127.0.0.1:19103").await.unwrap();
        wire::write_message(&mut stream, &Message::Hello("server2".into()))
            .await
            .unwrap();
        wire::write_message(
            &mut stream,
            &Message::RttRequest {
                sender: "server2".into(),
                t_send: now_secs(),
                iteration: 1,
            },
        )
        .await
        .unwrap();

        let mut reader = BufReader::new(&mut stream);
        let response = tokio::time::timeout(Duration::from_secs(2), wire::read_message(&mut reader))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match response {
            Message::RttResponse { responder, iteration, .. } => {
                assert_eq!(responder, "server1");
                assert_eq!(iteration, 1);
            }
            other => panic!("expected RttResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn av_delay_ignores_the_rtt_response_payload_clock() {
        // Scenario 6: "response payload t_resp arbitrary" must not affect
        // the computed AvDelay — only the local send/receive clock does.
        let verifier = start_on("server1", 19110).await;

        let mut stream = TcpStream::connect("127.0.0.1:19110").await.unwrap();
        wire::write_message(&mut stream, &Message::Hello("server2".into()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let send_time = now_secs();
        verifier
            .measurement
            .record_av_send_time("server2".into(), 1, send_time)
            .await;

        // An outlandish t_resp: if it leaked into the computation the
        // resulting "delay" would be on the order of decades, not seconds.
        wire::write_message(
            &mut stream,
            &Message::RttResponse {
                responder: "server2".into(),
                t_resp: 1.0,
                iteration: 1,
            },
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let delays = verifier.measurement.av_delays().await;
        let delay = *delays.get("server2").expect("delay recorded");
        assert!(delay >= 0.0 && delay < 1.0, "delay {delay} was computed from the remote clock, not the local one");
    }

    #[tokio::test]
    async fn full_handshake_between_two_verifiers_leaves_one_entry_with_both_halves() {
        let s1 = start_on("server1", 19104).await;
        let s2 = start_on("server2", 19105).await;

        s1.connect(&"server2@127.0.0.1:19105".parse().unwrap()).await;
        s2.connect(&"server1@127.0.0.1:19104".parse().unwrap()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(s1.peers.len().await, 1);
        assert!(s1.peers.has_outgoing("server2").await);
        assert_eq!(s2.peers.len().await, 1);
        assert!(s2.peers.has_outgoing("server1").await);

        // Reissuing connect is a no-op: still exactly one entry.
        s1.connect(&"server2@127.0.0.1:19105".parse().unwrap()).await;
        assert_eq!(s1.peers.len().await, 1);
    }

    #[tokio::test]
    async fn double_hello_on_a_fresh_connection_updates_the_same_entry() {
        let verifier = start_on("server1", 19106).await;

        let mut first = TcpStream::connect("127.0.0.1:19106").await.unwrap();
        wire::write_message(&mut first, &Message::Hello("server2".into()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(verifier.peers.len().await, 1);

        // A second physical connection HELLO-ing with the same id updates
        // the incoming slot in place rather than creating a second entry.
        let mut second = TcpStream::connect("127.0.0.1:19106").await.unwrap();
        wire::write_message(&mut second, &Message::Hello("server2".into()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(verifier.peers.len().await, 1);

        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn hello_with_unrecognized_prefix_is_rejected() {
        let verifier = start_on("server1", 19108).await;

        let mut stream = TcpStream::connect("127.0.0.1:19108").await.unwrap();
        wire::write_message(&mut stream, &Message::Hello("mystery1".into()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (peers, clients) = verifier.list_connections().await;
        assert!(peers.is_empty());
        assert!(clients.is_empty());
    }

    #[tokio::test]
    async fn av_protocol_only_sends_over_an_outbound_half() {
        let s1 = start_on("server1", 19107).await;

        // server2 dials in to server1 but server1 never dials back: only
        // an inbound half exists at server1, so server1 has no outbound
        // target and av_protocol must send nothing.
        let mut stream = TcpStream::connect("127.0.0.1:19107").await.unwrap();
        wire::write_message(&mut stream, &Message::Hello("server2".into()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(s1.peers.len().await, 1);
        assert!(!s1.peers.has_outgoing("server2").await);
        assert!(s1.peers.outgoing_ids().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_the_accept_loop_and_clears_link_tables() {
        let verifier = start_on("server1", 19109).await;

        let mut stream = TcpStream::connect("127.0.0.1:19109").await.unwrap();
        wire::write_message(&mut stream, &Message::Hello("server2".into()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(verifier.peers.len().await, 1);

        verifier.shutdown().await;
        let (peers, clients) = verifier.list_connections().await;
        assert!(peers.is_empty());
        assert!(clients.is_empty());

        // The listener task was aborted; a fresh dial should fail outright
        // rather than hang waiting for a HELLO response.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let dial = tokio::time::timeout(
            Duration::from_millis(200),
            TcpStream::connect("127.0.0.1:19109"),
        )
        .await;
        match dial {
            Ok(Ok(_)) => panic!("connection should not succeed after shutdown"),
            _ => {}
        }
    }
}
