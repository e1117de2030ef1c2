//! Per-verifier measurement state for one session: the MP and AV
//! sub-protocols' bookkeeping between "send" and "compute".
//!
//! Grounded in `Server.dic_dcj_sums` / `Server.min_sums` /
//! `Server.verifier_measurements` / `Server.av_delays` in
//! `server_architecture.py`, all of which live behind one lock — this
//! keeps the same single-mutex shape rather than splitting into several
//! independently-lockable fields, since every method that touches one of
//! them tends to touch at least one other in the same step.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::types::NodeId;

struct Inner {
    session_id: Option<String>,
    /// `(sender, receiver, iteration) -> dic + dcj`, populated as forwarded
    /// timestamps arrive from the client relay.
    pair_sums: HashMap<(NodeId, NodeId, u32), f64>,
    /// `(i, j) -> min(dic+dcj, djc+dci)` for the current iteration, keyed
    /// both ways (§9(a)).
    min_sums: HashMap<(NodeId, NodeId), f64>,
    /// `(verifier, iteration) -> send_time` for outstanding RTT requests.
    av_send_times: HashMap<(NodeId, u32), f64>,
    /// `verifier -> half-RTT` for the current iteration.
    av_delays: HashMap<NodeId, f64>,
}

impl Inner {
    fn new() -> Self {
        Self {
            session_id: None,
            pair_sums: HashMap::new(),
            min_sums: HashMap::new(),
            av_send_times: HashMap::new(),
            av_delays: HashMap::new(),
        }
    }
}

/// Session-scoped measurement state. One instance lives for the lifetime
/// of a verifier; its maps are cleared at the end of every iteration.
pub struct MeasurementState(Mutex<Inner>);

impl MeasurementState {
    pub fn new() -> Self {
        Self(Mutex::new(Inner::new()))
    }

    pub async fn set_session(&self, session_id: String) {
        self.0.lock().await.session_id = Some(session_id);
    }

    pub async fn session_id(&self) -> Option<String> {
        self.0.lock().await.session_id.clone()
    }

    /// Record `dic + dcj` for the ordered pair `(sender, receiver)` at
    /// `iteration`. A duplicate record for the same key overwrites — the
    /// client relay is expected to forward a given timestamp to a peer at
    /// most once per iteration (see [`crate::client::ForwardTracker`]), so
    /// in practice this never happens twice.
    pub async fn record_pair_sum(&self, sender: NodeId, receiver: NodeId, iteration: u32, dic_dcj: f64) {
        self.0
            .lock()
            .await
            .pair_sums
            .insert((sender, receiver, iteration), dic_dcj);
    }

    /// Compute `min(dic+dcj, djc+dci)` for every ordered pair among
    /// `participant_ids` at `iteration`, keyed both `(i, j)` and `(j, i)`.
    /// A pair missing either direction's sum is skipped entirely — it
    /// simply contributes no estimate this iteration (§7).
    pub async fn compute_min_sums(&self, participant_ids: &[NodeId], iteration: u32) {
        let mut inner = self.0.lock().await;
        for i in participant_ids {
            for j in participant_ids {
                if i == j {
                    continue;
                }
                let key1 = (i.clone(), j.clone(), iteration);
                let key2 = (j.clone(), i.clone(), iteration);
                if let (Some(&dic_dcj), Some(&djc_dci)) =
                    (inner.pair_sums.get(&key1), inner.pair_sums.get(&key2))
                {
                    let min_sum = dic_dcj.min(djc_dci);
                    inner.min_sums.insert((i.clone(), j.clone()), min_sum);
                }
            }
        }
    }

    pub async fn min_sums(&self) -> HashMap<(NodeId, NodeId), f64> {
        self.0.lock().await.min_sums.clone()
    }

    /// `{"min_sums": {"server1_server2": 0.0123, ...}}`, the MP log body.
    pub async fn mp_log_data(&self) -> Value {
        let inner = self.0.lock().await;
        let min_sums: HashMap<String, f64> = inner
            .min_sums
            .iter()
            .map(|((i, j), v)| (format!("{i}_{j}"), *v))
            .collect();
        json!({ "min_sums": min_sums })
    }

    pub async fn record_av_send_time(&self, verifier_id: NodeId, iteration: u32, send_time: f64) {
        self.0
            .lock()
            .await
            .av_send_times
            .insert((verifier_id, iteration), send_time);
    }

    /// Handle an RTT response: look up the matching send time and record
    /// half the round trip as the delay estimate. `response_time` must be
    /// this host's own clock reading at receipt, not the responder's
    /// payload — §4.4 step 3 computes `rtt = t_recv_local − t_send_local`
    /// entirely from the local clock (§3: "AV uses only one host's
    /// clock"). Logs and does nothing if no matching request is
    /// outstanding — never an error (§7).
    pub async fn handle_rtt_response(&self, responder_id: NodeId, iteration: u32, response_time: f64) {
        let mut inner = self.0.lock().await;
        match inner.av_send_times.get(&(responder_id.clone(), iteration)) {
            Some(&send_time) => {
                let rtt = response_time - send_time;
                let delay = rtt / 2.0;
                inner.av_delays.insert(responder_id, delay);
            }
            None => {
                tracing::warn!(responder = %responder_id, iteration, "missing send_time for RTT response");
            }
        }
    }

    pub async fn av_delays(&self) -> HashMap<NodeId, f64> {
        self.0.lock().await.av_delays.clone()
    }

    /// `{"delays": {"server2": 0.0021, ...}}`, the AV log body.
    pub async fn av_log_data(&self) -> Value {
        let inner = self.0.lock().await;
        let delays: HashMap<String, f64> = inner
            .av_delays
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        json!({ "delays": delays })
    }

    /// Reset every per-iteration map. `session_id` survives across
    /// iterations of the same session.
    pub async fn clear_iteration(&self) {
        let mut inner = self.0.lock().await;
        inner.pair_sums.clear();
        inner.min_sums.clear();
        inner.av_send_times.clear();
        inner.av_delays.clear();
    }
}

impl Default for MeasurementState {
    fn default() -> Self {
        Self::new()
    }
}
