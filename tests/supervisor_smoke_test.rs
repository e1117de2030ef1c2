//! Confirms the four supervisor operations (`start`, `connect_to_peers`,
//! `measure_delays` via `broadcast_start`, `shutdown`) are reachable and
//! sufficient on their own — this file never imports `cpv::repl`, so it
//! doubles as proof that the REPL is optional scaffolding over the public
//! API, not a dependency of it.

use std::time::Duration;

use cpv::config::NodeConfig;
use cpv::node::Verifier;

async fn start_verifier(id: &str, port: u16) -> std::sync::Arc<Verifier> {
    let dir = std::env::temp_dir().join(format!("cpv_smoke_{}", uuid::Uuid::new_v4()));
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
async fn supervisor_operations_work_without_any_repl_involved() {
    let s1 = start_verifier("server1", 19301).await;
    let s2 = start_verifier("server2", 19302).await;

    s1.connect_to_peers(&["server2@127.0.0.1:19302".parse().unwrap()])
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (peers, _clients) = s1.list_connections().await;
    assert_eq!(peers, vec!["server2".to_string()]);

    let session_id = s1.measure_delays(1).await;
    assert!(!session_id.is_empty());
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let mp_log = tokio::fs::read_to_string(s1.mp_log_path()).await.unwrap();
    assert_eq!(mp_log.lines().count(), 1);

    s1.shutdown().await;
    s2.shutdown().await;
    let (peers_after, clients_after) = s1.list_connections().await;
    assert!(peers_after.is_empty());
    assert!(clients_after.is_empty());
}
