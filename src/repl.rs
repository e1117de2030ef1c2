//! Interactive command loop shared by both binaries.
//!
//! A thin wrapper over the public `Verifier`/`ClientRelay` API — no
//! protocol logic lives here, mirroring `command_loop` in the reference,
//! which is likewise nothing but a dispatch table over the object's public
//! methods.

use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::client::ClientRelay;
use crate::config::PeerAddr;
use crate::node::Verifier;

const DEFAULT_ITERATIONS: u32 = 10;

pub async fn run_verifier_repl(verifier: Arc<Verifier>, peers: Vec<PeerAddr>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print_prompt("list/connect/measure_delays/close");
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };

        match line.trim().to_lowercase().as_str() {
            "list" => {
                let (peer_ids, client_ids) = verifier.list_connections().await;
                println!("Connections:");
                for id in peer_ids {
                    println!("  - Peer: {id}");
                }
                for id in client_ids {
                    println!("  - Client: {id}");
                }
            }
            "connect" => {
                verifier.connect_to_peers(&peers).await;
            }
            "measure_delays" => {
                let session_id = verifier.measure_delays(DEFAULT_ITERATIONS).await;
                println!("Started session {session_id}");
            }
            "close" => {
                verifier.shutdown().await;
                break;
            }
            "" => {}
            _ => println!("Available commands: list, connect, measure_delays, close"),
        }
    }
}

pub async fn run_client_repl(client: Arc<ClientRelay>, verifiers: Vec<PeerAddr>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print_prompt("list/connect/close");
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };

        match line.trim().to_lowercase().as_str() {
            "list" => {
                println!("Connected servers:");
                for id in client.connected_verifiers().await {
                    println!("  - {id}");
                }
            }
            "connect" => {
                client.connect_to_verifiers(&verifiers).await;
            }
            "close" => {
                client.shutdown().await;
                break;
            }
            "" => {}
            _ => println!("Available commands: list, connect, close"),
        }
    }
}

fn print_prompt(options: &str) {
    print!("Enter command ({options}): ");
    let _ = std::io::stdout().flush();
}
