//! Node configuration: identity, listen address, and static peer list.

use std::fmt;
use std::path::PathBuf;

use clap::Args;

use crate::types::NodeId;

pub const DEFAULT_MP_DELAY_LOG: &str = "delays_mp.json";
pub const DEFAULT_AV_DELAY_LOG: &str = "delays_av.json";

/// A peer to dial at startup: `id@host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

impl std::str::FromStr for PeerAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, host_port) = s
            .split_once('@')
            .ok_or_else(|| format!("expected id@host:port, got {s:?}"))?;
        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| format!("expected id@host:port, got {s:?}"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port in {s:?}"))?;
        Ok(PeerAddr {
            id: id.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

/// Everything a node needs to start: who it is, where it listens, and who
/// it should dial at startup. The two binaries each build one of these from
/// `clap` arguments and hand it to the library entry point.
#[derive(Debug, Clone, Args)]
pub struct NodeConfig {
    /// This node's id, e.g. `server1` or `client1`.
    #[arg(long)]
    pub id: String,

    /// Local interface to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Local port to listen on.
    #[arg(long)]
    pub port: u16,

    /// Peers to dial at startup, `host:port`, may be repeated.
    #[arg(long = "peer", value_delimiter = ',')]
    pub peers: Vec<PeerAddr>,

    /// Where to (re)write the MP protocol's delay log. Verifiers sharing a
    /// working directory must set this to distinct paths.
    #[arg(long, default_value = DEFAULT_MP_DELAY_LOG)]
    pub mp_log: PathBuf,

    /// Where to (re)write the AV protocol's delay log.
    #[arg(long, default_value = DEFAULT_AV_DELAY_LOG)]
    pub av_log: PathBuf,
}

impl NodeConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_id_host_port() {
        let p = PeerAddr::from_str("server2@127.0.0.1:9001").unwrap();
        assert_eq!(p.id, "server2");
        assert_eq!(p.host, "127.0.0.1");
        assert_eq!(p.port, 9001);
    }

    #[test]
    fn rejects_missing_port() {
        assert!(PeerAddr::from_str("server2@127.0.0.1").is_err());
    }

    #[test]
    fn rejects_missing_id() {
        assert!(PeerAddr::from_str("127.0.0.1:9001").is_err());
    }
}
