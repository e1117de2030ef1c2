pub mod client;
pub mod config;
pub mod error;
pub mod estimator;
pub mod log;
pub mod node;
pub mod orchestrator;
pub mod repl;
pub mod session;
pub mod types;
pub mod wire;

pub use client::ClientRelay;
pub use config::{NodeConfig, PeerAddr};
pub use error::{NodeError, WireError};
pub use estimator::{cpv, CpvResult};
pub use log::DelayLogSink;
pub use node::Verifier;
pub use orchestrator::MeasurementState;
pub use wire::Message;
