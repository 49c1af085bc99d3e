//! Event-driven, multi-protocol server networking core.
//!
//! Layout mirrors the transport stack described in the design docs: a
//! single-threaded reactor ([`reactor`]) drives per-connection brokers
//! ([`broker`]) grouped into listening schemes ([`scheme`]) and indexed by
//! [`node::Node`]; [`server::ServerCore`] owns the accept loop across
//! TCP/TLS/UDP/DTLS/SCTP; [`http2`] layers HTTP/2 session state on top of
//! an accepted broker; [`cluster`] forks and supervises worker processes
//! sharing a scheme's listening socket.

pub mod broker;
pub mod buffer;
pub mod callback;
pub mod cluster;
pub mod config;
pub mod error;
pub mod http2;
pub mod metrics;
pub mod node;
pub mod reactor;
pub mod scheme;
pub mod server;
pub mod socket;

pub use broker::{Broker, BrokerState};
pub use cluster::{ClusterEvent, ClusterSupervisor, WorkerContext};
pub use error::{Error, ErrorKind, Result};
pub use node::Node;
pub use scheme::Scheme;
pub use server::ServerCore;

/// Initializes the crate's tracing subscriber from `RUST_LOG` (or `info`
/// by default). Safe to call more than once; subsequent calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
