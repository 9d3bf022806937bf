//! Everything needed to run a keelson node as a single process: the
//! [`Agent`] wires the multiplexed listener, the replicated log, the gRPC
//! server, and gossip membership together, and tears them down in order.

mod agent;
mod mux;
pub mod tls;

pub use agent::{Agent, Config};
