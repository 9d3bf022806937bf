//! Wire types for the keelson log service.
//!
//! The protobuf sources live in `proto/` and are compiled at build time;
//! everything a client or server needs is re-exported from the crate root.

mod error;

pub mod v1 {
    tonic::include_proto!("log.v1");
}

pub use error::OffsetOutOfRange;
pub use v1::{
    log_client::LogClient, log_server, ConsumeRequest, ConsumeResponse, ProduceRequest,
    ProduceResponse, Record,
};
