use std::io;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};

use hickory_proto::error::ProtoError;
use thiserror::Error;

/// Fatal startup failures. Anything here aborts the process with a
/// non-zero exit code; nothing here is produced after the listener is up.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required option {0}")]
    MissingOption(&'static str),

    #[error("address {addr:?} is not a valid IPv4 endpoint: {reason}")]
    InvalidAddr { addr: String, reason: String },

    #[error("upstream resolver must be IPv4, got {0}")]
    UpstreamNotIpv4(IpAddr),

    #[error("could not bind local UDP socket {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },
}

/// Per-datagram failures. The receive loop logs these and keeps serving;
/// none of them terminate the process.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("malformed DNS message involving {peer}: {source}")]
    Codec {
        peer: SocketAddr,
        #[source]
        source: ProtoError,
    },

    #[error("could not send datagram to {dest}: {source}")]
    Send {
        dest: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("cannot handle non-IPv4 originator {0}")]
    CannotHandle(SocketAddr),

    #[error("dangling response for transaction id {0}")]
    CorrelationMiss(u16),
}

/// Failures of the query record store. Treated as non-fatal by the engine:
/// logged, never allowed to impair the network reply.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("query record {0} not found")]
    NotFound(String),

    /// Reserved for repository implementations with a real storage layer;
    /// the in-memory store never produces it.
    #[allow(dead_code)]
    #[error("storage failure: {0}")]
    Storage(String),
}
