use std::io;

use pkt::{Endpoint, ParseError, TransProto};

use crate::crypt::CryptError;

/// Everything that can go wrong while handling one packet. Each variant is
/// recoverable: the packet is dropped and the pipeline moves on.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("parse: {0}")]
    Parse(#[from] ParseError),
    #[error("unsupported layer: {0}")]
    UnsupportedLayer(&'static str),
    #[error("unauthorized data segment from {0}")]
    Unauthorized(Endpoint),
    #[error("crypt: {0}")]
    Crypt(#[from] CryptError),
    #[error("missing nat entry for {0}")]
    MissingNat(Endpoint),
    #[error("{0} pool empty")]
    PoolEmpty(TransProto),
    #[error("upstream device has no address for the packet family")]
    NoUpstreamAddr,
    #[error("address family mismatch")]
    FamilyMismatch,
    #[error("io: {0}")]
    Io(#[from] io::Error),
}
