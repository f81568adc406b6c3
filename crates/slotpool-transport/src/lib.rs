//! Wire types for the layer that admits jobs and reports their results.
//!
//! Provides:
//! - Wire protocol (JSON + base64 image blobs)
//! - Conversions between wire shapes and `slotpool-core` types

pub mod protocol;

pub use protocol::{
    ClientMessage, JobResultMessage, ProtocolError, ServerMessage, SubmitRequest, WireArtifact,
};
