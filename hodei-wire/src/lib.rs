//! Wire schema of the single bidirectional stream between a worker and the
//! orchestrator. Field numbers are fixed here and nowhere else; both sides of
//! the stream compile against this crate.

pub mod codec;
pub mod message;

pub use codec::{MessageCodec, OrchestratorCodec, WireError, WorkerCodec, DEFAULT_MAX_FRAME_BYTES};

#[cfg(test)]
test_r::enable!();
