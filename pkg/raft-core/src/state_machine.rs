use bytes::Bytes;

use super::protos::{LogIndex, LogPosition};

/// The replicated application itself. The consensus module hands over
/// commited command payloads in strictly increasing index order and never
/// concurrently; everything else about their meaning is up to the
/// implementation.
///
/// Determinism is required: replaying the same command stream into a fresh
/// instance must reproduce the same state.
pub trait StateMachine: Send + Sync {
	fn apply(&self, index: LogIndex, command: &[u8]);

	/// Produces a serialized image of the current state for snapshotting
	fn snapshot(&self) -> Option<Bytes> {
		None
	}

	/// Replaces all state with a previously produced image
	fn restore(&self, last_included: LogPosition, data: Bytes) {
		let _ = (last_included, data);
	}
}
