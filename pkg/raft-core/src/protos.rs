use bytes::Bytes;

use super::config::Configuration;

/// Type used to uniquely identify each server. Ids are assigned externally,
/// start at 1 and never repeat; 0 is reserved as an invalid id
pub type ServerId = u64;

pub type Term = u64;

pub type LogIndex = u64;

/// A (term, index) pair uniquely naming a single slot in the replicated log
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
	pub index: LogIndex,
	pub term: Term
}

/// Persistent information describing the state of the current server
/// NOTE: The commit_index does not strictly need to be persisted as it can
/// always be re-derived from a quorum, but keeping it cheaply bounds how much
/// of the log needs to be re-examined after a restart
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Metadata {
	/// Latest term seen by this server (starts at 0)
	pub current_term: Term,

	/// The id of the server that we have voted for in the current term
	pub voted_for: Option<ServerId>,

	/// Index of the last log entry known to be replicated on a quorum of
	/// voting servers in the current term
	pub commit_index: LogIndex
}

impl Default for Metadata {
	fn default() -> Self {
		Metadata {
			current_term: 0,
			voted_for: None,
			commit_index: 0
		}
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum LogEntryData {
	/// Does nothing but occupy a single log index. A new leader uses one of
	/// these to force entries from previous terms to commit under its own term
	Noop,

	/// A full snapshot of the cluster configuration as of this entry's index.
	/// Carrying the whole configuration (rather than a delta) makes rolling
	/// back a truncated change trivial
	Config(Configuration),

	/// Opaque data to be interpreted by the state machine once commited
	Command(Bytes)
}

impl LogEntryData {
	pub fn is_noop(&self) -> bool {
		match self {
			LogEntryData::Noop => true,
			_ => false
		}
	}
}

/// A single slot of the append-only replicated log. Each entry increments the
/// log index by exactly one and is immutable once written; only uncommited
/// suffixes may ever be discarded
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
	pub index: LogIndex,
	pub term: Term,
	pub data: LogEntryData
}

impl LogEntry {
	pub fn pos(&self) -> LogPosition {
		LogPosition { index: self.index, term: self.term }
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestVoteRequest {
	pub term: Term,
	pub candidate_id: ServerId,
	pub last_log_index: LogIndex,
	pub last_log_term: Term
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestVoteResponse {
	pub term: Term,
	pub vote_granted: bool
}

/// NOTE: The entries are always consecutive and immediately follow the
/// (prev_log_index, prev_log_term) position
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppendEntriesRequest {
	pub term: Term,
	pub leader_id: ServerId,
	pub prev_log_index: LogIndex,
	pub prev_log_term: Term,
	pub entries: Vec<LogEntry>,
	pub leader_commit: LogIndex
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppendEntriesResponse {
	pub term: Term,
	pub success: bool,

	/// The very end of the responder's log. On failure this lets the leader
	/// skip whole conflicting terms when backing up next_index instead of
	/// decrementing one index at a time
	pub last_log_index: LogIndex
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InstallSnapshotRequest {
	pub term: Term,
	pub leader_id: ServerId,

	/// Position of the last log entry covered by this snapshot
	pub last_included_index: LogIndex,
	pub last_included_term: Term,

	/// Configuration as commited at last_included_index
	pub config: Configuration,

	/// Serialized state machine contents. The module itself treats this as
	/// opaque; the transport fills it in from the snapshot store
	pub data: Bytes
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InstallSnapshotResponse {
	pub term: Term
}

/// Upon receiving this, a caught-up voter immediately times out and starts an
/// election in order to take over leadership
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TimeoutNow {}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum MessageBody {
	RequestVote(RequestVoteRequest),
	RequestVoteResult(RequestVoteResponse),
	AppendEntries(AppendEntriesRequest),
	AppendEntriesResult(AppendEntriesResponse),
	InstallSnapshot(InstallSnapshotRequest),
	InstallSnapshotResult(InstallSnapshotResponse),
	TimeoutNow(TimeoutNow)
}

/// An outbound message produced by the consensus module. A single body may be
/// addressed to many servers at once when the payload would be identical
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
	pub to: Vec<ServerId>,
	pub body: MessageBody
}
