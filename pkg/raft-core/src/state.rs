use std::collections::{HashMap, HashSet, VecDeque};

use super::protos::*;

/// Maximum number of AppendEntries requests we keep on the wire to a single
/// peer once it has proven responsive
pub const MAX_PIPELINE_REQUESTS: usize = 8;

/// Send policy towards a single peer. Modeled as a tagged variant because the
/// three modes carry different state and have different windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
	/// One request at a time until we find the point where the peer's log
	/// matches ours. Every newly elected leader starts each peer here
	Probe,

	/// The peer is accepting entries; allow a window of outstanding requests
	Pipeline,

	/// The entries the peer needs were compacted away; it must be sent the
	/// snapshot at the given position before normal replication can resume
	Snapshot { last_included: LogPosition }
}

/// The leader's belief about the log state of one other server
#[derive(Debug)]
pub struct ServerProgress {
	/// Index of the next entry to send
	pub next_index: LogIndex,

	/// Highest index known to be replicated on the peer
	pub match_index: LogIndex,

	pub mode: ProgressMode,

	/// Last index covered by each request currently on the wire, in send
	/// order. Replies consume from the front; a reply with nothing queued is
	/// stale and gets dropped
	pub in_flight: VecDeque<LogIndex>,

	/// Module time at which we last sent this peer anything
	pub last_sent: Option<u64>
}

impl ServerProgress {
	pub fn new(last_log_index: LogIndex) -> Self {
		ServerProgress {
			next_index: last_log_index + 1,
			match_index: 0,
			mode: ProgressMode::Probe,
			in_flight: VecDeque::new(),
			last_sent: None
		}
	}

	fn window(&self) -> usize {
		match self.mode {
			ProgressMode::Pipeline => MAX_PIPELINE_REQUESTS,
			_ => 1
		}
	}

	pub fn can_send(&self) -> bool {
		self.in_flight.len() < self.window()
	}

	/// Falls back to probing after a rejection or a transport failure,
	/// forgetting whatever was on the wire. Optimistic next_index advances
	/// are rolled back to the last confirmed match
	pub fn reset_probe(&mut self) {
		self.mode = ProgressMode::Probe;
		self.in_flight.clear();
		self.last_sent = None;
		self.next_index = self.match_index + 1;
	}
}

/// Catch-up state for a non-voter on its way to becoming a voter. The leader
/// times a series of replication rounds; the change is only proposed once a
/// round completes quickly enough
#[derive(Debug)]
pub struct PromotionProgress {
	pub server_id: ServerId,

	/// 1-based counter of the current round
	pub round: u32,

	pub round_start: u64,

	/// The leader's last log index as observed when this round started; the
	/// round completes when the peer's match index reaches it
	pub round_target: LogIndex,

	/// Module time at which the whole promotion attempt began
	pub started: u64
}

pub struct ServerFollowerState {
	/// Randomized timeout after which we start an election if the leader
	/// stays silent
	pub election_timeout: u64,

	/// Id of the last leader we accepted entries from, used to redirect
	/// clients that contact the wrong server
	pub last_leader_id: Option<ServerId>,

	/// Module time of the last accepted leader contact (or vote grant)
	pub last_heartbeat: u64
}

pub struct ServerCandidateState {
	pub election_start: u64,
	pub election_timeout: u64,

	/// Ids of the voters that granted us their vote this term (not counting
	/// ourselves)
	pub votes_received: HashSet<ServerId>
}

pub struct ServerLeaderState {
	pub servers: HashMap<ServerId, ServerProgress>,

	/// At most one non-voter promotion is tracked at a time
	pub promotion: Option<PromotionProgress>
}

pub enum ServerState {
	/// Not participating: either not yet started or permanently poisoned
	/// after detecting corruption
	Unavailable,
	Follower(ServerFollowerState),
	Candidate(ServerCandidateState),
	Leader(ServerLeaderState)
}

/// The role alone, without any of the per-role bookkeeping. This is what
/// observers get to see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Unavailable,
	Follower,
	Candidate,
	Leader
}

impl ServerState {
	pub fn role(&self) -> Role {
		match self {
			ServerState::Unavailable => Role::Unavailable,
			ServerState::Follower(_) => Role::Follower,
			ServerState::Candidate(_) => Role::Candidate,
			ServerState::Leader(_) => Role::Leader
		}
	}
}
