use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::{debug, error, info, warn};

use super::config::{ConfigError, Configuration};
use super::config_state::*;
use super::constraint::*;
use super::errors::*;
use super::io::{ErrorCode, Watcher};
use super::log::LogStorage;
use super::protos::*;
use super::state::*;

/// Base for the randomized election timeout: an actual timeout is drawn
/// uniformly from [base, 2*base) every time the timer is reset
const DEFAULT_ELECTION_TIMEOUT: u64 = 400;

/// If the leader has sent a peer nothing else within this many milliseconds,
/// it sends an empty AppendEntries to keep the peer's election timer at bay
const DEFAULT_HEARTBEAT_TIMEOUT: u64 = 150;

/// Largest number of entries packed into a single AppendEntries request
const DEFAULT_MAX_BATCH_ENTRIES: usize = 64;

/// How many catch-up rounds a non-voter gets before its promotion is given up
const DEFAULT_MAX_PROMOTION_ROUNDS: u32 = 10;

/// Upper bound on the total wall time of all catch-up rounds combined; a peer
/// that can't make it by then is treated as unresponsive
const DEFAULT_PROMOTION_TIME_LIMIT: u64 = 30_000;

/// A (term, index) handle given back to the proposer of an entry, usable to
/// later check what became of it
pub type Proposal = LogPosition;

/// On success, the entry has been accepted and may eventually be commited
/// under the returned proposal
pub type ProposeResult = std::result::Result<Proposal, ProposeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposeError {
	/// The module has shut down after detecting corruption
	Unavailable,

	/// The entry can not be processed until the given earlier proposal has
	/// resolved (only produced for configuration changes)
	RetryAfter(Proposal),

	/// Only the leader accepts proposals; the hint (if any) is our best guess
	/// at who the leader currently is
	NotLeader { leader_hint: Option<ServerId> }
}

impl ProposeError {
	pub fn code(&self) -> ErrorCode {
		match self {
			ProposeError::Unavailable => ErrorCode::Shutdown,
			ProposeError::RetryAfter(_) => ErrorCode::ConfigBusy,
			ProposeError::NotLeader { .. } => ErrorCode::NotLeader
		}
	}
}

/// Outcome of a membership change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeError {
	Unavailable,
	NotLeader { leader_hint: Option<ServerId> },

	/// Another configuration change (or a promotion) is still in flight
	Busy,

	DuplicateId(ServerId),
	UnknownId(ServerId),

	/// The edit would produce an unusable configuration
	Invalid,

	/// The request does not apply to the server's current role in the
	/// configuration (e.g. promoting a server that already votes)
	BadState
}

impl From<ConfigError> for ChangeError {
	fn from(err: ConfigError) -> Self {
		match err {
			ConfigError::DuplicateId(id) => ChangeError::DuplicateId(id),
			ConfigError::UnknownId(id) => ChangeError::UnknownId(id),
			_ => ChangeError::Invalid
		}
	}
}

impl ChangeError {
	pub fn code(&self) -> ErrorCode {
		match self {
			ChangeError::Unavailable => ErrorCode::Shutdown,
			ChangeError::NotLeader { .. } => ErrorCode::NotLeader,
			ChangeError::Busy => ErrorCode::ConfigBusy,
			ChangeError::DuplicateId(_) => ErrorCode::DuplicateId,
			ChangeError::UnknownId(_) => ErrorCode::UnknownId,
			ChangeError::Invalid | ChangeError::BadState => ErrorCode::BadState
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
	/// Safely replicated; it will be applied to the state machine soon
	Commited,

	/// Will never commit, typically because another leader took over and
	/// overwrote the entry before it was fully replicated
	Failed,

	/// Still awaiting replication
	Pending,

	/// Nothing known about this proposal here (normal when asking a server
	/// other than the one that accepted it)
	Missing,

	/// The position is from before the start of our log, so its fate can no
	/// longer be determined from local state
	Unavailable
}

impl ProposalStatus {
	/// Code reported to a client that was blocked waiting on the proposal
	pub fn code(&self) -> ErrorCode {
		match self {
			ProposalStatus::Commited | ProposalStatus::Pending => ErrorCode::Ok,
			ProposalStatus::Failed => ErrorCode::LeadershipLost,
			ProposalStatus::Missing => ErrorCode::NotLeader,
			ProposalStatus::Unavailable => ErrorCode::Internal
		}
	}
}

pub type ConsensusModuleHandle = Arc<Mutex<ConsensusModule>>;

/// All external side effects requested by the module during one operation.
/// The caller owns flushing these out (see `io::dispatch`) and feeding any
/// completions back in
pub struct Tick {
	/// Module time (ms) at which this tick was produced
	pub time: u64,

	/// The metadata changed and must be persisted
	pub meta: bool,

	/// A newly commited configuration snapshot may be persisted
	pub config: bool,

	/// New entries were appended to the log and need to be made durable
	pub new_entries: bool,

	pub messages: Vec<Message>,

	/// Commited entries to hand to the state machine, in index order. The
	/// caller acknowledges each through `applied`
	pub apply: Vec<Arc<LogEntry>>,

	/// A snapshot was accepted and the state machine must be restored from it
	pub snapshot: Option<InstallSnapshotRequest>,

	/// If no other event occurs, the time after which `tick` should be called
	/// again
	pub next_tick: Option<u64>
}

impl Tick {
	pub fn empty(time: u64) -> Self {
		Tick {
			time,
			meta: false,
			config: false,
			new_entries: false,
			messages: vec![],
			apply: vec![],
			snapshot: None,
			next_tick: None
		}
	}

	pub fn write_meta(&mut self) {
		self.meta = true;
	}

	pub fn write_config(&mut self) {
		self.config = true;
	}

	pub fn send(&mut self, msg: Message) {
		self.messages.push(msg);
	}
}

#[derive(Debug, Clone)]
pub struct ConsensusOptions {
	pub election_timeout: u64,
	pub heartbeat_timeout: u64,
	pub max_batch_entries: usize,
	pub max_promotion_rounds: u32,
	pub promotion_time_limit: u64,

	/// Seed for the election jitter. Defaults to a random value; tests pin it
	/// to get reproducible timelines
	pub seed: u64
}

impl Default for ConsensusOptions {
	fn default() -> Self {
		ConsensusOptions {
			election_timeout: DEFAULT_ELECTION_TIMEOUT,
			heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
			max_batch_entries: DEFAULT_MAX_BATCH_ENTRIES,
			max_promotion_rounds: DEFAULT_MAX_PROMOTION_ROUNDS,
			promotion_time_limit: DEFAULT_PROMOTION_TIME_LIMIT,
			seed: rand::thread_rng().next_u64()
		}
	}
}

pub struct ConsensusModule {
	/// Id of the server this module is running on
	id: ServerId,

	meta: Metadata,

	/// The currently active configuration of the cluster
	config: ConfigurationStateMachine,

	/// Shared reader/appender for the log. Appends only enqueue; durability
	/// arrives later through `log_flushed`
	log: Arc<dyn LogStorage + Send + Sync>,

	state: ServerState,

	opts: ConsensusOptions,

	rng: SmallRng,

	/// Monotonic module time in milliseconds, advanced exclusively by `tick`
	now: u64,

	/// Highest index acknowledged by the state machine
	last_applied: LogIndex,

	/// Highest index already handed out through `Tick::apply`
	last_dispatched: LogIndex,

	/// AppendEntries acknowledgements waiting for the local log flush to
	/// catch up to what they acknowledge
	pending_replies: Vec<(ServerId, MatchConstraint<AppendEntriesResponse>)>,

	watcher: Option<Arc<dyn Watcher>>
}

impl ConsensusModule {
	/// Creates a new module from recovered durable state. The given log and
	/// configuration snapshot must belong together: the snapshot may not be
	/// from before the start of the log
	pub fn new(
		id: ServerId,
		mut meta: Metadata,
		config_snapshot: ConfigurationSnapshot,
		log: Arc<dyn LogStorage + Send + Sync>,
		last_applied: LogIndex,
		opts: ConsensusOptions
	) -> Result<ConsensusModule> {
		// If the log contains a newer term than the metadata, we know no vote
		// was cast in any term after the metadata was written
		let last_log_term = log.last_term();
		if last_log_term > meta.current_term {
			meta.current_term = last_log_term;
			meta.voted_for = None;
		}

		// Snapshots only ever contain commited data
		if config_snapshot.last_applied > meta.commit_index {
			meta.commit_index = config_snapshot.last_applied;
		}

		if config_snapshot.last_applied + 1 < log.first_index() {
			// There is a gap between the snapshotted configuration and the
			// log; this storage can not be trusted
			return Err(ErrorKind::Shutdown.into());
		}

		let mut config = ConfigurationStateMachine::from(config_snapshot);

		// Roll the configuration forward over any log entries newer than the
		// snapshot
		for i in (config.last_applied + 1)..=log.last_index() {
			if let Ok(e) = log.entry(i) {
				config.apply(&e, meta.commit_index);
			}
		}

		let mut rng = SmallRng::seed_from_u64(opts.seed);
		let election_timeout = rng.gen_range(opts.election_timeout, 2 * opts.election_timeout);

		let state = ServerState::Follower(ServerFollowerState {
			election_timeout,
			last_leader_id: None,
			last_heartbeat: 0
		});

		Ok(ConsensusModule {
			id,
			meta,
			config,
			log,
			state,
			opts,
			rng,
			now: 0,
			last_applied,
			last_dispatched: last_applied,
			pending_replies: vec![],
			watcher: None
		})
	}

	pub fn id(&self) -> ServerId {
		self.id
	}

	pub fn meta(&self) -> &Metadata {
		&self.meta
	}

	pub fn current_term(&self) -> Term {
		self.meta.current_term
	}

	pub fn commit_index(&self) -> LogIndex {
		self.meta.commit_index
	}

	pub fn last_applied(&self) -> LogIndex {
		self.last_applied
	}

	pub fn role(&self) -> Role {
		self.state.role()
	}

	/// Our best guess at the current leader (when we are not it ourselves)
	pub fn current_leader(&self) -> Option<ServerId> {
		match self.state {
			ServerState::Leader(_) => Some(self.id),
			ServerState::Follower(ref s) => s.last_leader_id,
			_ => None
		}
	}

	pub fn log(&self) -> &Arc<dyn LogStorage + Send + Sync> {
		&self.log
	}

	/// The currently effective configuration (possibly not commited yet)
	pub fn config_snapshot(&self) -> ConfigurationSnapshotRef {
		self.config.snapshot()
	}

	/// The most recent configuration known to be commited; this is what may
	/// be persisted
	pub fn config_committed(&self) -> ConfigurationSnapshotRef {
		self.config.committed()
	}

	pub fn set_watcher(&mut self, watcher: Arc<dyn Watcher>) {
		self.watcher = Some(watcher);
	}

	/// Produces a fresh tick at the current module time, for feeding into the
	/// request-style operations
	pub fn new_tick(&self) -> Tick {
		Tick::empty(self.now)
	}

	/// Advances the module clock by the elapsed wall time and runs whatever
	/// per-role timer work became due
	pub fn tick(&mut self, elapsed_ms: u64) -> Tick {
		self.now += elapsed_ms;
		let mut out = Tick::empty(self.now);
		self.cycle(&mut out);
		out
	}

	/// Proposes a new state machine command
	pub fn propose_command(&mut self, data: Bytes, out: &mut Tick) -> ProposeResult {
		self.propose_entry(LogEntryData::Command(data), out)
	}

	pub fn propose_noop(&mut self, out: &mut Tick) -> ProposeResult {
		self.propose_entry(LogEntryData::Noop, out)
	}

	fn propose_entry(&mut self, data: LogEntryData, out: &mut Tick) -> ProposeResult {
		match self.state {
			ServerState::Leader(_) => {},
			ServerState::Follower(ref s) => {
				return Err(ProposeError::NotLeader {
					leader_hint: s.last_leader_id.or(self.meta.voted_for)
				});
			},
			ServerState::Candidate(_) => {
				return Err(ProposeError::NotLeader { leader_hint: None });
			},
			ServerState::Unavailable => return Err(ProposeError::Unavailable)
		};

		let index = self.log.last_index() + 1;
		let term = self.meta.current_term;

		// Only one configuration change may be in flight at a time; the next
		// one has to wait until the previous entry commits
		if let LogEntryData::Config(_) = data {
			if let Some(pending_index) = self.config.pending() {
				return Err(ProposeError::RetryAfter(Proposal {
					index: pending_index,
					term: self.log.term(pending_index).unwrap_or(term)
				}));
			}
		}

		let entry = LogEntry { index, term, data };

		// A configuration change takes effect the moment it is in the log
		self.config.apply(&entry, self.meta.commit_index);

		out.new_entries = true;
		self.log.append(entry);

		// Cycle so the new entry starts replicating right away
		self.cycle(out);

		Ok(Proposal { index, term })
	}

	/// Checks the progress of a previously initiated proposal. Can be asked
	/// of any server, but only the server that accepted the proposal will
	/// converge first
	pub fn proposal_status(&self, prop: &Proposal) -> ProposalStatus {
		let last_log_index = self.log.last_index();
		let last_log_term = self.log.last_term();

		if prop.term > last_log_term || prop.index > last_log_index {
			return ProposalStatus::Missing;
		}

		let cur_term = match self.log.term(prop.index) {
			Some(t) => t,
			// Before the start of our log; the snapshot swallowed its fate
			None => return ProposalStatus::Unavailable
		};

		if cur_term > prop.term {
			// Overwritten by an entry from a newer term
			ProposalStatus::Failed
		} else if cur_term < prop.term {
			if self.meta.commit_index >= prop.index {
				ProposalStatus::Failed
			} else {
				ProposalStatus::Missing
			}
		} else if self.meta.commit_index >= prop.index {
			ProposalStatus::Commited
		} else {
			ProposalStatus::Pending
		}
	}

	/// Adds a new server to the cluster as a non-voter. It starts receiving
	/// entries immediately but does not count towards quorums until promoted
	pub fn add_server(&mut self, server_id: ServerId, addr: &str, out: &mut Tick) -> std::result::Result<Proposal, ChangeError> {
		self.check_can_change()?;

		let mut next = self.config.value.clone();
		next.add(server_id, addr, false)?;

		self.propose_config(next, out)
	}

	/// Removes a server entirely. A leader may remove itself; it steps down
	/// once the removal entry commits
	pub fn remove_server(&mut self, server_id: ServerId, out: &mut Tick) -> std::result::Result<Proposal, ChangeError> {
		self.check_can_change()?;

		let mut next = self.config.value.clone();
		next.remove(server_id)?;

		self.propose_config(next, out)
	}

	/// Begins promoting a non-voter to a full voting member. The actual
	/// configuration entry is only appended once the server has proven it can
	/// keep up (see the catch-up rounds in `check_promotion`); until then the
	/// change occupies the single in-flight change slot
	pub fn promote_server(&mut self, server_id: ServerId, out: &mut Tick) -> std::result::Result<(), ChangeError> {
		self.check_can_change()?;

		match self.config.value.get(server_id) {
			Some(desc) => {
				if desc.voting {
					return Err(ChangeError::BadState);
				}
			},
			None => return Err(ChangeError::UnknownId(server_id))
		};

		let round_target = self.log.last_index();
		let now = out.time;

		if let ServerState::Leader(ref mut s) = self.state {
			s.promotion = Some(PromotionProgress {
				server_id,
				round: 1,
				round_start: now,
				round_target,
				started: now
			});
		}

		debug!(server_id, "starting promotion catch-up");
		Ok(())
	}

	/// Asks a caught-up voter to immediately start an election and take over
	/// leadership from us
	pub fn transfer_leadership(&mut self, target: ServerId, out: &mut Tick) -> std::result::Result<(), ChangeError> {
		if let ServerState::Unavailable = self.state {
			return Err(ChangeError::Unavailable);
		}

		if target == self.id {
			return Err(ChangeError::BadState);
		}

		match self.config.value.get(target) {
			Some(desc) => {
				if !desc.voting {
					return Err(ChangeError::BadState);
				}
			},
			None => return Err(ChangeError::UnknownId(target))
		};

		let last_log_index = self.log.last_index();

		let caught_up = match self.state {
			ServerState::Leader(ref s) => s.servers.get(&target)
				.map(|p| p.match_index >= last_log_index)
				.unwrap_or(false),
			_ => return Err(ChangeError::NotLeader { leader_hint: self.current_leader() })
		};

		if !caught_up {
			// The target would lose the election it is about to start
			return Err(ChangeError::Busy);
		}

		out.send(Message { to: vec![target], body: MessageBody::TimeoutNow(TimeoutNow {}) });
		Ok(())
	}

	fn check_can_change(&self) -> std::result::Result<(), ChangeError> {
		match self.state {
			ServerState::Leader(ref s) => {
				if s.promotion.is_some() {
					return Err(ChangeError::Busy);
				}
			},
			ServerState::Unavailable => return Err(ChangeError::Unavailable),
			_ => return Err(ChangeError::NotLeader { leader_hint: self.current_leader() })
		};

		if self.config.pending().is_some() {
			return Err(ChangeError::Busy);
		}

		Ok(())
	}

	fn propose_config(&mut self, next: Configuration, out: &mut Tick) -> std::result::Result<Proposal, ChangeError> {
		self.propose_entry(LogEntryData::Config(next), out).map_err(|e| match e {
			ProposeError::Unavailable => ChangeError::Unavailable,
			ProposeError::RetryAfter(_) => ChangeError::Busy,
			ProposeError::NotLeader { leader_hint } => ChangeError::NotLeader { leader_hint }
		})
	}

	/// Runs all state transitions that have become due at the current module
	/// time, recursing as transitions enable further transitions (e.g. a sole
	/// voter going follower -> candidate -> leader in one call)
	pub fn cycle(&mut self, tick: &mut Tick) {
		if let ServerState::Unavailable = self.state {
			return;
		}

		// With no known members (or us not among them) there is nothing
		// useful to do; check back occasionally in case a snapshot installed
		// a configuration that includes us
		if self.config.value.is_empty() || self.config.value.get(self.id).is_none() {
			tick.next_tick = Some(1000);
			return;
		}

		enum Summary {
			Follower { elapsed: u64, election_timeout: u64 },
			Candidate { vote_count: usize, elapsed: u64, election_timeout: u64 },
			Leader { next_commit_index: Option<LogIndex> }
		}

		// Pull the few needed facts out of the state so the transitions below
		// can borrow `self` freely
		let summary = match self.state {
			ServerState::Follower(ref s) => Summary::Follower {
				elapsed: tick.time.saturating_sub(s.last_heartbeat),
				election_timeout: s.election_timeout
			},
			ServerState::Candidate(ref s) => Summary::Candidate {
				// Our own vote is implicit
				vote_count: 1 + s.votes_received.len(),
				elapsed: tick.time.saturating_sub(s.election_start),
				election_timeout: s.election_timeout
			},
			ServerState::Leader(ref s) => Summary::Leader {
				next_commit_index: self.find_next_commit_index(s)
			},
			ServerState::Unavailable => return
		};

		match summary {
			Summary::Follower { elapsed, election_timeout } => {
				if !self.config.value.is_voter(self.id) {
					// Non-voters never start elections
					tick.next_tick = Some(election_timeout);
					return;
				}

				if !self.can_be_leader() {
					// We are missing entries that were commited under a
					// previous leader, so we could not safely win; stay put
					// until someone resyncs us
					tick.next_tick = Some(election_timeout);
					return;
				}

				// A sole voter wins trivially and skips the waiting entirely
				if self.config.value.n_voting() == 1 || elapsed >= election_timeout {
					self.start_election(tick);
				} else {
					tick.next_tick = Some(election_timeout - elapsed);
				}
			},
			Summary::Candidate { vote_count, elapsed, election_timeout } => {
				if vote_count >= self.config.value.quorum() {
					self.become_leader(tick);
				} else if elapsed >= election_timeout {
					// Split vote or lost messages; try again in a fresh term
					self.start_election(tick);
				} else {
					tick.next_tick = Some(election_timeout - elapsed);
				}
			},
			Summary::Leader { next_commit_index } => {
				if let Some(ci) = next_commit_index {
					self.update_commited(ci, tick);
				}

				self.check_promotion(tick);

				// The commit above may have been our own removal, in which
				// case we are no longer the leader here
				if let ServerState::Leader(_) = self.state {
					let next_heartbeat = self.replicate_entries(tick);
					tick.next_tick = Some(next_heartbeat);
				}
			}
		}
	}

	/// A server missing commited entries must not become leader: it would
	/// violate Leader Completeness by overwriting them
	fn can_be_leader(&self) -> bool {
		self.log.last_index() >= self.meta.commit_index
	}

	/// On the leader, finds the highest index that a quorum of voters has
	/// durably replicated, subject to the restriction that only entries from
	/// our own term may be commited by counting
	fn find_next_commit_index(&self, s: &ServerLeaderState) -> Option<LogIndex> {
		let quorum = self.config.value.quorum();
		let mut ci = self.log.last_index();

		while ci > self.meta.commit_index {
			let term = match self.log.term(ci) {
				Some(t) => t,
				None => break
			};

			if term < self.meta.current_term {
				// Terms only decrease going backwards; no entry of our term
				// lies below this point
				break;
			}

			if term == self.meta.current_term {
				let mut count = 0;

				if self.config.value.is_voter(self.id) && self.log.match_index() >= ci {
					count += 1;
				}

				for (id, p) in s.servers.iter() {
					if *id == self.id || !self.config.value.is_voter(*id) {
						continue;
					}
					if p.match_index >= ci {
						count += 1;
					}
				}

				if count >= quorum {
					return Some(ci);
				}
			}

			ci -= 1;
		}

		None
	}

	/// On the leader, produces whatever requests each peer currently needs:
	/// missing entries, a snapshot if the entries are gone, or an empty
	/// heartbeat. Returns the time until the next heartbeat is due
	fn replicate_entries(&mut self, tick: &mut Tick) -> u64 {
		let heartbeat_timeout = self.opts.heartbeat_timeout;
		let max_batch = self.opts.max_batch_entries as u64;
		let leader_id = self.id;
		let term = self.meta.current_term;
		let leader_commit = self.meta.commit_index;

		// Configuration accompanying any snapshot offer
		let committed_config = self.config.committed().data.clone();

		let log = &self.log;
		let config = &self.config.value;

		let last_log_index = log.last_index();
		let first_log_index = log.first_index();

		let state = match self.state {
			ServerState::Leader(ref mut s) => s,
			_ => return heartbeat_timeout
		};

		let new_request = |prev_log_index: LogIndex, up_to: LogIndex| -> AppendEntriesRequest {
			let mut entries = vec![];
			for i in (prev_log_index + 1)..=up_to {
				if let Ok(e) = log.entry(i) {
					entries.push((*e).clone());
				}
			}

			AppendEntriesRequest {
				term,
				leader_id,
				prev_log_index,
				prev_log_term: log.term(prev_log_index).unwrap_or(0),
				entries,
				leader_commit
			}
		};

		// Identical requests to multiple peers get deduplicated into one
		// message with several recipients
		let mut message_map: HashMap<LogIndex, Message> = HashMap::new();

		// Largest elapsed time since we sent anything to a caught-up peer
		let mut since_last_heartbeat = 0;

		for desc in config.iter() {
			if desc.id == leader_id {
				continue;
			}

			let progress = state.servers.entry(desc.id)
				.or_insert_with(|| ServerProgress::new(last_log_index));

			if !progress.can_send() {
				continue;
			}

			// A peer that fell behind the start of our log can only be
			// repaired by a snapshot
			if progress.next_index < first_log_index {
				let last_included = LogPosition {
					index: first_log_index - 1,
					term: log.term(first_log_index - 1).unwrap_or(0)
				};
				progress.mode = ProgressMode::Snapshot { last_included };
			}

			if let ProgressMode::Snapshot { last_included } = progress.mode {
				progress.in_flight.push_back(last_included.index);
				progress.last_sent = Some(tick.time);

				tick.send(Message {
					to: vec![desc.id],
					body: MessageBody::InstallSnapshot(InstallSnapshotRequest {
						term,
						leader_id,
						last_included_index: last_included.index,
						last_included_term: last_included.term,
						config: committed_config.clone(),
						// The transport attaches the state machine image
						data: Bytes::new()
					})
				});
				continue;
			}

			// Nothing new to send: only an occasional heartbeat is needed
			if progress.next_index > last_log_index {
				if let Some(t) = progress.last_sent {
					let elapsed = tick.time.saturating_sub(t);
					if elapsed < heartbeat_timeout {
						if elapsed > since_last_heartbeat {
							since_last_heartbeat = elapsed;
						}
						continue;
					}
				}
			}

			let prev = progress.next_index - 1;
			let up_to = std::cmp::min(last_log_index, prev + max_batch);

			progress.in_flight.push_back(up_to);
			progress.last_sent = Some(tick.time);

			if let ProgressMode::Pipeline = progress.mode {
				// Run ahead optimistically; a rejection resets us to probing
				progress.next_index = up_to + 1;
			}

			if let Some(msg) = message_map.get_mut(&prev) {
				msg.to.push(desc.id);
			} else {
				message_map.insert(prev, Message {
					to: vec![desc.id],
					body: MessageBody::AppendEntries(new_request(prev, up_to))
				});
			}
		}

		for (_, msg) in message_map.into_iter() {
			tick.send(msg);
		}

		heartbeat_timeout - since_last_heartbeat
	}

	/// Advances the catch-up rounds of an in-progress promotion and decides
	/// its fate: propose the configuration change once a round completes fast
	/// enough, or give up after too many rounds / too much total time
	fn check_promotion(&mut self, tick: &mut Tick) {
		let election_timeout = self.opts.election_timeout;
		let max_rounds = self.opts.max_promotion_rounds;
		let time_limit = self.opts.promotion_time_limit;
		let last_log_index = self.log.last_index();

		enum Outcome {
			Wait,
			Promote(ServerId),
			Abort(ServerId)
		}

		let outcome = {
			let state = match self.state {
				ServerState::Leader(ref mut s) => s,
				_ => return
			};

			let match_index = {
				let target = match state.promotion {
					Some(ref p) => p.server_id,
					None => return
				};
				state.servers.get(&target).map(|p| p.match_index).unwrap_or(0)
			};

			let pr = match state.promotion {
				Some(ref mut p) => p,
				None => return
			};

			if tick.time.saturating_sub(pr.started) >= time_limit {
				// Unresponsive overall; stop holding the change slot open
				Outcome::Abort(pr.server_id)
			} else if match_index >= pr.round_target {
				let duration = tick.time.saturating_sub(pr.round_start);

				if duration <= election_timeout {
					// Caught up within an election timeout: the switch-over
					// gap it will cause is tolerable
					Outcome::Promote(pr.server_id)
				} else if pr.round >= max_rounds {
					Outcome::Abort(pr.server_id)
				} else {
					pr.round += 1;
					pr.round_start = tick.time;
					pr.round_target = last_log_index;
					Outcome::Wait
				}
			} else if pr.round >= max_rounds && tick.time.saturating_sub(pr.round_start) > election_timeout {
				// The last permitted round has already run too long
				Outcome::Abort(pr.server_id)
			} else {
				Outcome::Wait
			}
		};

		match outcome {
			Outcome::Wait => {},
			Outcome::Abort(server_id) => {
				warn!(server_id, "aborting promotion; server can not catch up");

				if let ServerState::Leader(ref mut s) = self.state {
					s.promotion = None;
				}

				if let Some(ref w) = self.watcher {
					w.promotion_aborted(server_id);
				}
			},
			Outcome::Promote(server_id) => {
				info!(server_id, "promoting server to voting member");

				if let ServerState::Leader(ref mut s) = self.state {
					s.promotion = None;
				}

				let mut next = self.config.value.clone();
				if next.promote(server_id).is_ok() {
					if let Err(e) = self.propose_entry(LogEntryData::Config(next), tick) {
						// The change slot was free when the rounds started, so
						// this should not be reachable
						error!("failed to propose promotion: {:?}", e);
					}
				}
			}
		}
	}

	fn start_election(&mut self, tick: &mut Tick) {
		debug_assert!(self.config.value.is_voter(self.id));

		// Every election, including a retry after a split vote, gets a fresh
		// term
		self.meta.current_term += 1;
		self.meta.voted_for = Some(self.id);
		tick.write_meta();

		info!(term = self.meta.current_term, "starting election");

		let election_timeout = self.new_election_timeout();
		self.set_state(ServerState::Candidate(ServerCandidateState {
			election_start: tick.time,
			election_timeout,
			votes_received: HashSet::new()
		}));

		self.perform_election(tick);

		// Either wins immediately (single voter) or schedules the timeout
		self.cycle(tick);
	}

	fn perform_election(&self, tick: &mut Tick) {
		let req = RequestVoteRequest {
			term: self.meta.current_term,
			candidate_id: self.id,
			last_log_index: self.log.last_index(),
			last_log_term: self.log.last_term()
		};

		let ids = self.config.value.voters()
			.map(|s| s.id)
			.filter(|id| *id != self.id)
			.collect::<Vec<_>>();

		// Sole voter; the cycle following this will count our own vote
		if ids.is_empty() {
			return;
		}

		tick.send(Message { to: ids, body: MessageBody::RequestVote(req) });
	}

	fn become_leader(&mut self, tick: &mut Tick) {
		let last_log_index = self.log.last_index();

		let servers = self.config.value.iter()
			.filter(|s| s.id != self.id)
			.map(|s| (s.id, ServerProgress::new(last_log_index)))
			.collect();

		info!(term = self.meta.current_term, "won election");

		self.set_state(ServerState::Leader(ServerLeaderState {
			servers,
			promotion: None
		}));

		// Entries from previous terms can never be commited by counting
		// replicas, so if any are still outstanding, commit a no-op of our
		// own term on top of them
		if self.meta.commit_index < last_log_index {
			self.propose_noop(tick).expect("Failed to propose noop as the new leader");
		}

		// Sends the initial heartbeats asserting leadership
		self.cycle(tick);
	}

	fn new_follower_state(&mut self, now: u64) -> ServerFollowerState {
		ServerFollowerState {
			election_timeout: self.new_election_timeout(),
			last_leader_id: None,
			last_heartbeat: now
		}
	}

	fn become_follower(&mut self, tick: &mut Tick) {
		let s = self.new_follower_state(tick.time);
		self.set_state(ServerState::Follower(s));
		self.cycle(tick);
	}

	/// Run on every term index seen in any request or response. A higher term
	/// than ours immediately demotes us
	fn observe_term(&mut self, term: Term, tick: &mut Tick) {
		if term > self.meta.current_term {
			self.meta.current_term = term;
			self.meta.voted_for = None;
			tick.write_meta();

			self.become_follower(tick);
		}
	}

	fn set_state(&mut self, state: ServerState) {
		let old = self.state.role();
		let new = state.role();
		self.state = state;

		if old != new {
			if let Some(ref w) = self.watcher {
				w.role_changed(old, new);
			}
		}
	}

	/// Permanently poisons the module after detecting corrupted state. Every
	/// operation from here on fails with Shutdown
	fn enter_shutdown(&mut self) -> Error {
		error!("detected corrupt replicated state; shutting down");
		self.set_state(ServerState::Unavailable);
		self.pending_replies.clear();
		ErrorKind::Shutdown.into()
	}

	/// Moves the commit index forward, dispatching newly commited entries for
	/// application and resolving any configuration change that was waiting
	fn update_commited(&mut self, index: LogIndex, tick: &mut Tick) {
		debug_assert!(index > self.meta.commit_index);
		if index <= self.meta.commit_index {
			return;
		}

		self.meta.commit_index = index;
		tick.write_meta();

		if self.config.commit(index) {
			tick.write_config();
		}

		if let Some(ref w) = self.watcher {
			w.committed(index);
		}

		while self.last_dispatched < self.meta.commit_index {
			let i = self.last_dispatched + 1;
			let e = match self.log.entry(i) {
				Ok(e) => e,
				Err(_) => break
			};
			self.last_dispatched = i;

			if e.data.is_noop() {
				// No-ops exist purely for commit safety; nothing to apply
				if self.last_applied + 1 == i {
					self.last_applied = i;
				}
			} else {
				tick.apply.push(e);
			}
		}

		// A leader whose own removal just commited abdicates
		let removed_self = match self.state {
			ServerState::Leader(_) => self.config.value.get(self.id).is_none(),
			_ => false
		};
		if removed_self {
			info!("stepped down after commiting own removal");
			self.become_follower(tick);
		}
	}

	/// Acknowledgement from the state machine that the entry at the given
	/// index has been fully applied
	pub fn applied(&mut self, index: LogIndex) {
		debug_assert_eq!(index, self.last_applied + 1);
		if index <= self.last_applied {
			return;
		}

		self.last_applied = index;

		// Slide over any commited no-ops sitting right behind it
		loop {
			let next = self.last_applied + 1;
			if next > self.meta.commit_index {
				break;
			}

			match self.log.entry(next) {
				Ok(e) => {
					if e.data.is_noop() {
						self.last_applied = next;
					} else {
						break;
					}
				},
				Err(_) => break
			}
		}
	}

	fn new_election_timeout(&mut self) -> u64 {
		let base = self.opts.election_timeout;
		self.rng.gen_range(base, 2 * base)
	}

	/// Single entry point for inbound messages. Responses this produces are
	/// recorded in the tick; acknowledgements that require local durability
	/// first are held back until `log_flushed` reports it
	pub fn recv(&mut self, from: ServerId, body: MessageBody, tick: &mut Tick) -> Result<()> {
		if let ServerState::Unavailable = self.state {
			return Err(ErrorKind::Shutdown.into());
		}

		match body {
			MessageBody::RequestVote(req) => {
				// The dispatcher persists metadata before any message of the
				// same tick leaves the process, which is exactly the
				// persistence the vote below requires
				let res = self.request_vote(req, tick).persisted();
				tick.send(Message { to: vec![from], body: MessageBody::RequestVoteResult(res) });
			},
			MessageBody::RequestVoteResult(res) => {
				self.request_vote_callback(from, res, tick);
			},
			MessageBody::AppendEntries(req) => {
				let constraint = self.append_entries(req, tick)?;
				self.pending_replies.push((from, constraint));
				self.flush_pending_replies(tick);
			},
			MessageBody::AppendEntriesResult(res) => {
				self.append_entries_callback(from, res, tick);
			},
			MessageBody::InstallSnapshot(req) => {
				let res = self.install_snapshot(req, tick)?;
				tick.send(Message { to: vec![from], body: MessageBody::InstallSnapshotResult(res) });
			},
			MessageBody::InstallSnapshotResult(res) => {
				self.install_snapshot_callback(from, res, tick);
			},
			MessageBody::TimeoutNow(_) => {
				self.timeout_now(tick)?;
			}
		}

		Ok(())
	}

	/// Checks whether we would grant the given vote request, without actually
	/// granting it or mutating anything
	pub fn pre_vote(&self, req: &RequestVoteRequest) -> RequestVoteResponse {
		let should_grant = |this: &Self| {
			if req.term < this.meta.current_term {
				return false;
			}

			let last_log_index = this.log.last_index();
			let last_log_term = this.log.last_term();

			// The candidate's log must be at least as up-to-date as ours
			let up_to_date =
				req.last_log_term > last_log_term ||
				(req.last_log_term == last_log_term && req.last_log_index >= last_log_index);

			if !up_to_date {
				return false;
			}

			// A higher term implies we can not possibly have voted in it yet
			if req.term > this.meta.current_term {
				return true;
			}

			match this.meta.voted_for {
				// At most one vote per term, but re-granting the same one is
				// harmless (the earlier reply may have been lost)
				Some(id) => id == req.candidate_id,
				None => true
			}
		};

		RequestVoteResponse {
			term: self.meta.current_term,
			vote_granted: should_grant(self)
		}
	}

	/// Called when another server asks for our vote. The response may only be
	/// released after the vote has been made durable
	pub fn request_vote(&mut self, req: RequestVoteRequest, tick: &mut Tick) -> MustPersistMetadata<RequestVoteResponse> {
		debug!(candidate_id = req.candidate_id, term = req.term, "received vote request");

		self.observe_term(req.term, tick);

		let res = self.pre_vote(&req);

		if res.vote_granted {
			// Reset the election timer so the new leader gets a full quiet
			// window to assert itself
			if let ServerState::Follower(ref mut s) = self.state {
				s.last_heartbeat = tick.time;
			}

			self.meta.voted_for = Some(req.candidate_id);
			tick.write_meta();
			debug!(candidate_id = req.candidate_id, "granted vote");
		}

		MustPersistMetadata::new(res)
	}

	/// Handles the response to a RequestVote we sent earlier
	pub fn request_vote_callback(&mut self, from_id: ServerId, resp: RequestVoteResponse, tick: &mut Tick) {
		self.observe_term(resp.term, tick);

		// Only relevant if nothing has changed since we asked
		if self.meta.current_term != resp.term {
			return;
		}

		if from_id == self.id {
			// We never ask ourselves
			return;
		}

		let should_cycle = if let ServerState::Candidate(ref mut s) = self.state {
			if resp.vote_granted && self.config.value.is_voter(from_id) {
				s.votes_received.insert(from_id);
			}
			true
		} else {
			false
		};

		if should_cycle {
			// May have just reached a quorum
			self.cycle(tick);
		}
	}

	/// Processes an AppendEntries request from the (claimed) leader. On
	/// success, the returned acknowledgement is constrained on the local log
	/// having durably persisted everything it acknowledges.
	///
	/// Any entries handed over in the request are owned by this call: they
	/// are either retained in the log or dropped before it returns, including
	/// on the corruption path
	pub fn append_entries(&mut self, req: AppendEntriesRequest, tick: &mut Tick) -> Result<MatchConstraint<AppendEntriesResponse>> {
		if let ServerState::Unavailable = self.state {
			return Err(ErrorKind::Shutdown.into());
		}

		self.observe_term(req.term, tick);

		let current_term = self.meta.current_term;
		let make_response = |success: bool, last_log_index: LogIndex| AppendEntriesResponse {
			term: current_term,
			success,
			last_log_index
		};

		if req.term < current_term {
			// Stale leader; our term in the reply will demote it
			return Ok(make_response(false, self.log.last_index()).into());
		}

		// A current-term AppendEntries settles who the leader is, so anyone
		// still campaigning (or wrongly presiding) in this term steps down
		let is_follower = match self.state {
			ServerState::Follower(_) => true,
			_ => false
		};
		if !is_follower {
			self.become_follower(tick);
		}

		if let ServerState::Follower(ref mut s) = self.state {
			s.last_heartbeat = tick.time;
			s.last_leader_id = Some(req.leader_id);
		}

		// Basic shape validation so the truncation logic below can rely on
		// the entries being consecutive
		if !req.entries.is_empty() {
			let first = &req.entries[0];
			if first.term < req.prev_log_term || first.index != req.prev_log_index + 1 {
				bail!(ErrorKind::Internal("first entry does not follow the previous position".into()));
			}

			for i in 0..(req.entries.len() - 1) {
				let cur = &req.entries[i];
				let next = &req.entries[i + 1];
				if cur.term > next.term || next.index != cur.index + 1 {
					bail!(ErrorKind::Internal("entries are unsorted or non-consecutive".into()));
				}
			}
		}

		// The leader should never reference a position that we have already
		// compacted: everything below first_index was commited cluster-wide
		if req.prev_log_index + 1 < self.log.first_index() {
			return Err(self.enter_shutdown());
		}

		match self.log.term(req.prev_log_index) {
			Some(term) => {
				if term != req.prev_log_term {
					if req.prev_log_index <= self.meta.commit_index {
						// A mismatch at or below the commit index means some
						// log lost commited data; refuse to run any further
						return Err(self.enter_shutdown());
					}

					// Report our end so the leader can back up in one step
					return Ok(make_response(false, self.log.last_index()).into());
				}
			},
			// We don't even have the previous entry yet
			None => return Ok(make_response(false, self.log.last_index()).into())
		};

		// Skip entries we already have; at the first conflict, truncate our
		// tail (rolling back any configuration the tail introduced)
		let mut first_new = 0;
		for e in req.entries.iter() {
			match self.log.term(e.index) {
				Some(t) => {
					if t == e.term {
						first_new += 1;
					} else {
						if e.index <= self.meta.commit_index {
							return Err(self.enter_shutdown());
						}

						self.config.revert(e.index);

						if self.log.truncate_suffix(e.index).is_err() {
							return Err(self.enter_shutdown());
						}

						break;
					}
				},
				None => break
			}
		}

		// The last position this request vouches for, independent of how many
		// of its entries we already had: the acknowledgement below may only be
		// released once the log durably covers it
		let (last_new, last_new_term) = match req.entries.last() {
			Some(e) => (e.index, e.term),
			None => (req.prev_log_index, req.prev_log_term)
		};

		if first_new < req.entries.len() {
			let mut entries = req.entries;
			let new_entries = entries.split_off(first_new);

			tick.new_entries = true;

			for e in new_entries {
				// Configuration changes activate the moment they are in the
				// log, not when they commit
				self.config.apply(&e, self.meta.commit_index);
				self.log.append(e);
			}
		}

		// Never advance past the last entry this request vouched for: our own
		// log may extend further with entries the new leader won't keep
		if req.leader_commit > self.meta.commit_index {
			let next_commit = std::cmp::min(req.leader_commit, last_new);
			if next_commit > self.meta.commit_index {
				self.update_commited(next_commit, tick);
			}
		}

		Ok(MatchConstraint::new(
			make_response(true, self.log.last_index()),
			LogPosition { index: last_new, term: last_new_term }
		))
	}

	/// Handles the response to an AppendEntries request we sent as leader.
	/// Requests to one peer are answered in send order, so each response is
	/// matched against the oldest in-flight request; anything unmatched is a
	/// duplicate or out-of-order straggler and gets dropped
	pub fn append_entries_callback(&mut self, from_id: ServerId, resp: AppendEntriesResponse, tick: &mut Tick) {
		if let ServerState::Unavailable = self.state {
			return;
		}

		self.observe_term(resp.term, tick);

		if resp.term < self.meta.current_term {
			// Response to a request from a previous reign
			return;
		}

		let last_log_index = self.log.last_index();
		let last_log_term = self.log.last_term();
		let current_term = self.meta.current_term;

		let mut should_noop = false;

		let should_cycle = if let ServerState::Leader(ref mut s) = self.state {
			let progress = match s.servers.get_mut(&from_id) {
				Some(p) => p,
				None => return
			};

			let last_index_sent = match progress.in_flight.pop_front() {
				Some(i) => i,
				None => return
			};

			if resp.success {
				if last_index_sent > progress.match_index {
					progress.match_index = last_index_sent;
				}
				if progress.next_index < progress.match_index + 1 {
					progress.next_index = progress.match_index + 1;
				}

				if let ProgressMode::Probe = progress.mode {
					// Found the match point; open up the send window
					progress.mode = ProgressMode::Pipeline;
				}

				// A follower with a longer log than ours was part of a dead
				// reign; a no-op in our term will make it truncate
				if resp.last_log_index > last_log_index && last_log_term != current_term {
					should_noop = true;
				}
			} else {
				// Back up past the conflict. The responder's last index lets
				// us skip whole terms instead of stepping one at a time
				let old_next = progress.next_index;
				progress.reset_probe();

				let mut next = old_next.saturating_sub(1);
				if resp.last_log_index + 1 < next {
					next = resp.last_log_index + 1;
				}
				if next < 1 {
					next = 1;
				}
				// But never below what we already know matched
				progress.next_index = std::cmp::max(next, progress.match_index + 1);
			}

			true
		} else {
			false
		};

		if should_noop {
			let _ = self.propose_noop(tick);
		} else if should_cycle {
			// Something changed; the cycler may now commit or send more
			self.cycle(tick);
		}
	}

	/// Delivery of a transport-level send completion. Failures demote the
	/// peer to probing so the lost request gets retried
	pub fn send_done(&mut self, to: ServerId, ok: bool, _tick: &mut Tick) {
		if ok {
			return;
		}

		warn!(to, "failed to send to peer");

		if let ServerState::Leader(ref mut s) = self.state {
			if let Some(p) = s.servers.get_mut(&to) {
				p.reset_probe();
			}
		}
	}

	/// Delivery of a storage append completion: everything up to `pos` is
	/// durable (or the write failed). Success may release held-back
	/// acknowledgements and advance the commit index via our own vote
	pub fn log_flushed(&mut self, ok: bool, pos: LogPosition, tick: &mut Tick) -> Result<()> {
		if let ServerState::Unavailable = self.state {
			return Err(ErrorKind::Shutdown.into());
		}

		if !ok {
			// The caller is expected to retry the append; if it keeps
			// failing, this surfaces out of the operation that queued it
			warn!("log append failed");
			return Err(ErrorKind::IoFailed.into());
		}

		self.log.flushed(pos.index);
		self.flush_pending_replies(tick);
		self.cycle(tick);
		Ok(())
	}

	fn flush_pending_replies(&mut self, tick: &mut Tick) {
		let pending = std::mem::replace(&mut self.pending_replies, vec![]);

		for (to, constraint) in pending {
			match constraint.poll(self.log.as_ref()) {
				ConstraintPoll::Satisfied(resp) => {
					tick.send(Message { to: vec![to], body: MessageBody::AppendEntriesResult(resp) });
				},
				ConstraintPoll::Pending(c) => self.pending_replies.push((to, c))
			}
		}
	}

	/// Accepts a snapshot offered by the leader, replacing the log with the
	/// snapshot position. The state machine restore happens externally via
	/// the tick's snapshot intent
	pub fn install_snapshot(&mut self, req: InstallSnapshotRequest, tick: &mut Tick) -> Result<InstallSnapshotResponse> {
		if let ServerState::Unavailable = self.state {
			return Err(ErrorKind::Shutdown.into());
		}

		self.observe_term(req.term, tick);

		let current_term = self.meta.current_term;

		if req.term < current_term {
			return Ok(InstallSnapshotResponse { term: current_term });
		}

		// Same authority rules as AppendEntries
		let is_follower = match self.state {
			ServerState::Follower(_) => true,
			_ => false
		};
		if !is_follower {
			self.become_follower(tick);
		}

		if let ServerState::Follower(ref mut s) = self.state {
			s.last_heartbeat = tick.time;
			s.last_leader_id = Some(req.leader_id);
		}

		let have_position = self.log.term(req.last_included_index) == Some(req.last_included_term);

		if have_position {
			// Our log already covers the snapshot; just compact up to it
			self.log.truncate_prefix(req.last_included_index, req.last_included_term);
			return Ok(InstallSnapshotResponse { term: current_term });
		}

		// Everything we have diverges from (or predates) the snapshot, which
		// by definition only contains commited data; replace the log entirely
		let first = self.log.first_index();
		if self.log.truncate_suffix(first).is_err() {
			return Err(self.enter_shutdown());
		}
		self.log.truncate_prefix(req.last_included_index, req.last_included_term);

		self.config = ConfigurationStateMachine::from(ConfigurationSnapshot {
			last_applied: req.last_included_index,
			data: req.config.clone()
		});
		tick.write_config();

		if req.last_included_index > self.meta.commit_index {
			self.meta.commit_index = req.last_included_index;
			tick.write_meta();
		}

		self.last_applied = req.last_included_index;
		self.last_dispatched = req.last_included_index;

		let response = InstallSnapshotResponse { term: current_term };
		tick.snapshot = Some(req);
		Ok(response)
	}

	pub fn install_snapshot_callback(&mut self, from_id: ServerId, resp: InstallSnapshotResponse, tick: &mut Tick) {
		if let ServerState::Unavailable = self.state {
			return;
		}

		self.observe_term(resp.term, tick);

		if resp.term < self.meta.current_term {
			return;
		}

		let should_cycle = if let ServerState::Leader(ref mut s) = self.state {
			let progress = match s.servers.get_mut(&from_id) {
				Some(p) => p,
				None => return
			};

			let last_included = match progress.in_flight.pop_front() {
				Some(i) => i,
				None => return
			};

			if last_included > progress.match_index {
				progress.match_index = last_included;
			}
			progress.next_index = progress.match_index + 1;
			progress.mode = ProgressMode::Probe;

			true
		} else {
			false
		};

		if should_cycle {
			self.cycle(tick);
		}
	}

	/// An explicit request (usually a leadership transfer) to stop waiting
	/// and campaign right now
	pub fn timeout_now(&mut self, tick: &mut Tick) -> Result<()> {
		if let ServerState::Unavailable = self.state {
			return Err(ErrorKind::Shutdown.into());
		}

		if !self.config.value.is_voter(self.id) || !self.can_be_leader() {
			// A stale transfer aimed at someone who can't win; ignore it
			return Ok(());
		}

		if let ServerState::Leader(_) = self.state {
			return Ok(());
		}

		self.start_election(tick);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::io::bootstrap_entry;
	use crate::log::MemoryLogStorage;
	use std::sync::Mutex as StdMutex;

	#[derive(Default)]
	struct Events {
		role_changes: StdMutex<Vec<(Role, Role)>>,
		committed: StdMutex<Vec<LogIndex>>,
		aborted: StdMutex<Vec<ServerId>>
	}

	impl Watcher for Events {
		fn role_changed(&self, old: Role, new: Role) {
			self.role_changes.lock().unwrap().push((old, new));
		}

		fn committed(&self, index: LogIndex) {
			self.committed.lock().unwrap().push(index);
		}

		fn promotion_aborted(&self, server_id: ServerId) {
			self.aborted.lock().unwrap().push(server_id);
		}
	}

	fn opts(seed: u64) -> ConsensusOptions {
		ConsensusOptions {
			election_timeout: 400,
			heartbeat_timeout: 150,
			max_batch_entries: 64,
			max_promotion_rounds: 10,
			promotion_time_limit: 30_000,
			seed
		}
	}

	fn voters(ids: &[ServerId]) -> Configuration {
		let mut config = Configuration::default();
		for id in ids {
			config.add(*id, &format!("127.0.0.1:{}", 4000 + id), true).unwrap();
		}
		config
	}

	/// Builds a module whose log contains the bootstrap configuration entry
	/// at index 1 (already durable and commited), at the given term
	fn new_node(id: ServerId, config: Configuration, term: Term) -> ConsensusModule {
		new_node_with(id, config, term, opts(id))
	}

	fn new_node_with(id: ServerId, config: Configuration, term: Term, opts: ConsensusOptions) -> ConsensusModule {
		let log = Arc::new(MemoryLogStorage::new());
		log.append(bootstrap_entry(config.clone()));
		log.flushed(1);

		let meta = Metadata { current_term: term, voted_for: None, commit_index: 1 };
		let snapshot = ConfigurationSnapshot { last_applied: 1, data: config };

		ConsensusModule::new(id, meta, snapshot, log, 1, opts).unwrap()
	}

	fn command(data: &[u8]) -> Bytes {
		Bytes::from(data.to_vec())
	}

	fn command_entry(index: LogIndex, term: Term, data: &[u8]) -> LogEntry {
		LogEntry { index, term, data: LogEntryData::Command(command(data)) }
	}

	fn heartbeat(term: Term, leader_id: ServerId, prev: LogPosition, commit: LogIndex) -> MessageBody {
		MessageBody::AppendEntries(AppendEntriesRequest {
			term,
			leader_id,
			prev_log_index: prev.index,
			prev_log_term: prev.term,
			entries: vec![],
			leader_commit: commit
		})
	}

	fn grant(m: &mut ConsensusModule, from: ServerId) -> Tick {
		let term = m.current_term();
		let mut t = m.new_tick();
		m.recv(from, MessageBody::RequestVoteResult(RequestVoteResponse {
			term,
			vote_granted: true
		}), &mut t).unwrap();
		t
	}

	fn ae_success(m: &mut ConsensusModule, from: ServerId, last_log_index: LogIndex) -> Tick {
		let term = m.current_term();
		let mut t = m.new_tick();
		m.recv(from, MessageBody::AppendEntriesResult(AppendEntriesResponse {
			term,
			success: true,
			last_log_index
		}), &mut t).unwrap();
		t
	}

	/// Times out the follower and grants it the given votes
	fn make_leader(m: &mut ConsensusModule, grants: &[ServerId]) {
		m.tick(800);
		assert_eq!(m.role(), Role::Candidate);
		for id in grants {
			grant(m, *id);
		}
		assert_eq!(m.role(), Role::Leader);
	}

	fn append_entries_sent(t: &Tick, to: ServerId) -> Vec<AppendEntriesRequest> {
		t.messages.iter()
			.filter(|m| m.to.contains(&to))
			.filter_map(|m| match m.body {
				MessageBody::AppendEntries(ref req) => Some(req.clone()),
				_ => None
			})
			.collect()
	}

	fn results_sent(t: &Tick) -> Vec<AppendEntriesResponse> {
		t.messages.iter()
			.filter_map(|m| match m.body {
				MessageBody::AppendEntriesResult(ref res) => Some(res.clone()),
				_ => None
			})
			.collect()
	}

	#[test]
	fn stale_term_append_entries_rejected() {
		let mut m = new_node(1, voters(&[1, 2]), 2);

		let mut t = m.new_tick();
		m.recv(2, heartbeat(1, 2, LogPosition { index: 0, term: 0 }, 1), &mut t).unwrap();

		let results = results_sent(&t);
		assert_eq!(results, vec![AppendEntriesResponse { term: 2, success: false, last_log_index: 1 }]);

		// Nothing else may have changed
		assert_eq!(m.role(), Role::Follower);
		assert_eq!(m.current_term(), 2);
		assert_eq!(m.meta().voted_for, None);
		assert_eq!(m.commit_index(), 1);
	}

	#[test]
	fn higher_term_append_entries_steps_candidate_down() {
		let mut m = new_node(1, voters(&[1, 2]), 1);
		m.tick(800);
		assert_eq!(m.role(), Role::Candidate);
		assert_eq!(m.current_term(), 2);

		let mut t = m.new_tick();
		m.recv(2, heartbeat(3, 2, LogPosition { index: 1, term: 1 }, 1), &mut t).unwrap();

		assert_eq!(m.role(), Role::Follower);
		assert_eq!(m.current_term(), 3);
		assert_eq!(m.current_leader(), Some(2));
	}

	#[test]
	fn conflicting_suffix_is_overwritten() {
		let mut m = new_node(1, voters(&[1, 2]), 1);
		m.log().append(command_entry(2, 1, b"x=1"));
		m.log().flushed(2);

		let mut t = m.new_tick();
		m.recv(2, MessageBody::AppendEntries(AppendEntriesRequest {
			term: 2,
			leader_id: 2,
			prev_log_index: 1,
			prev_log_term: 1,
			entries: vec![command_entry(2, 2, b"x=2"), command_entry(3, 2, b"x=3")],
			leader_commit: 1
		}), &mut t).unwrap();

		assert!(t.new_entries);
		assert_eq!(m.log().last_index(), 3);
		assert_eq!(m.log().term(2), Some(2));
		assert_eq!(m.log().term(3), Some(2));
		assert_eq!(m.log().entry(2).unwrap().data, LogEntryData::Command(command(b"x=2")));

		// The acknowledgement is held back until the new entries are durable
		assert!(results_sent(&t).is_empty());
		let mut t2 = m.new_tick();
		m.log_flushed(true, LogPosition { index: 3, term: 2 }, &mut t2).unwrap();
		assert_eq!(results_sent(&t2), vec![AppendEntriesResponse { term: 2, success: true, last_log_index: 3 }]);
	}

	#[test]
	fn conflict_below_commit_index_shuts_down() {
		let mut m = new_node(1, voters(&[1, 2]), 1);
		m.log().append(command_entry(2, 1, b"x=1"));
		m.log().flushed(2);

		// Mark entry 2 as commited
		let mut t = m.new_tick();
		m.recv(2, heartbeat(1, 2, LogPosition { index: 2, term: 1 }, 2), &mut t).unwrap();
		assert_eq!(m.commit_index(), 2);

		// A leader now claims a different term at index 1
		let mut t = m.new_tick();
		let err = m.recv(2, MessageBody::AppendEntries(AppendEntriesRequest {
			term: 2,
			leader_id: 2,
			prev_log_index: 1,
			prev_log_term: 2,
			entries: vec![],
			leader_commit: 1
		}), &mut t).unwrap_err();

		match err.kind() {
			ErrorKind::Shutdown => {},
			other => panic!("unexpected error: {:?}", other)
		}
		assert_eq!(m.role(), Role::Unavailable);

		// Every subsequent operation keeps failing
		let mut t = m.new_tick();
		assert_eq!(m.propose_command(command(b"y"), &mut t), Err(ProposeError::Unavailable));
		assert!(m.recv(2, heartbeat(2, 2, LogPosition { index: 1, term: 1 }, 1), &mut t).is_err());

		// And ticking produces no intents at all
		let t = m.tick(10_000);
		assert!(t.messages.is_empty());
		assert!(!t.meta);
	}

	#[test]
	fn quorum_commit_advances_after_one_follower_ack() {
		let mut m = new_node(1, voters(&[1, 2, 3]), 1);
		let events = Arc::new(Events::default());
		m.set_watcher(events.clone());

		make_leader(&mut m, &[2]);
		assert_eq!(m.current_term(), 2);

		// Initial heartbeats (covering entry 1) are on the wire; peer 2 acks
		ae_success(&mut m, 2, 1);

		let mut t = m.new_tick();
		let prop = m.propose_command(command(b"x=1"), &mut t).unwrap();
		assert_eq!(prop, LogPosition { index: 2, term: 2 });
		assert_eq!(m.proposal_status(&prop), ProposalStatus::Pending);

		// Our own log becomes durable
		let mut t = m.new_tick();
		m.log_flushed(true, LogPosition { index: 2, term: 2 }, &mut t).unwrap();
		assert_eq!(m.commit_index(), 1);

		// One follower ack completes the quorum (leader + one of three)
		let t = ae_success(&mut m, 2, 2);
		assert_eq!(m.commit_index(), 2);
		assert_eq!(m.proposal_status(&prop), ProposalStatus::Commited);
		assert_eq!(*events.committed.lock().unwrap(), vec![2]);

		// The newly commited command is dispatched for application in order
		assert_eq!(t.apply.len(), 1);
		assert_eq!(t.apply[0].index, 2);
		m.applied(2);
		assert_eq!(m.last_applied(), 2);
	}

	#[test]
	fn failed_ack_backs_up_to_responders_log_end() {
		let mut m = new_node(1, voters(&[1, 2, 3]), 1);
		make_leader(&mut m, &[2]);

		let mut t = m.new_tick();
		m.propose_command(command(b"x=1"), &mut t).unwrap();

		// Peer 3 rejects the initial request and reports an empty log
		let mut t = m.new_tick();
		m.recv(3, MessageBody::AppendEntriesResult(AppendEntriesResponse {
			term: 2,
			success: false,
			last_log_index: 0
		}), &mut t).unwrap();

		// The retry must start from the very beginning of the log
		let reqs = append_entries_sent(&t, 3);
		assert_eq!(reqs.len(), 1);
		assert_eq!(reqs[0].prev_log_index, 0);
		assert_eq!(reqs[0].entries[0].index, 1);

		// Another failure must not push next_index below 1
		let mut t = m.new_tick();
		m.recv(3, MessageBody::AppendEntriesResult(AppendEntriesResponse {
			term: 2,
			success: false,
			last_log_index: 0
		}), &mut t).unwrap();

		let reqs = append_entries_sent(&t, 3);
		assert_eq!(reqs.len(), 1);
		assert_eq!(reqs[0].prev_log_index, 0);
		assert_eq!(reqs[0].entries[0].index, 1);
	}

	#[test]
	fn sole_voter_elects_and_commits_immediately() {
		let mut m = new_node(1, voters(&[1]), 1);

		m.tick(1);
		assert_eq!(m.role(), Role::Leader);
		assert_eq!(m.current_term(), 2);

		let mut t = m.new_tick();
		let prop = m.propose_command(command(b"x=1"), &mut t).unwrap();

		let mut t = m.new_tick();
		m.log_flushed(true, prop, &mut t).unwrap();
		assert_eq!(m.commit_index(), 2);
		assert_eq!(t.apply.len(), 1);
	}

	#[test]
	fn empty_log_grants_vote() {
		let log = Arc::new(MemoryLogStorage::new());
		let snapshot = ConfigurationSnapshot { last_applied: 0, data: voters(&[1, 2]) };
		let mut m = ConsensusModule::new(1, Metadata::default(), snapshot, log, 0, opts(1)).unwrap();

		let mut t = m.new_tick();
		m.recv(2, MessageBody::RequestVote(RequestVoteRequest {
			term: 1,
			candidate_id: 2,
			last_log_index: 0,
			last_log_term: 0
		}), &mut t).unwrap();

		let granted = t.messages.iter().any(|msg| match msg.body {
			MessageBody::RequestVoteResult(ref res) => res.vote_granted,
			_ => false
		});
		assert!(granted);
		assert!(t.meta);
		assert_eq!(m.meta().voted_for, Some(2));
	}

	#[test]
	fn at_most_one_vote_per_term() {
		let mut m = new_node(1, voters(&[1, 2, 3]), 1);

		let vote = |m: &mut ConsensusModule, candidate_id: ServerId| -> bool {
			let mut t = m.new_tick();
			m.recv(candidate_id, MessageBody::RequestVote(RequestVoteRequest {
				term: 2,
				candidate_id,
				last_log_index: 1,
				last_log_term: 1
			}), &mut t).unwrap();

			t.messages.iter().any(|msg| match msg.body {
				MessageBody::RequestVoteResult(ref res) => res.vote_granted,
				_ => false
			})
		};

		assert!(vote(&mut m, 2));
		assert!(!vote(&mut m, 3));
		// Re-asking for the same vote is fine (the reply may have been lost)
		assert!(vote(&mut m, 2));
	}

	#[test]
	fn vote_denied_to_outdated_log() {
		let mut m = new_node(1, voters(&[1, 2]), 1);
		m.log().append(command_entry(2, 1, b"x"));
		m.log().flushed(2);

		let mut t = m.new_tick();
		m.recv(2, MessageBody::RequestVote(RequestVoteRequest {
			term: 2,
			candidate_id: 2,
			last_log_index: 1,
			last_log_term: 1
		}), &mut t).unwrap();

		let granted = t.messages.iter().any(|msg| match msg.body {
			MessageBody::RequestVoteResult(ref res) => res.vote_granted,
			_ => false
		});
		assert!(!granted);
	}

	#[test]
	fn heartbeats_keep_resetting_election_timer() {
		let mut m = new_node(1, voters(&[1, 2]), 1);

		for _ in 0..3 {
			let mut t = m.new_tick();
			m.recv(2, heartbeat(1, 2, LogPosition { index: 1, term: 1 }, 1), &mut t).unwrap();

			// Stays below even the smallest possible timeout
			m.tick(399);
			assert_eq!(m.role(), Role::Follower);
		}

		// Without a heartbeat the follower finally campaigns
		m.tick(800);
		assert_eq!(m.role(), Role::Candidate);
	}

	#[test]
	fn duplicate_append_entries_is_idempotent() {
		let mut m = new_node(1, voters(&[1, 2]), 1);

		let req = AppendEntriesRequest {
			term: 2,
			leader_id: 2,
			prev_log_index: 1,
			prev_log_term: 1,
			entries: vec![command_entry(2, 2, b"a"), command_entry(3, 2, b"b")],
			leader_commit: 1
		};

		let mut t = m.new_tick();
		m.recv(2, MessageBody::AppendEntries(req.clone()), &mut t).unwrap();
		assert!(t.new_entries);
		assert_eq!(m.log().last_index(), 3);

		let mut t = m.new_tick();
		m.recv(2, MessageBody::AppendEntries(req), &mut t).unwrap();
		assert!(!t.new_entries);
		assert_eq!(m.log().last_index(), 3);

		// Both acknowledgements release together once the log is durable
		let mut t = m.new_tick();
		m.log_flushed(true, LogPosition { index: 3, term: 2 }, &mut t).unwrap();
		let results = results_sent(&t);
		assert_eq!(results.len(), 2);
		assert!(results.iter().all(|r| r.success && r.last_log_index == 3));
	}

	#[test]
	fn truncation_rolls_back_uncommitted_configuration() {
		let mut m = new_node(1, voters(&[1, 2]), 1);

		let mut bigger = voters(&[1, 2]);
		bigger.add(3, "127.0.0.1:4003", false).unwrap();

		let mut t = m.new_tick();
		m.recv(2, MessageBody::AppendEntries(AppendEntriesRequest {
			term: 2,
			leader_id: 2,
			prev_log_index: 1,
			prev_log_term: 1,
			entries: vec![LogEntry { index: 2, term: 2, data: LogEntryData::Config(bigger) }],
			leader_commit: 1
		}), &mut t).unwrap();
		assert_eq!(m.config_snapshot().data.len(), 3);

		// A newer leader overwrites index 2 with a command entry
		let mut t = m.new_tick();
		m.recv(2, MessageBody::AppendEntries(AppendEntriesRequest {
			term: 3,
			leader_id: 2,
			prev_log_index: 1,
			prev_log_term: 1,
			entries: vec![command_entry(2, 3, b"x")],
			leader_commit: 1
		}), &mut t).unwrap();

		assert_eq!(m.config_snapshot().data.len(), 2);
		assert!(m.config_snapshot().data.get(3).is_none());
	}

	#[test]
	fn membership_changes_are_serialized() {
		let mut m = new_node(1, voters(&[1]), 1);
		m.tick(1);
		assert_eq!(m.role(), Role::Leader);

		let mut t = m.new_tick();
		let prop = m.add_server(2, "127.0.0.1:4002", &mut t).unwrap();
		assert_eq!(prop.index, 2);
		assert!(!m.config_snapshot().data.is_voter(2));

		// Only one change may be in flight
		let mut t = m.new_tick();
		assert_eq!(m.add_server(3, "127.0.0.1:4003", &mut t), Err(ChangeError::Busy));
		assert_eq!(m.add_server(2, "127.0.0.1:4002", &mut t), Err(ChangeError::Busy));

		// Commiting the entry frees the slot (sole voter: own flush suffices)
		let mut t = m.new_tick();
		m.log_flushed(true, LogPosition { index: 2, term: 2 }, &mut t).unwrap();
		assert_eq!(m.commit_index(), 2);
		assert!(t.config);

		let mut t = m.new_tick();
		assert_eq!(m.add_server(2, "127.0.0.1:4002", &mut t), Err(ChangeError::DuplicateId(2)));
		assert!(m.add_server(3, "127.0.0.1:4003", &mut t).is_ok());
	}

	#[test]
	fn remove_server_validation() {
		let mut m = new_node(1, voters(&[1]), 1);
		m.tick(1);

		let mut t = m.new_tick();
		assert_eq!(m.remove_server(9, &mut t), Err(ChangeError::UnknownId(9)));
		// Removing the only voter would brick the cluster
		assert_eq!(m.remove_server(1, &mut t), Err(ChangeError::Invalid));
	}

	#[test]
	fn changes_rejected_on_followers() {
		let mut m = new_node(1, voters(&[1, 2]), 1);
		let mut t = m.new_tick();
		match m.add_server(3, "addr", &mut t) {
			Err(ChangeError::NotLeader { .. }) => {},
			other => panic!("unexpected: {:?}", other)
		}
	}

	#[test]
	fn leader_steps_down_after_committing_own_removal() {
		let mut m = new_node(1, voters(&[1, 2]), 1);
		let events = Arc::new(Events::default());
		m.set_watcher(events.clone());

		make_leader(&mut m, &[2]);
		ae_success(&mut m, 2, 1);

		let mut t = m.new_tick();
		let prop = m.remove_server(1, &mut t).unwrap();
		assert_eq!(prop.index, 2);
		// The removal is active immediately even though it has not commited
		assert!(m.config_snapshot().data.get(1).is_none());
		assert_eq!(m.role(), Role::Leader);

		let mut t = m.new_tick();
		m.log_flushed(true, prop, &mut t).unwrap();

		// The remaining voter alone is now the whole quorum
		ae_success(&mut m, 2, 2);
		assert_eq!(m.commit_index(), 2);
		assert_eq!(m.role(), Role::Follower);

		let changes = events.role_changes.lock().unwrap();
		assert!(changes.contains(&(Role::Leader, Role::Follower)));
	}

	#[test]
	fn transfer_leadership_to_caught_up_voter() {
		let mut m = new_node(1, voters(&[1, 2]), 1);
		make_leader(&mut m, &[2]);

		// Not caught up yet
		let mut t = m.new_tick();
		assert_eq!(m.transfer_leadership(2, &mut t), Err(ChangeError::Busy));

		ae_success(&mut m, 2, 1);

		let mut t = m.new_tick();
		m.transfer_leadership(2, &mut t).unwrap();
		let sent = t.messages.iter().any(|msg| {
			msg.to == vec![2] && match msg.body {
				MessageBody::TimeoutNow(_) => true,
				_ => false
			}
		});
		assert!(sent);

		// The receiving side campaigns immediately
		let mut other = new_node(2, voters(&[1, 2]), 1);
		let mut t = other.new_tick();
		other.recv(1, MessageBody::TimeoutNow(TimeoutNow {}), &mut t).unwrap();
		assert_eq!(other.role(), Role::Candidate);
		assert_eq!(other.current_term(), 2);
	}

	#[test]
	fn recovery_adopts_newer_term_from_log() {
		let log = Arc::new(MemoryLogStorage::new());
		log.append(bootstrap_entry(voters(&[1, 2])));
		log.append(command_entry(2, 3, b"x"));
		log.flushed(2);

		let meta = Metadata { current_term: 1, voted_for: Some(2), commit_index: 1 };
		let snapshot = ConfigurationSnapshot { last_applied: 1, data: voters(&[1, 2]) };
		let m = ConsensusModule::new(1, meta, snapshot, log, 1, opts(1)).unwrap();

		assert_eq!(m.current_term(), 3);
		assert_eq!(m.meta().voted_for, None);
	}

	/// Drives a {1, 2 voting; 3 non-voting} leader through promotion rounds.
	/// Each round the log grows by one entry while the learner is made to
	/// finish the round slightly too slowly, forcing the next round
	struct PromotionHarness {
		m: ConsensusModule,
		events: Arc<Events>,
		/// Target of the current round
		target: LogIndex
	}

	impl PromotionHarness {
		/// Heartbeats are pushed far out so the in-flight bookkeeping below
		/// stays exactly one request per proposal
		fn start() -> PromotionHarness {
			let mut o = opts(1);
			o.election_timeout = 100;
			o.heartbeat_timeout = 10_000;

			let mut config = voters(&[1, 2]);
			config.add(3, "127.0.0.1:4003", false).unwrap();

			let mut m = new_node_with(1, config, 1, o);
			let events = Arc::new(Events::default());
			m.set_watcher(events.clone());

			m.tick(200);
			assert_eq!(m.role(), Role::Candidate);
			grant(&mut m, 2);
			assert_eq!(m.role(), Role::Leader);

			// Learner acks the initial heartbeat and becomes pipelined
			ae_success(&mut m, 3, 1);

			// One outstanding entry so the learner starts a round behind
			let mut t = m.new_tick();
			m.propose_command(Bytes::from(&b"pad"[..]), &mut t).unwrap();

			let mut t = m.new_tick();
			m.promote_server(3, &mut t).unwrap();

			PromotionHarness { m, events, target: 2 }
		}

		/// Lets the learner finish the current round after `elapsed` ms,
		/// with one more entry proposed in the meantime
		fn run_round(&mut self, elapsed: u64) {
			self.m.tick(elapsed);

			let mut t = self.m.new_tick();
			self.m.propose_command(Bytes::from(&b"pad"[..]), &mut t).unwrap();

			ae_success(&mut self.m, 3, self.target);
			self.target += 1;
		}
	}

	#[test]
	fn tenth_round_at_election_timeout_promotes() {
		let mut h = PromotionHarness::start();

		// Rounds 1 through 9 all complete too slowly
		for _ in 0..9 {
			h.run_round(101);
		}
		assert!(h.events.aborted.lock().unwrap().is_empty());

		// The 10th round completes at exactly the election timeout
		h.m.tick(100);
		let before = h.m.log().last_index();
		ae_success(&mut h.m, 3, before);

		assert!(h.events.aborted.lock().unwrap().is_empty());
		// The promotion appended a configuration entry making 3 a voter
		assert_eq!(h.m.log().last_index(), before + 1);
		assert!(h.m.config_snapshot().data.is_voter(3));
	}

	#[test]
	fn tenth_round_one_ms_late_aborts() {
		let mut h = PromotionHarness::start();

		for _ in 0..9 {
			h.run_round(101);
		}

		let before = h.m.log().last_index();
		h.m.tick(101);

		assert_eq!(*h.events.aborted.lock().unwrap(), vec![3]);
		assert_eq!(h.m.log().last_index(), before);
		assert!(!h.m.config_snapshot().data.is_voter(3));

		// The change slot is free again after the abort
		let mut t = h.m.new_tick();
		assert!(h.m.add_server(4, "127.0.0.1:4004", &mut t).is_ok());
	}

	#[test]
	fn promotion_aborts_after_total_time_ceiling() {
		let mut h = PromotionHarness::start();

		// The learner never catches up at all; 30 seconds in total is the cap
		h.m.tick(30_000);
		assert_eq!(*h.events.aborted.lock().unwrap(), vec![3]);
	}

	#[test]
	fn changes_blocked_while_promotion_runs() {
		let mut h = PromotionHarness::start();
		let mut t = h.m.new_tick();
		assert_eq!(h.m.add_server(4, "127.0.0.1:4004", &mut t), Err(ChangeError::Busy));
		assert_eq!(h.m.remove_server(2, &mut t), Err(ChangeError::Busy));
	}

	#[test]
	fn send_failure_resets_peer_to_probe() {
		let mut m = new_node(1, voters(&[1, 2]), 1);
		make_leader(&mut m, &[2]);
		ae_success(&mut m, 2, 1);

		let mut t = m.new_tick();
		m.propose_command(command(b"x"), &mut t).unwrap();
		assert_eq!(append_entries_sent(&t, 2).len(), 1);

		// The transport reports the send failed; the next heartbeat window
		// retries from scratch
		let mut t = m.new_tick();
		m.send_done(2, false, &mut t);

		let t = m.tick(150);
		let reqs = append_entries_sent(&t, 2);
		assert_eq!(reqs.len(), 1);
		assert_eq!(reqs[0].entries.len(), 1);
		assert_eq!(reqs[0].entries[0].index, 2);
	}

	#[test]
	fn failed_flush_surfaces_io_error() {
		let mut m = new_node(1, voters(&[1]), 1);
		m.tick(1);

		let mut t = m.new_tick();
		let prop = m.propose_command(command(b"x"), &mut t).unwrap();

		let mut t = m.new_tick();
		let err = m.log_flushed(false, prop, &mut t).unwrap_err();
		match err.kind() {
			ErrorKind::IoFailed => {},
			other => panic!("unexpected error: {:?}", other)
		}
		assert_eq!(m.commit_index(), 1);

		// A later successful retry still commits
		let mut t = m.new_tick();
		m.log_flushed(true, prop, &mut t).unwrap();
		assert_eq!(m.commit_index(), 2);
	}

	#[test]
	fn stale_replies_are_dropped() {
		let mut m = new_node(1, voters(&[1, 2]), 1);
		make_leader(&mut m, &[2]);
		ae_success(&mut m, 2, 1);

		// Nothing in flight anymore; a duplicate ack must change nothing
		let before_commit = m.commit_index();
		ae_success(&mut m, 2, 1);
		assert_eq!(m.commit_index(), before_commit);

		// A reply from a dead term is ignored outright
		let mut t = m.new_tick();
		m.recv(2, MessageBody::AppendEntriesResult(AppendEntriesResponse {
			term: 1,
			success: false,
			last_log_index: 0
		}), &mut t).unwrap();
		assert_eq!(m.role(), Role::Leader);
		assert!(append_entries_sent(&t, 2).is_empty());
	}

	#[test]
	fn install_snapshot_replaces_stale_log() {
		let mut m = new_node(1, voters(&[1, 2]), 1);

		let config = voters(&[1, 2]);
		let mut t = m.new_tick();
		m.recv(2, MessageBody::InstallSnapshot(InstallSnapshotRequest {
			term: 2,
			leader_id: 2,
			last_included_index: 10,
			last_included_term: 2,
			config: config.clone(),
			data: Bytes::new()
		}), &mut t).unwrap();

		assert!(t.snapshot.is_some());
		assert_eq!(m.log().first_index(), 11);
		assert_eq!(m.log().last_index(), 10);
		assert_eq!(m.log().term(10), Some(2));
		assert_eq!(m.commit_index(), 10);
		assert_eq!(m.last_applied(), 10);

		// Replication continues from the snapshot position
		let mut t = m.new_tick();
		m.recv(2, MessageBody::AppendEntries(AppendEntriesRequest {
			term: 2,
			leader_id: 2,
			prev_log_index: 10,
			prev_log_term: 2,
			entries: vec![command_entry(11, 2, b"x")],
			leader_commit: 10
		}), &mut t).unwrap();
		assert_eq!(m.log().last_index(), 11);
	}

	#[test]
	fn compacted_peer_is_offered_a_snapshot() {
		let mut m = new_node(1, voters(&[1, 2]), 1);
		make_leader(&mut m, &[2]);

		let mut t = m.new_tick();
		m.propose_command(command(b"x"), &mut t).unwrap();
		let mut t = m.new_tick();
		m.log_flushed(true, LogPosition { index: 2, term: 2 }, &mut t).unwrap();

		// Peer 2's needed entries get compacted away before it ever acked
		m.log().truncate_prefix(2, 2);

		// The outstanding probe fails; the retry must be a snapshot
		let mut t = m.new_tick();
		m.recv(2, MessageBody::AppendEntriesResult(AppendEntriesResponse {
			term: 2,
			success: false,
			last_log_index: 0
		}), &mut t).unwrap();

		let offered = t.messages.iter().find_map(|msg| match msg.body {
			MessageBody::InstallSnapshot(ref req) => Some(req.clone()),
			_ => None
		}).expect("no snapshot offered");
		assert_eq!(offered.last_included_index, 2);
		assert_eq!(offered.last_included_term, 2);

		// Its acknowledgement resumes normal replication past the snapshot
		let mut t = m.new_tick();
		m.recv(2, MessageBody::InstallSnapshotResult(InstallSnapshotResponse { term: 2 }), &mut t).unwrap();

		let mut t = m.new_tick();
		m.propose_command(command(b"y"), &mut t).unwrap();
		let reqs = append_entries_sent(&t, 2);
		assert_eq!(reqs.len(), 1);
		assert_eq!(reqs[0].prev_log_index, 2);
		assert_eq!(reqs[0].entries[0].index, 3);
	}

	#[test]
	fn noop_commits_silently() {
		let mut m = new_node(1, voters(&[1]), 1);
		m.log().append(command_entry(2, 1, b"old"));
		m.log().flushed(2);

		// commit_index (1) < last_log_index (2): the new leader must append
		// a noop of its own term to commit the older entry
		m.tick(1);
		assert_eq!(m.role(), Role::Leader);
		assert_eq!(m.log().last_index(), 3);
		assert!(m.log().entry(3).unwrap().data.is_noop());

		let mut t = m.new_tick();
		m.log_flushed(true, LogPosition { index: 3, term: 2 }, &mut t).unwrap();
		assert_eq!(m.commit_index(), 3);

		// Only the command is dispatched; the noop advances silently
		assert_eq!(t.apply.len(), 1);
		assert_eq!(t.apply[0].index, 2);
		m.applied(2);
		assert_eq!(m.last_applied(), 3);
	}
}
