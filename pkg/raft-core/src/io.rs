use super::config::Configuration;
use super::config_state::{ConfigurationSnapshot, ConfigurationSnapshotRef};
use super::consensus::{ConsensusModule, Tick};
use super::errors::*;
use super::log::LogStorage;
use super::protos::*;
use super::state::Role;

/// Stable integer codes for surfacing failures across process and language
/// boundaries. The numeric values are part of the public contract and must
/// never be reassigned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
	Ok = 0,
	Shutdown = 1,
	IoError = 2,
	NotLeader = 3,
	LeadershipLost = 4,
	DuplicateId = 5,
	UnknownId = 6,
	BadState = 7,
	ConfigBusy = 8,
	Internal = 9
}

impl<'a> From<&'a Error> for ErrorCode {
	fn from(err: &'a Error) -> Self {
		match err.kind() {
			ErrorKind::Shutdown => ErrorCode::Shutdown,
			ErrorKind::IoFailed | ErrorKind::Io(_) => ErrorCode::IoError,
			_ => ErrorCode::Internal
		}
	}
}

/// Everything the storage layer recovered at startup
pub struct LoadedState {
	pub meta: Metadata,

	/// The newest durably persisted configuration snapshot
	pub config: ConfigurationSnapshot,

	/// Position immediately before the first recovered entry ((0, 0) unless
	/// the log has been compacted behind a snapshot)
	pub prev: LogPosition,

	pub entries: Vec<LogEntry>
}

/// The single place where blocking and asynchrony live. The consensus module
/// itself never touches a disk or a socket: a driver runs the module, hands
/// each produced `Tick` to `dispatch` below, and feeds completions back in
/// through `ConsensusModule::log_flushed` / `ConsensusModule::send_done`,
/// inbound messages through `ConsensusModule::recv` and elapsed time through
/// `ConsensusModule::tick`. All of those must be called from one logical
/// thread.
pub trait ServerIo {
	fn load(&self) -> Result<LoadedState>;

	/// Persists the very first log entry (the given configuration at index 1,
	/// term 1). Fails if any state was already persisted
	fn bootstrap(&self, config: &Configuration) -> Result<()>;

	/// Durable before returning
	fn set_term(&self, term: Term) -> Result<()>;

	/// Durable before returning
	fn set_vote(&self, voted_for: Option<ServerId>) -> Result<()>;

	/// Persists a newly commited configuration snapshot. Optional; the
	/// configuration can always be rebuilt from the log
	fn set_config(&self, config: ConfigurationSnapshotRef) -> Result<()> {
		let _ = config;
		Ok(())
	}

	/// Starts persisting the given entries. Completion (after fsync) is
	/// reported by calling `ConsensusModule::log_flushed`
	fn append(&self, entries: &[std::sync::Arc<LogEntry>]) -> Result<()>;

	/// Starts sending one message to one peer. A delivery failure or timeout
	/// is reported by calling `ConsensusModule::send_done`
	fn send(&self, to: ServerId, msg: &MessageBody) -> Result<()>;

	fn stop(&self) -> Result<()>;
}

/// Synchronous notifications of notable state changes. Implementations must
/// return quickly and must not call back into the consensus module
pub trait Watcher: Send + Sync {
	fn role_changed(&self, old: Role, new: Role) {
		let _ = (old, new);
	}

	fn committed(&self, index: LogIndex) {
		let _ = index;
	}

	fn promotion_aborted(&self, server_id: ServerId) {
		let _ = server_id;
	}
}

/// The log entry that `ServerIo::bootstrap` persists for a new cluster
pub fn bootstrap_entry(config: Configuration) -> LogEntry {
	LogEntry {
		index: 1,
		term: 1,
		data: LogEntryData::Config(config)
	}
}

/// Flushes the intents recorded in a tick out to the I/O layer.
///
/// Ordering matters and is part of the correctness argument: metadata (term
/// and vote) must be durable before any message produced in the same tick
/// leaves the process, otherwise a reboot could double-vote; log appends are
/// started next; messages go last. AppendEntries acknowledgements are not
/// affected by the append still being in flight because the module already
/// holds them back until `log_flushed` reports durability
pub fn dispatch(module: &ConsensusModule, tick: &Tick, io: &dyn ServerIo) -> Result<()> {
	if tick.meta {
		let meta = module.meta();
		io.set_term(meta.current_term)?;
		io.set_vote(meta.voted_for)?;
	}

	if tick.config {
		io.set_config(module.config_committed())?;
	}

	if tick.new_entries {
		let log = module.log();
		let mut entries = vec![];
		for i in (log.match_index() + 1)..=log.last_index() {
			if let Ok(e) = log.entry(i) {
				entries.push(e);
			}
		}

		if !entries.is_empty() {
			io.append(&entries)?;
		}
	}

	for msg in tick.messages.iter() {
		for to in msg.to.iter() {
			io.send(*to, &msg.body)?;
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::consensus::{ChangeError, ProposeError};

	#[test]
	fn error_codes_are_stable() {
		assert_eq!(ErrorCode::Ok as u8, 0);
		assert_eq!(ErrorCode::Shutdown as u8, 1);
		assert_eq!(ErrorCode::IoError as u8, 2);
		assert_eq!(ErrorCode::NotLeader as u8, 3);
		assert_eq!(ErrorCode::LeadershipLost as u8, 4);
		assert_eq!(ErrorCode::DuplicateId as u8, 5);
		assert_eq!(ErrorCode::UnknownId as u8, 6);
		assert_eq!(ErrorCode::BadState as u8, 7);
		assert_eq!(ErrorCode::ConfigBusy as u8, 8);
		assert_eq!(ErrorCode::Internal as u8, 9);
	}

	#[test]
	fn operation_errors_map_to_codes() {
		use crate::consensus::ProposalStatus;

		assert_eq!(ProposalStatus::Failed.code(), ErrorCode::LeadershipLost);
		assert_eq!(ProposalStatus::Commited.code(), ErrorCode::Ok);

		assert_eq!(ProposeError::Unavailable.code(), ErrorCode::Shutdown);
		assert_eq!(ProposeError::NotLeader { leader_hint: None }.code(), ErrorCode::NotLeader);

		assert_eq!(ChangeError::Busy.code(), ErrorCode::ConfigBusy);
		assert_eq!(ChangeError::DuplicateId(2).code(), ErrorCode::DuplicateId);
		assert_eq!(ChangeError::UnknownId(2).code(), ErrorCode::UnknownId);
		assert_eq!(ChangeError::BadState.code(), ErrorCode::BadState);

		let err: Error = ErrorKind::Shutdown.into();
		assert_eq!(ErrorCode::from(&err), ErrorCode::Shutdown);
		let err: Error = ErrorKind::IoFailed.into();
		assert_eq!(ErrorCode::from(&err), ErrorCode::IoError);
	}

	#[test]
	fn bootstrap_entry_sits_at_index_one() {
		let config = Configuration::bootstrap(1, "127.0.0.1:4001");
		let e = bootstrap_entry(config.clone());
		assert_eq!(e.index, 1);
		assert_eq!(e.term, 1);
		assert_eq!(e.data, LogEntryData::Config(config));
	}
}
