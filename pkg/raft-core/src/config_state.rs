use super::config::Configuration;
use super::protos::{LogEntry, LogEntryData, LogIndex};

/// A configuration value at a single point in the log
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConfigurationSnapshot {
	/// Index of the log entry this configuration came from (0 for an empty
	/// pre-bootstrap configuration)
	pub last_applied: LogIndex,

	pub data: Configuration
}

impl Default for ConfigurationSnapshot {
	fn default() -> Self {
		ConfigurationSnapshot {
			last_applied: 0,
			data: Configuration::default()
		}
	}
}

/// Borrowed form of a ConfigurationSnapshot, mainly useful for persisting the
/// current value without cloning it
#[derive(Serialize, Debug, PartialEq)]
pub struct ConfigurationSnapshotRef<'a> {
	pub last_applied: LogIndex,
	pub data: &'a Configuration
}

/// One configuration entry that is in the log but not yet known to be
/// commited, remembering everything needed to undo it
#[derive(Debug)]
struct PendingConfiguration {
	/// Index of the configuration entry itself
	index: LogIndex,

	prev_value: Configuration,
	prev_last_applied: LogIndex
}

/// Tracks the active cluster configuration as the log evolves.
///
/// A configuration entry takes effect as soon as it is appended, not when it
/// commits. Because uncommited suffixes may later be truncated by a new
/// leader, every not-yet-commited configuration keeps the value it replaced
/// so that a truncation can roll the active value back.
pub struct ConfigurationStateMachine {
	/// The currently effective configuration
	pub value: Configuration,

	/// Index of the entry that produced `value`
	pub last_applied: LogIndex,

	/// Uncommited configuration entries, oldest first. With one-at-a-time
	/// membership changes this holds at most one element on a leader, but a
	/// follower replaying a suffix may briefly hold more
	pending: Vec<PendingConfiguration>
}

impl From<ConfigurationSnapshot> for ConfigurationStateMachine {
	fn from(snapshot: ConfigurationSnapshot) -> Self {
		ConfigurationStateMachine {
			value: snapshot.data,
			last_applied: snapshot.last_applied,
			pending: vec![]
		}
	}
}

impl ConfigurationStateMachine {
	/// Activates the configuration carried by the given entry (a no-op for
	/// other entry kinds). Entries at or below the commit index need no
	/// rollback record
	pub fn apply(&mut self, entry: &LogEntry, commit_index: LogIndex) {
		let next = match entry.data {
			LogEntryData::Config(ref c) => c,
			_ => return
		};

		if entry.index <= self.last_applied {
			// Already incorporated (e.g. during startup replay)
			return;
		}

		if entry.index > commit_index {
			self.pending.push(PendingConfiguration {
				index: entry.index,
				prev_value: self.value.clone(),
				prev_last_applied: self.last_applied
			});
		}

		self.value = next.clone();
		self.last_applied = entry.index;
	}

	/// Rolls back every configuration introduced at or after the given index.
	/// Must be called before the corresponding log suffix is truncated
	pub fn revert(&mut self, from_index: LogIndex) {
		while let Some(last) = self.pending.pop() {
			if last.index < from_index {
				self.pending.push(last);
				break;
			}

			self.value = last.prev_value;
			self.last_applied = last.prev_last_applied;
		}
	}

	/// Discharges rollback records made obsolete by the commit index
	/// advancing. Returns true if a newly commited configuration is now
	/// available for persisting
	pub fn commit(&mut self, commit_index: LogIndex) -> bool {
		let n = self.pending.iter().take_while(|p| p.index <= commit_index).count();
		if n == 0 {
			return false;
		}

		self.pending.drain(..n);
		true
	}

	/// Index of the oldest configuration entry still awaiting commit, if any
	pub fn pending(&self) -> Option<LogIndex> {
		self.pending.first().map(|p| p.index)
	}

	/// The currently effective configuration (which may not be commited yet)
	pub fn snapshot(&self) -> ConfigurationSnapshotRef {
		ConfigurationSnapshotRef {
			last_applied: self.last_applied,
			data: &self.value
		}
	}

	/// The most recent configuration known to be commited
	pub fn committed(&self) -> ConfigurationSnapshotRef {
		match self.pending.first() {
			Some(p) => ConfigurationSnapshotRef {
				last_applied: p.prev_last_applied,
				data: &p.prev_value
			},
			None => self.snapshot()
		}
	}
}
