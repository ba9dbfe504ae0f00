use super::log::LogStorage;
use super::protos::LogPosition;

/// Output of polling a constraint: either the wrapped value, released, or the
/// constraint handed back because its condition has not been met yet
pub enum ConstraintPoll<C, T> {
	Satisfied(T),
	Pending(C)
}

/// Wraps a value (typically an AppendEntries response) that must not leave
/// the server until the local log has durably matched the given position.
/// Acknowledging entries before they are fsynced would let a quorum be
/// counted on data that a crash could still lose
pub struct MatchConstraint<T> {
	inner: T,
	pos: Option<LogPosition>
}

impl<T> MatchConstraint<T> {
	pub fn new(inner: T, pos: LogPosition) -> Self {
		MatchConstraint { inner, pos: Some(pos) }
	}

	pub fn poll(self, log: &dyn LogStorage) -> ConstraintPoll<MatchConstraint<T>, T> {
		match self.pos {
			Some(pos) => {
				if log.match_index() >= pos.index {
					ConstraintPoll::Satisfied(self.inner)
				} else {
					ConstraintPoll::Pending(self)
				}
			},
			None => ConstraintPoll::Satisfied(self.inner)
		}
	}
}

/// An unconstrained value, releasable immediately
impl<T> From<T> for MatchConstraint<T> {
	fn from(inner: T) -> Self {
		MatchConstraint { inner, pos: None }
	}
}

/// Wrapper reminding the caller that the metadata must be made durable
/// before the contained response may be exposed. There is no way to verify
/// this generically, so it is a self-check rather than an enforcement
pub struct MustPersistMetadata<T> {
	inner: T
}

impl<T> MustPersistMetadata<T> {
	pub fn new(inner: T) -> Self {
		MustPersistMetadata { inner }
	}

	pub fn persisted(self) -> T {
		self.inner
	}
}
