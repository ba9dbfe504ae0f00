use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use super::config::Configuration;
use super::errors::*;
use super::protos::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLookupError {
	/// The index is beyond the end of the log
	OutOfRange,

	/// The index was dropped by a prefix truncation; the caller should fall
	/// back to the snapshot covering it
	Compacted
}

/// Read/append access to the replicated log of a single server.
///
/// Implementations are internally synchronized: the consensus module holds
/// the log behind an Arc and appends through a shared reference. Appending
/// only enqueues in memory; durability is reported separately through
/// `flushed`, and `match_index` is the watermark of what has actually been
/// persisted so far.
pub trait LogStorage {
	/// Index of the first entry physically present. Everything below it (if
	/// anything) lives only in a snapshot
	fn first_index(&self) -> LogIndex;

	/// Index of the last entry ever appended (0 for a brand new log)
	fn last_index(&self) -> LogIndex;

	fn last_term(&self) -> Term;

	/// Term of the entry at the given index. This also answers for index 0
	/// (term 0) and for the position immediately before first_index using the
	/// snapshot's last included term. Returns None for anything else outside
	/// the physical log
	fn term(&self, index: LogIndex) -> Option<Term>;

	fn entry(&self, index: LogIndex) -> std::result::Result<Arc<LogEntry>, LogLookupError>;

	fn append(&self, entry: LogEntry);

	/// Appends many entries at once. The entries typically share one backing
	/// buffer produced by `decode_batch`; the buffer stays alive until every
	/// entry referencing it has been dropped again
	fn append_batch(&self, entries: Vec<LogEntry>);

	/// Discards the entry at the given index and everything after it.
	/// Truncating into the compacted prefix is an error
	fn truncate_suffix(&self, from_index: LogIndex) -> std::result::Result<(), LogLookupError>;

	/// Discards every entry at or below the given index after its data has
	/// been captured in a snapshot. The position is remembered so that `term`
	/// keeps answering for it
	fn truncate_prefix(&self, up_to_index: LogIndex, up_to_term: Term);

	/// Highest index known to be durable on local storage
	fn match_index(&self) -> LogIndex;

	/// Delivery of an asynchronous append completion: everything at or below
	/// the given index has been fsynced
	fn flushed(&self, index: LogIndex);
}

struct MemoryLogInner {
	/// Position just before the first entry in `entries`: (0, 0) for a fresh
	/// log, or the snapshot's last included position after compaction
	prev: LogPosition,

	entries: VecDeque<Arc<LogEntry>>,

	/// Durability watermark
	flushed: LogIndex
}

/// Log kept entirely in memory. Serves as the canonical in-process
/// representation; a durable implementation wraps this with actual file I/O
pub struct MemoryLogStorage {
	inner: Mutex<MemoryLogInner>
}

impl MemoryLogStorage {
	pub fn new() -> Self {
		MemoryLogStorage {
			inner: Mutex::new(MemoryLogInner {
				prev: LogPosition { index: 0, term: 0 },
				entries: VecDeque::new(),
				flushed: 0
			})
		}
	}

	/// Restores a log from previously persisted state
	pub fn from_entries(prev: LogPosition, entries: Vec<LogEntry>) -> Self {
		let last = entries.last().map(|e| e.index).unwrap_or(prev.index);

		MemoryLogStorage {
			inner: Mutex::new(MemoryLogInner {
				prev,
				entries: entries.into_iter().map(Arc::new).collect(),
				// Anything loaded from storage was by definition already durable
				flushed: last
			})
		}
	}
}

impl MemoryLogInner {
	fn last_index(&self) -> LogIndex {
		self.prev.index + (self.entries.len() as u64)
	}

	fn slot(&self, index: LogIndex) -> Option<usize> {
		if index <= self.prev.index || index > self.last_index() {
			return None;
		}

		Some((index - self.prev.index - 1) as usize)
	}
}

impl LogStorage for MemoryLogStorage {
	fn first_index(&self) -> LogIndex {
		self.inner.lock().unwrap().prev.index + 1
	}

	fn last_index(&self) -> LogIndex {
		self.inner.lock().unwrap().last_index()
	}

	fn last_term(&self) -> Term {
		let inner = self.inner.lock().unwrap();
		inner.entries.back().map(|e| e.term).unwrap_or(inner.prev.term)
	}

	fn term(&self, index: LogIndex) -> Option<Term> {
		let inner = self.inner.lock().unwrap();

		if index == inner.prev.index {
			return Some(inner.prev.term);
		}

		inner.slot(index).map(|i| inner.entries[i].term)
	}

	fn entry(&self, index: LogIndex) -> std::result::Result<Arc<LogEntry>, LogLookupError> {
		let inner = self.inner.lock().unwrap();

		match inner.slot(index) {
			Some(i) => Ok(inner.entries[i].clone()),
			None => {
				if index <= inner.prev.index {
					Err(LogLookupError::Compacted)
				} else {
					Err(LogLookupError::OutOfRange)
				}
			}
		}
	}

	fn append(&self, entry: LogEntry) {
		let mut inner = self.inner.lock().unwrap();
		debug_assert_eq!(entry.index, inner.last_index() + 1);
		inner.entries.push_back(Arc::new(entry));
	}

	fn append_batch(&self, entries: Vec<LogEntry>) {
		let mut inner = self.inner.lock().unwrap();
		for entry in entries {
			debug_assert_eq!(entry.index, inner.last_index() + 1);
			inner.entries.push_back(Arc::new(entry));
		}
	}

	fn truncate_suffix(&self, from_index: LogIndex) -> std::result::Result<(), LogLookupError> {
		let mut inner = self.inner.lock().unwrap();

		if from_index <= inner.prev.index {
			return Err(LogLookupError::Compacted);
		}

		while inner.last_index() >= from_index {
			// Dropping the Arc releases this entry's view of any shared batch
			// buffer; the buffer itself dies with its last view
			inner.entries.pop_back();
		}

		if inner.flushed >= from_index {
			inner.flushed = from_index - 1;
		}

		Ok(())
	}

	fn truncate_prefix(&self, up_to_index: LogIndex, up_to_term: Term) {
		let mut inner = self.inner.lock().unwrap();

		if up_to_index <= inner.prev.index {
			return;
		}

		while let Some(front) = inner.entries.front() {
			if front.index > up_to_index {
				break;
			}
			inner.entries.pop_front();
		}

		inner.prev = LogPosition { index: up_to_index, term: up_to_term };

		if inner.flushed < up_to_index {
			inner.flushed = up_to_index;
		}
	}

	fn match_index(&self) -> LogIndex {
		self.inner.lock().unwrap().flushed
	}

	fn flushed(&self, index: LogIndex) {
		let mut inner = self.inner.lock().unwrap();
		let capped = std::cmp::min(index, inner.last_index());
		if capped > inner.flushed {
			inner.flushed = capped;
		}
	}
}

const ENTRY_KIND_COMMAND: u8 = 0;
const ENTRY_KIND_CONFIG: u8 = 1;
const ENTRY_KIND_NOOP: u8 = 2;

/// Serializes consecutive entries into one buffer: a u64 count, then per
/// entry { u64 term, u8 kind, u8 reserved, u32 payload length }, then the
/// payload blobs back to back. All integers little-endian
pub fn encode_batch(entries: &[LogEntry]) -> Bytes {
	// Configurations need a serialization pass of their own before their
	// lengths are known
	let encoded_configs: Vec<Option<Vec<u8>>> = entries.iter()
		.map(|e| match e.data {
			LogEntryData::Config(ref config) => Some(config.encode()),
			_ => None
		})
		.collect();

	let mut out = vec![];
	out.write_u64::<LittleEndian>(entries.len() as u64).unwrap();

	for (e, config) in entries.iter().zip(encoded_configs.iter()) {
		let (kind, payload_len) = match e.data {
			LogEntryData::Command(ref data) => (ENTRY_KIND_COMMAND, data.len()),
			LogEntryData::Config(_) => (ENTRY_KIND_CONFIG, config.as_ref().unwrap().len()),
			LogEntryData::Noop => (ENTRY_KIND_NOOP, 0)
		};

		out.write_u64::<LittleEndian>(e.term).unwrap();
		out.write_u8(kind).unwrap();
		out.write_u8(0).unwrap();
		out.write_u32::<LittleEndian>(payload_len as u32).unwrap();
	}

	for (e, config) in entries.iter().zip(encoded_configs.iter()) {
		match e.data {
			LogEntryData::Command(ref data) => out.extend_from_slice(data),
			LogEntryData::Config(_) => out.extend_from_slice(config.as_ref().unwrap()),
			LogEntryData::Noop => {}
		}
	}

	out.into()
}

/// Inverse of `encode_batch`. Command payloads are zero-copy views into the
/// given buffer: the buffer is reference counted and outlives the decoded
/// entries for exactly as long as any of them is retained
pub fn decode_batch(first_index: LogIndex, data: Bytes) -> Result<Vec<LogEntry>> {
	let mut c = Cursor::new(&data[..]);

	let n = c.read_u64::<LittleEndian>()? as usize;

	let mut headers = Vec::with_capacity(n);
	for _ in 0..n {
		let term = c.read_u64::<LittleEndian>()?;
		let kind = c.read_u8()?;
		let _reserved = c.read_u8()?;
		let payload_len = c.read_u32::<LittleEndian>()? as usize;
		headers.push((term, kind, payload_len));
	}

	let mut offset = c.position() as usize;
	let mut entries = Vec::with_capacity(n);

	for (i, (term, kind, payload_len)) in headers.into_iter().enumerate() {
		let end = offset.checked_add(payload_len)
			.ok_or_else(|| Error::from(ErrorKind::Internal("batch payload length overflow".into())))?;
		if end > data.len() {
			bail!(ErrorKind::Internal("batch payload extends past the buffer".into()));
		}

		let entry_data = match kind {
			ENTRY_KIND_COMMAND => LogEntryData::Command(data.slice(offset, end)),
			ENTRY_KIND_CONFIG => {
				let config = Configuration::decode(&data[offset..end])
					.map_err(|e| Error::from(ErrorKind::Internal(format!("bad configuration in batch: {:?}", e))))?;
				LogEntryData::Config(config)
			},
			ENTRY_KIND_NOOP => {
				if payload_len != 0 {
					bail!(ErrorKind::Internal("noop entry with a payload".into()));
				}
				LogEntryData::Noop
			},
			_ => bail!(ErrorKind::Internal(format!("unknown entry kind {}", kind)))
		};

		entries.push(LogEntry {
			index: first_index + (i as u64),
			term,
			data: entry_data
		});

		offset = end;
	}

	if offset != data.len() {
		bail!(ErrorKind::Internal("trailing bytes after batch payloads".into()));
	}

	Ok(entries)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn command(index: LogIndex, term: Term, data: &[u8]) -> LogEntry {
		LogEntry { index, term, data: LogEntryData::Command(Bytes::from(data.to_vec())) }
	}

	#[test]
	fn empty_log_boundaries() {
		let log = MemoryLogStorage::new();
		assert_eq!(log.first_index(), 1);
		assert_eq!(log.last_index(), 0);
		assert_eq!(log.last_term(), 0);
		assert_eq!(log.term(0), Some(0));
		assert_eq!(log.entry(1), Err(LogLookupError::OutOfRange));
	}

	#[test]
	fn append_and_lookup() {
		let log = MemoryLogStorage::new();
		log.append(command(1, 1, b"a"));
		log.append(command(2, 1, b"b"));
		log.append(command(3, 2, b"c"));

		assert_eq!(log.last_index(), 3);
		assert_eq!(log.last_term(), 2);
		assert_eq!(log.term(2), Some(1));
		assert_eq!(log.entry(2).unwrap().data, LogEntryData::Command(Bytes::from(&b"b"[..])));
	}

	#[test]
	fn truncate_suffix_drops_tail_and_watermark() {
		let log = MemoryLogStorage::new();
		log.append(command(1, 1, b"a"));
		log.append(command(2, 1, b"b"));
		log.append(command(3, 1, b"c"));
		log.flushed(3);

		log.truncate_suffix(2).unwrap();
		assert_eq!(log.last_index(), 1);
		assert_eq!(log.match_index(), 1);
		assert_eq!(log.entry(2), Err(LogLookupError::OutOfRange));

		// Truncating at the (new) end is a no-op
		log.truncate_suffix(5).unwrap();
		assert_eq!(log.last_index(), 1);
	}

	#[test]
	fn truncate_prefix_compacts() {
		let log = MemoryLogStorage::new();
		for i in 1..=4 {
			log.append(command(i, 1, b"x"));
		}
		log.flushed(4);

		log.truncate_prefix(2, 1);

		assert_eq!(log.first_index(), 3);
		assert_eq!(log.last_index(), 4);
		// The snapshot boundary still answers term queries
		assert_eq!(log.term(2), Some(1));
		assert_eq!(log.term(1), None);
		assert_eq!(log.entry(2), Err(LogLookupError::Compacted));
		assert_eq!(log.truncate_suffix(2), Err(LogLookupError::Compacted));
	}

	#[test]
	fn batch_round_trip_shares_buffer() {
		let entries = vec![
			command(5, 3, b"hello"),
			LogEntry { index: 6, term: 3, data: LogEntryData::Noop },
			LogEntry { index: 7, term: 3, data: LogEntryData::Config(Configuration::bootstrap(1, "a")) },
			command(8, 4, b"world")
		];

		let buf = encode_batch(&entries);
		let decoded = decode_batch(5, buf).unwrap();
		assert_eq!(decoded, entries);

		// The decoded command payloads stay valid after the original handle
		// to the buffer is gone
		let payload = match decoded[0].data {
			LogEntryData::Command(ref b) => b.clone(),
			_ => panic!()
		};
		drop(decoded);
		assert_eq!(&payload[..], b"hello");
	}

	#[test]
	fn append_batch_keeps_indices_consecutive() {
		let log = MemoryLogStorage::new();
		log.append(command(1, 1, b"a"));

		let buf = encode_batch(&[command(2, 1, b"b"), command(3, 1, b"c")]);
		let batch = decode_batch(2, buf).unwrap();
		log.append_batch(batch);

		assert_eq!(log.last_index(), 3);
		assert_eq!(log.entry(3).unwrap().data, LogEntryData::Command(Bytes::from(&b"c"[..])));
	}

	#[test]
	fn batch_decode_rejects_truncated_buffer() {
		let entries = vec![command(1, 1, b"hello")];
		let buf = encode_batch(&entries);
		let short = buf.slice(0, buf.len() - 1);
		assert!(decode_batch(1, short).is_err());
	}
}
