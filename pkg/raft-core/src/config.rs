use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::protos::ServerId;

/// Version byte prepended to every encoded configuration. Bump only on
/// incompatible layout changes
const ENCODING_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
	/// The referenced id is already present in the configuration
	DuplicateId(ServerId),

	/// The referenced id is not present in the configuration
	UnknownId(ServerId),

	/// The edit would leave the configuration without any voting members (or
	/// the input itself is malformed, e.g. a zero id)
	Invalid,

	/// An encoded configuration could not be decoded
	Corrupt
}

/// A single server as known to the rest of the cluster
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerDescriptor {
	pub id: ServerId,

	/// Opaque address string interpreted only by the transport
	pub addr: String,

	/// Whether this server counts towards quorums and may vote in elections.
	/// Non-voting servers still receive all log entries
	pub voting: bool
}

/// The ordered set of servers making up the cluster as of a single log index.
/// Entries of kind Config store a complete value of this type, so activating
/// or rolling back a membership change never requires replaying deltas
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Configuration {
	pub servers: Vec<ServerDescriptor>
}

impl Configuration {
	/// Creates the configuration of a brand new single-server cluster
	pub fn bootstrap(id: ServerId, addr: &str) -> Configuration {
		Configuration {
			servers: vec![ServerDescriptor { id, addr: addr.into(), voting: true }]
		}
	}

	pub fn add(&mut self, id: ServerId, addr: &str, voting: bool) -> Result<(), ConfigError> {
		if id == 0 {
			return Err(ConfigError::Invalid);
		}

		if self.get(id).is_some() {
			return Err(ConfigError::DuplicateId(id));
		}

		self.servers.push(ServerDescriptor { id, addr: addr.into(), voting });
		Ok(())
	}

	pub fn remove(&mut self, id: ServerId) -> Result<(), ConfigError> {
		let i = match self.index_of(id) {
			Some(i) => i,
			None => return Err(ConfigError::UnknownId(id))
		};

		let removed = self.servers.remove(i);

		if self.n_voting() == 0 {
			// Never allow editing away the entire voting set
			self.servers.insert(i, removed);
			return Err(ConfigError::Invalid);
		}

		Ok(())
	}

	/// Marks an existing server as a full voting member
	pub fn promote(&mut self, id: ServerId) -> Result<(), ConfigError> {
		match self.index_of(id) {
			Some(i) => {
				self.servers[i].voting = true;
				Ok(())
			},
			None => Err(ConfigError::UnknownId(id))
		}
	}

	pub fn index_of(&self, id: ServerId) -> Option<usize> {
		self.servers.iter().position(|s| s.id == id)
	}

	pub fn get(&self, id: ServerId) -> Option<&ServerDescriptor> {
		self.servers.iter().find(|s| s.id == id)
	}

	pub fn is_voter(&self, id: ServerId) -> bool {
		self.get(id).map(|s| s.voting).unwrap_or(false)
	}

	pub fn n_voting(&self) -> usize {
		self.servers.iter().filter(|s| s.voting).count()
	}

	/// Number of votes required for elections and for commiting entries: a
	/// strict majority of the voting members
	pub fn quorum(&self) -> usize {
		(self.n_voting() / 2) + 1
	}

	pub fn len(&self) -> usize {
		self.servers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.servers.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &ServerDescriptor> {
		self.servers.iter()
	}

	pub fn voters(&self) -> impl Iterator<Item = &ServerDescriptor> {
		self.servers.iter().filter(|s| s.voting)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		for (i, s) in self.servers.iter().enumerate() {
			if s.id == 0 {
				return Err(ConfigError::Invalid);
			}

			if self.servers[..i].iter().any(|o| o.id == s.id) {
				return Err(ConfigError::DuplicateId(s.id));
			}
		}

		if self.n_voting() == 0 {
			return Err(ConfigError::Invalid);
		}

		Ok(())
	}

	/// Serializes to the stable little-endian layout used both on disk and in
	/// InstallSnapshot messages: a version byte, a u64 count, then per server
	/// { u64 id, u32 address length, address bytes, u8 voting }
	pub fn encode(&self) -> Vec<u8> {
		let mut out = vec![];
		out.write_u8(ENCODING_VERSION).unwrap();
		out.write_u64::<LittleEndian>(self.servers.len() as u64).unwrap();

		for s in self.servers.iter() {
			out.write_u64::<LittleEndian>(s.id).unwrap();
			out.write_u32::<LittleEndian>(s.addr.len() as u32).unwrap();
			out.extend_from_slice(s.addr.as_bytes());
			out.write_u8(if s.voting { 1 } else { 0 }).unwrap();
		}

		out
	}

	pub fn decode(data: &[u8]) -> Result<Configuration, ConfigError> {
		let mut c = Cursor::new(data);

		let version = c.read_u8().map_err(|_| ConfigError::Corrupt)?;
		if version != ENCODING_VERSION {
			return Err(ConfigError::Corrupt);
		}

		let n = c.read_u64::<LittleEndian>().map_err(|_| ConfigError::Corrupt)?;

		let mut servers = vec![];
		for _ in 0..n {
			let id = c.read_u64::<LittleEndian>().map_err(|_| ConfigError::Corrupt)?;
			let addr_len = c.read_u32::<LittleEndian>().map_err(|_| ConfigError::Corrupt)? as usize;

			let start = c.position() as usize;
			let end = start.checked_add(addr_len).ok_or(ConfigError::Corrupt)?;
			if end > data.len() {
				return Err(ConfigError::Corrupt);
			}

			let addr = std::str::from_utf8(&data[start..end])
				.map_err(|_| ConfigError::Corrupt)?
				.to_owned();
			c.set_position(end as u64);

			let voting = match c.read_u8().map_err(|_| ConfigError::Corrupt)? {
				0 => false,
				1 => true,
				_ => return Err(ConfigError::Corrupt)
			};

			servers.push(ServerDescriptor { id, addr, voting });
		}

		if (c.position() as usize) != data.len() {
			// Trailing garbage means we mis-parsed or the buffer is damaged
			return Err(ConfigError::Corrupt);
		}

		let config = Configuration { servers };
		config.validate()?;
		Ok(config)
	}
}
