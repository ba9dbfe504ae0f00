use rmp_serde as rmps;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::errors::*;

/// Serializes a message (or any other wire type) to MessagePack. Transports
/// are free to use their own framing instead; this is merely the default
pub fn marshal<T: Serialize>(obj: &T) -> Result<Vec<u8>> {
	rmps::to_vec(obj).chain_err(|| "failed to serialize message")
}

pub fn unmarshal<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
	rmps::from_slice(data).chain_err(|| "failed to deserialize message")
}
