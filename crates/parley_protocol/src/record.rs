#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel text substituted for records that fail to decode on a live
/// delivery path.
pub const UNAVAILABLE_TEXT: &str = "message unavailable: decoding error";

/// Meta key carrying the author's display nick.
pub const META_NICK: &str = "nick";

#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("record decode error: {0}")]
	Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum EncodeError {
	#[error("record encode error: {0}")]
	Json(#[from] serde_json::Error),
}

/// A single chat record as stored in the log and relayed on the wire.
///
/// `seq` is assigned exclusively by the ordered log at publish time; any
/// client-supplied value is ignored and overwritten server-side, as are
/// `from` and `time`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
	#[serde(default)]
	pub meta: BTreeMap<String, String>,

	/// Publish time, unix milliseconds.
	#[serde(default)]
	pub time: i64,

	#[serde(default)]
	pub seq: u64,

	#[serde(default)]
	pub text: String,

	/// Stable author identity (member id), not the display nick.
	#[serde(default)]
	pub from: String,
}

impl Record {
	/// Placeholder for an undecodable payload at `seq`; delivery keeps
	/// advancing with this in place of the lost record.
	pub fn unavailable(seq: u64) -> Self {
		Self {
			seq,
			text: UNAVAILABLE_TEXT.to_string(),
			..Self::default()
		}
	}

	/// Display nick carried in record meta, if any.
	pub fn nick(&self) -> Option<&str> {
		self.meta.get(META_NICK).map(String::as_str)
	}
}

/// Serialize a record for log storage and transport.
pub fn encode_record(record: &Record) -> Result<Bytes, EncodeError> {
	Ok(Bytes::from(serde_json::to_vec(record)?))
}

/// Deserialize a record from its storage/transport encoding.
pub fn decode_record(payload: &[u8]) -> Result<Record, DecodeError> {
	Ok(serde_json::from_slice(payload)?)
}
