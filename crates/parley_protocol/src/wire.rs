#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::Record;

/// Client/session frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
	Chat,
	History,
	Error,
	Info,
	HistoryRequest,
}

/// One wire envelope; exactly one per transport frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
	#[serde(rename = "type")]
	pub kind: FrameType,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<serde_json::Value>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum WireError {
	#[error("missing frame data")]
	MissingData,
	#[error("invalid frame data: {0}")]
	InvalidData(#[from] serde_json::Error),
}

impl Frame {
	pub fn chat(record: &Record) -> Self {
		Self {
			kind: FrameType::Chat,
			data: serde_json::to_value(record).ok(),
			error: None,
		}
	}

	pub fn history(records: &[Record]) -> Self {
		Self {
			kind: FrameType::History,
			data: serde_json::to_value(records).ok(),
			error: None,
		}
	}

	pub fn error(message: impl Into<String>) -> Self {
		Self {
			kind: FrameType::Error,
			data: None,
			error: Some(message.into()),
		}
	}

	pub fn info(message: impl Into<String>) -> Self {
		Self {
			kind: FrameType::Info,
			data: serde_json::to_value(message.into()).ok(),
			error: None,
		}
	}

	/// Decode the `data` payload into a typed value.
	pub fn decode_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, WireError> {
		let data = self.data.clone().ok_or(WireError::MissingData)?;
		Ok(serde_json::from_value(data)?)
	}
}

/// Client -> server chat payload; `from`, `time` and `seq` are stamped
/// server-side regardless of what the client sends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatSend {
	#[serde(default)]
	pub text: String,

	#[serde(default)]
	pub meta: BTreeMap<String, String>,
}

/// Client -> server bounded replay request: records with `seq < to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
	pub to: u64,
}

/// First client frame on a fresh connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
	#[serde(default)]
	pub channel: String,

	#[serde(default)]
	pub nick: String,

	/// Member secret issued at registration.
	#[serde(default)]
	pub secret: String,

	/// Resume point; skips the catch-up push when present.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_seq: Option<u64>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
	#[error("join fail: channel, nick and secret are required")]
	MissingField,
}

impl HandshakeRequest {
	pub fn validate(&self) -> Result<(), HandshakeError> {
		if self.channel.is_empty() || self.nick.is_empty() || self.secret.is_empty() {
			return Err(HandshakeError::MissingField);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn frame_type_tags_are_snake_case() {
		let f = Frame::error("boom");
		let v = serde_json::to_value(&f).unwrap();
		assert_eq!(v["type"], "error");
		assert_eq!(v["error"], "boom");
		assert!(v.get("data").is_none());

		let f: Frame = serde_json::from_value(serde_json::json!({
			"type": "history_request",
			"data": { "to": 5 },
		}))
		.unwrap();
		assert_eq!(f.kind, FrameType::HistoryRequest);
		assert_eq!(f.decode_data::<HistoryRequest>().unwrap().to, 5);
	}

	#[test]
	fn chat_frame_roundtrips_record() {
		let rec = Record {
			text: "hello".to_string(),
			from: "m-1".to_string(),
			seq: 3,
			..Record::default()
		};

		let f = Frame::chat(&rec);
		assert_eq!(f.kind, FrameType::Chat);
		assert_eq!(f.decode_data::<Record>().unwrap(), rec);
	}

	#[test]
	fn decode_data_requires_payload() {
		let f = Frame::error("nope");
		assert!(matches!(f.decode_data::<Record>(), Err(WireError::MissingData)));
	}

	#[test]
	fn handshake_validation() {
		let ok = HandshakeRequest {
			channel: "general".into(),
			nick: "john".into(),
			secret: "s3cret".into(),
			last_seq: None,
		};
		assert!(ok.validate().is_ok());

		let missing = HandshakeRequest {
			channel: "general".into(),
			..HandshakeRequest::default()
		};
		assert_eq!(missing.validate().unwrap_err(), HandshakeError::MissingField);
	}

	#[test]
	fn client_supplied_seq_is_carried_but_ignored_shape() {
		// The envelope itself does not strip fields; stamping is the
		// session's job. This only pins the parse shape.
		let send: ChatSend = serde_json::from_str(r#"{"text":"yo","seq":9,"from":"evil"}"#).unwrap();
		assert_eq!(send.text, "yo");
		assert!(send.meta.is_empty());
	}
}
