#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for the channel/member directory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
	#[error("empty value")]
	Empty,
	#[error("must be between 3 and 10 characters long")]
	BadLength,
	#[error("must only contain alphanumeric characters and underscores")]
	BadCharacter,
	#[error("invalid secret")]
	InvalidSecret,
	#[error("secret and nick do not match")]
	NickMismatch,
	#[error("this nick is already taken")]
	NickTaken,
}

fn validate_handle(s: &str) -> Result<(), ChannelError> {
	if s.is_empty() {
		return Err(ChannelError::Empty);
	}
	if s.len() < 3 || s.len() > 10 {
		return Err(ChannelError::BadLength);
	}
	if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
		return Err(ChannelError::BadCharacter);
	}
	Ok(())
}

/// Validated display nick: 3-10 characters, alphanumeric plus underscore.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nick(String);

impl Nick {
	pub fn new(s: impl Into<String>) -> Result<Self, ChannelError> {
		let s = s.into();
		validate_handle(&s)?;
		Ok(Self(s))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Nick {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Nick {
	type Err = ChannelError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Nick::new(s)
	}
}

/// Validated channel name, same rules as [`Nick`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
	pub fn new(s: impl Into<String>) -> Result<Self, ChannelError> {
		let s = s.into();
		validate_handle(&s)?;
		Ok(Self(s))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelName {
	type Err = ChannelError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelName::new(s)
	}
}

/// Stable member identity assigned at registration.
///
/// This is the identity records are stamped with and echo suppression keys
/// on; it never changes even if two members pick the same display nick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub uuid::Uuid);

impl MemberId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MemberId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Registered channel member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	pub id: MemberId,
	pub nick: Nick,
}

/// Private or public channel with its registered members.
///
/// Members are keyed by the per-member secret issued at registration; the
/// secret doubles as the join credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
	pub name: ChannelName,
	/// Channel-level secret; `None` for public channels.
	pub secret: Option<String>,
	members: HashMap<String, User>,
}

impl Channel {
	/// Create a channel; private channels get a channel secret.
	pub fn new(name: ChannelName, private: bool) -> Self {
		Self {
			name,
			secret: private.then(new_secret),
			members: HashMap::new(),
		}
	}

	/// Whether the channel requires a channel secret to register.
	pub fn is_private(&self) -> bool {
		self.secret.is_some()
	}

	pub fn member_count(&self) -> usize {
		self.members.len()
	}

	pub fn members(&self) -> impl Iterator<Item = &User> {
		self.members.values()
	}

	/// Attempt to join with a nick and the member secret issued at
	/// registration. Returns the registered user on success.
	pub fn join(&self, nick: &str, secret: &str) -> Result<User, ChannelError> {
		let user = self.members.get(secret).ok_or(ChannelError::InvalidSecret)?;

		if user.nick.as_str() != nick {
			return Err(ChannelError::NickMismatch);
		}

		Ok(user.clone())
	}

	/// Register a nick and return the member secret to be used for
	/// subsequent join requests.
	pub fn register(&mut self, nick: Nick) -> Result<String, ChannelError> {
		if self.members.values().any(|u| u.nick == nick) {
			return Err(ChannelError::NickTaken);
		}

		let secret = new_secret();
		self.members.insert(
			secret.clone(),
			User {
				id: MemberId::new_v4(),
				nick,
			},
		);

		Ok(secret)
	}
}

fn new_secret() -> String {
	uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn nick_validation() {
		assert!(Nick::new("joe_1").is_ok());
		assert_eq!(Nick::new("").unwrap_err(), ChannelError::Empty);
		assert_eq!(Nick::new("jo").unwrap_err(), ChannelError::BadLength);
		assert_eq!(Nick::new("a_very_long_nick").unwrap_err(), ChannelError::BadLength);
		assert_eq!(Nick::new("joe doe").unwrap_err(), ChannelError::BadCharacter);
	}

	#[test]
	fn register_then_join_roundtrip() {
		let mut ch = Channel::new(ChannelName::new("general").unwrap(), false);
		let secret = ch.register(Nick::new("john").unwrap()).unwrap();

		let user = ch.join("john", &secret).unwrap();
		assert_eq!(user.nick.as_str(), "john");
	}

	#[test]
	fn join_rejects_unknown_secret_and_mismatched_nick() {
		let mut ch = Channel::new(ChannelName::new("general").unwrap(), false);
		let secret = ch.register(Nick::new("john").unwrap()).unwrap();

		assert_eq!(ch.join("john", "nope").unwrap_err(), ChannelError::InvalidSecret);
		assert_eq!(ch.join("jane", &secret).unwrap_err(), ChannelError::NickMismatch);
	}

	#[test]
	fn register_rejects_taken_nick() {
		let mut ch = Channel::new(ChannelName::new("general").unwrap(), false);
		ch.register(Nick::new("john").unwrap()).unwrap();
		assert_eq!(
			ch.register(Nick::new("john").unwrap()).unwrap_err(),
			ChannelError::NickTaken
		);
	}

	#[test]
	fn members_get_distinct_stable_ids() {
		let mut ch = Channel::new(ChannelName::new("general").unwrap(), false);
		let s1 = ch.register(Nick::new("john").unwrap()).unwrap();
		let s2 = ch.register(Nick::new("jane").unwrap()).unwrap();

		let u1 = ch.join("john", &s1).unwrap();
		let u2 = ch.join("jane", &s2).unwrap();
		assert_ne!(u1.id, u2.id);

		// Join again; same identity.
		assert_eq!(ch.join("john", &s1).unwrap().id, u1.id);
	}

	#[test]
	fn private_channel_carries_a_secret() {
		let ch = Channel::new(ChannelName::new("ops").unwrap(), true);
		assert!(ch.is_private());
		assert!(!ch.secret.as_deref().unwrap_or_default().is_empty());

		let public = Channel::new(ChannelName::new("general").unwrap(), false);
		assert!(!public.is_private());
	}
}
