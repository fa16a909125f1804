#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers and requests from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown event kind: {0}")]
	UnknownEventKind(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Closed set of event kinds a client can subscribe to.
///
/// The snake-case name doubles as the callback signal name and the persistence record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	Message,
	Follow,
	Ban,
	Unban,
	Subscribe,
	SubscribeEnd,
	Subgift,
	ResubMessage,
	/// Incoming raid (someone raids the configured channel).
	Raid,
	/// Outgoing raid (the configured channel raids someone).
	RaidSomeone,
	ChannelPointAction,
	ChannelCheer,
	PollBegin,
	PollEnd,
	PredictionBegin,
	PredictionLock,
	PredictionEnd,
	VipAdd,
	VipRemove,
	StreamOnline,
	StreamOffline,
	Bits,
}

impl EventKind {
	pub const ALL: [EventKind; 22] = [
		EventKind::Message,
		EventKind::Follow,
		EventKind::Ban,
		EventKind::Unban,
		EventKind::Subscribe,
		EventKind::SubscribeEnd,
		EventKind::Subgift,
		EventKind::ResubMessage,
		EventKind::Raid,
		EventKind::RaidSomeone,
		EventKind::ChannelPointAction,
		EventKind::ChannelCheer,
		EventKind::PollBegin,
		EventKind::PollEnd,
		EventKind::PredictionBegin,
		EventKind::PredictionLock,
		EventKind::PredictionEnd,
		EventKind::VipAdd,
		EventKind::VipRemove,
		EventKind::StreamOnline,
		EventKind::StreamOffline,
		EventKind::Bits,
	];

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::Message => "message",
			EventKind::Follow => "follow",
			EventKind::Ban => "ban",
			EventKind::Unban => "unban",
			EventKind::Subscribe => "subscribe",
			EventKind::SubscribeEnd => "subscribe_end",
			EventKind::Subgift => "subgift",
			EventKind::ResubMessage => "resub_message",
			EventKind::Raid => "raid",
			EventKind::RaidSomeone => "raid_someone",
			EventKind::ChannelPointAction => "channel_point_action",
			EventKind::ChannelCheer => "channel_cheer",
			EventKind::PollBegin => "poll_begin",
			EventKind::PollEnd => "poll_end",
			EventKind::PredictionBegin => "prediction_begin",
			EventKind::PredictionLock => "prediction_lock",
			EventKind::PredictionEnd => "prediction_end",
			EventKind::VipAdd => "vip_add",
			EventKind::VipRemove => "vip_remove",
			EventKind::StreamOnline => "stream_online",
			EventKind::StreamOffline => "stream_offline",
			EventKind::Bits => "bits",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EventKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let lower = s.to_ascii_lowercase();
		EventKind::ALL
			.into_iter()
			.find(|k| k.as_str() == lower)
			.ok_or(ParseIdError::UnknownEventKind(lower))
	}
}

/// Platform user identifier (numeric string on Twitch).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// One desired event kind plus an optional narrowing parameter (e.g. a reward title).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionRequest {
	pub kind: EventKind,
	#[serde(default)]
	pub narrowing: Option<String>,
}

impl SubscriptionRequest {
	pub fn new(kind: EventKind) -> Self {
		Self { kind, narrowing: None }
	}

	pub fn narrowed(kind: EventKind, narrowing: impl Into<String>) -> Self {
		Self {
			kind,
			narrowing: Some(narrowing.into()),
		}
	}

	/// Parse `kind` or `kind:narrowing` (e.g. `channel_point_action:Hydrate`).
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.split_once(':') {
			Some((kind_s, narrowing)) => {
				let kind = EventKind::from_str(kind_s)?;
				let narrowing = narrowing.trim();
				if narrowing.is_empty() {
					return Err(ParseIdError::InvalidFormat("expected kind:narrowing".into()));
				}
				Ok(Self::narrowed(kind, narrowing))
			}
			None => Ok(Self::new(EventKind::from_str(s)?)),
		}
	}
}

impl fmt::Display for SubscriptionRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.narrowing {
			Some(n) => write!(f, "{}:{}", self.kind, n),
			None => f.write_str(self.kind.as_str()),
		}
	}
}

impl FromStr for SubscriptionRequest {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		SubscriptionRequest::parse(s)
	}
}

/// A single normalized field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
	Null,
	Bool(bool),
	Int(i64),
	Str(String),
}

impl Scalar {
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Scalar::Str(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_i64(&self) -> Option<i64> {
		match self {
			Scalar::Int(n) => Some(*n),
			_ => None,
		}
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Scalar::Bool(b) => Some(*b),
			_ => None,
		}
	}

	pub fn is_null(&self) -> bool {
		matches!(self, Scalar::Null)
	}
}

impl fmt::Display for Scalar {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Scalar::Null => f.write_str("null"),
			Scalar::Bool(b) => write!(f, "{b}"),
			Scalar::Int(n) => write!(f, "{n}"),
			Scalar::Str(s) => f.write_str(s),
		}
	}
}

impl From<&str> for Scalar {
	fn from(v: &str) -> Self {
		Scalar::Str(v.to_string())
	}
}

impl From<String> for Scalar {
	fn from(v: String) -> Self {
		Scalar::Str(v)
	}
}

impl From<bool> for Scalar {
	fn from(v: bool) -> Self {
		Scalar::Bool(v)
	}
}

impl From<i64> for Scalar {
	fn from(v: i64) -> Self {
		Scalar::Int(v)
	}
}

impl From<u64> for Scalar {
	fn from(v: u64) -> Self {
		Scalar::Int(i64::try_from(v).unwrap_or(i64::MAX))
	}
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
	fn from(v: Option<T>) -> Self {
		v.map(Into::into).unwrap_or(Scalar::Null)
	}
}

/// Flat map of named scalars produced for one notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fields(BTreeMap<String, Scalar>);

impl Fields {
	pub fn new() -> Self {
		Self::default()
	}

	/// Builder-style insert.
	pub fn with(mut self, key: &str, value: impl Into<Scalar>) -> Self {
		self.insert(key, value);
		self
	}

	pub fn insert(&mut self, key: &str, value: impl Into<Scalar>) {
		self.0.insert(key.to_string(), value.into());
	}

	pub fn get(&self, key: &str) -> Option<&Scalar> {
		self.0.get(key)
	}

	pub fn get_str(&self, key: &str) -> Option<&str> {
		self.get(key).and_then(Scalar::as_str)
	}

	pub fn get_mut(&mut self, key: &str) -> Option<&mut Scalar> {
		self.0.get_mut(key)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &Scalar)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v))
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Compact JSON object rendering, used by persistence backends.
	pub fn to_json(&self) -> serde_json::Result<String> {
		serde_json::to_string(&self.0)
	}
}
