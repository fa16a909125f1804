#![forbid(unsafe_code)]

//! EventSub WebSocket wire types.

use std::time::SystemTime;

use anyhow::Context;
use serde::Deserialize;

pub mod events;

pub const MSG_SESSION_WELCOME: &str = "session_welcome";
pub const MSG_SESSION_KEEPALIVE: &str = "session_keepalive";
pub const MSG_SESSION_RECONNECT: &str = "session_reconnect";
pub const MSG_NOTIFICATION: &str = "notification";
pub const MSG_REVOCATION: &str = "revocation";

/// EventSub metadata (present on all WebSocket messages).
#[allow(dead_code)]
#[derive(Debug, Deserialize)]
pub struct EventSubMetadata {
	#[serde(default)]
	pub message_id: String,
	pub message_type: String,
	#[serde(default)]
	pub message_timestamp: String,

	#[serde(default)]
	pub subscription_type: Option<String>,
	#[serde(default)]
	pub subscription_version: Option<String>,
}

/// Any inbound frame, with the payload left untyped until the message type is known.
#[derive(Debug, Deserialize)]
pub struct EventSubFrame {
	pub metadata: EventSubMetadata,
	#[serde(default)]
	pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct EventSubSessionPayload {
	pub session: EventSubSession,
}

/// `payload.session` of welcome and reconnect messages.
#[derive(Debug, Deserialize)]
pub struct EventSubSession {
	#[serde(default)]
	pub id: Option<String>,

	#[allow(dead_code)]
	#[serde(default)]
	pub status: Option<String>,
	#[allow(dead_code)]
	#[serde(default)]
	pub connected_at: Option<String>,

	#[serde(default)]
	pub keepalive_timeout_seconds: Option<u64>,

	#[serde(default)]
	pub reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventSubNotificationPayload {
	pub subscription: EventSubSubscription,
	#[serde(default)]
	pub event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct EventSubSubscription {
	pub id: String,

	#[allow(dead_code)]
	#[serde(default)]
	pub status: Option<String>,
	#[serde(rename = "type")]
	pub r#type: String,
	#[allow(dead_code)]
	#[serde(default)]
	pub version: Option<String>,
	#[allow(dead_code)]
	#[serde(default)]
	pub condition: serde_json::Value,
	#[allow(dead_code)]
	#[serde(default)]
	pub created_at: Option<String>,
}

/// One inbound notification, alive only while it is routed.
#[derive(Debug)]
pub struct NotificationEnvelope {
	/// Wire subscription type (e.g. `channel.follow`).
	pub wire_type: String,
	pub subscription_id: String,
	pub message_id: String,
	pub timestamp: Option<SystemTime>,
	pub event: serde_json::Value,
}

/// Parse any inbound text frame.
pub fn parse_frame(raw_json: &str) -> anyhow::Result<EventSubFrame> {
	serde_json::from_str(raw_json).context("parse EventSub frame")
}

/// Extract `payload.session` from a welcome or reconnect frame.
pub fn session_from_payload(payload: serde_json::Value) -> anyhow::Result<EventSubSession> {
	let p: EventSubSessionPayload = serde_json::from_value(payload).context("parse EventSub session payload")?;
	Ok(p.session)
}

/// Build a notification envelope from a `notification` frame.
pub fn notification_from_frame(frame: EventSubFrame) -> anyhow::Result<NotificationEnvelope> {
	let p: EventSubNotificationPayload =
		serde_json::from_value(frame.payload).context("parse EventSub notification payload")?;

	let timestamp = if frame.metadata.message_timestamp.is_empty() {
		None
	} else {
		parse_message_timestamp_system_time(&frame.metadata.message_timestamp).ok()
	};

	Ok(NotificationEnvelope {
		wire_type: p.subscription.r#type,
		subscription_id: p.subscription.id,
		message_id: frame.metadata.message_id,
		timestamp,
		event: p.event,
	})
}

/// Convert a `metadata.message_timestamp` RFC3339 timestamp into `SystemTime`.
///
/// EventSub timestamps are RFC3339 with fractional seconds and Zulu (UTC).
pub fn parse_message_timestamp_system_time(ts: &str) -> anyhow::Result<SystemTime> {
	let dt = chrono::DateTime::parse_from_rfc3339(ts).context("parse EventSub RFC3339 timestamp")?;
	Ok(SystemTime::from(dt.with_timezone(&chrono::Utc)))
}
