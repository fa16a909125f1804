#![forbid(unsafe_code)]

//! Classifies inbound frames and fans normalized notifications out to the sinks.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use twitchsub_domain::{EventKind, Fields, Scalar};

use crate::eventsub::{self, EventSubFrame};
use crate::{Dispatcher, EventMeta, Recorder};

mod handlers;


/// Session-level signal produced by a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
	/// Nothing for the session manager to act on.
	None,
	Welcome {
		session_id: Option<String>,
		keepalive_timeout: Option<Duration>,
	},
	Keepalive,
	Reconnect {
		url: String,
	},
}

/// Normalized output of one extraction rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
	pub kind: EventKind,
	pub fields: Fields,
	/// Free-text fields that are sanitized before persistence.
	pub text_fields: &'static [&'static str],
}

impl Normalized {
	/// Copy of the fields with free text made safe for storage literals.
	pub fn persisted_fields(&self) -> Fields {
		let mut fields = self.fields.clone();
		for key in self.text_fields {
			if let Some(Scalar::Str(s)) = fields.get_mut(key) {
				*s = sanitize_text(s);
			}
		}
		fields
	}
}

/// Replace quotes and line breaks with spaces.
pub fn sanitize_text(text: &str) -> String {
	text.chars()
		.map(|c| match c {
			'"' | '\'' | '\n' | '\r' => ' ',
			other => other,
		})
		.collect()
}

/// Routes frames for one configured channel.
#[derive(Clone)]
pub struct NotificationRouter {
	channel_id: String,
	dispatcher: Arc<dyn Dispatcher>,
	recorder: Option<Arc<dyn Recorder>>,
}

impl NotificationRouter {
	pub fn new(channel_id: impl Into<String>, dispatcher: Arc<dyn Dispatcher>, recorder: Option<Arc<dyn Recorder>>) -> Self {
		Self {
			channel_id: channel_id.into(),
			dispatcher,
			recorder,
		}
	}

	pub(crate) fn recorder(&self) -> Option<&Arc<dyn Recorder>> {
		self.recorder.as_ref()
	}

	/// Route one text frame. Never fails; malformed input is logged and dropped.
	pub fn route(&self, raw: &str) -> Control {
		let frame = match eventsub::parse_frame(raw) {
			Ok(f) => f,
			Err(e) => {
				metrics::counter!("twitchsub_dropped_frames_total").increment(1);
				warn!(error = ?e, "dropping unparsable frame");
				return Control::None;
			}
		};

		match frame.metadata.message_type.as_str() {
			eventsub::MSG_SESSION_WELCOME => Self::welcome(frame),
			eventsub::MSG_SESSION_KEEPALIVE => {
				debug!("eventsub keepalive");
				Control::Keepalive
			}
			eventsub::MSG_SESSION_RECONNECT => Self::reconnect(frame),
			eventsub::MSG_NOTIFICATION => {
				self.notification(frame);
				Control::None
			}
			eventsub::MSG_REVOCATION => {
				warn!(
					subscription_type = frame.metadata.subscription_type.as_deref().unwrap_or("?"),
					"subscription revoked by server"
				);
				Control::None
			}
			other => {
				metrics::counter!("twitchsub_dropped_frames_total").increment(1);
				warn!(message_type = %other, "unknown message type; dropping");
				Control::None
			}
		}
	}

	fn welcome(frame: EventSubFrame) -> Control {
		match eventsub::session_from_payload(frame.payload) {
			Ok(session) => Control::Welcome {
				session_id: session.id.filter(|id| !id.trim().is_empty()),
				keepalive_timeout: session.keepalive_timeout_seconds.map(Duration::from_secs),
			},
			Err(e) => {
				warn!(error = ?e, "malformed session_welcome");
				Control::Welcome {
					session_id: None,
					keepalive_timeout: None,
				}
			}
		}
	}

	fn reconnect(frame: EventSubFrame) -> Control {
		match eventsub::session_from_payload(frame.payload) {
			Ok(session) => match session.reconnect_url.filter(|u| !u.trim().is_empty()) {
				Some(url) => {
					info!(%url, "server requested reconnect");
					Control::Reconnect { url }
				}
				None => {
					warn!("session_reconnect without reconnect_url; ignoring");
					Control::None
				}
			},
			Err(e) => {
				warn!(error = ?e, "malformed session_reconnect; ignoring");
				Control::None
			}
		}
	}

	fn notification(&self, frame: EventSubFrame) {
		let envelope = match eventsub::notification_from_frame(frame) {
			Ok(env) => env,
			Err(e) => {
				metrics::counter!("twitchsub_dropped_frames_total").increment(1);
				warn!(error = ?e, "malformed notification; dropping");
				return;
			}
		};

		let meta = EventMeta {
			subscription_id: envelope.subscription_id.clone(),
			message_id: envelope.message_id.clone(),
			timestamp: envelope.timestamp,
		};
		let subscription_id = &meta.subscription_id;
		match handlers::extract(envelope, &self.channel_id) {
			Ok(Some(n)) => {
				debug!(kind = %n.kind, %subscription_id, "notification routed");
				self.deliver(n, &meta);
			}
			Ok(None) => {
				metrics::counter!("twitchsub_dropped_frames_total").increment(1);
			}
			Err(e) => {
				metrics::counter!("twitchsub_dropped_frames_total").increment(1);
				warn!(error = ?e, %subscription_id, "failed to extract notification; dropping");
			}
		}
	}

	/// Hand a normalized notification to both sinks.
	///
	/// A failing or panicking sink does not block the other, and never unwinds into the caller.
	pub fn deliver(&self, n: Normalized, meta: &EventMeta) {
		metrics::counter!("twitchsub_notifications_total", "kind" => n.kind.as_str()).increment(1);

		if let Some(recorder) = &self.recorder {
			let fields = n.persisted_fields();
			if catch_unwind(AssertUnwindSafe(|| recorder.record(n.kind, &fields, meta))).is_err() {
				metrics::counter!("twitchsub_sink_errors_total").increment(1);
				error!(kind = %n.kind, message_id = %meta.message_id, "recorder panicked");
			}
		}

		match catch_unwind(AssertUnwindSafe(|| self.dispatcher.notify(n.kind, &n.fields))) {
			Ok(Ok(())) => {}
			Ok(Err(e)) => {
				metrics::counter!("twitchsub_sink_errors_total").increment(1);
				warn!(kind = %n.kind, error = ?e, "callback dispatch failed");
			}
			Err(_) => {
				metrics::counter!("twitchsub_sink_errors_total").increment(1);
				error!(kind = %n.kind, message_id = %meta.message_id, "callback panicked");
			}
		}
	}
}
