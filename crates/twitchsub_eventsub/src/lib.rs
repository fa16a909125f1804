#![forbid(unsafe_code)]

use core::fmt;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use twitchsub_domain::{EventKind, Fields};

pub mod catalog;
pub mod eventsub;
pub mod helix;
pub mod rate_limit;
pub mod router;
pub mod session;

pub use catalog::{CatalogEntry, Condition, ConditionShape, required_scopes};
pub use helix::{AuthGateway, EndpointError, HelixGateway, RefreshingGateway, TokenRefresher, TokenStore, UserTokenRefresher};
pub use rate_limit::RateLimiter;
pub use router::{Control, NotificationRouter};
pub use session::{
	AttemptOutcome, ConnectionState, SessionError, SessionHandle, SessionManager, StopOutcome, SubscriptionAttempt,
	TwitchConfig, WsConnector,
};

/// Callback sink: receives the original (unsanitized) field set for every routed notification.
pub trait Dispatcher: Send + Sync {
	fn notify(&self, kind: EventKind, fields: &Fields) -> anyhow::Result<()>;
}

/// Delivery metadata of one notification frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMeta {
	pub subscription_id: String,
	pub message_id: String,
	/// Server `message_timestamp`, if present and parseable.
	pub timestamp: Option<SystemTime>,
}

/// Persistence sink: receives the sanitized field set. Implementations log their own failures.
pub trait Recorder: Send + Sync {
	fn record(&self, kind: EventKind, fields: &Fields, meta: &EventMeta);

	/// Called once when the owning session manager exits.
	fn close(&self) {}
}

type Callback = Box<dyn Fn(&Fields) -> anyhow::Result<()> + Send + Sync>;

/// Per-kind callback table.
#[derive(Default)]
pub struct CallbackDispatcher {
	callbacks: HashMap<EventKind, Vec<Callback>>,
}

impl CallbackDispatcher {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a callback for one event kind. Several callbacks per kind run in registration order.
	pub fn on<F>(mut self, kind: EventKind, f: F) -> Self
	where
		F: Fn(&Fields) -> anyhow::Result<()> + Send + Sync + 'static,
	{
		self.callbacks.entry(kind).or_default().push(Box::new(f));
		self
	}

	pub fn has_callbacks(&self, kind: EventKind) -> bool {
		self.callbacks.get(&kind).is_some_and(|v| !v.is_empty())
	}
}

impl fmt::Debug for CallbackDispatcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut kinds: Vec<_> = self.callbacks.keys().map(|k| k.as_str()).collect();
		kinds.sort_unstable();
		f.debug_struct("CallbackDispatcher").field("kinds", &kinds).finish()
	}
}

impl Dispatcher for CallbackDispatcher {
	fn notify(&self, kind: EventKind, fields: &Fields) -> anyhow::Result<()> {
		let Some(callbacks) = self.callbacks.get(&kind) else {
			return Ok(());
		};

		let mut first_err = None;
		for cb in callbacks {
			if let Err(e) = cb(fields)
				&& first_err.is_none()
			{
				first_err = Some(e);
			}
		}

		match first_err {
			Some(e) => Err(e.context(format!("callback for {kind} failed"))),
			None => Ok(()),
		}
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Cooperative stop signal shared by the session worker and its waits.
///
/// Dropping the sending side counts as a stop request.
#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

/// Create a connected stop sender/signal pair.
pub fn stop_channel() -> (watch::Sender<bool>, StopSignal) {
	let (tx, rx) = watch::channel(false);
	(tx, StopSignal(rx))
}

impl StopSignal {
	pub fn is_stopped(&self) -> bool {
		*self.0.borrow() || self.0.has_changed().is_err()
	}

	/// Resolves once a stop was requested.
	pub async fn stopped(&mut self) {
		let _ = self.0.wait_for(|stop| *stop).await;
	}

	/// Sleep for `d` unless stopped first. Returns `false` when interrupted.
	pub async fn sleep(&mut self, d: Duration) -> bool {
		if self.is_stopped() {
			return false;
		}

		tokio::select! {
			_ = tokio::time::sleep(d) => true,
			_ = self.stopped() => false,
		}
	}
}

/// Generate a new run id for log correlation.
pub fn new_run_id() -> String {
	uuid::Uuid::new_v4().to_string()
}
