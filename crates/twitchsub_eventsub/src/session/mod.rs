#![forbid(unsafe_code)]

//! EventSub session lifecycle: connect, welcome, subscribe, listen, reconnect.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, anyhow};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};
use twitchsub_domain::{EventKind, SubscriptionRequest, UserId};
use url::Url;

use crate::helix::{self, AuthGateway, EndpointError, HelixCustomReward};
use crate::rate_limit::RateLimiter;
use crate::router::{Control, NotificationRouter};
use crate::{Dispatcher, Recorder, StopSignal, catalog, new_run_id, stop_channel};

#[cfg(test)]
mod tests;

pub const DEFAULT_EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

/// WebSocket close code Twitch uses for policy violations (often rate limiting).
const CLOSE_POLICY_VIOLATION: u16 = 1008;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type EventSubWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<EventSubWs>> + Send + Sync>;

/// Session manager configuration.
#[derive(Clone)]
pub struct TwitchConfig {
	/// Channel (broadcaster) the subscriptions target.
	pub channel_id: String,
	/// Identity the access token belongs to.
	pub user_id: String,
	pub subscriptions: Vec<SubscriptionRequest>,
	pub eventsub_ws_url: String,
	/// Consecutive failures tolerated per counter before giving up.
	pub max_retries: u32,
	pub connect_poll_interval: Duration,
	pub subscribe_poll_interval: Duration,
	pub inter_subscription_delay: Duration,
	pub error_backoff_base: Duration,
	pub error_backoff_max: Duration,
	pub welcome_timeout: Duration,
	pub keepalive_grace: Duration,
	pub stop_join_timeout: Duration,
	pub ws_connector: Option<WsConnector>,
}

impl TwitchConfig {
	pub fn new(channel_id: impl Into<String>, user_id: impl Into<String>, subscriptions: Vec<SubscriptionRequest>) -> Self {
		Self {
			channel_id: channel_id.into(),
			user_id: user_id.into(),
			subscriptions,
			eventsub_ws_url: DEFAULT_EVENTSUB_WS_URL.to_string(),
			max_retries: 3,
			connect_poll_interval: Duration::from_secs(30),
			subscribe_poll_interval: Duration::from_secs(2),
			inter_subscription_delay: Duration::from_secs(2),
			error_backoff_base: Duration::from_secs(10),
			error_backoff_max: Duration::from_secs(120),
			welcome_timeout: Duration::from_secs(10),
			keepalive_grace: Duration::from_secs(5),
			stop_join_timeout: Duration::from_secs(10),
			ws_connector: None,
		}
	}
}

impl fmt::Debug for TwitchConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TwitchConfig")
			.field("channel_id", &self.channel_id)
			.field("user_id", &self.user_id)
			.field("subscriptions", &self.subscriptions)
			.field("eventsub_ws_url", &self.eventsub_ws_url)
			.field("max_retries", &self.max_retries)
			.field("ws_connector", &self.ws_connector.as_ref().map(|_| "<custom>"))
			.finish_non_exhaustive()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	AwaitingWelcome,
	Subscribing,
	Live,
	Closing,
	BackingOff,
	Stopped,
	Failed,
	FailedToStop,
}

impl ConnectionState {
	pub const fn as_str(self) -> &'static str {
		match self {
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Connecting => "connecting",
			ConnectionState::AwaitingWelcome => "awaiting_welcome",
			ConnectionState::Subscribing => "subscribing",
			ConnectionState::Live => "live",
			ConnectionState::Closing => "closing",
			ConnectionState::BackingOff => "backing_off",
			ConnectionState::Stopped => "stopped",
			ConnectionState::Failed => "failed",
			ConnectionState::FailedToStop => "failed_to_stop",
		}
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Terminal failures surfaced to the caller.
#[derive(Debug, Error)]
pub enum SessionError {
	#[error("configuration error: {0}")]
	Config(String),
	#[error("{kind} requires broadcaster authorization but token user {user_id} is not channel {channel_id}")]
	BroadcasterOnly {
		kind: EventKind,
		user_id: String,
		channel_id: String,
	},
	#[error("still rate limited after {attempts} consecutive 429 responses")]
	RateLimitExhausted { attempts: u32 },
	#[error("giving up after {attempts} consecutive failures: {last_error}")]
	RetriesExhausted { attempts: u32, last_error: String },
	#[error("session worker failed: {0}")]
	Worker(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
	Pending,
	Confirmed { subscription_id: Option<String> },
	Failed { reason: String },
}

/// One subscription registration against one session.
#[derive(Debug, Clone)]
pub struct SubscriptionAttempt {
	pub request: SubscriptionRequest,
	pub reward_id: Option<String>,
	pub session_id: String,
	pub outcome: AttemptOutcome,
	pub attempted_at: SystemTime,
}

#[derive(Debug)]
struct Status {
	state: ConnectionState,
	session_id: Option<String>,
	attempts: Vec<SubscriptionAttempt>,
}

#[derive(Debug)]
struct Shared {
	status: Mutex<Status>,
}

impl Shared {
	fn new() -> Self {
		Self {
			status: Mutex::new(Status {
				state: ConnectionState::Disconnected,
				session_id: None,
				attempts: Vec::new(),
			}),
		}
	}

	fn set_state(&self, next: ConnectionState) {
		let mut status = self.status.lock();
		if status.state != next {
			debug!(from = %status.state, to = %next, "session state");
			status.state = next;
		}
	}

	fn state(&self) -> ConnectionState {
		self.status.lock().state
	}

	fn set_session(&self, session_id: Option<String>) {
		self.status.lock().session_id = session_id;
	}

	fn push_attempt(&self, attempt: SubscriptionAttempt) -> usize {
		let mut status = self.status.lock();
		status.attempts.push(attempt);
		status.attempts.len() - 1
	}

	fn resolve_attempt(&self, idx: usize, outcome: AttemptOutcome) {
		if let Some(a) = self.status.lock().attempts.get_mut(idx) {
			a.outcome = outcome;
		}
	}
}

enum ConnectionEnd {
	Stopped,
	Reconnect(String),
	Closed,
}

enum AttemptError {
	RateLimited(anyhow::Error),
	Transient(anyhow::Error),
}

fn classify(err: anyhow::Error) -> AttemptError {
	if let Some(e) = err.downcast_ref::<EndpointError>()
		&& e.is_rate_limited()
	{
		return AttemptError::RateLimited(err);
	}

	let s = format!("{err:#}").to_ascii_lowercase();
	if s.contains("429") || s.contains("too many requests") {
		AttemptError::RateLimited(err)
	} else {
		AttemptError::Transient(err)
	}
}

#[derive(Debug, Default)]
struct RetryCounters {
	rate_limited: u32,
	errors: u32,
}

fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}

struct PlannedSubscription {
	request: SubscriptionRequest,
	reward_id: Option<String>,
}

/// Owns the EventSub connection for one channel.
pub struct SessionManager {
	cfg: TwitchConfig,
	gateway: Arc<dyn AuthGateway>,
	limiter: Arc<RateLimiter>,
	router: NotificationRouter,
	shared: Arc<Shared>,
	run_id: String,
}

impl SessionManager {
	pub fn new(
		cfg: TwitchConfig,
		gateway: Arc<dyn AuthGateway>,
		dispatcher: Arc<dyn Dispatcher>,
		recorder: Option<Arc<dyn Recorder>>,
	) -> Result<Self, SessionError> {
		let channel_id = UserId::new(cfg.channel_id.clone()).map_err(|e| SessionError::Config(format!("channel_id: {e}")))?;
		let user_id = UserId::new(cfg.user_id.clone()).map_err(|e| SessionError::Config(format!("user_id: {e}")))?;

		if cfg.subscriptions.is_empty() {
			return Err(SessionError::Config("no subscriptions requested".to_string()));
		}

		Url::parse(&cfg.eventsub_ws_url)
			.map_err(|e| SessionError::Config(format!("invalid eventsub_ws_url {}: {e}", cfg.eventsub_ws_url)))?;

		if let Some(req) = cfg
			.subscriptions
			.iter()
			.find(|r| catalog::entry(r.kind).broadcaster_only && user_id != channel_id)
		{
			return Err(SessionError::BroadcasterOnly {
				kind: req.kind,
				user_id: user_id.into_string(),
				channel_id: channel_id.into_string(),
			});
		}

		let router = NotificationRouter::new(channel_id.into_string(), dispatcher, recorder);

		Ok(Self {
			cfg,
			gateway,
			limiter: Arc::new(RateLimiter::new()),
			router,
			shared: Arc::new(Shared::new()),
			run_id: new_run_id(),
		})
	}

	/// Spawn the worker task.
	pub fn start(self) -> SessionHandle {
		let (stop_tx, stop) = stop_channel();
		let shared = Arc::clone(&self.shared);
		let limiter = Arc::clone(&self.limiter);
		let join_timeout = self.cfg.stop_join_timeout;
		let join = tokio::spawn(self.run(stop));

		SessionHandle {
			stop_tx,
			join: Some(join),
			shared,
			limiter,
			join_timeout,
		}
	}

	/// Run until stopped or a terminal error occurs.
	pub async fn run(self, mut stop: StopSignal) -> Result<(), SessionError> {
		info!(
			run_id = %self.run_id,
			channel_id = %self.cfg.channel_id,
			subscriptions = self.cfg.subscriptions.len(),
			"eventsub session manager starting"
		);

		let res = self.run_loop(&mut stop).await;
		self.shared.set_session(None);

		match &res {
			Ok(()) => {
				self.shared.set_state(ConnectionState::Stopped);
				info!(run_id = %self.run_id, "eventsub session manager stopped");
			}
			Err(e) => {
				self.shared.set_state(ConnectionState::Failed);
				error!(run_id = %self.run_id, error = %e, "eventsub session manager failed");
			}
		}

		if let Some(recorder) = self.router.recorder() {
			recorder.close();
		}

		res
	}

	async fn run_loop(&self, stop: &mut StopSignal) -> Result<(), SessionError> {
		let mut url = self.cfg.eventsub_ws_url.clone();
		let mut retries = RetryCounters::default();

		loop {
			if stop.is_stopped() {
				return Ok(());
			}

			if self.limiter.backoff_remaining().is_some() {
				self.shared.set_state(ConnectionState::BackingOff);
				if !self.limiter.wait_if_backing_off(stop).await {
					return Ok(());
				}
			}

			if !self.limiter.can_connect() {
				self.shared.set_state(ConnectionState::Disconnected);
				info!(
					poll_secs = self.cfg.connect_poll_interval.as_secs_f64(),
					"connection rate limit reached; waiting"
				);
				if !stop.sleep(self.cfg.connect_poll_interval).await {
					return Ok(());
				}
				continue;
			}

			match self.connect_once(&url, stop, &mut retries).await {
				Ok(ConnectionEnd::Stopped) => return Ok(()),
				Ok(ConnectionEnd::Reconnect(next)) => {
					info!(url = %next, "following server reconnect url");
					url = next;
				}
				Ok(ConnectionEnd::Closed) => {
					self.shared.set_state(ConnectionState::Disconnected);
					url = self.cfg.eventsub_ws_url.clone();
				}
				Err(AttemptError::RateLimited(e)) => {
					url = self.cfg.eventsub_ws_url.clone();
					retries.rate_limited = retries.rate_limited.saturating_add(1);
					if retries.rate_limited > self.cfg.max_retries {
						return Err(SessionError::RateLimitExhausted {
							attempts: retries.rate_limited,
						});
					}

					warn!(error = %format!("{e:#}"), attempt = retries.rate_limited, "rate limited by server");
					self.shared.set_state(ConnectionState::BackingOff);
					self.limiter.enter_backoff(retries.rate_limited - 1);
				}
				Err(AttemptError::Transient(e)) => {
					url = self.cfg.eventsub_ws_url.clone();
					retries.errors = retries.errors.saturating_add(1);
					if retries.errors > self.cfg.max_retries {
						return Err(SessionError::RetriesExhausted {
							attempts: retries.errors,
							last_error: format!("{e:#}"),
						});
					}

					let delay = backoff_delay(retries.errors - 1, self.cfg.error_backoff_base, self.cfg.error_backoff_max);
					warn!(
						error = %format!("{e:#}"),
						attempt = retries.errors,
						delay_secs = delay.as_secs_f64(),
						"eventsub connection failed; retrying"
					);
					self.shared.set_state(ConnectionState::Disconnected);
					if !stop.sleep(delay).await {
						return Ok(());
					}
				}
			}
		}
	}

	fn connector(&self) -> WsConnector {
		if let Some(c) = &self.cfg.ws_connector {
			return Arc::clone(c);
		}

		Arc::new(|url: Url| Box::pin(connect_eventsub_ws(url)) as BoxFuture<'static, anyhow::Result<EventSubWs>>)
	}

	async fn connect_once(
		&self,
		url: &str,
		stop: &mut StopSignal,
		retries: &mut RetryCounters,
	) -> Result<ConnectionEnd, AttemptError> {
		self.shared.set_state(ConnectionState::Connecting);
		let ws_url = Url::parse(url)
			.with_context(|| format!("invalid eventsub ws url: {url}"))
			.map_err(AttemptError::Transient)?;

		self.limiter.record_connection_attempt();
		metrics::counter!("twitchsub_connect_attempts_total").increment(1);
		self.shared.set_state(ConnectionState::AwaitingWelcome);
		info!(url = %ws_url, "connecting to eventsub");

		let connector = self.connector();
		let mut ws = tokio::select! {
			r = connector(ws_url) => r.map_err(classify)?,
			_ = stop.stopped() => return Ok(ConnectionEnd::Stopped),
		};

		let welcome = tokio::select! {
			r = tokio::time::timeout(self.cfg.welcome_timeout, self.read_until_welcome(&mut ws)) => match r {
				Ok(Ok(w)) => w,
				Ok(Err(e)) => {
					let _ = ws.close(None).await;
					return Err(e);
				}
				Err(_) => {
					let _ = ws.close(None).await;
					return Err(AttemptError::Transient(anyhow!("timed out waiting for session_welcome")));
				}
			},
			_ = stop.stopped() => {
				let _ = ws.close(None).await;
				return Ok(ConnectionEnd::Stopped);
			}
		};

		let (session_id, keepalive) = welcome;
		info!(%session_id, keepalive_secs = keepalive.as_secs(), "eventsub session established");
		self.shared.set_session(Some(session_id.clone()));
		self.shared.set_state(ConnectionState::Subscribing);

		self.listen(ws, session_id, keepalive, stop, retries).await
	}

	async fn read_until_welcome(&self, ws: &mut EventSubWs) -> Result<(String, Duration), AttemptError> {
		loop {
			let Some(msg) = ws.next().await else {
				return Err(AttemptError::Transient(anyhow!("ws closed before welcome")));
			};
			let msg = msg.context("ws read").map_err(classify)?;

			match msg {
				Message::Text(t) => match self.router.route(&t) {
					Control::Welcome {
						session_id: Some(id),
						keepalive_timeout,
					} => return Ok((id, keepalive_timeout.unwrap_or(Duration::from_secs(10)))),
					Control::Welcome { session_id: None, .. } => {
						return Err(AttemptError::Transient(anyhow!("session_welcome without session id")));
					}
					other => debug!(?other, "ignoring frame before welcome"),
				},
				Message::Ping(p) => {
					if let Err(e) = ws.send(Message::Pong(p)).await {
						debug!(error = %e, "failed to answer ping before welcome");
					}
				}
				Message::Close(c) => {
					return Err(classify(anyhow!("ws closed before welcome: close={c:?}")));
				}
				_ => {}
			}
		}
	}

	async fn listen(
		&self,
		mut ws: EventSubWs,
		session_id: String,
		keepalive: Duration,
		stop: &mut StopSignal,
		retries: &mut RetryCounters,
	) -> Result<ConnectionEnd, AttemptError> {
		let subscribing = self.subscribe_all(&session_id, stop.clone());
		tokio::pin!(subscribing);
		let mut subscribing_done = false;

		let watchdog_window = keepalive + self.cfg.keepalive_grace;
		let mut last_frame = Instant::now();
		let mut keepalive_warned = false;

		let end = loop {
			tokio::select! {
				res = &mut subscribing, if !subscribing_done => {
					subscribing_done = true;
					match res {
						Ok(confirmed) => {
							// Only a completed subscribe phase counts as recovery.
							*retries = RetryCounters::default();
							self.limiter.clear_backoff();
							self.shared.set_state(ConnectionState::Live);
							info!(%session_id, confirmed, requested = self.cfg.subscriptions.len(), "eventsub session live");
						}
						Err(e) => break Err(e),
					}
				}

				msg = ws.next() => {
					let Some(msg) = msg else {
						info!(%session_id, "eventsub ws ended");
						break Ok(ConnectionEnd::Closed);
					};

					let msg = match msg {
						Ok(m) => m,
						Err(e) => break Err(classify(anyhow::Error::new(e).context("eventsub ws read error"))),
					};

					last_frame = Instant::now();
					keepalive_warned = false;

					match msg {
						Message::Text(t) => match self.router.route(&t) {
							Control::Reconnect { url } => break Ok(ConnectionEnd::Reconnect(url)),
							Control::Welcome { .. } => debug!(%session_id, "ignoring welcome on established session"),
							Control::Keepalive | Control::None => {}
						},
						Message::Ping(p) => {
							if let Err(e) = ws.send(Message::Pong(p)).await {
								debug!(%session_id, error = %e, "failed to answer ping");
							}
						}
						Message::Close(frame) => {
							if frame.as_ref().is_some_and(|f| u16::from(f.code) == CLOSE_POLICY_VIOLATION) {
								warn!(%session_id, ?frame, "eventsub closed for policy violation (likely rate limit)");
							} else {
								info!(%session_id, ?frame, "eventsub ws closed by server");
							}
							break Ok(ConnectionEnd::Closed);
						}
						_ => {}
					}
				}

				_ = tokio::time::sleep_until(last_frame + watchdog_window), if !keepalive_warned => {
					keepalive_warned = true;
					warn!(
						%session_id,
						silent_secs = last_frame.elapsed().as_secs(),
						"no eventsub traffic within keepalive window"
					);
				}

				_ = stop.stopped() => break Ok(ConnectionEnd::Stopped),
			}
		};

		self.shared.set_state(ConnectionState::Closing);
		let _ = ws.close(None).await;
		self.shared.set_session(None);
		end
	}

	/// Subscribe every configured request against `session_id`, in order. Returns the confirmed count.
	async fn subscribe_all(&self, session_id: &str, mut stop: StopSignal) -> Result<usize, AttemptError> {
		self.shared.status.lock().attempts.clear();

		let plan = self.plan_subscriptions(session_id).await?;
		let total = plan.len();
		let mut confirmed = 0usize;

		for (i, item) in plan.into_iter().enumerate() {
			if !self.wait_for_subscribe_slot(&mut stop).await {
				return Ok(confirmed);
			}

			let entry = catalog::entry(item.request.kind);
			let condition = entry
				.condition
				.build(&self.cfg.channel_id, &self.cfg.user_id, item.reward_id.as_deref());

			self.limiter.record_subscription_attempt();
			let idx = self.shared.push_attempt(SubscriptionAttempt {
				request: item.request.clone(),
				reward_id: item.reward_id.clone(),
				session_id: session_id.to_string(),
				outcome: AttemptOutcome::Pending,
				attempted_at: SystemTime::now(),
			});

			match helix::create_eventsub_subscription(self.gateway.as_ref(), entry, condition, session_id).await {
				Ok(resp) => {
					confirmed += 1;
					metrics::counter!("twitchsub_subscriptions_total").increment(1);
					let subscription_id = resp.data.first().map(|d| d.id.clone());
					info!(request = %item.request, subscription_id = ?subscription_id, "subscribed");
					self.shared
						.resolve_attempt(idx, AttemptOutcome::Confirmed { subscription_id });
				}
				Err(e) => {
					metrics::counter!("twitchsub_subscription_failures_total").increment(1);
					self.shared.resolve_attempt(
						idx,
						AttemptOutcome::Failed {
							reason: e.to_string(),
						},
					);

					if e.is_rate_limited() {
						return Err(AttemptError::RateLimited(
							anyhow::Error::new(e).context(format!("subscribe {}", item.request)),
						));
					}
					if e.is_unauthorized() || matches!(e, EndpointError::Refresh(_)) {
						return Err(AttemptError::Transient(
							anyhow::Error::new(e).context(format!("subscribe {}", item.request)),
						));
					}

					warn!(request = %item.request, error = %e, "subscription failed; skipping");
				}
			}

			if i + 1 < total && !stop.sleep(self.cfg.inter_subscription_delay).await {
				break;
			}
		}

		Ok(confirmed)
	}

	/// Expand requests into concrete subscriptions, resolving reward titles to ids.
	async fn plan_subscriptions(&self, session_id: &str) -> Result<Vec<PlannedSubscription>, AttemptError> {
		let mut plan = Vec::with_capacity(self.cfg.subscriptions.len());
		let mut rewards: Option<Result<Vec<HelixCustomReward>, String>> = None;

		for request in &self.cfg.subscriptions {
			let (EventKind::ChannelPointAction, Some(name)) = (request.kind, request.narrowing.as_deref()) else {
				plan.push(PlannedSubscription {
					request: request.clone(),
					reward_id: None,
				});
				continue;
			};

			if rewards.is_none() {
				let fetched = match helix::get_custom_rewards(self.gateway.as_ref(), &self.cfg.channel_id).await {
					Ok(list) => {
						if list.is_empty() {
							warn!(channel_id = %self.cfg.channel_id, "no custom rewards found for channel");
						}
						Ok(list)
					}
					Err(e) if e.is_rate_limited() => {
						return Err(AttemptError::RateLimited(
							anyhow::Error::new(e).context("list custom rewards"),
						));
					}
					Err(e) => {
						error!(error = %e, "failed to list custom rewards");
						Err(e.to_string())
					}
				};
				rewards = Some(fetched);
			}

			let wanted = helix::normalize_reward_title(name);
			let found = match &rewards {
				Some(Ok(list)) => list
					.iter()
					.find(|r| helix::normalize_reward_title(&r.title) == wanted)
					.map(|r| Ok(r.id.clone()))
					.unwrap_or_else(|| Err(format!("custom reward {name:?} not found"))),
				Some(Err(e)) => Err(format!("reward lookup failed: {e}")),
				None => Err("reward lookup skipped".to_string()),
			};

			match found {
				Ok(reward_id) => plan.push(PlannedSubscription {
					request: request.clone(),
					reward_id: Some(reward_id),
				}),
				Err(reason) => {
					error!(reward = %name, %reason, "cannot subscribe to reward");
					self.shared.push_attempt(SubscriptionAttempt {
						request: request.clone(),
						reward_id: None,
						session_id: session_id.to_string(),
						outcome: AttemptOutcome::Failed { reason },
						attempted_at: SystemTime::now(),
					});
				}
			}
		}

		Ok(plan)
	}

	async fn wait_for_subscribe_slot(&self, stop: &mut StopSignal) -> bool {
		loop {
			if !self.limiter.wait_if_backing_off(stop).await {
				return false;
			}
			if self.limiter.can_subscribe() {
				return true;
			}
			info!(
				poll_secs = self.cfg.subscribe_poll_interval.as_secs_f64(),
				"subscription rate limit reached; waiting"
			);
			if !stop.sleep(self.cfg.subscribe_poll_interval).await {
				return false;
			}
		}
	}
}

async fn connect_eventsub_ws(url: Url) -> anyhow::Result<EventSubWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to eventsub ws")?;
	Ok(ws)
}

/// Result of [`SessionHandle::stop`].
#[derive(Debug)]
pub enum StopOutcome {
	Stopped(Result<(), SessionError>),
	/// The worker did not exit within the join timeout and was aborted.
	TimedOut,
}

/// Caller-side handle to a running session manager.
pub struct SessionHandle {
	stop_tx: watch::Sender<bool>,
	join: Option<JoinHandle<Result<(), SessionError>>>,
	shared: Arc<Shared>,
	limiter: Arc<RateLimiter>,
	join_timeout: Duration,
}

impl SessionHandle {
	pub fn state(&self) -> ConnectionState {
		self.shared.state()
	}

	pub fn session_id(&self) -> Option<String> {
		self.shared.status.lock().session_id.clone()
	}

	/// Outcomes of the most recent subscription phase.
	pub fn subscription_attempts(&self) -> Vec<SubscriptionAttempt> {
		self.shared.status.lock().attempts.clone()
	}

	pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
		&self.limiter
	}

	/// Ask the worker to exit without waiting for it.
	pub fn request_stop(&self) {
		self.stop_tx.send_replace(true);
	}

	/// Wait for the worker to finish on its own. Cancel-safe.
	pub async fn wait(&mut self) -> Result<(), SessionError> {
		let Some(join) = self.join.as_mut() else {
			return Ok(());
		};
		let res = join.await;
		self.join = None;
		match res {
			Ok(r) => r,
			Err(e) => Err(SessionError::Worker(e.to_string())),
		}
	}

	/// Request a stop and wait up to the configured join timeout.
	pub async fn stop(mut self) -> StopOutcome {
		self.request_stop();

		let Some(mut join) = self.join.take() else {
			return StopOutcome::Stopped(Ok(()));
		};

		match tokio::time::timeout(self.join_timeout, &mut join).await {
			Ok(Ok(res)) => StopOutcome::Stopped(res),
			Ok(Err(e)) => StopOutcome::Stopped(Err(SessionError::Worker(e.to_string()))),
			Err(_) => {
				join.abort();
				self.shared.set_state(ConnectionState::FailedToStop);
				error!(
					timeout_secs = self.join_timeout.as_secs_f64(),
					"eventsub worker did not stop in time; aborted"
				);
				StopOutcome::TimedOut
			}
		}
	}
}

impl Drop for SessionHandle {
	fn drop(&mut self) {
		self.stop_tx.send_replace(true);
	}
}
