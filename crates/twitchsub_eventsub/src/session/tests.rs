use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use twitchsub_domain::{EventKind, SubscriptionRequest};

use super::*;
use crate::CallbackDispatcher;
use crate::helix::EndpointError;

/// Gateway that records subscription bodies and replays scripted POST results.
#[derive(Default)]
struct FakeGateway {
	posts: Mutex<Vec<Value>>,
	post_results: Mutex<VecDeque<Result<Value, EndpointError>>>,
	gets: AtomicUsize,
	rewards: Value,
	notify_after: Option<(usize, Arc<Notify>)>,
	/// Error returned once the scripted results run out, instead of success.
	post_fallback: Option<fn() -> EndpointError>,
}

impl FakeGateway {
	fn posts(&self) -> Vec<Value> {
		self.posts.lock().clone()
	}
}

#[async_trait]
impl AuthGateway for FakeGateway {
	async fn get(&self, _endpoint: &str) -> Result<Value, EndpointError> {
		self.gets.fetch_add(1, Ordering::SeqCst);
		Ok(self.rewards.clone())
	}

	async fn post(&self, _endpoint: &str, body: &Value) -> Result<Value, EndpointError> {
		let n = {
			let mut posts = self.posts.lock();
			posts.push(body.clone());
			posts.len()
		};
		if let Some((after, notify)) = &self.notify_after
			&& n == *after
		{
			notify.notify_one();
		}

		if let Some(scripted) = self.post_results.lock().pop_front() {
			return scripted;
		}
		if let Some(fallback) = self.post_fallback {
			return Err(fallback());
		}

		Ok(json!({
			"data": [{ "id": format!("sub-{n}"), "status": "enabled", "type": body["type"] }]
		}))
	}
}

fn welcome_frame(session_id: &str) -> String {
	json!({
		"metadata": { "message_id": "m-welcome", "message_type": "session_welcome", "message_timestamp": "2024-01-01T00:00:00Z" },
		"payload": { "session": {
			"id": session_id,
			"status": "connected",
			"connected_at": "2024-01-01T00:00:00Z",
			"keepalive_timeout_seconds": 10,
			"reconnect_url": null
		}}
	})
	.to_string()
}

fn reconnect_frame(url: &str) -> String {
	json!({
		"metadata": { "message_id": "m-reconnect", "message_type": "session_reconnect", "message_timestamp": "2024-01-01T00:00:00Z" },
		"payload": { "session": {
			"id": "sess-a",
			"status": "reconnecting",
			"keepalive_timeout_seconds": null,
			"reconnect_url": url
		}}
	})
	.to_string()
}

async fn idle_until_closed(ws: &mut WebSocketStream<TcpStream>) {
	while let Some(Ok(msg)) = ws.next().await {
		if msg.is_close() {
			break;
		}
	}
}

/// Accept WebSocket connections forever, handing each to `handler` with its 0-based index.
async fn spawn_ws_server<F, Fut>(handler: F) -> (String, Arc<AtomicUsize>)
where
	F: Fn(usize, WebSocketStream<TcpStream>) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = ()> + Send + 'static,
{
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("addr");
	let accepted = Arc::new(AtomicUsize::new(0));
	let counter = Arc::clone(&accepted);
	let handler = Arc::new(handler);

	tokio::spawn(async move {
		while let Ok((stream, _)) = listener.accept().await {
			let idx = counter.fetch_add(1, Ordering::SeqCst);
			let handler = Arc::clone(&handler);
			tokio::spawn(async move {
				if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
					handler(idx, ws).await;
				}
			});
		}
	});

	(format!("ws://{addr}"), accepted)
}

fn test_cfg(url: &str, subscriptions: Vec<SubscriptionRequest>) -> TwitchConfig {
	let mut cfg = TwitchConfig::new("1000", "1000", subscriptions);
	cfg.eventsub_ws_url = url.to_string();
	cfg.connect_poll_interval = Duration::from_millis(10);
	cfg.subscribe_poll_interval = Duration::from_millis(10);
	cfg.inter_subscription_delay = Duration::ZERO;
	cfg.error_backoff_base = Duration::from_millis(10);
	cfg.error_backoff_max = Duration::from_millis(40);
	cfg.welcome_timeout = Duration::from_secs(2);
	cfg.stop_join_timeout = Duration::from_secs(2);
	cfg
}

fn manager(cfg: TwitchConfig, gateway: Arc<FakeGateway>) -> SessionManager {
	SessionManager::new(cfg, gateway, Arc::new(CallbackDispatcher::new()), None).expect("valid config")
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	while !cond() {
		assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

fn failing_connector(message: &'static str, calls: Arc<AtomicUsize>) -> WsConnector {
	Arc::new(move |_url: Url| {
		calls.fetch_add(1, Ordering::SeqCst);
		Box::pin(async move { Err(anyhow!(message)) }) as BoxFuture<'static, anyhow::Result<EventSubWs>>
	})
}

#[test]
fn broadcaster_only_kinds_need_the_broadcaster_token() {
	let cfg = TwitchConfig::new("1000", "2000", vec![SubscriptionRequest::new(EventKind::Ban)]);
	let err = SessionManager::new(cfg, Arc::new(FakeGateway::default()), Arc::new(CallbackDispatcher::new()), None)
		.err()
		.expect("must reject");

	match err {
		SessionError::BroadcasterOnly { kind, user_id, channel_id } => {
			assert_eq!(kind, EventKind::Ban);
			assert_eq!(user_id, "2000");
			assert_eq!(channel_id, "1000");
		}
		other => panic!("unexpected error: {other}"),
	}

	// Chat works for any identity.
	let cfg = TwitchConfig::new("1000", "2000", vec![SubscriptionRequest::new(EventKind::Message)]);
	assert!(SessionManager::new(cfg, Arc::new(FakeGateway::default()), Arc::new(CallbackDispatcher::new()), None).is_ok());
}

#[test]
fn invalid_configs_are_rejected() {
	let no_subs = TwitchConfig::new("1000", "1000", Vec::new());
	let mut bad_url = TwitchConfig::new("1000", "1000", vec![SubscriptionRequest::new(EventKind::Follow)]);
	bad_url.eventsub_ws_url = "not a url".to_string();
	let no_channel = TwitchConfig::new("", "1000", vec![SubscriptionRequest::new(EventKind::Follow)]);

	for cfg in [no_subs, bad_url, no_channel] {
		let res = SessionManager::new(cfg, Arc::new(FakeGateway::default()), Arc::new(CallbackDispatcher::new()), None);
		assert!(matches!(res, Err(SessionError::Config(_))));
	}
}

#[tokio::test]
async fn subscribes_then_follows_reconnect_to_new_session() {
	let (url_b, accepted_b) = spawn_ws_server(|_, mut ws| async move {
		let _ = ws.send(Message::Text(welcome_frame("sess-b").into())).await;
		idle_until_closed(&mut ws).await;
	})
	.await;

	let first_batch = Arc::new(Notify::new());
	let notify = Arc::clone(&first_batch);
	let reconnect_to = url_b.clone();
	let (url_a, accepted_a) = spawn_ws_server(move |_, mut ws| {
		let notify = Arc::clone(&notify);
		let reconnect_to = reconnect_to.clone();
		async move {
			let _ = ws.send(Message::Text(welcome_frame("sess-a").into())).await;
			notify.notified().await;
			let _ = ws.send(Message::Text(reconnect_frame(&reconnect_to).into())).await;
			idle_until_closed(&mut ws).await;
		}
	})
	.await;

	let gateway = Arc::new(FakeGateway {
		notify_after: Some((2, first_batch)),
		..FakeGateway::default()
	});
	let cfg = test_cfg(
		&url_a,
		vec![
			SubscriptionRequest::new(EventKind::Message),
			SubscriptionRequest::new(EventKind::Follow),
		],
	);
	let handle = manager(cfg, Arc::clone(&gateway)).start();

	wait_until("re-subscription on the new session", || gateway.posts().len() == 4).await;
	wait_until("live state", || handle.state() == ConnectionState::Live).await;

	let posts = gateway.posts();
	let sessions: Vec<&str> = posts
		.iter()
		.map(|p| p["transport"]["session_id"].as_str().unwrap_or_default())
		.collect();
	assert_eq!(sessions, ["sess-a", "sess-a", "sess-b", "sess-b"]);

	let types: Vec<&str> = posts.iter().map(|p| p["type"].as_str().unwrap_or_default()).collect();
	assert_eq!(types, ["channel.chat.message", "channel.follow", "channel.chat.message", "channel.follow"]);

	assert_eq!(accepted_a.load(Ordering::SeqCst), 1);
	assert_eq!(accepted_b.load(Ordering::SeqCst), 1);
	assert_eq!(handle.session_id().as_deref(), Some("sess-b"));

	let attempts = handle.subscription_attempts();
	assert_eq!(attempts.len(), 2);
	assert!(attempts.iter().all(|a| a.session_id == "sess-b"));
	assert!(
		attempts
			.iter()
			.all(|a| matches!(a.outcome, AttemptOutcome::Confirmed { subscription_id: Some(_) }))
	);

	let shared = Arc::clone(&handle.shared);
	assert!(matches!(handle.stop().await, StopOutcome::Stopped(Ok(()))));
	assert_eq!(shared.state(), ConnectionState::Stopped);
	assert!(shared.status.lock().session_id.is_none());
}

#[tokio::test]
async fn welcome_without_session_id_is_retried() {
	let (url, accepted) = spawn_ws_server(|idx, mut ws| async move {
		let frame = if idx == 0 {
			json!({
				"metadata": { "message_id": "m1", "message_type": "session_welcome" },
				"payload": { "session": { "status": "connected" } }
			})
			.to_string()
		} else {
			welcome_frame("sess-2")
		};
		let _ = ws.send(Message::Text(frame.into())).await;
		idle_until_closed(&mut ws).await;
	})
	.await;

	let gateway = Arc::new(FakeGateway::default());
	let handle = manager(test_cfg(&url, vec![SubscriptionRequest::new(EventKind::Raid)]), Arc::clone(&gateway)).start();

	wait_until("second session", || handle.session_id().as_deref() == Some("sess-2")).await;
	wait_until("subscription", || gateway.posts().len() == 1).await;
	assert_eq!(accepted.load(Ordering::SeqCst), 2);
	assert_eq!(gateway.posts()[0]["transport"]["session_id"], "sess-2");

	assert!(matches!(handle.stop().await, StopOutcome::Stopped(Ok(()))));
}

#[tokio::test]
async fn failed_subscription_is_skipped_and_session_goes_live() {
	let (url, _) = spawn_ws_server(|_, mut ws| async move {
		let _ = ws.send(Message::Text(welcome_frame("sess-1").into())).await;
		idle_until_closed(&mut ws).await;
	})
	.await;

	let gateway = Arc::new(FakeGateway {
		post_results: Mutex::new(VecDeque::from([Err(EndpointError::Status {
			endpoint: "eventsub/subscriptions".to_string(),
			status: 400,
			body: "bad condition".to_string(),
		})])),
		..FakeGateway::default()
	});
	let cfg = test_cfg(
		&url,
		vec![
			SubscriptionRequest::new(EventKind::PollBegin),
			SubscriptionRequest::new(EventKind::StreamOnline),
		],
	);
	let handle = manager(cfg, Arc::clone(&gateway)).start();

	wait_until("live state", || handle.state() == ConnectionState::Live).await;

	let attempts = handle.subscription_attempts();
	assert_eq!(attempts.len(), 2);
	assert!(matches!(&attempts[0].outcome, AttemptOutcome::Failed { reason } if reason.contains("400")));
	assert!(matches!(attempts[1].outcome, AttemptOutcome::Confirmed { .. }));
	assert_eq!(attempts[1].request.kind, EventKind::StreamOnline);

	assert!(matches!(handle.stop().await, StopOutcome::Stopped(Ok(()))));
}

#[tokio::test]
async fn reward_names_resolve_once_and_unknown_names_fail_alone() {
	let (url, _) = spawn_ws_server(|_, mut ws| async move {
		let _ = ws.send(Message::Text(welcome_frame("sess-r").into())).await;
		idle_until_closed(&mut ws).await;
	})
	.await;

	let gateway = Arc::new(FakeGateway {
		rewards: json!({ "data": [
			{ "id": "reward-1", "title": "Hydrate Now" },
			{ "id": "reward-2", "title": "Stretch" }
		]}),
		..FakeGateway::default()
	});
	let cfg = test_cfg(
		&url,
		vec![
			SubscriptionRequest::narrowed(EventKind::ChannelPointAction, "hydrate now"),
			SubscriptionRequest::narrowed(EventKind::ChannelPointAction, "Does Not Exist"),
			SubscriptionRequest::new(EventKind::ChannelCheer),
		],
	);
	let handle = manager(cfg, Arc::clone(&gateway)).start();

	wait_until("live state", || handle.state() == ConnectionState::Live).await;

	assert_eq!(gateway.gets.load(Ordering::SeqCst), 1);
	let posts = gateway.posts();
	assert_eq!(posts.len(), 2);
	assert_eq!(posts[0]["type"], "channel.channel_points_custom_reward_redemption.add");
	assert_eq!(posts[0]["condition"]["reward_id"], "reward-1");
	assert_eq!(posts[1]["type"], "channel.cheer");

	let attempts = handle.subscription_attempts();
	let failed: Vec<_> = attempts
		.iter()
		.filter(|a| matches!(a.outcome, AttemptOutcome::Failed { .. }))
		.collect();
	assert_eq!(failed.len(), 1);
	assert_eq!(failed[0].request.narrowing.as_deref(), Some("Does Not Exist"));
	assert_eq!(failed[0].session_id, "sess-r");

	assert!(matches!(handle.stop().await, StopOutcome::Stopped(Ok(()))));
}

#[tokio::test]
async fn subscription_429_enters_backoff_and_stop_interrupts_it() {
	let (url, _) = spawn_ws_server(|_, mut ws| async move {
		let _ = ws.send(Message::Text(welcome_frame("sess-429").into())).await;
		idle_until_closed(&mut ws).await;
	})
	.await;

	let gateway = Arc::new(FakeGateway {
		post_results: Mutex::new(VecDeque::from([Err(EndpointError::RateLimited {
			retry_after: None,
			body: "slow down".to_string(),
		})])),
		..FakeGateway::default()
	});
	let cfg = test_cfg(
		&url,
		vec![
			SubscriptionRequest::new(EventKind::VipAdd),
			SubscriptionRequest::new(EventKind::VipRemove),
		],
	);
	let handle = manager(cfg, Arc::clone(&gateway)).start();

	wait_until("backoff", || handle.state() == ConnectionState::BackingOff).await;
	assert!(handle.rate_limiter().backoff_remaining().is_some());
	// The failing request aborted the phase before the second subscription.
	assert_eq!(gateway.posts().len(), 1);

	let started = std::time::Instant::now();
	assert!(matches!(handle.stop().await, StopOutcome::Stopped(Ok(()))));
	assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn stop_during_connect_backoff_makes_no_further_attempts() {
	let calls = Arc::new(AtomicUsize::new(0));
	let mut cfg = test_cfg("ws://127.0.0.1:9", vec![SubscriptionRequest::new(EventKind::Follow)]);
	cfg.ws_connector = Some(failing_connector("HTTP error: 429 Too Many Requests", Arc::clone(&calls)));

	let handle = manager(cfg, Arc::new(FakeGateway::default())).start();
	wait_until("backoff", || handle.state() == ConnectionState::BackingOff).await;

	let shared = Arc::clone(&handle.shared);
	assert!(matches!(handle.stop().await, StopOutcome::Stopped(Ok(()))));
	assert_eq!(calls.load(Ordering::SeqCst), 1);
	assert_eq!(shared.state(), ConnectionState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn repeated_429s_back_off_with_growing_windows_then_fail() {
	let calls = Arc::new(AtomicUsize::new(0));
	let mut cfg = test_cfg("ws://127.0.0.1:9", vec![SubscriptionRequest::new(EventKind::Follow)]);
	cfg.ws_connector = Some(failing_connector("HTTP error: 429 Too Many Requests", Arc::clone(&calls)));

	let (_tx, stop) = stop_channel();
	let started = tokio::time::Instant::now();
	let res = manager(cfg, Arc::new(FakeGateway::default())).run(stop).await;

	assert!(matches!(res, Err(SessionError::RateLimitExhausted { attempts: 4 })));
	assert_eq!(calls.load(Ordering::SeqCst), 4);

	// Three windows of at least 60+10, 120+10 and 240+10 seconds.
	let elapsed = started.elapsed();
	assert!(elapsed >= Duration::from_secs(450), "elapsed {elapsed:?}");
	assert!(elapsed <= Duration::from_secs(90 + 150 + 270 + 1), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn generic_failures_exhaust_retries() {
	let calls = Arc::new(AtomicUsize::new(0));
	let mut cfg = test_cfg("ws://127.0.0.1:9", vec![SubscriptionRequest::new(EventKind::Follow)]);
	cfg.ws_connector = Some(failing_connector("connection refused", Arc::clone(&calls)));
	cfg.error_backoff_base = Duration::from_secs(10);
	cfg.error_backoff_max = Duration::from_secs(120);
	cfg.connect_poll_interval = Duration::from_secs(30);

	let (_tx, stop) = stop_channel();
	let res = manager(cfg, Arc::new(FakeGateway::default())).run(stop).await;

	match res {
		Err(SessionError::RetriesExhausted { attempts, last_error }) => {
			assert_eq!(attempts, 4);
			assert!(last_error.contains("connection refused"));
		}
		other => panic!("unexpected result: {other:?}"),
	}
	assert_eq!(calls.load(Ordering::SeqCst), 4);
}

async fn welcoming_server() -> (String, Arc<AtomicUsize>) {
	spawn_ws_server(|idx, mut ws| async move {
		let _ = ws.send(Message::Text(welcome_frame(&format!("sess-{idx}")).into())).await;
		idle_until_closed(&mut ws).await;
	})
	.await
}

#[tokio::test(start_paused = true)]
async fn subscription_429s_across_welcomes_exhaust_the_rate_limit_budget() {
	let (url, accepted) = welcoming_server().await;
	let gateway = Arc::new(FakeGateway {
		post_fallback: Some(|| EndpointError::RateLimited {
			retry_after: None,
			body: "slow down".to_string(),
		}),
		..FakeGateway::default()
	});
	let cfg = test_cfg(&url, vec![SubscriptionRequest::new(EventKind::Follow)]);

	let (_tx, stop) = stop_channel();
	let res = tokio::time::timeout(Duration::from_secs(3 * 3600), manager(cfg, Arc::clone(&gateway)).run(stop))
		.await
		.expect("worker must give up well before three hours");

	assert!(matches!(res, Err(SessionError::RateLimitExhausted { attempts: 4 })), "{res:?}");
	assert_eq!(gateway.posts().len(), 4);
	assert!(accepted.load(Ordering::SeqCst) >= 4);
}

#[tokio::test(start_paused = true)]
async fn subscription_401s_across_welcomes_exhaust_retries() {
	let (url, _) = welcoming_server().await;
	let gateway = Arc::new(FakeGateway {
		post_fallback: Some(|| EndpointError::Unauthorized {
			body: "invalid token".to_string(),
		}),
		..FakeGateway::default()
	});
	let mut cfg = test_cfg(&url, vec![SubscriptionRequest::new(EventKind::Follow)]);
	cfg.max_retries = 1;

	let (_tx, stop) = stop_channel();
	let res = tokio::time::timeout(Duration::from_secs(3600), manager(cfg, Arc::clone(&gateway)).run(stop))
		.await
		.expect("worker must give up");

	match res {
		Err(SessionError::RetriesExhausted { attempts, last_error }) => {
			assert_eq!(attempts, 2);
			assert!(last_error.contains("invalid token"), "{last_error}");
		}
		other => panic!("unexpected result: {other:?}"),
	}
	assert_eq!(gateway.posts().len(), 2);
}

#[tokio::test]
async fn going_live_resets_the_failure_budget() {
	// The second session goes live and is then closed by the server.
	let (url, _) = spawn_ws_server(|idx, mut ws| async move {
		let _ = ws.send(Message::Text(welcome_frame(&format!("sess-{idx}")).into())).await;
		if idx == 1 {
			tokio::time::sleep(Duration::from_millis(200)).await;
			let _ = ws.close(None).await;
		}
		idle_until_closed(&mut ws).await;
	})
	.await;

	let gateway = Arc::new(FakeGateway {
		post_results: Mutex::new(VecDeque::from([
			Err(EndpointError::Unauthorized { body: "expired".to_string() }),
			Ok(json!({ "data": [{ "id": "sub-1", "status": "enabled", "type": "channel.follow" }] })),
			Err(EndpointError::Unauthorized { body: "expired".to_string() }),
		])),
		..FakeGateway::default()
	});
	let mut cfg = test_cfg(&url, vec![SubscriptionRequest::new(EventKind::Follow)]);
	cfg.max_retries = 1;
	let handle = manager(cfg, Arc::clone(&gateway)).start();

	wait_until("third subscription", || gateway.posts().len() == 3).await;
	// Two 401s with max_retries = 1 would be fatal if the live session had not reset the count.
	// The worker is instead waiting for the connection window to reopen.
	wait_until("connect window wait", || handle.state() == ConnectionState::Disconnected).await;
	assert_eq!(gateway.posts()[2]["transport"]["session_id"], "sess-2");
	assert!(matches!(handle.stop().await, StopOutcome::Stopped(Ok(()))));
}

#[tokio::test]
async fn pings_are_answered_on_a_live_session() {
	let ponged = Arc::new(Notify::new());
	let seen = Arc::clone(&ponged);
	let (url, _) = spawn_ws_server(move |_, mut ws| {
		let seen = Arc::clone(&seen);
		async move {
			let _ = ws.send(Message::Text(welcome_frame("sess-ping").into())).await;
			let _ = ws.send(Message::Ping(b"hi".to_vec().into())).await;
			while let Some(Ok(msg)) = ws.next().await {
				if let Message::Pong(p) = msg {
					assert_eq!(&p[..], b"hi");
					seen.notify_one();
				}
			}
		}
	})
	.await;

	let handle = manager(test_cfg(&url, vec![SubscriptionRequest::new(EventKind::Follow)]), Arc::new(FakeGateway::default())).start();
	tokio::time::timeout(Duration::from_secs(5), ponged.notified())
		.await
		.expect("pong within five seconds");
	assert!(matches!(handle.stop().await, StopOutcome::Stopped(Ok(()))));
}

#[test]
fn error_backoff_doubles_and_caps() {
	let min = Duration::from_secs(10);
	let max = Duration::from_secs(120);
	assert_eq!(backoff_delay(0, min, max), Duration::from_secs(10));
	assert_eq!(backoff_delay(1, min, max), Duration::from_secs(20));
	assert_eq!(backoff_delay(3, min, max), Duration::from_secs(80));
	assert_eq!(backoff_delay(4, min, max), Duration::from_secs(120));
	assert_eq!(backoff_delay(40, min, max), Duration::from_secs(120));
}

#[test]
fn rate_limit_errors_are_classified_from_text() {
	assert!(matches!(
		classify(anyhow!("HTTP error: 429 Too Many Requests")),
		AttemptError::RateLimited(_)
	));
	assert!(matches!(
		classify(anyhow!("too many requests").context("connect")),
		AttemptError::RateLimited(_)
	));
	assert!(matches!(
		classify(anyhow::Error::new(EndpointError::RateLimited {
			retry_after: None,
			body: String::new()
		})),
		AttemptError::RateLimited(_)
	));
	assert!(matches!(classify(anyhow!("connection reset")), AttemptError::Transient(_)));
}
