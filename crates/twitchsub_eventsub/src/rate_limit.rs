#![forbid(unsafe_code)]

//! Sliding-window bookkeeping for connection and subscription attempts, plus the 429 backoff deadline.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::info;

use crate::StopSignal;

pub const CONNECT_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const MAX_CONNECTS_PER_WINDOW: usize = 3;
pub const SUBSCRIBE_WINDOW: Duration = Duration::from_secs(10);
pub const MAX_SUBSCRIBES_PER_WINDOW: usize = 10;

const BACKOFF_BASE_SECS: f64 = 60.0;
const BACKOFF_CAP_SECS: f64 = 300.0;
const BACKOFF_JITTER_SECS: (f64, f64) = (10.0, 30.0);

#[derive(Debug, Default)]
struct Windows {
	connects: VecDeque<Instant>,
	subscribes: VecDeque<Instant>,
	backoff_until: Option<Instant>,
}

fn prune(attempts: &mut VecDeque<Instant>, now: Instant, window: Duration) {
	while let Some(front) = attempts.front() {
		if now.saturating_duration_since(*front) >= window {
			attempts.pop_front();
		} else {
			break;
		}
	}
}

/// Backoff window for the `attempt`-th consecutive 429 (0-based), given a jitter in seconds.
pub fn backoff_window(attempt: u32, jitter_secs: f64) -> Duration {
	let factor = 2f64.powi(attempt.min(16) as i32);
	let secs = (BACKOFF_BASE_SECS * factor + jitter_secs).min(BACKOFF_CAP_SECS);
	Duration::from_secs_f64(secs.max(0.0))
}

/// Instance-owned rate limiter. All state sits behind one mutex.
#[derive(Debug, Default)]
pub struct RateLimiter {
	inner: Mutex<Windows>,
}

impl RateLimiter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn can_connect(&self) -> bool {
		self.can_connect_at(Instant::now())
	}

	pub fn can_connect_at(&self, now: Instant) -> bool {
		let mut w = self.inner.lock();
		if w.backoff_until.is_some_and(|until| until > now) {
			return false;
		}
		prune(&mut w.connects, now, CONNECT_WINDOW);
		w.connects.len() < MAX_CONNECTS_PER_WINDOW
	}

	pub fn record_connection_attempt(&self) {
		self.record_connection_attempt_at(Instant::now());
	}

	pub fn record_connection_attempt_at(&self, now: Instant) {
		let mut w = self.inner.lock();
		prune(&mut w.connects, now, CONNECT_WINDOW);
		w.connects.push_back(now);
	}

	pub fn can_subscribe(&self) -> bool {
		self.can_subscribe_at(Instant::now())
	}

	pub fn can_subscribe_at(&self, now: Instant) -> bool {
		let mut w = self.inner.lock();
		prune(&mut w.subscribes, now, SUBSCRIBE_WINDOW);
		w.subscribes.len() < MAX_SUBSCRIBES_PER_WINDOW
	}

	pub fn record_subscription_attempt(&self) {
		self.record_subscription_attempt_at(Instant::now());
	}

	pub fn record_subscription_attempt_at(&self, now: Instant) {
		let mut w = self.inner.lock();
		prune(&mut w.subscribes, now, SUBSCRIBE_WINDOW);
		w.subscribes.push_back(now);
	}

	/// Start a backoff window after a 429. Returns the chosen window.
	pub fn enter_backoff(&self, attempt: u32) -> Duration {
		let jitter = rand::rng().random_range(BACKOFF_JITTER_SECS.0..=BACKOFF_JITTER_SECS.1);
		self.enter_backoff_at(attempt, jitter, Instant::now())
	}

	pub fn enter_backoff_at(&self, attempt: u32, jitter_secs: f64, now: Instant) -> Duration {
		let window = backoff_window(attempt, jitter_secs);
		self.inner.lock().backoff_until = Some(now + window);
		metrics::counter!("twitchsub_rate_limited_total").increment(1);
		info!(attempt, backoff_secs = window.as_secs_f64(), "rate limited; entering backoff");
		window
	}

	pub fn clear_backoff(&self) {
		self.inner.lock().backoff_until = None;
	}

	/// Time left in the active backoff window, if any.
	pub fn backoff_remaining(&self) -> Option<Duration> {
		self.backoff_remaining_at(Instant::now())
	}

	pub fn backoff_remaining_at(&self, now: Instant) -> Option<Duration> {
		let until = self.inner.lock().backoff_until?;
		let left = until.saturating_duration_since(now);
		(!left.is_zero()).then_some(left)
	}

	/// Suspend until the backoff deadline passes. Returns `false` if stopped first.
	pub async fn wait_if_backing_off(&self, stop: &mut StopSignal) -> bool {
		while let Some(left) = self.backoff_remaining() {
			info!(remaining_secs = left.as_secs_f64(), "waiting out rate-limit backoff");
			if !stop.sleep(left).await {
				return false;
			}
		}
		!stop.is_stopped()
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn backoff_grows_and_caps() {
		assert_eq!(backoff_window(0, 10.0), Duration::from_secs(70));
		assert_eq!(backoff_window(1, 30.0), Duration::from_secs(150));
		assert_eq!(backoff_window(2, 20.0), Duration::from_secs(260));
		assert_eq!(backoff_window(3, 10.0), Duration::from_secs(300));
		assert_eq!(backoff_window(40, 30.0), Duration::from_secs(300));
	}

	#[test]
	fn backoff_blocks_connect_until_deadline() {
		let rl = RateLimiter::new();
		let t0 = Instant::now();
		let window = rl.enter_backoff_at(0, 15.0, t0);

		assert!(!rl.can_connect_at(t0));
		assert!(!rl.can_connect_at(t0 + window - Duration::from_millis(1)));
		assert!(rl.can_connect_at(t0 + window));
		assert_eq!(rl.backoff_remaining_at(t0 + window), None);
		assert_eq!(rl.backoff_remaining_at(t0), Some(window));

		rl.enter_backoff_at(1, 15.0, t0);
		rl.clear_backoff();
		assert!(rl.can_connect_at(t0));
	}

	#[test]
	fn backoff_does_not_gate_subscriptions() {
		let rl = RateLimiter::new();
		let t0 = Instant::now();
		rl.enter_backoff_at(2, 10.0, t0);
		assert!(rl.can_subscribe_at(t0));
	}

	#[tokio::test(start_paused = true)]
	async fn wait_if_backing_off_sleeps_until_deadline() {
		let rl = RateLimiter::new();
		let (_tx, mut stop) = crate::stop_channel();
		let start = Instant::now();
		let window = rl.enter_backoff_at(0, 10.0, start);

		assert!(rl.wait_if_backing_off(&mut stop).await);
		assert!(start.elapsed() >= window);
		assert!(rl.can_connect());
	}

	#[tokio::test(start_paused = true)]
	async fn wait_if_backing_off_is_noop_without_backoff() {
		let rl = RateLimiter::new();
		let (_tx, mut stop) = crate::stop_channel();
		let start = Instant::now();
		assert!(rl.wait_if_backing_off(&mut stop).await);
		assert_eq!(start.elapsed(), Duration::ZERO);
	}

	proptest! {
		#[test]
		fn subscribe_window_admits_ten_then_blocks(gaps_ms in proptest::collection::vec(0u64..900, 10)) {
			let rl = RateLimiter::new();
			let t0 = Instant::now();
			let mut at = t0;
			for gap in &gaps_ms {
				at += Duration::from_millis(*gap);
				prop_assert!(rl.can_subscribe_at(at));
				rl.record_subscription_attempt_at(at);
			}

			// Ten attempts fit inside 9 s, so an eleventh inside the window is refused.
			prop_assert!(!rl.can_subscribe_at(at));

			let first = t0 + Duration::from_millis(gaps_ms[0]);
			prop_assert!(rl.can_subscribe_at(first + SUBSCRIBE_WINDOW));
		}

		#[test]
		fn connect_window_blocks_until_oldest_expires(
			gaps_s in proptest::collection::vec(0u64..90, 3),
			check_s in 0u64..600,
		) {
			let rl = RateLimiter::new();
			let t0 = Instant::now();
			let mut at = t0;
			for gap in &gaps_s {
				at += Duration::from_secs(*gap);
				rl.record_connection_attempt_at(at);
			}

			let oldest = t0 + Duration::from_secs(gaps_s[0]);
			let at_check = at + Duration::from_secs(check_s);
			let expected = at_check >= oldest + CONNECT_WINDOW;
			prop_assert_eq!(rl.can_connect_at(at_check), expected);
		}

		#[test]
		fn consecutive_backoffs_strictly_increase_until_cap(
			jitters in proptest::collection::vec(10.0f64..=30.0, 3),
		) {
			let windows: Vec<_> = jitters.iter().enumerate().map(|(i, j)| backoff_window(i as u32, *j)).collect();
			prop_assert!(windows[0] < windows[1]);
			prop_assert!(windows[1] < windows[2]);
			for w in &windows {
				prop_assert!(*w <= Duration::from_secs(300));
			}
		}
	}
}
