#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use twitchsub_domain::{EventKind, Fields};
use twitchsub_eventsub::{EventMeta, Recorder};

use crate::store::{EventStore, StoredEvent};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
/// Buffered events kept while the store is unreachable; older ones are dropped first.
pub const DEFAULT_MAX_PENDING: usize = 50_000;

/// Drop the oldest events beyond `max`. Returns how many were dropped.
fn trim_oldest(pending: &mut Vec<StoredEvent>, max: usize) -> usize {
	let excess = pending.len().saturating_sub(max);
	if excess > 0 {
		pending.drain(..excess);
		metrics::counter!("twitchsub_store_dropped_total").increment(excess as u64);
	}
	excess
}

struct Inner {
	store: EventStore,
	pending: Mutex<Vec<StoredEvent>>,
	max_pending: usize,
	/// Serializes flushes so batches reach the store in order.
	flush_gate: tokio::sync::Mutex<()>,
}

impl Inner {
	async fn flush(&self) -> anyhow::Result<usize> {
		let _gate = self.flush_gate.lock().await;

		let batch = std::mem::take(&mut *self.pending.lock());
		if batch.is_empty() {
			return Ok(0);
		}

		let n = batch.len();
		match self.store.insert_batch(&batch).await {
			Ok(()) => {
				metrics::counter!("twitchsub_store_flushes_total").increment(1);
				debug!(events = n, "flushed events to store");
				Ok(n)
			}
			Err(e) => {
				// Keep the batch ahead of anything recorded meanwhile.
				let mut pending = self.pending.lock();
				let newer = std::mem::replace(&mut *pending, batch);
				pending.extend(newer);
				let dropped = trim_oldest(&mut pending, self.max_pending);
				if dropped > 0 {
					warn!(dropped, kept = pending.len(), "store unavailable; dropped oldest buffered events");
				}
				Err(e)
			}
		}
	}
}

/// [`Recorder`] that buffers in memory and writes to an [`EventStore`] on a timer.
///
/// `record` never touches the database, so routing is never blocked on storage.
pub struct BufferedRecorder {
	inner: Arc<Inner>,
	closed: AtomicBool,
	close_tx: watch::Sender<bool>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedRecorder {
	/// Spawn the periodic flusher. Requires a tokio runtime.
	pub fn start(store: EventStore, flush_interval: Duration) -> Self {
		Self::start_with_limit(store, flush_interval, DEFAULT_MAX_PENDING)
	}

	/// Like [`BufferedRecorder::start`], keeping at most `max_pending` unwritten events.
	pub fn start_with_limit(store: EventStore, flush_interval: Duration, max_pending: usize) -> Self {
		let inner = Arc::new(Inner {
			store,
			pending: Mutex::new(Vec::new()),
			max_pending: max_pending.max(1),
			flush_gate: tokio::sync::Mutex::new(()),
		});
		let (close_tx, close_rx) = watch::channel(false);
		let task = tokio::spawn(flush_loop(Arc::clone(&inner), flush_interval, close_rx));

		Self {
			inner,
			closed: AtomicBool::new(false),
			close_tx,
			task: Mutex::new(Some(task)),
		}
	}

	pub fn pending(&self) -> usize {
		self.inner.pending.lock().len()
	}

	/// Write everything buffered so far. Returns the number of events written.
	pub async fn flush(&self) -> anyhow::Result<usize> {
		self.inner.flush().await
	}

	/// Close, then wait for the final flush to finish.
	pub async fn shutdown(&self) {
		self.close();
		let task = self.task.lock().take();
		if let Some(task) = task
			&& let Err(e) = task.await
		{
			error!(error = %e, "store flusher task failed");
		}
	}
}

impl Recorder for BufferedRecorder {
	fn record(&self, kind: EventKind, fields: &Fields, meta: &EventMeta) {
		if self.closed.load(Ordering::Acquire) {
			warn!(%kind, "recorder closed; dropping event");
			return;
		}

		match fields.to_json() {
			Ok(json) => {
				let mut pending = self.inner.pending.lock();
				pending.push(StoredEvent::received(kind, json, meta));
				if trim_oldest(&mut pending, self.inner.max_pending) > 0 {
					debug!(%kind, kept = pending.len(), "pending buffer full; dropped oldest event");
				}
			}
			Err(e) => {
				metrics::counter!("twitchsub_sink_errors_total").increment(1);
				warn!(%kind, error = ?e, "failed to encode fields; dropping event");
			}
		}
	}

	fn close(&self) {
		if !self.closed.swap(true, Ordering::AcqRel) {
			self.close_tx.send_replace(true);
		}
	}
}

impl Drop for BufferedRecorder {
	fn drop(&mut self) {
		self.close_tx.send_replace(true);
	}
}

async fn flush_loop(inner: Arc<Inner>, every: Duration, mut close_rx: watch::Receiver<bool>) {
	let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			_ = ticker.tick() => {
				if let Err(e) = inner.flush().await {
					metrics::counter!("twitchsub_sink_errors_total").increment(1);
					warn!(error = %format!("{e:#}"), pending = inner.pending.lock().len(), "store flush failed; will retry");
				}
			}
			_ = async { close_rx.wait_for(|closed| *closed).await.map(|_| ()) } => break,
		}
	}

	match inner.flush().await {
		Ok(n) => info!(events = n, "final store flush complete"),
		Err(e) => {
			metrics::counter!("twitchsub_sink_errors_total").increment(1);
			error!(
				error = %format!("{e:#}"),
				lost = inner.pending.lock().len(),
				"final store flush failed"
			);
		}
	}
}
