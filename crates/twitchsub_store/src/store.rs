#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use sqlx::sqlite::SqlitePoolOptions;
use twitchsub_domain::EventKind;
use twitchsub_eventsub::EventMeta;

fn unix_secs(t: SystemTime) -> i64 {
	t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// One row of `eventsub_events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
	pub kind: EventKind,
	pub subscription_id: String,
	pub message_id: String,
	pub fields_json: String,
	/// Server `message_timestamp`, unix seconds. Falls back to `created_at`.
	pub event_at: i64,
	/// Local receive time, unix seconds.
	pub created_at: i64,
}

impl StoredEvent {
	pub fn received(kind: EventKind, fields_json: String, meta: &EventMeta) -> Self {
		let created_at = unix_secs(SystemTime::now());
		Self {
			kind,
			subscription_id: meta.subscription_id.clone(),
			message_id: meta.message_id.clone(),
			fields_json,
			event_at: meta.timestamp.map_or(created_at, unix_secs),
			created_at,
		}
	}
}

#[derive(Clone)]
pub struct EventStore {
	backend: StoreBackend,
}

#[derive(Clone)]
enum StoreBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl EventStore {
	/// Connect and migrate. The backend is chosen from the URL scheme.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			// Every in-memory connection is its own database, so pin the pool to one.
			let pool = if database_url.contains(":memory:") {
				SqlitePoolOptions::new()
					.max_connections(1)
					.idle_timeout(None)
					.max_lifetime(None)
					.connect(database_url)
					.await
			} else {
				sqlx::SqlitePool::connect(database_url).await
			}
			.context("connect sqlite")?;

			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: StoreBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: StoreBackend::Postgres(pool),
			})
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;

			Ok(Self {
				backend: StoreBackend::Mysql(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"))
		}
	}

	/// Insert `batch` in a single transaction.
	pub async fn insert_batch(&self, batch: &[StoredEvent]) -> anyhow::Result<()> {
		if batch.is_empty() {
			return Ok(());
		}

		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				for ev in batch {
					sqlx::query(
						"INSERT INTO eventsub_events (event_kind, subscription_id, message_id, fields_json, event_at, created_at) \
						 VALUES (?, ?, ?, ?, ?, ?)",
					)
					.bind(ev.kind.as_str())
					.bind(&ev.subscription_id)
					.bind(&ev.message_id)
					.bind(&ev.fields_json)
					.bind(ev.event_at)
					.bind(ev.created_at)
					.execute(&mut *tx)
					.await
					.context("insert eventsub event (sqlite)")?;
				}
				tx.commit().await.context("commit sqlite tx")?;
			}
			StoreBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				for ev in batch {
					sqlx::query(
						"INSERT INTO eventsub_events (event_kind, subscription_id, message_id, fields_json, event_at, created_at) \
						 VALUES ($1, $2, $3, $4, $5, $6)",
					)
					.bind(ev.kind.as_str())
					.bind(&ev.subscription_id)
					.bind(&ev.message_id)
					.bind(&ev.fields_json)
					.bind(ev.event_at)
					.bind(ev.created_at)
					.execute(&mut *tx)
					.await
					.context("insert eventsub event (postgres)")?;
				}
				tx.commit().await.context("commit postgres tx")?;
			}
			StoreBackend::Mysql(pool) => {
				let mut tx = pool.begin().await.context("begin mysql tx")?;
				for ev in batch {
					sqlx::query(
						"INSERT INTO eventsub_events (event_kind, subscription_id, message_id, fields_json, event_at, created_at) \
						 VALUES (?, ?, ?, ?, ?, ?)",
					)
					.bind(ev.kind.as_str())
					.bind(&ev.subscription_id)
					.bind(&ev.message_id)
					.bind(&ev.fields_json)
					.bind(ev.event_at)
					.bind(ev.created_at)
					.execute(&mut *tx)
					.await
					.context("insert eventsub event (mysql)")?;
				}
				tx.commit().await.context("commit mysql tx")?;
			}
		}

		Ok(())
	}

	/// Most recent rows, newest first.
	pub async fn recent(&self, limit: u32) -> anyhow::Result<Vec<StoredEvent>> {
		let rows: Vec<(String, String, String, String, i64, i64)> = match &self.backend {
			StoreBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT event_kind, subscription_id, message_id, fields_json, event_at, created_at \
				 FROM eventsub_events ORDER BY id DESC LIMIT ?",
			)
			.bind(i64::from(limit))
			.fetch_all(pool)
			.await
			.context("select recent events (sqlite)")?,
			StoreBackend::Postgres(pool) => sqlx::query_as(
				"SELECT event_kind, subscription_id, message_id, fields_json, event_at, created_at \
				 FROM eventsub_events ORDER BY id DESC LIMIT $1",
			)
			.bind(i64::from(limit))
			.fetch_all(pool)
			.await
			.context("select recent events (postgres)")?,
			StoreBackend::Mysql(pool) => sqlx::query_as(
				"SELECT event_kind, subscription_id, message_id, fields_json, event_at, created_at \
				 FROM eventsub_events ORDER BY id DESC LIMIT ?",
			)
			.bind(i64::from(limit))
			.fetch_all(pool)
			.await
			.context("select recent events (mysql)")?,
		};

		rows.into_iter()
			.map(|(kind, subscription_id, message_id, fields_json, event_at, created_at)| {
				let kind = kind
					.parse::<EventKind>()
					.with_context(|| format!("stored event_kind {kind:?}"))?;
				Ok(StoredEvent {
					kind,
					subscription_id,
					message_id,
					fields_json,
					event_at,
					created_at,
				})
			})
			.collect()
	}
}
