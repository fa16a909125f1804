#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};
use twitchsub_domain::SubscriptionRequest;
use twitchsub_eventsub::SecretString;
use twitchsub_store::{DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_PENDING};

#[cfg(test)]
mod tests;

/// Default config path: `~/.twitchsub/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".twitchsub").join("config.toml"))
}

/// Load the config from TOML at `path` (missing file means defaults), then apply env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<CliConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = CliConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok())?;

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct CliConfig {
	pub twitch: TwitchSettings,
	pub persistence: PersistenceSettings,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	pub client_id: Option<String>,
	pub client_secret: Option<SecretString>,
	pub user_access_token: Option<SecretString>,
	pub refresh_token: Option<SecretString>,
	/// Channel login; resolved to an id at startup unless `channel_id` is set.
	pub channel: Option<String>,
	pub channel_id: Option<String>,
	pub subscriptions: Vec<SubscriptionRequest>,
	pub eventsub_ws_url: Option<String>,
	pub helix_base_url: Option<String>,
	pub max_retries: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	pub enabled: bool,
	pub database_url: Option<String>,
	pub flush_interval: Duration,
	/// Unwritten events kept while the database is unreachable.
	pub max_pending: usize,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			enabled: false,
			database_url: None,
			flush_interval: DEFAULT_FLUSH_INTERVAL,
			max_pending: DEFAULT_MAX_PENDING,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	metrics_bind: Option<String>,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	user_access_token: Option<String>,
	refresh_token: Option<String>,
	channel: Option<String>,
	channel_id: Option<String>,
	eventsub_ws_url: Option<String>,
	helix_base_url: Option<String>,
	max_retries: Option<u32>,

	#[serde(default)]
	subscriptions: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
	flush_interval_secs: Option<u64>,
	max_pending: Option<usize>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_subscriptions<'a>(items: impl IntoIterator<Item = &'a str>) -> anyhow::Result<Vec<SubscriptionRequest>> {
	items
		.into_iter()
		.filter(|s| !s.trim().is_empty())
		.map(|s| SubscriptionRequest::parse(s).with_context(|| format!("invalid subscription {s:?}")))
		.collect()
}

impl CliConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let twitch = TwitchSettings {
			client_id: non_empty(file.twitch.client_id),
			client_secret: non_empty(file.twitch.client_secret).map(SecretString::new),
			user_access_token: non_empty(file.twitch.user_access_token).map(SecretString::new),
			refresh_token: non_empty(file.twitch.refresh_token).map(SecretString::new),
			channel: non_empty(file.twitch.channel),
			channel_id: non_empty(file.twitch.channel_id),
			subscriptions: parse_subscriptions(file.twitch.subscriptions.iter().map(String::as_str))?,
			eventsub_ws_url: non_empty(file.twitch.eventsub_ws_url),
			helix_base_url: non_empty(file.twitch.helix_base_url),
			max_retries: file.twitch.max_retries,
		};

		Ok(Self {
			twitch,
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_empty(file.persistence.database_url),
				flush_interval: file
					.persistence
					.flush_interval_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(DEFAULT_FLUSH_INTERVAL),
				max_pending: file
					.persistence
					.max_pending
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_MAX_PENDING),
			},
			metrics_bind: non_empty(file.metrics_bind),
		})
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Apply `TWITCHSUB_*` overrides read through `var`.
fn apply_env_overrides(cfg: &mut CliConfig, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
	let text = |key: &str| non_empty(var(key));

	if let Some(v) = text("TWITCHSUB_TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = text("TWITCHSUB_TWITCH_CLIENT_SECRET") {
		cfg.twitch.client_secret = Some(SecretString::new(v));
		info!("twitch config: client_secret overridden by env");
	}

	if let Some(v) = text("TWITCHSUB_TWITCH_USER_ACCESS_TOKEN") {
		cfg.twitch.user_access_token = Some(SecretString::new(v));
		info!("twitch config: user_access_token overridden by env");
	}

	if let Some(v) = text("TWITCHSUB_TWITCH_REFRESH_TOKEN") {
		cfg.twitch.refresh_token = Some(SecretString::new(v));
		info!("twitch config: refresh_token overridden by env");
	}

	if let Some(v) = text("TWITCHSUB_TWITCH_CHANNEL") {
		cfg.twitch.channel = Some(v);
		info!("twitch config: channel overridden by env");
	}

	if let Some(v) = text("TWITCHSUB_TWITCH_CHANNEL_ID") {
		cfg.twitch.channel_id = Some(v);
		info!("twitch config: channel_id overridden by env");
	}

	if let Some(v) = text("TWITCHSUB_TWITCH_SUBSCRIPTIONS") {
		cfg.twitch.subscriptions = parse_subscriptions(v.split(','))
			.context("TWITCHSUB_TWITCH_SUBSCRIPTIONS")?;
		info!(
			count = cfg.twitch.subscriptions.len(),
			"twitch config: subscriptions overridden by env"
		);
	}

	if let Some(v) = text("TWITCHSUB_TWITCH_EVENTSUB_WS_URL") {
		cfg.twitch.eventsub_ws_url = Some(v);
		info!("twitch config: eventsub_ws_url overridden by env");
	}

	if let Some(v) = text("TWITCHSUB_TWITCH_HELIX_BASE_URL") {
		cfg.twitch.helix_base_url = Some(v);
		info!("twitch config: helix_base_url overridden by env");
	}

	if let Some(v) = text("TWITCHSUB_TWITCH_MAX_RETRIES")
		&& let Ok(retries) = v.parse::<u32>()
	{
		cfg.twitch.max_retries = Some(retries);
		info!(retries, "twitch config: max_retries overridden by env");
	}

	if let Some(v) = text("TWITCHSUB_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = text("TWITCHSUB_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = text("TWITCHSUB_PERSISTENCE_FLUSH_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.persistence.flush_interval = Duration::from_secs(secs);
		info!(secs, "persistence: flush_interval overridden by env");
	}

	if let Some(v) = text("TWITCHSUB_PERSISTENCE_MAX_PENDING")
		&& let Ok(max) = v.parse::<usize>()
		&& max > 0
	{
		cfg.persistence.max_pending = max;
		info!(max, "persistence: max_pending overridden by env");
	}

	if let Some(v) = text("TWITCHSUB_METRICS_BIND") {
		cfg.metrics_bind = Some(v);
		info!("metrics_bind overridden by env");
	}

	if cfg.twitch.refresh_token.is_some() && cfg.twitch.client_secret.is_none() {
		warn!("twitch config: refresh_token set without client_secret; token refresh will fail");
	}

	Ok(())
}
