#![forbid(unsafe_code)]

mod config;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use twitchsub_domain::EventKind;
use twitchsub_eventsub::helix::{self, DEFAULT_HELIX_BASE_URL};
use twitchsub_eventsub::{
	AuthGateway, CallbackDispatcher, HelixGateway, Recorder, RefreshingGateway, SessionManager, StopOutcome,
	TokenStore, TwitchConfig, UserTokenRefresher, required_scopes,
};
use twitchsub_store::{BufferedRecorder, EventStore};

use crate::config::CliConfig;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: twitchsub [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.twitchsub/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG")
		.unwrap_or_else(|_| "info,twitchsub_eventsub=debug,twitchsub_cli=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("twitchsub");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// Dispatcher that logs every event it receives.
fn logging_dispatcher(kinds: impl IntoIterator<Item = EventKind>) -> CallbackDispatcher {
	kinds
		.into_iter()
		.collect::<BTreeSet<_>>()
		.into_iter()
		.fold(CallbackDispatcher::new(), |d, kind| {
			d.on(kind, move |fields| {
				let rendered = fields.to_json().context("render fields")?;
				info!(%kind, fields = %rendered, "event");
				Ok(())
			})
		})
}

async fn resolve_channel_id(cfg: &CliConfig, gateway: &dyn AuthGateway, own_user_id: &str) -> anyhow::Result<String> {
	if let Some(id) = &cfg.twitch.channel_id {
		return Ok(id.clone());
	}

	let Some(login) = &cfg.twitch.channel else {
		info!(user_id = %own_user_id, "no channel configured; using the token's own channel");
		return Ok(own_user_id.to_string());
	};

	let user = helix::get_user_by_login(gateway, login)
		.await
		.with_context(|| format!("look up channel {login}"))?
		.ok_or_else(|| anyhow!("channel {login} not found"))?;
	info!(%login, channel_id = %user.id, "resolved channel");
	Ok(user.id)
}

async fn open_recorder(cfg: &CliConfig) -> anyhow::Result<Option<Arc<BufferedRecorder>>> {
	if !cfg.persistence.enabled {
		return Ok(None);
	}

	let Some(database_url) = cfg.persistence.database_url.as_deref() else {
		return Err(anyhow!("persistence enabled but no database_url configured"));
	};
	let store = EventStore::connect(database_url).await?;
	info!(
		flush_secs = cfg.persistence.flush_interval.as_secs(),
		max_pending = cfg.persistence.max_pending,
		"persistence enabled"
	);
	Ok(Some(Arc::new(BufferedRecorder::start_with_limit(
		store,
		cfg.persistence.flush_interval,
		cfg.persistence.max_pending,
	))))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");

	init_metrics(cfg.metrics_bind.as_deref());

	let client_id = cfg
		.twitch
		.client_id
		.clone()
		.ok_or_else(|| anyhow!("twitch.client_id is required"))?;
	let access_token = cfg
		.twitch
		.user_access_token
		.clone()
		.ok_or_else(|| anyhow!("twitch.user_access_token is required"))?;
	if cfg.twitch.subscriptions.is_empty() {
		return Err(anyhow!("twitch.subscriptions is empty; nothing to subscribe to"));
	}

	let validation = helix::validate_user_token(&access_token)
		.await
		.context("validate user token")?;
	if !validation.client_id.is_empty() && validation.client_id != client_id {
		warn!(
			token_client_id = %validation.client_id,
			configured_client_id = %client_id,
			"token was issued for a different client id"
		);
	}
	info!(
		login = %validation.login,
		user_id = %validation.user_id,
		expires_in = validation.expires_in,
		"validated user token"
	);

	let scopes = required_scopes(cfg.twitch.subscriptions.iter().map(|s| s.kind));
	println!("required scopes: {}", scopes.join(" "));
	let missing: Vec<&str> = scopes
		.iter()
		.copied()
		.filter(|s| !validation.scopes.iter().any(|have| have.as_str() == *s))
		.collect();
	if !missing.is_empty() {
		warn!(?missing, "token lacks scopes; affected subscriptions will fail");
	}

	let tokens = Arc::new(TokenStore::new(access_token, cfg.twitch.refresh_token.clone()));
	let helix_base = cfg.twitch.helix_base_url.as_deref().unwrap_or(DEFAULT_HELIX_BASE_URL);
	let inner = HelixGateway::new(helix_base, client_id.clone(), Arc::clone(&tokens))?;
	let refresher = UserTokenRefresher::new(client_id, cfg.twitch.client_secret.clone(), Arc::clone(&tokens))?;
	let gateway: Arc<dyn AuthGateway> = Arc::new(RefreshingGateway::new(inner, refresher));

	let channel_id = resolve_channel_id(&cfg, gateway.as_ref(), &validation.user_id).await?;

	let recorder = open_recorder(&cfg).await?;

	let mut twitch_cfg = TwitchConfig::new(channel_id, validation.user_id.clone(), cfg.twitch.subscriptions.clone());
	if let Some(url) = cfg.twitch.eventsub_ws_url.clone() {
		twitch_cfg.eventsub_ws_url = url;
	}
	if let Some(retries) = cfg.twitch.max_retries {
		twitch_cfg.max_retries = retries;
	}

	let dispatcher = Arc::new(logging_dispatcher(cfg.twitch.subscriptions.iter().map(|s| s.kind)));
	let manager = SessionManager::new(
		twitch_cfg,
		gateway,
		dispatcher,
		recorder.clone().map(|r| r as Arc<dyn Recorder>),
	)?;
	let mut handle = manager.start();

	let outcome = tokio::select! {
		_ = tokio::signal::ctrl_c() => {
			info!("ctrl-c received; stopping");
			match handle.stop().await {
				StopOutcome::Stopped(res) => res,
				StopOutcome::TimedOut => {
					if let Some(recorder) = &recorder {
						recorder.shutdown().await;
					}
					return Err(anyhow!("session manager did not stop in time"));
				}
			}
		}
		res = handle.wait() => res,
	};

	if let Some(recorder) = &recorder {
		recorder.shutdown().await;
	}

	outcome.context("eventsub session failed")?;
	info!("bye");
	Ok(())
}
