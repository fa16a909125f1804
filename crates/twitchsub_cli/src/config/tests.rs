use std::collections::HashMap;

use twitchsub_domain::EventKind;

use super::*;

fn parse(toml_src: &str) -> CliConfig {
	let file: FileConfig = toml::from_str(toml_src).expect("valid toml");
	CliConfig::from_file(file).expect("valid config")
}

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
	let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
	move |key| map.get(key).cloned()
}

#[test]
fn file_values_map_into_settings() {
	let cfg = parse(
		r#"
metrics_bind = "127.0.0.1:9100"

[twitch]
client_id = "abc"
client_secret = "  "
user_access_token = "tok"
channel = "somechannel"
subscriptions = ["message", "follow", "channel_point_action:Hydrate Now", ""]

[persistence]
enabled = true
database_url = "sqlite://events.db?mode=rwc"
flush_interval_secs = 5
max_pending = 1000
"#,
	);

	assert_eq!(cfg.twitch.client_id.as_deref(), Some("abc"));
	assert!(cfg.twitch.client_secret.is_none(), "blank secrets are dropped");
	assert_eq!(cfg.twitch.user_access_token.as_ref().map(|t| t.expose()), Some("tok"));
	assert_eq!(cfg.twitch.channel.as_deref(), Some("somechannel"));
	assert_eq!(cfg.twitch.subscriptions.len(), 3);
	assert_eq!(cfg.twitch.subscriptions[2].kind, EventKind::ChannelPointAction);
	assert_eq!(cfg.twitch.subscriptions[2].narrowing.as_deref(), Some("Hydrate Now"));
	assert!(cfg.persistence.enabled);
	assert_eq!(cfg.persistence.flush_interval, Duration::from_secs(5));
	assert_eq!(cfg.persistence.max_pending, 1000);
	assert_eq!(cfg.metrics_bind.as_deref(), Some("127.0.0.1:9100"));
}

#[test]
fn empty_file_uses_defaults() {
	let cfg = parse("");
	assert!(cfg.twitch.subscriptions.is_empty());
	assert!(!cfg.persistence.enabled);
	assert_eq!(cfg.persistence.flush_interval, DEFAULT_FLUSH_INTERVAL);
	assert_eq!(cfg.persistence.max_pending, DEFAULT_MAX_PENDING);
	assert!(cfg.metrics_bind.is_none());
}

#[test]
fn unknown_subscription_kind_is_an_error() {
	let file: FileConfig = toml::from_str("[twitch]\nsubscriptions = [\"not_a_kind\"]").expect("valid toml");
	let err = CliConfig::from_file(file).expect_err("must fail");
	assert!(format!("{err:#}").contains("not_a_kind"));
}

#[test]
fn env_overrides_take_precedence() {
	let mut cfg = parse("[twitch]\nclient_id = \"file\"\nsubscriptions = [\"raid\"]");
	apply_env_overrides(
		&mut cfg,
		env(&[
			("TWITCHSUB_TWITCH_CLIENT_ID", "env"),
			("TWITCHSUB_TWITCH_SUBSCRIPTIONS", "message, ban ,channel_point_action:Stretch"),
			("TWITCHSUB_PERSISTENCE_ENABLED", "yes"),
			("TWITCHSUB_PERSISTENCE_FLUSH_INTERVAL_SECS", "0"),
			("TWITCHSUB_PERSISTENCE_MAX_PENDING", "250"),
			("TWITCHSUB_TWITCH_MAX_RETRIES", "5"),
			("TWITCHSUB_METRICS_BIND", "   "),
		]),
	)
	.expect("overrides apply");

	assert_eq!(cfg.twitch.client_id.as_deref(), Some("env"));
	let kinds: Vec<EventKind> = cfg.twitch.subscriptions.iter().map(|s| s.kind).collect();
	assert_eq!(kinds, [EventKind::Message, EventKind::Ban, EventKind::ChannelPointAction]);
	assert!(cfg.persistence.enabled);
	assert_eq!(cfg.persistence.flush_interval, DEFAULT_FLUSH_INTERVAL, "zero is ignored");
	assert_eq!(cfg.persistence.max_pending, 250);
	assert_eq!(cfg.twitch.max_retries, Some(5));
	assert!(cfg.metrics_bind.is_none());
}

#[test]
fn env_bools_accept_common_spellings() {
	for v in ["1", "true", "YES", " on "] {
		assert_eq!(parse_env_bool(v), Some(true), "{v}");
	}
	for v in ["0", "false", "No", "off"] {
		assert_eq!(parse_env_bool(v), Some(false), "{v}");
	}
	assert_eq!(parse_env_bool("maybe"), None);
}

#[test]
fn missing_file_is_not_an_error() {
	let path = std::env::temp_dir().join("twitchsub-config-that-does-not-exist.toml");
	assert!(read_toml_if_exists(&path).expect("missing is fine").is_none());
}
