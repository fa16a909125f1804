#![forbid(unsafe_code)]

//! Auth Gateway boundary: authenticated Helix calls with retry-once-after-refresh.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::SecretString;
use crate::catalog::{CatalogEntry, Condition};


pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv";
pub const TOKEN_VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
pub const TOKEN_REFRESH_URL: &str = "https://id.twitch.tv/oauth2/token";

const EVENTSUB_SUBSCRIPTIONS_ENDPOINT: &str = "eventsub/subscriptions";

/// Distinguishable failure of an authenticated endpoint call.
#[derive(Debug, Error)]
pub enum EndpointError {
	#[error("unauthorized (status=401): {body}")]
	Unauthorized { body: String },
	#[error("forbidden (status=403): {body}")]
	Forbidden { body: String },
	#[error("429 too many requests: {body}")]
	RateLimited { retry_after: Option<Duration>, body: String },
	#[error("endpoint {endpoint} failed (status={status}): {body}")]
	Status {
		endpoint: String,
		status: u16,
		body: String,
	},
	#[error("transport error: {0}")]
	Transport(#[from] reqwest::Error),
	#[error("invalid endpoint url: {0}")]
	Url(#[from] url::ParseError),
	#[error("decode json: {0}")]
	Decode(#[from] serde_json::Error),
	#[error("credential refresh failed: {0:#}")]
	Refresh(anyhow::Error),
}

impl EndpointError {
	pub fn is_unauthorized(&self) -> bool {
		matches!(self, EndpointError::Unauthorized { .. })
	}

	pub fn is_rate_limited(&self) -> bool {
		matches!(self, EndpointError::RateLimited { .. })
	}
}

/// Authenticated request capability. Endpoints are relative to `/helix/` (e.g. `eventsub/subscriptions`).
#[async_trait]
pub trait AuthGateway: Send + Sync {
	async fn get(&self, endpoint: &str) -> Result<serde_json::Value, EndpointError>;
	async fn post(&self, endpoint: &str, body: &serde_json::Value) -> Result<serde_json::Value, EndpointError>;
}

#[async_trait]
impl<T: AuthGateway + ?Sized> AuthGateway for Arc<T> {
	async fn get(&self, endpoint: &str) -> Result<serde_json::Value, EndpointError> {
		(**self).get(endpoint).await
	}

	async fn post(&self, endpoint: &str, body: &serde_json::Value) -> Result<serde_json::Value, EndpointError> {
		(**self).post(endpoint, body).await
	}
}

/// Obtains fresh credentials after an authorization failure.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
	async fn refresh(&self) -> anyhow::Result<()>;
}

/// Shared, rotatable user credentials.
#[derive(Debug)]
pub struct TokenStore {
	access_token: RwLock<SecretString>,
	refresh_token: RwLock<Option<SecretString>>,
}

impl TokenStore {
	pub fn new(access_token: SecretString, refresh_token: Option<SecretString>) -> Self {
		Self {
			access_token: RwLock::new(access_token),
			refresh_token: RwLock::new(refresh_token),
		}
	}

	pub fn access_token(&self) -> SecretString {
		self.access_token.read().clone()
	}

	pub fn refresh_token(&self) -> Option<SecretString> {
		self.refresh_token.read().clone()
	}

	pub fn rotate(&self, access_token: SecretString, refresh_token: Option<SecretString>) {
		*self.access_token.write() = access_token;
		if let Some(rt) = refresh_token {
			*self.refresh_token.write() = Some(rt);
		}
	}
}

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

fn build_http(label: &str) -> anyhow::Result<reqwest::Client> {
	reqwest::Client::builder()
		.user_agent(format!("twitchsub/0.x ({label})"))
		.build()
		.context("build reqwest client")
}

/// reqwest-backed Helix gateway.
#[derive(Clone, Debug)]
pub struct HelixGateway {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	tokens: Arc<TokenStore>,
}

impl HelixGateway {
	pub fn new(base_url: &str, client_id: impl Into<String>, tokens: Arc<TokenStore>) -> anyhow::Result<Self> {
		let base_url = Url::parse(base_url).with_context(|| format!("parse helix base url {base_url}"))?;
		Ok(Self {
			http: build_http("helix")?,
			base_url,
			client_id: client_id.into(),
			tokens,
		})
	}

	fn url(&self, endpoint: &str) -> Result<Url, EndpointError> {
		let endpoint = endpoint.trim_start_matches('/');
		Ok(self.base_url.join(&format!("/helix/{endpoint}"))?)
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id).header(
			"Authorization",
			format!("Bearer {}", self.tokens.access_token().expose()),
		)
	}

	async fn send(&self, req: reqwest::RequestBuilder, endpoint: &str) -> Result<serde_json::Value, EndpointError> {
		let resp = self.authed(req).send().await?;
		let status = resp.status();
		let retry_after = retry_delay_from_headers(resp.headers());
		let body = resp.text().await?;

		match status {
			StatusCode::UNAUTHORIZED => return Err(EndpointError::Unauthorized { body }),
			StatusCode::FORBIDDEN => return Err(EndpointError::Forbidden { body }),
			StatusCode::TOO_MANY_REQUESTS => return Err(EndpointError::RateLimited { retry_after, body }),
			s if !s.is_success() => {
				return Err(EndpointError::Status {
					endpoint: endpoint.to_string(),
					status: s.as_u16(),
					body,
				});
			}
			_ => {}
		}

		if body.trim().is_empty() {
			return Ok(serde_json::Value::Null);
		}
		Ok(serde_json::from_str(&body)?)
	}
}

#[async_trait]
impl AuthGateway for HelixGateway {
	async fn get(&self, endpoint: &str) -> Result<serde_json::Value, EndpointError> {
		let url = self.url(endpoint)?;
		debug!(%endpoint, "helix GET");
		self.send(self.http.get(url), endpoint).await
	}

	async fn post(&self, endpoint: &str, body: &serde_json::Value) -> Result<serde_json::Value, EndpointError> {
		let url = self.url(endpoint)?;
		debug!(%endpoint, "helix POST");
		self.send(self.http.post(url).json(body), endpoint).await
	}
}

#[derive(Debug, Deserialize)]
pub struct TwitchTokenRefreshResponse {
	pub access_token: String,
	#[serde(default)]
	pub refresh_token: Option<String>,
	#[serde(default)]
	pub expires_in: u64,
}

/// Refreshes the user token with the OAuth2 `refresh_token` grant and rotates it into the store.
#[derive(Debug, Clone)]
pub struct UserTokenRefresher {
	http: reqwest::Client,
	token_url: String,
	client_id: String,
	client_secret: Option<SecretString>,
	tokens: Arc<TokenStore>,
}

impl UserTokenRefresher {
	pub fn new(
		client_id: impl Into<String>,
		client_secret: Option<SecretString>,
		tokens: Arc<TokenStore>,
	) -> anyhow::Result<Self> {
		Ok(Self {
			http: build_http("oauth-refresh")?,
			token_url: TOKEN_REFRESH_URL.to_string(),
			client_id: client_id.into(),
			client_secret,
			tokens,
		})
	}

	pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
		self.token_url = token_url.into();
		self
	}
}

#[async_trait]
impl TokenRefresher for UserTokenRefresher {
	async fn refresh(&self) -> anyhow::Result<()> {
		let Some(refresh_token) = self.tokens.refresh_token() else {
			anyhow::bail!("no refresh token configured");
		};
		let Some(client_secret) = &self.client_secret else {
			anyhow::bail!("no client secret configured");
		};

		let resp = self
			.http
			.post(&self.token_url)
			.form(&[
				("grant_type", "refresh_token"),
				("client_id", self.client_id.as_str()),
				("client_secret", client_secret.expose()),
				("refresh_token", refresh_token.expose()),
			])
			.send()
			.await
			.context("twitch refresh token request")?;

		let status = resp.status();
		let body = resp.text().await.context("twitch refresh token read body")?;

		if !status.is_success() {
			anyhow::bail!("twitch refresh token failed: status={status} body={body}");
		}

		let parsed: TwitchTokenRefreshResponse =
			serde_json::from_str(&body).context("twitch refresh token parse json")?;

		self.tokens.rotate(
			SecretString::new(parsed.access_token),
			parsed.refresh_token.map(SecretString::new),
		);
		info!(expires_in = parsed.expires_in, "refreshed user OAuth token");
		Ok(())
	}
}

/// Wraps a gateway so that an authorization failure triggers one refresh and one retry.
#[derive(Debug, Clone)]
pub struct RefreshingGateway<G, R> {
	inner: G,
	refresher: R,
}

impl<G, R> RefreshingGateway<G, R>
where
	G: AuthGateway,
	R: TokenRefresher,
{
	pub fn new(inner: G, refresher: R) -> Self {
		Self { inner, refresher }
	}

	async fn refresh_after(&self, err: EndpointError, endpoint: &str) -> Result<(), EndpointError> {
		warn!(%endpoint, error = %err, "authorization failed; refreshing credentials");
		metrics::counter!("twitchsub_token_refresh_total").increment(1);
		self.refresher.refresh().await.map_err(EndpointError::Refresh)
	}
}

#[async_trait]
impl<G, R> AuthGateway for RefreshingGateway<G, R>
where
	G: AuthGateway,
	R: TokenRefresher,
{
	async fn get(&self, endpoint: &str) -> Result<serde_json::Value, EndpointError> {
		match self.inner.get(endpoint).await {
			Err(e) if e.is_unauthorized() => {
				self.refresh_after(e, endpoint).await?;
				self.inner.get(endpoint).await
			}
			other => other,
		}
	}

	async fn post(&self, endpoint: &str, body: &serde_json::Value) -> Result<serde_json::Value, EndpointError> {
		match self.inner.post(endpoint, body).await {
			Err(e) if e.is_unauthorized() => {
				self.refresh_after(e, endpoint).await?;
				self.inner.post(endpoint, body).await
			}
			other => other,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwitchTokenValidation {
	#[serde(default)]
	pub client_id: String,
	pub login: String,
	pub user_id: String,
	#[serde(default)]
	pub expires_in: u64,
	#[serde(default)]
	pub scopes: Vec<String>,
}

/// Validate a user token and discover the identity it belongs to.
pub async fn validate_user_token(access_token: &SecretString) -> anyhow::Result<TwitchTokenValidation> {
	let http = build_http("oauth-validate")?;
	let resp = http
		.get(TOKEN_VALIDATE_URL)
		.header("Authorization", format!("OAuth {}", access_token.expose()))
		.send()
		.await
		.context("twitch validate token request")?;

	let status = resp.status();
	let body = resp.text().await.context("twitch validate token read body")?;

	if !status.is_success() {
		anyhow::bail!("twitch validate token failed: status={status} body={body}");
	}

	serde_json::from_str(&body).context("twitch validate token parse json")
}

#[derive(Debug, Serialize)]
struct HelixCreateSubscriptionRequest<'a> {
	#[serde(rename = "type")]
	r#type: &'static str,
	version: &'static str,
	condition: Condition<'a>,
	transport: HelixWebsocketTransport<'a>,
}

#[derive(Debug, Serialize)]
struct HelixWebsocketTransport<'a> {
	method: &'static str,
	session_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct HelixCreateSubscriptionResponse {
	#[serde(default)]
	pub data: Vec<HelixSubscriptionData>,

	#[allow(dead_code)]
	#[serde(default)]
	pub total_cost: Option<u64>,

	#[allow(dead_code)]
	#[serde(default)]
	pub max_total_cost: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct HelixSubscriptionData {
	pub id: String,

	#[serde(default)]
	pub status: String,

	#[allow(dead_code)]
	#[serde(rename = "type", default)]
	pub r#type: String,
}

/// Subscription request body bound to the WebSocket transport of `session_id`.
pub fn subscription_body(
	entry: &CatalogEntry,
	condition: Condition<'_>,
	session_id: &str,
) -> Result<serde_json::Value, EndpointError> {
	let req = HelixCreateSubscriptionRequest {
		r#type: entry.wire_type,
		version: entry.version,
		condition,
		transport: HelixWebsocketTransport {
			method: "websocket",
			session_id,
		},
	};
	Ok(serde_json::to_value(req)?)
}

/// POST one EventSub subscription.
pub async fn create_eventsub_subscription(
	gateway: &dyn AuthGateway,
	entry: &CatalogEntry,
	condition: Condition<'_>,
	session_id: &str,
) -> Result<HelixCreateSubscriptionResponse, EndpointError> {
	let body = subscription_body(entry, condition, session_id)?;
	let resp = gateway.post(EVENTSUB_SUBSCRIPTIONS_ENDPOINT, &body).await?;
	if resp.is_null() {
		return Ok(HelixCreateSubscriptionResponse {
			data: Vec::new(),
			total_cost: None,
			max_total_cost: None,
		});
	}
	Ok(serde_json::from_value(resp)?)
}

#[derive(Debug, Deserialize)]
struct HelixDataResponse<T> {
	#[serde(default = "Vec::new")]
	data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixCustomReward {
	pub id: String,
	pub title: String,
}

/// Titles compare equal after removing spaces and lowercasing.
pub fn normalize_reward_title(title: &str) -> String {
	title.chars().filter(|c| *c != ' ').collect::<String>().to_lowercase()
}

/// List the channel's custom rewards.
pub async fn get_custom_rewards(
	gateway: &dyn AuthGateway,
	broadcaster_id: &str,
) -> Result<Vec<HelixCustomReward>, EndpointError> {
	let endpoint = format!(
		"channel_points/custom_rewards?broadcaster_id={}",
		urlencoding::encode(broadcaster_id)
	);
	let resp = gateway.get(&endpoint).await?;
	if resp.is_null() {
		return Ok(Vec::new());
	}
	let parsed: HelixDataResponse<HelixCustomReward> = serde_json::from_value(resp)?;
	Ok(parsed.data)
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixUser {
	pub id: String,
	pub login: String,

	#[serde(default)]
	pub display_name: Option<String>,
}

/// Resolve a login to a user.
pub async fn get_user_by_login(gateway: &dyn AuthGateway, login: &str) -> Result<Option<HelixUser>, EndpointError> {
	let endpoint = format!("users?login={}", urlencoding::encode(login));
	let resp = gateway.get(&endpoint).await?;
	if resp.is_null() {
		return Ok(None);
	}
	let parsed: HelixDataResponse<HelixUser> = serde_json::from_value(resp)?;
	Ok(parsed.data.into_iter().next())
}
