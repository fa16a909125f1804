#![forbid(unsafe_code)]

//! Typed `payload.event` bodies, one per supported subscription type.

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ChannelChatMessageEvent {
	#[allow(dead_code)]
	#[serde(default)]
	pub broadcaster_user_id: String,

	pub chatter_user_id: String,
	#[serde(default)]
	pub chatter_user_login: String,
	pub chatter_user_name: String,

	pub message_id: String,
	pub message: ChatMessageContent,

	#[serde(default)]
	pub cheer: Option<ChatCheer>,
	#[serde(default)]
	pub reply: Option<ChatReply>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessageContent {
	pub text: String,
	#[serde(default)]
	pub fragments: Vec<ChatMessageFragment>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessageFragment {
	#[allow(dead_code)]
	#[serde(rename = "type", default)]
	pub kind: String,
	#[allow(dead_code)]
	#[serde(default)]
	pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatCheer {
	#[allow(dead_code)]
	#[serde(default)]
	pub bits: u64,
}

#[derive(Debug, Deserialize)]
pub struct ChatReply {
	#[serde(default)]
	pub parent_message_id: Option<String>,
	#[serde(default)]
	pub thread_message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserEvent {
	pub user_id: String,
	#[allow(dead_code)]
	#[serde(default)]
	pub user_login: String,
	pub user_name: String,
}

#[derive(Debug, Deserialize)]
pub struct ChannelBanEvent {
	pub user_id: String,
	pub user_name: String,

	#[serde(default)]
	pub moderator_user_name: Option<String>,

	#[serde(default)]
	pub reason: Option<String>,

	#[serde(default)]
	pub banned_at: Option<String>,

	/// RFC3339 timestamp if timeout; null if permanent ban.
	#[serde(default)]
	pub ends_at: Option<String>,

	#[serde(default)]
	pub is_permanent: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChannelSubscribeEvent {
	pub user_id: String,
	pub user_name: String,
	#[serde(default)]
	pub tier: String,
	#[serde(default)]
	pub is_gift: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChannelSubscriptionGiftEvent {
	#[serde(default)]
	pub user_name: Option<String>,
	#[serde(default)]
	pub tier: String,
	#[serde(default)]
	pub total: u64,
	#[serde(default)]
	pub cumulative_total: Option<u64>,
	#[serde(default)]
	pub is_anonymous: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChannelSubscriptionMessageEvent {
	pub user_name: String,
	#[serde(default)]
	pub tier: String,
	pub message: MessageText,
	#[serde(default)]
	pub cumulative_months: u64,
	#[serde(default)]
	pub streak_months: Option<u64>,
	#[serde(default)]
	pub duration_months: u64,
}

#[derive(Debug, Deserialize)]
pub struct MessageText {
	#[serde(default)]
	pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ChannelRaidEvent {
	pub from_broadcaster_user_id: String,
	#[allow(dead_code)]
	#[serde(default)]
	pub from_broadcaster_user_login: String,
	pub from_broadcaster_user_name: String,

	pub to_broadcaster_user_id: String,
	#[allow(dead_code)]
	#[serde(default)]
	pub to_broadcaster_user_login: String,
	pub to_broadcaster_user_name: String,

	pub viewers: u64,
}

#[derive(Debug, Deserialize)]
pub struct ChannelRewardRedemptionEvent {
	#[allow(dead_code)]
	#[serde(default)]
	pub id: String,
	pub broadcaster_user_id: String,
	pub user_id: String,
	pub user_name: String,
	#[serde(default)]
	pub user_input: String,
	pub reward: RedemptionReward,
}

#[derive(Debug, Deserialize)]
pub struct RedemptionReward {
	pub id: String,
	pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct ChannelCheerEvent {
	#[serde(default)]
	pub is_anonymous: bool,

	#[serde(default)]
	pub user_name: Option<String>,

	#[serde(default)]
	pub message: Option<String>,

	pub bits: u64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PollChoice {
	#[serde(default)]
	pub id: String,
	pub title: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub votes: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub channel_points_votes: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub bits_votes: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct VotingSettings {
	#[serde(default)]
	pub is_enabled: bool,
	#[serde(default)]
	pub amount_per_vote: u64,
}

#[derive(Debug, Deserialize)]
pub struct ChannelPollEvent {
	pub title: String,
	#[serde(default)]
	pub choices: Vec<PollChoice>,
	#[serde(default)]
	pub bits_voting: VotingSettings,
	#[serde(default)]
	pub channel_points_voting: VotingSettings,
	#[serde(default)]
	pub started_at: Option<String>,
	#[serde(default)]
	pub ends_at: Option<String>,
	#[serde(default)]
	pub status: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PredictionOutcome {
	#[serde(default)]
	pub id: String,
	pub title: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub users: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub channel_points: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelPredictionEvent {
	pub title: String,
	#[serde(default)]
	pub outcomes: Vec<PredictionOutcome>,
	#[serde(default)]
	pub started_at: Option<String>,
	#[serde(default)]
	pub locks_at: Option<String>,
	#[serde(default)]
	pub winning_outcome_id: Option<String>,
	#[serde(default)]
	pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamOnlineEvent {
	#[serde(rename = "type", default)]
	pub kind: String,
	#[serde(default)]
	pub started_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamOfflineEvent {
	#[serde(default)]
	pub broadcaster_user_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelBitsUseEvent {
	pub user_name: String,
	pub bits: u64,
	#[serde(rename = "type", default)]
	pub kind: String,
	#[serde(default)]
	pub power_up: Option<BitsPowerUp>,
	#[serde(default)]
	pub message: Option<MessageText>,
}

#[derive(Debug, Deserialize)]
pub struct BitsPowerUp {
	#[serde(rename = "type", default)]
	pub kind: String,
}
