#![forbid(unsafe_code)]

use anyhow::Context;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use twitchsub_domain::{EventKind, Fields};

use super::Normalized;
use crate::eventsub::NotificationEnvelope;
use crate::eventsub::events::*;

const NO_TEXT: &[&str] = &[];

fn decode<T: DeserializeOwned>(env: NotificationEnvelope) -> anyhow::Result<T> {
	let ty = env.wire_type;
	serde_json::from_value(env.event).with_context(|| format!("decode {ty} event"))
}

fn compact_json<T: serde::Serialize>(v: &T) -> anyhow::Result<String> {
	serde_json::to_string(v).context("render nested field as json")
}

fn normalized(kind: EventKind, fields: Fields, text_fields: &'static [&'static str]) -> Option<Normalized> {
	Some(Normalized {
		kind,
		fields,
		text_fields,
	})
}

/// Extract the normalized field set for one notification.
///
/// `Ok(None)` means the frame is well-formed but has no route (unknown type or not addressed to this channel).
pub(crate) fn extract(env: NotificationEnvelope, channel_id: &str) -> anyhow::Result<Option<Normalized>> {
	let wire_type = env.wire_type.clone();
	match wire_type.as_str() {
		"channel.chat.message" => chat_message(decode(env)?),
		"channel.follow" => Ok(user_event(EventKind::Follow, decode(env)?)),
		"channel.ban" => ban(decode(env)?),
		"channel.unban" => Ok(user_event(EventKind::Unban, decode(env)?)),
		"channel.subscribe" => subscribe(decode(env)?),
		"channel.subscription.end" => Ok(user_event(EventKind::SubscribeEnd, decode(env)?)),
		"channel.subscription.gift" => subgift(decode(env)?),
		"channel.subscription.message" => resub(decode(env)?),
		"channel.raid" => Ok(raid(decode(env)?, channel_id)),
		"channel.channel_points_custom_reward_redemption.add" => Ok(reward(decode(env)?, channel_id)),
		"channel.cheer" => cheer(decode(env)?),
		"channel.poll.begin" => poll_begin(decode(env)?),
		"channel.poll.end" => poll_end(decode(env)?),
		"channel.prediction.begin" => prediction_begin(decode(env)?),
		"channel.prediction.lock" => prediction_lock(decode(env)?),
		"channel.prediction.end" => prediction_end(decode(env)?),
		"channel.vip.add" => Ok(user_event(EventKind::VipAdd, decode(env)?)),
		"channel.vip.remove" => Ok(user_event(EventKind::VipRemove, decode(env)?)),
		"stream.online" => stream_online(decode(env)?),
		"stream.offline" => stream_offline(decode(env)?),
		"channel.bits.use" => bits(decode(env)?),
		other => {
			warn!(subscription_type = %other, "no extraction rule for notification; dropping");
			Ok(None)
		}
	}
}

fn chat_message(ev: ChannelChatMessageEvent) -> anyhow::Result<Option<Normalized>> {
	let (thread_id, parent_id) = match ev.reply {
		Some(r) => (r.thread_message_id, r.parent_message_id),
		None => (None, None),
	};

	let fields = Fields::new()
		.with("id", ev.message_id)
		.with("user_id", ev.chatter_user_id)
		.with("user_name", ev.chatter_user_name)
		.with("text", ev.message.text)
		.with("cheer", ev.cheer.is_some())
		.with("emote", ev.message.fragments.len() > 1)
		.with("thread_id", thread_id)
		.with("parent_id", parent_id);

	Ok(normalized(EventKind::Message, fields, &["text"]))
}

fn user_event(kind: EventKind, ev: UserEvent) -> Option<Normalized> {
	let fields = Fields::new().with("user_id", ev.user_id).with("user_name", ev.user_name);
	normalized(kind, fields, NO_TEXT)
}

fn ban(ev: ChannelBanEvent) -> anyhow::Result<Option<Normalized>> {
	let fields = Fields::new()
		.with("user_id", ev.user_id)
		.with("user_name", ev.user_name)
		.with("moderator_name", ev.moderator_user_name)
		.with("reason", ev.reason)
		.with("start_ban", ev.banned_at)
		.with("end_ban", ev.ends_at)
		.with("is_permanent", ev.is_permanent);

	Ok(normalized(EventKind::Ban, fields, &["reason"]))
}

fn subscribe(ev: ChannelSubscribeEvent) -> anyhow::Result<Option<Normalized>> {
	let fields = Fields::new()
		.with("user_id", ev.user_id)
		.with("user_name", ev.user_name)
		.with("tier", ev.tier)
		.with("is_gift", ev.is_gift);

	Ok(normalized(EventKind::Subscribe, fields, NO_TEXT))
}

fn subgift(ev: ChannelSubscriptionGiftEvent) -> anyhow::Result<Option<Normalized>> {
	let fields = Fields::new()
		.with("user_name", ev.user_name)
		.with("tier", ev.tier)
		.with("total", ev.total)
		.with("total_gift_sub", ev.cumulative_total)
		.with("is_anonymous", ev.is_anonymous);

	Ok(normalized(EventKind::Subgift, fields, NO_TEXT))
}

fn resub(ev: ChannelSubscriptionMessageEvent) -> anyhow::Result<Option<Normalized>> {
	let fields = Fields::new()
		.with("user_name", ev.user_name)
		.with("tier", ev.tier)
		.with("streak", ev.streak_months)
		.with("total", ev.cumulative_months)
		.with("duration", ev.duration_months)
		.with("message", ev.message.text);

	Ok(normalized(EventKind::ResubMessage, fields, &["message"]))
}

fn raid(ev: ChannelRaidEvent, channel_id: &str) -> Option<Normalized> {
	if ev.to_broadcaster_user_id == channel_id {
		let fields = Fields::new()
			.with("source", ev.from_broadcaster_user_name)
			.with("nb_viewers", ev.viewers);
		return normalized(EventKind::Raid, fields, NO_TEXT);
	}

	if ev.from_broadcaster_user_id == channel_id {
		let fields = Fields::new()
			.with("dest", ev.to_broadcaster_user_name)
			.with("nb_viewers", ev.viewers);
		return normalized(EventKind::RaidSomeone, fields, NO_TEXT);
	}

	warn!(
		from = %ev.from_broadcaster_user_id,
		to = %ev.to_broadcaster_user_id,
		%channel_id,
		"raid does not involve configured channel; dropping"
	);
	None
}

fn reward(ev: ChannelRewardRedemptionEvent, channel_id: &str) -> Option<Normalized> {
	if ev.broadcaster_user_id != channel_id {
		warn!(
			broadcaster_user_id = %ev.broadcaster_user_id,
			%channel_id,
			"reward redemption for another channel; dropping"
		);
		return None;
	}

	let fields = Fields::new()
		.with("user_id", ev.user_id)
		.with("user_name", ev.user_name)
		.with("reward_name", ev.reward.title)
		.with("reward_id", ev.reward.id)
		.with("user_input", ev.user_input);

	normalized(EventKind::ChannelPointAction, fields, &["user_input"])
}

fn cheer(ev: ChannelCheerEvent) -> anyhow::Result<Option<Normalized>> {
	let fields = Fields::new()
		.with("user_name", ev.user_name)
		.with("message", ev.message)
		.with("nb_bits", ev.bits)
		.with("is_anonymous", ev.is_anonymous);

	Ok(normalized(EventKind::ChannelCheer, fields, &["message"]))
}

fn poll_begin(ev: ChannelPollEvent) -> anyhow::Result<Option<Normalized>> {
	let fields = Fields::new()
		.with("title", ev.title)
		.with("choices", compact_json(&ev.choices)?)
		.with("bits_settings", compact_json(&ev.bits_voting)?)
		.with("channel_points_settings", compact_json(&ev.channel_points_voting)?)
		.with("start_date", ev.started_at)
		.with("end_date", ev.ends_at);

	Ok(normalized(EventKind::PollBegin, fields, NO_TEXT))
}

fn poll_end(ev: ChannelPollEvent) -> anyhow::Result<Option<Normalized>> {
	let fields = Fields::new()
		.with("title", ev.title)
		.with("choices", compact_json(&ev.choices)?)
		.with("status", ev.status);

	Ok(normalized(EventKind::PollEnd, fields, NO_TEXT))
}

fn prediction_begin(ev: ChannelPredictionEvent) -> anyhow::Result<Option<Normalized>> {
	let fields = Fields::new()
		.with("title", ev.title)
		.with("choices", compact_json(&ev.outcomes)?)
		.with("start_date", ev.started_at)
		.with("lock_date", ev.locks_at);

	Ok(normalized(EventKind::PredictionBegin, fields, NO_TEXT))
}

fn prediction_lock(ev: ChannelPredictionEvent) -> anyhow::Result<Option<Normalized>> {
	let fields = Fields::new()
		.with("title", ev.title)
		.with("result", compact_json(&ev.outcomes)?);

	Ok(normalized(EventKind::PredictionLock, fields, NO_TEXT))
}

fn prediction_end(ev: ChannelPredictionEvent) -> anyhow::Result<Option<Normalized>> {
	let winning = ev
		.winning_outcome_id
		.as_deref()
		.and_then(|id| ev.outcomes.iter().find(|o| o.id == id))
		.map(|o| o.title.clone());

	if winning.is_none() {
		debug!(title = %ev.title, "prediction ended without a winner");
	}

	let fields = Fields::new()
		.with("title", ev.title)
		.with("result", ev.status)
		.with("winning_pred", winning);

	Ok(normalized(EventKind::PredictionEnd, fields, NO_TEXT))
}

fn stream_online(ev: StreamOnlineEvent) -> anyhow::Result<Option<Normalized>> {
	let fields = Fields::new().with("type", ev.kind).with("start_time", ev.started_at);
	Ok(normalized(EventKind::StreamOnline, fields, NO_TEXT))
}

fn stream_offline(ev: StreamOfflineEvent) -> anyhow::Result<Option<Normalized>> {
	let fields = Fields::new().with("broadcaster_name", ev.broadcaster_user_name);
	Ok(normalized(EventKind::StreamOffline, fields, NO_TEXT))
}

fn bits(ev: ChannelBitsUseEvent) -> anyhow::Result<Option<Normalized>> {
	let fields = Fields::new()
		.with("user_name", ev.user_name)
		.with("bits", ev.bits)
		.with("type", ev.kind)
		.with("power_up", ev.power_up.map(|p| p.kind))
		.with("message", ev.message.map(|m| m.text));

	Ok(normalized(EventKind::Bits, fields, &["message"]))
}
