#![forbid(unsafe_code)]

//! Static mapping from event kind to wire subscription template.

use serde::Serialize;
use twitchsub_domain::EventKind;

/// Shape of the `condition` object a subscription needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionShape {
	/// `{broadcaster_user_id}`
	Broadcaster,
	/// `{broadcaster_user_id, user_id}` where `user_id` is the authenticated identity.
	BroadcasterAndUser,
	/// `{broadcaster_user_id, moderator_user_id}` where the moderator is the authenticated identity.
	BroadcasterAndModerator,
	/// `{broadcaster_user_id}` or `{broadcaster_user_id, reward_id}` when narrowed to one reward.
	BroadcasterAndReward,
	/// `{to_broadcaster_user_id}`
	ToBroadcaster,
	/// `{from_broadcaster_user_id}`
	FromBroadcaster,
}

/// Wire-level `condition` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Condition<'a> {
	BroadcasterAndUser {
		broadcaster_user_id: &'a str,
		user_id: &'a str,
	},
	BroadcasterAndModerator {
		broadcaster_user_id: &'a str,
		moderator_user_id: &'a str,
	},
	BroadcasterAndReward {
		broadcaster_user_id: &'a str,
		reward_id: &'a str,
	},
	Broadcaster {
		broadcaster_user_id: &'a str,
	},
	ToBroadcaster {
		to_broadcaster_user_id: &'a str,
	},
	FromBroadcaster {
		from_broadcaster_user_id: &'a str,
	},
}

impl ConditionShape {
	/// Build the condition for `channel_id` as seen by the authenticated `user_id`.
	pub fn build<'a>(self, channel_id: &'a str, user_id: &'a str, reward_id: Option<&'a str>) -> Condition<'a> {
		match self {
			ConditionShape::Broadcaster => Condition::Broadcaster {
				broadcaster_user_id: channel_id,
			},
			ConditionShape::BroadcasterAndUser => Condition::BroadcasterAndUser {
				broadcaster_user_id: channel_id,
				user_id,
			},
			ConditionShape::BroadcasterAndModerator => Condition::BroadcasterAndModerator {
				broadcaster_user_id: channel_id,
				moderator_user_id: user_id,
			},
			ConditionShape::BroadcasterAndReward => match reward_id {
				Some(reward_id) => Condition::BroadcasterAndReward {
					broadcaster_user_id: channel_id,
					reward_id,
				},
				None => Condition::Broadcaster {
					broadcaster_user_id: channel_id,
				},
			},
			ConditionShape::ToBroadcaster => Condition::ToBroadcaster {
				to_broadcaster_user_id: channel_id,
			},
			ConditionShape::FromBroadcaster => Condition::FromBroadcaster {
				from_broadcaster_user_id: channel_id,
			},
		}
	}
}

/// One catalog row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
	pub kind: EventKind,
	pub wire_type: &'static str,
	pub version: &'static str,
	pub condition: ConditionShape,
	pub scopes: &'static [&'static str],
	/// Requires the authenticated identity to be the broadcaster itself.
	pub broadcaster_only: bool,
}

const fn row(
	kind: EventKind,
	wire_type: &'static str,
	version: &'static str,
	condition: ConditionShape,
	scopes: &'static [&'static str],
	broadcaster_only: bool,
) -> CatalogEntry {
	CatalogEntry {
		kind,
		wire_type,
		version,
		condition,
		scopes,
		broadcaster_only,
	}
}

const SUB_SCOPES: &[&str] = &["channel:read:subscriptions"];
const POLL_SCOPES: &[&str] = &["channel:read:polls", "channel:manage:polls"];
const PREDICTION_SCOPES: &[&str] = &["channel:read:predictions", "channel:manage:predictions"];
const VIP_SCOPES: &[&str] = &["channel:read:vips", "channel:manage:vips"];

static CATALOG: [CatalogEntry; 22] = {
	use ConditionShape::*;
	use EventKind as K;
	[
		row(
			K::Message,
			"channel.chat.message",
			"1",
			BroadcasterAndUser,
			&["user:read:chat", "user:bot", "channel:bot"],
			false,
		),
		row(
			K::Follow,
			"channel.follow",
			"2",
			BroadcasterAndModerator,
			&["moderator:read:followers"],
			false,
		),
		row(K::Ban, "channel.ban", "1", Broadcaster, &["channel:moderate"], true),
		row(K::Unban, "channel.unban", "1", Broadcaster, &["channel:moderate"], true),
		row(K::Subscribe, "channel.subscribe", "1", Broadcaster, SUB_SCOPES, true),
		row(K::SubscribeEnd, "channel.subscription.end", "1", Broadcaster, SUB_SCOPES, true),
		row(K::Subgift, "channel.subscription.gift", "1", Broadcaster, SUB_SCOPES, true),
		row(K::ResubMessage, "channel.subscription.message", "1", Broadcaster, SUB_SCOPES, true),
		row(K::Raid, "channel.raid", "1", ToBroadcaster, &[], false),
		row(K::RaidSomeone, "channel.raid", "1", FromBroadcaster, &[], false),
		row(
			K::ChannelPointAction,
			"channel.channel_points_custom_reward_redemption.add",
			"1",
			BroadcasterAndReward,
			&["channel:read:redemptions", "channel:manage:redemptions"],
			true,
		),
		row(K::ChannelCheer, "channel.cheer", "1", Broadcaster, &["bits:read"], true),
		row(K::PollBegin, "channel.poll.begin", "1", Broadcaster, POLL_SCOPES, true),
		row(K::PollEnd, "channel.poll.end", "1", Broadcaster, POLL_SCOPES, true),
		row(K::PredictionBegin, "channel.prediction.begin", "1", Broadcaster, PREDICTION_SCOPES, true),
		row(K::PredictionLock, "channel.prediction.lock", "1", Broadcaster, PREDICTION_SCOPES, true),
		row(K::PredictionEnd, "channel.prediction.end", "1", Broadcaster, PREDICTION_SCOPES, true),
		row(K::VipAdd, "channel.vip.add", "1", Broadcaster, VIP_SCOPES, true),
		row(K::VipRemove, "channel.vip.remove", "1", Broadcaster, VIP_SCOPES, true),
		row(K::StreamOnline, "stream.online", "1", Broadcaster, &[], false),
		row(K::StreamOffline, "stream.offline", "1", Broadcaster, &[], false),
		row(K::Bits, "channel.bits.use", "beta", Broadcaster, &["bits:read"], true),
	]
};

/// Catalog row for `kind`.
pub fn entry(kind: EventKind) -> &'static CatalogEntry {
	match kind {
		EventKind::Message => &CATALOG[0],
		EventKind::Follow => &CATALOG[1],
		EventKind::Ban => &CATALOG[2],
		EventKind::Unban => &CATALOG[3],
		EventKind::Subscribe => &CATALOG[4],
		EventKind::SubscribeEnd => &CATALOG[5],
		EventKind::Subgift => &CATALOG[6],
		EventKind::ResubMessage => &CATALOG[7],
		EventKind::Raid => &CATALOG[8],
		EventKind::RaidSomeone => &CATALOG[9],
		EventKind::ChannelPointAction => &CATALOG[10],
		EventKind::ChannelCheer => &CATALOG[11],
		EventKind::PollBegin => &CATALOG[12],
		EventKind::PollEnd => &CATALOG[13],
		EventKind::PredictionBegin => &CATALOG[14],
		EventKind::PredictionLock => &CATALOG[15],
		EventKind::PredictionEnd => &CATALOG[16],
		EventKind::VipAdd => &CATALOG[17],
		EventKind::VipRemove => &CATALOG[18],
		EventKind::StreamOnline => &CATALOG[19],
		EventKind::StreamOffline => &CATALOG[20],
		EventKind::Bits => &CATALOG[21],
	}
}

/// Deduplicated scopes needed for `kinds`, in first-seen order.
pub fn required_scopes(kinds: impl IntoIterator<Item = EventKind>) -> Vec<&'static str> {
	let mut out: Vec<&'static str> = Vec::new();
	for kind in kinds {
		for scope in entry(kind).scopes {
			if !out.contains(scope) {
				out.push(scope);
			}
		}
	}
	out
}
