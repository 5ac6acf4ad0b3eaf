use crate::registry::{BotInstance, BotRegistry};
use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;
use tracing::{debug, warn};

/// Snapshot of one instance's view of a guild, taken fresh on every
/// decision. Never cached across calls.
struct InstanceView {
    instance: BotInstance,
    current_vc: Option<ChannelId>,
    queue_vc: Option<ChannelId>,
}

impl InstanceView {
    fn is_free(&self) -> bool {
        self.current_vc.is_none() && self.queue_vc.is_none()
    }
}

/// Single source of truth for "which instance should act", so two instances
/// never join or control the same voice channel at once. There is no lock
/// server; every operation re-derives its answer from the instances'
/// locally-observed state and a deterministic tie-break. Operations never
/// fail: missing data reads as "not responsible".
pub struct ResponsibilityResolver {
    registry: Arc<BotRegistry>,
    multi_instance: bool,
}

impl ResponsibilityResolver {
    pub fn new(registry: Arc<BotRegistry>, multi_instance: bool) -> Self {
        Self {
            registry,
            multi_instance,
        }
    }

    fn guild_views(&self, guild_id: GuildId) -> Vec<InstanceView> {
        self.registry
            .bots()
            .into_iter()
            .filter(|b| b.state.is_guild_member(guild_id))
            .map(|instance| InstanceView {
                current_vc: instance.state.current_voice_channel(guild_id),
                queue_vc: instance.state.queue_voice_channel(guild_id),
                instance,
            })
            .collect()
    }

    /// Default responsibility for decisions with no voice-channel context:
    /// the primary if it is in the guild, else the lowest-index member,
    /// else the originating instance (some instance must always answer).
    pub fn responsible_bot(&self, guild_id: GuildId, origin: &BotInstance) -> BotInstance {
        if !self.multi_instance {
            return origin.clone();
        }

        let views = self.guild_views(guild_id);
        if let Some(primary) = views.iter().find(|v| v.instance.is_primary()) {
            return primary.instance.clone();
        }
        // bots() is index-ordered, so the first member is the lowest index
        if let Some(first) = views.first() {
            return first.instance.clone();
        }
        origin.clone()
    }

    /// Which instance owns (or may claim) a specific voice channel.
    ///
    /// Tie-break, in priority order:
    ///   1. a queue already bound to this channel wins outright;
    ///   2. an instance physically connected here (and not bound elsewhere)
    ///      wins next;
    ///   3. otherwise a completely free instance is claimed, primary first,
    ///      then lowest token index;
    ///   4. nobody free and nobody here: None. The request is dropped rather
    ///      than interrupting unrelated playback.
    ///
    /// An instance whose queue is bound to a different channel is never
    /// selected, idle or not.
    pub fn bot_for_voice_channel(
        &self,
        guild_id: GuildId,
        voice_channel_id: ChannelId,
    ) -> Option<BotInstance> {
        let views = self.guild_views(guild_id);

        if let Some(bound) = views.iter().find(|v| v.queue_vc == Some(voice_channel_id)) {
            debug!(
                guild = guild_id.get(),
                channel = voice_channel_id.get(),
                bot = bound.instance.bot_id.get(),
                "voice channel already bound to an active queue"
            );
            return Some(bound.instance.clone());
        }

        if let Some(present) = views
            .iter()
            .find(|v| v.current_vc == Some(voice_channel_id) && v.queue_vc.is_none())
        {
            return Some(present.instance.clone());
        }

        let free: Vec<&InstanceView> = views.iter().filter(|v| v.is_free()).collect();
        if let Some(primary) = free.iter().find(|v| v.instance.is_primary()) {
            return Some(primary.instance.clone());
        }
        free.first().map(|v| v.instance.clone())
    }

    /// True iff `bot` is a guild member and is the default responsible
    /// instance for the guild.
    pub fn should_respond(&self, bot: &BotInstance, guild_id: GuildId) -> bool {
        if !bot.state.is_guild_member(guild_id) {
            return false;
        }
        self.responsible_bot(guild_id, bot).bot_id == bot.bot_id
    }

    /// Gate for music commands, keyed off the invoking user's voice channel
    /// rather than the bot's: the owner of that channel answers, and a free
    /// instance designated to claim it answers too (it joins on dispatch).
    ///
    /// The local in-channel check (member voice state OR queue binding, a
    /// union because a just-dispatched join may not be visible in the
    /// member cache yet) can disagree with the recomputed ownership in the
    /// join/cache race window. The resolver is authoritative: disagreement
    /// is logged as a CONFLICT and fails closed.
    pub fn should_respond_to_music(
        &self,
        bot: &BotInstance,
        guild_id: GuildId,
        user_voice_channel: Option<ChannelId>,
    ) -> bool {
        let Some(user_vc) = user_voice_channel else {
            // User is not in voice: fall back to the default gate.
            return self.should_respond(bot, guild_id);
        };

        if !bot.state.is_guild_member(guild_id) {
            return false;
        }

        let current_vc = bot.state.current_voice_channel(guild_id);
        let queue_vc = bot.state.queue_voice_channel(guild_id);
        let in_channel = current_vc == Some(user_vc) || queue_vc == Some(user_vc);

        match self.bot_for_voice_channel(guild_id, user_vc) {
            Some(owner) if owner.bot_id == bot.bot_id => true,
            owner => {
                if in_channel {
                    warn!(
                        guild = guild_id.get(),
                        channel = user_vc.get(),
                        bot = bot.bot_id.get(),
                        owner = owner.map(|o| o.bot_id.get()),
                        "CONFLICT: in-channel check passed but ownership resolution disagrees; rejecting"
                    );
                }
                false
            }
        }
    }

    /// Gate for voice-triggered flows (no command message involved).
    pub fn should_respond_to_voice(
        &self,
        bot: &BotInstance,
        guild_id: GuildId,
        voice_channel_id: ChannelId,
    ) -> bool {
        self.bot_for_voice_channel(guild_id, voice_channel_id)
            .is_some_and(|owner| owner.bot_id == bot.bot_id)
    }
}
