use std::sync::Arc;

use serenity::cache::Cache;
use serenity::http::Http;
use serenity::model::id::{ChannelId, GuildId, UserId};

use crate::queue::{self, QueueManager};
use crate::registry::InstanceState;

/// Everything one bot instance owns: its gateway cache, REST handle, voice
/// manager, and its per-guild queue table. Built once in the client setup
/// hook and shared from there.
pub struct InstanceContext {
    pub token_index: usize,
    pub bot_id: UserId,
    pub cache: Arc<Cache>,
    pub http: Arc<Http>,
    pub songbird: Arc<songbird::Songbird>,
    pub queues: QueueManager,
}

impl InstanceContext {
    pub fn is_primary(&self) -> bool {
        self.token_index == 0
    }
}

/// Adapts the full gateway cache down to the three facts the resolver
/// consumes. Reads are cheap cache hits; nothing here blocks.
impl InstanceState for InstanceContext {
    fn is_guild_member(&self, guild_id: GuildId) -> bool {
        self.cache.guild(guild_id).is_some()
    }

    fn current_voice_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        let guild = self.cache.guild(guild_id)?;
        let voice_state = guild.voice_states.get(&self.bot_id)?;
        voice_state.channel_id
    }

    fn queue_voice_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        queue::bound_channel(&self.queues, guild_id)
    }
}
