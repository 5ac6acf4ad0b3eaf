use serenity::model::id::{ChannelId, GuildId, UserId};
use serenity::model::voice::VoiceState;
use tracing::{debug, info};

use crate::queue;
use crate::Data;

/// React to a voice-state change: follow forced moves, tear down on forced
/// disconnects, and pause/resume around an empty channel. The pending
/// empty-channel timer is replaced on every new event, never stacked.
pub async fn handle_voice_state_update(data: &Data, old: Option<&VoiceState>, new: &VoiceState) {
    let Some(guild_id) = new.guild_id.or_else(|| old.and_then(|o| o.guild_id)) else {
        return;
    };

    if new.user_id == data.ictx.bot_id {
        handle_own_state(data, guild_id, new).await;
        return;
    }

    let Some(bound) = queue::bound_channel(&data.ictx.queues, guild_id) else {
        return;
    };
    let affected = old.and_then(|o| o.channel_id) == Some(bound) || new.channel_id == Some(bound);
    if !affected {
        return;
    }

    if human_listeners(data, guild_id, bound) == 0 {
        pause_for_empty_channel(data, guild_id).await;
    } else {
        resume_for_listeners(data, guild_id).await;
    }
}

async fn handle_own_state(data: &Data, guild_id: GuildId, new: &VoiceState) {
    match new.channel_id {
        None => {
            // Kicked or force-disconnected while a queue was live.
            if queue::bound_channel(&data.ictx.queues, guild_id).is_some() {
                info!(
                    guild = guild_id.get(),
                    "disconnected from voice with an active queue, tearing down"
                );
                data.driver.destroy(guild_id).await;
                let _ = data
                    .db
                    .clear_queue_snapshot(guild_id.get(), data.ictx.bot_id.get());
            }
        }
        Some(channel) => {
            // Dragged to another channel by an admin: the binding follows.
            let bound = queue::bound_channel(&data.ictx.queues, guild_id);
            if bound.is_some() && bound != Some(channel) {
                debug!(
                    guild = guild_id.get(),
                    channel = channel.get(),
                    "moved between voice channels, rebinding queue"
                );
                queue::bind_channel(&data.ictx.queues, guild_id, channel, None);
            }
        }
    }
}

async fn pause_for_empty_channel(data: &Data, guild_id: GuildId) {
    if let Some(handle) = queue::track_handle(&data.ictx.queues, guild_id) {
        let _ = handle.pause();
    }
    queue::set_playing(&data.ictx.queues, guild_id, false);
    debug!(guild = guild_id.get(), "voice channel empty, paused");

    let driver = data.driver.clone();
    let db = data.db.clone();
    let ictx = data.ictx.clone();
    let registry = data.registry.clone();
    let grace = data.config.idle_teardown;
    let handle = tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        let Some(bound) = queue::bound_channel(&ictx.queues, guild_id) else {
            return;
        };
        if listeners_in_channel(&ictx, &registry, guild_id, bound) == 0 {
            info!(
                guild = guild_id.get(),
                "nobody came back within the grace period, tearing down"
            );
            driver.destroy(guild_id).await;
            let _ = db.clear_queue_snapshot(guild_id.get(), ictx.bot_id.get());
        }
    });
    queue::set_teardown(&data.ictx.queues, guild_id, handle);
}

async fn resume_for_listeners(data: &Data, guild_id: GuildId) {
    queue::cancel_teardown(&data.ictx.queues, guild_id);
    if !queue::is_playing(&data.ictx.queues, guild_id)
        && queue::current_song(&data.ictx.queues, guild_id).is_some()
    {
        if let Some(handle) = queue::track_handle(&data.ictx.queues, guild_id) {
            let _ = handle.play();
            queue::set_playing(&data.ictx.queues, guild_id, true);
            debug!(guild = guild_id.get(), "listeners returned, resumed");
        }
    }
}

fn human_listeners(data: &Data, guild_id: GuildId, channel: ChannelId) -> usize {
    listeners_in_channel(&data.ictx, &data.registry, guild_id, channel)
}

/// Count non-bot members currently in `channel`. Members missing from the
/// cache count as humans (fail toward keeping the music going).
fn listeners_in_channel(
    ictx: &crate::instance::InstanceContext,
    registry: &crate::registry::BotRegistry,
    guild_id: GuildId,
    channel: ChannelId,
) -> usize {
    let Some(guild) = ictx.cache.guild(guild_id) else {
        return 0;
    };
    let bot_ids: Vec<UserId> = registry.bots().iter().map(|b| b.bot_id).collect();
    guild
        .voice_states
        .values()
        .filter(|vs| vs.channel_id == Some(channel))
        .filter(|vs| !bot_ids.contains(&vs.user_id))
        .filter(|vs| {
            guild
                .members
                .get(&vs.user_id)
                .map_or(true, |m| !m.user.bot)
        })
        .count()
}
