use poise::serenity_prelude as serenity;
use serenity::builder::EditMessage;
use serenity::model::id::{ChannelId, GuildId, MessageId};
use tracing::{debug, info, warn};

use crate::commands::music;
use crate::queue;
use crate::Data;

/// A plain message in the request channel is a song request: resolve it,
/// make sure we are in the requester's channel, enqueue, and keep the
/// channel tidy by deleting both sides of the exchange after a delay.
pub async fn handle_search_request(
    ctx: &serenity::Context,
    data: &Data,
    msg: &serenity::Message,
    query: &str,
) {
    let Some(guild_id) = msg.guild_id else { return };
    let user_vc = {
        data.ictx
            .cache
            .guild(guild_id)
            .and_then(|g| g.voice_states.get(&msg.author.id).and_then(|vs| vs.channel_id))
    };

    info!(
        guild = guild_id.get(),
        user = msg.author.id.get(),
        "song request: {}",
        query
    );

    queue::set_request_channel_mode(&data.ictx.queues, guild_id, true);

    // Pasted links play directly; anything else goes through the search
    // collaborator and the top hit is what gets queued.
    let is_url = query.starts_with("http://") || query.starts_with("https://");
    let target = if is_url {
        Some(query.to_string())
    } else {
        match data.search.search(query, 1).await {
            Ok(items) => items.first().map(|item| item.url.clone()),
            Err(e) => {
                msg_reply(ctx, data, msg, format!("❌ Search failed: {e}")).await;
                return;
            }
        }
    };
    let Some(target) = target else {
        msg_reply(ctx, data, msg, format!("❌ No results for `{query}`")).await;
        return;
    };

    let reply = match music::play_inner(
        data,
        guild_id,
        msg.channel_id,
        user_vc,
        &msg.author.name,
        &target,
    )
    .await
    {
        Ok(reply) => reply,
        Err(e) => {
            warn!(guild = guild_id.get(), "song request failed: {}", e);
            format!("❌ Could not queue that: {e}")
        }
    };

    msg_reply(ctx, data, msg, reply).await;
    refresh_player_message(data, guild_id).await;
}

/// Answer a song request and schedule both sides of the exchange for
/// cleanup.
async fn msg_reply(ctx: &serenity::Context, data: &Data, msg: &serenity::Message, reply: String) {
    match msg.channel_id.say(&ctx.http, reply).await {
        Ok(sent) => schedule_delete(data, sent.channel_id, sent.id),
        Err(e) => warn!("failed to answer song request: {}", e),
    }
    schedule_delete(data, msg.channel_id, msg.id);
}

/// Delete a message after the configured request-channel delay.
pub fn schedule_delete(data: &Data, channel: ChannelId, message: MessageId) {
    let http = data.ictx.http.clone();
    let delay = data.config.request_channel_delete_delay;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = channel.delete_message(&http, message).await {
            debug!("request-channel cleanup delete failed: {}", e);
        }
    });
}

/// Rewrite the guild's live player message with the current queue. Only the
/// primary instance edits it, and only when the stored message is its own;
/// two instances fighting over one Discord message helps nobody.
pub async fn refresh_player_message(data: &Data, guild_id: GuildId) {
    if !data.ictx.is_primary() {
        return;
    }
    let row = match data
        .db
        .get_request_channel(guild_id.get(), data.ictx.bot_id.get())
    {
        Ok(Some(row)) => row,
        Ok(None) => return,
        Err(e) => {
            warn!("request channel lookup failed: {}", e);
            return;
        }
    };
    let (channel_id, Some(message_id), author) = row else {
        return;
    };
    if author.is_some_and(|a| a != data.ictx.bot_id.get()) {
        return;
    }

    let content = player_message_content(data, guild_id);
    let edit = EditMessage::new().content(content);
    if let Err(e) = ChannelId::new(channel_id)
        .edit_message(&data.ictx.http, MessageId::new(message_id), edit)
        .await
    {
        warn!(guild = guild_id.get(), "player message edit failed: {}", e);
    }
}

/// The text body of the player message: now playing plus the next few
/// entries. Also used when the message is first posted by `setup`.
pub fn player_message_content(data: &Data, guild_id: GuildId) -> String {
    let queues = &data.ictx.queues;
    let mut out =
        String::from("🎶 **Song requests**: type a song name or link in this channel.\n\n");
    match queue::current_song(queues, guild_id) {
        Some(song) => {
            out.push_str(&format!("▶️ **{}** (requested by {})\n", song.title, song.requester));
        }
        None => out.push_str("▶️ Nothing playing right now.\n"),
    }
    let pending = queue::pending(queues, guild_id);
    if !pending.is_empty() {
        out.push('\n');
        for (i, song) in pending.iter().take(10).enumerate() {
            out.push_str(&format!("`{}.` {}\n", i + 1, song.title));
        }
        if pending.len() > 10 {
            out.push_str(&format!("…and {} more\n", pending.len() - 10));
        }
    }
    out
}
