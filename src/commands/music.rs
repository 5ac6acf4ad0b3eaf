use std::time::Duration;

use poise::serenity_prelude::ChannelId;
use serenity::model::id::GuildId;
use tracing::warn;

use crate::db::PlayerState;
use crate::queue::{self, advance::Advance, LoopMode};
use crate::{Context, Data, Error};

/// The author's current voice channel, from this instance's cache.
fn author_voice_channel(ctx: &Context<'_>) -> Option<ChannelId> {
    let guild = ctx.guild()?;
    guild
        .voice_states
        .get(&ctx.author().id)
        .and_then(|vs| vs.channel_id)
}

/// Responsibility check for slash-invoked music commands. Prefix commands
/// go through the CommandGate instead; slash interactions arrive at exactly
/// one application, so a rejection here gets a short notice rather than
/// silence.
fn music_gate(ctx: &Context<'_>, guild_id: GuildId, user_vc: Option<ChannelId>) -> bool {
    let data = ctx.data();
    let Some(me) = data.registry.by_id(data.ictx.bot_id) else {
        return true;
    };
    data.resolver
        .should_respond_to_music(&me, guild_id, user_vc)
}

const NOT_RESPONSIBLE: &str = "🎧 Another instance is serving that voice channel.";

/// Write the current queue image to the shared store (or clear it when the
/// queue is gone).
pub fn persist_queue(data: &Data, guild_id: GuildId) {
    let bot_id = data.ictx.bot_id.get();
    match queue::to_snapshot(&data.ictx.queues, guild_id) {
        Some(snapshot) => {
            if let Err(e) = data.db.save_queue_snapshot(guild_id.get(), bot_id, &snapshot) {
                warn!(guild = guild_id.get(), "queue snapshot write failed: {}", e);
            }
        }
        None => {
            let _ = data.db.clear_queue_snapshot(guild_id.get(), bot_id);
        }
    }
}

pub fn persist_player_state(data: &Data, guild_id: GuildId) {
    let queues = &data.ictx.queues;
    let state = PlayerState {
        loop_mode: queue::loop_mode(queues, guild_id),
        shuffle: queue::shuffle_enabled(queues, guild_id),
        volume: queue::volume(queues, guild_id),
        filters: None,
    };
    if let Err(e) = data
        .db
        .save_player_state(guild_id.get(), data.ictx.bot_id.get(), &state)
    {
        warn!(guild = guild_id.get(), "player state write failed: {}", e);
    }
}

// --- Core actions, shared by the slash wrappers and the prefix dispatcher ---

pub async fn join_inner(
    data: &Data,
    guild_id: GuildId,
    user_vc: Option<ChannelId>,
    text_channel: ChannelId,
) -> Result<String, Error> {
    let Some(vc) = user_vc else {
        return Ok("❌ You must be in a voice channel first.".to_string());
    };
    if let Err(e) = data.ictx.songbird.join(guild_id, vc).await {
        return Ok(format!("❌ Failed to join voice channel: {e}"));
    }
    queue::bind_channel(&data.ictx.queues, guild_id, vc, Some(text_channel));
    Ok(format!("🔊 Joined <#{vc}>"))
}

pub async fn play_inner(
    data: &Data,
    guild_id: GuildId,
    text_channel: ChannelId,
    user_vc: Option<ChannelId>,
    requester: &str,
    query: &str,
) -> Result<String, Error> {
    let Some(vc) = user_vc else {
        return Ok("❌ You must be in a voice channel to play music.".to_string());
    };

    if data.ictx.songbird.get(guild_id).is_none() {
        if let Err(e) = data.ictx.songbird.join(guild_id, vc).await {
            return Ok(format!("❌ Failed to join voice channel: {e}"));
        }
    }
    queue::bind_channel(&data.ictx.queues, guild_id, vc, Some(text_channel));

    let info = match data.search.probe(query).await {
        Ok(info) => info,
        Err(e) => return Ok(format!("❌ Could not resolve that: {e}")),
    };

    let song = queue::add_song(
        &data.ictx.queues,
        guild_id,
        info.title,
        info.url,
        requester.to_string(),
        info.duration,
        info.is_live,
    );
    persist_queue(data, guild_id);

    let position = queue::pending(&data.ictx.queues, guild_id).len();
    if !queue::is_playing(&data.ictx.queues, guild_id) {
        queue::cancel_teardown(&data.ictx.queues, guild_id);
        data.driver.advance(guild_id, Advance::default()).await;
        Ok(format!("🎵 Playing **{}**", song.title))
    } else {
        Ok(format!("➕ Queued **{}** (position {})", song.title, position))
    }
}

pub async fn skip_inner(data: &Data, guild_id: GuildId) -> Result<String, Error> {
    let Some(current) = queue::current_song(&data.ictx.queues, guild_id) else {
        return Ok("📭 Nothing is playing.".to_string());
    };
    queue::request_skip(&data.ictx.queues, guild_id);
    match queue::track_handle(&data.ictx.queues, guild_id) {
        // Stopping the track fires the end event, which drives the next advance.
        Some(handle) => {
            let _ = handle.stop();
        }
        None => {
            data.driver
                .advance(
                    guild_id,
                    Advance {
                        was_skipped: true,
                        ..Default::default()
                    },
                )
                .await;
        }
    }
    persist_queue(data, guild_id);
    Ok(format!("⏭️ Skipped **{}**", current.title))
}

pub fn pause_inner(data: &Data, guild_id: GuildId) -> String {
    match queue::track_handle(&data.ictx.queues, guild_id) {
        Some(handle) => {
            let _ = handle.pause();
            queue::set_playing(&data.ictx.queues, guild_id, false);
            "⏸️ Paused.".to_string()
        }
        None => "📭 Nothing is playing.".to_string(),
    }
}

pub fn resume_inner(data: &Data, guild_id: GuildId) -> String {
    match queue::track_handle(&data.ictx.queues, guild_id) {
        Some(handle) => {
            let _ = handle.play();
            queue::set_playing(&data.ictx.queues, guild_id, true);
            "▶️ Resumed.".to_string()
        }
        None => "📭 Nothing is playing.".to_string(),
    }
}

pub fn queue_inner(data: &Data, guild_id: GuildId) -> String {
    let current = queue::current_song(&data.ictx.queues, guild_id);
    let pending = queue::pending(&data.ictx.queues, guild_id);
    if current.is_none() && pending.is_empty() {
        return "📭 Queue is empty.".to_string();
    }

    let mut out = String::new();
    if let Some(song) = current {
        out.push_str(&format!("▶️ **{}**\n", song.title));
    }
    for (i, song) in pending.iter().take(10).enumerate() {
        out.push_str(&format!("`{}.` {}\n", i + 1, song.title));
    }
    if pending.len() > 10 {
        out.push_str(&format!("…and {} more", pending.len() - 10));
    }
    out
}

pub fn now_playing_inner(data: &Data, guild_id: GuildId) -> String {
    match queue::current_song(&data.ictx.queues, guild_id) {
        Some(song) => {
            let duration = song.duration.as_deref().unwrap_or("live");
            format!(
                "🎵 **{}** [{}], requested by {}",
                song.title, duration, song.requester
            )
        }
        None => "📭 Nothing is playing.".to_string(),
    }
}

pub fn loop_inner(data: &Data, guild_id: GuildId, mode: &str) -> String {
    let mode = LoopMode::from_str(mode);
    queue::set_loop_mode(&data.ictx.queues, guild_id, mode);
    persist_player_state(data, guild_id);
    format!("🔁 Loop mode: **{mode}**")
}

pub fn shuffle_inner(data: &Data, guild_id: GuildId) -> String {
    let on = !queue::shuffle_enabled(&data.ictx.queues, guild_id);
    queue::set_shuffle(&data.ictx.queues, guild_id, on);
    persist_player_state(data, guild_id);
    if on {
        "🔀 Shuffle on.".to_string()
    } else {
        "➡️ Shuffle off.".to_string()
    }
}

pub fn volume_inner(data: &Data, guild_id: GuildId, percent: u8) -> String {
    queue::set_volume(&data.ictx.queues, guild_id, percent);
    persist_player_state(data, guild_id);
    format!("🔊 Volume set to {percent}%")
}

pub fn remove_inner(data: &Data, guild_id: GuildId, position: usize) -> String {
    match queue::remove_at(&data.ictx.queues, guild_id, position) {
        Some(song) => {
            persist_queue(data, guild_id);
            format!("🗑️ Removed **{}**", song.title)
        }
        None => "❌ No song at that position.".to_string(),
    }
}

pub fn seek_inner(data: &Data, guild_id: GuildId, seconds: u64) -> String {
    match queue::track_handle(&data.ictx.queues, guild_id) {
        Some(handle) => {
            let _ = handle.seek(Duration::from_secs(seconds));
            format!("⏩ Seeking to {}:{:02}", seconds / 60, seconds % 60)
        }
        None => "📭 Nothing is playing.".to_string(),
    }
}

pub async fn stop_inner(data: &Data, guild_id: GuildId) -> Result<String, Error> {
    data.driver.destroy(guild_id).await;
    let _ = data
        .db
        .clear_queue_snapshot(guild_id.get(), data.ictx.bot_id.get());
    Ok("⏹️ Stopped playback and left the channel.".to_string())
}

// --- Slash wrappers ---

/// Join your voice channel
#[poise::command(
    slash_command,
    guild_only,
    required_bot_permissions = "CONNECT | SPEAK"
)]
pub async fn join(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    let user_vc = author_voice_channel(&ctx);
    if !music_gate(&ctx, guild_id, user_vc) {
        ctx.say(NOT_RESPONSIBLE).await?;
        return Ok(());
    }
    let reply = join_inner(ctx.data(), guild_id, user_vc, ctx.channel_id()).await?;
    ctx.say(reply).await?;
    Ok(())
}

/// Play a song from a URL or search query
#[poise::command(
    slash_command,
    guild_only,
    required_bot_permissions = "CONNECT | SPEAK"
)]
pub async fn play(
    ctx: Context<'_>,
    #[description = "URL or search query"] query: String,
) -> Result<(), Error> {
    ctx.defer().await?;
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    let user_vc = author_voice_channel(&ctx);
    if !music_gate(&ctx, guild_id, user_vc) {
        ctx.say(NOT_RESPONSIBLE).await?;
        return Ok(());
    }
    let reply = play_inner(
        ctx.data(),
        guild_id,
        ctx.channel_id(),
        user_vc,
        &ctx.author().name,
        &query,
    )
    .await?;
    ctx.say(reply).await?;
    Ok(())
}

/// Skip the current song
#[poise::command(slash_command, guild_only)]
pub async fn skip(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    let user_vc = author_voice_channel(&ctx);
    if !music_gate(&ctx, guild_id, user_vc) {
        ctx.say(NOT_RESPONSIBLE).await?;
        return Ok(());
    }
    let reply = skip_inner(ctx.data(), guild_id).await?;
    ctx.say(reply).await?;
    Ok(())
}

/// Pause playback
#[poise::command(slash_command, guild_only)]
pub async fn pause(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    let user_vc = author_voice_channel(&ctx);
    if !music_gate(&ctx, guild_id, user_vc) {
        ctx.say(NOT_RESPONSIBLE).await?;
        return Ok(());
    }
    ctx.say(pause_inner(ctx.data(), guild_id)).await?;
    Ok(())
}

/// Resume playback
#[poise::command(slash_command, guild_only)]
pub async fn resume(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    let user_vc = author_voice_channel(&ctx);
    if !music_gate(&ctx, guild_id, user_vc) {
        ctx.say(NOT_RESPONSIBLE).await?;
        return Ok(());
    }
    ctx.say(resume_inner(ctx.data(), guild_id)).await?;
    Ok(())
}

/// Show the current queue
#[poise::command(slash_command, guild_only)]
pub async fn queue(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    ctx.say(queue_inner(ctx.data(), guild_id)).await?;
    Ok(())
}

/// Show the song playing right now
#[poise::command(slash_command, guild_only)]
pub async fn nowplaying(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    ctx.say(now_playing_inner(ctx.data(), guild_id)).await?;
    Ok(())
}

/// Set the loop mode
#[poise::command(slash_command, guild_only, rename = "loop")]
pub async fn loop_mode(
    ctx: Context<'_>,
    #[description = "off, song, or queue"] mode: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    let user_vc = author_voice_channel(&ctx);
    if !music_gate(&ctx, guild_id, user_vc) {
        ctx.say(NOT_RESPONSIBLE).await?;
        return Ok(());
    }
    ctx.say(loop_inner(ctx.data(), guild_id, &mode)).await?;
    Ok(())
}

/// Toggle shuffle
#[poise::command(slash_command, guild_only)]
pub async fn shuffle(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    let user_vc = author_voice_channel(&ctx);
    if !music_gate(&ctx, guild_id, user_vc) {
        ctx.say(NOT_RESPONSIBLE).await?;
        return Ok(());
    }
    ctx.say(shuffle_inner(ctx.data(), guild_id)).await?;
    Ok(())
}

/// Set the playback volume
#[poise::command(slash_command, guild_only)]
pub async fn volume(
    ctx: Context<'_>,
    #[description = "Volume percentage (0-200)"]
    #[min = 0]
    #[max = 200]
    percent: u8,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    let user_vc = author_voice_channel(&ctx);
    if !music_gate(&ctx, guild_id, user_vc) {
        ctx.say(NOT_RESPONSIBLE).await?;
        return Ok(());
    }
    ctx.say(volume_inner(ctx.data(), guild_id, percent)).await?;
    Ok(())
}

/// Remove a song from the queue by position
#[poise::command(slash_command, guild_only)]
pub async fn remove(
    ctx: Context<'_>,
    #[description = "Queue position (1-based)"] position: usize,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    let user_vc = author_voice_channel(&ctx);
    if !music_gate(&ctx, guild_id, user_vc) {
        ctx.say(NOT_RESPONSIBLE).await?;
        return Ok(());
    }
    ctx.say(remove_inner(ctx.data(), guild_id, position)).await?;
    Ok(())
}

/// Seek within the current song
#[poise::command(slash_command, guild_only)]
pub async fn seek(
    ctx: Context<'_>,
    #[description = "Position in seconds"] seconds: u64,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    let user_vc = author_voice_channel(&ctx);
    if !music_gate(&ctx, guild_id, user_vc) {
        ctx.say(NOT_RESPONSIBLE).await?;
        return Ok(());
    }
    ctx.say(seek_inner(ctx.data(), guild_id, seconds)).await?;
    Ok(())
}

/// Stop playback and leave the channel
#[poise::command(slash_command, guild_only)]
pub async fn stop(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    let user_vc = author_voice_channel(&ctx);
    if !music_gate(&ctx, guild_id, user_vc) {
        ctx.say(NOT_RESPONSIBLE).await?;
        return Ok(());
    }
    let reply = stop_inner(ctx.data(), guild_id).await?;
    ctx.say(reply).await?;
    Ok(())
}
