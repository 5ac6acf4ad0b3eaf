use poise::serenity_prelude as serenity;
use serenity::model::id::{ChannelId, GuildId};
use tracing::info;

use crate::request_channel;
use crate::{queue, Context, Data, Error};

/// Bind `channel` as the guild's request channel for this instance and post
/// the live player message into it.
pub async fn setup_inner(
    data: &Data,
    http: &serenity::Http,
    guild_id: GuildId,
    channel: ChannelId,
) -> Result<String, Error> {
    let content = request_channel::player_message_content(data, guild_id);
    let message = channel.say(http, content).await?;

    data.db.set_request_channel(
        guild_id.get(),
        data.ictx.bot_id.get(),
        channel.get(),
        Some(message.id.get()),
        Some(data.ictx.bot_id.get()),
    )?;
    queue::set_request_channel_mode(&data.ictx.queues, guild_id, true);

    info!(
        guild = guild_id.get(),
        channel = channel.get(),
        "request channel bound"
    );
    Ok(format!(
        "✅ <#{channel}> is now the song request channel. Type a song name or link there."
    ))
}

pub fn reset_inner(data: &Data, guild_id: GuildId) -> Result<String, Error> {
    data.db
        .clear_request_channel(guild_id.get(), data.ictx.bot_id.get())?;
    queue::set_request_channel_mode(&data.ictx.queues, guild_id, false);
    Ok("✅ Request channel unbound.".to_string())
}

/// Turn this channel into the song request channel
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD"
)]
pub async fn setup(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    let reply = setup_inner(
        ctx.data(),
        ctx.serenity_context().http.as_ref(),
        guild_id,
        ctx.channel_id(),
    )
    .await?;
    ctx.say(reply).await?;
    Ok(())
}

/// Unbind the song request channel
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD"
)]
pub async fn reset(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    let reply = reset_inner(ctx.data(), guild_id)?;
    ctx.say(reply).await?;
    Ok(())
}
