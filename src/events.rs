use poise::serenity_prelude as serenity;
use tracing::{debug, warn};

use crate::gate::{GateDecision, InboundMessage};
use crate::{commands, request_channel, voice, Data, Error};

/// Gateway entry point for one client. Everything an instance reacts to
/// funnels through here; the CommandGate decides whether this instance is
/// the one that should act before any side effect happens.
pub async fn handle_event(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
    data: &Data,
) -> Result<(), Error> {
    match event {
        serenity::FullEvent::Message { new_message } => {
            handle_message(ctx, new_message, data).await?;
        }
        serenity::FullEvent::VoiceStateUpdate { old, new } => {
            voice::events::handle_voice_state_update(data, old.as_ref(), new).await;
        }
        _ => {}
    }
    Ok(())
}

async fn handle_message(
    ctx: &serenity::Context,
    msg: &serenity::Message,
    data: &Data,
) -> Result<(), Error> {
    let Some(guild_id) = msg.guild_id else {
        return Ok(());
    };
    let Some(me) = data.registry.by_id(data.ictx.bot_id) else {
        // Not registered yet (startup race); let another instance take it.
        return Ok(());
    };

    let user_vc = {
        data.ictx.cache.guild(guild_id).and_then(|g| {
            g.voice_states
                .get(&msg.author.id)
                .and_then(|vs| vs.channel_id)
        })
    };
    let inbound = InboundMessage {
        message_id: msg.id,
        guild_id,
        channel_id: msg.channel_id,
        author_id: msg.author.id,
        author_is_bot: msg.author.bot,
        content: msg.content.clone(),
        user_voice_channel: user_vc,
    };

    let guild_prefix = data
        .db
        .get_guild_settings(guild_id.get())
        .map(|s| s.prefix)
        .unwrap_or_default();
    let is_request_channel = data
        .db
        .is_request_channel(guild_id.get(), msg.channel_id.get())
        .unwrap_or(false);

    match data
        .gate
        .decide(&me, &inbound, guild_prefix.as_deref(), is_request_channel)
    {
        GateDecision::Dispatch {
            prefix,
            command,
            rest,
        } => {
            debug!(
                guild = guild_id.get(),
                %command,
                %prefix,
                "prefix command accepted"
            );
            let reply = commands::dispatch_prefix(
                data, &ctx.http, guild_id, msg, user_vc, &command, &rest,
            )
            .await?;
            if let Some(reply) = reply {
                match msg.channel_id.say(&ctx.http, reply).await {
                    Ok(sent) if is_request_channel => {
                        // Keep the request channel clean: the command and
                        // our answer both disappear after the delay.
                        request_channel::schedule_delete(data, sent.channel_id, sent.id);
                        request_channel::schedule_delete(data, msg.channel_id, msg.id);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("failed to send command reply: {}", e),
                }
                if is_request_channel {
                    request_channel::refresh_player_message(data, guild_id).await;
                }
            }
        }
        GateDecision::SearchRequest { query } => {
            request_channel::handle_search_request(ctx, data, msg, &query).await;
        }
        GateDecision::Ignore => {}
    }
    Ok(())
}
