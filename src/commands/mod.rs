pub mod music;
pub mod settings;
pub mod setup;

use poise::serenity_prelude as serenity;
use serenity::model::id::GuildId;

use crate::{Data, Error};

/// Executor for gate-accepted prefix commands. Returns the reply text, or
/// None for an unknown command name (stay silent, it may belong to another
/// bot sharing the prefix).
pub async fn dispatch_prefix(
    data: &Data,
    http: &serenity::Http,
    guild_id: GuildId,
    msg: &serenity::Message,
    user_vc: Option<serenity::ChannelId>,
    command: &str,
    rest: &str,
) -> Result<Option<String>, Error> {
    let requester = msg.author.name.clone();
    let text_channel = msg.channel_id;

    let reply = match command {
        "join" => music::join_inner(data, guild_id, user_vc, text_channel).await?,
        "play" | "p" => {
            if rest.is_empty() {
                "❌ Usage: play <url or search query>".to_string()
            } else {
                music::play_inner(data, guild_id, text_channel, user_vc, &requester, rest).await?
            }
        }
        "skip" => music::skip_inner(data, guild_id).await?,
        "pause" => music::pause_inner(data, guild_id),
        "resume" => music::resume_inner(data, guild_id),
        "queue" | "q" => music::queue_inner(data, guild_id),
        "nowplaying" | "np" => music::now_playing_inner(data, guild_id),
        "loop" => music::loop_inner(data, guild_id, rest),
        "shuffle" => music::shuffle_inner(data, guild_id),
        "volume" => match rest.parse() {
            Ok(percent) => music::volume_inner(data, guild_id, percent),
            Err(_) => "❌ Usage: volume <0-200>".to_string(),
        },
        "remove" => match rest.parse() {
            Ok(position) => music::remove_inner(data, guild_id, position),
            Err(_) => "❌ Usage: remove <queue position>".to_string(),
        },
        "seek" => match rest.parse() {
            Ok(seconds) => music::seek_inner(data, guild_id, seconds),
            Err(_) => "❌ Usage: seek <seconds>".to_string(),
        },
        "stop" | "leave" => music::stop_inner(data, guild_id).await?,
        "settings" => settings::settings_inner(data, guild_id, rest),
        "setup" => setup::setup_inner(data, http, guild_id, msg.channel_id).await?,
        "reset" => setup::reset_inner(data, guild_id)?,
        _ => return Ok(None),
    };
    Ok(Some(reply))
}

/// The command set registered with each client's framework.
pub fn all() -> Vec<poise::Command<Data, Error>> {
    vec![
        music::join(),
        music::play(),
        music::skip(),
        music::pause(),
        music::resume(),
        music::queue(),
        music::nowplaying(),
        music::loop_mode(),
        music::shuffle(),
        music::volume(),
        music::remove(),
        music::seek(),
        music::stop(),
        settings::settings(),
        settings::purge(),
        setup::setup(),
        setup::reset(),
    ]
}
