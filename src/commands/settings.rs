use serenity::model::id::GuildId;

use crate::{Context, Data, Error};

/// Core handler shared with the prefix dispatcher: `settings <field> [value]`.
pub fn settings_inner(data: &Data, guild_id: GuildId, rest: &str) -> String {
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("prefix"), value) => match data.db.set_guild_prefix(guild_id.get(), value) {
            Ok(()) => match value {
                Some(p) => format!("✅ Prefix set to `{p}`"),
                None => "✅ Prefix cleared, using the global defaults.".to_string(),
            },
            Err(e) => format!("❌ Failed to save prefix: {e}"),
        },
        (Some("djrole"), value) => {
            let role = value.and_then(|v| v.trim_matches(['<', '@', '&', '>']).parse().ok());
            match data.db.set_guild_dj_role(guild_id.get(), role) {
                Ok(()) => match role {
                    Some(r) => format!("✅ DJ role set to <@&{r}>"),
                    None => "✅ DJ role cleared.".to_string(),
                },
                Err(e) => format!("❌ Failed to save DJ role: {e}"),
            }
        }
        (Some("locale"), value) => match data.db.set_guild_locale(guild_id.get(), value) {
            Ok(()) => match value {
                Some(l) => format!("✅ Locale set to `{l}`"),
                None => "✅ Locale cleared.".to_string(),
            },
            Err(e) => format!("❌ Failed to save locale: {e}"),
        },
        _ => {
            let settings = data.db.get_guild_settings(guild_id.get()).unwrap_or_default();
            format!(
                "⚙️ prefix: `{}` · dj role: {} · locale: `{}`",
                settings.prefix.as_deref().unwrap_or("(default)"),
                settings
                    .dj_role
                    .map(|r| format!("<@&{r}>"))
                    .unwrap_or_else(|| "(none)".to_string()),
                settings.locale.as_deref().unwrap_or("(default)"),
            )
        }
    }
}

/// Show or change this server's settings
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD"
)]
pub async fn settings(
    ctx: Context<'_>,
    #[description = "Field to change: prefix, djrole, or locale"] field: Option<String>,
    #[description = "New value (omit to clear)"] value: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    let rest = match (field, value) {
        (Some(f), Some(v)) => format!("{f} {v}"),
        (Some(f), None) => f,
        _ => String::new(),
    };
    ctx.say(settings_inner(ctx.data(), guild_id, &rest)).await?;
    Ok(())
}

/// Delete all of this server's stored data
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD"
)]
pub async fn purge(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a server")?;
    match ctx.data().db.purge_guild(guild_id.get()) {
        Ok(()) => ctx.say("🧹 All stored data for this server was deleted.").await?,
        Err(e) => ctx.say(format!("❌ Purge failed: {e}")).await?,
    };
    Ok(())
}
