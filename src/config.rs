use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fs;
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    /// One Discord token per bot instance; index 0 is the primary.
    pub discord_tokens: Vec<String>,
    /// Force multi-instance coordination on/off. Unset means "on when more
    /// than one token is configured".
    pub multi_instance: Option<bool>,
    pub owner_id: Option<u64>,
    pub prefixes: Vec<String>,
    pub database_url: String,
    pub status_message: String,
    pub download_dir: String,
    pub youtube_cookies: Option<String>,
    pub default_volume: u8,
    pub command_dedup_window: Duration,
    pub request_channel_delete_delay: Duration,
    pub idle_teardown: Duration,
    pub download_timeout: Duration,
    pub connection_ready_timeout: Duration,
}

/// Optional companion file listing extra bot tokens, appended after
/// DISCORD_TOKENS in declaration order.
#[derive(Deserialize)]
struct InstancesFile {
    instances: Vec<InstanceEntry>,
}

#[derive(Deserialize)]
struct InstanceEntry {
    token: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        let mut discord_tokens: Vec<String> = env::var("DISCORD_TOKENS")
            .or_else(|_| env::var("DISCORD_TOKEN"))
            .map_err(|_| anyhow::anyhow!("DISCORD_TOKENS must be set"))?
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        discord_tokens.extend(Self::load_instances_file()?);
        if discord_tokens.is_empty() {
            anyhow::bail!("DISCORD_TOKENS must contain at least one token");
        }

        Ok(Config {
            discord_tokens,
            multi_instance: env::var("MULTI_INSTANCE").ok().and_then(|v| v.parse().ok()),
            owner_id: env::var("OWNER_ID").ok().and_then(|id| id.parse().ok()),
            prefixes: env::var("PREFIXES")
                .unwrap_or_else(|_| "!".to_string())
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/polychord.db".to_string()),
            status_message: env::var("STATUS_MESSAGE")
                .unwrap_or_else(|_| "music on every channel".to_string()),
            download_dir: env::var("DOWNLOAD_DIR")
                .unwrap_or_else(|_| "/tmp/polychord_audio".to_string()),
            youtube_cookies: env::var("YOUTUBE_COOKIES").ok(),
            default_volume: env::var("DEFAULT_VOLUME")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100),
            command_dedup_window: duration_env("COMMAND_DEDUP_WINDOW", "5s"),
            request_channel_delete_delay: duration_env("REQUEST_CHANNEL_DELETE_DELAY", "60s"),
            idle_teardown: duration_env("IDLE_TEARDOWN", "60s"),
            download_timeout: duration_env("DOWNLOAD_TIMEOUT", "60s"),
            connection_ready_timeout: duration_env("CONNECTION_READY_TIMEOUT", "15s"),
        })
    }

    fn load_instances_file() -> anyhow::Result<Vec<String>> {
        if let Ok(content) = fs::read_to_string("instances.toml") {
            let parsed: InstancesFile = toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("invalid instances.toml: {}", e))?;
            return Ok(parsed.instances.into_iter().map(|i| i.token).collect());
        }
        Ok(Vec::new())
    }

    /// Coordination is only meaningful with two or more instances.
    pub fn multi_instance_enabled(&self) -> bool {
        self.multi_instance
            .unwrap_or(self.discord_tokens.len() > 1)
    }
}

fn duration_env(name: &str, default: &str) -> Duration {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    humantime::parse_duration(&raw)
        .unwrap_or_else(|_| humantime::parse_duration(default).expect("valid default duration"))
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field(
                "discord_tokens",
                &format!("[{} token(s), REDACTED]", self.discord_tokens.len()),
            )
            .field("multi_instance", &self.multi_instance)
            .field("owner_id", &self.owner_id)
            .field("prefixes", &self.prefixes)
            .field("database_url", &self.database_url)
            .field("status_message", &self.status_message)
            .field("download_dir", &self.download_dir)
            .field(
                "youtube_cookies",
                &self.youtube_cookies.as_ref().map(|_| "[REDACTED]"),
            )
            .field("default_volume", &self.default_volume)
            .field("command_dedup_window", &self.command_dedup_window)
            .field(
                "request_channel_delete_delay",
                &self.request_channel_delete_delay,
            )
            .field("idle_teardown", &self.idle_teardown)
            .field("download_timeout", &self.download_timeout)
            .field("connection_ready_timeout", &self.connection_ready_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_logic() {
        // 1. Missing token list must fail
        env::remove_var("DISCORD_TOKENS");
        env::remove_var("DISCORD_TOKEN");
        let result = Config::build();
        assert!(result.is_err(), "Should fail when no tokens configured");

        // 2. Defaults
        env::set_var("DISCORD_TOKENS", "tok_a, tok_b");
        let config = Config::build().unwrap();
        assert_eq!(config.discord_tokens.len(), 2);
        assert_eq!(config.prefixes, vec!["!".to_string()]);
        assert!(config.multi_instance_enabled());
        assert_eq!(config.idle_teardown, Duration::from_secs(60));
        assert_eq!(config.connection_ready_timeout, Duration::from_secs(15));

        // 3. Single token disables coordination unless forced
        env::set_var("DISCORD_TOKENS", "tok_a");
        let config = Config::build().unwrap();
        assert!(!config.multi_instance_enabled());
        env::set_var("MULTI_INSTANCE", "true");
        let config = Config::build().unwrap();
        assert!(config.multi_instance_enabled());
        env::remove_var("MULTI_INSTANCE");

        // 4. Debug redaction
        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("tok_a"));
        assert!(debug_output.contains("REDACTED"));

        // 5. Duration knobs honor humantime strings and fall back on garbage
        env::set_var("COMMAND_DEDUP_WINDOW", "250ms");
        let config = Config::build().unwrap();
        assert_eq!(config.command_dedup_window, Duration::from_millis(250));
        env::set_var("COMMAND_DEDUP_WINDOW", "not-a-duration");
        let config = Config::build().unwrap();
        assert_eq!(config.command_dedup_window, Duration::from_secs(5));

        env::remove_var("COMMAND_DEDUP_WINDOW");
        env::remove_var("DISCORD_TOKENS");
    }
}
