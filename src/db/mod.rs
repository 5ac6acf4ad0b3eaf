use rusqlite::{Connection, OptionalExtension, Result};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::queue::{LoopMode, QueueSnapshot};
use tracing::{debug, info};

/// Guild-level settings. One row per guild, writable by any instance;
/// last write wins, no merge.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GuildSettings {
    pub prefix: Option<String>,
    pub dj_role: Option<u64>,
    pub locale: Option<String>,
}

/// Restorable player settings, one row per (guild, bot).
#[derive(Clone, Debug, PartialEq)]
pub struct PlayerState {
    pub loop_mode: LoopMode,
    pub shuffle: bool,
    pub volume: u8,
    pub filters: Option<String>,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            loop_mode: LoopMode::Off,
            shuffle: false,
            volume: 100,
            filters: None,
        }
    }
}

/// The shared store all instances read and write. Rows are keyed by
/// (guild_id, bot_id) so instances never clobber each other, except the
/// guild settings row which is deliberately shared.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> Result<Self> {
        let conn = Connection::open(&config.database_url)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let sql = "
            CREATE TABLE IF NOT EXISTS guild_settings (
                guild_id TEXT PRIMARY KEY,
                prefix TEXT,
                dj_role TEXT,
                locale TEXT,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS request_channels (
                guild_id TEXT NOT NULL,
                bot_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                message_id TEXT,
                message_author TEXT,
                PRIMARY KEY (guild_id, bot_id)
            );

            CREATE TABLE IF NOT EXISTS player_states (
                guild_id TEXT NOT NULL,
                bot_id TEXT NOT NULL,
                loop_mode TEXT NOT NULL,
                shuffle BOOLEAN NOT NULL,
                volume INTEGER NOT NULL,
                filters TEXT,
                PRIMARY KEY (guild_id, bot_id)
            );

            CREATE TABLE IF NOT EXISTS queue_states (
                guild_id TEXT NOT NULL,
                bot_id TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (guild_id, bot_id)
            );
        ";
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(sql)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    // --- Guild settings (shared row, last write wins) ---

    pub fn get_guild_settings(&self, guild_id: u64) -> anyhow::Result<GuildSettings> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT prefix, dj_role, locale FROM guild_settings WHERE guild_id = ?1",
                [guild_id.to_string()],
                |row| {
                    let dj_role: Option<String> = row.get(1)?;
                    Ok(GuildSettings {
                        prefix: row.get(0)?,
                        dj_role: dj_role.and_then(|r| r.parse().ok()),
                        locale: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row.unwrap_or_default())
    }

    pub fn set_guild_prefix(&self, guild_id: u64, prefix: Option<&str>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO guild_settings (guild_id, prefix, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(guild_id) DO UPDATE SET prefix = ?2, updated_at = CURRENT_TIMESTAMP",
            (guild_id.to_string(), prefix),
        )?;
        Ok(())
    }

    pub fn set_guild_dj_role(&self, guild_id: u64, dj_role: Option<u64>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO guild_settings (guild_id, dj_role, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(guild_id) DO UPDATE SET dj_role = ?2, updated_at = CURRENT_TIMESTAMP",
            (guild_id.to_string(), dj_role.map(|r| r.to_string())),
        )?;
        Ok(())
    }

    pub fn set_guild_locale(&self, guild_id: u64, locale: Option<&str>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO guild_settings (guild_id, locale, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(guild_id) DO UPDATE SET locale = ?2, updated_at = CURRENT_TIMESTAMP",
            (guild_id.to_string(), locale),
        )?;
        Ok(())
    }

    // --- Request channel binding, per (guild, bot) ---

    pub fn set_request_channel(
        &self,
        guild_id: u64,
        bot_id: u64,
        channel_id: u64,
        message_id: Option<u64>,
        message_author: Option<u64>,
    ) -> anyhow::Result<()> {
        debug!(
            "Database: binding request channel {} for guild {} bot {}",
            channel_id, guild_id, bot_id
        );
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO request_channels (guild_id, bot_id, channel_id, message_id, message_author)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(guild_id, bot_id) DO UPDATE
             SET channel_id = ?3, message_id = ?4, message_author = ?5",
            (
                guild_id.to_string(),
                bot_id.to_string(),
                channel_id.to_string(),
                message_id.map(|m| m.to_string()),
                message_author.map(|a| a.to_string()),
            ),
        )?;
        Ok(())
    }

    /// Returns (channel_id, message_id, message_author) when bound.
    pub fn get_request_channel(
        &self,
        guild_id: u64,
        bot_id: u64,
    ) -> anyhow::Result<Option<(u64, Option<u64>, Option<u64>)>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT channel_id, message_id, message_author FROM request_channels
                 WHERE guild_id = ?1 AND bot_id = ?2",
                (guild_id.to_string(), bot_id.to_string()),
                |row| {
                    let channel: String = row.get(0)?;
                    let message: Option<String> = row.get(1)?;
                    let author: Option<String> = row.get(2)?;
                    Ok((channel, message, author))
                },
            )
            .optional()?;
        Ok(row.and_then(|(c, m, a)| {
            Some((
                c.parse().ok()?,
                m.and_then(|m| m.parse().ok()),
                a.and_then(|a| a.parse().ok()),
            ))
        }))
    }

    pub fn clear_request_channel(&self, guild_id: u64, bot_id: u64) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM request_channels WHERE guild_id = ?1 AND bot_id = ?2",
            (guild_id.to_string(), bot_id.to_string()),
        )?;
        Ok(())
    }

    /// Whether any instance has bound this channel as a request channel for
    /// the guild.
    pub fn is_request_channel(&self, guild_id: u64, channel_id: u64) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT 1 FROM request_channels WHERE guild_id = ?1 AND channel_id = ?2",
        )?;
        Ok(stmt.exists((guild_id.to_string(), channel_id.to_string()))?)
    }

    // --- Player state snapshot, per (guild, bot) ---

    pub fn save_player_state(
        &self,
        guild_id: u64,
        bot_id: u64,
        state: &PlayerState,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO player_states (guild_id, bot_id, loop_mode, shuffle, volume, filters)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(guild_id, bot_id) DO UPDATE
             SET loop_mode = ?3, shuffle = ?4, volume = ?5, filters = ?6",
            (
                guild_id.to_string(),
                bot_id.to_string(),
                state.loop_mode.as_str(),
                state.shuffle,
                state.volume,
                state.filters.as_deref(),
            ),
        )?;
        Ok(())
    }

    pub fn get_player_state(&self, guild_id: u64, bot_id: u64) -> anyhow::Result<Option<PlayerState>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT loop_mode, shuffle, volume, filters FROM player_states
                 WHERE guild_id = ?1 AND bot_id = ?2",
                (guild_id.to_string(), bot_id.to_string()),
                |row| {
                    let loop_mode: String = row.get(0)?;
                    Ok(PlayerState {
                        loop_mode: LoopMode::from_str(&loop_mode),
                        shuffle: row.get(1)?,
                        volume: row.get(2)?,
                        filters: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // --- Queue snapshot, per (guild, bot) ---

    pub fn save_queue_snapshot(
        &self,
        guild_id: u64,
        bot_id: u64,
        snapshot: &QueueSnapshot,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(snapshot)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO queue_states (guild_id, bot_id, snapshot, updated_at)
             VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
             ON CONFLICT(guild_id, bot_id) DO UPDATE
             SET snapshot = ?3, updated_at = CURRENT_TIMESTAMP",
            (guild_id.to_string(), bot_id.to_string(), json),
        )?;
        Ok(())
    }

    pub fn load_queue_snapshot(
        &self,
        guild_id: u64,
        bot_id: u64,
    ) -> anyhow::Result<Option<QueueSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM queue_states WHERE guild_id = ?1 AND bot_id = ?2",
                (guild_id.to_string(), bot_id.to_string()),
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn clear_queue_snapshot(&self, guild_id: u64, bot_id: u64) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM queue_states WHERE guild_id = ?1 AND bot_id = ?2",
            (guild_id.to_string(), bot_id.to_string()),
        )?;
        Ok(())
    }

    /// All queue snapshots stored for one instance, for startup recovery.
    pub fn queue_snapshots_for_bot(
        &self,
        bot_id: u64,
    ) -> anyhow::Result<Vec<(u64, QueueSnapshot)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT guild_id, snapshot FROM queue_states WHERE bot_id = ?1")?;
        let rows = stmt.query_map([bot_id.to_string()], |row| {
            let guild: String = row.get(0)?;
            let json: String = row.get(1)?;
            Ok((guild, json))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (guild, json) = row?;
            let Ok(guild_id) = guild.parse() else { continue };
            match serde_json::from_str(&json) {
                Ok(snapshot) => results.push((guild_id, snapshot)),
                Err(e) => debug!("Database: discarding unreadable snapshot for {}: {}", guild, e),
            }
        }
        Ok(results)
    }

    /// Removes every row the guild owns, across all instances.
    pub fn purge_guild(&self, guild_id: u64) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        let gid = guild_id.to_string();
        conn.execute("DELETE FROM guild_settings WHERE guild_id = ?1", [&gid])?;
        conn.execute("DELETE FROM request_channels WHERE guild_id = ?1", [&gid])?;
        conn.execute("DELETE FROM player_states WHERE guild_id = ?1", [&gid])?;
        conn.execute("DELETE FROM queue_states WHERE guild_id = ?1", [&gid])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Song;

    fn test_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.execute_init().unwrap();
        db
    }

    #[test]
    fn test_guild_settings_partial_updates() {
        let db = test_db();

        // Defaults when no row exists
        assert_eq!(db.get_guild_settings(1).unwrap(), GuildSettings::default());

        db.set_guild_prefix(1, Some("?")).unwrap();
        db.set_guild_dj_role(1, Some(555)).unwrap();
        let settings = db.get_guild_settings(1).unwrap();
        assert_eq!(settings.prefix.as_deref(), Some("?"));
        assert_eq!(settings.dj_role, Some(555));
        assert_eq!(settings.locale, None);

        // Updating one field leaves the others alone
        db.set_guild_locale(1, Some("de")).unwrap();
        let settings = db.get_guild_settings(1).unwrap();
        assert_eq!(settings.prefix.as_deref(), Some("?"));
        assert_eq!(settings.locale.as_deref(), Some("de"));

        // Clearing works too
        db.set_guild_prefix(1, None).unwrap();
        assert_eq!(db.get_guild_settings(1).unwrap().prefix, None);
    }

    #[test]
    fn test_request_channel_per_bot_rows() {
        let db = test_db();

        db.set_request_channel(1, 100, 9000, Some(1234), Some(100))
            .unwrap();
        db.set_request_channel(1, 200, 9001, None, None).unwrap();

        let (channel, message, author) = db.get_request_channel(1, 100).unwrap().unwrap();
        assert_eq!(channel, 9000);
        assert_eq!(message, Some(1234));
        assert_eq!(author, Some(100));

        let (channel, message, _) = db.get_request_channel(1, 200).unwrap().unwrap();
        assert_eq!(channel, 9001);
        assert_eq!(message, None);

        assert!(db.is_request_channel(1, 9000).unwrap());
        assert!(db.is_request_channel(1, 9001).unwrap());
        assert!(!db.is_request_channel(1, 9002).unwrap());
        assert!(!db.is_request_channel(2, 9000).unwrap());

        db.clear_request_channel(1, 100).unwrap();
        assert!(db.get_request_channel(1, 100).unwrap().is_none());
        assert!(db.get_request_channel(1, 200).unwrap().is_some());
    }

    #[test]
    fn test_player_state_round_trip() {
        let db = test_db();
        assert!(db.get_player_state(1, 100).unwrap().is_none());

        let state = PlayerState {
            loop_mode: LoopMode::Queue,
            shuffle: true,
            volume: 65,
            filters: Some("bassboost".to_string()),
        };
        db.save_player_state(1, 100, &state).unwrap();
        assert_eq!(db.get_player_state(1, 100).unwrap().unwrap(), state);

        // Overwrite, same key
        let state2 = PlayerState::default();
        db.save_player_state(1, 100, &state2).unwrap();
        assert_eq!(db.get_player_state(1, 100).unwrap().unwrap(), state2);
    }

    #[test]
    fn test_queue_snapshot_round_trip() {
        let db = test_db();

        let snapshot = QueueSnapshot {
            text_channel_id: Some(1),
            voice_channel_id: Some(2),
            songs: vec![Song {
                key: 0,
                title: "a".into(),
                url: "https://example.com/a".into(),
                duration: Some("3:14".into()),
                requester: "tester".into(),
                is_live: false,
            }],
            current_key: Some(0),
            position_secs: 42,
        };
        db.save_queue_snapshot(1, 100, &snapshot).unwrap();

        let loaded = db.load_queue_snapshot(1, 100).unwrap().unwrap();
        assert_eq!(loaded.songs.len(), 1);
        assert_eq!(loaded.current_key, Some(0));
        assert_eq!(loaded.position_secs, 42);

        let all = db.queue_snapshots_for_bot(100).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, 1);

        db.clear_queue_snapshot(1, 100).unwrap();
        assert!(db.load_queue_snapshot(1, 100).unwrap().is_none());
    }

    #[test]
    fn test_purge_guild_cascades() {
        let db = test_db();
        db.set_guild_prefix(1, Some("?")).unwrap();
        db.set_request_channel(1, 100, 9000, None, None).unwrap();
        db.save_player_state(1, 100, &PlayerState::default()).unwrap();
        db.save_queue_snapshot(
            1,
            100,
            &QueueSnapshot {
                text_channel_id: None,
                voice_channel_id: None,
                songs: vec![],
                current_key: None,
                position_secs: 0,
            },
        )
        .unwrap();
        // A second guild must survive the purge
        db.set_guild_prefix(2, Some("$")).unwrap();

        db.purge_guild(1).unwrap();

        assert_eq!(db.get_guild_settings(1).unwrap(), GuildSettings::default());
        assert!(db.get_request_channel(1, 100).unwrap().is_none());
        assert!(db.get_player_state(1, 100).unwrap().is_none());
        assert!(db.load_queue_snapshot(1, 100).unwrap().is_none());
        assert_eq!(db.get_guild_settings(2).unwrap().prefix.as_deref(), Some("$"));
    }
}
