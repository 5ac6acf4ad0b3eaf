use std::sync::Arc;
use std::time::Duration;

use serenity::model::id::{ChannelId, GuildId};
use tracing::{info, warn};

use crate::db::Database;
use crate::instance::InstanceContext;
use crate::queue::{self, advance::Advance, advance::PlaybackDriver};

/// Bring back the queues this instance had running before a restart:
/// restore the in-memory queue from each snapshot, apply the saved player
/// settings, rejoin the voice channel, and resume from the recorded
/// position.
pub async fn restore_persisted_queues(
    db: &Database,
    ictx: &Arc<InstanceContext>,
    driver: &Arc<PlaybackDriver>,
) {
    let bot_id = ictx.bot_id.get();
    let snapshots = match db.queue_snapshots_for_bot(bot_id) {
        Ok(snapshots) => snapshots,
        Err(e) => {
            warn!("queue recovery lookup failed: {}", e);
            return;
        }
    };

    for (guild_raw, snapshot) in snapshots {
        let guild_id = GuildId::new(guild_raw);
        let Some(voice_channel) = snapshot.voice_channel_id.map(ChannelId::new) else {
            let _ = db.clear_queue_snapshot(guild_raw, bot_id);
            continue;
        };
        if snapshot.songs.is_empty() {
            let _ = db.clear_queue_snapshot(guild_raw, bot_id);
            continue;
        }

        info!(
            guild = guild_raw,
            songs = snapshot.songs.len(),
            "restoring persisted queue"
        );

        let current_key = snapshot.current_key;
        let position = snapshot.position_secs;
        queue::restore_snapshot(&ictx.queues, guild_id, snapshot);
        if let Some(state) = db.get_player_state(guild_raw, bot_id).ok().flatten() {
            queue::set_loop_mode(&ictx.queues, guild_id, state.loop_mode);
            queue::set_shuffle(&ictx.queues, guild_id, state.shuffle);
            queue::set_volume(&ictx.queues, guild_id, state.volume);
        }

        if let Err(e) = ictx.songbird.join(guild_id, voice_channel).await {
            warn!(guild = guild_raw, "recovery rejoin failed: {}", e);
            queue::remove(&ictx.queues, guild_id);
            continue;
        }
        queue::bind_channel(&ictx.queues, guild_id, voice_channel, None);
        let is_request = db
            .get_request_channel(guild_raw, bot_id)
            .ok()
            .flatten()
            .is_some();
        queue::set_request_channel_mode(&ictx.queues, guild_id, is_request);

        driver
            .advance(
                guild_id,
                Advance {
                    song_key: current_key,
                    seek: Duration::from_secs(position),
                    ..Default::default()
                },
            )
            .await;
    }
}
