use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use serenity::async_trait;
use serenity::model::id::GuildId;
use songbird::events::{Event, EventContext, EventHandler, TrackEvent};
use songbird::input::{File as FileInput, HttpRequest, Input};
use tracing::{error, warn};

use crate::queue::advance::{
    Advance, PlaybackDriver, PlaybackError, PlaybackSink, ResolvedSource, TempFileGuard,
};
use crate::queue::{self, QueueManager, Song};

/// Songbird-backed playback output for one instance. Holds a weak handle
/// back to the driver so track-end events can trigger the next advance.
pub struct SongbirdSink {
    songbird: Arc<songbird::Songbird>,
    http: reqwest::Client,
    queues: QueueManager,
    driver: OnceLock<Weak<PlaybackDriver>>,
}

impl SongbirdSink {
    pub fn new(
        songbird: Arc<songbird::Songbird>,
        http: reqwest::Client,
        queues: QueueManager,
    ) -> Arc<Self> {
        Arc::new(Self {
            songbird,
            http,
            queues,
            driver: OnceLock::new(),
        })
    }

    /// Wire the driver in after construction; sink and driver reference
    /// each other, so one side has to attach late.
    pub fn attach_driver(&self, driver: &Arc<PlaybackDriver>) {
        let _ = self.driver.set(Arc::downgrade(driver));
    }
}

#[async_trait]
impl PlaybackSink for SongbirdSink {
    async fn wait_ready(&self, guild_id: GuildId, timeout: Duration) -> Result<(), PlaybackError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(call) = self.songbird.get(guild_id) {
                if call.lock().await.current_connection().is_some() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PlaybackError::ConnectionTimeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn play(
        &self,
        guild_id: GuildId,
        source: ResolvedSource,
        song: &Song,
        seek: Duration,
        volume: u8,
    ) -> Result<(), PlaybackError> {
        let call = self.songbird.get(guild_id).ok_or_else(|| {
            PlaybackError::Transient("no voice connection for guild".to_string())
        })?;

        let (input, temp): (Input, Option<TempFileGuard>) = match source {
            ResolvedSource::File { path, temp } => (FileInput::new(path).into(), temp),
            ResolvedSource::Remote { url } => {
                (HttpRequest::new(self.http.clone(), url).into(), None)
            }
        };

        let handle = {
            let mut call = call.lock().await;
            call.play_only(input.into())
        };
        let _ = handle.set_volume(volume as f32 / 100.0);
        if !seek.is_zero() {
            let _ = handle.seek(seek);
        }

        handle
            .add_event(
                Event::Track(TrackEvent::End),
                TrackEndRelay {
                    guild_id,
                    queues: self.queues.clone(),
                    driver: self.driver.get().cloned().unwrap_or_default(),
                    _temp: temp,
                },
            )
            .map_err(|e| PlaybackError::Transient(format!("track event hook: {e}")))?;

        queue::set_track_handle(&self.queues, guild_id, Some(handle));
        tracing::debug!(guild = guild_id.get(), title = %song.title, "decode pipeline started");
        Ok(())
    }

    async fn disconnect(&self, guild_id: GuildId) {
        queue::set_track_handle(&self.queues, guild_id, None);
        if let Err(e) = self.songbird.remove(guild_id).await {
            warn!(guild = guild_id.get(), "voice disconnect failed: {}", e);
        }
    }
}

/// Drives the next advance when a track finishes. Also keeps any buffered
/// temp file alive until the decoder is done with it.
struct TrackEndRelay {
    guild_id: GuildId,
    queues: QueueManager,
    driver: Weak<PlaybackDriver>,
    _temp: Option<TempFileGuard>,
}

#[async_trait]
impl EventHandler for TrackEndRelay {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        let guild_id = self.guild_id;
        queue::set_track_handle(&self.queues, guild_id, None);
        let was_skipped = queue::take_skip_request(&self.queues, guild_id);

        let Some(driver) = self.driver.upgrade() else {
            error!(guild = guild_id.get(), "playback driver dropped before track end");
            return None;
        };
        tokio::spawn(async move {
            driver
                .advance(
                    guild_id,
                    Advance {
                        was_skipped,
                        ..Default::default()
                    },
                )
                .await;
        });
        None
    }
}
