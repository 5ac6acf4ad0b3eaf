use std::sync::Arc;
use std::time::Duration;

use serenity::async_trait;
use serenity::http::Http;
use serenity::model::id::GuildId;
use tracing::warn;

use crate::queue::advance::{Notice, Notifier};
use crate::queue::{self, QueueManager};

/// Posts playback notices to the queue's text channel. In request-channel
/// mode the chatty notices are suppressed entirely and the rest are cleaned
/// up after a delay; only the credentials notice stays put, since it needs
/// an operator to see it.
pub struct ChannelNotifier {
    http: Arc<Http>,
    queues: QueueManager,
    delete_delay: Duration,
}

impl ChannelNotifier {
    pub fn new(http: Arc<Http>, queues: QueueManager, delete_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            http,
            queues,
            delete_delay,
        })
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, guild_id: GuildId, notice: Notice) {
        let Some(channel) = queue::text_channel(&self.queues, guild_id) else {
            return;
        };
        let request_mode = queue::request_channel_mode(&self.queues, guild_id);

        let persistent = matches!(notice, Notice::CredentialsExhausted);
        let text = match &notice {
            Notice::QueueEnded | Notice::Requeued { .. } if request_mode => return,
            Notice::QueueEnded => "📭 Queue ended. Leaving in a minute unless more songs arrive.".to_string(),
            Notice::NowPlaying { title } => format!("🎵 Now playing: **{title}**"),
            Notice::Requeued { title } => {
                format!("🔁 **{title}** hit a stream error and was re-queued.")
            }
            Notice::AgeRestricted { title } => {
                format!("🔞 **{title}** is age-restricted and was skipped.")
            }
            Notice::CredentialsExhausted => {
                "❌ The media backend rejected every configured credential. \
                 Playback is stopped until an operator refreshes them (see `credentials`)."
                    .to_string()
            }
            Notice::PlaybackError { title, detail } => {
                format!("⚠️ **{title}** could not be played: {detail}")
            }
        };

        match channel.say(&self.http, text).await {
            Ok(message) => {
                if request_mode && !persistent {
                    let http = self.http.clone();
                    let delay = self.delete_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = message.delete(&http).await;
                    });
                }
            }
            Err(e) => warn!(guild = guild_id.get(), "failed to post notice: {}", e),
        }
    }
}
