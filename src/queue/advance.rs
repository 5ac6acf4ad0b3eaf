use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serenity::model::id::GuildId;
use thiserror::Error;
use tracing::{info, warn};

use super::{QueueManager, Song};
use crate::queue;

/// Failure classification for the playback pipeline. Everything the media
/// backend or decoder can throw collapses into one of these; the advance
/// loop decides requeue/skip/destroy from the variant alone.
#[derive(Debug, Error)]
pub enum PlaybackError {
    /// Premature stream close, pipe failure, network hiccup. The song is
    /// put back in rotation and the next selection is tried immediately.
    #[error("transient stream failure: {0}")]
    Transient(String),

    /// Content restriction. The song is dropped permanently, never retried.
    #[error("age-restricted content")]
    AgeRestricted,

    /// Every configured credential was rejected by the media backend. The
    /// whole queue is destroyed; an operator has to step in.
    #[error("all configured credentials were rejected")]
    CredentialsExhausted,

    /// Voice connection failed to reach ready state within the bound.
    #[error("voice connection not ready within {0:?}")]
    ConnectionTimeout(Duration),

    /// Anything else. The song is dropped and playback continues.
    #[error("{0}")]
    Unrecoverable(String),
}

/// Deletes the wrapped file when dropped. Handed along with a buffered
/// source so the temp file survives exactly as long as decoding does.
#[derive(Debug)]
pub struct TempFileGuard(pub PathBuf);

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            warn!("failed to delete temp audio file {:?}: {}", self.0, e);
        }
    }
}

/// What stream resolution produced: either a local file (pre-cached, or
/// freshly buffered for a seek into a live stream) or a remote URL handed
/// to the decoder directly.
#[derive(Debug)]
pub enum ResolvedSource {
    File {
        path: PathBuf,
        temp: Option<TempFileGuard>,
    },
    Remote {
        url: String,
    },
}

/// Media-resolution collaborator.
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve(&self, song: &Song, seek: Duration) -> Result<ResolvedSource, PlaybackError>;
}

/// Voice-output collaborator: owns the songbird call for each guild.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Waits for the voice connection to reach a ready state, bounded.
    async fn wait_ready(&self, guild_id: GuildId, timeout: Duration) -> Result<(), PlaybackError>;

    /// Builds the decode input from `source` and starts it on the guild's
    /// call. Takes ownership of the source so temp files live as long as
    /// the decoder needs them.
    async fn play(
        &self,
        guild_id: GuildId,
        source: ResolvedSource,
        song: &Song,
        seek: Duration,
        volume: u8,
    ) -> Result<(), PlaybackError>;

    async fn disconnect(&self, guild_id: GuildId);
}

/// User-visible playback events. The notifier decides where (and whether)
/// each one surfaces; request-channel mode suppresses the chatty ones.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    QueueEnded,
    NowPlaying { title: String },
    Requeued { title: String },
    AgeRestricted { title: String },
    CredentialsExhausted,
    PlaybackError { title: String, detail: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, guild_id: GuildId, notice: Notice);
}

/// Parameters for one advance call.
#[derive(Clone, Debug, Default)]
pub struct Advance {
    /// Play this exact entry instead of applying selection policy.
    pub song_key: Option<u64>,
    pub seek: Duration,
    /// Resuming an established connection: skip the ready wait.
    pub resuming: bool,
    /// The previous song was skipped by a user (affects loop=Song).
    pub was_skipped: bool,
}

enum Flow {
    Continue,
    Stop,
}

/// Per-guild playback driver. Selects the next song, resolves its stream,
/// starts playback, and classifies failures into requeue/skip/destroy.
///
/// Retries run as an explicit loop, not recursion, so a pathological run of
/// failing songs keeps stack depth flat. Callers must not run two advances
/// for the same guild concurrently; the flow is driven from a single
/// track-end or play trigger at a time.
pub struct PlaybackDriver {
    queues: QueueManager,
    streams: Arc<dyn StreamResolver>,
    sink: Arc<dyn PlaybackSink>,
    notifier: Arc<dyn Notifier>,
    idle_teardown: Duration,
    ready_timeout: Duration,
}

impl PlaybackDriver {
    pub fn new(
        queues: QueueManager,
        streams: Arc<dyn StreamResolver>,
        sink: Arc<dyn PlaybackSink>,
        notifier: Arc<dyn Notifier>,
        idle_teardown: Duration,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            queues,
            streams,
            sink,
            notifier,
            idle_teardown,
            ready_timeout,
        }
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    /// Advance playback: pick a song and get it playing, or wind the queue
    /// down. Never returns an error; every failure class is absorbed into a
    /// requeue, a skip, or a queue destruction.
    pub async fn advance(&self, guild_id: GuildId, opts: Advance) {
        let mut explicit_key = opts.song_key;
        let mut seek = opts.seek;
        let mut resuming = opts.resuming;
        let mut was_skipped = opts.was_skipped;

        loop {
            let selected =
                queue::take_selection(&self.queues, guild_id, explicit_key.take(), was_skipped);
            let Some(song) = selected else {
                self.finish(guild_id).await;
                return;
            };
            queue::cancel_teardown(&self.queues, guild_id);

            let source = match self.streams.resolve(&song, seek).await {
                Ok(source) => source,
                Err(e) => match self.handle_failure(guild_id, &song, e).await {
                    Flow::Stop => return,
                    Flow::Continue => {
                        (seek, resuming, was_skipped) = (Duration::ZERO, false, true);
                        continue;
                    }
                },
            };

            if !resuming {
                if let Err(e) = self.sink.wait_ready(guild_id, self.ready_timeout).await {
                    // Ready timeout is surfaced, not retried.
                    warn!(
                        guild = guild_id.get(),
                        "voice connection not ready: {}", e
                    );
                    self.notifier
                        .notify(
                            guild_id,
                            Notice::PlaybackError {
                                title: song.title.clone(),
                                detail: truncate_error(&e.to_string()),
                            },
                        )
                        .await;
                    queue::set_playing(&self.queues, guild_id, false);
                    return;
                }
            }

            let volume = queue::volume(&self.queues, guild_id);
            match self.sink.play(guild_id, source, &song, seek, volume).await {
                Ok(()) => {
                    info!(
                        guild = guild_id.get(),
                        title = %song.title,
                        "playback started"
                    );
                    queue::set_playing(&self.queues, guild_id, true);
                    self.notifier
                        .notify(
                            guild_id,
                            Notice::NowPlaying {
                                title: song.title.clone(),
                            },
                        )
                        .await;
                    return;
                }
                Err(e) => match self.handle_failure(guild_id, &song, e).await {
                    Flow::Stop => return,
                    Flow::Continue => {
                        (seek, resuming, was_skipped) = (Duration::ZERO, false, true);
                        continue;
                    }
                },
            }
        }
    }

    /// Disconnect, clear, and forget the guild's queue. Used for the fatal
    /// classification and for explicit stop commands.
    pub async fn destroy(&self, guild_id: GuildId) {
        queue::cancel_teardown(&self.queues, guild_id);
        self.sink.disconnect(guild_id).await;
        queue::remove(&self.queues, guild_id);
    }

    async fn handle_failure(&self, guild_id: GuildId, song: &Song, err: PlaybackError) -> Flow {
        warn!(
            guild = guild_id.get(),
            title = %song.title,
            "playback failure: {}", err
        );
        match err {
            PlaybackError::Transient(_) => {
                // One-shot requeue; no counter survives a later success, so
                // a flaky song is retried for as long as it stays flaky.
                queue::requeue_current(&self.queues, guild_id);
                self.notifier
                    .notify(
                        guild_id,
                        Notice::Requeued {
                            title: song.title.clone(),
                        },
                    )
                    .await;
                Flow::Continue
            }
            PlaybackError::AgeRestricted => {
                queue::drop_current(&self.queues, guild_id);
                self.notifier
                    .notify(
                        guild_id,
                        Notice::AgeRestricted {
                            title: song.title.clone(),
                        },
                    )
                    .await;
                Flow::Continue
            }
            PlaybackError::CredentialsExhausted => {
                // Notify while the queue (and its text channel) still exists.
                self.notifier
                    .notify(guild_id, Notice::CredentialsExhausted)
                    .await;
                self.destroy(guild_id).await;
                Flow::Stop
            }
            PlaybackError::ConnectionTimeout(_) => {
                self.notifier
                    .notify(
                        guild_id,
                        Notice::PlaybackError {
                            title: song.title.clone(),
                            detail: truncate_error(&err.to_string()),
                        },
                    )
                    .await;
                Flow::Stop
            }
            PlaybackError::Unrecoverable(detail) => {
                queue::drop_current(&self.queues, guild_id);
                self.notifier
                    .notify(
                        guild_id,
                        Notice::PlaybackError {
                            title: song.title.clone(),
                            detail: truncate_error(&detail),
                        },
                    )
                    .await;
                Flow::Continue
            }
        }
    }

    /// Queue ran dry: announce it and schedule the idle teardown. A fresh
    /// timer replaces any pending one, and a play call inside the grace
    /// period cancels it.
    async fn finish(&self, guild_id: GuildId) {
        queue::set_playing(&self.queues, guild_id, false);
        self.notifier.notify(guild_id, Notice::QueueEnded).await;

        let queues = self.queues.clone();
        let sink = self.sink.clone();
        let grace = self.idle_teardown;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if queue::is_empty(&queues, guild_id) {
                info!(guild = guild_id.get(), "idle grace period expired, tearing down");
                sink.disconnect(guild_id).await;
                queue::remove(&queues, guild_id);
            }
        });
        queue::set_teardown(&self.queues, guild_id, handle);
    }
}

fn truncate_error(detail: &str) -> String {
    const MAX: usize = 200;
    if detail.len() > MAX {
        let mut end = MAX;
        while !detail.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &detail[..end])
    } else {
        detail.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const G: GuildId = GuildId::new(42);

    /// Replays a scripted sequence of resolution results, then succeeds.
    struct ScriptedStreams {
        script: Mutex<VecDeque<Result<(), PlaybackError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedStreams {
        fn new(script: Vec<Result<(), PlaybackError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl StreamResolver for ScriptedStreams {
        async fn resolve(
            &self,
            song: &Song,
            _seek: Duration,
        ) -> Result<ResolvedSource, PlaybackError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(())) | None => Ok(ResolvedSource::Remote {
                    url: song.url.clone(),
                }),
                Some(Err(e)) => Err(e),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        played: Mutex<Vec<String>>,
        disconnects: AtomicUsize,
        ready_fails: AtomicUsize,
    }

    #[async_trait]
    impl PlaybackSink for RecordingSink {
        async fn wait_ready(
            &self,
            _guild_id: GuildId,
            timeout: Duration,
        ) -> Result<(), PlaybackError> {
            if self.ready_fails.load(Ordering::SeqCst) > 0 {
                self.ready_fails.fetch_sub(1, Ordering::SeqCst);
                return Err(PlaybackError::ConnectionTimeout(timeout));
            }
            Ok(())
        }

        async fn play(
            &self,
            _guild_id: GuildId,
            _source: ResolvedSource,
            song: &Song,
            _seek: Duration,
            _volume: u8,
        ) -> Result<(), PlaybackError> {
            self.played.lock().unwrap().push(song.title.clone());
            Ok(())
        }

        async fn disconnect(&self, _guild_id: GuildId) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<Notice>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, _guild_id: GuildId, notice: Notice) {
            self.notices.lock().unwrap().push(notice);
        }
    }

    struct Harness {
        driver: PlaybackDriver,
        streams: Arc<ScriptedStreams>,
        sink: Arc<RecordingSink>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness(script: Vec<Result<(), PlaybackError>>, idle: Duration) -> Harness {
        let streams = ScriptedStreams::new(script);
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let driver = PlaybackDriver::new(
            queue::new_queue_manager(),
            streams.clone(),
            sink.clone(),
            notifier.clone(),
            idle,
            Duration::from_secs(15),
        );
        Harness {
            driver,
            streams,
            sink,
            notifier,
        }
    }

    fn enqueue(h: &Harness, titles: &[&str]) {
        for t in titles {
            queue::add_song(
                h.driver.queues(),
                G,
                t.to_string(),
                format!("https://example.com/{t}"),
                "tester".to_string(),
                None,
                false,
            );
        }
    }

    fn notices(h: &Harness) -> Vec<Notice> {
        h.notifier.notices.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_happy_path_plays_first_song() {
        let h = harness(vec![], Duration::from_secs(60));
        enqueue(&h, &["a", "b"]);

        h.driver.advance(G, Advance::default()).await;

        assert_eq!(*h.sink.played.lock().unwrap(), vec!["a".to_string()]);
        assert!(notices(&h).contains(&Notice::NowPlaying { title: "a".into() }));
        assert_eq!(
            queue::current_song(h.driver.queues(), G).unwrap().title,
            "a"
        );
    }

    #[tokio::test]
    async fn test_transient_failures_requeue_until_success() {
        // Song "a" fails twice, then plays. Each failure is a one-shot
        // requeue, so with a single-entry queue it keeps coming back.
        let h = harness(
            vec![
                Err(PlaybackError::Transient("pipe broke".into())),
                Err(PlaybackError::Transient("pipe broke again".into())),
                Ok(()),
            ],
            Duration::from_secs(60),
        );
        enqueue(&h, &["a"]);

        h.driver.advance(G, Advance::default()).await;

        assert_eq!(h.streams.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*h.sink.played.lock().unwrap(), vec!["a".to_string()]);
        let requeues = notices(&h)
            .iter()
            .filter(|n| matches!(n, Notice::Requeued { .. }))
            .count();
        assert_eq!(requeues, 2);
    }

    #[tokio::test]
    async fn test_fatal_destroys_queue_on_first_occurrence() {
        let h = harness(
            vec![Err(PlaybackError::CredentialsExhausted)],
            Duration::from_secs(60),
        );
        enqueue(&h, &["a", "b", "c"]);

        h.driver.advance(G, Advance::default()).await;

        // Queue is gone, voice disconnected, nothing was played.
        assert!(queue::is_empty(h.driver.queues(), G));
        assert_eq!(h.sink.disconnects.load(Ordering::SeqCst), 1);
        assert!(h.sink.played.lock().unwrap().is_empty());
        assert_eq!(
            notices(&h)
                .iter()
                .filter(|n| **n == Notice::CredentialsExhausted)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_age_restricted_skips_and_continues() {
        let h = harness(
            vec![Err(PlaybackError::AgeRestricted), Ok(())],
            Duration::from_secs(60),
        );
        enqueue(&h, &["a", "b"]);

        h.driver.advance(G, Advance::default()).await;

        assert_eq!(*h.sink.played.lock().unwrap(), vec!["b".to_string()]);
        assert!(notices(&h).contains(&Notice::AgeRestricted { title: "a".into() }));
        // "a" is gone for good
        assert!(queue::pending(h.driver.queues(), G).is_empty());
    }

    #[tokio::test]
    async fn test_unrecoverable_drops_with_truncated_detail() {
        let long = "x".repeat(500);
        let h = harness(
            vec![Err(PlaybackError::Unrecoverable(long)), Ok(())],
            Duration::from_secs(60),
        );
        enqueue(&h, &["a", "b"]);

        h.driver.advance(G, Advance::default()).await;

        assert_eq!(*h.sink.played.lock().unwrap(), vec!["b".to_string()]);
        let detail = notices(&h)
            .iter()
            .find_map(|n| match n {
                Notice::PlaybackError { detail, .. } => Some(detail.clone()),
                _ => None,
            })
            .unwrap();
        assert!(detail.chars().count() <= 201);
    }

    #[tokio::test]
    async fn test_ready_timeout_surfaces_without_retry() {
        let h = harness(vec![], Duration::from_secs(60));
        h.sink.ready_fails.store(1, Ordering::SeqCst);
        enqueue(&h, &["a"]);

        h.driver.advance(G, Advance::default()).await;

        assert!(h.sink.played.lock().unwrap().is_empty());
        assert_eq!(h.streams.calls.load(Ordering::SeqCst), 1);
        assert!(notices(&h)
            .iter()
            .any(|n| matches!(n, Notice::PlaybackError { .. })));
    }

    #[tokio::test]
    async fn test_resuming_skips_ready_wait() {
        let h = harness(vec![], Duration::from_secs(60));
        h.sink.ready_fails.store(1, Ordering::SeqCst);
        enqueue(&h, &["a"]);

        h.driver
            .advance(
                G,
                Advance {
                    resuming: true,
                    ..Default::default()
                },
            )
            .await;

        // The scripted ready failure was never consulted.
        assert_eq!(*h.sink.played.lock().unwrap(), vec!["a".to_string()]);
        assert_eq!(h.sink.ready_fails.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_queue_schedules_single_teardown() {
        let h = harness(vec![], Duration::from_millis(50));
        // Materialize an empty queue entry
        queue::set_volume(h.driver.queues(), G, 100);

        h.driver.advance(G, Advance::default()).await;
        h.driver.advance(G, Advance::default()).await;
        assert!(queue::has_pending_teardown(h.driver.queues(), G));

        tokio::time::sleep(Duration::from_millis(200)).await;

        // Two back-to-back advances replaced the timer instead of stacking:
        // exactly one disconnect fired.
        assert_eq!(h.sink.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(
            notices(&h)
                .iter()
                .filter(|n| **n == Notice::QueueEnded)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_new_song_cancels_teardown() {
        let h = harness(vec![], Duration::from_millis(50));
        queue::set_volume(h.driver.queues(), G, 100);

        h.driver.advance(G, Advance::default()).await;
        assert!(queue::has_pending_teardown(h.driver.queues(), G));

        enqueue(&h, &["a"]);
        h.driver.advance(G, Advance::default()).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Teardown was cancelled by the new play; the connection stayed up.
        assert_eq!(h.sink.disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(*h.sink.played.lock().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_explicit_key_advance() {
        let h = harness(vec![], Duration::from_secs(60));
        enqueue(&h, &["a", "b", "c"]);

        h.driver
            .advance(
                G,
                Advance {
                    song_key: Some(1),
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(*h.sink.played.lock().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_truncate_error_respects_char_boundaries() {
        let s = "é".repeat(300);
        let t = truncate_error(&s);
        assert!(t.len() <= 204);
        assert!(t.ends_with('…'));
        assert_eq!(truncate_error("short"), "short");
    }
}
