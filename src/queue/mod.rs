pub mod advance;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};
use songbird::tracks::TrackHandle;
use tokio::task::JoinHandle;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Song {
    /// Unique per-entry key, monotonic per queue.
    pub key: u64,
    pub title: String,
    pub url: String,
    pub duration: Option<String>,
    pub requester: String,
    pub is_live: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum LoopMode {
    #[default]
    Off,
    Song,
    Queue,
}

impl LoopMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Song => "song",
            Self::Queue => "queue",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "song" => Self::Song,
            "queue" => Self::Queue,
            _ => Self::Off,
        }
    }
}

impl std::fmt::Display for LoopMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-guild playback state for one bot instance. Two instances may each
/// hold a queue for the same guild, but never bound to the same voice
/// channel; the responsibility resolver enforces that before anything here
/// runs.
pub struct GuildQueue {
    pub songs: VecDeque<Song>,
    pub current: Option<Song>,
    pub connected_channel: Option<ChannelId>,
    pub text_channel: Option<ChannelId>,
    pub loop_mode: LoopMode,
    pub shuffle: bool,
    /// Integer percentage, 100 = unity gain.
    pub volume: u8,
    pub playing: bool,
    /// Posts to the request channel instead of plain notices.
    pub request_channel_mode: bool,
    pub track_handle: Option<TrackHandle>,
    /// Set by a skip command so the track-end handler can tell a user skip
    /// from a natural end (loop=Song only replays natural ends).
    skip_requested: bool,
    next_key: u64,
    teardown: Option<JoinHandle<()>>,
}

impl Default for GuildQueue {
    fn default() -> Self {
        Self {
            songs: VecDeque::new(),
            current: None,
            connected_channel: None,
            text_channel: None,
            loop_mode: LoopMode::Off,
            shuffle: false,
            volume: 100,
            playing: false,
            request_channel_mode: false,
            track_handle: None,
            skip_requested: false,
            next_key: 0,
            teardown: None,
        }
    }
}

impl Drop for GuildQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.teardown.take() {
            handle.abort();
        }
    }
}

/// Serializable image of a queue for crash/restart recovery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub text_channel_id: Option<u64>,
    pub voice_channel_id: Option<u64>,
    pub songs: Vec<Song>,
    pub current_key: Option<u64>,
    pub position_secs: u64,
}

/// Guard discipline: lock, mutate, release. No guard is ever held across
/// an await, which keeps these tables safe to read synchronously from the
/// responsibility resolver.
pub type QueueManager = Arc<RwLock<HashMap<GuildId, GuildQueue>>>;

pub fn new_queue_manager() -> QueueManager {
    Arc::new(RwLock::new(HashMap::new()))
}

pub fn add_song(
    manager: &QueueManager,
    guild_id: GuildId,
    title: String,
    url: String,
    requester: String,
    duration: Option<String>,
    is_live: bool,
) -> Song {
    let mut queues = manager.write().unwrap();
    let queue = queues.entry(guild_id).or_default();
    let song = Song {
        key: queue.next_key,
        title,
        url,
        duration,
        requester,
        is_live,
    };
    queue.next_key += 1;
    queue.songs.push_back(song.clone());
    song
}

/// Pick the song to play next and make it current.
///
/// An explicit key (a request-channel selection or a recovery restart) wins
/// over policy. Otherwise: loop=Song replays the current entry unless the
/// user skipped; loop=Queue reappends the finished song before popping;
/// shuffle draws a uniformly random pending entry; default is insertion
/// order.
pub fn take_selection(
    manager: &QueueManager,
    guild_id: GuildId,
    explicit_key: Option<u64>,
    was_skipped: bool,
) -> Option<Song> {
    use rand::Rng;

    let mut queues = manager.write().unwrap();
    let queue = queues.get_mut(&guild_id)?;

    if let Some(key) = explicit_key {
        let pos = queue.songs.iter().position(|s| s.key == key)?;
        let song = queue.songs.remove(pos)?;
        queue.current = Some(song.clone());
        return Some(song);
    }

    if !was_skipped && queue.loop_mode == LoopMode::Song {
        if let Some(current) = queue.current.clone() {
            return Some(current);
        }
    }

    if queue.loop_mode == LoopMode::Queue {
        if let Some(finished) = queue.current.take() {
            queue.songs.push_back(finished);
        }
    }

    let next = if queue.shuffle && queue.songs.len() > 1 {
        let idx = rand::thread_rng().gen_range(0..queue.songs.len());
        queue.songs.remove(idx)
    } else {
        queue.songs.pop_front()
    };
    queue.current = next.clone();
    next
}

/// Puts the current song back in rotation after a transient failure: tail
/// of the queue in Off/Queue mode, kept current in Song mode so the next
/// selection replays it.
pub fn requeue_current(manager: &QueueManager, guild_id: GuildId) -> Option<Song> {
    let mut queues = manager.write().unwrap();
    let queue = queues.get_mut(&guild_id)?;
    let song = queue.current.take()?;
    if queue.loop_mode == LoopMode::Song {
        queue.current = Some(song.clone());
    } else {
        queue.songs.push_back(song.clone());
    }
    Some(song)
}

/// Drops the current song permanently (skip, age restriction, dead source).
pub fn drop_current(manager: &QueueManager, guild_id: GuildId) -> Option<Song> {
    let mut queues = manager.write().unwrap();
    queues.get_mut(&guild_id)?.current.take()
}

pub fn current_song(manager: &QueueManager, guild_id: GuildId) -> Option<Song> {
    let queues = manager.read().unwrap();
    queues.get(&guild_id).and_then(|q| q.current.clone())
}

pub fn pending(manager: &QueueManager, guild_id: GuildId) -> Vec<Song> {
    let queues = manager.read().unwrap();
    queues
        .get(&guild_id)
        .map(|q| q.songs.iter().cloned().collect())
        .unwrap_or_default()
}

pub fn is_empty(manager: &QueueManager, guild_id: GuildId) -> bool {
    let queues = manager.read().unwrap();
    queues
        .get(&guild_id)
        .map_or(true, |q| q.current.is_none() && q.songs.is_empty())
}

pub fn bind_channel(
    manager: &QueueManager,
    guild_id: GuildId,
    voice_channel: ChannelId,
    text_channel: Option<ChannelId>,
) {
    let mut queues = manager.write().unwrap();
    let queue = queues.entry(guild_id).or_default();
    queue.connected_channel = Some(voice_channel);
    if text_channel.is_some() {
        queue.text_channel = text_channel;
    }
}

/// The voice channel this instance's queue is bound to, only while the
/// binding is live.
pub fn bound_channel(manager: &QueueManager, guild_id: GuildId) -> Option<ChannelId> {
    let queues = manager.read().unwrap();
    queues.get(&guild_id).and_then(|q| q.connected_channel)
}

pub fn text_channel(manager: &QueueManager, guild_id: GuildId) -> Option<ChannelId> {
    let queues = manager.read().unwrap();
    queues.get(&guild_id).and_then(|q| q.text_channel)
}

pub fn set_playing(manager: &QueueManager, guild_id: GuildId, playing: bool) {
    let mut queues = manager.write().unwrap();
    if let Some(queue) = queues.get_mut(&guild_id) {
        queue.playing = playing;
    }
}

pub fn is_playing(manager: &QueueManager, guild_id: GuildId) -> bool {
    let queues = manager.read().unwrap();
    queues.get(&guild_id).is_some_and(|q| q.playing)
}

pub fn set_loop_mode(manager: &QueueManager, guild_id: GuildId, mode: LoopMode) {
    let mut queues = manager.write().unwrap();
    queues.entry(guild_id).or_default().loop_mode = mode;
}

pub fn loop_mode(manager: &QueueManager, guild_id: GuildId) -> LoopMode {
    let queues = manager.read().unwrap();
    queues.get(&guild_id).map_or(LoopMode::Off, |q| q.loop_mode)
}

pub fn set_shuffle(manager: &QueueManager, guild_id: GuildId, shuffle: bool) {
    let mut queues = manager.write().unwrap();
    queues.entry(guild_id).or_default().shuffle = shuffle;
}

pub fn shuffle_enabled(manager: &QueueManager, guild_id: GuildId) -> bool {
    let queues = manager.read().unwrap();
    queues.get(&guild_id).is_some_and(|q| q.shuffle)
}

pub fn set_volume(manager: &QueueManager, guild_id: GuildId, volume: u8) {
    let mut queues = manager.write().unwrap();
    let queue = queues.entry(guild_id).or_default();
    queue.volume = volume;
    if let Some(handle) = &queue.track_handle {
        let _ = handle.set_volume(volume as f32 / 100.0);
    }
}

pub fn volume(manager: &QueueManager, guild_id: GuildId) -> u8 {
    let queues = manager.read().unwrap();
    queues.get(&guild_id).map_or(100, |q| q.volume)
}

pub fn set_request_channel_mode(manager: &QueueManager, guild_id: GuildId, on: bool) {
    let mut queues = manager.write().unwrap();
    queues.entry(guild_id).or_default().request_channel_mode = on;
}

pub fn request_channel_mode(manager: &QueueManager, guild_id: GuildId) -> bool {
    let queues = manager.read().unwrap();
    queues.get(&guild_id).is_some_and(|q| q.request_channel_mode)
}

pub fn set_track_handle(manager: &QueueManager, guild_id: GuildId, handle: Option<TrackHandle>) {
    let mut queues = manager.write().unwrap();
    if let Some(queue) = queues.get_mut(&guild_id) {
        queue.track_handle = handle;
    }
}

pub fn track_handle(manager: &QueueManager, guild_id: GuildId) -> Option<TrackHandle> {
    let queues = manager.read().unwrap();
    queues.get(&guild_id).and_then(|q| q.track_handle.clone())
}

pub fn request_skip(manager: &QueueManager, guild_id: GuildId) {
    let mut queues = manager.write().unwrap();
    if let Some(queue) = queues.get_mut(&guild_id) {
        queue.skip_requested = true;
    }
}

/// Reads and clears the skip flag.
pub fn take_skip_request(manager: &QueueManager, guild_id: GuildId) -> bool {
    let mut queues = manager.write().unwrap();
    queues
        .get_mut(&guild_id)
        .map_or(false, |q| std::mem::take(&mut q.skip_requested))
}

pub fn remove_at(manager: &QueueManager, guild_id: GuildId, position: usize) -> Option<Song> {
    let mut queues = manager.write().unwrap();
    let queue = queues.get_mut(&guild_id)?;
    if position > 0 && position <= queue.songs.len() {
        queue.songs.remove(position - 1)
    } else {
        None
    }
}

/// Replaces any pending idle-teardown timer with `handle`. The previous
/// timer is aborted, so repeated scheduling never stacks.
pub fn set_teardown(manager: &QueueManager, guild_id: GuildId, handle: JoinHandle<()>) {
    let mut queues = manager.write().unwrap();
    let queue = queues.entry(guild_id).or_default();
    if let Some(old) = queue.teardown.replace(handle) {
        old.abort();
    }
}

/// Cancels a pending idle-teardown, if any. Called when a new song arrives
/// inside the grace period.
pub fn cancel_teardown(manager: &QueueManager, guild_id: GuildId) {
    let mut queues = manager.write().unwrap();
    if let Some(queue) = queues.get_mut(&guild_id) {
        if let Some(handle) = queue.teardown.take() {
            handle.abort();
        }
    }
}

pub fn has_pending_teardown(manager: &QueueManager, guild_id: GuildId) -> bool {
    let queues = manager.read().unwrap();
    queues
        .get(&guild_id)
        .and_then(|q| q.teardown.as_ref())
        .is_some_and(|h| !h.is_finished())
}

/// Removes the guild's queue entirely, aborting any pending teardown.
pub fn remove(manager: &QueueManager, guild_id: GuildId) {
    let mut queues = manager.write().unwrap();
    queues.remove(&guild_id);
}

pub fn to_snapshot(manager: &QueueManager, guild_id: GuildId) -> Option<QueueSnapshot> {
    let queues = manager.read().unwrap();
    let queue = queues.get(&guild_id)?;
    let mut songs: Vec<Song> = queue.current.iter().cloned().collect();
    songs.extend(queue.songs.iter().cloned());
    Some(QueueSnapshot {
        text_channel_id: queue.text_channel.map(|c| c.get()),
        voice_channel_id: queue.connected_channel.map(|c| c.get()),
        songs,
        current_key: queue.current.as_ref().map(|s| s.key),
        position_secs: 0,
    })
}

/// Rebuilds a queue from a persisted snapshot. The caller is responsible
/// for rejoining the voice channel and restarting playback.
pub fn restore_snapshot(manager: &QueueManager, guild_id: GuildId, snapshot: QueueSnapshot) {
    let mut queues = manager.write().unwrap();
    let queue = queues.entry(guild_id).or_default();
    queue.text_channel = snapshot.text_channel_id.map(ChannelId::new);
    queue.next_key = snapshot
        .songs
        .iter()
        .map(|s| s.key + 1)
        .max()
        .unwrap_or(0);
    queue.songs = snapshot.songs.into();
    queue.current = None;
}
