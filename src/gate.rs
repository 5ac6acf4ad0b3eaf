use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};
use tracing::debug;

use crate::registry::BotInstance;
use crate::resolver::ResponsibilityResolver;

/// Music commands are gated by the invoking user's voice channel rather
/// than the bot's default guild responsibility.
const MUSIC_COMMANDS: &[&str] = &[
    "play",
    "p",
    "skip",
    "queue",
    "q",
    "pause",
    "resume",
    "loop",
    "shuffle",
    "volume",
    "stop",
    "leave",
    "join",
    "nowplaying",
    "np",
    "remove",
    "seek",
];

pub fn is_music_command(name: &str) -> bool {
    MUSIC_COMMANDS.contains(&name)
}

/// The slice of an inbound gateway message the gate consumes, adapted at
/// the event-handler boundary.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub author_is_bot: bool,
    pub content: String,
    /// The author's current voice channel, if any.
    pub user_voice_channel: Option<ChannelId>,
}

/// What the gate decided for a message.
#[derive(Clone, Debug, PartialEq)]
pub enum GateDecision {
    /// Run the command. The matched prefix is included because mention
    /// prefixes have a different length than literal ones.
    Dispatch {
        prefix: String,
        command: String,
        rest: String,
    },
    /// Plain text in the request channel: treat as a song search query.
    SearchRequest { query: String },
    /// Some other instance is expected to act (or nobody should).
    Ignore,
}

/// Time-bounded (message, bot) dedup set. Multiple listeners can observe
/// the same gateway event; an entry is processed at most once per window.
struct DedupWindow {
    seen: LruCache<(u64, u64), Instant>,
    window: Duration,
}

impl DedupWindow {
    fn new(window: Duration) -> Self {
        Self {
            seen: LruCache::new(NonZeroUsize::new(2048).unwrap()),
            window,
        }
    }

    /// True the first time a key is seen within the window.
    fn insert(&mut self, message_id: MessageId, bot_id: UserId) -> bool {
        let now = Instant::now();
        // Evict expired entries from the cold end before checking.
        while let Some((_, stamp)) = self.seen.peek_lru() {
            if now.duration_since(*stamp) > self.window {
                self.seen.pop_lru();
            } else {
                break;
            }
        }

        let key = (message_id.get(), bot_id.get());
        if let Some(stamp) = self.seen.peek(&key) {
            if now.duration_since(*stamp) <= self.window {
                return false;
            }
        }
        self.seen.put(key, now);
        true
    }
}

/// Gates inbound command messages through the responsibility resolver
/// before any side effect happens. Holds no durable state beyond the
/// dedup window.
pub struct CommandGate {
    resolver: Arc<ResponsibilityResolver>,
    global_prefixes: Vec<String>,
    dedup: Mutex<DedupWindow>,
}

impl CommandGate {
    pub fn new(
        resolver: Arc<ResponsibilityResolver>,
        global_prefixes: Vec<String>,
        dedup_window: Duration,
    ) -> Self {
        Self {
            resolver,
            global_prefixes,
            dedup: Mutex::new(DedupWindow::new(dedup_window)),
        }
    }

    /// Decide what `bot` should do with a message. Rejections are silent:
    /// when this instance is not responsible, another one is expected to
    /// answer, so no error surfaces to the user.
    pub fn decide(
        &self,
        bot: &BotInstance,
        msg: &InboundMessage,
        guild_prefix: Option<&str>,
        is_request_channel: bool,
    ) -> GateDecision {
        if msg.author_is_bot {
            return GateDecision::Ignore;
        }

        if !self
            .dedup
            .lock()
            .unwrap()
            .insert(msg.message_id, bot.bot_id)
        {
            debug!(
                message = msg.message_id.get(),
                bot = bot.bot_id.get(),
                "duplicate delivery dropped"
            );
            return GateDecision::Ignore;
        }

        let Some(matched) = self.match_prefix(bot, &msg.content, guild_prefix) else {
            if is_request_channel {
                return self.decide_song_request(bot, msg);
            }
            return GateDecision::Ignore;
        };

        let body = msg.content[matched.prefix.len()..].trim_start();
        let (command, rest) = match body.split_once(char::is_whitespace) {
            Some((c, r)) => (c.to_string(), r.trim().to_string()),
            None => (body.to_string(), String::new()),
        };
        if command.is_empty() {
            return GateDecision::Ignore;
        }

        // The user explicitly addressed this instance by mention; honoring
        // the address beats responsibility arbitration.
        let accepted = if matched.is_mention {
            true
        } else if is_music_command(&command) {
            self.resolver
                .should_respond_to_music(bot, msg.guild_id, msg.user_voice_channel)
        } else {
            self.resolver.should_respond(bot, msg.guild_id)
        };

        if accepted {
            GateDecision::Dispatch {
                prefix: matched.prefix,
                command,
                rest,
            }
        } else {
            GateDecision::Ignore
        }
    }

    /// Plain text in the request channel is a song request: a voice-
    /// triggered flow, gated by channel ownership rather than prefix.
    fn decide_song_request(&self, bot: &BotInstance, msg: &InboundMessage) -> GateDecision {
        let query = msg.content.trim();
        if query.is_empty() {
            return GateDecision::Ignore;
        }
        let Some(user_vc) = msg.user_voice_channel else {
            return GateDecision::Ignore;
        };
        if self
            .resolver
            .should_respond_to_voice(bot, msg.guild_id, user_vc)
        {
            GateDecision::SearchRequest {
                query: query.to_string(),
            }
        } else {
            GateDecision::Ignore
        }
    }

    fn match_prefix(
        &self,
        bot: &BotInstance,
        content: &str,
        guild_prefix: Option<&str>,
    ) -> Option<MatchedPrefix> {
        if let Some(p) = guild_prefix {
            if content.starts_with(p) {
                return Some(MatchedPrefix {
                    prefix: p.to_string(),
                    is_mention: false,
                });
            }
        }
        for p in &self.global_prefixes {
            if content.starts_with(p.as_str()) {
                return Some(MatchedPrefix {
                    prefix: p.clone(),
                    is_mention: false,
                });
            }
        }
        for mention in [
            format!("<@{}>", bot.bot_id.get()),
            format!("<@!{}>", bot.bot_id.get()),
        ] {
            if content.starts_with(&mention) {
                return Some(MatchedPrefix {
                    prefix: mention,
                    is_mention: true,
                });
            }
        }
        None
    }
}

struct MatchedPrefix {
    prefix: String,
    is_mention: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::*;
    use crate::registry::BotRegistry;

    const G: GuildId = GuildId::new(10);

    fn msg(id: u64, content: &str) -> InboundMessage {
        InboundMessage {
            message_id: MessageId::new(id),
            guild_id: G,
            channel_id: ChannelId::new(1),
            author_id: UserId::new(777),
            author_is_bot: false,
            content: content.to_string(),
            user_voice_channel: None,
        }
    }

    struct Fixture {
        gate: CommandGate,
        primary: BotInstance,
        secondary: BotInstance,
        primary_state: Arc<FakeInstanceState>,
        secondary_state: Arc<FakeInstanceState>,
    }

    fn fixture() -> Fixture {
        fixture_with_window(Duration::from_secs(5))
    }

    fn fixture_with_window(window: Duration) -> Fixture {
        let registry = Arc::new(BotRegistry::new());
        let primary_state = FakeInstanceState::member(G);
        let secondary_state = FakeInstanceState::member(G);
        registry.register(instance(0, 100, primary_state.clone()));
        registry.register(instance(1, 200, secondary_state.clone()));
        let resolver = Arc::new(ResponsibilityResolver::new(registry.clone(), true));
        Fixture {
            gate: CommandGate::new(resolver, vec!["!".to_string()], window),
            primary: registry.by_index(0).unwrap(),
            secondary: registry.by_index(1).unwrap(),
            primary_state,
            secondary_state,
        }
    }

    fn dispatched(decision: &GateDecision) -> bool {
        matches!(decision, GateDecision::Dispatch { .. })
    }

    #[test]
    fn test_dedup_dispatches_at_most_once() {
        let f = fixture();
        let m = msg(1, "!help");
        assert!(dispatched(&f.gate.decide(&f.primary, &m, None, false)));
        assert_eq!(
            f.gate.decide(&f.primary, &m, None, false),
            GateDecision::Ignore
        );
        // A different instance observing the same message is a separate key
        // (it has its own gate in production, but the key is (msg, bot)).
        assert!(!dispatched(&f.gate.decide(&f.secondary, &m, None, false)));
    }

    #[test]
    fn test_dedup_window_expires() {
        let f = fixture_with_window(Duration::from_millis(10));
        let m = msg(1, "!help");
        assert!(dispatched(&f.gate.decide(&f.primary, &m, None, false)));
        std::thread::sleep(Duration::from_millis(25));
        assert!(dispatched(&f.gate.decide(&f.primary, &m, None, false)));
    }

    #[test]
    fn test_non_music_goes_to_responsible_instance() {
        let f = fixture();
        assert!(dispatched(&f.gate.decide(
            &f.primary,
            &msg(1, "!settings prefix ?"),
            None,
            false
        )));
        assert_eq!(
            f.gate
                .decide(&f.secondary, &msg(2, "!settings prefix ?"), None, false),
            GateDecision::Ignore
        );
    }

    #[test]
    fn test_music_command_follows_user_channel() {
        let f = fixture();
        // Primary is busy on vc1; user sits in vc2 where secondary's queue lives.
        f.primary_state.set_queue_vc(Some(ChannelId::new(31)));
        f.secondary_state.set_queue_vc(Some(ChannelId::new(32)));

        let mut m = msg(1, "!play never gonna give you up");
        m.user_voice_channel = Some(ChannelId::new(32));

        assert_eq!(
            f.gate.decide(&f.primary, &m, None, false),
            GateDecision::Ignore
        );
        let m2 = InboundMessage {
            message_id: MessageId::new(2),
            ..m
        };
        match f.gate.decide(&f.secondary, &m2, None, false) {
            GateDecision::Dispatch { command, rest, .. } => {
                assert_eq!(command, "play");
                assert_eq!(rest, "never gonna give you up");
            }
            other => panic!("expected dispatch, got {:?}", other),
        }
    }

    #[test]
    fn test_mention_bypasses_responsibility() {
        let f = fixture();
        // Secondary would normally defer to the primary, but a direct
        // mention is an explicit address.
        let m = msg(1, "<@200> skip");
        match f.gate.decide(&f.secondary, &m, None, false) {
            GateDecision::Dispatch {
                prefix, command, ..
            } => {
                assert_eq!(prefix, "<@200>");
                assert_eq!(command, "skip");
            }
            other => panic!("expected dispatch, got {:?}", other),
        }
    }

    #[test]
    fn test_guild_prefix_wins_over_global() {
        let f = fixture();
        let m = msg(1, "?play abc");
        assert_eq!(
            f.gate.decide(&f.primary, &m, None, false),
            GateDecision::Ignore
        );
        let m = msg(2, "?queue");
        match f.gate.decide(&f.primary, &m, Some("?"), false) {
            GateDecision::Dispatch { prefix, .. } => assert_eq!(prefix, "?"),
            other => panic!("expected dispatch, got {:?}", other),
        }
    }

    #[test]
    fn test_no_prefix_is_ignored_outside_request_channel() {
        let f = fixture();
        assert_eq!(
            f.gate.decide(&f.primary, &msg(1, "just chatting"), None, false),
            GateDecision::Ignore
        );
    }

    #[test]
    fn test_request_channel_free_text_is_search() {
        let f = fixture();
        let mut m = msg(1, "daft punk around the world");
        m.user_voice_channel = Some(ChannelId::new(31));

        match f.gate.decide(&f.primary, &m, None, true) {
            GateDecision::SearchRequest { query } => {
                assert_eq!(query, "daft punk around the world");
            }
            other => panic!("expected search request, got {:?}", other),
        }

        // Without a voice channel there is nothing to own; stay silent.
        let mut m2 = msg(2, "daft punk around the world");
        m2.user_voice_channel = None;
        assert_eq!(
            f.gate.decide(&f.primary, &m2, None, true),
            GateDecision::Ignore
        );
    }

    #[test]
    fn test_request_channel_search_respects_ownership() {
        let f = fixture();
        // vc 31 is owned by the secondary's queue; the primary must not
        // answer the song request.
        f.secondary_state.set_queue_vc(Some(ChannelId::new(31)));

        let mut m = msg(1, "some song");
        m.user_voice_channel = Some(ChannelId::new(31));
        assert_eq!(
            f.gate.decide(&f.primary, &m, None, true),
            GateDecision::Ignore
        );

        let mut m2 = msg(2, "some song");
        m2.user_voice_channel = Some(ChannelId::new(31));
        assert_eq!(
            f.gate.decide(&f.secondary, &m2, None, true),
            GateDecision::SearchRequest {
                query: "some song".to_string()
            }
        );
    }

    #[test]
    fn test_request_channel_commands_still_gated() {
        let f = fixture();
        let m = msg(1, "!settings locale en");
        assert!(dispatched(&f.gate.decide(&f.primary, &m, None, true)));
        let m2 = msg(2, "!settings locale en");
        assert_eq!(
            f.gate.decide(&f.secondary, &m2, None, true),
            GateDecision::Ignore
        );
    }

    #[test]
    fn test_bots_are_ignored() {
        let f = fixture();
        let mut m = msg(1, "!play x");
        m.author_is_bot = true;
        assert_eq!(
            f.gate.decide(&f.primary, &m, None, false),
            GateDecision::Ignore
        );
    }

    #[test]
    fn test_bare_prefix_is_ignored() {
        let f = fixture();
        assert_eq!(
            f.gate.decide(&f.primary, &msg(1, "!"), None, false),
            GateDecision::Ignore
        );
        assert_eq!(
            f.gate.decide(&f.primary, &msg(2, "!   "), None, false),
            GateDecision::Ignore
        );
    }
}
