use std::sync::{Arc, Mutex};
use std::time::Duration;

use polychord::gate::{CommandGate, GateDecision, InboundMessage};
use polychord::registry::{BotInstance, BotRegistry, InstanceState};
use polychord::resolver::ResponsibilityResolver;
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};

const G: GuildId = GuildId::new(1000);

/// Scriptable stand-in for one instance's gateway view.
#[derive(Default)]
struct ScriptedState {
    member: Mutex<bool>,
    current_vc: Mutex<Option<ChannelId>>,
    queue_vc: Mutex<Option<ChannelId>>,
}

impl ScriptedState {
    fn in_guild() -> Arc<Self> {
        let state = Self::default();
        *state.member.lock().unwrap() = true;
        Arc::new(state)
    }
}

impl InstanceState for ScriptedState {
    fn is_guild_member(&self, _guild_id: GuildId) -> bool {
        *self.member.lock().unwrap()
    }

    fn current_voice_channel(&self, _guild_id: GuildId) -> Option<ChannelId> {
        *self.current_vc.lock().unwrap()
    }

    fn queue_voice_channel(&self, _guild_id: GuildId) -> Option<ChannelId> {
        *self.queue_vc.lock().unwrap()
    }
}

struct Cluster {
    registry: Arc<BotRegistry>,
    resolver: Arc<ResponsibilityResolver>,
    gate: CommandGate,
    states: Vec<Arc<ScriptedState>>,
}

/// Two registered instances, both members of the guild, both idle.
fn two_instance_cluster() -> Cluster {
    let registry = Arc::new(BotRegistry::new());
    let states = vec![ScriptedState::in_guild(), ScriptedState::in_guild()];
    for (i, state) in states.iter().enumerate() {
        registry.register(BotInstance {
            token_index: i,
            bot_id: UserId::new(100 + i as u64),
            state: state.clone(),
        });
    }
    let resolver = Arc::new(ResponsibilityResolver::new(registry.clone(), true));
    let gate = CommandGate::new(resolver.clone(), vec!["!".into()], Duration::from_secs(5));
    Cluster {
        registry,
        resolver,
        gate,
        states,
    }
}

fn message(id: u64, content: &str, user_vc: Option<ChannelId>) -> InboundMessage {
    InboundMessage {
        message_id: MessageId::new(id),
        guild_id: G,
        channel_id: ChannelId::new(77),
        author_id: UserId::new(55),
        author_is_bot: false,
        content: content.to_string(),
        user_voice_channel: user_vc,
    }
}

#[test]
fn fresh_channel_goes_to_primary() {
    // Both instances idle, a user joins vc1. The primary owns the channel.
    let cluster = two_instance_cluster();
    let owner = cluster
        .resolver
        .bot_for_voice_channel(G, ChannelId::new(1))
        .unwrap();
    assert_eq!(owner.bot_id, UserId::new(100));
}

#[test]
fn busy_primary_hands_second_channel_to_secondary() {
    // Primary has an active queue on vc1. A user in vc2 asks for music:
    // the primary declines and the free secondary accepts.
    let cluster = two_instance_cluster();
    *cluster.states[0].queue_vc.lock().unwrap() = Some(ChannelId::new(1));
    *cluster.states[0].current_vc.lock().unwrap() = Some(ChannelId::new(1));

    let primary = cluster.registry.by_index(0).unwrap();
    let secondary = cluster.registry.by_index(1).unwrap();
    let vc2 = Some(ChannelId::new(2));

    assert!(!cluster.resolver.should_respond_to_music(&primary, G, vc2));
    assert!(cluster.resolver.should_respond_to_music(&secondary, G, vc2));

    // The designated owner for vc2 matches.
    let owner = cluster
        .resolver
        .bot_for_voice_channel(G, ChannelId::new(2))
        .unwrap();
    assert_eq!(owner.bot_id, secondary.bot_id);
    // The answer holds once its queue actually binds the channel.
    *cluster.states[1].queue_vc.lock().unwrap() = Some(ChannelId::new(2));
    assert!(cluster.resolver.should_respond_to_music(&secondary, G, vc2));
}

#[test]
fn all_instances_busy_drops_the_request() {
    // Both instances bound elsewhere: a third channel has no owner, so the
    // request is dropped rather than interrupting someone's playback.
    let cluster = two_instance_cluster();
    *cluster.states[0].queue_vc.lock().unwrap() = Some(ChannelId::new(1));
    *cluster.states[1].queue_vc.lock().unwrap() = Some(ChannelId::new(2));

    assert!(cluster
        .resolver
        .bot_for_voice_channel(G, ChannelId::new(3))
        .is_none());

    // Nobody answers the music command either.
    let vc3 = Some(ChannelId::new(3));
    for index in [0, 1] {
        let bot = cluster.registry.by_index(index).unwrap();
        assert!(!cluster.resolver.should_respond_to_music(&bot, G, vc3));
    }
}

#[test]
fn queue_binding_outranks_presence_everywhere() {
    // Secondary's queue is bound to vc1 while the primary's member is
    // sitting in it. The binding wins for commands and voice flows alike.
    let cluster = two_instance_cluster();
    *cluster.states[1].queue_vc.lock().unwrap() = Some(ChannelId::new(1));
    *cluster.states[0].current_vc.lock().unwrap() = Some(ChannelId::new(1));

    let owner = cluster
        .resolver
        .bot_for_voice_channel(G, ChannelId::new(1))
        .unwrap();
    assert_eq!(owner.bot_id, UserId::new(101));

    let primary = cluster.registry.by_index(0).unwrap();
    let secondary = cluster.registry.by_index(1).unwrap();
    assert!(cluster
        .resolver
        .should_respond_to_voice(&secondary, G, ChannelId::new(1)));
    assert!(!cluster
        .resolver
        .should_respond_to_voice(&primary, G, ChannelId::new(1)));
}

#[test]
fn gate_routes_one_message_to_one_instance() {
    // The same gateway message observed for both instances: the music gate
    // sends it to the channel owner only, and a second delivery for the
    // same instance is deduplicated.
    let cluster = two_instance_cluster();
    *cluster.states[1].queue_vc.lock().unwrap() = Some(ChannelId::new(2));

    let primary = cluster.registry.by_index(0).unwrap();
    let secondary = cluster.registry.by_index(1).unwrap();
    let msg = message(1, "!play some song", Some(ChannelId::new(2)));

    assert_eq!(
        cluster.gate.decide(&primary, &msg, None, false),
        GateDecision::Ignore
    );
    assert!(matches!(
        cluster.gate.decide(&secondary, &msg, None, false),
        GateDecision::Dispatch { .. }
    ));
    // Redelivery of the same message to the same instance is a no-op.
    assert_eq!(
        cluster.gate.decide(&secondary, &msg, None, false),
        GateDecision::Ignore
    );
}

#[test]
fn non_music_commands_follow_default_responsibility() {
    // Settings changes go to the primary even when it is busy playing,
    // because they carry no voice-channel context.
    let cluster = two_instance_cluster();
    *cluster.states[0].queue_vc.lock().unwrap() = Some(ChannelId::new(1));

    let primary = cluster.registry.by_index(0).unwrap();
    let secondary = cluster.registry.by_index(1).unwrap();

    assert!(matches!(
        cluster
            .gate
            .decide(&primary, &message(1, "!settings prefix ?", None), None, false),
        GateDecision::Dispatch { .. }
    ));
    assert_eq!(
        cluster
            .gate
            .decide(&secondary, &message(2, "!settings prefix ?", None), None, false),
        GateDecision::Ignore
    );
}

#[test]
fn late_registration_is_safe() {
    // Queries before any instance registers return empty answers instead
    // of blocking or panicking.
    let registry = Arc::new(BotRegistry::new());
    let resolver = ResponsibilityResolver::new(registry.clone(), true);
    assert!(resolver
        .bot_for_voice_channel(G, ChannelId::new(1))
        .is_none());

    // Registering an instance makes it visible immediately.
    let state = ScriptedState::in_guild();
    registry.register(BotInstance {
        token_index: 0,
        bot_id: UserId::new(100),
        state,
    });
    assert!(resolver
        .bot_for_voice_channel(G, ChannelId::new(1))
        .is_some());
}
