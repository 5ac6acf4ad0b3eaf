use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::{Arc, RwLock};

/// The narrow per-instance view the coordination logic consumes. Gateway
/// payloads carry far more than this; adapting at the boundary keeps the
/// resolver decoupled from the full cache object shape.
pub trait InstanceState: Send + Sync {
    /// Whether this instance's bot user is a member of the guild.
    fn is_guild_member(&self, guild_id: GuildId) -> bool;

    /// The voice channel this instance's own member is connected to right
    /// now, according to its gateway cache.
    fn current_voice_channel(&self, guild_id: GuildId) -> Option<ChannelId>;

    /// The voice channel bound to this instance's active queue, if any.
    fn queue_voice_channel(&self, guild_id: GuildId) -> Option<ChannelId>;
}

/// One running bot instance. Created at startup, read-only afterwards.
#[derive(Clone)]
pub struct BotInstance {
    pub token_index: usize,
    pub bot_id: UserId,
    pub state: Arc<dyn InstanceState>,
}

impl BotInstance {
    /// Token index 0 is the primary instance by convention.
    pub fn is_primary(&self) -> bool {
        self.token_index == 0
    }
}

impl std::fmt::Debug for BotInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotInstance")
            .field("token_index", &self.token_index)
            .field("bot_id", &self.bot_id)
            .finish()
    }
}

/// Directory of all running instances in this process. Constructed once and
/// passed by reference to every component; queries are valid (and answer
/// from whatever has registered so far) before startup completes.
#[derive(Default)]
pub struct BotRegistry {
    bots: RwLock<Vec<BotInstance>>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an instance. Re-registration with the same token index
    /// overwrites the previous entry.
    pub fn register(&self, instance: BotInstance) {
        let mut bots = self.bots.write().unwrap();
        if let Some(existing) = bots
            .iter_mut()
            .find(|b| b.token_index == instance.token_index)
        {
            *existing = instance;
        } else {
            bots.push(instance);
        }
    }

    /// All known instances, in ascending token-index order.
    pub fn bots(&self) -> Vec<BotInstance> {
        let mut bots = self.bots.read().unwrap().clone();
        bots.sort_by_key(|b| b.token_index);
        bots
    }

    pub fn primary(&self) -> Option<BotInstance> {
        self.by_index(0)
    }

    pub fn by_index(&self, token_index: usize) -> Option<BotInstance> {
        self.bots
            .read()
            .unwrap()
            .iter()
            .find(|b| b.token_index == token_index)
            .cloned()
    }

    pub fn by_id(&self, bot_id: UserId) -> Option<BotInstance> {
        self.bots
            .read()
            .unwrap()
            .iter()
            .find(|b| b.bot_id == bot_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.bots.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.read().unwrap().is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Fixed-value instance state for resolver/gate tests.
    #[derive(Default)]
    pub struct FakeInstanceState {
        pub member_of: Mutex<Vec<GuildId>>,
        pub current_vc: Mutex<Option<ChannelId>>,
        pub queue_vc: Mutex<Option<ChannelId>>,
    }

    impl FakeInstanceState {
        pub fn member(guild_id: GuildId) -> Arc<Self> {
            let state = Self::default();
            state.member_of.lock().unwrap().push(guild_id);
            Arc::new(state)
        }

        pub fn set_current_vc(&self, vc: Option<ChannelId>) {
            *self.current_vc.lock().unwrap() = vc;
        }

        pub fn set_queue_vc(&self, vc: Option<ChannelId>) {
            *self.queue_vc.lock().unwrap() = vc;
        }
    }

    impl InstanceState for FakeInstanceState {
        fn is_guild_member(&self, guild_id: GuildId) -> bool {
            self.member_of.lock().unwrap().contains(&guild_id)
        }

        fn current_voice_channel(&self, _guild_id: GuildId) -> Option<ChannelId> {
            *self.current_vc.lock().unwrap()
        }

        fn queue_voice_channel(&self, _guild_id: GuildId) -> Option<ChannelId> {
            *self.queue_vc.lock().unwrap()
        }
    }

    pub fn instance(token_index: usize, bot_id: u64, state: Arc<FakeInstanceState>) -> BotInstance {
        BotInstance {
            token_index,
            bot_id: UserId::new(bot_id),
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = BotRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.primary().is_none());
        assert!(registry.by_id(UserId::new(42)).is_none());

        let g = GuildId::new(1);
        registry.register(instance(1, 200, FakeInstanceState::member(g)));
        registry.register(instance(0, 100, FakeInstanceState::member(g)));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.primary().unwrap().bot_id, UserId::new(100));
        assert_eq!(registry.by_index(1).unwrap().bot_id, UserId::new(200));
        assert!(registry.by_index(5).is_none());

        // bots() comes back in token-index order regardless of registration order
        let ids: Vec<u64> = registry.bots().iter().map(|b| b.bot_id.get()).collect();
        assert_eq!(ids, vec![100, 200]);
    }

    #[test]
    fn test_reregistration_overwrites() {
        let registry = BotRegistry::new();
        let g = GuildId::new(1);
        registry.register(instance(0, 100, FakeInstanceState::member(g)));
        registry.register(instance(0, 101, FakeInstanceState::member(g)));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.primary().unwrap().bot_id, UserId::new(101));
    }

    #[test]
    fn test_primary_flag() {
        let g = GuildId::new(1);
        assert!(instance(0, 100, FakeInstanceState::member(g)).is_primary());
        assert!(!instance(3, 100, FakeInstanceState::member(g)).is_primary());
    }
}
