pub mod commands;
pub mod config;
pub mod db;
pub mod events;
pub mod gate;
pub mod instance;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod request_channel;
pub mod resolver;
pub mod source;
pub mod voice;

use std::sync::Arc;

/// Custom data passed to all commands. One `Data` per client; the registry,
/// resolver, gate, and database are shared across every instance in the
/// process, the rest is instance-local.
pub struct Data {
    pub config: config::Config,
    pub db: db::Database,
    pub registry: Arc<registry::BotRegistry>,
    pub resolver: Arc<resolver::ResponsibilityResolver>,
    pub gate: Arc<gate::CommandGate>,
    pub ictx: Arc<instance::InstanceContext>,
    pub driver: Arc<queue::advance::PlaybackDriver>,
    pub search: Arc<source::YtDlpResolver>,
    pub http_client: reqwest::Client,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
