use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use poise::serenity_prelude as serenity;
use songbird::serenity::SerenityInit;
use tracing::{error, info};

use polychord::config::Config;
use polychord::db::Database;
use polychord::gate::CommandGate;
use polychord::instance::InstanceContext;
use polychord::queue::advance::{PlaybackDriver, StreamResolver};
use polychord::registry::{BotInstance, BotRegistry};
use polychord::resolver::ResponsibilityResolver;
use polychord::source::YtDlpResolver;
use polychord::voice::notifier::ChannelNotifier;
use polychord::voice::sink::SongbirdSink;
use polychord::{commands, events, queue, recovery, voice, Data};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        instances = config.discord_tokens.len(),
        multi_instance = config.multi_instance_enabled(),
        "starting polychord"
    );

    let db = Database::new(&config)?;
    db.execute_init()?;

    // Shared across every instance in the process
    let registry = Arc::new(BotRegistry::new());
    let resolver = Arc::new(ResponsibilityResolver::new(
        registry.clone(),
        config.multi_instance_enabled(),
    ));
    let gate = Arc::new(CommandGate::new(
        resolver.clone(),
        config.prefixes.clone(),
        config.command_dedup_window,
    ));
    let http_client = reqwest::Client::new();
    let search = Arc::new(YtDlpResolver::new(
        http_client.clone(),
        config.download_dir.clone(),
        config.download_timeout,
        config
            .youtube_cookies
            .iter()
            .map(PathBuf::from)
            .collect(),
    ));

    tokio::spawn(voice::cleanup::start_cleanup_task(
        config.download_dir.clone(),
        3600,
    ));

    let intents = serenity::GatewayIntents::non_privileged()
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::GUILD_VOICE_STATES;

    let mut clients = Vec::new();
    for (token_index, token) in config.discord_tokens.iter().cloned().enumerate() {
        let config = config.clone();
        let db = db.clone();
        let registry = registry.clone();
        let resolver = resolver.clone();
        let gate = gate.clone();
        let http_client = http_client.clone();
        let search = search.clone();

        let framework = poise::Framework::builder()
            .options(poise::FrameworkOptions {
                commands: commands::all(),
                event_handler: |ctx, event, _framework, data| {
                    Box::pin(async move { events::handle_event(ctx, event, data).await })
                },
                ..Default::default()
            })
            .setup(move |ctx, ready, framework| {
                Box::pin(async move {
                    info!(
                        bot = ready.user.id.get(),
                        token_index, "instance is ready"
                    );
                    // Each token is its own application, so every instance
                    // registers its own command set.
                    poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                    ctx.set_activity(Some(serenity::ActivityData::custom(
                        &config.status_message,
                    )));

                    let songbird = songbird::get(ctx)
                        .await
                        .ok_or("Songbird Voice client not initialized")?
                        .clone();
                    let queues = queue::new_queue_manager();
                    let ictx = Arc::new(InstanceContext {
                        token_index,
                        bot_id: ready.user.id,
                        cache: ctx.cache.clone(),
                        http: ctx.http.clone(),
                        songbird,
                        queues: queues.clone(),
                    });
                    registry.register(BotInstance {
                        token_index,
                        bot_id: ready.user.id,
                        state: ictx.clone(),
                    });

                    let sink =
                        SongbirdSink::new(ictx.songbird.clone(), http_client.clone(), queues.clone());
                    let notifier = ChannelNotifier::new(
                        ictx.http.clone(),
                        queues.clone(),
                        config.request_channel_delete_delay,
                    );
                    let driver = Arc::new(PlaybackDriver::new(
                        queues,
                        search.clone() as Arc<dyn StreamResolver>,
                        sink.clone(),
                        notifier,
                        config.idle_teardown,
                        config.connection_ready_timeout,
                    ));
                    sink.attach_driver(&driver);

                    // Give the gateway a moment to fill the guild cache,
                    // then pick the persisted queues back up.
                    {
                        let db = db.clone();
                        let ictx = ictx.clone();
                        let driver = driver.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            recovery::restore_persisted_queues(&db, &ictx, &driver).await;
                        });
                    }

                    Ok(Data {
                        config,
                        db,
                        registry,
                        resolver,
                        gate,
                        ictx,
                        driver,
                        search,
                        http_client,
                    })
                })
            })
            .build();

        let client = serenity::ClientBuilder::new(&token, intents)
            .framework(framework)
            .register_songbird()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create client {}: {}", token_index, e))?;
        clients.push((token_index, client));
    }

    let mut handles = Vec::new();
    for (token_index, mut client) in clients {
        handles.push(tokio::spawn(async move {
            info!(token_index, "starting client");
            if let Err(why) = client.start().await {
                error!(token_index, "Client error: {:?}", why);
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}
