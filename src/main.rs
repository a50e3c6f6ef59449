//! chatd - websocket chat backend for a streaming community.

use chatd::auth::Directory;
use chatd::backend::Backend;
use chatd::bans::BanRegistry;
use chatd::combos::Combos;
use chatd::config::Config;
use chatd::db::Database;
use chatd::entities::{
    self, EntityExtractor, ParserContext, TokenSet, DEFAULT_EMOTE_MODIFIERS, DEFAULT_TAGS,
};
use chatd::history::History;
use chatd::hub::Hub;
use chatd::state::ChatState;
use chatd::viewerstate::{self, ViewerStateStore};
use chatd::{http, user::Userid};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let mut config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path)?
    } else {
        warn!(path = %config_path, "no config file, using defaults");
        Config::default()
    };
    if config.auth.jwt_secret.is_empty() {
        warn!("insecurely using default jwt secret");
        config.auth.jwt_secret = "PepoThink".to_string();
    }
    let config = Arc::new(config);

    info!(listen = %config.server.listen, "starting chatd");

    let db = Database::connect(&config.database.path).await?;

    let history = Arc::new(History::new(config.chat.message_cache_size));
    let (hub, hub_task) = Hub::new(history.clone());
    tokio::spawn(hub_task.run());

    let state = Arc::new(ChatState::load(&config.chat.state_file));

    let bans = Arc::new(BanRegistry::new());
    let rows: Vec<(Userid, Option<String>, i64)> = db
        .active_bans()
        .await?
        .into_iter()
        .map(|row| (row.target, row.ip, row.end))
        .collect();
    bans.load_active(&rows);
    info!(count = rows.len(), "active bans loaded");

    let client = reqwest::Client::new();

    let emotes = match entities::load_emote_manifest(&client, &config.upstream.emote_manifest).await
    {
        Ok(emotes) => emotes,
        Err(e) => {
            warn!(error = %e, "could not load emote manifest, starting empty");
            Vec::new()
        }
    };
    let extractor = Arc::new(EntityExtractor::new(ParserContext {
        emotes: TokenSet::new(emotes),
        nicks: TokenSet::new(Vec::<String>::new()),
        tags: TokenSet::new(DEFAULT_TAGS.iter().copied()),
        emote_modifiers: TokenSet::new(DEFAULT_EMOTE_MODIFIERS.iter().copied()),
    }));
    tokio::spawn(entities::run_emote_sync(
        extractor.clone(),
        client.clone(),
        config.upstream.emote_manifest.clone(),
    ));

    let viewers = Arc::new(ViewerStateStore::new());
    tokio::spawn(viewerstate::run_broadcast(viewers.clone(), hub.clone()));
    tokio::spawn(viewerstate::run_sync(
        viewers.clone(),
        client.clone(),
        config.clone(),
    ));

    let directory = Directory::new(client, config.auth.username_api.clone());

    let backend = Arc::new(Backend {
        config: config.clone(),
        hub,
        names: Arc::new(chatd::names::NamesCache::new()),
        state,
        bans,
        db,
        extractor,
        combos: Arc::new(Combos::new()),
        history,
        viewers,
        directory,
    });

    http::serve(backend, config.server.listen).await?;
    Ok(())
}
