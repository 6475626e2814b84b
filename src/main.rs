use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use newsdesk::auth::AuthKeys;
use newsdesk::config::Config;
use newsdesk::db::{Database, OwnerScope, SourceSpec};
use newsdesk::fetcher::FetchStrategy;
use newsdesk::registry::SubscriptionRegistry;
use newsdesk::routes::{self, AppState};
use newsdesk::sync::{start_background_sync, SyncOrchestrator, SyncSettings};
use newsdesk::translate::{translator_from_config, TranslationService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "newsdesk=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path =
        std::env::var("NEWSDESK_CONFIG").unwrap_or_else(|_| "newsdesk.toml".to_string());
    let config = Config::load(&config_path)?;
    info!(
        "Loaded {} seed sources and {} relays from {}",
        config.sources.len(),
        config.sync.relays.len(),
        config_path
    );

    let jwt_secret = std::env::var("NEWSDESK_JWT_SECRET")
        .unwrap_or_else(|_| config.auth.jwt_secret.clone());
    if jwt_secret.trim().is_empty() {
        anyhow::bail!("No JWT secret configured; set [auth].jwt_secret or NEWSDESK_JWT_SECRET");
    }

    // Initialize database
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:newsdesk.db?mode=rwc".to_string());
    let db = Database::new(&database_url).await?;
    db.initialize().await?;
    let db = Arc::new(db);

    let seeds = config.sources.iter().map(SourceSpec::from).collect();
    let registry = Arc::new(SubscriptionRegistry::new(db.clone(), seeds));
    registry.seed(&OwnerScope::Shared).await?;
    info!("Database initialized");

    let fetcher = Arc::new(FetchStrategy::from_config(&config.sync)?);
    let orchestrator = Arc::new(SyncOrchestrator::new(
        db.clone(),
        registry.clone(),
        fetcher,
        SyncSettings::from(&config.sync),
    ));

    let translator = translator_from_config(
        &config.translation,
        std::env::var("TRANSLATION_API_KEY").ok(),
    )?;
    let translations = Arc::new(TranslationService::new(db.clone(), translator));

    // Start background sync task
    let bg_orchestrator = orchestrator.clone();
    let refresh_interval = config.refresh_interval;
    tokio::spawn(async move {
        start_background_sync(bg_orchestrator, refresh_interval).await;
    });

    // Create app state
    let state = Arc::new(AppState {
        db,
        registry,
        orchestrator,
        translations,
        auth: Arc::new(AuthKeys::new(&jwt_secret)),
        seed_new_users: config.seed_new_users,
    });

    let app = routes::router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("Server starting on http://{}", config.listen);

    axum::serve(listener, app).await?;

    Ok(())
}
