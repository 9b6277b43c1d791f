use std::{sync::Arc, time::Duration};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;
use crate::{
    accrual::{AccrualClient, AccrualOracle},
    api::{auth::AuthKeys, handler::AppState},
    config::Config,
    error::AppResult,
    ledger::{LedgerRepository, LedgerStore},
    reconcile::{NewOrderNotifier, NewOrderReceiver, ReconcileDispatcher, ReconcileSettings},
};

/// Everything `main` needs to serve requests and run reconciliation
pub struct AppComponents {
    pub state: AppState,
    pub dispatcher: ReconcileDispatcher,
    pub new_orders: NewOrderReceiver,
}

pub async fn initialize_app_state(config: &Config) -> AppResult<AppComponents> {
    info!("Initializing application components ...");

    // Database pool
    let pool = initialize_database(config).await?;

    let ledger: Arc<dyn LedgerStore> = Arc::new(LedgerRepository::new(pool));
    info!("✅ Ledger repository initialized");

    let oracle: Arc<dyn AccrualOracle> = Arc::new(AccrualClient::new(
        &config.accrual_address,
        config.oracle_timeout(),
    )?);
    info!("✅ Accrual client initialized for: {}", config.accrual_address);

    let (notifier, new_orders) = NewOrderNotifier::channel();

    let settings = ReconcileSettings {
        poll_interval: config.poll_interval(),
        retry_backoff: config.retry_backoff(),
    };
    let dispatcher = ReconcileDispatcher::new(ledger.clone(), oracle, settings);
    info!(
        "✅ Reconciliation dispatcher ready (poll {:?}, backoff {:?})",
        settings.poll_interval, settings.retry_backoff
    );

    let auth = AuthKeys::new(&config.token_secret, config.token_ttl(), config.password_iterations)?;
    info!("✅ Session keys ready (token ttl {:?})", config.token_ttl());

    let state = AppState {
        ledger,
        notifier,
        auth,
    };

    Ok(AppComponents {
        state,
        dispatcher,
        new_orders,
    })
}

async fn initialize_database(config: &Config) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", config.db_max_connections);

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
