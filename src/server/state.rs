use crate::application::{
    Accounts, Aggregator, ApiKeyResolver, SelectionRecorder, TierGate, UsageLedger,
};
use crate::infrastructure::{
    ApiKeyCipher, AppConfig, PostgresProviderKeyRepository, PostgresStatsRepository,
    PostgresTurnRepository, PostgresUserRepository, ProviderRegistry,
};
use anyhow::Context;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

pub type AggregatorType = Aggregator<
    PostgresUserRepository,
    PostgresTurnRepository,
    PostgresStatsRepository,
    PostgresProviderKeyRepository,
>;

pub type SelectionRecorderType =
    SelectionRecorder<PostgresTurnRepository, PostgresStatsRepository>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub accounts: Arc<Accounts<PostgresUserRepository>>,
    pub ledger: Arc<UsageLedger<PostgresUserRepository>>,
    pub aggregator: Arc<AggregatorType>,
    pub recorder: Arc<SelectionRecorderType>,
    pub keys: Arc<ApiKeyResolver<PostgresProviderKeyRepository>>,
    pub turns: Arc<PostgresTurnRepository>,
    pub stats: Arc<PostgresStatsRepository>,
}

/// Build full state from config + an existing pool.
///
/// Intended for embedding into a larger service that already manages a
/// `PgPool`.
pub async fn build_state_with_pool(
    config: AppConfig,
    pool: PgPool,
    run_migrations: bool,
) -> anyhow::Result<AppState> {
    if run_migrations {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("run migrations")?;
    }

    let cipher = Arc::new(ApiKeyCipher::new(&config.encryption_key).context("init key cipher")?);
    let registry =
        Arc::new(ProviderRegistry::from_config(&config).context("init provider clients")?);

    let users = Arc::new(PostgresUserRepository::new(pool.clone()));
    let turns = Arc::new(PostgresTurnRepository::new(pool.clone()));
    let stats = Arc::new(PostgresStatsRepository::new(pool.clone()));
    let key_repo = Arc::new(PostgresProviderKeyRepository::new(pool.clone()));

    let shared_keys = ApiKeyResolver::<PostgresProviderKeyRepository>::shared_keys_from_config(&config);
    let keys = Arc::new(ApiKeyResolver::new(key_repo, cipher, shared_keys));

    let accounts = Arc::new(Accounts::new(users.clone()));
    let ledger = Arc::new(UsageLedger::new(users.clone()));
    let gate = Arc::new(TierGate::new(ledger.clone()));
    let recorder = Arc::new(SelectionRecorder::new(turns.clone(), stats.clone()));

    let aggregator = Arc::new(Aggregator::new(
        registry,
        gate,
        ledger.clone(),
        turns.clone(),
        recorder.clone(),
        keys.clone(),
        Duration::from_secs(config.provider_timeout_secs),
    ));

    Ok(AppState {
        pool,
        accounts,
        ledger,
        aggregator,
        recorder,
        keys,
        turns,
        stats,
    })
}

/// Build state for the standalone server.
///
/// Creates the `PgPool`, runs migrations, and wires repositories/services.
pub async fn build_state_from_env(config: AppConfig) -> anyhow::Result<AppState> {
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("connect database")?;
    build_state_with_pool(config, pool, true).await
}
