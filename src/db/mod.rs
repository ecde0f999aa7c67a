use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Run migrations in order
    let migrations = [
        include_str!("../../migrations/001_create_accounts.sql"),
        include_str!("../../migrations/002_create_contracts.sql"),
        include_str!("../../migrations/003_create_orders.sql"),
        include_str!("../../migrations/004_create_trades.sql"),
        include_str!("../../migrations/005_create_positions.sql"),
    ];

    for migration in migrations {
        sqlx::raw_sql(migration).execute(pool).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}
