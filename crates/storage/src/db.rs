use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    apply_pragmas(&pool).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

/// Private in-memory database. Kept on one connection that never
/// expires, since each `:memory:` connection sees its own empty database.
pub async fn create_memory_db() -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    apply_pragmas(&pool).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

async fn apply_pragmas(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(pool)
        .await?;
    sqlx::query("PRAGMA cache_size = -32000")
        .execute(pool)
        .await?;
    Ok(())
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reconciliation_sessions (
            user_id INTEGER NOT NULL,
            session_id TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (user_id, session_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS staged_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            session_id TEXT NOT NULL,
            source TEXT NOT NULL,
            date TEXT,
            amount_cents INTEGER,
            description TEXT NOT NULL,
            merchant TEXT,
            category TEXT,
            profile_type TEXT,
            notes TEXT,
            confidence REAL NOT NULL DEFAULT 0,
            committed_as INTEGER REFERENCES transactions(id),
            FOREIGN KEY (user_id, session_id)
                REFERENCES reconciliation_sessions(user_id, session_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_staged_session ON staged_transactions(user_id, session_id, source)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            description TEXT NOT NULL,
            merchant TEXT,
            merchant_key TEXT NOT NULL,
            category TEXT,
            profile_type TEXT,
            notes TEXT,
            confidence REAL NOT NULL DEFAULT 0,
            is_recurring INTEGER NOT NULL DEFAULT 0,
            provenance_key TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_transactions_merchant ON transactions(user_id, merchant_key, date)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS merchant_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            merchant_name TEXT NOT NULL,
            name_key TEXT NOT NULL,
            merchant_key TEXT NOT NULL,
            merchant_pattern TEXT,
            suggested_category TEXT,
            profile_type TEXT,
            priority INTEGER NOT NULL DEFAULT 50,
            applied_count INTEGER NOT NULL DEFAULT 0,
            last_applied TEXT,
            auto_apply INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (user_id, name_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_rules_merchant ON merchant_rules(user_id, merchant_key)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recurring_patterns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            merchant_name TEXT NOT NULL,
            merchant_key TEXT NOT NULL,
            category TEXT,
            profile_type TEXT,
            average_amount_cents INTEGER NOT NULL,
            frequency TEXT NOT NULL,
            detected_from INTEGER NOT NULL,
            last_occurrence TEXT NOT NULL,
            next_expected TEXT NOT NULL,
            confidence REAL NOT NULL,
            UNIQUE (user_id, merchant_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_corrections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            transaction_id INTEGER,
            correction_type TEXT NOT NULL,
            original_value TEXT,
            corrected_value TEXT NOT NULL,
            merchant_name TEXT,
            merchant_key TEXT,
            applied_as_rule INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_corrections_merchant ON user_corrections(user_id, correction_type, merchant_key)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn table_names(pool: &DbPool) -> Vec<String> {
        sqlx::query_as::<_, (String,)>(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(pool)
        .await
        .unwrap()
        .into_iter()
        .map(|(name,)| name)
        .collect()
    }

    #[tokio::test]
    async fn memory_db_has_schema() {
        let pool = create_memory_db().await.unwrap();
        assert_eq!(
            table_names(&pool).await,
            vec![
                "merchant_rules",
                "reconciliation_sessions",
                "recurring_patterns",
                "staged_transactions",
                "transactions",
                "user_corrections",
            ]
        );
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.db");
        let pool = create_db(&path).await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool.close().await;

        let reopened = create_db(&path).await.unwrap();
        assert_eq!(table_names(&reopened).await.len(), 6);
    }
}
