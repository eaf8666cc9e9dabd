use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;

/// Individual migration with version metadata.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

/// A migration as recorded in `schema_migrations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub version: u32,
    pub description: String,
    pub applied_at: i64,
}

impl Migration {
    /// Creates a new migration.
    pub const fn new(version: u32, description: &'static str, up: &'static str) -> Self {
        Self {
            version,
            description,
            up,
        }
    }

    /// Checks if this migration has been applied to the database.
    pub fn is_applied(&self, conn: &rusqlite::Connection) -> anyhow::Result<bool> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
            [self.version],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Applies this migration and records it in one transaction.
    pub fn apply(&self, conn: &mut rusqlite::Connection) -> anyhow::Result<()> {
        let tx = conn.transaction()?;

        tx.execute_batch(self.up)?;

        let applied_at = OffsetDateTime::now_utc().unix_timestamp();
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?1, ?2, ?3)",
            rusqlite::params![self.version, applied_at, self.description],
        )?;

        tx.commit()?;
        Ok(())
    }
}

/// Registry of all migrations in version order.
pub const MIGRATIONS: &[Migration] = &[
    Migration::new(
        1,
        "Initial schema: songs, analyses, comments, analysis_view_logs",
        include_str!("migrations/001_initial_schema.sql"),
    ),
    Migration::new(
        2,
        "Add reanalysis_tasks outbox for threshold-triggered reanalysis",
        include_str!("migrations/002_reanalysis_tasks.sql"),
    ),
];

/// Applies all pending migrations in version order.
pub fn apply_pending_migrations(conn: &mut rusqlite::Connection) -> anyhow::Result<()> {
    ensure_migration_table_exists(conn)?;

    for migration in MIGRATIONS {
        if !migration.is_applied(conn)? {
            migration.apply(conn)?;
            info!(
                version = migration.version,
                "Applied migration: {}", migration.description
            );
        }
    }

    Ok(())
}

/// Lists migrations recorded in the database, oldest first.
pub fn applied_migrations(conn: &rusqlite::Connection) -> anyhow::Result<Vec<AppliedMigration>> {
    let mut stmt = conn.prepare(
        "SELECT version, COALESCE(description, ''), applied_at
         FROM schema_migrations ORDER BY version",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(AppliedMigration {
            version: row.get(0)?,
            description: row.get(1)?,
            applied_at: row.get(2)?,
        })
    })?;

    let mut applied = Vec::new();
    for row in rows {
        applied.push(row?);
    }
    Ok(applied)
}

fn ensure_migration_table_exists(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        );
        "#,
    )?;
    Ok(())
}
