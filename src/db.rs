mod migration;

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use rusqlite::Connection;

pub use migration::{AppliedMigration, MIGRATIONS, Migration};

/// Database wrapper providing connection management and schema initialization.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens an in-memory SQLite database.
    ///
    /// Automatically applies all migrations on connection open.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    /// Opens a file-based SQLite database at the given path.
    ///
    /// Creates the database file if it does not exist. File databases run in
    /// WAL mode so a worker process and the CLI can share them.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::initialize(conn)
    }

    fn initialize(mut conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migration::apply_pending_migrations(&mut conn)?;
        Ok(Self { conn })
    }

    /// Lists the migrations recorded in this database.
    pub fn applied_migrations(&self) -> Result<Vec<AppliedMigration>> {
        migration::applied_migrations(&self.conn)
    }

    /// Returns a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
