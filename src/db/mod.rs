use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;

use self::models::{KvState, Partner, PartnerId, SyncUpdate};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("partner not found: {0}")]
    PartnerNotFound(String),

    #[error("{0}")]
    Config(String),
}

pub mod models;
pub mod schema;

#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_partners: i64,
    pub partners_with_contact: i64,
    pub partners_by_status: Vec<StatusCount>,
}

const SCHEMA_VERSION_KEY: &str = "schema_version";
const SCHEMA_VERSION: u32 = 1;

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates the partner and key/value tables and stamps the schema version.
    /// A database written by a newer psync is refused rather than downgraded.
    fn initialize(&self) -> Result<(), DbError> {
        schema::create_schema(&self.conn)?;

        let stored = self.schema_version()?;
        if let Some(version) = stored.filter(|version| *version > SCHEMA_VERSION) {
            return Err(DbError::Config(format!(
                "partner database schema v{version} is newer than supported v{SCHEMA_VERSION}"
            )));
        }
        if stored != Some(SCHEMA_VERSION) {
            self.set_state(SCHEMA_VERSION_KEY, &SCHEMA_VERSION.to_string())?;
        }
        Ok(())
    }

    fn schema_version(&self) -> Result<Option<u32>, DbError> {
        let Some(raw) = self.get_state(SCHEMA_VERSION_KEY)?.and_then(|state| state.value) else {
            return Ok(None);
        };
        raw.parse::<u32>()
            .map(Some)
            .map_err(|_| DbError::Config(format!("invalid schema version in partner database: {raw}")))
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".psync").join("psync.db"))
    }

    pub fn upsert_partner(&self, partner: &Partner) -> Result<(), DbError> {
        let emails = serde_json::to_string(&partner.emails)?;

        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO partners (
                id, name, contact_email, status, last_update_note, updated_at, emails
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                partner.id.to_string(),
                partner.name,
                partner.contact_email,
                partner.status.as_str(),
                partner.last_update_note,
                partner.updated_at.map(|value| value.to_rfc3339()),
                emails,
            ],
        )?;

        Ok(())
    }

    pub fn get_partner(&self, id: &str) -> Result<Option<Partner>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, name, contact_email, status, last_update_note, updated_at, emails
            FROM partners
            WHERE id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Partner::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_partners(&self) -> Result<Vec<Partner>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, name, contact_email, status, last_update_note, updated_at, emails
            FROM partners
            ORDER BY name COLLATE NOCASE ASC, id ASC
            "#,
        )?;

        let partners = stmt
            .query_map([], Partner::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(partners)
    }

    pub fn remove_partner(&self, id: &str) -> Result<usize, DbError> {
        let deleted = self
            .conn
            .execute("DELETE FROM partners WHERE id = ?", [id])?;
        Ok(deleted)
    }

    /// Overwrites only the sync-owned fields of an existing partner.
    pub fn update_partner_sync(&self, id: &PartnerId, update: &SyncUpdate) -> Result<(), DbError> {
        let emails = serde_json::to_string(&update.emails)?;
        let key = id.to_string();

        let changed = self.conn.execute(
            r#"
            UPDATE partners
            SET status = COALESCE(?, status), last_update_note = ?, updated_at = ?, emails = ?
            WHERE id = ?
            "#,
            params![
                update.status.map(|status| status.as_str()),
                update.last_update_note,
                update.updated_at.to_rfc3339(),
                emails,
                key,
            ],
        )?;

        if changed == 0 {
            return Err(DbError::PartnerNotFound(key));
        }
        Ok(())
    }

    pub fn get_state(&self, key: &str) -> Result<Option<KvState>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value, updated_at FROM kv_state WHERE key = ? LIMIT 1")?;
        let mut rows = stmt.query([key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(KvState::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO kv_state (key, value, updated_at)
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    pub fn clear_state(&self, key: &str) -> Result<(), DbError> {
        self.conn
            .execute("DELETE FROM kv_state WHERE key = ?", [key])?;
        Ok(())
    }

    pub fn get_stats(&self) -> Result<DatabaseStats, DbError> {
        let total_partners: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM partners", [], |row| row.get(0))?;
        let partners_with_contact: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM partners WHERE TRIM(COALESCE(contact_email, '')) <> ''",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) AS count FROM partners GROUP BY status ORDER BY count DESC, status ASC",
        )?;
        let partners_by_status = stmt
            .query_map([], |row| {
                Ok(StatusCount {
                    status: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(DatabaseStats {
            total_partners,
            partners_with_contact,
            partners_by_status,
        })
    }
}

/// Write-back target of the sync pipeline.
pub trait PartnerStore: Send + Sync {
    fn apply_sync_update(&self, partner_id: &PartnerId, update: &SyncUpdate)
        -> Result<(), DbError>;
}

/// A [`Database`] shared between request handlers and CLI commands.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&Database) -> Result<R, DbError>) -> Result<R, DbError> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| DbError::Config("database lock poisoned".to_string()))?;
        f(&guard)
    }
}

impl PartnerStore for SharedDatabase {
    fn apply_sync_update(
        &self,
        partner_id: &PartnerId,
        update: &SyncUpdate,
    ) -> Result<(), DbError> {
        self.with(|db| db.update_partner_sync(partner_id, update))
    }
}
