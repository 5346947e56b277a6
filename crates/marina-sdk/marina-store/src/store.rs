use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

use marina_sdk::store::KeyValueStore;

use crate::error::StoreError;
use crate::models::{EntryRow, NewEntryRow};
use crate::schema::kv_entries;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// SQLite keeps bound parameters per statement well under this.
const MAX_KEYS_PER_QUERY: usize = 500;

/// Escape `%`, `_` and the escape character itself for a `LIKE` prefix match.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// SQLite-backed key-value store for the wallet repository.
///
/// Diesel's `SqliteConnection` needs `&mut` for every operation, so the
/// connection sits behind a mutex to offer the shared `KeyValueStore` API.
pub struct SqliteStore {
    conn: Mutex<SqliteConnection>,
}

impl SqliteStore {
    /// Open (or create) a store at the given file path. Runs migrations automatically.
    pub fn open(path: &str) -> crate::Result<Self> {
        let mut conn = SqliteConnection::establish(path)?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        log::debug!("store: opened {path}");
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store for tests.
    pub fn open_in_memory() -> crate::Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> crate::Result<MutexGuard<'_, SqliteConnection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn get_entries(&self, keys: &[String]) -> crate::Result<HashMap<String, String>> {
        let mut conn = self.conn()?;
        let mut out = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(MAX_KEYS_PER_QUERY) {
            let rows: Vec<EntryRow> = kv_entries::table
                .filter(kv_entries::key.eq_any(chunk))
                .select(EntryRow::as_select())
                .load(&mut *conn)?;
            out.extend(rows.into_iter().map(|r| (r.key, r.value)));
        }
        Ok(out)
    }

    /// Upsert every entry in one transaction.
    pub fn set_entries(&self, entries: &HashMap<String, String>) -> crate::Result<()> {
        let mut conn = self.conn()?;
        conn.transaction::<_, StoreError, _>(|conn| {
            for (key, value) in entries {
                diesel::replace_into(kv_entries::table)
                    .values(&NewEntryRow { key, value })
                    .execute(conn)?;
            }
            Ok(())
        })
    }

    pub fn remove_entries(&self, keys: &[String]) -> crate::Result<()> {
        let mut conn = self.conn()?;
        conn.transaction::<_, StoreError, _>(|conn| {
            for chunk in keys.chunks(MAX_KEYS_PER_QUERY) {
                diesel::delete(kv_entries::table.filter(kv_entries::key.eq_any(chunk)))
                    .execute(conn)?;
            }
            Ok(())
        })
    }

    pub fn clear_entries(&self) -> crate::Result<()> {
        diesel::delete(kv_entries::table).execute(&mut *self.conn()?)?;
        Ok(())
    }

    /// Keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> crate::Result<Vec<String>> {
        Ok(kv_entries::table
            .filter(kv_entries::key.like(like_prefix(prefix)).escape('\\'))
            .select(kv_entries::key)
            .order(kv_entries::key.asc())
            .load(&mut *self.conn()?)?)
    }

    pub fn len(&self) -> crate::Result<i64> {
        Ok(kv_entries::table.count().get_result(&mut *self.conn()?)?)
    }

    pub fn is_empty(&self) -> crate::Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, keys: &[String]) -> Result<HashMap<String, String>, String> {
        self.get_entries(keys).map_err(|e| e.to_string())
    }

    fn set(&self, entries: HashMap<String, String>) -> Result<(), String> {
        self.set_entries(&entries).map_err(|e| e.to_string())
    }

    fn remove(&self, keys: &[String]) -> Result<(), String> {
        self.remove_entries(keys).map_err(|e| e.to_string())
    }

    fn clear(&self) -> Result<(), String> {
        self.clear_entries().map_err(|e| e.to_string())
    }
}
