//! The key store: durable, per-record-atomic persistence for identities,
//! prekeys and session states, over SQLite via sqlx.
//!
//! WAL journal mode and `synchronous=FULL` are configured at connection
//! time — NOT inside a migration, because SQLite forbids changing the
//! journal mode inside a transaction and sqlx wraps every migration in one.
//! FULL synchronous means a write that returned has hit the disk: a crash
//! between two writes leaves each either wholly present or wholly absent.

use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};

use mur_crypto::{
    identity::IdentityKeyPair,
    prekey::{OneTimePrekey, SignedPrekey},
    session::{SessionId, SessionRecord},
};

use crate::{error::StoreError, vault::Vault};

const CANARY_KEY: &str = "store_check";
const CANARY_VALUE: &[u8] = b"murmur-store-check";

/// Central store handle. Cheap to clone (the pool is an Arc internally);
/// safe for concurrent use — SQLite serialises writers, and operations on
/// distinct keys do not contend in the schema.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    vault: Vault,
}

impl Store {
    /// Open (or create) the store at `db_path`. Supplying a password turns
    /// on at-rest encryption for every record; a wrong password on an
    /// existing store fails here with [`StoreError::AuthFail`].
    pub async fn open(db_path: &Path, password: Option<&str>) -> Result<Self, StoreError> {
        let vault = match password {
            Some(p) => Vault::from_password(p.as_bytes()),
            None => Vault::plaintext(),
        };

        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        let store = Self { pool, vault };
        store.check_canary().await?;

        tracing::debug!(
            target: "mur_store",
            event = "store_open",
            encrypted = store.vault.is_keyed(),
        );
        Ok(store)
    }

    /// Verify (or establish) the sealed canary that makes a wrong password
    /// fail at open time instead of on the first record read.
    async fn check_canary(&self) -> Result<(), StoreError> {
        let existing: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
                .bind(CANARY_KEY)
                .fetch_optional(&self.pool)
                .await?;

        match existing {
            Some(blob) => {
                let value = self.vault.unwrap(&blob)?;
                if &*value != CANARY_VALUE {
                    return Err(StoreError::AuthFail);
                }
                Ok(())
            }
            None => self.write_canary().await,
        }
    }

    async fn write_canary(&self) -> Result<(), StoreError> {
        let blob = self.vault.wrap(CANARY_VALUE)?;
        sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)")
            .bind(CANARY_KEY)
            .bind(blob)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Identity keys ────────────────────────────────────────────────────

    pub async fn put_identity(
        &self,
        user_id: &str,
        identity: &IdentityKeyPair,
    ) -> Result<(), StoreError> {
        let blob = self.vault.wrap(identity.secret_bytes())?;
        sqlx::query(
            "INSERT OR REPLACE INTO identities (user_id, record, created_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(blob)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_identity(&self, user_id: &str) -> Result<Option<IdentityKeyPair>, StoreError> {
        let blob: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT record FROM identities WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        match blob {
            None => Ok(None),
            Some(blob) => {
                let secret = self.vault.unwrap(&blob)?;
                let identity = IdentityKeyPair::from_bytes(&secret)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Some(identity))
            }
        }
    }

    // ── Signed prekeys ───────────────────────────────────────────────────

    pub async fn put_signed_prekey(
        &self,
        user_id: &str,
        prekey: &SignedPrekey,
    ) -> Result<(), StoreError> {
        let blob = self.wrap_record(prekey)?;
        sqlx::query(
            "INSERT OR REPLACE INTO signed_prekeys (user_id, key_id, record, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(prekey.key_id as i64)
        .bind(blob)
        .bind(prekey.created_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The active signed prekey: the one with the highest `key_id`.
    pub async fn get_signed_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<SignedPrekey>, StoreError> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT record FROM signed_prekeys WHERE user_id = ? ORDER BY key_id DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        blob.map(|b| self.unwrap_record(&b)).transpose()
    }

    /// A specific signed prekey — needed to answer sessions initiated
    /// against a since-rotated bundle.
    pub async fn get_signed_prekey_by_id(
        &self,
        user_id: &str,
        key_id: u32,
    ) -> Result<Option<SignedPrekey>, StoreError> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT record FROM signed_prekeys WHERE user_id = ? AND key_id = ?",
        )
        .bind(user_id)
        .bind(key_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        blob.map(|b| self.unwrap_record(&b)).transpose()
    }

    pub async fn next_signed_prekey_id(&self, user_id: &str) -> Result<u32, StoreError> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(key_id) FROM signed_prekeys WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(0) as u32 + 1)
    }

    // ── One-time prekeys ─────────────────────────────────────────────────

    pub async fn push_one_time_prekey(
        &self,
        user_id: &str,
        prekey: &OneTimePrekey,
    ) -> Result<(), StoreError> {
        let blob = self.wrap_record(prekey)?;
        sqlx::query(
            "INSERT OR REPLACE INTO one_time_prekeys (user_id, key_id, record) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(prekey.key_id as i64)
        .bind(blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Destructively pop the lowest-id one-time prekey. The read and delete
    /// share one transaction, so no sequence of pops can yield a key twice;
    /// a pop that loses its row to a concurrent claim moves on to the next.
    pub async fn pop_one_time_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<OneTimePrekey>, StoreError> {
        loop {
            let mut tx = self.pool.begin().await?;
            let row: Option<(i64, Vec<u8>)> = sqlx::query_as(
                "SELECT key_id, record FROM one_time_prekeys WHERE user_id = ? \
                 ORDER BY key_id ASC LIMIT 1",
            )
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((key_id, blob)) = row else {
                return Ok(None);
            };
            let deleted =
                sqlx::query("DELETE FROM one_time_prekeys WHERE user_id = ? AND key_id = ?")
                    .bind(user_id)
                    .bind(key_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            tx.commit().await?;

            if deleted > 0 {
                return self.unwrap_record(&blob).map(Some);
            }
        }
    }

    /// Atomically claim a specific one-time prekey: read and delete in one
    /// transaction, with the delete's row count as the claim token. Of any
    /// number of concurrent claims for the same id, exactly one receives
    /// the record; the rest observe `None`.
    pub async fn claim_one_time_prekey(
        &self,
        user_id: &str,
        key_id: u32,
    ) -> Result<Option<OneTimePrekey>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT record FROM one_time_prekeys WHERE user_id = ? AND key_id = ?",
        )
        .bind(user_id)
        .bind(key_id as i64)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(blob) = blob else {
            return Ok(None);
        };
        let deleted =
            sqlx::query("DELETE FROM one_time_prekeys WHERE user_id = ? AND key_id = ?")
                .bind(user_id)
                .bind(key_id as i64)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        tx.commit().await?;

        if deleted == 0 {
            return Ok(None);
        }
        self.unwrap_record(&blob).map(Some)
    }

    /// Non-destructive view of the next pop candidate — what a published
    /// bundle advertises without recording consumption.
    pub async fn peek_one_time_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<OneTimePrekey>, StoreError> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT record FROM one_time_prekeys WHERE user_id = ? ORDER BY key_id ASC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        blob.map(|b| self.unwrap_record(&b)).transpose()
    }

    pub async fn get_one_time_prekey(
        &self,
        user_id: &str,
        key_id: u32,
    ) -> Result<Option<OneTimePrekey>, StoreError> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT record FROM one_time_prekeys WHERE user_id = ? AND key_id = ?",
        )
        .bind(user_id)
        .bind(key_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        blob.map(|b| self.unwrap_record(&b)).transpose()
    }

    pub async fn delete_one_time_prekey(
        &self,
        user_id: &str,
        key_id: u32,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM one_time_prekeys WHERE user_id = ? AND key_id = ?")
            .bind(user_id)
            .bind(key_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_one_time_prekeys(&self, user_id: &str) -> Result<u32, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM one_time_prekeys WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u32)
    }

    pub async fn next_one_time_prekey_id(&self, user_id: &str) -> Result<u32, StoreError> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(key_id) FROM one_time_prekeys WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(0) as u32 + 1)
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    pub async fn put_session(
        &self,
        session_id: &SessionId,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        let bytes = record
            .to_bytes()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let blob = self.vault.wrap(&bytes)?;
        sqlx::query(
            "INSERT OR REPLACE INTO sessions (id, peer_user_id, record, updated_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(session_id.as_str())
        .bind(&record.state.peer_user_id)
        .bind(blob)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let blob: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT record FROM sessions WHERE id = ?")
                .bind(session_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        match blob {
            None => Ok(None),
            Some(blob) => {
                let bytes = self.vault.unwrap(&blob)?;
                let record = SessionRecord::from_bytes(&bytes)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Some(record))
            }
        }
    }

    pub async fn delete_session(&self, session_id: &SessionId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_session_ids(&self) -> Result<Vec<SessionId>, StoreError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT id, peer_user_id FROM sessions ORDER BY updated_at ASC")
                .fetch_all(&self.pool)
                .await?;
        // The stored id IS the canonical id; re-derive nothing.
        Ok(rows
            .into_iter()
            .map(|(id, _)| SessionId::from_hex_unchecked(id))
            .collect())
    }

    // ── Wipe ─────────────────────────────────────────────────────────────

    /// Destroy every record. Irreversible.
    pub async fn wipe_all(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in ["identities", "signed_prekeys", "one_time_prekeys", "sessions", "meta"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.write_canary().await?;
        tracing::warn!(target: "mur_store", event = "store_wiped");
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn wrap_record<T: serde::Serialize>(&self, record: &T) -> Result<Vec<u8>, StoreError> {
        let bytes =
            bincode::serialize(record).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.vault.wrap(&bytes)
    }

    fn unwrap_record<T: serde::de::DeserializeOwned>(
        &self,
        blob: &[u8],
    ) -> Result<T, StoreError> {
        let bytes = self.vault.unwrap(blob)?;
        bincode::deserialize(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}
