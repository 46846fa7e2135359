//! Persistence edge: the refresh gate's key-value mark and the boat upsert
//! sink, each with a Postgres and an in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use boatwatch_core::BoatRow;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub const CONFLICT_KEY: &str = "boat_id";

/// Columns rewritten when a `boat_id` already exists.
pub const UPDATE_COLUMNS: [&str; 9] = [
    "name",
    "latitude",
    "longitude",
    "speed",
    "heading",
    "datetime",
    "contact",
    "atolls",
    "type",
];

/// Postgres caps a statement at 65535 binds; ten binds per row.
const UPSERT_CHUNK_ROWS: usize = 1_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Rejected(String),
}

#[async_trait]
pub trait GateStore: Send + Sync {
    /// Atomically stores `now` under `key` if the existing mark is expired or
    /// at least `cooldown_secs` old. Returns whether the mark was written.
    async fn put_if_cooled(
        &self,
        key: &str,
        now: i64,
        cooldown_secs: i64,
        ttl_secs: i64,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait UpsertSink: Send + Sync {
    /// Inserts rows whose `boat_id` is new and updates [`UPDATE_COLUMNS`] for
    /// the rest. The batch is applied atomically; returns rows written.
    async fn upsert_batch(&self, rows: &[BoatRow]) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait BoatSnapshotSource: Send + Sync {
    async fn list_boats(&self) -> Result<Vec<BoatRow>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Overwrites the stored type of every listed boat that exists.
    pub async fn apply_type_labels(&self, labels: &[(String, String)]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0u64;
        for (boat_id, boat_type) in labels {
            let result = sqlx::query(
                r#"
                UPDATE boats
                   SET "type" = $2,
                       updated_at = NOW()
                 WHERE boat_id = $1
                "#,
            )
            .bind(boat_id)
            .bind(boat_type)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }
}

/// The conflict branch takes the row lock, so the WHERE check and the write
/// cannot interleave with a concurrent attempt. Binds: key, now, expiry,
/// cooldown.
const GATE_PUT_IF_COOLED_SQL: &str = r#"
INSERT INTO refresh_gate (gate_key, last_run_epoch, expires_at_epoch)
VALUES ($1, $2, $3)
ON CONFLICT (gate_key) DO UPDATE
   SET last_run_epoch = EXCLUDED.last_run_epoch,
       expires_at_epoch = EXCLUDED.expires_at_epoch
 WHERE refresh_gate.expires_at_epoch <= $2
    OR $2 - refresh_gate.last_run_epoch >= $4
RETURNING gate_key
"#;

fn conflict_clause() -> String {
    let sets = UPDATE_COLUMNS
        .iter()
        .map(|col| match *col {
            "type" => r#""type" = COALESCE(EXCLUDED."type", boats."type")"#.to_string(),
            other => format!("{other} = EXCLUDED.{other}"),
        })
        .chain(std::iter::once("updated_at = EXCLUDED.updated_at".to_string()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(" ON CONFLICT ({CONFLICT_KEY}) DO UPDATE SET {sets}")
}

#[async_trait]
impl UpsertSink for PgStore {
    async fn upsert_batch(&self, rows: &[BoatRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for chunk in rows.chunks(UPSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"INSERT INTO boats (boat_id, name, latitude, longitude, speed, heading, datetime, contact, atolls, "type", updated_at) "#,
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.boat_id.clone())
                    .push_bind(row.name.clone())
                    .push_bind(row.latitude)
                    .push_bind(row.longitude)
                    .push_bind(row.speed)
                    .push_bind(row.heading)
                    .push_bind(row.datetime)
                    .push_bind(row.contact.clone())
                    .push_bind(row.atolls.clone())
                    .push_bind(row.boat_type.clone())
                    .push("NOW()");
            });
            qb.push(conflict_clause());
            let result = qb.build().execute(&mut *tx).await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }
}

#[async_trait]
impl BoatSnapshotSource for PgStore {
    async fn list_boats(&self) -> Result<Vec<BoatRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT boat_id, name, latitude, longitude, speed, heading,
                   datetime, contact, atolls, "type"
              FROM boats
             ORDER BY boat_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let atolls: Option<String> = row.try_get("atolls")?;
            out.push(BoatRow {
                boat_id: row.try_get("boat_id")?,
                name: row.try_get("name")?,
                latitude: row.try_get("latitude")?,
                longitude: row.try_get("longitude")?,
                speed: row.try_get("speed")?,
                heading: row.try_get("heading")?,
                datetime: row.try_get::<Option<DateTime<Utc>>, _>("datetime")?,
                contact: row.try_get("contact")?,
                atolls: atolls.unwrap_or_default(),
                boat_type: row.try_get("type")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl GateStore for PgStore {
    async fn put_if_cooled(
        &self,
        key: &str,
        now: i64,
        cooldown_secs: i64,
        ttl_secs: i64,
    ) -> Result<bool, StoreError> {
        let written = sqlx::query(GATE_PUT_IF_COOLED_SQL)
            .bind(key)
            .bind(now)
            .bind(now + ttl_secs)
            .bind(cooldown_secs)
            .fetch_optional(&self.pool)
            .await?;
        Ok(written.is_some())
    }
}

#[derive(Debug, Clone, Copy)]
struct GateMark {
    last_run: i64,
    expires_at: i64,
}

/// Single-process gate store. Check and write happen under one lock.
#[derive(Debug, Default)]
pub struct MemoryGateStore {
    marks: Mutex<HashMap<String, GateMark>>,
}

impl MemoryGateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn last_run(&self, key: &str) -> Option<i64> {
        self.marks.lock().await.get(key).map(|m| m.last_run)
    }
}

#[async_trait]
impl GateStore for MemoryGateStore {
    async fn put_if_cooled(
        &self,
        key: &str,
        now: i64,
        cooldown_secs: i64,
        ttl_secs: i64,
    ) -> Result<bool, StoreError> {
        let mut marks = self.marks.lock().await;
        if let Some(mark) = marks.get(key) {
            let expired = mark.expires_at <= now;
            if !expired && now - mark.last_run < cooldown_secs {
                return Ok(false);
            }
        }
        marks.insert(
            key.to_string(),
            GateMark {
                last_run: now,
                expires_at: now + ttl_secs,
            },
        );
        Ok(true)
    }
}

/// In-memory boat table with the same upsert semantics as [`PgStore`].
#[derive(Debug, Default)]
pub struct MemoryBoatStore {
    rows: Mutex<BTreeMap<String, BoatRow>>,
    reject_with: Mutex<Option<String>>,
}

impl MemoryBoatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose upserts fail with `message` until [`Self::accept_writes`].
    pub fn rejecting(message: impl Into<String>) -> Self {
        Self {
            rows: Mutex::default(),
            reject_with: Mutex::new(Some(message.into())),
        }
    }

    pub async fn accept_writes(&self) {
        *self.reject_with.lock().await = None;
    }

    pub async fn get(&self, boat_id: &str) -> Option<BoatRow> {
        self.rows.lock().await.get(boat_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn apply_type_labels(&self, labels: &[(String, String)]) -> u64 {
        let mut rows = self.rows.lock().await;
        let mut updated = 0u64;
        for (boat_id, boat_type) in labels {
            if let Some(row) = rows.get_mut(boat_id) {
                row.boat_type = Some(boat_type.clone());
                updated += 1;
            }
        }
        updated
    }
}

#[async_trait]
impl UpsertSink for MemoryBoatStore {
    async fn upsert_batch(&self, batch: &[BoatRow]) -> Result<u64, StoreError> {
        if let Some(message) = self.reject_with.lock().await.clone() {
            return Err(StoreError::Rejected(message));
        }
        if let Some(bad) = batch.iter().find(|row| row.boat_id.trim().is_empty()) {
            return Err(StoreError::Rejected(format!(
                "row with empty {CONFLICT_KEY} (name={:?})",
                bad.name
            )));
        }

        let mut rows = self.rows.lock().await;
        for incoming in batch {
            match rows.get_mut(&incoming.boat_id) {
                Some(existing) => {
                    let kept_type = existing.boat_type.take();
                    *existing = incoming.clone();
                    if existing.boat_type.is_none() {
                        existing.boat_type = kept_type;
                    }
                }
                None => {
                    rows.insert(incoming.boat_id.clone(), incoming.clone());
                }
            }
        }
        Ok(batch.len() as u64)
    }
}

#[async_trait]
impl BoatSnapshotSource for MemoryBoatStore {
    async fn list_boats(&self) -> Result<Vec<BoatRow>, StoreError> {
        Ok(self.rows.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(boat_id: &str, name: Option<&str>, boat_type: Option<&str>) -> BoatRow {
        BoatRow {
            boat_id: boat_id.to_string(),
            name: name.map(str::to_string),
            latitude: Some(4.17),
            longitude: Some(73.51),
            speed: None,
            heading: None,
            datetime: None,
            contact: None,
            atolls: "K".to_string(),
            boat_type: boat_type.map(str::to_string),
        }
    }

    #[test]
    fn conflict_clause_updates_listed_columns_and_keeps_known_type() {
        let clause = conflict_clause();
        assert!(clause.starts_with(" ON CONFLICT (boat_id) DO UPDATE SET "));
        for col in UPDATE_COLUMNS.iter().filter(|c| **c != "type") {
            assert!(clause.contains(&format!("{col} = EXCLUDED.{col}")), "{col} missing");
        }
        assert!(clause.contains(r#""type" = COALESCE(EXCLUDED."type", boats."type")"#));
    }

    #[test]
    fn gate_write_is_one_conditional_statement() {
        let sql = GATE_PUT_IF_COOLED_SQL;
        assert!(sql.contains("ON CONFLICT (gate_key) DO UPDATE"));
        assert!(sql.contains("WHERE refresh_gate.expires_at_epoch <= $2"));
        assert!(sql.contains("OR $2 - refresh_gate.last_run_epoch >= $4"));
        assert!(sql.trim_end().ends_with("RETURNING gate_key"));
    }

    /// Runs only when `DATABASE_URL` points at a reachable Postgres.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pg_gate_admits_one_of_many_concurrent_callers() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let store = PgStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();

        let key = format!(
            "gate-test-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.put_if_cooled(&key, 1_000, 30, 120).await.unwrap()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);

        assert!(!store.put_if_cooled(&key, 1_010, 30, 120).await.unwrap());
        assert!(store.put_if_cooled(&key, 1_031, 30, 120).await.unwrap());

        sqlx::query("DELETE FROM refresh_gate WHERE gate_key = $1")
            .bind(&key)
            .execute(store.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn memory_gate_refuses_inside_cooldown_and_heals_after_expiry() {
        let gate = MemoryGateStore::new();
        assert!(gate.put_if_cooled("k", 100, 30, 120).await.unwrap());
        assert!(!gate.put_if_cooled("k", 110, 30, 120).await.unwrap());
        assert_eq!(gate.last_run("k").await, Some(100));
        assert!(gate.put_if_cooled("k", 130, 30, 120).await.unwrap());

        // a mark left far in the past by a crashed cycle is simply expired
        assert!(gate.put_if_cooled("stale", 1_000, 30, 120).await.unwrap());
        assert!(gate.put_if_cooled("stale", 1_200, 300, 120).await.unwrap());
        assert!(!gate.put_if_cooled("stale", 1_250, 300, 120).await.unwrap());
    }

    #[tokio::test]
    async fn memory_upsert_inserts_updates_and_keeps_stored_type() {
        let store = MemoryBoatStore::new();
        store
            .upsert_batch(&[row("7", Some("Orca"), Some("safari")), row("8", None, None)])
            .await
            .unwrap();
        let written = store
            .upsert_batch(&[row("7", Some("Orca II"), None)])
            .await
            .unwrap();
        assert_eq!(written, 1);

        let seven = store.get("7").await.unwrap();
        assert_eq!(seven.name.as_deref(), Some("Orca II"));
        assert_eq!(seven.boat_type.as_deref(), Some("safari"));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn rejected_batch_writes_nothing() {
        let store = MemoryBoatStore::rejecting("disk full");
        let err = store.upsert_batch(&[row("7", None, None)]).await.unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(store.len().await, 0);

        store.accept_writes().await;
        let err = store
            .upsert_batch(&[row("7", None, None), row(" ", None, None)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn type_labels_only_touch_existing_rows() {
        let store = MemoryBoatStore::new();
        store.upsert_batch(&[row("7", None, None)]).await.unwrap();
        let updated = store
            .apply_type_labels(&[
                ("7".to_string(), "speed boat".to_string()),
                ("99".to_string(), "dinghy".to_string()),
            ])
            .await;
        assert_eq!(updated, 1);
        assert_eq!(store.get("7").await.unwrap().boat_type.as_deref(), Some("speed boat"));
    }
}
