//! SQLite store for node-local scanner and queue state

use crate::error::{NodeError, NodeResult};
use crate::messages::LedgerMsg;
use crate::types::{Chain, TxId, TxKey};

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

/// Retry state of a single block height
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Being re-attempted by the retry sweep
    Pending,
    /// Fetch or persistence failed; waiting for the next sweep
    Failed,
}

impl BlockState {
    fn as_str(&self) -> &'static str {
        match self {
            BlockState::Pending => "pending",
            BlockState::Failed => "failed",
        }
    }

    fn parse(s: &str) -> NodeResult<Self> {
        match s {
            "pending" => Ok(BlockState::Pending),
            "failed" => Ok(BlockState::Failed),
            other => Err(NodeError::Internal(format!("unknown block state {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStatus {
    pub height: u64,
    pub state: BlockState,
}

/// Submission state of a queued observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    New,
    /// Claimed by a worker; no one else may submit it
    Processing,
    Failed,
}

impl QueueStatus {
    fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::New => "new",
            QueueStatus::Processing => "processing",
            QueueStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> NodeResult<Self> {
        match s {
            "new" => Ok(QueueStatus::New),
            "processing" => Ok(QueueStatus::Processing),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(NodeError::Internal(format!("unknown queue status {}", other))),
        }
    }
}

/// A message waiting to be signed and submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalQueueItem {
    pub key: TxKey,
    pub msg: LedgerMsg,
    pub status: QueueStatus,
    pub attempts: u32,
}

/// Nonce held by one outbound item, and the transaction once it is known sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastRecord {
    pub nonce: u64,
    pub sent: bool,
    /// Unknown when the nonce was found mined after a lost reply
    pub out_tx: Option<String>,
}

/// Durable node-local state
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    /// Open (creating if needed) the database at `url`
    pub async fn connect(url: &str) -> NodeResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new();
        if url.contains(":memory:") {
            // every connection to :memory: is a separate database
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            pool_options = pool_options.max_connections(4);
        }
        let pool = pool_options.connect_with(options).await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> NodeResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_positions (
                chain TEXT PRIMARY KEY,
                height INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS block_status (
                chain TEXT NOT NULL,
                height INTEGER NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (chain, height)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_items (
                chain TEXT NOT NULL,
                tx_id TEXT NOT NULL,
                block_height INTEGER NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (chain, tx_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_status
            ON queue_items (status, block_height)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbound_broadcasts (
                item_key TEXT PRIMARY KEY,
                chain TEXT NOT NULL,
                nonce INTEGER NOT NULL,
                sent INTEGER NOT NULL DEFAULT 0,
                out_tx TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_outbound_nonce
            ON outbound_broadcasts (chain, nonce)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Local store migrations complete");
        Ok(())
    }

    pub async fn health_check(&self) -> NodeResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Highest height below which every block is fully processed
    pub async fn get_scan_position(&self, chain: &str) -> NodeResult<Option<u64>> {
        let row = sqlx::query("SELECT height FROM scan_positions WHERE chain = ?1")
            .bind(chain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("height") as u64))
    }

    /// Move the scan position forward to `height`; never moves it back. Returns the stored value.
    pub async fn advance_scan_position(&self, chain: &str, height: u64) -> NodeResult<u64> {
        sqlx::query(
            r#"
            INSERT INTO scan_positions (chain, height, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (chain)
            DO UPDATE SET height = MAX(scan_positions.height, excluded.height),
                          updated_at = excluded.updated_at
            "#,
        )
        .bind(chain)
        .bind(height as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let stored = self.get_scan_position(chain).await?.unwrap_or(height);
        debug!("Scan position for {}: {}", chain, stored);
        Ok(stored)
    }

    pub async fn set_block_status(&self, chain: &str, height: u64, state: BlockState) -> NodeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO block_status (chain, height, state, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (chain, height)
            DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at
            "#,
        )
        .bind(chain)
        .bind(height as i64)
        .bind(state.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_block_status(&self, chain: &str, height: u64) -> NodeResult<()> {
        sqlx::query("DELETE FROM block_status WHERE chain = ?1 AND height = ?2")
            .bind(chain)
            .bind(height as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Heights awaiting retry, lowest first
    pub async fn block_statuses(&self, chain: &str) -> NodeResult<Vec<BlockStatus>> {
        let rows = sqlx::query(
            "SELECT height, state FROM block_status WHERE chain = ?1 ORDER BY height ASC",
        )
        .bind(chain)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok::<_, NodeError>(BlockStatus {
                    height: row.get::<i64, _>("height") as u64,
                    state: BlockState::parse(row.get::<&str, _>("state"))?,
                })
            })
            .collect()
    }

    /// Add a message to the queue. Returns false if the transaction is already queued.
    pub async fn enqueue(&self, msg: &LedgerMsg) -> NodeResult<bool> {
        let transfer = msg.transfer().ok_or_else(|| {
            NodeError::Malformed(format!("{} messages are not queued", msg.name()))
        })?;
        let key = transfer.key();
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO queue_items (chain, tx_id, block_height, payload, status, attempts, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)
            ON CONFLICT (chain, tx_id) DO NOTHING
            "#,
        )
        .bind(key.chain.as_str())
        .bind(key.tx_id.as_str())
        .bind(transfer.block_height as i64)
        .bind(msg.encode()?)
        .bind(QueueStatus::New.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// New items, plus failed ones when `include_retries` is set, oldest block first
    pub async fn dequeue(&self, include_retries: bool) -> NodeResult<Vec<LocalQueueItem>> {
        let sql = if include_retries {
            "SELECT chain, tx_id, payload, status, attempts FROM queue_items WHERE status IN ('new', 'failed') ORDER BY block_height ASC, created_at ASC"
        } else {
            "SELECT chain, tx_id, payload, status, attempts FROM queue_items WHERE status = 'new' ORDER BY block_height ASC, created_at ASC"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| {
                let payload: String = row.get("payload");
                Ok::<_, NodeError>(LocalQueueItem {
                    key: TxKey::new(
                        Chain::new(row.get::<&str, _>("chain"))?,
                        TxId::new(row.get::<&str, _>("tx_id"))?,
                    ),
                    msg: serde_json::from_str(&payload)?,
                    status: QueueStatus::parse(row.get::<&str, _>("status"))?,
                    attempts: row.get::<i64, _>("attempts") as u32,
                })
            })
            .collect()
    }

    /// Claim an item for submission. False if another worker already holds it or it is gone.
    pub async fn mark_processing(&self, key: &TxKey) -> NodeResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'processing', attempts = attempts + 1, updated_at = ?3
            WHERE chain = ?1 AND tx_id = ?2 AND status != 'processing'
            "#,
        )
        .bind(key.chain.as_str())
        .bind(key.tx_id.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_failed(&self, key: &TxKey) -> NodeResult<()> {
        self.set_status(key, QueueStatus::Failed).await
    }

    async fn set_status(&self, key: &TxKey, status: QueueStatus) -> NodeResult<()> {
        sqlx::query(
            "UPDATE queue_items SET status = ?3, updated_at = ?4 WHERE chain = ?1 AND tx_id = ?2",
        )
        .bind(key.chain.as_str())
        .bind(key.tx_id.as_str())
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, key: &TxKey) -> NodeResult<()> {
        sqlx::query("DELETE FROM queue_items WHERE chain = ?1 AND tx_id = ?2")
            .bind(key.chain.as_str())
            .bind(key.tx_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Return items left in flight by a previous run to the retry pool
    pub async fn reset_in_flight(&self) -> NodeResult<u64> {
        let result = sqlx::query(
            "UPDATE queue_items SET status = 'failed', updated_at = ?1 WHERE status = 'processing'",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn queue_depth(&self) -> NodeResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS depth FROM queue_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("depth") as u64)
    }

    pub async fn broadcast_record(&self, item_key: &str) -> NodeResult<Option<BroadcastRecord>> {
        let row = sqlx::query(
            "SELECT nonce, sent, out_tx FROM outbound_broadcasts WHERE item_key = ?1",
        )
        .bind(item_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| BroadcastRecord {
            nonce: r.get::<i64, _>("nonce") as u64,
            sent: r.get::<i64, _>("sent") != 0,
            out_tx: r.get::<Option<String>, _>("out_tx"),
        }))
    }

    /// Highest nonce any outbound item on `chain` holds
    pub async fn highest_nonce(&self, chain: &str) -> NodeResult<Option<u64>> {
        let row = sqlx::query("SELECT MAX(nonce) AS nonce FROM outbound_broadcasts WHERE chain = ?1")
            .bind(chain)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<Option<i64>, _>("nonce").map(|n| n as u64))
    }

    /// Bind `nonce` to `item_key`. Fails if another item on the chain holds it.
    pub async fn reserve_nonce(&self, item_key: &str, chain: &str, nonce: u64) -> NodeResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO outbound_broadcasts (item_key, chain, nonce, sent, out_tx, created_at, updated_at)
            VALUES (?1, ?2, ?3, 0, NULL, ?4, ?4)
            "#,
        )
        .bind(item_key)
        .bind(chain)
        .bind(nonce as i64)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Give back a reservation whose item will never be sent
    pub async fn release_nonce(&self, item_key: &str) -> NodeResult<()> {
        sqlx::query("DELETE FROM outbound_broadcasts WHERE item_key = ?1 AND sent = 0")
            .bind(item_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_broadcast(&self, item_key: &str, out_tx: Option<&str>) -> NodeResult<()> {
        sqlx::query(
            r#"
            UPDATE outbound_broadcasts
            SET sent = 1, out_tx = COALESCE(out_tx, ?2), updated_at = ?3
            WHERE item_key = ?1
            "#,
        )
        .bind(item_key)
        .bind(out_tx)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
