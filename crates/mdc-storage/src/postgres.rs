use async_trait::async_trait;
use mdc_core::{CanonicalRecord, EntityKind, NewsItem, QuoteRecord, SectorEntry};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

use crate::batch::{ensure_kind, BatchStore, CycleLogEntry, StoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS stock_quotes (
        symbol          TEXT NOT NULL,
        market          TEXT NOT NULL,
        name            TEXT,
        quoted_at       TIMESTAMPTZ NOT NULL,
        last_price      DOUBLE PRECISION NOT NULL,
        change_amount   DOUBLE PRECISION,
        change_percent  DOUBLE PRECISION,
        volume          BIGINT,
        turnover        DOUBLE PRECISION,
        source_id       TEXT NOT NULL,
        PRIMARY KEY (market, symbol, quoted_at)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sector_rankings (
        board                      TEXT NOT NULL,
        sector_code                TEXT NOT NULL,
        sector_name                TEXT NOT NULL,
        rank                       INTEGER NOT NULL,
        change_percent             DOUBLE PRECISION NOT NULL,
        total_market_cap           DOUBLE PRECISION,
        turnover_rate              DOUBLE PRECISION,
        advancing_count            INTEGER,
        declining_count            INTEGER,
        lead_stock_name            TEXT,
        lead_stock_change_percent  DOUBLE PRECISION,
        polled_at                  TIMESTAMPTZ NOT NULL,
        source_id                  TEXT NOT NULL,
        PRIMARY KEY (board, sector_code, polled_at)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS news_items (
        fingerprint   TEXT PRIMARY KEY,
        symbol        TEXT,
        title         TEXT NOT NULL,
        summary       TEXT,
        url           TEXT NOT NULL,
        source_name   TEXT,
        published_at  TIMESTAMPTZ NOT NULL,
        source_id     TEXT NOT NULL,
        collected_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS collection_logs (
        id         BIGSERIAL PRIMARY KEY,
        task_name  TEXT NOT NULL,
        status     TEXT NOT NULL,
        message    TEXT NOT NULL,
        logged_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS news_items_published_idx ON news_items (published_at DESC)",
];

/// Postgres-backed store. Each batch is written in one transaction.
#[derive(Debug, Clone)]
pub struct PgBatchStore {
    pool: PgPool,
}

impl PgBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!(tables = 4, "database schema ready");
        Ok(())
    }
}

async fn upsert_quote(
    tx: &mut Transaction<'_, Postgres>,
    q: &QuoteRecord,
) -> Result<u64, StoreError> {
    let volume = q
        .volume
        .map(i64::try_from)
        .transpose()
        .map_err(|_| StoreError::OutOfRange { column: "volume" })?;
    let result = sqlx::query(
        r#"
        INSERT INTO stock_quotes
            (symbol, market, name, quoted_at, last_price, change_amount,
             change_percent, volume, turnover, source_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (market, symbol, quoted_at) DO UPDATE SET
            name = EXCLUDED.name,
            last_price = EXCLUDED.last_price,
            change_amount = EXCLUDED.change_amount,
            change_percent = EXCLUDED.change_percent,
            volume = EXCLUDED.volume,
            turnover = EXCLUDED.turnover,
            source_id = EXCLUDED.source_id
        "#,
    )
    .bind(&q.symbol)
    .bind(q.market.as_str())
    .bind(&q.name)
    .bind(q.timestamp)
    .bind(q.last_price)
    .bind(q.change_amount)
    .bind(q.change_percent)
    .bind(volume)
    .bind(q.turnover)
    .bind(&q.source_id)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

async fn upsert_sector(
    tx: &mut Transaction<'_, Postgres>,
    s: &SectorEntry,
) -> Result<u64, StoreError> {
    let count = |value: Option<u32>, column: &'static str| {
        value
            .map(i32::try_from)
            .transpose()
            .map_err(|_| StoreError::OutOfRange { column })
    };
    let rank = i32::try_from(s.rank).map_err(|_| StoreError::OutOfRange { column: "rank" })?;
    let advancing = count(s.advancing_count, "advancing_count")?;
    let declining = count(s.declining_count, "declining_count")?;

    let result = sqlx::query(
        r#"
        INSERT INTO sector_rankings
            (board, sector_code, sector_name, rank, change_percent, total_market_cap,
             turnover_rate, advancing_count, declining_count, lead_stock_name,
             lead_stock_change_percent, polled_at, source_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (board, sector_code, polled_at) DO UPDATE SET
            sector_name = EXCLUDED.sector_name,
            rank = EXCLUDED.rank,
            change_percent = EXCLUDED.change_percent,
            total_market_cap = EXCLUDED.total_market_cap,
            turnover_rate = EXCLUDED.turnover_rate,
            advancing_count = EXCLUDED.advancing_count,
            declining_count = EXCLUDED.declining_count,
            lead_stock_name = EXCLUDED.lead_stock_name,
            lead_stock_change_percent = EXCLUDED.lead_stock_change_percent,
            source_id = EXCLUDED.source_id
        "#,
    )
    .bind(s.board.as_str())
    .bind(&s.sector_code)
    .bind(&s.sector_name)
    .bind(rank)
    .bind(s.change_percent)
    .bind(s.total_market_cap)
    .bind(s.turnover_rate)
    .bind(advancing)
    .bind(declining)
    .bind(&s.lead_stock_name)
    .bind(s.lead_stock_change_percent)
    .bind(s.polled_at)
    .bind(&s.source_id)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

async fn insert_news(tx: &mut Transaction<'_, Postgres>, n: &NewsItem) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO news_items
            (fingerprint, symbol, title, summary, url, source_name, published_at, source_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (fingerprint) DO NOTHING
        "#,
    )
    .bind(&n.fingerprint)
    .bind(&n.symbol)
    .bind(&n.title)
    .bind(&n.summary)
    .bind(&n.url)
    .bind(&n.source_name)
    .bind(n.published_at)
    .bind(&n.source_id)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl BatchStore for PgBatchStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn store_batch(
        &self,
        kind: EntityKind,
        records: &[CanonicalRecord],
    ) -> Result<usize, StoreError> {
        ensure_kind(kind, records)?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for record in records {
            written += match record {
                CanonicalRecord::Quote(q) => upsert_quote(&mut tx, q).await?,
                CanonicalRecord::Sector(s) => upsert_sector(&mut tx, s).await?,
                CanonicalRecord::News(n) => insert_news(&mut tx, n).await?,
            };
        }
        tx.commit().await?;

        info!(%kind, rows = written, "stored batch in postgres");
        Ok(usize::try_from(written).unwrap_or(usize::MAX))
    }

    async fn log_cycle(&self, entry: &CycleLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO collection_logs (task_name, status, message, logged_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&entry.task_name)
        .bind(&entry.status)
        .bind(&entry.message)
        .bind(entry.logged_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
