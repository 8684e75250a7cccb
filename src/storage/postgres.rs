use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::pipeline::Batch;
use crate::storage::traits::{BatchStore, StoreResult};

/// Rows per multi-row insert; keeps bind parameters well under the protocol limit
const EVENT_INSERT_CHUNK: usize = 1000;

/// PostgreSQL implementation of BatchStore
pub struct PostgresBatchStore {
    pool: PgPool,
}

impl PostgresBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Initialize database schema
    pub async fn initialize(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_batches (
                batch_id UUID PRIMARY KEY,
                sequence BIGINT NOT NULL,
                flush_reason TEXT NOT NULL,
                event_count INTEGER NOT NULL,
                opened_at TIMESTAMPTZ NOT NULL,
                closed_at TIMESTAMPTZ NOT NULL,
                persisted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batch_events (
                batch_id UUID NOT NULL REFERENCES event_batches(batch_id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                topic TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                log_offset BIGINT NOT NULL,
                event_key BYTEA,
                payload BYTEA NOT NULL,
                event_time TIMESTAMPTZ,
                received_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (batch_id, position)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_batch_events_offset
                ON batch_events(topic, partition_id, log_offset)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl BatchStore for PostgresBatchStore {
    async fn write_batch(&self, batch: &Batch) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let header = sqlx::query(
            r#"
            INSERT INTO event_batches
                (batch_id, sequence, flush_reason, event_count, opened_at, closed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (batch_id) DO NOTHING
            "#,
        )
        .bind(batch.id())
        .bind(batch.sequence() as i64)
        .bind(batch.reason().as_str())
        .bind(batch.len() as i32)
        .bind(batch.opened_at())
        .bind(batch.closed_at())
        .execute(&mut *tx)
        .await?;

        // Header and events commit together, so an existing header means
        // an earlier attempt already stored the whole batch.
        if header.rows_affected() == 0 {
            debug!("Batch {} already persisted", batch.id());
            tx.rollback().await?;
            return Ok(());
        }

        for (chunk_index, chunk) in batch.events().chunks(EVENT_INSERT_CHUNK).enumerate() {
            let base = chunk_index * EVENT_INSERT_CHUNK;
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO batch_events \
                 (batch_id, position, topic, partition_id, log_offset, event_key, payload, event_time, received_at) ",
            );
            builder.push_values(chunk.iter().enumerate(), |mut row, (i, event)| {
                row.push_bind(batch.id())
                    .push_bind((base + i) as i32)
                    .push_bind(event.topic.as_str())
                    .push_bind(event.partition)
                    .push_bind(event.offset)
                    .push_bind(event.key.as_deref())
                    .push_bind(event.payload.as_slice())
                    .push_bind(event.timestamp)
                    .push_bind(event.received_at);
            });
            builder.push(" ON CONFLICT (batch_id, position) DO NOTHING");
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!("Persisted batch {} ({} events)", batch.sequence(), batch.len());
        Ok(())
    }
}
