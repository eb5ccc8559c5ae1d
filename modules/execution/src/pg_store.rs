//! Postgres-backed submission store.
//!
//! Each port operation maps to one transaction; unique indexes on
//! `intent_id`, `order_id` and `broker_order_id` enforce the identity
//! invariants at the storage layer as well.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::Envelope;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::contracts::Side;
use crate::domain::{Fill, InboxRecord, Intent, IntentState, Order, OutboxRecord};
use crate::store::{CommitOutcome, StoreError, SubmissionStore, Transition};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        sqlx::migrate!("./db/migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        // 23505 = unique_violation
        if db.code().as_deref() == Some("23505") {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Unavailable(e.to_string())
}

fn intent_from_row(row: &sqlx::postgres::PgRow) -> Result<Intent, StoreError> {
    let side_raw: String = row.try_get("side").map_err(db_err)?;
    let state_raw: String = row.try_get("state").map_err(db_err)?;
    Ok(Intent {
        intent_id: row.try_get("intent_id").map_err(db_err)?,
        symbol: row.try_get("symbol").map_err(db_err)?,
        side: Side::parse(&side_raw)
            .ok_or_else(|| StoreError::Serialization(format!("bad side {side_raw}")))?,
        target_qty: row.try_get("target_qty").map_err(db_err)?,
        approval: row.try_get("approval").map_err(db_err)?,
        state: IntentState::parse(&state_raw)
            .ok_or_else(|| StoreError::Serialization(format!("bad state {state_raw}")))?,
        attempt: row.try_get::<i32, _>("attempt").map_err(db_err)? as u32,
        submit_attempt_id: row.try_get("submit_attempt_id").map_err(db_err)?,
        lease_owner: row.try_get("lease_owner").map_err(db_err)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(db_err)?,
        halted: row.try_get("halted").map_err(db_err)?,
        trace_id: row.try_get("trace_id").map_err(db_err)?,
    })
}

fn order_from_row(row: &sqlx::postgres::PgRow) -> Result<Order, StoreError> {
    Ok(Order {
        order_id: row.try_get("order_id").map_err(db_err)?,
        intent_id: row.try_get("intent_id").map_err(db_err)?,
        broker_order_id: row.try_get("broker_order_id").map_err(db_err)?,
        request_hash: row.try_get("request_hash").map_err(db_err)?,
        cum_qty: row.try_get("cum_qty").map_err(db_err)?,
        target_qty: row.try_get("target_qty").map_err(db_err)?,
        avg_price: row.try_get("avg_price").map_err(db_err)?,
    })
}

async fn insert_outbox(
    tx: &mut Transaction<'_, Postgres>,
    events: &[Envelope],
) -> Result<(), StoreError> {
    for event in events {
        let envelope = event
            .to_value()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO submission_outbox (stream, envelope)
            VALUES ($1, $2)
            "#,
        )
        .bind(&event.schema)
        .bind(envelope)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

#[async_trait]
impl SubmissionStore for PgStore {
    async fn inbox_get(&self, intent_id: &str) -> Result<Option<InboxRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT intent_id, status, result_digest
            FROM submission_inbox
            WHERE intent_id = $1
            "#,
        )
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| {
            let status_raw: String = row.try_get("status").map_err(db_err)?;
            Ok(InboxRecord {
                intent_id: row.try_get("intent_id").map_err(db_err)?,
                status: IntentState::parse(&status_raw)
                    .ok_or_else(|| StoreError::Serialization(format!("bad status {status_raw}")))?,
                result_digest: row.try_get("result_digest").map_err(db_err)?,
            })
        })
        .transpose()
    }

    async fn insert_approved(
        &self,
        intent: &Intent,
        digest: &str,
        events: &[Envelope],
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO intents
                (intent_id, symbol, side, target_qty, approval, state, attempt, trace_id, halted)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (intent_id) DO NOTHING
            "#,
        )
        .bind(&intent.intent_id)
        .bind(&intent.symbol)
        .bind(intent.side.as_str())
        .bind(intent.target_qty)
        .bind(&intent.approval)
        .bind(intent.state.as_str())
        .bind(intent.attempt as i32)
        .bind(&intent.trace_id)
        .bind(intent.halted)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO submission_inbox (intent_id, status, result_digest)
            VALUES ($1, $2, $3)
            ON CONFLICT (intent_id) DO NOTHING
            "#,
        )
        .bind(&intent.intent_id)
        .bind(intent.state.as_str())
        .bind(digest)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        insert_outbox(&mut tx, events).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn acquire_lease(
        &self,
        intent_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Intent>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE intents
            SET lease_owner = $2,
                lease_expires_at = NOW() + ($3 * INTERVAL '1 millisecond'),
                updated_at = NOW()
            WHERE intent_id = $1
              AND (lease_owner IS NULL OR lease_owner = $2 OR lease_expires_at <= NOW())
            RETURNING intent_id, symbol, side, target_qty, approval, state, attempt,
                      submit_attempt_id, lease_owner, lease_expires_at, halted, trace_id
            "#,
        )
        .bind(intent_id)
        .bind(owner)
        .bind(ttl.as_millis() as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(intent_from_row(&row)?)),
            None => {
                // Distinguish "held elsewhere" from "no such intent".
                let exists: Option<(String,)> =
                    sqlx::query_as("SELECT intent_id FROM intents WHERE intent_id = $1")
                        .bind(intent_id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(db_err)?;
                if exists.is_none() {
                    return Err(StoreError::UnknownIntent(intent_id.to_string()));
                }
                Ok(None)
            }
        }
    }

    async fn commit(&self, transition: Transition) -> Result<CommitOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT lease_owner, lease_expires_at
            FROM intents
            WHERE intent_id = $1
            FOR UPDATE
            "#,
        )
        .bind(&transition.intent_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::UnknownIntent(transition.intent_id.clone()))?;

        let lease_owner: Option<String> = row.try_get("lease_owner").map_err(db_err)?;
        let lease_expires_at: Option<DateTime<Utc>> =
            row.try_get("lease_expires_at").map_err(db_err)?;
        let lease_live = lease_owner.as_deref() == Some(transition.lease_owner.as_str())
            && lease_expires_at.map(|at| at > Utc::now()).unwrap_or(false);
        if !lease_live {
            tx.rollback().await.map_err(db_err)?;
            return Err(StoreError::LeaseLost(transition.intent_id.clone()));
        }

        if let Some(fill) = &transition.fill {
            let existing = sqlx::query(
                r#"SELECT qty, price FROM fills WHERE fill_key = $1"#,
            )
            .bind(&fill.fill_key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
            if let Some(existing) = existing {
                let qty: f64 = existing.try_get("qty").map_err(db_err)?;
                let price: f64 = existing.try_get("price").map_err(db_err)?;
                tx.rollback().await.map_err(db_err)?;
                if qty == fill.qty && price == fill.price {
                    return Ok(CommitOutcome::DuplicateFill);
                }
                return Err(StoreError::FillConflict(fill.fill_key.clone()));
            }
        }

        if let Some(order) = &transition.order {
            sqlx::query(
                r#"
                INSERT INTO orders
                    (order_id, intent_id, broker_order_id, request_hash, cum_qty, target_qty, avg_price)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (order_id) DO UPDATE
                SET broker_order_id = EXCLUDED.broker_order_id,
                    request_hash = EXCLUDED.request_hash,
                    cum_qty = EXCLUDED.cum_qty,
                    avg_price = EXCLUDED.avg_price
                "#,
            )
            .bind(&order.order_id)
            .bind(&order.intent_id)
            .bind(&order.broker_order_id)
            .bind(&order.request_hash)
            .bind(order.cum_qty)
            .bind(order.target_qty)
            .bind(order.avg_price)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        if let Some(fill) = &transition.fill {
            sqlx::query(
                r#"
                INSERT INTO fills (fill_key, order_id, qty, price, ts)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&fill.fill_key)
            .bind(&fill.order_id)
            .bind(fill.qty)
            .bind(fill.price)
            .bind(&fill.ts)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        insert_outbox(&mut tx, &transition.events).await?;

        if let Some(digest) = &transition.inbox_digest {
            sqlx::query(
                r#"
                INSERT INTO submission_inbox (intent_id, status, result_digest)
                VALUES ($1, $2, $3)
                ON CONFLICT (intent_id) DO UPDATE
                SET status = EXCLUDED.status,
                    result_digest = EXCLUDED.result_digest,
                    updated_at = NOW()
                "#,
            )
            .bind(&transition.intent_id)
            .bind(transition.state.as_str())
            .bind(digest)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        } else {
            sqlx::query(
                r#"
                UPDATE submission_inbox
                SET status = $2, updated_at = NOW()
                WHERE intent_id = $1
                "#,
            )
            .bind(&transition.intent_id)
            .bind(transition.state.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        sqlx::query(
            r#"
            UPDATE intents
            SET state = $2,
                attempt = COALESCE($3, attempt),
                submit_attempt_id = COALESCE($4, submit_attempt_id),
                halted = halted OR $5,
                lease_owner = CASE WHEN $6 THEN NULL ELSE lease_owner END,
                lease_expires_at = CASE WHEN $6 THEN NULL ELSE lease_expires_at END,
                updated_at = NOW()
            WHERE intent_id = $1
            "#,
        )
        .bind(&transition.intent_id)
        .bind(transition.state.as_str())
        .bind(transition.attempt.map(|a| a as i32))
        .bind(&transition.submit_attempt_id)
        .bind(transition.halt)
        .bind(transition.clear_lease)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(CommitOutcome::Applied)
    }

    async fn intent(&self, intent_id: &str) -> Result<Option<Intent>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT intent_id, symbol, side, target_qty, approval, state, attempt,
                   submit_attempt_id, lease_owner, lease_expires_at, halted, trace_id
            FROM intents
            WHERE intent_id = $1
            "#,
        )
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|row| intent_from_row(&row)).transpose()
    }

    async fn intents_in(&self, states: &[IntentState]) -> Result<Vec<Intent>, StoreError> {
        let names: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT intent_id, symbol, side, target_qty, approval, state, attempt,
                   submit_attempt_id, lease_owner, lease_expires_at, halted, trace_id
            FROM intents
            WHERE state = ANY($1)
            ORDER BY intent_id
            "#,
        )
        .bind(&names)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(intent_from_row).collect()
    }

    async fn order_for_intent(&self, intent_id: &str) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT order_id, intent_id, broker_order_id, request_hash, cum_qty, target_qty, avg_price
            FROM orders
            WHERE intent_id = $1
            "#,
        )
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|row| order_from_row(&row)).transpose()
    }

    async fn order_by_broker_id(
        &self,
        broker_order_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT order_id, intent_id, broker_order_id, request_hash, cum_qty, target_qty, avg_price
            FROM orders
            WHERE broker_order_id = $1
            "#,
        )
        .bind(broker_order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|row| order_from_row(&row)).transpose()
    }

    async fn fills_for_order(&self, order_id: &str) -> Result<Vec<Fill>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT fill_key, order_id, qty, price, ts
            FROM fills
            WHERE order_id = $1
            ORDER BY fill_key
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                Ok(Fill {
                    fill_key: row.try_get("fill_key").map_err(db_err)?,
                    order_id: row.try_get("order_id").map_err(db_err)?,
                    qty: row.try_get("qty").map_err(db_err)?,
                    price: row.try_get("price").map_err(db_err)?,
                    ts: row.try_get("ts").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn outbox_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, stream, envelope, created_at, published_at
            FROM submission_outbox
            WHERE published_at IS NULL
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                Ok(OutboxRecord {
                    id: row.try_get("id").map_err(db_err)?,
                    stream: row.try_get("stream").map_err(db_err)?,
                    envelope: row.try_get("envelope").map_err(db_err)?,
                    created_at: row.try_get("created_at").map_err(db_err)?,
                    published_at: row.try_get("published_at").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn outbox_mark_published(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE submission_outbox
            SET published_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
