//! PostgreSQL store
//!
//! Step updates use atomic CAS; multi-record writes run in one transaction.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::{ContributionStore, QueueUpdate, StoreResult};
use crate::contribution::error::ContributionError;
use crate::contribution::step::ContributionStep;
use crate::contribution::types::{
    ContributionId, ContributionInfo, ContributionProcessor, ContributionPublisher,
    ContributionQueue, CredsBatchType, QueueId, QueuePublisher, RecurringTip, ReportType,
    RewardsType, SkuOrder, SkuOrderItem, SkuOrderItemType, SkuOrderStatus, SkuTransaction,
    SkuTransactionStatus, SkuTransactionType, UnblindedToken,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS contribution_queue (
        id BIGSERIAL PRIMARY KEY,
        rewards_type SMALLINT NOT NULL,
        amount NUMERIC(30, 8) NOT NULL,
        partial BOOLEAN NOT NULL DEFAULT FALSE,
        created_at BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS contribution_queue_publishers (
        queue_id BIGINT NOT NULL REFERENCES contribution_queue (id) ON DELETE CASCADE,
        position INT NOT NULL,
        publisher_key TEXT NOT NULL,
        amount_percent NUMERIC(30, 8) NOT NULL,
        PRIMARY KEY (queue_id, position)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS contribution_info (
        contribution_id TEXT PRIMARY KEY,
        amount NUMERIC(30, 8) NOT NULL,
        rewards_type SMALLINT NOT NULL,
        step SMALLINT NOT NULL,
        retry_count INT NOT NULL DEFAULT -1,
        created_at BIGINT NOT NULL,
        processor SMALLINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS contribution_info_publishers (
        contribution_id TEXT NOT NULL REFERENCES contribution_info (contribution_id) ON DELETE CASCADE,
        position INT NOT NULL,
        publisher_key TEXT NOT NULL,
        total_amount NUMERIC(30, 8) NOT NULL,
        contributed_amount NUMERIC(30, 8) NOT NULL DEFAULT 0,
        PRIMARY KEY (contribution_id, publisher_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sku_order (
        order_id TEXT PRIMARY KEY,
        total_amount NUMERIC(30, 8) NOT NULL,
        location TEXT NOT NULL,
        status SMALLINT NOT NULL,
        contribution_id TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sku_order_items (
        order_item_id TEXT PRIMARY KEY,
        order_id TEXT NOT NULL REFERENCES sku_order (order_id) ON DELETE CASCADE,
        sku TEXT NOT NULL,
        quantity INT NOT NULL,
        price NUMERIC(30, 8) NOT NULL,
        item_type SMALLINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sku_transaction (
        transaction_id TEXT PRIMARY KEY,
        order_id TEXT NOT NULL,
        external_transaction_id TEXT NOT NULL DEFAULT '',
        transaction_type SMALLINT NOT NULL,
        amount NUMERIC(30, 8) NOT NULL,
        status SMALLINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS unblinded_tokens (
        token_id BIGSERIAL PRIMARY KEY,
        token_value TEXT NOT NULL UNIQUE,
        public_key TEXT NOT NULL,
        value NUMERIC(30, 8) NOT NULL,
        creds_id TEXT NOT NULL,
        batch_type SMALLINT NOT NULL,
        expires_at BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS recurring_donation (
        publisher_key TEXT PRIMARY KEY,
        amount NUMERIC(30, 8) NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activity_publishers (
        publisher_key TEXT PRIMARY KEY,
        percent NUMERIC(30, 8) NOT NULL,
        excluded BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS balance_report (
        year INT NOT NULL,
        month INT NOT NULL,
        report_type SMALLINT NOT NULL,
        amount NUMERIC(30, 8) NOT NULL DEFAULT 0,
        PRIMARY KEY (year, month, report_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_state (
        key TEXT PRIMARY KEY,
        value BIGINT NOT NULL
    )
    "#,
];

const RECONCILE_STAMP_KEY: &str = "reconcile_stamp";

pub struct PgContributionStore {
    pool: PgPool,
}

impl PgContributionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Create missing tables
    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!(tables = SCHEMA.len(), "Contribution schema ready");
        Ok(())
    }

    async fn insert_queue(
        tx: &mut Transaction<'_, Postgres>,
        queue: &ContributionQueue,
    ) -> StoreResult<QueueId> {
        let id = if queue.id == 0 {
            sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO contribution_queue (rewards_type, amount, partial, created_at)
                VALUES ($1, $2, $3, $4)
                RETURNING id
                "#,
            )
            .bind(queue.rewards_type.id())
            .bind(queue.amount)
            .bind(queue.partial)
            .bind(queue.created_at)
            .fetch_one(&mut **tx)
            .await?
        } else {
            sqlx::query(
                r#"
                INSERT INTO contribution_queue (id, rewards_type, amount, partial, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE
                SET rewards_type = EXCLUDED.rewards_type,
                    amount = EXCLUDED.amount,
                    partial = EXCLUDED.partial
                "#,
            )
            .bind(queue.id as i64)
            .bind(queue.rewards_type.id())
            .bind(queue.amount)
            .bind(queue.partial)
            .bind(queue.created_at)
            .execute(&mut **tx)
            .await?;
            queue.id as i64
        };

        sqlx::query("DELETE FROM contribution_queue_publishers WHERE queue_id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;

        for (position, publisher) in queue.publishers.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO contribution_queue_publishers (queue_id, position, publisher_key, amount_percent)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(id)
            .bind(position as i32)
            .bind(&publisher.publisher_key)
            .bind(publisher.amount_percent)
            .execute(&mut **tx)
            .await?;
        }

        Ok(id as QueueId)
    }

    async fn insert_contribution(
        tx: &mut Transaction<'_, Postgres>,
        info: &ContributionInfo,
    ) -> StoreResult<()> {
        let id = info.contribution_id.to_string();
        sqlx::query(
            r#"
            INSERT INTO contribution_info
                (contribution_id, amount, rewards_type, step, retry_count, created_at, processor)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (contribution_id) DO UPDATE
            SET amount = EXCLUDED.amount,
                step = EXCLUDED.step,
                retry_count = EXCLUDED.retry_count,
                processor = EXCLUDED.processor
            "#,
        )
        .bind(&id)
        .bind(info.amount)
        .bind(info.rewards_type.id())
        .bind(info.step.id())
        .bind(info.retry_count)
        .bind(info.created_at)
        .bind(info.processor.id())
        .execute(&mut **tx)
        .await?;

        sqlx::query("DELETE FROM contribution_info_publishers WHERE contribution_id = $1")
            .bind(&id)
            .execute(&mut **tx)
            .await?;

        for (position, publisher) in info.publishers.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO contribution_info_publishers
                    (contribution_id, position, publisher_key, total_amount, contributed_amount)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&id)
            .bind(position as i32)
            .bind(&publisher.publisher_key)
            .bind(publisher.total_amount)
            .bind(publisher.contributed_amount)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn load_contribution(&self, row: &PgRow) -> StoreResult<ContributionInfo> {
        let mut info = row_to_contribution(row)?;
        let rows = sqlx::query(
            r#"
            SELECT publisher_key, total_amount, contributed_amount
            FROM contribution_info_publishers
            WHERE contribution_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(info.contribution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        info.publishers = rows
            .iter()
            .map(|r| ContributionPublisher {
                contribution_id: info.contribution_id,
                publisher_key: r.get("publisher_key"),
                total_amount: r.get("total_amount"),
                contributed_amount: r.get("contributed_amount"),
            })
            .collect();
        Ok(info)
    }

    async fn load_order(&self, row: &PgRow) -> StoreResult<SkuOrder> {
        let order_id: String = row.get("order_id");
        let status_id: i16 = row.get("status");
        let contribution_id: Option<String> = row.get("contribution_id");

        let item_rows = sqlx::query(
            r#"
            SELECT order_item_id, order_id, sku, quantity, price, item_type
            FROM sku_order_items
            WHERE order_id = $1
            ORDER BY order_item_id ASC
            "#,
        )
        .bind(&order_id)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(item_rows.len());
        for r in &item_rows {
            let item_type_id: i16 = r.get("item_type");
            items.push(SkuOrderItem {
                order_item_id: r.get("order_item_id"),
                order_id: r.get("order_id"),
                sku: r.get("sku"),
                quantity: r.get::<i32, _>("quantity").max(0) as u32,
                price: r.get("price"),
                item_type: SkuOrderItemType::from_id(item_type_id).ok_or_else(|| {
                    ContributionError::Corrupted(format!("item type {}", item_type_id))
                })?,
            });
        }

        Ok(SkuOrder {
            status: SkuOrderStatus::from_id(status_id).ok_or_else(|| {
                ContributionError::Corrupted(format!("order {} status {}", order_id, status_id))
            })?,
            contribution_id: contribution_id
                .map(|id| parse_contribution_id(&id))
                .transpose()?,
            total_amount: row.get("total_amount"),
            location: row.get("location"),
            items,
            order_id,
        })
    }
}

fn parse_contribution_id(id: &str) -> StoreResult<ContributionId> {
    id.parse()
        .map_err(|_| ContributionError::Corrupted(format!("contribution id {}", id)))
}

fn row_to_contribution(row: &PgRow) -> StoreResult<ContributionInfo> {
    let id: String = row.get("contribution_id");
    let contribution_id = parse_contribution_id(&id)?;

    let step_id: i16 = row.get("step");
    let step = ContributionStep::from_id(step_id)
        .ok_or_else(|| ContributionError::Corrupted(format!("{} step {}", id, step_id)))?;

    let type_id: i16 = row.get("rewards_type");
    let rewards_type = RewardsType::from_id(type_id)
        .ok_or_else(|| ContributionError::Corrupted(format!("{} rewards type {}", id, type_id)))?;

    let processor_id: i16 = row.get("processor");
    let processor = ContributionProcessor::from_id(processor_id)
        .ok_or_else(|| ContributionError::Corrupted(format!("{} processor {}", id, processor_id)))?;

    Ok(ContributionInfo {
        contribution_id,
        amount: row.get("amount"),
        rewards_type,
        step,
        retry_count: row.get("retry_count"),
        created_at: row.get("created_at"),
        processor,
        publishers: Vec::new(),
    })
}

fn row_to_transaction(row: &PgRow) -> StoreResult<SkuTransaction> {
    let type_id: i16 = row.get("transaction_type");
    let status_id: i16 = row.get("status");
    Ok(SkuTransaction {
        transaction_id: row.get("transaction_id"),
        order_id: row.get("order_id"),
        external_transaction_id: row.get("external_transaction_id"),
        transaction_type: SkuTransactionType::from_id(type_id).ok_or_else(|| {
            ContributionError::Corrupted(format!("transaction type {}", type_id))
        })?,
        amount: row.get("amount"),
        status: SkuTransactionStatus::from_id(status_id).ok_or_else(|| {
            ContributionError::Corrupted(format!("transaction status {}", status_id))
        })?,
    })
}

fn row_to_token(row: &PgRow) -> StoreResult<UnblindedToken> {
    let batch_id: i16 = row.get("batch_type");
    Ok(UnblindedToken {
        token_id: row.get::<i64, _>("token_id") as u64,
        token_value: row.get("token_value"),
        public_key: row.get("public_key"),
        value: row.get("value"),
        creds_id: row.get("creds_id"),
        batch_type: CredsBatchType::from_id(batch_id)
            .ok_or_else(|| ContributionError::Corrupted(format!("batch type {}", batch_id)))?,
        expires_at: row.get("expires_at"),
    })
}

const CONTRIBUTION_COLUMNS: &str =
    "contribution_id, amount, rewards_type, step, retry_count, created_at, processor";

#[async_trait]
impl ContributionStore for PgContributionStore {
    async fn save_contribution_queue(&self, queue: &ContributionQueue) -> StoreResult<QueueId> {
        let mut tx = self.pool.begin().await?;
        let id = Self::insert_queue(&mut tx, queue).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn get_first_contribution_queue(&self) -> StoreResult<Option<ContributionQueue>> {
        let row = sqlx::query(
            r#"
            SELECT id, rewards_type, amount, partial, created_at
            FROM contribution_queue
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: i64 = row.get("id");
        let type_id: i16 = row.get("rewards_type");
        let rewards_type = RewardsType::from_id(type_id).ok_or_else(|| {
            ContributionError::Corrupted(format!("queue {} rewards type {}", id, type_id))
        })?;

        let publishers = sqlx::query(
            r#"
            SELECT publisher_key, amount_percent
            FROM contribution_queue_publishers
            WHERE queue_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| QueuePublisher {
            publisher_key: r.get("publisher_key"),
            amount_percent: r.get("amount_percent"),
        })
        .collect();

        Ok(Some(ContributionQueue {
            id: id as QueueId,
            rewards_type,
            amount: row.get("amount"),
            partial: row.get("partial"),
            publishers,
            created_at: row.get("created_at"),
        }))
    }

    async fn delete_contribution_queue(&self, id: QueueId) -> StoreResult<()> {
        sqlx::query("DELETE FROM contribution_queue WHERE id = $1")
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_contribution_info(&self, info: &ContributionInfo) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_contribution(&mut tx, info).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_contribution_and_queue(
        &self,
        info: &ContributionInfo,
        queue: &QueueUpdate,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_contribution(&mut tx, info).await?;
        match queue {
            QueueUpdate::Save(entry) => {
                Self::insert_queue(&mut tx, entry).await?;
            }
            QueueUpdate::Delete(id) => {
                sqlx::query("DELETE FROM contribution_queue WHERE id = $1")
                    .bind(*id as i64)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_contribution_info(
        &self,
        id: ContributionId,
    ) -> StoreResult<Option<ContributionInfo>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM contribution_info WHERE contribution_id = $1",
            CONTRIBUTION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.load_contribution(&row).await?)),
            None => Ok(None),
        }
    }

    async fn update_contribution_info_step(
        &self,
        id: ContributionId,
        expected: ContributionStep,
        new: ContributionStep,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE contribution_info
            SET step = $1
            WHERE contribution_id = $2 AND step = $3
            "#,
        )
        .bind(new.id())
        .bind(id.to_string())
        .bind(expected.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_contribution_retry_count(
        &self,
        id: ContributionId,
        expected: ContributionStep,
        retry_count: i32,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE contribution_info
            SET retry_count = $1
            WHERE contribution_id = $2 AND step = $3
            "#,
        )
        .bind(retry_count)
        .bind(id.to_string())
        .bind(expected.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_contribution_info_step_and_count(
        &self,
        id: ContributionId,
        step: ContributionStep,
        retry_count: i32,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE contribution_info
            SET step = $1, retry_count = $2
            WHERE contribution_id = $3
            "#,
        )
        .bind(step.id())
        .bind(retry_count)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ContributionError::NotFound(format!("contribution {}", id)));
        }
        Ok(())
    }

    async fn record_publisher_redemption(
        &self,
        id: ContributionId,
        publisher_key: &str,
        contributed_amount: Decimal,
        spent_token_ids: &[u64],
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE contribution_info_publishers
            SET contributed_amount = $1
            WHERE contribution_id = $2 AND publisher_key = $3
            "#,
        )
        .bind(contributed_amount)
        .bind(id.to_string())
        .bind(publisher_key)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ContributionError::NotFound(format!(
                "publisher {} of {}",
                publisher_key, id
            )));
        }

        let ids: Vec<i64> = spent_token_ids.iter().map(|id| *id as i64).collect();
        sqlx::query("DELETE FROM unblinded_tokens WHERE token_id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_not_completed_contributions(
        &self,
        limit: usize,
    ) -> StoreResult<Vec<ContributionInfo>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM contribution_info
            WHERE step NOT IN ($1, $2, $3, $4)
            ORDER BY created_at ASC, contribution_id ASC
            LIMIT $5
            "#,
            CONTRIBUTION_COLUMNS
        ))
        .bind(ContributionStep::Completed.id())
        .bind(ContributionStep::Failed.id())
        .bind(ContributionStep::NotEnoughFunds.id())
        .bind(ContributionStep::AcTableEmpty.id())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut contributions = Vec::with_capacity(rows.len());
        for row in &rows {
            contributions.push(self.load_contribution(row).await?);
        }
        Ok(contributions)
    }

    async fn save_sku_order(&self, order: &SkuOrder) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sku_order (order_id, total_amount, location, status, contribution_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (order_id) DO UPDATE
            SET total_amount = EXCLUDED.total_amount,
                location = EXCLUDED.location,
                status = EXCLUDED.status,
                contribution_id = EXCLUDED.contribution_id
            "#,
        )
        .bind(&order.order_id)
        .bind(order.total_amount)
        .bind(&order.location)
        .bind(order.status as i16)
        .bind(order.contribution_id.map(|id| id.to_string()))
        .execute(&mut *tx)
        .await?;

        for item in &order.items {
            sqlx::query(
                r#"
                INSERT INTO sku_order_items (order_item_id, order_id, sku, quantity, price, item_type)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (order_item_id) DO NOTHING
                "#,
            )
            .bind(&item.order_item_id)
            .bind(&order.order_id)
            .bind(&item.sku)
            .bind(item.quantity as i32)
            .bind(item.price)
            .bind(item.item_type.id())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_sku_order_status(
        &self,
        order_id: &str,
        status: SkuOrderStatus,
    ) -> StoreResult<()> {
        let result = sqlx::query("UPDATE sku_order SET status = $1 WHERE order_id = $2")
            .bind(status as i16)
            .bind(order_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ContributionError::NotFound(format!("order {}", order_id)));
        }
        Ok(())
    }

    async fn get_sku_order(&self, order_id: &str) -> StoreResult<Option<SkuOrder>> {
        let row = sqlx::query(
            r#"
            SELECT order_id, total_amount, location, status, contribution_id
            FROM sku_order
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.load_order(&row).await?)),
            None => Ok(None),
        }
    }

    async fn get_sku_order_by_contribution_id(
        &self,
        id: ContributionId,
    ) -> StoreResult<Option<SkuOrder>> {
        let row = sqlx::query(
            r#"
            SELECT order_id, total_amount, location, status, contribution_id
            FROM sku_order
            WHERE contribution_id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.load_order(&row).await?)),
            None => Ok(None),
        }
    }

    async fn save_sku_transaction(&self, transaction: &SkuTransaction) -> StoreResult<()> {
        if transaction.transaction_id.is_empty() {
            return Err(ContributionError::InvalidRequest(
                "transaction id is empty".to_string(),
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO sku_transaction
                (transaction_id, order_id, external_transaction_id, transaction_type, amount, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (transaction_id) DO NOTHING
            "#,
        )
        .bind(&transaction.transaction_id)
        .bind(&transaction.order_id)
        .bind(&transaction.external_transaction_id)
        .bind(transaction.transaction_type as i16)
        .bind(transaction.amount)
        .bind(transaction.status as i16)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_external_transaction(
        &self,
        transaction_id: &str,
        external_transaction_id: &str,
    ) -> StoreResult<()> {
        if transaction_id.is_empty() || external_transaction_id.is_empty() {
            return Err(ContributionError::InvalidRequest(
                "transaction id or external transaction id is empty".to_string(),
            ));
        }

        let result = sqlx::query(
            r#"
            UPDATE sku_transaction
            SET external_transaction_id = $1, status = $2
            WHERE transaction_id = $3 AND status = $4
            "#,
        )
        .bind(external_transaction_id)
        .bind(SkuTransactionStatus::Completed as i16)
        .bind(transaction_id)
        .bind(SkuTransactionStatus::Pending as i16)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Already completed: same id is a repeat, anything else is a conflict
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT external_transaction_id FROM sku_transaction WHERE transaction_id = $1",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(existing) if existing == external_transaction_id => Ok(()),
            Some(_) => Err(ContributionError::InvalidStateTransition(format!(
                "transaction {} already completed",
                transaction_id
            ))),
            None => Err(ContributionError::NotFound(format!(
                "transaction {}",
                transaction_id
            ))),
        }
    }

    async fn get_sku_transaction_by_order_id(
        &self,
        order_id: &str,
    ) -> StoreResult<Option<SkuTransaction>> {
        let row = sqlx::query(
            r#"
            SELECT transaction_id, order_id, external_transaction_id, transaction_type, amount, status
            FROM sku_transaction
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_transaction).transpose()
    }

    async fn save_unblinded_tokens(&self, tokens: &[UnblindedToken]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for token in tokens {
            sqlx::query(
                r#"
                INSERT INTO unblinded_tokens
                    (token_value, public_key, value, creds_id, batch_type, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (token_value) DO NOTHING
                "#,
            )
            .bind(&token.token_value)
            .bind(&token.public_key)
            .bind(token.value)
            .bind(&token.creds_id)
            .bind(token.batch_type.id())
            .bind(token.expires_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_all_unblinded_tokens(&self) -> StoreResult<Vec<UnblindedToken>> {
        let rows = sqlx::query(
            r#"
            SELECT token_id, token_value, public_key, value, creds_id, batch_type, expires_at
            FROM unblinded_tokens
            ORDER BY token_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_token).collect()
    }

    async fn delete_unblinded_tokens(&self, ids: &[u64]) -> StoreResult<()> {
        let ids: Vec<i64> = ids.iter().map(|id| *id as i64).collect();
        sqlx::query("DELETE FROM unblinded_tokens WHERE token_id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_recurring_tips(&self) -> StoreResult<Vec<RecurringTip>> {
        let rows = sqlx::query(
            "SELECT publisher_key, amount FROM recurring_donation ORDER BY publisher_key ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| RecurringTip {
                publisher_key: r.get("publisher_key"),
                amount: r.get("amount"),
            })
            .collect())
    }

    async fn get_ac_publishers(&self) -> StoreResult<Vec<QueuePublisher>> {
        let rows = sqlx::query(
            r#"
            SELECT publisher_key, percent
            FROM activity_publishers
            WHERE excluded = FALSE AND percent > 0
            ORDER BY percent DESC, publisher_key ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| QueuePublisher {
                publisher_key: r.get("publisher_key"),
                amount_percent: r.get("percent"),
            })
            .collect())
    }

    async fn get_reconcile_stamp(&self) -> StoreResult<i64> {
        let stamp: Option<i64> =
            sqlx::query_scalar("SELECT value FROM ledger_state WHERE key = $1")
                .bind(RECONCILE_STAMP_KEY)
                .fetch_optional(&self.pool)
                .await?;
        Ok(stamp.unwrap_or(0))
    }

    async fn set_reconcile_stamp(&self, stamp: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_state (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(RECONCILE_STAMP_KEY)
        .bind(stamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_balance_report_item(
        &self,
        year: i32,
        month: u32,
        report_type: ReportType,
        amount: Decimal,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO balance_report (year, month, report_type, amount)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (year, month, report_type)
            DO UPDATE SET amount = balance_report.amount + EXCLUDED.amount
            "#,
        )
        .bind(year)
        .bind(month as i32)
        .bind(report_type as i16)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
