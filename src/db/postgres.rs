use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    Order, OrderSide, OrderStatus, OrderType, Position, PositionSide, PositionStatus,
};
use crate::persistence::{OrderStore, PositionStore};

/// Postgres persistence for orders and positions
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to Postgres and run pending migrations
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {}", e)))?;

        tracing::info!("Connected to Postgres at {}", redact_url(database_url));

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_position(&self, position: &Position) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, symbol, side, status, entry_price, quantity, current_price,
                stop_loss, take_profit, pnl, pnl_percent, exit_price,
                opened_at, closed_at, exit_order_ids, take_profit_order_id, stop_loss_order_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                current_price = EXCLUDED.current_price,
                stop_loss = EXCLUDED.stop_loss,
                take_profit = EXCLUDED.take_profit,
                pnl = EXCLUDED.pnl,
                pnl_percent = EXCLUDED.pnl_percent,
                exit_price = EXCLUDED.exit_price,
                closed_at = EXCLUDED.closed_at,
                exit_order_ids = EXCLUDED.exit_order_ids,
                take_profit_order_id = EXCLUDED.take_profit_order_id,
                stop_loss_order_id = EXCLUDED.stop_loss_order_id,
                updated_at = NOW()
            WHERE positions.status = 'open'
            "#,
        )
        .bind(position.id)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position_status_str(position.status))
        .bind(position.entry_price)
        .bind(position.quantity)
        .bind(position.current_price)
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.pnl)
        .bind(position.pnl_percent)
        .bind(position.exit_price)
        .bind(position.opened_at)
        .bind(position.closed_at)
        .bind(&position.exit_order_ids)
        .bind(&position.take_profit_order_id)
        .bind(&position.stop_loss_order_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Hide the password part of a connection URL in logs
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

fn position_status_str(status: PositionStatus) -> &'static str {
    match status {
        PositionStatus::Open => "open",
        PositionStatus::Closed => "closed",
    }
}

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    let side: String = row.get("side");
    let order_type: String = row.get("order_type");
    let status: String = row.get("status");

    let side = match side.as_str() {
        "BUY" => OrderSide::Buy,
        "SELL" => OrderSide::Sell,
        other => return Err(StoreError::Invalid(format!("unknown order side: {}", other))),
    };
    let order_type = match order_type.as_str() {
        "MARKET" => OrderType::Market,
        "LIMIT" => OrderType::Limit,
        "STOP_LOSS" => OrderType::StopLoss,
        other => return Err(StoreError::Invalid(format!("unknown order type: {}", other))),
    };
    let status = OrderStatus::parse(&status)
        .ok_or_else(|| StoreError::Invalid(format!("unknown order status: {}", status)))?;

    Ok(Order {
        id: row.get("id"),
        client_order_id: row.get("client_order_id"),
        symbol: row.get("symbol"),
        side,
        order_type,
        quantity: row.get("quantity"),
        executed_qty: row.get("executed_qty"),
        price: row.get("price"),
        status,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn position_from_row(row: &PgRow) -> Result<Position, StoreError> {
    let side: String = row.get("side");
    let status: String = row.get("status");

    let side = match side.as_str() {
        "long" => PositionSide::Long,
        "short" => PositionSide::Short,
        other => return Err(StoreError::Invalid(format!("unknown position side: {}", other))),
    };
    let status = match status.as_str() {
        "open" => PositionStatus::Open,
        "closed" => PositionStatus::Closed,
        other => return Err(StoreError::Invalid(format!("unknown position status: {}", other))),
    };
    let closed_at: Option<DateTime<Utc>> = row.get("closed_at");

    Ok(Position {
        id: row.get("id"),
        symbol: row.get("symbol"),
        side,
        status,
        entry_price: row.get("entry_price"),
        quantity: row.get("quantity"),
        current_price: row.get("current_price"),
        stop_loss: row.get("stop_loss"),
        take_profit: row.get("take_profit"),
        pnl: row.get("pnl"),
        pnl_percent: row.get("pnl_percent"),
        exit_price: row.get("exit_price"),
        opened_at: row.get("opened_at"),
        closed_at,
        exit_order_ids: row.get("exit_order_ids"),
        take_profit_order_id: row.get("take_profit_order_id"),
        stop_loss_order_id: row.get("stop_loss_order_id"),
    })
}

const ORDER_COLUMNS: &str = "id, client_order_id, symbol, side, order_type, quantity, \
     executed_qty, price, status, created_at, updated_at";

const POSITION_COLUMNS: &str = "id, symbol, side, status, entry_price, quantity, current_price, \
     stop_loss, take_profit, pnl, pnl_percent, exit_price, opened_at, closed_at, exit_order_ids, \
     take_profit_order_id, stop_loss_order_id";

#[async_trait]
impl OrderStore for PostgresStore {
    async fn create(&self, order: &Order) -> Result<(), StoreError> {
        if order.id.is_empty() {
            return Err(StoreError::Invalid("order id is empty".to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO orders (
                id, client_order_id, symbol, side, order_type, quantity,
                executed_qty, price, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                executed_qty = LEAST(EXCLUDED.executed_qty, orders.quantity),
                price = EXCLUDED.price,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            WHERE orders.status = EXCLUDED.status
                OR (
                    orders.status IN ('NEW', 'PARTIALLY_FILLED')
                    AND (CASE EXCLUDED.status WHEN 'NEW' THEN 0 WHEN 'PARTIALLY_FILLED' THEN 1 ELSE 2 END)
                      > (CASE orders.status WHEN 'NEW' THEN 0 WHEN 'PARTIALLY_FILLED' THEN 1 ELSE 2 END)
                )
            "#,
        )
        .bind(&order.id)
        .bind(&order.client_order_id)
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(order.order_type.as_str())
        .bind(order.quantity)
        .bind(order.clamped_executed_qty())
        .bind(order.price)
        .bind(order.status.as_str())
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, order: &Order) -> Result<(), StoreError> {
        OrderStore::create(self, order).await
    }

    async fn get_by_id(&self, id: &str) -> Result<Order, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("order {}", id)))?;

        order_from_row(&row)
    }

    async fn get_by_symbol(
        &self,
        symbol: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE symbol = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            ORDER_COLUMNS
        ))
        .bind(symbol)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }
}

#[async_trait]
impl PositionStore for PostgresStore {
    async fn create(&self, position: &Position) -> Result<(), StoreError> {
        self.upsert_position(position).await
    }

    async fn save(&self, position: &Position) -> Result<Position, StoreError> {
        // The upsert skips rows that are already closed
        self.upsert_position(position).await?;
        PositionStore::get_by_id(self, position.id).await
    }

    async fn list_open(&self) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM positions WHERE status = 'open' ORDER BY opened_at ASC",
            POSITION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(position_from_row).collect()
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Position, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM positions WHERE id = $1", POSITION_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("position {}", id)))?;

        position_from_row(&row)
    }

    async fn update_price(&self, id: Uuid, price: f64) -> Result<Position, StoreError> {
        let mut position = PositionStore::get_by_id(self, id).await?;
        position.update_current_price(price);

        sqlx::query(
            r#"
            UPDATE positions
            SET current_price = $2, pnl = $3, pnl_percent = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(position.current_price)
        .bind(position.pnl)
        .bind(position.pnl_percent)
        .execute(&self.pool)
        .await?;

        Ok(position)
    }

    async fn close(
        &self,
        id: Uuid,
        exit_price: f64,
        exit_order_ids: Vec<String>,
    ) -> Result<Position, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM positions WHERE id = $1 FOR UPDATE",
            POSITION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("position {}", id)))?;
        let mut position = position_from_row(&row)?;

        if !position.is_open() {
            return Ok(position);
        }
        if exit_order_ids.is_empty() {
            return Err(StoreError::Invalid(
                "closing a position requires at least one exit order id".to_string(),
            ));
        }

        position.close(exit_price, exit_order_ids);

        sqlx::query(
            r#"
            UPDATE positions
            SET status = $2, current_price = $3, pnl = $4, pnl_percent = $5,
                exit_price = $6, closed_at = $7, exit_order_ids = $8,
                take_profit_order_id = NULL, stop_loss_order_id = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(position_status_str(position.status))
        .bind(position.current_price)
        .bind(position.pnl)
        .bind(position.pnl_percent)
        .bind(position.exit_price)
        .bind(position.closed_at)
        .bind(&position.exit_order_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            "Closed position {} ({}) at {} with P&L {:.4}",
            position.id,
            position.symbol,
            exit_price,
            position.pnl
        );
        Ok(position)
    }
}
