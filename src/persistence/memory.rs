use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::{OrderStore, PositionStore};
use crate::error::StoreError;
use crate::models::{Order, Position};

/// In-memory order and position store
///
/// Used when no database is configured and as the store behind the test
/// suite. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    orders: DashMap<String, Order>,
    positions: DashMap<Uuid, Position>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    /// Snapshot of every stored position, open or closed
    pub fn positions(&self) -> Vec<Position> {
        self.positions.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn create(&self, order: &Order) -> Result<(), StoreError> {
        if order.id.is_empty() {
            return Err(StoreError::Invalid("order id is empty".to_string()));
        }
        let mut incoming = order.clone();
        incoming.executed_qty = order.clamped_executed_qty();

        match self.orders.entry(order.id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().status.can_advance_to(incoming.status) {
                    entry.insert(incoming);
                } else {
                    tracing::debug!(
                        order_id = %order.id,
                        "Ignoring stale write: {:?} -> {:?}",
                        entry.get().status,
                        incoming.status
                    );
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(incoming);
            }
        }
        Ok(())
    }

    async fn update(&self, order: &Order) -> Result<(), StoreError> {
        // Updates may race ahead of the create; both paths upsert
        OrderStore::create(self, order).await
    }

    async fn get_by_id(&self, id: &str) -> Result<Order, StoreError> {
        self.orders
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("order {}", id)))
    }

    async fn get_by_symbol(
        &self,
        symbol: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| entry.symbol == symbol)
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(orders.into_iter().skip(offset).take(limit).collect())
    }
}

#[async_trait]
impl PositionStore for InMemoryStore {
    async fn create(&self, position: &Position) -> Result<(), StoreError> {
        self.positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn save(&self, position: &Position) -> Result<Position, StoreError> {
        match self.positions.entry(position.id) {
            Entry::Occupied(entry) if !entry.get().is_open() => Ok(entry.get().clone()),
            Entry::Occupied(mut entry) => {
                entry.insert(position.clone());
                Ok(position.clone())
            }
            Entry::Vacant(entry) => {
                entry.insert(position.clone());
                Ok(position.clone())
            }
        }
    }

    async fn list_open(&self) -> Result<Vec<Position>, StoreError> {
        let mut open: Vec<Position> = self
            .positions
            .iter()
            .filter(|entry| entry.is_open())
            .map(|entry| entry.value().clone())
            .collect();
        open.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        Ok(open)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Position, StoreError> {
        self.positions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("position {}", id)))
    }

    async fn update_price(&self, id: Uuid, price: f64) -> Result<Position, StoreError> {
        let mut entry = self
            .positions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("position {}", id)))?;
        entry.update_current_price(price);
        Ok(entry.value().clone())
    }

    async fn close(
        &self,
        id: Uuid,
        exit_price: f64,
        exit_order_ids: Vec<String>,
    ) -> Result<Position, StoreError> {
        let mut entry = self
            .positions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("position {}", id)))?;

        if !entry.is_open() {
            return Ok(entry.value().clone());
        }
        if exit_order_ids.is_empty() {
            return Err(StoreError::Invalid(
                "closing a position requires at least one exit order id".to_string(),
            ));
        }

        entry.close(exit_price, exit_order_ids);
        Ok(entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderSide, OrderStatus, OrderType, PositionStatus};
    use chrono::{Duration, Utc};

    fn order(id: &str, symbol: &str, age_secs: i64) -> Order {
        let created_at = Utc::now() - Duration::seconds(age_secs);
        Order {
            id: id.to_string(),
            client_order_id: None,
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: 1.0,
            executed_qty: 0.0,
            price: 1.0,
            status: OrderStatus::New,
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn test_orders_by_symbol_newest_first() {
        let store = InMemoryStore::new();
        OrderStore::create(&store, &order("1", "NEW_USDT", 30)).await.unwrap();
        OrderStore::create(&store, &order("2", "NEW_USDT", 10)).await.unwrap();
        OrderStore::create(&store, &order("3", "NEW_USDT", 20)).await.unwrap();
        OrderStore::create(&store, &order("4", "BTC_USDT", 0)).await.unwrap();

        let page = store.get_by_symbol("NEW_USDT", 2, 0).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);

        let page = store.get_by_symbol("NEW_USDT", 2, 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "1");
    }

    #[tokio::test]
    async fn test_update_replaces_order() {
        let store = InMemoryStore::new();
        let mut stored = order("42", "NEW_USDT", 0);
        OrderStore::create(&store, &stored).await.unwrap();

        stored.status = OrderStatus::Filled;
        stored.executed_qty = 1.0;
        store.update(&stored).await.unwrap();

        let loaded = OrderStore::get_by_id(&store, "42").await.unwrap();
        assert_eq!(loaded.status, OrderStatus::Filled);
        assert!(matches!(
            OrderStore::get_by_id(&store, "missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_status_does_not_overwrite() {
        let store = InMemoryStore::new();
        let mut filled = order("7", "NEW_USDT", 0);
        filled.status = OrderStatus::Filled;
        filled.executed_qty = 1.0;

        // The fill lands before the placement record
        OrderStore::create(&store, &filled).await.unwrap();
        OrderStore::create(&store, &order("7", "NEW_USDT", 0)).await.unwrap();

        let loaded = OrderStore::get_by_id(&store, "7").await.unwrap();
        assert_eq!(loaded.status, OrderStatus::Filled);
        assert_eq!(loaded.executed_qty, 1.0);

        let mut canceled = filled.clone();
        canceled.status = OrderStatus::Canceled;
        store.update(&canceled).await.unwrap();
        let loaded = OrderStore::get_by_id(&store, "7").await.unwrap();
        assert_eq!(loaded.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_executed_qty_is_capped() {
        let store = InMemoryStore::new();
        let mut partial = order("8", "NEW_USDT", 0);
        partial.status = OrderStatus::PartiallyFilled;
        partial.executed_qty = 3.5;
        OrderStore::create(&store, &partial).await.unwrap();

        let loaded = OrderStore::get_by_id(&store, "8").await.unwrap();
        assert_eq!(loaded.executed_qty, 1.0);
    }

    #[tokio::test]
    async fn test_save_leaves_closed_positions_alone() {
        let store = InMemoryStore::new();
        let mut position =
            Position::new_long("BTC_USDT", 10000.0, 0.1, Some(9000.0), None).unwrap();
        position.attach_exit_order(crate::models::ExitReason::TakeProfit, "tp-1");
        store.save(&position).await.unwrap();
        assert_eq!(
            PositionStore::get_by_id(&store, position.id)
                .await
                .unwrap()
                .take_profit_order_id
                .as_deref(),
            Some("tp-1")
        );

        let closed = store
            .close(position.id, 11000.0, vec!["tp-1".to_string()])
            .await
            .unwrap();
        let saved = store.save(&position).await.unwrap();
        assert_eq!(saved, closed);
        assert!(store.list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_position_lifecycle() {
        let store = InMemoryStore::new();
        let position = Position::new_long("BTC_USDT", 10000.0, 0.1, Some(9000.0), None).unwrap();
        PositionStore::create(&store, &position).await.unwrap();

        let err = store.close(position.id, 8900.0, vec![]).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));

        let closed = store
            .close(position.id, 8900.0, vec!["exit-1".to_string()])
            .await
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert!((closed.pnl + 110.0).abs() < 1e-9);
        assert!(store.list_open().await.unwrap().is_empty());

        // Closing again returns the closed position unchanged
        let again = store
            .close(position.id, 5000.0, vec!["exit-2".to_string()])
            .await
            .unwrap();
        assert_eq!(again, closed);
    }

    #[tokio::test]
    async fn test_update_price_recomputes_pnl() {
        let store = InMemoryStore::new();
        let position = Position::new_short("ETH_USDT", 2500.0, 2.0, None, Some(2000.0)).unwrap();
        PositionStore::create(&store, &position).await.unwrap();

        let updated = store.update_price(position.id, 2400.0).await.unwrap();
        assert_eq!(updated.current_price, 2400.0);
        assert!((updated.pnl - 200.0).abs() < 1e-9);
        assert!((updated.pnl_percent - 4.0).abs() < 1e-9);

        assert!(matches!(
            store.update_price(Uuid::new_v4(), 1.0).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
