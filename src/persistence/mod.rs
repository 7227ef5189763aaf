// Order and position storage contracts
pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Order, Position};

pub use memory::InMemoryStore;

/// Durable order persistence
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn create(&self, order: &Order) -> Result<(), StoreError>;

    async fn update(&self, order: &Order) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: &str) -> Result<Order, StoreError>;

    /// Orders of one symbol, newest first
    async fn get_by_symbol(
        &self,
        symbol: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Order>, StoreError>;
}

/// Position persistence used by the sniper hand-off and the position monitor
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn create(&self, position: &Position) -> Result<(), StoreError>;

    /// Insert or overwrite an open position and return what is stored.
    /// A stored closed position is returned unchanged.
    async fn save(&self, position: &Position) -> Result<Position, StoreError>;

    async fn list_open(&self) -> Result<Vec<Position>, StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Position, StoreError>;

    /// Record the latest market price and return the updated position
    async fn update_price(&self, id: Uuid, price: f64) -> Result<Position, StoreError>;

    /// Close the position. Already closed positions are returned unchanged.
    async fn close(
        &self,
        id: Uuid,
        exit_price: f64,
        exit_order_ids: Vec<String>,
    ) -> Result<Position, StoreError>;
}
