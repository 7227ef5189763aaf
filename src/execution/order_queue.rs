use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::models::Order;
use crate::persistence::OrderStore;

/// Capacity of the save queue. Saves beyond it are dropped.
pub const ORDER_SAVE_QUEUE_CAPACITY: usize = 100;

/// Number of workers draining the save queue
pub const ORDER_SAVE_WORKERS: usize = 5;

#[derive(Debug, Clone)]
pub enum SaveJob {
    Create(Order),
    Update(Order),
}

impl SaveJob {
    fn order(&self) -> &Order {
        match self {
            SaveJob::Create(order) | SaveJob::Update(order) => order,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            SaveJob::Create(_) => "create",
            SaveJob::Update(_) => "update",
        }
    }
}

/// Bounded fire-and-forget order persistence
///
/// Exchange state is authoritative, so a full queue drops the save with a
/// warning instead of blocking the caller, and store failures are only logged.
pub struct OrderSaveQueue {
    sender: std::sync::Mutex<Option<mpsc::Sender<SaveJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl OrderSaveQueue {
    /// Spawn the worker pool. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn OrderStore>) -> Self {
        Self::with_capacity(store, ORDER_SAVE_QUEUE_CAPACITY, ORDER_SAVE_WORKERS)
    }

    pub fn with_capacity(store: Arc<dyn OrderStore>, capacity: usize, workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    loop {
                        // Hold the lock only while waiting for the next job
                        let job = { receiver.lock().await.recv().await };
                        let Some(job) = job else {
                            break;
                        };
                        save(store.as_ref(), &job).await;
                    }
                    tracing::debug!(worker, "Order save worker stopped");
                })
            })
            .collect();

        Self {
            sender: std::sync::Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    /// Queue a save without waiting. Returns false when the job was dropped.
    pub fn enqueue(&self, job: SaveJob) -> bool {
        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(sender) = sender else {
            tracing::warn!(
                order_id = %job.order().id,
                kind = job.kind(),
                "Order save queue closed, dropping save"
            );
            return false;
        };

        match sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!(
                    order_id = %job.order().id,
                    symbol = %job.order().symbol,
                    kind = job.kind(),
                    "Order save queue full, dropping save"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                tracing::warn!(
                    order_id = %job.order().id,
                    kind = job.kind(),
                    "Order save queue closed, dropping save"
                );
                false
            }
        }
    }

    /// Close the queue and wait for the workers to drain it
    pub async fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Order save worker panicked: {}", e);
            }
        }
    }
}

async fn save(store: &dyn OrderStore, job: &SaveJob) {
    let result = match job {
        SaveJob::Create(order) => store.create(order).await,
        SaveJob::Update(order) => store.update(order).await,
    };

    match result {
        Ok(()) => tracing::debug!(
            order_id = %job.order().id,
            kind = job.kind(),
            "Persisted order"
        ),
        Err(e) => tracing::error!(
            order_id = %job.order().id,
            symbol = %job.order().symbol,
            kind = job.kind(),
            error = %e,
            "Failed to persist order"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::models::{OrderSide, OrderStatus, OrderType};
    use crate::persistence::InMemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;

    fn order(id: &str) -> Order {
        Order {
            id: id.to_string(),
            client_order_id: None,
            symbol: "NEW_USDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: 1.0,
            executed_qty: 0.0,
            price: 0.5,
            status: OrderStatus::New,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Store that blocks until the test lets it through
    struct GatedStore {
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl OrderStore for GatedStore {
        async fn create(&self, _order: &Order) -> Result<(), StoreError> {
            let _permit = self.gate.acquire().await;
            Ok(())
        }
        async fn update(&self, _order: &Order) -> Result<(), StoreError> {
            Ok(())
        }
        async fn get_by_id(&self, id: &str) -> Result<Order, StoreError> {
            Err(StoreError::NotFound(id.to_string()))
        }
        async fn get_by_symbol(
            &self,
            _symbol: &str,
            _limit: usize,
            _offset: usize,
        ) -> Result<Vec<Order>, StoreError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let store = Arc::new(InMemoryStore::new());
        let queue = OrderSaveQueue::spawn(store.clone());

        for i in 0..10 {
            assert!(queue.enqueue(SaveJob::Create(order(&i.to_string()))));
        }
        queue.shutdown().await;

        assert_eq!(store.order_count(), 10);
        // Closed queue refuses new work
        assert!(!queue.enqueue(SaveJob::Create(order("late"))));
    }

    #[tokio::test]
    async fn test_full_queue_drops_saves() {
        let store = Arc::new(GatedStore {
            gate: tokio::sync::Semaphore::new(0),
        });
        let queue = OrderSaveQueue::with_capacity(store.clone(), 2, 1);

        // First job is picked up by the worker and blocks in the store
        assert!(queue.enqueue(SaveJob::Create(order("0"))));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(queue.enqueue(SaveJob::Create(order("1"))));
        assert!(queue.enqueue(SaveJob::Create(order("2"))));
        assert!(!queue.enqueue(SaveJob::Create(order("3"))));

        store.gate.add_permits(10);
        queue.shutdown().await;
    }
}
