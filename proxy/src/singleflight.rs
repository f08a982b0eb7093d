use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Coalesces concurrent executions of the same keyed operation.
///
/// Callers that arrive while a flight for `key` is in progress await that
/// flight's result instead of starting their own. The entry lives only as
/// long as the computation: once a result has been handed out, the next
/// caller starts a fresh flight.
pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        SingleFlight {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run<F, Fut>(&self, key: K, work: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = self
            .inflight
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let value = cell.get_or_init(work).await.clone();

        // Retire this flight, but only if a newer one hasn't replaced it.
        let mut inflight = self.inflight.lock();
        if let Some(current) = inflight.get(&key)
            && Arc::ptr_eq(current, &cell)
        {
            inflight.remove(&key);
        }

        value
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        SingleFlight::new()
    }
}
