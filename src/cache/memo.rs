//! Keyed single-flight memoization
//!
//! Deduplicates concurrent idempotent probes (service fingerprinting and
//! similar) by key and caches their results for the table's lifetime.
//! Callers recover values by type; a mismatch fails with `data-missing`.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use crate::error::{ErrorClass, ErrorX, Result};

type MemoValue = Arc<dyn Any + Send + Sync>;

/// Process-scoped single-flight table. Thread it through constructors so
/// tests can substitute a fresh one.
#[derive(Default)]
pub struct Memoizer {
    cells: Mutex<HashMap<String, Arc<OnceCell<MemoValue>>>>,
}

impl Memoizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached result for `key`, running `compute` if absent.
    /// Concurrent callers with the same key share one computation; a
    /// failed computation is not cached and later callers retry.
    pub async fn memoize<T, F, Fut>(&self, key: &str, compute: F) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cell = {
            let mut cells = self.cells.lock().await;
            Arc::clone(cells.entry(key.to_string()).or_default())
        };

        let value = cell
            .get_or_try_init(|| async {
                compute()
                    .await
                    .map(|v| Arc::new(v) as MemoValue)
            })
            .await?;

        value.downcast_ref::<T>().cloned().ok_or_else(|| {
            ErrorX::with_class(
                ErrorClass::DataMissing,
                format!("could not convert cached result for key {key}"),
            )
        })
    }

    /// Drops the cached value for a key so the next call recomputes.
    pub async fn invalidate(&self, key: &str) {
        self.cells.lock().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_calls_share_one_computation() {
        let memo = Arc::new(Memoizer::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let memo = Arc::clone(&memo);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                memo.memoize("isMySQL:db.example:3306", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    Ok(true)
                })
                .await
            }));
        }
        for handle in handles {
            assert!(handle.await.expect("join").expect("memoize"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn type_mismatch_is_data_missing() {
        let memo = Memoizer::new();
        memo.memoize("fingerprint:h:80", || async { Ok("banner".to_string()) })
            .await
            .expect("first call");
        let err = memo
            .memoize::<bool, _, _>("fingerprint:h:80", || async { Ok(true) })
            .await
            .expect_err("type mismatch must fail");
        assert!(err.is_class(ErrorClass::DataMissing));
    }

    #[tokio::test]
    async fn invalidate_forces_recompute() {
        let memo = Memoizer::new();
        let first = memo
            .memoize("k", || async { Ok(1u32) })
            .await
            .expect("first");
        memo.invalidate("k").await;
        let second = memo
            .memoize("k", || async { Ok(2u32) })
            .await
            .expect("second");
        assert_eq!((first, second), (1, 2));
    }
}
