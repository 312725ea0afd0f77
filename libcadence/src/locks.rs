//! Per-key async locks

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Lazily created async mutex per key (account id).
///
/// Entries are never evicted; the key space is the set of configured accounts.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Handle to the lock for `key`
    pub(crate) fn get(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_shares_lock() {
        let locks = KeyedLocks::new();
        let a = locks.get("acct");
        let b = locks.get("acct");
        let c = locks.get("other");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_lock_excludes_second_holder() {
        let locks = KeyedLocks::new();
        let lock = locks.get("acct");
        let _guard = lock.lock().await;
        assert!(locks.get("acct").try_lock().is_err());
        assert!(locks.get("other").try_lock().is_ok());
    }
}
