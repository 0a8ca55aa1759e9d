//! Process-wide named locks for get-or-create of shared resources.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

static NAMED_LOCKS: LazyLock<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Acquires the lock for `name`, creating it on first use.
///
/// Two tasks creating the same shared resource (a security group, a
/// resource group) serialise here so only one of them creates it.
pub(crate) async fn lock_named(name: &str) -> OwnedMutexGuard<()> {
    let lock = {
        let mut locks = NAMED_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_owned()).or_default())
    };
    lock.lock_owned().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn same_name_serialises_holders() {
        let first = lock_named("kola-test-sg").await;
        let waiter = tokio::spawn(async { lock_named("kola-test-sg").await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished(), "second holder must wait");
        drop(first);
        assert!(waiter.await.is_ok());
    }

    #[tokio::test]
    async fn different_names_do_not_contend() {
        let _first = lock_named("kola-test-rg-a").await;
        let _second = lock_named("kola-test-rg-b").await;
    }
}
