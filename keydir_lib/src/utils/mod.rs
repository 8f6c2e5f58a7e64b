/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

pub mod armor;
pub mod random;

/// Serializes operations per key id.
///
/// The directory performs delete-then-insert upserts and positional updates;
/// holding the guard for the duration of a top-level operation keeps two
/// requests for the same key from interleaving those steps.
#[derive(Debug, Default)]
pub struct KeyedMutex {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedMutex {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::KeyedMutex;

    #[tokio::test]
    async fn independent_keys_do_not_block() {
        let locks = KeyedMutex::default();
        let _a = locks.lock("a").await;
        let _b = locks.lock("b").await;
    }
}
