/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::storage::selector::{apply_patch, matches};
use crate::storage::DocStore;

/// In-memory document store for tests and mail-less development setups.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<Vec<(String, Value)>>,
}

#[async_trait]
impl DocStore for MemoryStore {
    async fn create(&self, doc: Value, doc_type: &str) -> Result<u64, anyhow::Error> {
        self.docs.write().await.push((doc_type.to_string(), doc));
        Ok(1)
    }

    async fn get(&self, selector: &Value, doc_type: &str) -> Result<Option<Value>, anyhow::Error> {
        let docs = self.docs.read().await;
        Ok(docs
            .iter()
            .find(|(t, doc)| t == doc_type && matches(selector, doc))
            .map(|(_, doc)| doc.clone()))
    }

    async fn update(&self, selector: &Value, patch: &Value, doc_type: &str) -> Result<u64, anyhow::Error> {
        let mut docs = self.docs.write().await;
        match docs
            .iter_mut()
            .find(|(t, doc)| t == doc_type && matches(selector, doc))
        {
            Some((_, doc)) => {
                apply_patch(doc, patch, selector);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn remove(&self, selector: &Value, doc_type: &str) -> Result<u64, anyhow::Error> {
        let mut docs = self.docs.write().await;
        let before = docs.len();
        docs.retain(|(t, doc)| t != doc_type || !matches(selector, doc));
        Ok((before - docs.len()) as u64)
    }
}
