/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::Value;

pub mod memory;
pub mod selector;
pub mod sqlite;

/// Document type under which key records are filed.
pub const DB_TYPE: &str = "publickey";

/// Document-oriented persistence contract of the directory.
///
/// Selectors and patches use the syntax implemented in [`selector`]. The
/// directory treats a `create` that does not report exactly one inserted
/// document as fatal.
#[async_trait]
pub trait DocStore: Send + Sync + Debug {
    /// Inserts a document, returning the inserted count.
    async fn create(&self, doc: Value, doc_type: &str) -> Result<u64, anyhow::Error>;

    /// Returns the first document matching the selector, if any.
    async fn get(&self, selector: &Value, doc_type: &str) -> Result<Option<Value>, anyhow::Error>;

    /// Applies the patch to the first matching document, returning the
    /// number of documents updated.
    async fn update(&self, selector: &Value, patch: &Value, doc_type: &str) -> Result<u64, anyhow::Error>;

    /// Removes all matching documents, returning the removed count.
    async fn remove(&self, selector: &Value, doc_type: &str) -> Result<u64, anyhow::Error>;
}
