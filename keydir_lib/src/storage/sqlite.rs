/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::path::Path;
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde_json::Value;

use crate::storage::selector::{apply_patch, matches};
use crate::storage::DocStore;

/// SQLite-backed document store.
///
/// Documents are stored as JSON text and selector matching happens in Rust
/// after loading the rows of a type; the directory holds at most one record
/// per key so the working set stays small.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY,
                doc_type TEXT NOT NULL,
                doc TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS documents_by_type ON documents (doc_type)",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn load(conn: &Connection, doc_type: &str) -> Result<Vec<(i64, Value)>, anyhow::Error> {
        let mut stmt = conn.prepare("SELECT id, doc FROM documents WHERE doc_type = ?1")?;
        let rows = stmt.query_map(params![doc_type], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut docs = Vec::new();
        for row in rows {
            let (id, text) = row?;
            docs.push((id, serde_json::from_str(&text)?));
        }
        Ok(docs)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, anyhow::Error> {
        self.conn.lock().map_err(|_| anyhow!("SQLite connection lock poisoned"))
    }
}

#[async_trait]
impl DocStore for SqliteStore {
    async fn create(&self, doc: Value, doc_type: &str) -> Result<u64, anyhow::Error> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO documents (doc_type, doc) VALUES (?1, ?2)",
            params![doc_type, serde_json::to_string(&doc)?],
        )?;
        Ok(inserted as u64)
    }

    async fn get(&self, selector: &Value, doc_type: &str) -> Result<Option<Value>, anyhow::Error> {
        let conn = self.lock()?;
        Ok(Self::load(&conn, doc_type)?
            .into_iter()
            .find(|(_, doc)| matches(selector, doc))
            .map(|(_, doc)| doc))
    }

    async fn update(&self, selector: &Value, patch: &Value, doc_type: &str) -> Result<u64, anyhow::Error> {
        let conn = self.lock()?;
        let target = Self::load(&conn, doc_type)?
            .into_iter()
            .find(|(_, doc)| matches(selector, doc));
        match target {
            Some((id, mut doc)) => {
                apply_patch(&mut doc, patch, selector);
                conn.execute(
                    "UPDATE documents SET doc = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&doc)?, id],
                )?;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn remove(&self, selector: &Value, doc_type: &str) -> Result<u64, anyhow::Error> {
        let conn = self.lock()?;
        let ids: Vec<i64> = Self::load(&conn, doc_type)?
            .into_iter()
            .filter(|(_, doc)| matches(selector, doc))
            .map(|(id, _)| id)
            .collect();
        for id in &ids {
            conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        }
        Ok(ids.len() as u64)
    }
}
