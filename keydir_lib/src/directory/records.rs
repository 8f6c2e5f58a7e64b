/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parse-time state of a user id, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserIdStatus {
    #[default]
    Valid,
    Revoked,
    Expired,
    Invalid,
}

/// One key record per primary key fingerprint.
///
/// Serialized field names are the document fields the storage selectors
/// address; timestamps serialize as epoch seconds so age comparisons stay
/// numeric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    pub key_id: String,
    pub fingerprint: String,
    pub user_ids: Vec<UserIdRecord>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub uploaded: DateTime<Utc>,
    pub algorithm: String,
    pub key_size: usize,
    /// Canonical armored body holding exactly the verified user ids; null
    /// while no user id has been verified yet.
    pub public_key_armored: Option<String>,
    #[serde(default)]
    pub pending_signatures: Option<PendingSignatures>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdRecord {
    #[serde(default)]
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub verified: bool,
    /// Present iff the user id is unverified with a live challenge.
    #[serde(default)]
    pub nonce: Option<String>,
    /// Shadow armored body containing only this user id, held while the
    /// user id is unverified.
    #[serde(default)]
    pub public_key_armored: Option<String>,
    #[serde(skip)]
    pub status: UserIdStatus,
    #[serde(skip)]
    pub notify: bool,
}

/// Third-party certifications stripped from an upload, awaiting owner
/// confirmation. One nonce covers the whole batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSignatures {
    pub nonce: String,
    pub sigs: Vec<PendingSig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSig {
    pub user: SigUser,
    /// Base64 encoding of the framed signature packet.
    pub signature: String,
}

impl PendingSig {
    /// Display hash the confirmation UI round-trips to select signatures.
    pub fn selection_hash(&self) -> String {
        format!("{:x}", md5::compute(self.signature.as_bytes()))
    }
}

/// The certified component: a userid string, or a user attribute (base64).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigUser {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_attribute: Option<String>,
}

/// One pending certification as shown on the confirmation page.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSigInfo {
    pub issuer_fingerprint: Option<String>,
    pub created: Option<DateTime<Utc>>,
    /// Primary user of the issuer's verified key, or `"[unknown identity]"`.
    pub user_id: String,
    pub hash: String,
}

/// Sanitized lookup result: no `_id`, no per-uid nonces or shadow bodies,
/// no pending-signature nonce.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyView {
    pub key_id: String,
    pub fingerprint: String,
    pub user_ids: Vec<UserIdView>,
    pub created: DateTime<Utc>,
    pub uploaded: DateTime<Utc>,
    pub algorithm: String,
    pub key_size: usize,
    pub public_key_armored: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_signatures: Option<Vec<PendingSig>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdView {
    pub name: String,
    pub email: String,
    pub verified: bool,
}

impl From<&KeyRecord> for KeyView {
    fn from(record: &KeyRecord) -> Self {
        KeyView {
            key_id: record.key_id.clone(),
            fingerprint: record.fingerprint.clone(),
            user_ids: record
                .user_ids
                .iter()
                .map(|uid| UserIdView {
                    name: uid.name.clone(),
                    email: uid.email.clone(),
                    verified: uid.verified,
                })
                .collect(),
            created: record.created,
            uploaded: record.uploaded,
            algorithm: record.algorithm.clone(),
            key_size: record.key_size,
            public_key_armored: record.public_key_armored.clone(),
            pending_signatures: record.pending_signatures.as_ref().map(|batch| batch.sigs.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_fields_are_not_persisted() {
        let uid = UserIdRecord {
            name: "Alice".to_string(),
            email: "alice@example.org".to_string(),
            verified: false,
            nonce: Some("aa".repeat(16)),
            public_key_armored: None,
            status: UserIdStatus::Revoked,
            notify: true,
        };
        let value = serde_json::to_value(&uid).unwrap();
        assert!(value.get("status").is_none());
        assert!(value.get("notify").is_none());

        let restored: UserIdRecord = serde_json::from_value(value).unwrap();
        assert_eq!(restored.status, UserIdStatus::Valid);
        assert!(!restored.notify);
        assert_eq!(restored.nonce, uid.nonce);
    }

    #[test]
    fn selection_hash_is_md5_of_base64() {
        let sig = PendingSig {
            user: SigUser {
                user_id: Some("Alice <alice@example.org>".to_string()),
                user_attribute: None,
            },
            signature: base64::encode(b"signature packet bytes"),
        };
        assert_eq!(sig.selection_hash(), format!("{:x}", md5::compute(sig.signature.as_bytes())));
        assert_eq!(sig.selection_hash().len(), 32);
    }
}
