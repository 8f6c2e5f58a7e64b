/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! The key lifecycle state machine and merge engine.
//!
//! Orchestrates upload, email verification, pending-signature confirmation
//! and removal over the storage and mailer ports. Mutating operations
//! serialize per key id; mails are sent before anything is persisted so a
//! failed or cancelled request never leaves a stored nonce that was never
//! communicated.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::warn;

use crate::directory::records::{KeyRecord, KeyView, PendingSigInfo, PendingSignatures, UserIdRecord, UserIdStatus};
use crate::errors::DirectoryError;
use crate::mailer::{Mailer, Recipient};
use crate::pgp;
use crate::pgp::ParsedKey;
use crate::storage::{DocStore, DB_TYPE};
use crate::types::{is_fingerprint, is_key_id, is_nonce, Email, Origin};
use crate::utils::random::verification_nonce;
use crate::utils::KeyedMutex;
use crate::PublicKeyConfig;

pub mod merge;
pub mod records;

/// Placeholder for certifications whose issuer key is not in the directory.
const UNKNOWN_IDENTITY: &str = "[unknown identity]";
/// Map key for certifications over user attribute packets.
const USER_ATTRIBUTE: &str = "[user attribute]";

#[derive(Debug)]
pub struct PutRequest {
    pub public_key_armored: String,
    /// Optional filter restricting which user ids of the key are considered.
    pub emails: Vec<String>,
    pub origin: Origin,
}

/// Lookup predicate: any given field may match (see [`KeyDirectory::get_verified`]).
#[derive(Debug, Default, Clone)]
pub struct LookupQuery {
    pub key_id: Option<String>,
    pub fingerprint: Option<String>,
    pub email: Option<String>,
}

impl LookupQuery {
    /// Validates and normalizes raw query input.
    pub fn parse(
        key_id: Option<&str>,
        fingerprint: Option<&str>,
        email: Option<&str>,
    ) -> Result<Self, DirectoryError> {
        let query = LookupQuery {
            key_id: key_id.map(checked_key_id).transpose()?,
            fingerprint: fingerprint.map(checked_fingerprint).transpose()?,
            email: email.map(checked_email).transpose()?,
        };
        if query.key_id.is_none() && query.fingerprint.is_none() && query.email.is_none() {
            return Err(DirectoryError::InvalidRequest(
                "Provide a key id, fingerprint or email address".to_string(),
            ));
        }
        Ok(query)
    }

    fn for_key_id(key_id: &str) -> Self {
        LookupQuery {
            key_id: Some(key_id.to_string()),
            ..LookupQuery::default()
        }
    }

    fn for_fingerprint(fingerprint: &str) -> Self {
        LookupQuery {
            fingerprint: Some(fingerprint.to_string()),
            ..LookupQuery::default()
        }
    }
}

fn checked_key_id(input: &str) -> Result<String, DirectoryError> {
    let value = input.trim().to_lowercase();
    if is_key_id(&value) {
        Ok(value)
    } else {
        Err(DirectoryError::InvalidRequest(format!("Malformed key id: {}", input)))
    }
}

fn checked_fingerprint(input: &str) -> Result<String, DirectoryError> {
    let value = input.trim().to_lowercase();
    if is_fingerprint(&value) {
        Ok(value)
    } else {
        Err(DirectoryError::InvalidRequest(format!(
            "Malformed fingerprint: {}",
            input
        )))
    }
}

fn checked_nonce(input: &str) -> Result<String, DirectoryError> {
    let value = input.trim().to_lowercase();
    if is_nonce(&value) {
        Ok(value)
    } else {
        Err(DirectoryError::InvalidRequest(format!("Malformed nonce: {}", input)))
    }
}

fn checked_email(input: &str) -> Result<String, DirectoryError> {
    Email::parse(input)
        .map(|e| e.get_email())
        .map_err(|e| DirectoryError::InvalidRequest(e.to_string()))
}

#[derive(Debug)]
pub struct KeyDirectory {
    store: Arc<dyn DocStore>,
    mailer: Arc<dyn Mailer>,
    config: PublicKeyConfig,
    locks: KeyedMutex,
}

impl KeyDirectory {
    pub fn new(store: Arc<dyn DocStore>, mailer: Arc<dyn Mailer>, config: PublicKeyConfig) -> Self {
        Self {
            store,
            mailer,
            config,
            locks: KeyedMutex::default(),
        }
    }

    /// Accepts an uploaded key: parses it, merges it with any existing
    /// verified record of the same key id and challenges every user id that
    /// still needs verification.
    #[tracing::instrument(skip(self, request))]
    pub async fn put(&self, request: PutRequest) -> Result<(), DirectoryError> {
        if let Err(e) = self.purge_unverified().await {
            warn!("purging aged unverified keys failed: {:?}", e);
        }

        let parsed = pgp::parse_key(&request.public_key_armored, &self.config)?;
        if self.config.restrict_user_origin && !parsed.has_organisation_uid {
            return Err(DirectoryError::NoOrganisationUid);
        }

        let mut user_ids = parsed.user_ids.clone();
        if !request.emails.is_empty() {
            let requested: Vec<String> = request
                .emails
                .iter()
                .map(|e| checked_email(e))
                .collect::<Result<_, _>>()?;
            user_ids.retain(|uid| requested.contains(&uid.email));
            if user_ids.len() != requested.len() {
                return Err(DirectoryError::UserIdMismatch);
            }
        }

        let _guard = self.locks.lock(&parsed.key_id).await;
        match self.get_verified(&LookupQuery::for_key_id(&parsed.key_id)).await? {
            None => self.put_new(parsed, user_ids, &request.origin).await,
            Some(existing) => self.put_merge(parsed, user_ids, existing, &request.origin).await,
        }
    }

    /// Case A: no verified record with this key id exists yet.
    async fn put_new(
        &self,
        parsed: ParsedKey,
        mut user_ids: Vec<UserIdRecord>,
        origin: &Origin,
    ) -> Result<(), DirectoryError> {
        user_ids.retain(|uid| uid.status == UserIdStatus::Valid);
        if user_ids.is_empty() {
            return Err(DirectoryError::NoValidUserIds);
        }
        for uid in &mut user_ids {
            let email_set: HashSet<String> = [uid.email.clone()].into_iter().collect();
            uid.public_key_armored = Some(pgp::filter_by_user_ids(&email_set, &parsed.public_key_armored)?);
            uid.notify = !self.config.restrict_user_origin || self.config.is_organisation_email(&uid.email);
        }

        // A different key with the same low 64 fingerprint bits is rejected,
        // never silently replaced.
        if let Some(stored) = self.store.get(&json!({ "keyId": parsed.key_id.as_str() }), DB_TYPE).await? {
            let stored: KeyRecord = serde_json::from_value(stored)?;
            if stored.fingerprint != parsed.fingerprint {
                return Err(DirectoryError::InvalidRequest(
                    "A different key with this key id already exists".to_string(),
                ));
            }
        }

        let mut record = KeyRecord {
            key_id: parsed.key_id,
            fingerprint: parsed.fingerprint,
            user_ids,
            created: parsed.created,
            uploaded: Utc::now(),
            algorithm: parsed.algorithm,
            key_size: parsed.key_size,
            public_key_armored: None,
            pending_signatures: None,
        };
        self.dispatch_challenges(&mut record, origin).await?;
        self.persist(record).await
    }

    /// Case B: merge the upload into the existing verified record.
    async fn put_merge(
        &self,
        parsed: ParsedKey,
        user_ids: Vec<UserIdRecord>,
        existing: KeyRecord,
        origin: &Origin,
    ) -> Result<(), DirectoryError> {
        if existing.fingerprint != parsed.fingerprint {
            return Err(DirectoryError::InvalidRequest(
                "A different key with this key id already exists".to_string(),
            ));
        }
        let existing_armored = existing
            .public_key_armored
            .as_deref()
            .ok_or_else(|| DirectoryError::internal(anyhow!("Verified record without armored body")))?;

        let merged_users = merge::merge_user_ids(&existing.user_ids, user_ids, &parsed.public_key_armored, &self.config)?;

        let verified_emails: HashSet<String> = merged_users
            .iter()
            .filter(|u| u.verified)
            .map(|u| u.email.clone())
            .collect();
        let filtered_armored = pgp::filter_by_user_ids(&verified_emails, &parsed.public_key_armored)?;
        let (cleaned_armored, new_sigs) = pgp::filter_by_signatures(&filtered_armored, existing_armored)?;
        let merged_armored = pgp::update_key(existing_armored, &cleaned_armored)?;

        let pending_signatures = match existing.pending_signatures {
            None if new_sigs.is_empty() => None,
            None => Some(PendingSignatures {
                nonce: verification_nonce(),
                sigs: new_sigs.clone(),
            }),
            Some(mut batch) => {
                for sig in &new_sigs {
                    if !batch.sigs.iter().any(|known| known.signature == sig.signature) {
                        batch.sigs.push(sig.clone());
                    }
                }
                Some(batch)
            }
        };

        let mut record = KeyRecord {
            key_id: parsed.key_id,
            fingerprint: parsed.fingerprint,
            user_ids: merged_users,
            created: parsed.created,
            uploaded: Utc::now(),
            algorithm: parsed.algorithm,
            key_size: parsed.key_size,
            public_key_armored: Some(merged_armored),
            pending_signatures,
        };
        self.dispatch_challenges(&mut record, origin).await?;

        if !new_sigs.is_empty() {
            let armored = record.public_key_armored.as_deref().unwrap_or(existing_armored);
            let primary = pgp::get_primary_user(armored)?;
            let nonce = record
                .pending_signatures
                .as_ref()
                .map(|batch| batch.nonce.clone())
                .ok_or_else(|| DirectoryError::internal(anyhow!("New signatures without a pending batch")))?;
            self.mailer
                .send_check_new_sigs(
                    &Recipient {
                        name: primary.name,
                        email: primary.email,
                    },
                    &record.key_id,
                    &nonce,
                    origin,
                )
                .await
                .map_err(DirectoryError::internal)?;
        }

        self.persist(record).await
    }

    /// Generates a nonce and mails a challenge for every notify-flagged
    /// user id. The nonce is stored on the record only after the mail was
    /// accepted.
    async fn dispatch_challenges(&self, record: &mut KeyRecord, origin: &Origin) -> Result<(), DirectoryError> {
        let key_id = record.key_id.clone();
        for uid in record.user_ids.iter_mut().filter(|uid| uid.notify) {
            let nonce = verification_nonce();
            let recipient = Recipient {
                name: uid.name.clone(),
                email: uid.email.clone(),
            };
            let shadow = uid.public_key_armored.as_deref().unwrap_or_default();
            self.mailer
                .send_verify_key(&recipient, &key_id, &nonce, origin, shadow)
                .await
                .map_err(DirectoryError::internal)?;
            uid.nonce = Some(nonce);
            uid.notify = false;
        }
        Ok(())
    }

    /// Upserts a record by key id (delete then insert).
    async fn persist(&self, record: KeyRecord) -> Result<(), DirectoryError> {
        self.store.remove(&json!({ "keyId": record.key_id.as_str() }), DB_TYPE).await?;
        let inserted = self.store.create(serde_json::to_value(&record)?, DB_TYPE).await?;
        if inserted != 1 {
            return Err(DirectoryError::PersistFailed(format!(
                "Expected 1 inserted document, got {}",
                inserted
            )));
        }
        Ok(())
    }

    /// Returns the record matching any of the query predicates, provided it
    /// has at least one verified user id.
    #[tracing::instrument(skip(self))]
    pub async fn get_verified(&self, query: &LookupQuery) -> Result<Option<KeyRecord>, DirectoryError> {
        let verified_uid = json!({ "$elemMatch": { "verified": true } });
        let mut alternatives = Vec::new();
        if let Some(fingerprint) = &query.fingerprint {
            alternatives.push(json!({ "fingerprint": fingerprint, "userIds": verified_uid.clone() }));
        }
        if let Some(key_id) = &query.key_id {
            alternatives.push(json!({ "keyId": key_id, "userIds": verified_uid }));
        }
        if let Some(email) = &query.email {
            alternatives.push(json!({ "userIds": { "$elemMatch": { "email": email, "verified": true } } }));
        }
        if alternatives.is_empty() {
            return Err(DirectoryError::InvalidRequest(
                "Provide a key id, fingerprint or email address".to_string(),
            ));
        }
        let selector = json!({ "$or": alternatives });
        match self.store.get(&selector, DB_TYPE).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    /// Completes an ownership challenge: publishes the user id's shadow
    /// body into the record and enforces that at most one verified user id
    /// exists per email across the directory (last verified wins).
    #[tracing::instrument(skip(self))]
    pub async fn verify(&self, key_id: &str, nonce: &str) -> Result<String, DirectoryError> {
        let key_id = checked_key_id(key_id)?;
        let nonce = checked_nonce(nonce)?;
        let _guard = self.locks.lock(&key_id).await;

        let selector = json!({ "keyId": key_id.as_str(), "userIds": { "$elemMatch": { "nonce": nonce.as_str() } } });
        let record: KeyRecord = match self.store.get(&selector, DB_TYPE).await? {
            Some(doc) => serde_json::from_value(doc)?,
            None => return Err(DirectoryError::UserIdNotFound),
        };
        let uid = record
            .user_ids
            .iter()
            .find(|uid| uid.nonce.as_deref() == Some(nonce.as_str()))
            .ok_or(DirectoryError::UserIdNotFound)?;
        let shadow = uid
            .public_key_armored
            .as_deref()
            .ok_or_else(|| DirectoryError::internal(anyhow!("Unverified user id without shadow body")))?;
        let new_armored = match record.public_key_armored.as_deref() {
            Some(existing) => pgp::update_key(existing, shadow)?,
            None => shadow.to_string(),
        };

        // Any other key claiming this email loses its record.
        self.store
            .remove(
                &json!({
                    "keyId": { "$ne": record.key_id.as_str() },
                    "userIds": { "$elemMatch": { "email": uid.email.as_str() } },
                }),
                DB_TYPE,
            )
            .await?;

        let patch = json!({
            "publicKeyArmored": new_armored,
            "userIds.$.verified": true,
            "userIds.$.nonce": null,
            "userIds.$.publicKeyArmored": null,
        });
        let updated = self.store.update(&selector, &patch, DB_TYPE).await?;
        if updated != 1 {
            return Err(DirectoryError::PersistFailed(
                "Verified user id could not be stored".to_string(),
            ));
        }
        Ok(uid.email.clone())
    }

    /// Publishes the pending certifications selected by their display hash
    /// and discards the rest of the batch.
    #[tracing::instrument(skip(self, sigs))]
    pub async fn verify_signatures(
        &self,
        key_id: &str,
        nonce: &str,
        sigs: &[String],
    ) -> Result<String, DirectoryError> {
        let key_id = checked_key_id(key_id)?;
        let nonce = checked_nonce(nonce)?;
        let _guard = self.locks.lock(&key_id).await;

        let selector = json!({ "keyId": key_id.as_str(), "pendingSignatures.nonce": nonce.as_str() });
        let record: KeyRecord = match self.store.get(&selector, DB_TYPE).await? {
            Some(doc) => serde_json::from_value(doc)?,
            None => return Err(DirectoryError::SignaturesNotFound),
        };
        let batch = record.pending_signatures.ok_or(DirectoryError::SignaturesNotFound)?;
        let mut armored = record
            .public_key_armored
            .ok_or_else(|| DirectoryError::internal(anyhow!("Pending signatures on an unpublished key")))?;

        let selected: HashSet<String> = sigs.iter().map(|hash| hash.trim().to_lowercase()).collect();
        for sig in &batch.sigs {
            if selected.contains(&sig.selection_hash()) {
                let reattached = pgp::add_signature(&armored, sig)?;
                armored = pgp::update_key(&armored, &reattached)?;
            }
        }

        let patch = json!({ "publicKeyArmored": armored.as_str(), "pendingSignatures": null });
        let updated = self.store.update(&selector, &patch, DB_TYPE).await?;
        if updated != 1 {
            return Err(DirectoryError::PersistFailed(
                "Confirmed signatures could not be stored".to_string(),
            ));
        }
        Ok(pgp::get_primary_user(&armored)?.email)
    }

    /// Pending certifications for the confirmation page, grouped by the
    /// certified user id, with issuers resolved against the directory.
    #[tracing::instrument(skip(self))]
    pub async fn get_pending_signatures(
        &self,
        query: &LookupQuery,
        nonce: &str,
    ) -> Result<BTreeMap<String, Vec<PendingSigInfo>>, DirectoryError> {
        let nonce = checked_nonce(nonce)?;
        let record = self.get_verified(query).await?.ok_or(DirectoryError::KeyNotFound)?;
        let batch = match record.pending_signatures {
            Some(batch) if batch.nonce == nonce => batch,
            _ => return Err(DirectoryError::InvalidNonce),
        };

        let mut by_user: BTreeMap<String, Vec<PendingSigInfo>> = BTreeMap::new();
        for sig in &batch.sigs {
            let details = pgp::parse_signature_details(&sig.signature)?;
            let issuer = match &details.issuer_fingerprint {
                Some(fingerprint) => self.resolve_issuer(fingerprint).await?,
                None => UNKNOWN_IDENTITY.to_string(),
            };
            let signed_user = sig
                .user
                .user_id
                .clone()
                .unwrap_or_else(|| USER_ATTRIBUTE.to_string());
            by_user.entry(signed_user).or_default().push(PendingSigInfo {
                issuer_fingerprint: details.issuer_fingerprint,
                created: details.created,
                user_id: issuer,
                hash: sig.selection_hash(),
            });
        }
        Ok(by_user)
    }

    /// Primary user of the issuer's verified key, if the issuer is known to
    /// the directory.
    async fn resolve_issuer(&self, fingerprint: &str) -> Result<String, DirectoryError> {
        let issuer_record = match self.get_verified(&LookupQuery::for_fingerprint(fingerprint)).await? {
            Some(record) => record,
            None => return Ok(UNKNOWN_IDENTITY.to_string()),
        };
        let armored = match issuer_record.public_key_armored {
            Some(armored) => armored,
            None => return Ok(UNKNOWN_IDENTITY.to_string()),
        };
        let primary = pgp::get_primary_user(&armored)?;
        Ok(if primary.name.is_empty() {
            primary.email
        } else {
            format!("{} <{}>", primary.name, primary.email)
        })
    }

    /// Flags user ids for removal and mails a confirmation link per flagged
    /// user id.
    #[tracing::instrument(skip(self))]
    pub async fn request_remove(&self, query: &LookupQuery, origin: &Origin) -> Result<(), DirectoryError> {
        let selector = if let Some(key_id) = &query.key_id {
            json!({ "keyId": key_id })
        } else if let Some(email) = &query.email {
            json!({ "userIds": { "$elemMatch": { "email": email } } })
        } else {
            return Err(DirectoryError::InvalidRequest(
                "Provide a key id or email address".to_string(),
            ));
        };
        let record: KeyRecord = match self.store.get(&selector, DB_TYPE).await? {
            Some(doc) => serde_json::from_value(doc)?,
            None => return Err(DirectoryError::KeyNotFound),
        };
        let _guard = self.locks.lock(&record.key_id).await;

        for uid in &record.user_ids {
            if let Some(email) = &query.email {
                if &uid.email != email {
                    continue;
                }
            }
            let nonce = verification_nonce();
            let recipient = Recipient {
                name: uid.name.clone(),
                email: uid.email.clone(),
            };
            self.mailer
                .send_verify_remove(&recipient, &record.key_id, &nonce, origin)
                .await
                .map_err(DirectoryError::internal)?;
            let uid_selector = json!({
                "keyId": record.key_id.as_str(),
                "userIds": { "$elemMatch": { "email": uid.email.as_str() } },
            });
            let updated = self
                .store
                .update(&uid_selector, &json!({ "userIds.$.nonce": nonce }), DB_TYPE)
                .await?;
            if updated != 1 {
                return Err(DirectoryError::PersistFailed(
                    "Removal nonce could not be stored".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Completes a removal challenge. Removing the last user id deletes the
    /// record; removing the last verified user id unpublishes the armored
    /// body.
    #[tracing::instrument(skip(self))]
    pub async fn verify_remove(&self, key_id: &str, nonce: &str) -> Result<String, DirectoryError> {
        let key_id = checked_key_id(key_id)?;
        let nonce = checked_nonce(nonce)?;
        let _guard = self.locks.lock(&key_id).await;

        let selector = json!({ "keyId": key_id.as_str(), "userIds": { "$elemMatch": { "nonce": nonce.as_str() } } });
        let mut record: KeyRecord = match self.store.get(&selector, DB_TYPE).await? {
            Some(doc) => serde_json::from_value(doc)?,
            None => return Err(DirectoryError::UserIdNotFound),
        };
        let index = record
            .user_ids
            .iter()
            .position(|uid| uid.nonce.as_deref() == Some(nonce.as_str()))
            .ok_or(DirectoryError::UserIdNotFound)?;

        if record.user_ids.len() == 1 {
            self.store.remove(&json!({ "keyId": record.key_id.as_str() }), DB_TYPE).await?;
            return Ok(record.user_ids[0].email.clone());
        }

        let removed = record.user_ids.remove(index);
        if removed.verified {
            let remaining_verified = record.user_ids.iter().filter(|uid| uid.verified).count();
            record.public_key_armored = if remaining_verified >= 1 {
                let armored = record
                    .public_key_armored
                    .as_deref()
                    .ok_or_else(|| DirectoryError::internal(anyhow!("Verified user id without armored body")))?;
                Some(pgp::remove_user_id(&removed.email, armored)?)
            } else {
                None
            };
        }
        self.persist(record).await?;
        Ok(removed.email)
    }

    /// Sanitized lookup for clients.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, query: &LookupQuery) -> Result<KeyView, DirectoryError> {
        let record = self.get_verified(query).await?.ok_or(DirectoryError::KeyNotFound)?;
        Ok(KeyView::from(&record))
    }

    /// Drops records that never completed any verification within the purge
    /// horizon. Invoked opportunistically from `put`.
    async fn purge_unverified(&self) -> Result<u64, DirectoryError> {
        let horizon = Utc::now() - Duration::days(self.config.purge_time_in_days);
        let selector: Value = json!({
            "userIds.verified": { "$ne": true },
            "uploaded": { "$lt": horizon.timestamp() },
        });
        Ok(self.store.remove(&selector, DB_TYPE).await?)
    }
}
