/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! End-to-end scenarios over the in-memory store and a recording mailer.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use keydir_lib::directory::{KeyDirectory, LookupQuery, PutRequest};
use keydir_lib::errors::DirectoryError;
use keydir_lib::mailer::{Mailer, Recipient};
use keydir_lib::storage::memory::MemoryStore;
use keydir_lib::storage::{DocStore, DB_TYPE};
use keydir_lib::types::Origin;
use keydir_lib::utils::armor::export_armored_cert;
use keydir_lib::utils::armor::single_cert_from_armor;
use keydir_lib::PublicKeyConfig;
use sequoia_openpgp::cert::{Cert, CertBuilder};
use sequoia_openpgp::types::SignatureType;
use sequoia_openpgp::Packet;
use serde_json::json;

#[derive(Debug, Clone)]
struct SentMail {
    template: &'static str,
    email: String,
    key_id: String,
    nonce: String,
}

#[derive(Debug, Default)]
struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
}

impl RecordingMailer {
    fn record(&self, template: &'static str, recipient: &Recipient, key_id: &str, nonce: &str) {
        self.sent.lock().unwrap().push(SentMail {
            template,
            email: recipient.email.clone(),
            key_id: key_id.to_string(),
            nonce: nonce.to_string(),
        });
    }

    fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }

    fn count(&self, template: &str) -> usize {
        self.sent().iter().filter(|mail| mail.template == template).count()
    }

    fn last_for(&self, template: &str, email: &str) -> Option<SentMail> {
        self.sent()
            .into_iter()
            .rev()
            .find(|mail| mail.template == template && mail.email == email)
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_verify_key(
        &self,
        recipient: &Recipient,
        key_id: &str,
        nonce: &str,
        _origin: &Origin,
        public_key_armored: &str,
    ) -> Result<(), anyhow::Error> {
        assert!(public_key_armored.contains("BEGIN PGP PUBLIC KEY BLOCK"));
        self.record("verifyKey", recipient, key_id, nonce);
        Ok(())
    }

    async fn send_verify_remove(
        &self,
        recipient: &Recipient,
        key_id: &str,
        nonce: &str,
        _origin: &Origin,
    ) -> Result<(), anyhow::Error> {
        self.record("verifyRemove", recipient, key_id, nonce);
        Ok(())
    }

    async fn send_check_new_sigs(
        &self,
        recipient: &Recipient,
        key_id: &str,
        nonce: &str,
        _origin: &Origin,
    ) -> Result<(), anyhow::Error> {
        self.record("checkNewSigs", recipient, key_id, nonce);
        Ok(())
    }
}

fn setup() -> (KeyDirectory, Arc<MemoryStore>, Arc<RecordingMailer>) {
    setup_with(PublicKeyConfig::default())
}

fn setup_with(config: PublicKeyConfig) -> (KeyDirectory, Arc<MemoryStore>, Arc<RecordingMailer>) {
    let store = Arc::new(MemoryStore::default());
    let mailer = Arc::new(RecordingMailer::default());
    let directory = KeyDirectory::new(store.clone(), mailer.clone(), config);
    (directory, store, mailer)
}

fn origin() -> Origin {
    Origin::from_url("http://localhost:8889").unwrap()
}

fn generate(uids: &[&str]) -> (Cert, String) {
    let mut builder = CertBuilder::general_purpose(None, Some(uids[0]));
    for uid in &uids[1..] {
        builder = builder.add_userid(*uid);
    }
    let (cert, _revocation) = builder.generate().unwrap();
    let armored = export_armored_cert(&cert).unwrap();
    (cert, armored)
}

fn certify(target: &Cert, signer: &Cert, uid: &str) -> String {
    let mut keypair = signer
        .primary_key()
        .key()
        .clone()
        .parts_into_secret()
        .unwrap()
        .into_keypair()
        .unwrap();
    let uida = target
        .userids()
        .find(|u| u.userid().value() == uid.as_bytes())
        .unwrap();
    let sig = uida
        .userid()
        .certify(&mut keypair, target, SignatureType::GenericCertification, None, None)
        .unwrap();
    let certified = target.clone().insert_packets(vec![Packet::from(sig)]).unwrap();
    export_armored_cert(&certified).unwrap()
}

fn emails_of(armored: &str) -> Vec<String> {
    let cert = single_cert_from_armor(armored).unwrap();
    let mut emails: Vec<String> = cert
        .userids()
        .filter_map(|u| u.userid().email_normalized().ok().flatten())
        .collect();
    emails.sort();
    emails
}

fn certification_count(armored: &str) -> usize {
    let cert = single_cert_from_armor(armored).unwrap();
    cert.userids().map(|u| u.certifications().count()).sum()
}

async fn put(directory: &KeyDirectory, armored: &str) {
    directory
        .put(PutRequest {
            public_key_armored: armored.to_string(),
            emails: vec![],
            origin: origin(),
        })
        .await
        .unwrap();
}

fn email_query(email: &str) -> LookupQuery {
    LookupQuery::parse(None, None, Some(email)).unwrap()
}

/// Uploads a key and completes the ownership challenge for one email.
async fn put_and_verify(directory: &KeyDirectory, mailer: &RecordingMailer, armored: &str, email: &str) -> String {
    put(directory, armored).await;
    let mail = mailer.last_for("verifyKey", email).unwrap();
    let verified = directory.verify(&mail.key_id, &mail.nonce).await.unwrap();
    assert_eq!(verified, email);
    mail.key_id
}

#[tokio::test]
async fn fresh_upload_stores_unpublished_record_and_challenges_owner() {
    let (directory, store, mailer) = setup();
    let (_, armored) = generate(&["Alice <alice@example.org>"]);

    put(&directory, &armored).await;

    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template, "verifyKey");
    assert_eq!(sent[0].email, "alice@example.org");
    assert_eq!(sent[0].nonce.len(), 32);

    let doc = store
        .get(&json!({ "keyId": sent[0].key_id.as_str() }), DB_TYPE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["publicKeyArmored"], serde_json::Value::Null);
    assert_eq!(doc["userIds"][0]["verified"], false);
    assert_eq!(doc["userIds"][0]["nonce"], sent[0].nonce.as_str());
    assert!(doc["userIds"][0]["publicKeyArmored"].is_string());
    assert_eq!(doc["keyId"].as_str().unwrap(), &doc["fingerprint"].as_str().unwrap()[24..]);

    // Not served until verified.
    match directory.get(&email_query("alice@example.org")).await {
        Err(DirectoryError::KeyNotFound) => {}
        other => panic!("expected KeyNotFound, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn verify_publishes_the_user_id() {
    let (directory, store, mailer) = setup();
    let (_, armored) = generate(&["Alice <alice@example.org>"]);

    let key_id = put_and_verify(&directory, &mailer, &armored, "alice@example.org").await;

    let view = directory.get(&email_query("alice@example.org")).await.unwrap();
    assert_eq!(view.key_id, key_id);
    assert!(view.user_ids[0].verified);
    let published = view.public_key_armored.unwrap();
    assert_eq!(emails_of(&published), vec!["alice@example.org".to_string()]);

    // Nonce and shadow body are cleared once verified.
    let doc = store
        .get(&json!({ "keyId": key_id.as_str() }), DB_TYPE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["userIds"][0]["nonce"], serde_json::Value::Null);
    assert_eq!(doc["userIds"][0]["publicKeyArmored"], serde_json::Value::Null);

    // The spent nonce cannot be replayed.
    let mail = mailer.last_for("verifyKey", "alice@example.org").unwrap();
    match directory.verify(&mail.key_id, &mail.nonce).await {
        Err(DirectoryError::UserIdNotFound) => {}
        other => panic!("expected UserIdNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn last_verified_key_wins_per_email() {
    let (directory, _store, mailer) = setup();
    let (_, first_armored) = generate(&["Alice <alice@example.org>"]);
    let (_, second_armored) = generate(&["Alice <alice@example.org>"]);

    let first_key_id = put_and_verify(&directory, &mailer, &first_armored, "alice@example.org").await;
    let second_key_id = put_and_verify(&directory, &mailer, &second_armored, "alice@example.org").await;
    assert_ne!(first_key_id, second_key_id);

    let view = directory.get(&email_query("alice@example.org")).await.unwrap();
    assert_eq!(view.key_id, second_key_id);

    match directory
        .get(&LookupQuery::parse(Some(&first_key_id), None, None).unwrap())
        .await
    {
        Err(DirectoryError::KeyNotFound) => {}
        other => panic!("expected KeyNotFound, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn new_certifications_are_held_back_until_confirmed() {
    let (directory, store, mailer) = setup();
    let uid = "Alice <alice@example.org>";
    let (alice, alice_armored) = generate(&[uid]);
    let (bob, bob_armored) = generate(&["Bob <bob@example.org>"]);

    let key_id = put_and_verify(&directory, &mailer, &alice_armored, "alice@example.org").await;
    put_and_verify(&directory, &mailer, &bob_armored, "bob@example.org").await;

    let challenges_before = mailer.count("verifyKey");
    let certified_armored = certify(&alice, &bob, uid);
    put(&directory, &certified_armored).await;

    // No new user ids, so no new ownership challenges.
    assert_eq!(mailer.count("verifyKey"), challenges_before);
    assert_eq!(mailer.count("checkNewSigs"), 1);
    let notice = mailer.last_for("checkNewSigs", "alice@example.org").unwrap();

    // The certification is pending, not published.
    let view = directory.get(&email_query("alice@example.org")).await.unwrap();
    assert_eq!(certification_count(view.public_key_armored.as_deref().unwrap()), 0);
    let pending = view.pending_signatures.unwrap();
    assert_eq!(pending.len(), 1);

    // The confirmation page resolves the issuer's verified identity.
    let listing = directory
        .get_pending_signatures(&email_query("alice@example.org"), &notice.nonce)
        .await
        .unwrap();
    let entries = listing.get(uid).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].user_id, "Bob <bob@example.org>");
    assert_eq!(
        entries[0].issuer_fingerprint.as_deref(),
        Some(bob.fingerprint().to_hex().to_lowercase().as_str())
    );

    match directory
        .get_pending_signatures(&email_query("alice@example.org"), &"00".repeat(16))
        .await
    {
        Err(DirectoryError::InvalidNonce) => {}
        other => panic!("expected InvalidNonce, got {:?}", other.map(|_| ())),
    }

    // Confirming by hash publishes the signature byte-exactly.
    let hash = pending[0].selection_hash();
    let confirmed = directory
        .verify_signatures(&key_id, &notice.nonce, &[hash])
        .await
        .unwrap();
    assert_eq!(confirmed, "alice@example.org");

    let view = directory.get(&email_query("alice@example.org")).await.unwrap();
    assert_eq!(certification_count(view.public_key_armored.as_deref().unwrap()), 1);
    assert!(view.pending_signatures.is_none());

    let doc = store
        .get(&json!({ "keyId": key_id.as_str() }), DB_TYPE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["pendingSignatures"], serde_json::Value::Null);

    // The batch is gone; the nonce cannot be replayed.
    match directory.verify_signatures(&key_id, &notice.nonce, &[]).await {
        Err(DirectoryError::SignaturesNotFound) => {}
        other => panic!("expected SignaturesNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn reupload_of_the_same_key_is_idempotent() {
    let (directory, _store, mailer) = setup();
    let (_, armored) = generate(&["Alice <alice@example.org>"]);

    put_and_verify(&directory, &mailer, &armored, "alice@example.org").await;
    let mails_before = mailer.sent().len();

    put(&directory, &armored).await;

    assert_eq!(mailer.sent().len(), mails_before);
    let view = directory.get(&email_query("alice@example.org")).await.unwrap();
    assert!(view.pending_signatures.is_none());
    assert!(view.user_ids[0].verified);
}

#[tokio::test]
async fn aged_unverified_records_are_purged_on_upload() {
    let (directory, store, _mailer) = setup();

    let aged = json!({
        "keyId": "0123456789abcdef",
        "fingerprint": "ab".repeat(20),
        "userIds": [
            { "name": "", "email": "old@example.org", "verified": false, "nonce": null, "publicKeyArmored": null },
        ],
        "created": 0,
        "uploaded": (Utc::now() - Duration::days(31)).timestamp(),
        "algorithm": "eddsa",
        "keySize": 256,
        "publicKeyArmored": null,
    });
    store.create(aged, DB_TYPE).await.unwrap();

    let (_, armored) = generate(&["Carol <carol@example.org>"]);
    put(&directory, &armored).await;

    assert!(store
        .get(&json!({ "keyId": "0123456789abcdef" }), DB_TYPE)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn removing_one_of_two_user_ids_keeps_the_record() {
    let (directory, store, mailer) = setup();
    let (_, armored) = generate(&["Ann <a@example.org>", "Ann <b@example.org>"]);

    put(&directory, &armored).await;
    let mail_a = mailer.last_for("verifyKey", "a@example.org").unwrap();
    let mail_b = mailer.last_for("verifyKey", "b@example.org").unwrap();
    directory.verify(&mail_a.key_id, &mail_a.nonce).await.unwrap();
    directory.verify(&mail_b.key_id, &mail_b.nonce).await.unwrap();

    directory
        .request_remove(&email_query("a@example.org"), &origin())
        .await
        .unwrap();
    assert_eq!(mailer.count("verifyRemove"), 1);
    let removal = mailer.last_for("verifyRemove", "a@example.org").unwrap();

    let removed = directory.verify_remove(&removal.key_id, &removal.nonce).await.unwrap();
    assert_eq!(removed, "a@example.org");

    let view = directory.get(&email_query("b@example.org")).await.unwrap();
    assert_eq!(view.user_ids.len(), 1);
    assert_eq!(emails_of(view.public_key_armored.as_deref().unwrap()), vec!["b@example.org".to_string()]);

    match directory.get(&email_query("a@example.org")).await {
        Err(DirectoryError::KeyNotFound) => {}
        other => panic!("expected KeyNotFound, got {:?}", other.map(|_| ())),
    }

    // Removing the last user id deletes the whole record.
    directory
        .request_remove(&LookupQuery::parse(Some(&removal.key_id), None, None).unwrap(), &origin())
        .await
        .unwrap();
    let removal_b = mailer.last_for("verifyRemove", "b@example.org").unwrap();
    directory.verify_remove(&removal_b.key_id, &removal_b.nonce).await.unwrap();
    assert!(store
        .get(&json!({ "keyId": removal.key_id.as_str() }), DB_TYPE)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn email_filter_restricts_the_upload() {
    let (directory, _store, mailer) = setup();
    let (_, armored) = generate(&["Ann <a@example.org>", "Ann <b@example.org>"]);

    directory
        .put(PutRequest {
            public_key_armored: armored.clone(),
            emails: vec!["b@example.org".to_string()],
            origin: origin(),
        })
        .await
        .unwrap();
    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].email, "b@example.org");

    // Requesting an email the key does not carry fails the upload.
    let result = directory
        .put(PutRequest {
            public_key_armored: armored,
            emails: vec!["b@example.org".to_string(), "missing@example.org".to_string()],
            origin: origin(),
        })
        .await;
    match result {
        Err(DirectoryError::UserIdMismatch) => {}
        other => panic!("expected UserIdMismatch, got {:?}", other),
    }
}

#[tokio::test]
async fn organisation_restriction_gates_uploads_and_challenges() {
    let config = PublicKeyConfig::new(30, true, Some(r"@corp\.example$")).unwrap();

    let (directory, _store, _mailer) = setup_with(config.clone());
    let (_, outside) = generate(&["Eve <eve@elsewhere.net>"]);
    match put_err(&directory, &outside).await {
        DirectoryError::NoOrganisationUid => {}
        other => panic!("expected NoOrganisationUid, got {:?}", other),
    }

    let (directory, store, mailer) = setup_with(config);
    let (_, mixed) = generate(&["Dan <dan@corp.example>", "Dan <dan@elsewhere.net>"]);
    put(&directory, &mixed).await;

    // Only the organisation user id is challenged; the other one is stored
    // dormant without a nonce.
    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].email, "dan@corp.example");

    let doc = store
        .get(&json!({ "keyId": sent[0].key_id.as_str() }), DB_TYPE)
        .await
        .unwrap()
        .unwrap();
    let uids = doc["userIds"].as_array().unwrap();
    assert_eq!(uids.len(), 2);
    let dormant = uids
        .iter()
        .find(|uid| uid["email"] == "dan@elsewhere.net")
        .unwrap();
    assert_eq!(dormant["nonce"], serde_json::Value::Null);
    assert_eq!(dormant["verified"], false);
}

async fn put_err(directory: &KeyDirectory, armored: &str) -> DirectoryError {
    directory
        .put(PutRequest {
            public_key_armored: armored.to_string(),
            emails: vec![],
            origin: origin(),
        })
        .await
        .unwrap_err()
}

#[tokio::test]
async fn lookup_requires_a_predicate() {
    match LookupQuery::parse(None, None, None) {
        Err(DirectoryError::InvalidRequest(_)) => {}
        other => panic!("expected InvalidRequest, got {:?}", other),
    }
    match LookupQuery::parse(Some("xyz"), None, None) {
        Err(DirectoryError::InvalidRequest(_)) => {}
        other => panic!("expected InvalidRequest, got {:?}", other),
    }
}
