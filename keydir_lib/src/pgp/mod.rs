/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Adapter around sequoia-openpgp.
//!
//! All operations accept and return armored text; the directory never holds
//! a `Cert` across a suspension point. Packet-level rewrites (certification
//! diff and reattach) iterate the certificate components and rebuild the
//! certificate from the emitted packets.

use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::time::SystemTime;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use sequoia_openpgp::cert::amalgamation::{ComponentAmalgamation, ValidAmalgamation, ValidateAmalgamation};
use sequoia_openpgp::cert::Cert;
use sequoia_openpgp::packet::Signature;
use sequoia_openpgp::policy::StandardPolicy;
use sequoia_openpgp::types::{PublicKeyAlgorithm, RevocationStatus};
use sequoia_openpgp::Packet;

use crate::directory::records::{PendingSig, SigUser, UserIdRecord, UserIdStatus};
use crate::errors::DirectoryError;
use crate::utils::armor::{export_armored_cert, signature_bytes, signature_from_bytes, single_cert_from_armor};
use crate::PublicKeyConfig;

/// Extracts the single armored public key block from surrounding text.
pub fn trim_armor(text: &str) -> Result<String, DirectoryError> {
    crate::utils::armor::trim_armor(text).map_err(malformed)
}

/// Skeleton of a key record as extracted from an upload.
#[derive(Debug, Clone)]
pub struct ParsedKey {
    pub key_id: String,
    pub fingerprint: String,
    pub created: DateTime<Utc>,
    pub algorithm: String,
    pub key_size: usize,
    pub user_ids: Vec<UserIdRecord>,
    pub has_organisation_uid: bool,
    /// Canonical re-armored form of the submitted key.
    pub public_key_armored: String,
}

#[derive(Debug, Clone)]
pub struct PrimaryUser {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct SignatureDetails {
    pub issuer_fingerprint: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

fn malformed(error: anyhow::Error) -> DirectoryError {
    DirectoryError::MalformedKey(error.to_string())
}

fn parse_cert(armored: &str) -> Result<Cert, DirectoryError> {
    single_cert_from_armor(armored).map_err(malformed)
}

/// Parses a single armored public key into a record skeleton.
///
/// User ids without a parseable email address are dropped silently. If
/// `restrict_user_origin` is set and no user id matches the organisation
/// domain, all user ids are dropped; the caller turns that into an error.
pub fn parse_key(armored: &str, config: &PublicKeyConfig) -> Result<ParsedKey, DirectoryError> {
    let armored = trim_armor(armored)?;
    let cert = parse_cert(&armored)?;

    let fingerprint = cert.fingerprint().to_hex().to_lowercase();
    if fingerprint.len() != 40 {
        return Err(DirectoryError::MalformedKey(
            "Only version 4 keys are supported".to_string(),
        ));
    }
    let key_id = fingerprint[fingerprint.len() - 16..].to_string();

    let primary = cert.primary_key().key().clone();
    let creation_time = primary.creation_time();
    // Backdated clocks must not make a fresh key unverifiable.
    let reference_time = std::cmp::max(SystemTime::now(), creation_time);

    let policy = StandardPolicy::new();
    let valid_cert = cert
        .with_policy(&policy, reference_time)
        .map_err(|e| DirectoryError::MalformedKey(format!("Primary key verification failed: {}", e)))?;
    let cert_expired = valid_cert.alive().is_err();
    let cert_revoked = matches!(valid_cert.revocation_status(), RevocationStatus::Revoked(_));

    let mut user_ids = Vec::new();
    for uida in cert.userids() {
        let email = match uida.userid().email_normalized() {
            Ok(Some(email)) => email,
            _ => continue,
        };
        let name = uida.userid().name().ok().flatten().unwrap_or_default();
        let status = match uida.with_policy(&policy, reference_time) {
            Err(_) => UserIdStatus::Invalid,
            Ok(valid_uid) => {
                if cert_revoked || matches!(valid_uid.revocation_status(), RevocationStatus::Revoked(_)) {
                    UserIdStatus::Revoked
                } else if cert_expired {
                    UserIdStatus::Expired
                } else {
                    UserIdStatus::Valid
                }
            }
        };
        user_ids.push(UserIdRecord {
            name,
            email,
            verified: false,
            nonce: None,
            public_key_armored: None,
            status,
            notify: false,
        });
    }

    let has_organisation_uid = user_ids.iter().any(|uid| config.is_organisation_email(&uid.email));
    if config.restrict_user_origin && !has_organisation_uid {
        user_ids.clear();
    }

    Ok(ParsedKey {
        key_id,
        fingerprint,
        created: DateTime::<Utc>::from(creation_time),
        algorithm: algorithm_name(primary.pk_algo()),
        key_size: primary.mpis().bits().unwrap_or(0),
        user_ids,
        has_organisation_uid,
        public_key_armored: export_armored_cert(&cert).map_err(DirectoryError::parse)?,
    })
}

/// Retains only user ids whose normalized email is in the set. User
/// attribute packets are untouched.
pub fn filter_by_user_ids(emails: &HashSet<String>, armored: &str) -> Result<String, DirectoryError> {
    let cert = parse_cert(armored)?;
    let cert = cert.retain_userids(|uida| match uida.userid().email_normalized() {
        Ok(Some(email)) => emails.contains(&email),
        _ => false,
    });
    export_armored_cert(&cert).map_err(DirectoryError::parse)
}

/// Strips third-party certifications of `src` that are absent from `cmp`.
///
/// Both sides must share the primary fingerprint, otherwise `src` passes
/// through unchanged. Users are matched by userid string (or user-attribute
/// bytes); for each match, every non-expired certification present in `src`
/// but not in `cmp` (byte equality of the framed packet) is removed from the
/// returned key and reported. Self-signatures are untouched.
pub fn filter_by_signatures(
    src_armored: &str,
    cmp_armored: &str,
) -> Result<(String, Vec<PendingSig>), DirectoryError> {
    let src = parse_cert(src_armored)?;
    let cmp = parse_cert(cmp_armored)?;
    if src.fingerprint() != cmp.fingerprint() {
        return Ok((src_armored.to_string(), Vec::new()));
    }

    let mut cmp_uid_sigs: HashMap<Vec<u8>, HashSet<Vec<u8>>> = HashMap::new();
    for uida in cmp.userids() {
        let entry = cmp_uid_sigs.entry(uida.userid().value().to_vec()).or_default();
        for sig in uida.certifications() {
            entry.insert(signature_bytes(sig).map_err(DirectoryError::parse)?);
        }
    }
    let mut cmp_ua_sigs: HashMap<Vec<u8>, HashSet<Vec<u8>>> = HashMap::new();
    for uaa in cmp.user_attributes() {
        let entry = cmp_ua_sigs.entry(uaa.component().value().to_vec()).or_default();
        for sig in uaa.certifications() {
            entry.insert(signature_bytes(sig).map_err(DirectoryError::parse)?);
        }
    }

    let mut stripped = Vec::new();
    let mut packets: Vec<Packet> = Vec::new();

    let primary = src.primary_key();
    packets.push(primary.key().clone().into());
    packets.extend(signature_packets(primary.component_amalgamation()));

    for uida in src.userids() {
        packets.push(uida.userid().clone().into());
        packets.extend(non_certification_packets(&uida));
        let known = cmp_uid_sigs.get(uida.userid().value());
        for sig in uida.certifications() {
            let raw = signature_bytes(sig).map_err(DirectoryError::parse)?;
            if is_new_certification(sig, &raw, known) {
                stripped.push(PendingSig {
                    user: SigUser {
                        user_id: Some(String::from_utf8_lossy(uida.userid().value()).into_owned()),
                        user_attribute: None,
                    },
                    signature: base64::encode(&raw),
                });
            } else {
                packets.push(sig.clone().into());
            }
        }
    }

    for uaa in src.user_attributes() {
        packets.push(uaa.component().clone().into());
        packets.extend(non_certification_packets(&uaa));
        let known = cmp_ua_sigs.get(uaa.component().value());
        for sig in uaa.certifications() {
            let raw = signature_bytes(sig).map_err(DirectoryError::parse)?;
            if is_new_certification(sig, &raw, known) {
                stripped.push(PendingSig {
                    user: SigUser {
                        user_id: None,
                        user_attribute: Some(base64::encode(uaa.component().value())),
                    },
                    signature: base64::encode(&raw),
                });
            } else {
                packets.push(sig.clone().into());
            }
        }
    }

    append_remaining_components(&src, &mut packets);

    let cert = Cert::try_from(packets).map_err(DirectoryError::parse)?;
    Ok((export_armored_cert(&cert).map_err(DirectoryError::parse)?, stripped))
}

/// A certification is stripped when it is still alive and the compared key
/// does not already carry it on the matching user.
fn is_new_certification(sig: &Signature, raw: &[u8], known: Option<&HashSet<Vec<u8>>>) -> bool {
    let alive = sig.signature_alive(None, None).is_ok();
    match known {
        Some(set) => alive && !set.contains(raw),
        // No matching user on the compared key: nothing to diff against.
        None => false,
    }
}

/// Merges `dst` into `src` (missing subkeys and self-signatures; callers
/// strip third-party certifications beforehand).
pub fn update_key(src_armored: &str, dst_armored: &str) -> Result<String, DirectoryError> {
    let src = parse_cert(src_armored)?;
    let dst = parse_cert(dst_armored)?;
    let merged = src
        .merge_public(dst)
        .map_err(|e| DirectoryError::MalformedKey(format!("Keys cannot be merged: {}", e)))?;
    export_armored_cert(&merged).map_err(DirectoryError::parse)
}

/// Most-significant user of the key: the primary user id under the standard
/// policy, falling back to the first user id carrying an email address.
pub fn get_primary_user(armored: &str) -> Result<PrimaryUser, DirectoryError> {
    let cert = parse_cert(armored)?;
    let policy = StandardPolicy::new();
    if let Ok(valid_cert) = cert.with_policy(&policy, None) {
        if let Ok(primary) = valid_cert.primary_userid() {
            if let Some(email) = primary.userid().email_normalized().ok().flatten() {
                return Ok(PrimaryUser {
                    name: primary.userid().name().ok().flatten().unwrap_or_default(),
                    email,
                });
            }
        }
    }
    for uida in cert.userids() {
        if let Some(email) = uida.userid().email_normalized().ok().flatten() {
            return Ok(PrimaryUser {
                name: uida.userid().name().ok().flatten().unwrap_or_default(),
                email,
            });
        }
    }
    Err(DirectoryError::MalformedKey(
        "The key does not contain a user id with an email address".to_string(),
    ))
}

/// Reattaches a previously stripped certification to its user. Unmatched
/// signatures leave the key unchanged.
pub fn add_signature(armored: &str, sig: &PendingSig) -> Result<String, DirectoryError> {
    let cert = parse_cert(armored)?;
    let raw = base64::decode(&sig.signature)
        .map_err(|e| DirectoryError::parse(anyhow!("Stored signature is not valid base64: {}", e)))?;
    let packet: Packet = signature_from_bytes(&raw).map_err(DirectoryError::parse)?.into();

    let target_uid = sig.user.user_id.as_deref().map(str::as_bytes);
    let target_ua = sig
        .user
        .user_attribute
        .as_deref()
        .map(base64::decode)
        .transpose()
        .map_err(|e| DirectoryError::parse(anyhow!("Stored user attribute is not valid base64: {}", e)))?;

    let mut packets: Vec<Packet> = Vec::new();
    let primary = cert.primary_key();
    packets.push(primary.key().clone().into());
    packets.extend(signature_packets(primary.component_amalgamation()));

    for uida in cert.userids() {
        packets.push(uida.userid().clone().into());
        packets.extend(signature_packets(&uida));
        if target_uid == Some(uida.userid().value()) {
            packets.push(packet.clone());
        }
    }
    for uaa in cert.user_attributes() {
        packets.push(uaa.component().clone().into());
        packets.extend(signature_packets(&uaa));
        if target_ua.as_deref() == Some(uaa.component().value()) {
            packets.push(packet.clone());
        }
    }
    append_remaining_components(&cert, &mut packets);

    let cert = Cert::try_from(packets).map_err(DirectoryError::parse)?;
    export_armored_cert(&cert).map_err(DirectoryError::parse)
}

/// Drops the user id carrying the given normalized email.
pub fn remove_user_id(email: &str, armored: &str) -> Result<String, DirectoryError> {
    let cert = parse_cert(armored)?;
    let cert = cert.retain_userids(|uida| match uida.userid().email_normalized() {
        Ok(Some(uid_email)) => uid_email != email,
        _ => true,
    });
    export_armored_cert(&cert).map_err(DirectoryError::parse)
}

/// Issuer fingerprint and creation time of a stored signature packet.
pub fn parse_signature_details(signature_base64: &str) -> Result<SignatureDetails, DirectoryError> {
    let raw = base64::decode(signature_base64)
        .map_err(|e| DirectoryError::parse(anyhow!("Stored signature is not valid base64: {}", e)))?;
    let sig = signature_from_bytes(&raw).map_err(DirectoryError::parse)?;
    let issuer_fingerprint = sig.issuer_fingerprints().next().map(|fp| fp.to_hex().to_lowercase());
    let created = sig.signature_creation_time().map(DateTime::<Utc>::from);
    Ok(SignatureDetails {
        issuer_fingerprint,
        created,
    })
}

/// All signatures bound to a component, in packet order.
fn signature_packets<A>(component: &ComponentAmalgamation<A>) -> Vec<Packet> {
    component
        .self_signatures()
        .chain(component.certifications())
        .chain(component.self_revocations())
        .chain(component.other_revocations())
        .map(|sig: &Signature| sig.clone().into())
        .collect()
}

/// Component signatures except third-party certifications.
fn non_certification_packets<A>(component: &ComponentAmalgamation<A>) -> Vec<Packet> {
    component
        .self_signatures()
        .chain(component.self_revocations())
        .chain(component.other_revocations())
        .map(|sig: &Signature| sig.clone().into())
        .collect()
}

/// Subkeys, unknown components and unassociated signatures pass through
/// every packet-level rewrite untouched.
fn append_remaining_components(cert: &Cert, packets: &mut Vec<Packet>) {
    for suba in cert.keys().subkeys() {
        packets.push(suba.key().clone().into());
        packets.extend(signature_packets(suba.component_amalgamation()));
    }
    for unknown in cert.unknowns() {
        packets.push(unknown.component().clone().into());
        packets.extend(signature_packets(&unknown));
    }
    for sig in cert.bad_signatures() {
        packets.push(sig.clone().into());
    }
}

pub fn algorithm_name(algo: PublicKeyAlgorithm) -> String {
    #[allow(deprecated)]
    match algo {
        PublicKeyAlgorithm::RSAEncryptSign => "rsa_encrypt_sign".into(),
        PublicKeyAlgorithm::RSAEncrypt => "rsa_encrypt".into(),
        PublicKeyAlgorithm::RSASign => "rsa_sign".into(),
        PublicKeyAlgorithm::ElGamalEncrypt => "elgamal_encrypt".into(),
        PublicKeyAlgorithm::DSA => "dsa".into(),
        PublicKeyAlgorithm::ECDH => "ecdh".into(),
        PublicKeyAlgorithm::ECDSA => "ecdsa".into(),
        PublicKeyAlgorithm::ElGamalEncryptSign => "elgamal_encrypt_sign".into(),
        PublicKeyAlgorithm::EdDSA => "eddsa".into(),
        PublicKeyAlgorithm::Private(n) => format!("private_{}", n),
        PublicKeyAlgorithm::Unknown(n) => format!("unknown_{}", n),
        _ => "unknown".into(),
    }
}
