/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

use anyhow::anyhow;
use sequoia_openpgp::cert::{Cert, CertParser};
use sequoia_openpgp::packet::Signature;
use sequoia_openpgp::parse::Parse;
use sequoia_openpgp::serialize::SerializeInto;
use sequoia_openpgp::Packet;

const ARMOR_BEGIN: &str = "-----BEGIN PGP PUBLIC KEY BLOCK-----";
const ARMOR_END: &str = "-----END PGP PUBLIC KEY BLOCK-----";

pub fn export_armored_cert(cert: &Cert) -> Result<String, anyhow::Error> {
    let serialized = cert.armored().export_to_vec()?;
    Ok(String::from_utf8(serialized)?)
}

/// Parses an armored block that must contain exactly one certificate.
pub fn single_cert_from_armor(armored: &str) -> Result<Cert, anyhow::Error> {
    let mut parser = CertParser::from_bytes(armored.as_bytes())?;
    let cert = parser
        .next()
        .ok_or_else(|| anyhow!("Armored block contains no OpenPGP key"))??;
    if parser.next().is_some() {
        return Err(anyhow!("Armored block contains more than one OpenPGP key"));
    }
    Ok(cert)
}

/// Extracts the single `PUBLIC KEY BLOCK` segment from surrounding text.
pub fn trim_armor(text: &str) -> Result<String, anyhow::Error> {
    let begin = text.find(ARMOR_BEGIN).ok_or_else(|| anyhow!("Missing armor header"))?;
    let end = text.find(ARMOR_END).ok_or_else(|| anyhow!("Missing armor footer"))?;
    if end < begin || text[end + ARMOR_END.len()..].contains(ARMOR_BEGIN) {
        return Err(anyhow!("Expected exactly one armored key block"));
    }
    Ok(text[begin..end + ARMOR_END.len()].to_string())
}

/// Serializes a signature as a framed OpenPGP packet.
pub fn signature_bytes(sig: &Signature) -> Result<Vec<u8>, anyhow::Error> {
    Ok(Packet::from(sig.clone()).to_vec()?)
}

/// Parses a framed signature packet back from its serialized form.
pub fn signature_from_bytes(raw: &[u8]) -> Result<Signature, anyhow::Error> {
    match Packet::from_bytes(raw)? {
        Packet::Signature(sig) => Ok(sig),
        other => Err(anyhow!("Expected a signature packet, got {:?}", other.tag())),
    }
}
