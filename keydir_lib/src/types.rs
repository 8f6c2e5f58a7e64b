/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::fmt::Display;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// A parsed email address, normalized to lowercase.
///
/// Every lookup and merge in the directory is keyed by normalized email, so
/// normalization happens once at the parse boundary.
#[derive(Eq, PartialEq, Hash, Clone, Debug)]
pub struct Email {
    localpart: String,
    domain: String,
}

impl Email {
    pub fn parse(email: &str) -> Result<Self, anyhow::Error> {
        let email = email.trim().to_lowercase();
        let mut parts = email.split('@');
        let localpart = parts.next().ok_or_else(|| anyhow!("Invalid email address!"))?;
        let domain = parts.next().ok_or_else(|| anyhow!("Invalid email address!"))?;
        if localpart.is_empty() || domain.is_empty() || !domain.contains('.') {
            return Err(anyhow!("Invalid email address!"));
        }
        match parts.next() {
            Some(_) => Err(anyhow!("Invalid email address!")),
            None => Ok(Self {
                localpart: localpart.to_string(),
                domain: domain.to_string(),
            }),
        }
    }

    pub fn parse_option(email: &str) -> Option<Email> {
        Self::parse(email).ok()
    }

    pub fn get_domain(&self) -> &str {
        &self.domain
    }

    pub fn get_email(&self) -> String {
        self.localpart.clone() + "@" + self.get_domain()
    }
}

impl Display for Email {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.get_email())
    }
}

/// Request origin used to assemble the links placed in verification mails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Origin {
    pub protocol: String,
    pub host: String,
}

impl Origin {
    /// Parses an `https://host[:port]` style base URL.
    pub fn from_url(url: &str) -> Result<Self, anyhow::Error> {
        let (protocol, rest) = url
            .split_once("://")
            .ok_or_else(|| anyhow!("Expected <protocol>://<host>, got: {}", url))?;
        let host = rest.trim_end_matches('/');
        if protocol.is_empty() || host.is_empty() {
            return Err(anyhow!("Expected <protocol>://<host>, got: {}", url));
        }
        Ok(Self {
            protocol: protocol.to_string(),
            host: host.to_string(),
        })
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.host)
    }
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// 16 hex chars, the low 64 bits of a fingerprint.
pub fn is_key_id(value: &str) -> bool {
    is_lower_hex(value, 16)
}

/// 40 hex chars, a v4 fingerprint.
pub fn is_fingerprint(value: &str) -> bool {
    is_lower_hex(value, 40)
}

/// 32 hex chars, a verification nonce.
pub fn is_nonce(value: &str) -> bool {
    is_lower_hex(value, 32)
}
