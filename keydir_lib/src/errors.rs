/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::fmt::{Display, Formatter};

use anyhow::anyhow;
use tracing::error;

/// Error surface of the key directory.
///
/// Every variant maps to an HTTP status via [`DirectoryError::status`].
/// 4xx variants are safe to echo to the client ([`DirectoryError::expose`]);
/// 5xx variants carry their cause for the logs only.
#[derive(Debug)]
pub enum DirectoryError {
    InvalidRequest(String),
    MalformedKey(String),
    NoValidUserIds,
    UserIdMismatch,
    NoOrganisationUid,
    UserIdNotFound,
    KeyNotFound,
    SignaturesNotFound,
    InvalidNonce,
    PersistFailed(String),
    InternalParseError(anyhow::Error),
    Internal(anyhow::Error),
}

impl DirectoryError {
    pub fn internal(error: impl Into<anyhow::Error>) -> Self {
        let error = error.into();
        error!("internal directory error: {:?}", error);
        DirectoryError::Internal(error)
    }

    pub fn parse(error: impl Into<anyhow::Error>) -> Self {
        let error = error.into();
        error!("OpenPGP library reported corruption: {:?}", error);
        DirectoryError::InternalParseError(error)
    }

    pub fn status(&self) -> u16 {
        match self {
            DirectoryError::InvalidRequest(_)
            | DirectoryError::MalformedKey(_)
            | DirectoryError::NoValidUserIds
            | DirectoryError::UserIdMismatch
            | DirectoryError::NoOrganisationUid => 400,
            DirectoryError::InvalidNonce => 403,
            DirectoryError::UserIdNotFound | DirectoryError::KeyNotFound | DirectoryError::SignaturesNotFound => 404,
            DirectoryError::PersistFailed(_)
            | DirectoryError::InternalParseError(_)
            | DirectoryError::Internal(_) => 500,
        }
    }

    /// Whether the message may be echoed to the client verbatim.
    pub fn expose(&self) -> bool {
        self.status() < 500
    }
}

impl Display for DirectoryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            DirectoryError::MalformedKey(msg) => write!(f, "Malformed public key: {}", msg),
            DirectoryError::NoValidUserIds => write!(f, "The key does not contain any valid user id"),
            DirectoryError::UserIdMismatch => {
                write!(f, "The requested email addresses are not all present on the key")
            }
            DirectoryError::NoOrganisationUid => {
                write!(f, "The key does not carry a user id of the required domain")
            }
            DirectoryError::UserIdNotFound => write!(f, "User id not found"),
            DirectoryError::KeyNotFound => write!(f, "Key not found"),
            DirectoryError::SignaturesNotFound => write!(f, "No pending signatures found"),
            DirectoryError::InvalidNonce => write!(f, "Invalid nonce"),
            DirectoryError::PersistFailed(msg) => write!(f, "Persisting the key failed: {}", msg),
            DirectoryError::InternalParseError(e) => write!(f, "Key parsing failed internally: {}", e),
            DirectoryError::Internal(e) => write!(f, "{}", e),
        }
    }
}

impl From<anyhow::Error> for DirectoryError {
    fn from(e: anyhow::Error) -> Self {
        DirectoryError::internal(e)
    }
}

impl From<serde_json::Error> for DirectoryError {
    fn from(e: serde_json::Error) -> Self {
        DirectoryError::internal(anyhow!(e))
    }
}

impl From<rusqlite::Error> for DirectoryError {
    fn from(e: rusqlite::Error) -> Self {
        DirectoryError::internal(anyhow!(e))
    }
}
