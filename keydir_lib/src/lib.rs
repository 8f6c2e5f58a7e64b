/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

use regex::Regex;

pub mod directory;
pub mod errors;
pub mod mailer;
pub mod pgp;
pub mod storage;
pub mod types;
pub mod utils;

pub const DEFAULT_PURGE_TIME_IN_DAYS: i64 = 30;

/// Directory policy, threaded through the constructor (no globals).
#[derive(Debug, Clone)]
pub struct PublicKeyConfig {
    /// Unverified records older than this are purged lazily on upload.
    pub purge_time_in_days: i64,
    /// Require at least one organisation-domain user id per key; only
    /// organisation user ids receive challenges.
    pub restrict_user_origin: bool,
    restriction_regex: Option<Regex>,
}

impl PublicKeyConfig {
    pub fn new(
        purge_time_in_days: i64,
        restrict_user_origin: bool,
        restriction_regex: Option<&str>,
    ) -> Result<Self, anyhow::Error> {
        let restriction_regex = restriction_regex.map(Regex::new).transpose()?;
        Ok(Self {
            purge_time_in_days,
            restrict_user_origin,
            restriction_regex,
        })
    }

    pub fn is_organisation_email(&self, email: &str) -> bool {
        self.restriction_regex
            .as_ref()
            .map_or(false, |regex| regex.is_match(email))
    }
}

impl Default for PublicKeyConfig {
    fn default() -> Self {
        Self {
            purge_time_in_days: DEFAULT_PURGE_TIME_IN_DAYS,
            restrict_user_origin: false,
            restriction_regex: None,
        }
    }
}
