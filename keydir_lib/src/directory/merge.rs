/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::collections::HashSet;

use crate::directory::records::{UserIdRecord, UserIdStatus};
use crate::errors::DirectoryError;
use crate::pgp;
use crate::PublicKeyConfig;

/// Combines the user ids of an upload with an existing verified record.
///
/// Verified user ids are kept as-is and never overwritten. Valid new user
/// ids not already verified get a shadow armored body and a notify flag
/// (a re-submitted pending email lands here, replacing its old nonce on
/// dispatch). Existing unverified user ids not re-submitted stay pending.
/// Result order: valid, then pending, then verified.
pub fn merge_user_ids(
    existing_users: &[UserIdRecord],
    new_users: Vec<UserIdRecord>,
    new_armored: &str,
    config: &PublicKeyConfig,
) -> Result<Vec<UserIdRecord>, DirectoryError> {
    let verified_users: Vec<UserIdRecord> = existing_users.iter().filter(|u| u.verified).cloned().collect();
    let verified_emails: HashSet<&str> = verified_users.iter().map(|u| u.email.as_str()).collect();

    let mut valid_users = Vec::new();
    for mut uid in new_users {
        if uid.status != UserIdStatus::Valid || verified_emails.contains(uid.email.as_str()) {
            continue;
        }
        let email_set: HashSet<String> = [uid.email.clone()].into_iter().collect();
        uid.public_key_armored = Some(pgp::filter_by_user_ids(&email_set, new_armored)?);
        uid.notify = !config.restrict_user_origin || config.is_organisation_email(&uid.email);
        valid_users.push(uid);
    }
    let valid_emails: HashSet<&str> = valid_users.iter().map(|u| u.email.as_str()).collect();

    let pending_users: Vec<UserIdRecord> = existing_users
        .iter()
        .filter(|u| !u.verified && !valid_emails.contains(u.email.as_str()))
        .cloned()
        .collect();

    let mut merged = valid_users;
    merged.extend(pending_users);
    merged.extend(verified_users);
    Ok(merged)
}
