/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

use keydir_lib::types::Origin;

/// Managed state: origin of the external URL used in mailed links.
#[derive(Debug)]
pub struct OriginHolder(pub Origin);
