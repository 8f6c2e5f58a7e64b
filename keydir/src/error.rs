/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

use keydir_lib::errors::DirectoryError;
use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, status, Responder};
use tracing::info;

/// Rocket-facing wrapper for [`DirectoryError`].
#[derive(Debug)]
pub struct ApiError(pub DirectoryError);

impl From<DirectoryError> for ApiError {
    fn from(error: DirectoryError) -> Self {
        ApiError(error)
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        info!("error response: status={} error={}", self.0.status(), self.0);
        let status = Status::from_code(self.0.status()).unwrap_or(Status::InternalServerError);
        let message = if self.0.expose() {
            self.0.to_string()
        } else {
            "Internal server error".to_string()
        };
        status::Custom(status, message).respond_to(request)
    }
}
