/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::sync::Arc;

use keydir_lib::directory::{KeyDirectory, LookupQuery, PutRequest};
use keydir_lib::errors::DirectoryError;
use rocket::http::Status;
use rocket::response::content::RawHtml;
use rocket::serde::json::Json;
use rocket::State;
use serde::Deserialize;

use crate::error::ApiError;
use crate::holders::OriginHolder;

#[derive(Debug, FromForm)]
pub struct KeyParams {
    pub op: Option<String>,
    #[field(name = "keyId")]
    pub key_id: Option<String>,
    pub fingerprint: Option<String>,
    pub email: Option<String>,
    pub nonce: Option<String>,
}

/// POST body: either a key upload or a signature confirmation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyUpload {
    pub op: Option<String>,
    pub public_key_armored: Option<String>,
    pub emails: Option<Vec<String>>,
    pub key_id: Option<String>,
    pub nonce: Option<String>,
    pub sig: Option<Vec<String>>,
}

#[derive(Responder)]
pub enum KeyResponse {
    Page(RawHtml<String>),
    Json(Json<serde_json::Value>),
}

fn invalid(message: impl Into<String>) -> ApiError {
    ApiError(DirectoryError::InvalidRequest(message.into()))
}

fn require(value: Option<String>, name: &str) -> Result<String, ApiError> {
    value.ok_or_else(|| invalid(format!("Parameter {} is required", name)))
}

fn page(title: &str, body: &str) -> RawHtml<String> {
    RawHtml(format!(
        "<!doctype html><html><head><title>{}</title></head><body><h1>{}</h1><p>{}</p></body></html>",
        title, title, body
    ))
}

#[post("/api/v1/key", format = "json", data = "<body>")]
pub async fn post_key(
    body: Json<KeyUpload>,
    directory: &State<Arc<KeyDirectory>>,
    origin: &State<OriginHolder>,
) -> Result<Status, ApiError> {
    let body = body.into_inner();
    match body.op.as_deref() {
        None => {
            let public_key_armored = require(body.public_key_armored, "publicKeyArmored")?;
            directory
                .put(PutRequest {
                    public_key_armored,
                    emails: body.emails.unwrap_or_default(),
                    origin: origin.0.clone(),
                })
                .await?;
            Ok(Status::Created)
        }
        Some("confirmSignatures") => {
            let key_id = require(body.key_id, "keyId")?;
            let nonce = require(body.nonce, "nonce")?;
            directory
                .verify_signatures(&key_id, &nonce, &body.sig.unwrap_or_default())
                .await?;
            Ok(Status::Created)
        }
        Some(other) => Err(invalid(format!("Unknown operation: {}", other))),
    }
}

#[get("/api/v1/key?<params..>")]
pub async fn get_key(params: KeyParams, directory: &State<Arc<KeyDirectory>>) -> Result<KeyResponse, ApiError> {
    match params.op.as_deref() {
        Some("verify") => {
            let key_id = require(params.key_id, "keyId")?;
            let nonce = require(params.nonce, "nonce")?;
            let email = directory.verify(&key_id, &nonce).await?;
            Ok(KeyResponse::Page(page(
                "Email address verified",
                &format!("The email address {} is now published with the key.", email),
            )))
        }
        Some("verifyRemove") => {
            let key_id = require(params.key_id, "keyId")?;
            let nonce = require(params.nonce, "nonce")?;
            let email = directory.verify_remove(&key_id, &nonce).await?;
            Ok(KeyResponse::Page(page(
                "Key removal confirmed",
                &format!("The email address {} was removed from the directory.", email),
            )))
        }
        Some("checkSignatures") => {
            let nonce = require(params.nonce, "nonce")?;
            let query = LookupQuery::parse(
                params.key_id.as_deref(),
                params.fingerprint.as_deref(),
                params.email.as_deref(),
            )?;
            let pending = directory.get_pending_signatures(&query, &nonce).await?;
            Ok(KeyResponse::Json(Json(
                serde_json::to_value(pending).map_err(DirectoryError::from)?,
            )))
        }
        Some(other) => Err(invalid(format!("Unknown operation: {}", other))),
        None => {
            let query = LookupQuery::parse(
                params.key_id.as_deref(),
                params.fingerprint.as_deref(),
                params.email.as_deref(),
            )?;
            let view = directory.get(&query).await?;
            Ok(KeyResponse::Json(Json(
                serde_json::to_value(view).map_err(DirectoryError::from)?,
            )))
        }
    }
}

#[delete("/api/v1/key?<params..>")]
pub async fn delete_key(
    params: KeyParams,
    directory: &State<Arc<KeyDirectory>>,
    origin: &State<OriginHolder>,
) -> Result<Status, ApiError> {
    if params.key_id.is_none() && params.email.is_none() {
        return Err(invalid("Provide a key id or email address"));
    }
    let query = LookupQuery::parse(params.key_id.as_deref(), None, params.email.as_deref())?;
    directory.request_remove(&query, &origin.0).await?;
    Ok(Status::Accepted)
}
