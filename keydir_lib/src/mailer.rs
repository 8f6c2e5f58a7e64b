/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::fmt::{Debug, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, Message, SmtpTransport, Transport};
use tracing::info;

use crate::types::Origin;

/// Addressee of a verification message.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub name: String,
    pub email: String,
}

/// Outbound mail port of the directory, one method per template.
///
/// Sends are awaited and failures propagate: the directory only persists a
/// nonce after the message carrying it was accepted for delivery.
#[async_trait]
pub trait Mailer: Send + Sync + Debug {
    /// Ownership challenge for one user id; includes the single-user-id
    /// armored key so the recipient can inspect what will be published.
    async fn send_verify_key(
        &self,
        recipient: &Recipient,
        key_id: &str,
        nonce: &str,
        origin: &Origin,
        public_key_armored: &str,
    ) -> Result<(), anyhow::Error>;

    /// Confirmation request for removing a user id.
    async fn send_verify_remove(
        &self,
        recipient: &Recipient,
        key_id: &str,
        nonce: &str,
        origin: &Origin,
    ) -> Result<(), anyhow::Error>;

    /// Notice that third-party certifications await confirmation.
    async fn send_check_new_sigs(
        &self,
        recipient: &Recipient,
        key_id: &str,
        nonce: &str,
        origin: &Origin,
    ) -> Result<(), anyhow::Error>;
}

pub enum SmtpConnectionSecurity {
    None,
    Tls,
    StartTls,
}

pub struct SmtpMailer {
    connection: SmtpTransport,
    from: Mailbox,
}

impl Debug for SmtpMailer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SmtpMailer: from: {:?}", self.from)
    }
}

impl SmtpMailer {
    pub fn new(
        host: &str,
        user: &str,
        pass: &str,
        port: u16,
        from: &str,
        connection_security: &SmtpConnectionSecurity,
    ) -> Result<Self, anyhow::Error> {
        let connection = match connection_security {
            SmtpConnectionSecurity::None => SmtpTransport::builder_dangerous(host),
            SmtpConnectionSecurity::Tls => SmtpTransport::relay(host)?,
            SmtpConnectionSecurity::StartTls => SmtpTransport::starttls_relay(host)?,
        }
        .credentials(Credentials::new(user.to_string(), pass.to_string()))
        .port(port)
        .build();

        Ok(SmtpMailer {
            connection,
            from: Mailbox::new(None, Address::from_str(from)?),
        })
    }

    fn send_mail(&self, recipient: &Recipient, subject: &str, body: String) -> Result<(), anyhow::Error> {
        info!("sending mail: to=<{}> subject={}", recipient.email, subject);
        let message = Message::builder()
            .from(self.from.clone())
            .to(Mailbox::new(None, Address::from_str(recipient.email.as_str())?))
            .subject(subject)
            .body(body)?;
        self.connection
            .send(&message)
            .map_err(|e| anyhow!("SMTP delivery to <{}> failed: {}", recipient.email, e))?;
        Ok(())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_verify_key(
        &self,
        recipient: &Recipient,
        key_id: &str,
        nonce: &str,
        origin: &Origin,
        public_key_armored: &str,
    ) -> Result<(), anyhow::Error> {
        let subject = "Verify your public key";
        let body = format!(
            "Hello {},\n\
            \n\
            your OpenPGP public key was uploaded to this directory. Click the\n\
            link below to verify this email address and publish the key:\n\
            \n\
            {}/api/v1/key?op=verify&keyId={}&nonce={}\n\
            \n\
            If you did not upload this key you can ignore this message.\n\
            \n\
            The key as it would be published:\n\
            \n\
            {}\n",
            sanitize_name(recipient.name.as_str()),
            origin.base_url(),
            key_id,
            nonce,
            public_key_armored
        );
        self.send_mail(recipient, subject, body)
    }

    async fn send_verify_remove(
        &self,
        recipient: &Recipient,
        key_id: &str,
        nonce: &str,
        origin: &Origin,
    ) -> Result<(), anyhow::Error> {
        let subject = "Confirm removal of your public key";
        let body = format!(
            "Hello {},\n\
            \n\
            removal of this email address from the key directory was\n\
            requested. Click the link below to confirm:\n\
            \n\
            {}/api/v1/key?op=verifyRemove&keyId={}&nonce={}\n\
            \n\
            If you did not request removal you can ignore this message.\n",
            sanitize_name(recipient.name.as_str()),
            origin.base_url(),
            key_id,
            nonce
        );
        self.send_mail(recipient, subject, body)
    }

    async fn send_check_new_sigs(
        &self,
        recipient: &Recipient,
        key_id: &str,
        nonce: &str,
        origin: &Origin,
    ) -> Result<(), anyhow::Error> {
        let subject = "New signatures for your public key";
        let body = format!(
            "Hello {},\n\
            \n\
            an upload added third-party signatures to your published key.\n\
            Review and confirm the ones you want to publish:\n\
            \n\
            {}/api/v1/key?op=checkSignatures&keyId={}&nonce={}\n",
            sanitize_name(recipient.name.as_str()),
            origin.base_url(),
            key_id,
            nonce
        );
        self.send_mail(recipient, subject, body)
    }
}

/// Mailer for deployments without outbound mail; accepts everything.
#[derive(Debug)]
pub struct NoopMailer {}

#[async_trait]
impl Mailer for NoopMailer {
    async fn send_verify_key(
        &self,
        _recipient: &Recipient,
        _key_id: &str,
        _nonce: &str,
        _origin: &Origin,
        _public_key_armored: &str,
    ) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn send_verify_remove(
        &self,
        _recipient: &Recipient,
        _key_id: &str,
        _nonce: &str,
        _origin: &Origin,
    ) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn send_check_new_sigs(
        &self,
        _recipient: &Recipient,
        _key_id: &str,
        _nonce: &str,
        _origin: &Origin,
    ) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

fn sanitize_name(name: &str) -> String {
    let name = if name.is_empty() { "key owner" } else { name };
    let mut name = name.replace('<', "□").replace('>', "□");
    if name.chars().count() > 256 {
        name = name.chars().take(256).collect();
        name.push_str("[...]")
    }
    name
}
