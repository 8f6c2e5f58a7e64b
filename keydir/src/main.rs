/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

#[macro_use]
extern crate rocket;

use std::sync::Arc;

use keydir_lib::directory::KeyDirectory;
use keydir_lib::mailer::{Mailer, NoopMailer, SmtpConnectionSecurity, SmtpMailer};
use keydir_lib::storage::memory::MemoryStore;
use keydir_lib::storage::sqlite::SqliteStore;
use keydir_lib::storage::DocStore;
use keydir_lib::types::Origin;
use keydir_lib::PublicKeyConfig;
use rocket::fairing::AdHoc;
use rocket::{Build, Rocket};
use tracing::info;

use crate::holders::OriginHolder;

mod api;
mod error;
mod holders;

#[launch]
fn rocket() -> Rocket<Build> {
    tracing_subscriber::fmt::init();

    rocket::build()
        .mount("/", routes![api::post_key, api::get_key, api::delete_key])
        .attach(AdHoc::on_ignite(
            "Configuration: Origin",
            |rocket: Rocket<Build>| async move {
                let external_url: String = rocket
                    .figment()
                    .extract_inner("external_url")
                    .unwrap_or_else(|_| "http://localhost:8000".to_string());
                let origin =
                    Origin::from_url(&external_url).expect("external_url must be of the form <protocol>://<host>");
                rocket.manage(OriginHolder(origin))
            },
        ))
        .attach(AdHoc::on_ignite(
            "Configuration: Key Directory",
            |rocket: Rocket<Build>| async move {
                let figment = rocket.figment();

                let purge_time_in_days: i64 = figment
                    .extract_inner("publickey.purge_time_in_days")
                    .unwrap_or(keydir_lib::DEFAULT_PURGE_TIME_IN_DAYS);
                let restrict_user_origin: bool = figment
                    .extract_inner("publickey.restrict_user_origin")
                    .unwrap_or(false);
                let restriction_regex: Option<String> = figment.extract_inner("publickey.restriction_regex").ok();
                let config = PublicKeyConfig::new(purge_time_in_days, restrict_user_origin, restriction_regex.as_deref())
                    .expect("publickey.restriction_regex must be a valid regular expression");

                let store: Arc<dyn DocStore> = match figment.extract_inner::<String>("database") {
                    Ok(path) if path != ":memory:" => {
                        info!("using SQLite document store at {}", path);
                        Arc::new(SqliteStore::open(&path).expect("Failed to open the database"))
                    }
                    _ => {
                        info!("no database configured, using the in-memory store");
                        Arc::new(MemoryStore::default())
                    }
                };

                let mailer: Arc<dyn Mailer> = match figment.extract_inner::<String>("smtp.host") {
                    Ok(host) => {
                        let user: String = figment.extract_inner("smtp.user").unwrap_or_default();
                        let pass: String = figment.extract_inner("smtp.pass").unwrap_or_default();
                        let port: u16 = figment.extract_inner("smtp.port").unwrap_or(587);
                        let from: String = figment.extract_inner("smtp.from").expect("smtp.from missing");
                        let security: String = figment
                            .extract_inner("smtp.security")
                            .unwrap_or_else(|_| "tls".to_string());
                        let security = match security.as_str() {
                            "tls" => SmtpConnectionSecurity::Tls,
                            "starttls" => SmtpConnectionSecurity::StartTls,
                            "none" => SmtpConnectionSecurity::None,
                            other => panic!(
                                "Unknown value for smtp.security: {}. Known values: tls, starttls, none.",
                                other
                            ),
                        };
                        Arc::new(
                            SmtpMailer::new(&host, &user, &pass, port, &from, &security)
                                .expect("Failed to configure the SMTP mailer"),
                        )
                    }
                    Err(_) => {
                        info!("smtp.host not configured, mail delivery disabled");
                        Arc::new(NoopMailer {})
                    }
                };

                rocket.manage(Arc::new(KeyDirectory::new(store, mailer, config)))
            },
        ))
}
