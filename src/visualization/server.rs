// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Rocket server construction

use rocket::config::LogLevel;
use rocket::data::{Limits, ToByteUnit};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::figment::Figment;
use rocket::http::Header;
use rocket::{options, routes, Build, Request, Response, Rocket};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Config, VisualizationConfig};
use crate::thermal_regulation::{ControlLoopHandle, SharedControllerState, SharedTelemetryLog};

use super::api;

/// State shared by every route
pub struct ApiState {
    pub config: Arc<Config>,
    pub telemetry: SharedTelemetryLog,
    pub status: SharedControllerState,
    /// Channel to the control loop for administrative requests
    pub handle: ControlLoopHandle,
}

pub struct CORS;

#[rocket::async_trait]
impl Fairing for CORS {
    fn info(&self) -> Info {
        Info {
            name: "Add CORS headers to responses",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _request: &'r Request<'_>, response: &mut Response<'r>) {
        response.set_header(Header::new("Access-Control-Allow-Origin", "*"));
        response.set_header(Header::new(
            "Access-Control-Allow-Methods",
            "POST, GET, OPTIONS",
        ));
        response.set_header(Header::new("Access-Control-Allow-Headers", "*"));
    }
}

/// Answers to OPTIONS requests
#[options("/<_path..>")]
async fn options(_path: PathBuf) {}

/// Rocket configuration for the web server
pub fn figment(config: &VisualizationConfig) -> Figment {
    rocket::Config::figment()
        .merge(("ident", config.name.clone()))
        .merge(("limits", Limits::new().limit("json", 1.mebibytes()).limit("string", 64.kibibytes())))
        .merge(("address", config.address.clone()))
        .merge(("port", config.port))
        .merge(("log_level", LogLevel::Normal))
}

pub fn build_rocket(figment: Figment, state: ApiState) -> Rocket<Build> {
    rocket::custom(figment)
        .attach(CORS)
        .mount("/", routes![options])
        .mount(
            "/api",
            routes![
                api::get_data,
                api::get_current,
                api::get_status,
                api::get_ramp,
                api::replace_ramp_json,
                api::replace_ramp_text,
                api::reset_ramp,
                api::roll_log,
                api::list_archives,
                api::get_archive,
                api::pause,
                api::resume,
                api::sync_clock,
                api::reboot,
            ],
        )
        .manage(state)
}
