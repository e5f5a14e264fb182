// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Request guards of the web API

use rocket::request::{FromRequest, Outcome};
use rocket::Request;

use crate::thermal_regulation::Authorization;
use crate::visualization::server::ApiState;

/// Header carrying the administrative passphrase
pub const MAGIC_WORD_HEADER: &str = "X-Magic-Word";

/// Authorization decision for an administrative route
///
/// The guard never fails: it compares the `X-Magic-Word` header with the
/// configured passphrase and hands the decision to the control loop, which
/// rejects denied requests as unauthorized.
///
/// ```
/// use rocket::post;
/// use rust_thermal_stress::visualization::request_guard::AdminAccess;
///
/// #[post("/example")]
/// fn example_route(access: AdminAccess) -> String {
///     format!("{:?}", access.0)
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct AdminAccess(pub Authorization);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminAccess {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let presented = req.headers().get_one(MAGIC_WORD_HEADER);
        let granted = req
            .rocket()
            .state::<ApiState>()
            .map(|state| state.config.access.accepts(presented))
            .unwrap_or(false);

        Outcome::Success(AdminAccess(if granted {
            Authorization::Granted
        } else {
            Authorization::Denied
        }))
    }
}
