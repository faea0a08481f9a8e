//! HTTP service that counts cells in uploaded microscopy images.
//!
//! `POST /count_cells` takes a multipart `image` field, bounds the image to
//! 256 px on its longer side, segments it and answers with the number of
//! cell outlines found.

pub mod api;
pub mod app_state;
pub mod cli;
pub mod config;
pub mod counter;
pub mod error;
pub mod lifecycle;
pub mod outlines;
pub mod preprocess;
pub mod segmentation;
pub mod types;

use rocket::figment::Figment;
use rocket::{Build, Rocket};

use config::ServiceConfig;

/// Assemble the service from a figment (Rocket settings plus the `cellcount` table).
pub fn rocket_from(figment: Figment) -> Rocket<Build> {
    let limit = ServiceConfig::from_figment(&figment)
        .unwrap_or_default()
        .upload_limit_bytes();
    let figment = figment
        .merge(("limits.file", limit))
        .merge(("limits.data-form", limit));

    rocket::custom(figment)
        .attach(lifecycle::LifecycleFairing)
        .attach(app_state::fairing())
        .mount(
            "/",
            rocket::routes![
                api::health,
                api::count_cells,
                api::count_cells_without_form,
                api::shutdown,
            ],
        )
        .register("/", rocket::catchers![api::default_catcher])
}

/// Default Rocket configuration listening on `port`.
pub fn rocket_with_port(port: u16) -> Rocket<Build> {
    rocket_from(rocket::Config::figment().merge(("port", port)))
}
