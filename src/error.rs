use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::Request;
use thiserror::Error;

use crate::types::ErrorResponse;

/// Errors surfaced by the HTTP layer.
///
/// Every kind maps to one status: a missing upload is a client error, a
/// failed decode or evaluation is a server error carrying the message.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No image file provided.")]
    MissingImage,
    #[error("{0}")]
    Decode(String),
    #[error("Error processing image: {0}")]
    Inference(String),
}

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::MissingImage => Status::BadRequest,
            ApiError::Decode(_) | ApiError::Inference(_) => Status::InternalServerError,
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        match status.class() {
            rocket::http::StatusClass::ClientError => log::warn!("{}", self),
            _ => log::error!("{}", self),
        }
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).respond_to(req)
    }
}
