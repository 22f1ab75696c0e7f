mod run;

pub use run::*;

use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::scheduler::SubmitError;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct ErrorResponse {
    pub reason: String,
    pub code: u32,
    pub message: String,
}

fn error_response(reason: &str, code: u32, message: String) -> ErrorResponse {
    ErrorResponse {
        reason: reason.to_string(),
        code,
        message,
    }
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(error_response(
        "ERR_INVALID_ARGUMENT",
        1,
        err.to_string(),
    ));
    InternalError::from_response(err, response).into()
}

/// Maps a refused submission onto the public error codes
pub fn submit_error_response(err: &SubmitError) -> HttpResponse {
    let message = err.to_string();
    match err {
        SubmitError::UnknownLanguage(_) => {
            HttpResponse::NotFound().json(error_response("ERR_NOT_FOUND", 3, message))
        }
        SubmitError::SourceTooLarge { .. } | SubmitError::InvalidLimits(_) => {
            HttpResponse::BadRequest().json(error_response("ERR_INVALID_ARGUMENT", 1, message))
        }
        SubmitError::QueueFull => {
            HttpResponse::ServiceUnavailable().json(error_response("ERR_RATE_LIMIT", 4, message))
        }
        SubmitError::ShuttingDown | SubmitError::Canceled => {
            HttpResponse::ServiceUnavailable().json(error_response("ERR_UNAVAILABLE", 7, message))
        }
    }
}
