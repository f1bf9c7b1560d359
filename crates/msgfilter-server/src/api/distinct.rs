//! Duplicate check endpoint
//!
//! `POST /distinct/` with `{"payload": "..."}` answers 200 for a payload seen
//! for the first time and 409 for a repeat. Failed checks also answer 409 so
//! callers drop the message rather than process it twice.

use actix_web::{HttpResponse, Scope, error, post, web};
use tracing::{debug, warn};

use crate::model::AppState;
use crate::model::response::{DistinctRequest, DistinctResult, ErrorResult};

/// Rejects unreadable bodies with a `failure` result instead of plain text
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let response = HttpResponse::BadRequest().json(ErrorResult::failure(err.to_string()));
        error::InternalError::from_response(err, response).into()
    })
}

#[post("/")]
async fn distinct(data: web::Data<AppState>, body: web::Json<DistinctRequest>) -> HttpResponse {
    let payload = match body.into_inner().payload {
        Some(payload) if !payload.is_empty() => payload,
        _ => {
            return HttpResponse::BadRequest().json(ErrorResult::failure("payload is required"));
        }
    };

    let (duplicate, error) = data.checker.is_duplicate(&payload).await.into_parts();
    if let Some(e) = error {
        warn!(payload = %payload, error = %e, "Check failed, rejecting payload as duplicate");
    }

    if duplicate {
        debug!(payload = %payload, "Duplicate payload");
        HttpResponse::Conflict().json(DistinctResult::duplicate(payload))
    } else {
        HttpResponse::Ok().json(DistinctResult::success(payload))
    }
}

pub fn routes() -> Scope {
    web::scope("/distinct")
        .app_data(json_config())
        .service(distinct)
}
