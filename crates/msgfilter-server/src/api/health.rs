use actix_web::{HttpResponse, Responder, Scope, get, web};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
}

#[get("")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthStatus {
        status: "UP".to_string(),
    })
}

pub fn routes() -> Scope {
    web::scope("/health").service(health_check)
}
