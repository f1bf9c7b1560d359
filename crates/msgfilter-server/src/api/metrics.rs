// Prometheus scrape endpoint

use actix_web::{HttpResponse, Responder, get, web};

use crate::model::AppState;

#[get("/metrics")]
pub async fn prometheus_metrics(data: web::Data<AppState>) -> impl Responder {
    match &data.prometheus {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}
