//! HTTP server setup.

use std::sync::Arc;

use actix_web::dev::{Server, Service};
use actix_web::{App, HttpServer, middleware::Logger, web};

use crate::api::{distinct, health, metrics as metrics_api};
use crate::metrics::{Timer, record_http_request};
use crate::model::AppState;

/// Registers every route of the service on `cfg`
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(distinct::routes())
        .service(health::routes())
        .service(metrics_api::prometheus_metrics);
}

/// Creates and binds the main HTTP server.
pub fn main_server(
    app_state: Arc<AppState>,
    address: String,
    port: u16,
) -> Result<Server, std::io::Error> {
    Ok(HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap_fn(|req, srv| {
                let timer = Timer::new();
                let method = req.method().to_string();
                let path = req.match_pattern().unwrap_or_else(|| req.path().to_string());
                let response = srv.call(req);
                async move {
                    let response = response.await?;
                    record_http_request(
                        &method,
                        &path,
                        response.status().as_u16(),
                        timer.elapsed_secs(),
                    );
                    Ok(response)
                }
            })
            .app_data(web::Data::from(app_state.clone()))
            .configure(configure_routes)
    })
    .bind((address, port))?
    .run())
}
