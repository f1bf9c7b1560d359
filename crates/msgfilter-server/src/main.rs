//! Main entry point for msgfilter server.

use std::sync::Arc;
use std::time::Duration;

use msgfilter_checker::{DuplicateChecker, HostIdentity};
use msgfilter_server::{
    metrics,
    model::{AppState, Configuration},
    startup,
};
use msgfilter_store::DefaultStoreFactory;
use tracing::info;

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let configuration = Configuration::new()?;
    let _logging_guard = startup::init_logging(&configuration.logging_config())?;

    let prometheus = metrics::init_metrics()?;
    let _upkeep_handle = metrics::spawn_upkeep(prometheus.clone(), Duration::from_secs(5));

    let checker_config = configuration.checker_config();
    info!(
        endpoint = %checker_config.endpoint,
        lock_ttl = checker_config.lock_ttl,
        data_ttl = checker_config.data_ttl,
        "Creating duplicate checker"
    );
    let factory = DefaultStoreFactory::new(configuration.store_request_timeout());
    let checker = DuplicateChecker::new(checker_config, &factory, Arc::new(HostIdentity::new()))?;

    let address = configuration.listen_address();
    let port = configuration.listen_port();
    let app_state = Arc::new(AppState::new(checker, Some(prometheus)));

    info!("msgfilter server listening on {}:{}", address, port);
    startup::main_server(app_state, address, port)?.await?;

    info!("msgfilter server stopped");
    Ok(())
}
