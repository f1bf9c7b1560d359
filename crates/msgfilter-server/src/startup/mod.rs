//! Server startup: logging and the HTTP server

pub mod http;
pub mod logging;

pub use http::{configure_routes, main_server};
pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
