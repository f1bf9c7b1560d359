//! msgfilter Server - HTTP front end of the duplicate filter
//!
//! Wires configuration, logging and metrics around a
//! [`msgfilter_checker::DuplicateChecker`] and serves it over actix-web.

pub mod api;
pub mod metrics;
pub mod model;
pub mod startup;
