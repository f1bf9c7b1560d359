pub mod distinct;
pub mod health;
pub mod metrics;
