// Lock holder identities
// Written as the lock record value; used for diagnostics only

use chrono::Local;

/// Produces the identity string a mutex writes into its lock record
pub trait IdentityGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// `{hostname}-{pid}-{YYYYMMDD-HH:MM:SS.nnnnnnnnn}`
#[derive(Clone, Debug)]
pub struct HostIdentity {
    hostname: String,
}

impl Default for HostIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl HostIdentity {
    pub fn new() -> Self {
        let hostname = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to resolve hostname for lock identity: {}", e);
                "unknown-host".to_string()
            });
        Self { hostname }
    }

    pub fn with_hostname(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
        }
    }
}

impl IdentityGenerator for HostIdentity {
    fn generate(&self) -> String {
        format!(
            "{}-{}-{}",
            self.hostname,
            std::process::id(),
            Local::now().format("%Y%m%d-%H:%M:%S%.9f")
        )
    }
}

/// Always the same identity; handy when asserting on lock record values
#[derive(Clone, Debug)]
pub struct StaticIdentity(pub String);

impl IdentityGenerator for StaticIdentity {
    fn generate(&self) -> String {
        self.0.clone()
    }
}
