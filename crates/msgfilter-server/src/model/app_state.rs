// Shared state handed to every request handler

use msgfilter_checker::DuplicateChecker;
use metrics_exporter_prometheus::PrometheusHandle;

pub struct AppState {
    pub checker: DuplicateChecker,
    /// `None` when no Prometheus recorder is installed, as in handler tests
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(checker: DuplicateChecker, prometheus: Option<PrometheusHandle>) -> Self {
        Self {
            checker,
            prometheus,
        }
    }
}
