use crate::controller::PassReport;
use std::sync::Arc;
use tokio::sync::RwLock;

/// State shared between the scheduled reconciliation passes and the webserver.
#[derive(Clone, Default)]
pub struct AppState {
    last_pass: Arc<RwLock<Option<PassReport>>>,
}

impl AppState {
    pub async fn record(&self, report: PassReport) {
        *self.last_pass.write().await = Some(report);
    }

    pub async fn last_pass(&self) -> Option<PassReport> {
        self.last_pass.read().await.clone()
    }
}
